//! # Slime - Physarum simulation engine
//!
//! A population of agents wanders over a 2D trail field. Each agent senses
//! the field ahead of its heading, turns toward the strongest trail, steps
//! forward and deposits more trail. The field diffuses and decays every
//! frame, and filament networks emerge from nothing but that feedback loop.
//!
//! ## Quick Start
//!
//! ```ignore
//! use slime::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default()
//!         .with_agents(200_000)
//!         .with_size(800, 600)
//!         .with_color(Color::from_hex("#f2a541")?);
//!
//!     let mut engine = Engine::new(WgpuBackend::headless()?, config).with_seed(42);
//!     engine.init()?;
//!     for _ in 0..500 {
//!         engine.update()?;
//!     }
//!
//!     let mut frame = FrameTarget::Image(image::RgbaImage::new(1, 1));
//!     engine.render(&mut frame)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Frame Structure
//!
//! ```text
//! init:   init_agents ─▶ clear_field(B)                 current = B
//! update: update_field(current ─▶ next) ─▶ swap ─▶ update_agents ─▶ deposit_trail
//! render: render_field(current) ─▶ present
//! ```
//!
//! The field lives in two generations. Only the [`Engine`] decides which one
//! is current, and every pass is handed explicit read and write buffers, so
//! no kernel ever reads and writes the same generation.
//!
//! ## Backends
//!
//! The engine talks to a [`ComputeBackend`](backend::ComputeBackend):
//!
//! - [`WgpuBackend`](gpu::WgpuBackend) runs the WGSL kernels on a GPU,
//!   headless or presenting to a window
//! - [`CpuBackend`](backend::CpuBackend) runs the same passes on a rayon pool
//!   and is what the test suite uses
//!
//! ## Configuration
//!
//! [`Config`] carries every tunable with documented bounds. Out-of-range
//! values are clamped (and logged) rather than rejected. Agent count and
//! field size fix the store sizes; everything else is read live each frame.

extern crate self as slime;

pub mod agent;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod field;
pub mod gpu;
pub mod kernels;
pub mod layout;
pub mod params;
pub mod time;
pub mod window;

pub use bytemuck;
pub use config::{Color, Config, ToneMap};
pub use engine::{ConfigChange, Engine, EngineState, FrameStats, TickOutcome};
pub use error::{BackendError, ConfigError, EngineError};
pub use glam::Vec2;
pub use slime_derive::GpuStruct;

/// A `#[repr(C)]` Pod struct shared with WGSL kernels.
///
/// Implemented by `#[derive(GpuStruct)]`, which also checks at compile time
/// that the WGSL layout matches the Rust one.
pub trait GpuStruct: bytemuck::Pod {
    /// WGSL type name (the Rust struct name).
    const WGSL_NAME: &'static str;
    /// Complete `struct Name { ... };` definition.
    const WGSL_STRUCT: &'static str;
    /// Size in bytes, equal to `size_of::<Self>()`.
    const WGSL_SIZE: usize;
}

/// Convenience re-exports.
pub mod prelude {
    pub use crate::agent::Agent;
    pub use crate::backend::{ComputeBackend, CpuBackend};
    pub use crate::config::{Color, Config, ToneMap};
    pub use crate::engine::{ConfigChange, Engine, EngineState, TickOutcome};
    pub use crate::error::{BackendError, EngineError};
    pub use crate::gpu::{FrameTarget, WgpuBackend};
    pub use crate::time::Clock;
    pub use crate::GpuStruct;
}
