//! Simulation parameters.
//!
//! A [`Config`] is the single value the outside world hands to the engine.
//! Two groups of fields behave differently:
//!
//! - **Allocation fields** (`n_agents`, `size`) size the agent and field
//!   stores. Changing them requires the engine to reallocate.
//! - **Live fields** (everything else) are re-read on every update and
//!   render without touching any buffer.
//!
//! Out-of-range values are clamped by [`Config::sanitized`] rather than
//! rejected, so a bad slider value degrades the pattern instead of
//! crashing the run.
//!
//! # Example
//!
//! ```ignore
//! let config = Config::default()
//!     .with_agents(250_000)
//!     .with_size(800, 600)
//!     .with_decay(0.9)
//!     .with_color(Color::from_hex("#FF8800")?);
//! ```

use std::f32::consts::PI;
use std::path::Path;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// RGB color with channels in `0.0..=1.0`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Color(pub [f32; 3]);

impl Color {
    pub const fn new(r: f32, g: f32, b: f32) -> Self {
        Self([r, g, b])
    }

    /// Parse a `#rrggbb` string.
    pub fn from_hex(hex: &str) -> Result<Self, ConfigError> {
        let digits = hex
            .strip_prefix('#')
            .filter(|d| d.len() == 6 && d.is_ascii())
            .ok_or_else(|| ConfigError::Color(hex.to_string()))?;

        let mut rgb = [0.0f32; 3];
        for (i, channel) in rgb.iter_mut().enumerate() {
            let byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
                .map_err(|_| ConfigError::Color(hex.to_string()))?;
            *channel = byte as f32 / 255.0;
        }
        Ok(Self(rgb))
    }

    /// Format as `#RRGGBB`.
    pub fn to_hex(&self) -> String {
        let [r, g, b] = self.to_rgb8();
        format!("#{:02X}{:02X}{:02X}", r, g, b)
    }

    pub fn to_rgb8(&self) -> [u8; 3] {
        self.0.map(crate::layout::unit_to_u8)
    }

    pub fn to_vec3(&self) -> Vec3 {
        Vec3::from_array(self.0)
    }

    fn clamped(self) -> Self {
        Self(self.0.map(|c| if c.is_finite() { c.clamp(0.0, 1.0) } else { 0.0 }))
    }
}

/// How field values are mapped to pixel intensity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToneMap {
    /// `clamp(v * exposure, 0, 1)`
    #[default]
    Linear,
    /// `v * exposure / (1 + v * exposure)`
    Reinhard,
}

impl ToneMap {
    /// Id used in the uniform block.
    pub fn gpu_id(self) -> u32 {
        match self {
            ToneMap::Linear => 0,
            ToneMap::Reinhard => 1,
        }
    }
}

/// Per-run simulation parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Number of agents. Requires reallocation.
    pub n_agents: u32,
    /// Field size in cells `(width, height)`. Requires reallocation.
    pub size: (u32, u32),
    /// Angle between the forward sensor and each side sensor (radians).
    pub sensory_angle: f32,
    /// Distance from the agent to its sensors (cells).
    pub sensory_offset: f32,
    /// Per-step multiplier applied to the field (0..=1).
    pub decay: f32,
    /// Maximum heading change per step (radians).
    pub turn_rate: f32,
    /// Trail amount an agent adds to its cell each step.
    pub deposition: f32,
    /// Distance an agent moves per step (cells).
    pub step_size: f32,
    /// Weight of the 3x3 neighbourhood mean in the field pass (0 = none).
    pub diffusion: f32,
    /// Trail tint.
    pub color: Color,
    pub tone_map: ToneMap,
    /// Scale applied to field values before tone mapping.
    pub exposure: f32,
}

/// Lower and upper bounds for the numeric fields of [`Config`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    pub n_agents: u32,
    pub size: (u32, u32),
    pub sensory_angle: f32,
    pub sensory_offset: f32,
    pub decay: f32,
    pub turn_rate: f32,
    pub deposition: f32,
    pub step_size: f32,
    pub diffusion: f32,
    pub exposure: f32,
}

impl Config {
    pub const MINS: Bounds = Bounds {
        n_agents: 1000,
        size: (16, 16),
        sensory_angle: PI / 8.0,
        sensory_offset: 1.0,
        decay: 0.01,
        turn_rate: PI / 8.0,
        deposition: 0.01,
        step_size: 0.1,
        diffusion: 0.0,
        exposure: 0.01,
    };

    pub const MAXS: Bounds = Bounds {
        n_agents: 1_000_000,
        size: (4000, 4000),
        sensory_angle: PI / 2.0,
        sensory_offset: 50.0,
        decay: 1.0,
        turn_rate: PI / 2.0,
        deposition: 1.0,
        step_size: 5.0,
        diffusion: 1.0,
        exposure: 100.0,
    };

    /// Smallest size offered by interactive front ends.
    pub const RECOMMENDED_MIN_SIZE: (u32, u32) = (400, 400);

    pub fn with_agents(mut self, n_agents: u32) -> Self {
        self.n_agents = n_agents;
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.size = (width, height);
        self
    }

    pub fn with_sensory_angle(mut self, radians: f32) -> Self {
        self.sensory_angle = radians;
        self
    }

    pub fn with_sensory_offset(mut self, offset: f32) -> Self {
        self.sensory_offset = offset;
        self
    }

    pub fn with_decay(mut self, decay: f32) -> Self {
        self.decay = decay;
        self
    }

    pub fn with_turn_rate(mut self, radians: f32) -> Self {
        self.turn_rate = radians;
        self
    }

    pub fn with_deposition(mut self, deposition: f32) -> Self {
        self.deposition = deposition;
        self
    }

    pub fn with_step_size(mut self, step: f32) -> Self {
        self.step_size = step;
        self
    }

    pub fn with_diffusion(mut self, diffusion: f32) -> Self {
        self.diffusion = diffusion;
        self
    }

    pub fn with_color(mut self, color: Color) -> Self {
        self.color = color;
        self
    }

    pub fn with_tone_map(mut self, tone_map: ToneMap, exposure: f32) -> Self {
        self.tone_map = tone_map;
        self.exposure = exposure;
        self
    }

    pub fn width(&self) -> u32 {
        self.size.0
    }

    pub fn height(&self) -> u32 {
        self.size.1
    }

    /// Number of field cells (`width * height`), `None` on overflow.
    pub fn cell_count(&self) -> Option<u32> {
        self.size.0.checked_mul(self.size.1)
    }

    /// Whether moving from `self` to `other` invalidates the stores.
    pub fn requires_reallocation(&self, other: &Config) -> bool {
        self.n_agents != other.n_agents || self.size != other.size
    }

    /// Copy of this config with every numeric field forced into bounds.
    ///
    /// Non-finite values fall back to the default. Each adjustment is logged.
    pub fn sanitized(&self) -> Config {
        let (min, max, def) = (&Self::MINS, &Self::MAXS, Config::default());

        Config {
            n_agents: clamp_u32("nAgents", self.n_agents, min.n_agents, max.n_agents),
            size: (
                clamp_u32("width", self.size.0, min.size.0, max.size.0),
                clamp_u32("height", self.size.1, min.size.1, max.size.1),
            ),
            sensory_angle: clamp_f32(
                "sensoryAngle",
                self.sensory_angle,
                min.sensory_angle,
                max.sensory_angle,
                def.sensory_angle,
            ),
            sensory_offset: clamp_f32(
                "sensoryOffset",
                self.sensory_offset,
                min.sensory_offset,
                max.sensory_offset,
                def.sensory_offset,
            ),
            decay: clamp_f32("decay", self.decay, min.decay, max.decay, def.decay),
            turn_rate: clamp_f32(
                "turnRate",
                self.turn_rate,
                min.turn_rate,
                max.turn_rate,
                def.turn_rate,
            ),
            deposition: clamp_f32(
                "deposition",
                self.deposition,
                min.deposition,
                max.deposition,
                def.deposition,
            ),
            step_size: clamp_f32(
                "stepSize",
                self.step_size,
                min.step_size,
                max.step_size,
                def.step_size,
            ),
            diffusion: clamp_f32(
                "diffusion",
                self.diffusion,
                min.diffusion,
                max.diffusion,
                def.diffusion,
            ),
            color: self.color.clamped(),
            tone_map: self.tone_map,
            exposure: clamp_f32(
                "exposure",
                self.exposure,
                min.exposure,
                max.exposure,
                def.exposure,
            ),
        }
    }

    /// Parse a persisted JSON blob. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Config, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            n_agents: 100_000,
            size: (400, 400),
            sensory_angle: PI / 4.0,
            sensory_offset: 5.0,
            decay: 0.7,
            turn_rate: PI / 8.0,
            deposition: 1.0,
            step_size: 1.0,
            diffusion: 1.0,
            // #0C3B82
            color: Color::new(12.0 / 255.0, 59.0 / 255.0, 130.0 / 255.0),
            tone_map: ToneMap::Linear,
            exposure: 1.0,
        }
    }
}

fn clamp_u32(name: &str, value: u32, min: u32, max: u32) -> u32 {
    let clamped = value.clamp(min, max);
    if clamped != value {
        log::warn!("{} = {} out of range [{}, {}], using {}", name, value, min, max, clamped);
    }
    clamped
}

fn clamp_f32(name: &str, value: f32, min: f32, max: f32, default: f32) -> f32 {
    if !value.is_finite() {
        log::warn!("{} is not finite, using default {}", name, default);
        return default;
    }
    let clamped = value.clamp(min, max);
    if clamped != value {
        log::warn!("{} = {} out of range [{}, {}], using {}", name, value, min, max, clamped);
    }
    clamped
}
