//! Error types for the slime engine.
//!
//! Three layers report failures:
//! - [`BackendError`] - raised by a [`ComputeBackend`](crate::backend::ComputeBackend)
//! - [`ConfigError`] - raised while loading or validating a [`Config`](crate::Config)
//! - [`EngineError`] - the typed signal surface the engine hands to its caller

use std::fmt;

use crate::engine::EngineState;

/// Errors reported by a compute backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    /// No compute device is reachable on this host.
    Unavailable(String),
    /// The device was invalidated after it was acquired.
    Lost(String),
    /// A kernel failed to compile.
    Compile { label: String, message: String },
    /// A buffer exceeds what the backend can allocate.
    Allocation { label: String, size: u64, limit: u64 },
    /// Buffers handed to a kernel do not match its binding layout.
    Binding(String),
    /// A dispatch could not be recorded or executed.
    Dispatch(String),
    /// Reading a buffer back to the host failed.
    Readback(String),
    /// The frame could not be presented to the target.
    Present(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Unavailable(msg) => write!(f, "No compute backend available: {}", msg),
            BackendError::Lost(msg) => write!(f, "Compute device lost: {}", msg),
            BackendError::Compile { label, message } => {
                write!(f, "Failed to compile kernel '{}': {}", label, message)
            }
            BackendError::Allocation { label, size, limit } => write!(
                f,
                "Buffer '{}' needs {} bytes but the backend allows at most {}",
                label, size, limit
            ),
            BackendError::Binding(msg) => write!(f, "Invalid kernel bindings: {}", msg),
            BackendError::Dispatch(msg) => write!(f, "Dispatch failed: {}", msg),
            BackendError::Readback(msg) => write!(f, "Failed to read buffer: {}", msg),
            BackendError::Present(msg) => write!(f, "Failed to present frame: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<wgpu::RequestDeviceError> for BackendError {
    fn from(e: wgpu::RequestDeviceError) -> Self {
        BackendError::Unavailable(e.to_string())
    }
}

impl From<wgpu::CreateSurfaceError> for BackendError {
    fn from(e: wgpu::CreateSurfaceError) -> Self {
        BackendError::Unavailable(e.to_string())
    }
}

impl From<wgpu::BufferAsyncError> for BackendError {
    fn from(e: wgpu::BufferAsyncError) -> Self {
        BackendError::Readback(e.to_string())
    }
}

/// Errors that can occur while loading a configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Color string is not `#rrggbb`.
    Color(String),
    /// Failed to parse the persisted JSON.
    Parse(serde_json::Error),
    /// Failed to read the config file from disk.
    Io(std::io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Color(s) => write!(
                f,
                "Invalid color '{}': expected #rrggbb with hexadecimal digits",
                s
            ),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Color(_) => None,
            ConfigError::Parse(e) => Some(e),
            ConfigError::Io(e) => Some(e),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

/// Errors reported by the [`Engine`](crate::Engine).
///
/// `CapabilityUnavailable`, `BackendLost` and `Backend` are terminal for the
/// instance: the engine moves to `Destroyed` and must be reconstructed.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// No compute backend was reachable at init.
    CapabilityUnavailable(String),
    /// Sizes cannot be represented by the backend; nothing was allocated.
    ConfigInvalid(String),
    /// The backend was invalidated after a successful init.
    BackendLost(String),
    /// Any other backend failure (compile, binding, dispatch, readback).
    Backend(BackendError),
    /// The engine was destroyed and can no longer be used.
    Destroyed,
    /// The operation requires a `Ready` engine.
    NotReady(EngineState),
}

impl EngineError {
    /// Whether this error ends the life of the engine instance.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineError::CapabilityUnavailable(_)
                | EngineError::BackendLost(_)
                | EngineError::Backend(_)
                | EngineError::Destroyed
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::CapabilityUnavailable(msg) => {
                write!(f, "Compute capability unavailable: {}", msg)
            }
            EngineError::ConfigInvalid(msg) => write!(f, "Invalid configuration: {}", msg),
            EngineError::BackendLost(msg) => write!(f, "Compute backend lost: {}", msg),
            EngineError::Backend(e) => write!(f, "Backend error: {}", e),
            EngineError::Destroyed => write!(f, "Engine has been destroyed"),
            EngineError::NotReady(state) => {
                write!(f, "Engine is not ready (current state: {:?})", state)
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Backend(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BackendError> for EngineError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unavailable(msg) => EngineError::CapabilityUnavailable(msg),
            BackendError::Lost(msg) => EngineError::BackendLost(msg),
            BackendError::Allocation { .. } => EngineError::ConfigInvalid(e.to_string()),
            other => EngineError::Backend(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_errors_map_to_engine_kinds() {
        let e: EngineError = BackendError::Unavailable("no adapter".into()).into();
        assert_eq!(e, EngineError::CapabilityUnavailable("no adapter".into()));

        let e: EngineError = BackendError::Lost("reset".into()).into();
        assert_eq!(e, EngineError::BackendLost("reset".into()));

        let e: EngineError = BackendError::Allocation {
            label: "field".into(),
            size: 10,
            limit: 5,
        }
        .into();
        assert!(matches!(e, EngineError::ConfigInvalid(_)));

        let e: EngineError = BackendError::Dispatch("bad".into()).into();
        assert!(matches!(e, EngineError::Backend(BackendError::Dispatch(_))));
    }

    #[test]
    fn test_terminal_errors() {
        assert!(EngineError::BackendLost("x".into()).is_terminal());
        assert!(EngineError::Destroyed.is_terminal());
        assert!(!EngineError::ConfigInvalid("x".into()).is_terminal());
        assert!(!EngineError::NotReady(EngineState::Uninitialized).is_terminal());
    }

    #[test]
    fn test_display_mentions_cause() {
        let e = EngineError::Backend(BackendError::Compile {
            label: "update_field".into(),
            message: "unknown identifier".into(),
        });
        let text = e.to_string();
        assert!(text.contains("update_field"));
        assert!(text.contains("unknown identifier"));
    }
}
