//! Error types for the frame core
//!
//! `GpuError` is what a [`GpuDevice`](crate::gpu::GpuDevice) reports. `FrameError`
//! is what the frame loop reports to the application. Every `FrameError` except
//! `Registry`, `Config` and `ObjectCapacityExceeded` is fatal: the caller is
//! expected to log it and terminate.

use std::path::PathBuf;
use std::time::Duration;

use ash::vk;
use thiserror::Error;

/// Errors reported by a device backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// Raw Vulkan result code from the driver
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// A bounded wait ran out before the GPU signalled
    #[error("GPU wait timed out")]
    Timeout,

    /// A SPIR-V module could not be read or was malformed
    #[error("Failed to load shader module {path:?}: {reason}")]
    ShaderLoad {
        /// File the module was read from
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Handle does not refer to a live resource
    #[error("Unknown or already destroyed GPU resource")]
    UnknownResource,

    /// Handle refers to a resource of a different kind
    #[error("GPU resource kind mismatch: expected {expected}")]
    ResourceKindMismatch {
        /// The kind the operation required
        expected: &'static str,
    },

    /// Operation is not valid in the current device state
    #[error("Invalid GPU operation: {0}")]
    InvalidOperation(String),
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        if result == vk::Result::TIMEOUT {
            Self::Timeout
        } else {
            Self::Api(result)
        }
    }
}

/// Result type for device operations
pub type GpuResult<T> = Result<T, GpuError>;

/// Kind of entry held by the resource registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Pipeline + layout record
    Material,
    /// Vertex buffer record
    Geometry,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Material => f.write_str("material"),
            Self::Geometry => f.write_str("geometry"),
        }
    }
}

/// Errors reported by the resource registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A name was registered twice
    #[error("A {kind} named '{name}' is already registered")]
    DuplicateName {
        /// Which table rejected the name
        kind: EntryKind,
        /// The rejected name
        name: String,
    },
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML syntax or schema error
    #[error("Invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    /// RON syntax or schema error
    #[error("Invalid RON config: {0}")]
    Ron(#[from] ron::error::SpannedError),

    /// Value out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors reported by the frame loop
#[derive(Error, Debug)]
pub enum FrameError {
    /// External API failure during a frame or during setup
    #[error("GPU operation '{operation}' failed: {source}")]
    Gpu {
        /// What the core was doing
        operation: &'static str,
        /// Backend error
        #[source]
        source: GpuError,
    },

    /// Fence or image acquisition wait exceeded its bound
    #[error("Timed out after {timeout:?} waiting for {what}")]
    Timeout {
        /// What was being waited on
        what: &'static str,
        /// The configured bound
        timeout: Duration,
    },

    /// Initialization could not complete
    #[error("Setup failed: {0}")]
    Setup(String),

    /// Frame loop used before `init` or after `cleanup`
    #[error("Frame orchestrator is not initialized")]
    NotInitialized,

    /// A previous frame failed fatally
    #[error("Frame orchestrator aborted after a fatal error")]
    Aborted,

    /// Draw list larger than the per-slot object buffer
    #[error("Object capacity exceeded: {requested} > {capacity}")]
    ObjectCapacityExceeded {
        /// Objects requested
        requested: usize,
        /// Slot capacity
        capacity: usize,
    },

    /// Resource registry rejected an insert
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Bad configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A deferred teardown action failed
    #[error("Teardown action #{index} failed: {source}")]
    Teardown {
        /// Registration index of the failed action
        index: usize,
        /// Backend error
        #[source]
        source: GpuError,
    },
}

impl FrameError {
    /// Wrap a device error, turning timeouts into `FrameError::Timeout`
    pub fn gpu(operation: &'static str, timeout: Duration) -> impl FnOnce(GpuError) -> Self {
        move |source| match source {
            GpuError::Timeout => Self::Timeout { what: operation, timeout },
            source => Self::Gpu { operation, source },
        }
    }

    /// Wrap a device error from an operation that has no bounded wait
    pub fn op(operation: &'static str) -> impl FnOnce(GpuError) -> Self {
        move |source| Self::Gpu { operation, source }
    }

    /// Whether this error leaves the GPU state untrustworthy
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Registry(_) | Self::Config(_) | Self::ObjectCapacityExceeded { .. }
        )
    }
}

/// Result type for frame loop operations
pub type FrameResult<T> = Result<T, FrameError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_timeout_maps_to_timeout() {
        assert_eq!(GpuError::from(vk::Result::TIMEOUT), GpuError::Timeout);
        assert_eq!(
            GpuError::from(vk::Result::ERROR_DEVICE_LOST),
            GpuError::Api(vk::Result::ERROR_DEVICE_LOST)
        );
    }

    #[test]
    fn test_timeout_becomes_frame_timeout() {
        let err = FrameError::gpu("render fence", Duration::from_secs(1))(GpuError::Timeout);
        assert!(matches!(err, FrameError::Timeout { what: "render fence", .. }));

        let err = FrameError::gpu("submit", Duration::from_secs(1))(GpuError::Api(vk::Result::ERROR_DEVICE_LOST));
        assert!(matches!(err, FrameError::Gpu { operation: "submit", .. }));
    }

    #[test]
    fn test_fatality() {
        let lookup = FrameError::Registry(RegistryError::DuplicateName {
            kind: EntryKind::Material,
            name: "m".to_string(),
        });
        assert!(!lookup.is_fatal());
        assert!(FrameError::Aborted.is_fatal());
    }
}
