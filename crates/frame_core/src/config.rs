//! # Engine Configuration
//!
//! A small fixed struct set once at construction. It can be built in code with
//! the `with_*` setters or loaded from a TOML (`.toml`) or RON (`.ron`) file.
//!
//! ```toml
//! application_name = "viewer"
//! frame_slots = 2
//! max_objects = 10000
//! fence_timeout_ms = 1000
//!
//! [window_extent]
//! width = 1700
//! height = 900
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Upper bound on overlapping frames
pub const MAX_FRAME_SLOTS: usize = 8;

/// Upper bound on per-slot object array entries
pub const MAX_OBJECTS: usize = 1 << 20;

/// Window / swapchain extent in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Extent {
    /// Create an extent
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Width over height, 1.0 for a degenerate extent
    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

impl Default for Extent {
    fn default() -> Self {
        Self::new(1700, 900)
    }
}

/// Frame core configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Application name for Vulkan instance creation and the window title
    pub application_name: String,
    /// Requested window extent
    pub window_extent: Extent,
    /// Number of overlapping in-flight frames
    pub frame_slots: usize,
    /// Capacity of each slot's per-object data array
    pub max_objects: usize,
    /// Bound on fence and image-acquire waits, in milliseconds
    pub fence_timeout_ms: u64,
    /// Whether to enable Vulkan validation layers (`None` = debug builds only)
    pub enable_validation: Option<bool>,
    /// Frames per cycle of the clear color flash
    pub clear_color_period: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            application_name: "Frame Core Viewer".to_string(),
            window_extent: Extent::default(),
            frame_slots: 2,
            max_objects: 10_000,
            fence_timeout_ms: 1_000,
            enable_validation: None,
            clear_color_period: 120,
        }
    }
}

impl EngineConfig {
    /// Create a default configuration with the given application name
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            ..Self::default()
        }
    }

    /// Set the window extent
    pub fn with_window_extent(mut self, width: u32, height: u32) -> Self {
        self.window_extent = Extent::new(width, height);
        self
    }

    /// Set the number of frame slots
    pub fn with_frame_slots(mut self, slots: usize) -> Self {
        self.frame_slots = slots;
        self
    }

    /// Set per-slot object capacity
    pub fn with_max_objects(mut self, max_objects: usize) -> Self {
        self.max_objects = max_objects;
        self
    }

    /// Set the fence/acquire timeout
    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Bound on fence and image-acquire waits
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    /// Whether validation layers should be requested
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_slots == 0 || self.frame_slots > MAX_FRAME_SLOTS {
            return Err(ConfigError::Invalid(format!(
                "frame_slots must be in 1..={MAX_FRAME_SLOTS}, got {}",
                self.frame_slots
            )));
        }
        if self.max_objects == 0 || self.max_objects > MAX_OBJECTS {
            return Err(ConfigError::Invalid(format!(
                "max_objects must be in 1..={MAX_OBJECTS}, got {}",
                self.max_objects
            )));
        }
        if self.fence_timeout_ms == 0 {
            return Err(ConfigError::Invalid("fence_timeout_ms must be non-zero".to_string()));
        }
        if self.window_extent.width == 0 || self.window_extent.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "window extent must be non-zero, got {}x{}",
                self.window_extent.width, self.window_extent.height
            )));
        }
        if self.clear_color_period == 0 {
            return Err(ConfigError::Invalid("clear_color_period must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a RON document
    pub fn from_ron_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.ron` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("ron") => Self::from_ron_str(&source),
            Some("toml") => Self::from_toml_str(&source),
            other => Err(ConfigError::Invalid(format!(
                "unsupported config extension {other:?} for {}",
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frame_slots, 2);
        assert_eq!(config.fence_timeout(), Duration::from_secs(1));
        assert_eq!(config.window_extent, Extent::new(1700, 900));
    }

    #[test]
    fn test_toml_partial_override() {
        let config = EngineConfig::from_toml_str(
            r#"
            frame_slots = 3
            fence_timeout_ms = 250

            [window_extent]
            width = 800
            height = 600
            "#,
        )
        .unwrap();
        assert_eq!(config.frame_slots, 3);
        assert_eq!(config.fence_timeout(), Duration::from_millis(250));
        assert_eq!(config.window_extent, Extent::new(800, 600));
        assert_eq!(config.max_objects, 10_000);
    }

    #[test]
    fn test_ron_config() {
        let config = EngineConfig::from_ron_str("(max_objects: 64, clear_color_period: 60)").unwrap();
        assert_eq!(config.max_objects, 64);
        assert_eq!(config.clear_color_period, 60);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        assert!(EngineConfig::default().with_frame_slots(0).validate().is_err());
        assert!(EngineConfig::default().with_frame_slots(9).validate().is_err());
        assert!(EngineConfig::default().with_max_objects(0).validate().is_err());
        assert!(EngineConfig::default().with_max_objects(MAX_OBJECTS).validate().is_ok());
        assert!(EngineConfig::default().with_max_objects(MAX_OBJECTS + 1).validate().is_err());
        assert!(EngineConfig::default().with_max_objects(1 << 59).validate().is_err());
        assert!(EngineConfig::default().with_fence_timeout(Duration::ZERO).validate().is_err());
        assert!(EngineConfig::from_toml_str("frame_slots = 0").is_err());
    }

    #[test]
    fn test_aspect_ratio() {
        assert_eq!(Extent::new(1600, 800).aspect_ratio(), 2.0);
        assert_eq!(Extent::new(10, 0).aspect_ratio(), 1.0);
    }
}
