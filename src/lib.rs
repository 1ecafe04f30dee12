//! camtex: live camera frames as a GPU texture stream for a host engine.
//!
//! Frames flow `capture` → `convert` → `texture::slots` → `bridge` and the host
//! render loop pulls the newest texture once per host frame. `lifecycle`
//! orchestrates open/close and `ffi` exports the native-plugin surface.

pub mod bridge;
pub mod capture;
pub mod convert;
pub mod error;
pub mod ffi;
pub mod host;
pub mod lifecycle;
pub mod stats;
pub mod texture;
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use bridge::BridgeSurface;
pub use capture::{Frame, PixelFormat};
pub use convert::{ColorMatrix, ColorRange, ConvertedImage, FormatConverter};
pub use error::{BridgeError, Result};
pub use lifecycle::{LifecycleController, StartRequest, StreamSession, StreamState};
pub use texture::{TextureBackend, TextureHandle};

/// Global configuration that can be atomically swapped at runtime.
///
/// Controllers snapshot it when they are built, so storing a new value never
/// affects a running session.
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Plugin configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub convert: ConvertConfig,
    pub texture: TextureConfig,
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub camera: CameraSelector,
    pub resolution: Resolution,
    pub fps: u32,
    /// Preferred raw format; the driver picks its native one when unset.
    pub format: Option<PixelFormat>,
    /// Raw buffers in flight between driver and capture thread (2..=4).
    pub pool_size: usize,
    /// Pin the capture thread to this core id.
    pub pin_core: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertConfig {
    /// Overrides the orientation the driver reports, in degrees clockwise.
    pub sensor_orientation: Option<i32>,
    pub mirror: bool,
    pub color_matrix: ColorMatrix,
    pub range: ColorRange,
    /// Conversion time above this is reported as a performance warning.
    pub frame_budget_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextureConfig {
    pub slot_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Upper bound `stop()` waits for an in-flight frame callback.
    pub drain_timeout_ms: u64,
}

/// Which physical camera a session should open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraSelector {
    Back,
    Front,
    External,
    Id(String),
}

/// Requested capture size; the driver may negotiate something close to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const VGA: Self = Self {
        width: 640,
        height: 480,
    };

    pub const HD: Self = Self {
        width: 1280,
        height: 720,
    };

    pub const FULL_HD: Self = Self {
        width: 1920,
        height: 1080,
    };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            camera: CameraSelector::Back,
            resolution: Resolution::HD,
            fps: 30,
            format: None,
            pool_size: 3,
            pin_core: None,
        }
    }
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            sensor_orientation: None,
            mirror: false,
            color_matrix: ColorMatrix::Bt601,
            range: ColorRange::Limited,
            frame_budget_ms: 16, // 60fps target
        }
    }
}

impl Default for TextureConfig {
    fn default() -> Self {
        Self { slot_count: 3 }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 250,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            convert: ConvertConfig::default(),
            texture: TextureConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl Config {
    /// Layer an optional TOML file and `CAMTEX_*` environment variables over the defaults.
    ///
    /// Nested keys use a double underscore, e.g. `CAMTEX_TEXTURE__SLOT_COUNT=4`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(
                ::config::Environment::with_prefix("CAMTEX")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(BridgeError::Config(msg));

        if !(2..=4).contains(&self.capture.pool_size) {
            return invalid(format!(
                "capture.pool_size must be within 2..=4, got {}",
                self.capture.pool_size
            ));
        }
        if self.capture.fps == 0 {
            return invalid("capture.fps must be positive".into());
        }
        if self.capture.resolution.width == 0 || self.capture.resolution.height == 0 {
            return invalid("capture.resolution must be non-zero".into());
        }
        if !(texture::MIN_SLOTS..=texture::MAX_SLOTS).contains(&self.texture.slot_count) {
            return invalid(format!(
                "texture.slot_count must be within {}..={}, got {}",
                texture::MIN_SLOTS,
                texture::MAX_SLOTS,
                self.texture.slot_count
            ));
        }
        if self.convert.frame_budget_ms == 0 {
            return invalid("convert.frame_budget_ms must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_double_buffering() {
        let mut config = Config::default();
        config.texture.slot_count = 2;
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn validate_rejects_oversized_pool() {
        let mut config = Config::default();
        config.capture.pool_size = 8;
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn load_reads_toml_file() {
        let path = std::env::temp_dir().join(format!("camtex-config-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
[capture]
camera = "Front"
fps = 60
pool_size = 4

[capture.resolution]
width = 640
height = 480

[convert]
sensor_orientation = 270
mirror = true
color_matrix = "Bt709"

[texture]
slot_count = 4
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.capture.camera, CameraSelector::Front);
        assert_eq!(config.capture.resolution, Resolution::VGA);
        assert_eq!(config.capture.fps, 60);
        assert_eq!(config.convert.sensor_orientation, Some(270));
        assert!(config.convert.mirror);
        assert_eq!(config.convert.color_matrix, ColorMatrix::Bt709);
        assert_eq!(config.texture.slot_count, 4);
        // untouched sections keep their defaults
        assert_eq!(config.lifecycle, LifecycleConfig::default());
    }

    #[test]
    fn load_rejects_invalid_file_values() {
        let path =
            std::env::temp_dir().join(format!("camtex-bad-config-{}.toml", std::process::id()));
        std::fs::write(&path, "[texture]\nslot_count = 1\n").unwrap();
        let result = Config::load(Some(&path));
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }
}
