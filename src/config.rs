//! Source configuration: compiled-in defaults, value ranges and TOML loading.

use std::fmt::Display;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::geometry::{Binning, Reconstruction};
use crate::lut::{LutBank, LutMode};
use crate::traits::{CameraError, Result, StrobeSettings};
use crate::white_balance::WhiteBalanceMode;

/// Accepted exposure range, ms.
pub const EXPOSURE_RANGE_MS: (f64, f64) = (0.01, 31_900.0);
/// Accepted linear gain range.
pub const GAIN_RANGE: (u32, u32) = (1, 16);
/// Accepted black level range.
pub const BLACK_LEVEL_RANGE: (u32, u32) = (0, 31);
/// Accepted white-balance gain range.
pub const WB_GAIN_RANGE: (u32, u32) = (0, 1023);
/// Accepted saturation range.
pub const SATURATION_RANGE: (u32, u32) = (0, 100);
/// Accepted sharpness range.
pub const SHARPNESS_RANGE: (u32, u32) = (0, 10);
/// Accepted frame-rate ceiling range, fps.
pub const MAX_FRAMERATE_RANGE: (f64, f64) = (10.0, 200.0);
/// Accepted LUT input offset range.
pub const LUT_OFFSET_RANGE: (u16, u16) = (0, 511);
/// Accepted LUT gamma range.
pub const LUT_GAMMA_RANGE: (f64, f64) = (0.0, 4.0);
/// Accepted LUT gain range.
pub const LUT_GAIN_RANGE: (f64, f64) = (0.0, 1000.0);

/// Clamp `value` into `range`, warning when it had to be moved.
pub fn clamp_setting<T>(name: &str, value: T, range: (T, T)) -> T
where
    T: PartialOrd + Copy + Display,
{
    let (min, max) = range;
    let clamped = if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    };
    if clamped != value {
        warn!(setting = name, %value, %clamped, "value out of range, clamped");
    }
    clamped
}

/// Every runtime-mutable camera parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Exposure time, ms.
    pub exposure_ms: f64,
    /// Linear gain factor.
    pub gain: u32,
    /// Black level (brightness) code.
    pub black_level: u32,
    /// Manual white-balance red gain.
    pub red_gain: u32,
    /// Manual white-balance blue gain.
    pub blue_gain: u32,
    /// Sensor binning.
    pub binning: Binning,
    /// Colour saturation, 0-100.
    pub saturation: u32,
    /// Sharpness, 0-10.
    pub sharpness: u32,
    /// White-balance mode.
    pub white_balance: WhiteBalanceMode,
    /// Intensity mapping mode.
    pub lut: LutMode,
    /// Scalar gamma written in [`LutMode::Gamma`].
    pub gamma: f32,
    /// Frame-rate ceiling, fps.
    pub max_framerate_fps: f64,
    /// Parameters of LUT bank 0.
    pub lut1: LutBank,
    /// Parameters of LUT bank 1.
    pub lut2: LutBank,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            exposure_ms: 40.0,
            gain: 1,
            black_level: 15,
            red_gain: 425,
            blue_gain: 727,
            binning: Binning::One,
            saturation: 25,
            sharpness: 2,
            white_balance: WhiteBalanceMode::Manual,
            lut: LutMode::Lut1,
            gamma: 1.5,
            max_framerate_fps: 25.0,
            lut1: LutBank::bank1_default(),
            lut2: LutBank::bank2_default(),
        }
    }
}

impl CameraSettings {
    /// Copy with every value pulled into its accepted range.
    #[must_use]
    pub fn clamped(&self) -> Self {
        Self {
            exposure_ms: clamp_setting("exposure", self.exposure_ms, EXPOSURE_RANGE_MS),
            gain: clamp_setting("gain", self.gain, GAIN_RANGE),
            black_level: clamp_setting("blacklevel", self.black_level, BLACK_LEVEL_RANGE),
            red_gain: clamp_setting("rgain", self.red_gain, WB_GAIN_RANGE),
            blue_gain: clamp_setting("bgain", self.blue_gain, WB_GAIN_RANGE),
            saturation: clamp_setting("saturation", self.saturation, SATURATION_RANGE),
            sharpness: clamp_setting("sharpness", self.sharpness, SHARPNESS_RANGE),
            max_framerate_fps: clamp_setting(
                "maxframerate",
                self.max_framerate_fps,
                MAX_FRAMERATE_RANGE,
            ),
            lut1: clamp_bank("lut1", &self.lut1),
            lut2: clamp_bank("lut2", &self.lut2),
            ..self.clone()
        }
    }
}

fn clamp_bank(name: &str, bank: &LutBank) -> LutBank {
    let mut offsets = bank.offsets;
    for offset in &mut offsets {
        *offset = clamp_setting(name, *offset, LUT_OFFSET_RANGE);
    }
    LutBank {
        offsets,
        gamma: clamp_setting(name, bank.gamma, LUT_GAMMA_RANGE),
        gain: clamp_setting(name, bank.gain, LUT_GAIN_RANGE),
        ..*bank
    }
}

/// Configuration of one camera source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Initial camera parameters.
    pub camera: CameraSettings,
    /// Frames to produce before end-of-stream; unlimited when absent.
    pub num_buffers: Option<u64>,
    /// The host stamps buffers itself; PTS/DTS are left unset.
    pub do_timestamp: bool,
    /// How binned frames are expanded.
    pub reconstruction: Reconstruction,
    /// Paint pending diagnostic markers into frames.
    pub overlay_markers: bool,
    /// Strobe output programmed at startup.
    pub strobe: StrobeSettings,
    /// Point auto-exposure / white balance at the frame centre at startup.
    pub tune_roi: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            camera: CameraSettings::default(),
            num_buffers: None,
            do_timestamp: false,
            reconstruction: Reconstruction::Duplicate,
            overlay_markers: false,
            strobe: StrobeSettings::default(),
            tune_roi: true,
        }
    }
}

impl SourceConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut config: Self =
            toml::from_str(text).map_err(|err| CameraError::Config(err.to_string()))?;
        config.camera = config.camera.clamped();
        Ok(config)
    }

    /// Load a TOML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)
            .map_err(|err| CameraError::Config(format!("{}: {err}", path.display())))?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Serialise back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| CameraError::Config(err.to_string()))
    }
}
