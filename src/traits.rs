//! Core traits and types for the camera device boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Controllable device properties addressed by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    /// Exposure time (absolute value in milliseconds).
    Shutter,
    /// Sensor master gain (absolute value in dB).
    Gain,
    /// Black level offset (integer code).
    Brightness,
    /// Colour saturation (absolute value, device range 0-400).
    Saturation,
    /// Sharpness (integer code, device range 0-4095).
    Sharpness,
    /// White balance (`value_a` red, `value_b` blue).
    WhiteBalance,
    /// Hardware gamma (absolute value).
    Gamma,
    /// Frame-rate limiter (absolute value in fps).
    FrameRate,
}

impl PropertyKind {
    /// Whether this property is written through its absolute (physical unit) value.
    #[must_use]
    pub const fn is_absolute(self) -> bool {
        matches!(
            self,
            Self::Shutter | Self::Gain | Self::Saturation | Self::Gamma | Self::FrameRate
        )
    }
}

/// Full state of one device property, as exchanged with the driver.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PropertyState {
    /// The device implements this property.
    pub present: bool,
    /// The property is switched on.
    pub on_off: bool,
    /// Continuous automatic adjustment is enabled.
    pub auto_manual: bool,
    /// One-push automatic adjustment is running.
    pub one_push: bool,
    /// `abs_value` (rather than `value_a`) controls the property.
    pub abs_control: bool,
    /// Absolute value in physical units.
    pub abs_value: f32,
    /// First integer value (red gain for white balance).
    pub value_a: u32,
    /// Second integer value (blue gain for white balance).
    pub value_b: u32,
}

/// Pixel formats the acquisition mode can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit monochrome.
    Mono8,
    /// 24-bit interleaved RGB.
    Rgb8,
}

impl PixelFormat {
    /// Bits occupied by one pixel.
    #[must_use]
    pub const fn bits_per_pixel(self) -> u32 {
        match self {
            Self::Mono8 => 8,
            Self::Rgb8 => 24,
        }
    }

    /// Bytes occupied by one pixel.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> u32 {
        (self.bits_per_pixel() + 1) / 8
    }
}

/// Configurable acquisition modes (one per binning level).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoMode {
    /// Full sensor readout.
    Mode0,
    /// 2x2 binned readout.
    Mode1,
    /// 4x4 binned readout.
    Mode5,
}

/// Region, size and pixel format of the raw acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSettings {
    /// Acquisition mode.
    pub mode: VideoMode,
    /// Horizontal offset of the region.
    pub offset_x: u32,
    /// Vertical offset of the region.
    pub offset_y: u32,
    /// Raw width in pixels.
    pub width: u32,
    /// Raw height in pixels.
    pub height: u32,
    /// Delivered pixel format.
    pub pixel_format: PixelFormat,
}

/// Result of asking the device to validate [`ImageSettings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatValidation {
    /// Whether the device accepts the settings.
    pub valid: bool,
    /// Packet size the device recommends for these settings.
    pub recommended_packet_bytes: u32,
}

/// Identity of the connected camera.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CameraInfo {
    /// Model name.
    pub model: String,
    /// Vendor name.
    pub vendor: String,
    /// Sensor description.
    pub sensor_info: String,
    /// Native sensor resolution as reported, e.g. `"1288x964"`.
    pub sensor_resolution: String,
    /// Serial number.
    pub serial_number: u32,
}

/// Colour channel addressed by a LUT upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LutChannel {
    /// Red.
    Red,
    /// Green.
    Green,
    /// Blue.
    Blue,
}

impl LutChannel {
    /// All channels in upload order.
    pub const ALL: [Self; 3] = [Self::Red, Self::Green, Self::Blue];

    /// Channel index (0 red, 1 green, 2 blue).
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Red => 0,
            Self::Green => 1,
            Self::Blue => 2,
        }
    }
}

/// Strobe (flash sync) output configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrobeSettings {
    /// GPIO pin driving the strobe.
    pub source: u32,
    /// Enable the strobe output.
    pub enabled: bool,
    /// 1 for an active-high strobe.
    pub polarity: u32,
    /// Delay after exposure start, ms.
    pub delay_ms: f32,
    /// Pulse length in ms, 0 follows the exposure time.
    pub duration_ms: f32,
}

impl Default for StrobeSettings {
    fn default() -> Self {
        Self {
            source: 1,
            enabled: true,
            polarity: 1,
            delay_ms: 0.0,
            duration_ms: 0.0,
        }
    }
}

/// A frame as delivered by the device, before geometry reconstruction.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Pixel data, `stride * height` bytes at least.
    pub data: Vec<u8>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per row.
    pub stride: u32,
    /// Pixel format of `data`.
    pub pixel_format: PixelFormat,
}

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Enumeration found no camera.
    #[error("no camera device found")]
    NoDeviceFound,
    /// Connecting to the camera failed.
    #[error("failed to connect to camera: {0}")]
    ConnectFailed(String),
    /// Reading or writing a property failed.
    #[error("failed to access {kind:?} property: {message}")]
    PropertyAccessFailed {
        /// Property addressed.
        kind: PropertyKind,
        /// Driver error description.
        message: String,
    },
    /// Reading or writing a raw register failed.
    #[error("failed to access register {address:#06x}: {message}")]
    RegisterAccessFailed {
        /// Register address.
        address: u32,
        /// Driver error description.
        message: String,
    },
    /// The device rejected, or could not derive, an image format.
    #[error("image format configuration invalid: {0}")]
    FormatConfigurationInvalid(String),
    /// Retrieving a frame failed.
    #[error("frame retrieval failed: {0}")]
    FrameRetrievalFailed(String),
    /// Caps cannot be produced by this source.
    #[error("unsupported caps: {0}")]
    UnsupportedCaps(String),
    /// Any other driver call failed.
    #[error("device call failed: {0}")]
    Device(String),
    /// The operation needs an open connection.
    #[error("camera is not connected")]
    NotConnected,
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),
    /// A produced frame failed a structural check.
    #[error("frame validation failed: {0}")]
    Validation(String),
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Synchronous, fallible capability interface over a camera SDK.
///
/// Every call maps onto one SDK call. The [`crate::session::CameraSession`]
/// owns the driver exclusively and decides which failures are fatal.
pub trait DeviceDriver: Send {
    /// Number of cameras currently attached.
    fn camera_count(&mut self) -> Result<u32>;

    /// Connect to the camera at `index` in enumeration order.
    fn connect(&mut self, index: u32) -> Result<()>;

    /// Release the connection.
    fn disconnect(&mut self) -> Result<()>;

    /// Identity of the connected camera.
    fn camera_info(&mut self) -> Result<CameraInfo>;

    /// Read the full state of a property.
    fn property(&mut self, kind: PropertyKind) -> Result<PropertyState>;

    /// Write the full state of a property.
    fn set_property(&mut self, kind: PropertyKind, state: &PropertyState) -> Result<()>;

    /// Read a 32-bit register.
    fn read_register(&mut self, address: u32) -> Result<u32>;

    /// Write a 32-bit register.
    fn write_register(&mut self, address: u32, value: u32) -> Result<()>;

    /// Check image settings without applying them.
    fn validate_format(&mut self, settings: &ImageSettings) -> Result<FormatValidation>;

    /// Apply image settings. Unsupported while capturing.
    fn set_format(&mut self, settings: &ImageSettings, packet_bytes: u32) -> Result<()>;

    /// Currently applied image settings.
    fn format(&mut self) -> Result<ImageSettings>;

    /// Switch the intensity LUT on or off.
    fn enable_lut(&mut self, enabled: bool) -> Result<()>;

    /// Select the LUT bank applied to frames.
    fn set_active_lut_bank(&mut self, bank: u32) -> Result<()>;

    /// Currently selected LUT bank.
    fn active_lut_bank(&mut self) -> Result<u32>;

    /// Upload one channel of a LUT bank.
    fn set_lut_channel(&mut self, bank: u32, channel: LutChannel, table: &[u16]) -> Result<()>;

    /// Configure the strobe output.
    fn set_strobe(&mut self, strobe: &StrobeSettings) -> Result<()>;

    /// Start continuous capture.
    fn start_capture(&mut self) -> Result<()>;

    /// Stop continuous capture.
    fn stop_capture(&mut self) -> Result<()>;

    /// Block until the next frame is available and return it.
    fn retrieve_frame(&mut self) -> Result<RawFrame>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_properties() {
        assert!(PropertyKind::Shutter.is_absolute());
        assert!(PropertyKind::Gain.is_absolute());
        assert!(PropertyKind::Saturation.is_absolute());
        assert!(PropertyKind::Gamma.is_absolute());
        assert!(PropertyKind::FrameRate.is_absolute());
        assert!(!PropertyKind::Brightness.is_absolute());
        assert!(!PropertyKind::Sharpness.is_absolute());
        assert!(!PropertyKind::WhiteBalance.is_absolute());
    }

    #[test]
    fn test_bytes_per_pixel() {
        assert_eq!(PixelFormat::Rgb8.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::Mono8.bytes_per_pixel(), 1);
    }

    #[test]
    fn test_error_display() {
        let err = CameraError::RegisterAccessFailed {
            address: 0x1A70,
            message: "timeout".to_owned(),
        };
        assert_eq!(err.to_string(), "failed to access register 0x1a70: timeout");
    }
}
