//! camsrc: a live video source for USB3 machine-vision cameras.
//!
//! The source keeps the output size fixed at the native sensor resolution
//! regardless of binning, reconstructing binned readouts back to full size,
//! and exposes exposure, gain, white balance, LUT and frame-rate control at
//! runtime. Devices sit behind the [`DeviceDriver`] trait so the whole
//! pipeline can run against a scripted mock as well as real hardware.

pub mod caps;
pub mod config;
pub mod controller;
pub mod device;
pub mod exposure;
pub mod geometry;
pub mod logger;
pub mod lut;
pub mod mock;
pub mod pump;
pub mod session;
pub mod source;
pub mod traits;
pub mod validation;
pub mod white_balance;

pub use caps::VideoCaps;
pub use config::{CameraSettings, SourceConfig};
pub use controller::ParameterController;
pub use device::V4l2Driver;
pub use geometry::{Binning, FrameGeometry, Reconstruction};
pub use lut::{LutBank, LutMode};
pub use pump::{FlowOutcome, FramePump, VideoBuffer};
pub use session::CameraSession;
pub use source::{CameraSource, Downstream, Setting};
pub use traits::{CameraError, DeviceDriver, Result};
pub use white_balance::WhiteBalanceMode;
