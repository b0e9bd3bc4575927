//! Device session: one exclusively owned connection to one camera.
//!
//! Every property and register operation is silently skipped when no
//! connection is open, so parameter changes made before startup only update
//! the caller's cached state.

use tracing::{debug, info, warn};

use crate::traits::{
    CameraError, CameraInfo, DeviceDriver, FormatValidation, ImageSettings, LutChannel,
    PropertyKind, PropertyState, RawFrame, Result, StrobeSettings,
};

/// ROI flag register: bit 31 presence, bit 25 on/off.
const ROI_FLAGS_REGISTER: u32 = 0x1A70;
/// ROI base-offset register (quadlet offset of the ROI block).
const ROI_OFFSET_REGISTER: u32 = 0x1A74;
const ROI_PRESENCE_BIT: u32 = 0x8000_0000;
const ROI_ENABLE_BIT: u32 = 0x0200_0000;
const REGISTER_SPACE_BASE: u32 = 0x00F0_0000;

/// A property value in the unit convention of its kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyValue {
    /// Physical-unit value (`abs_value`).
    Absolute(f32),
    /// Device-native integer code (`value_a`).
    Integer(u32),
}

/// Rectangular region of interest in output pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    /// Left edge.
    pub left: u32,
    /// Top edge.
    pub top: u32,
    /// Width.
    pub width: u32,
    /// Height.
    pub height: u32,
}

impl Roi {
    /// The central fifth of a `width` x `height` frame.
    #[must_use]
    pub const fn centred_fifth(width: u32, height: u32) -> Self {
        Self {
            left: 2 * width / 5,
            top: 2 * height / 5,
            width: width / 5,
            height: height / 5,
        }
    }
}

/// Connection to a single camera through a [`DeviceDriver`].
pub struct CameraSession<D: DeviceDriver> {
    driver: D,
    present: bool,
    capturing: bool,
    info: Option<CameraInfo>,
}

impl<D: DeviceDriver> CameraSession<D> {
    /// Wrap a driver; no connection is opened yet.
    pub const fn new(driver: D) -> Self {
        Self {
            driver,
            present: false,
            capturing: false,
            info: None,
        }
    }

    /// Enumerate cameras and connect to the first one.
    pub fn open(&mut self) -> Result<()> {
        if self.present {
            return Ok(());
        }

        let count = self.driver.camera_count()?;
        if count == 0 {
            return Err(CameraError::NoDeviceFound);
        }

        self.driver
            .connect(0)
            .map_err(|err| CameraError::ConnectFailed(err.to_string()))?;
        self.present = true;

        match self.driver.camera_info() {
            Ok(info) => {
                info!(
                    model = %info.model,
                    sensor = %info.sensor_info,
                    resolution = %info.sensor_resolution,
                    "camera connected ({count} found)"
                );
                self.info = Some(info);
                Ok(())
            }
            Err(err) => {
                self.close();
                Err(CameraError::ConnectFailed(err.to_string()))
            }
        }
    }

    /// Stop capture, disconnect and release the handle. Never fails.
    pub fn close(&mut self) {
        if !self.present {
            return;
        }
        if self.capturing {
            if let Err(err) = self.driver.stop_capture() {
                warn!(error = %err, "stop capture failed during close");
            }
            self.capturing = false;
        }
        if let Err(err) = self.driver.disconnect() {
            warn!(error = %err, "disconnect failed during close");
        }
        self.present = false;
        self.info = None;
        debug!("camera session closed");
    }

    /// Whether a connection is open.
    pub const fn is_present(&self) -> bool {
        self.present
    }

    /// Whether continuous capture is running.
    pub const fn is_capturing(&self) -> bool {
        self.capturing
    }

    /// Identity of the connected camera.
    pub const fn info(&self) -> Option<&CameraInfo> {
        self.info.as_ref()
    }

    /// Start continuous capture. Only ever issued from the stopped state.
    pub fn start_capture(&mut self) -> Result<()> {
        if !self.present {
            return Err(CameraError::NotConnected);
        }
        if self.capturing {
            return Ok(());
        }
        self.driver.start_capture()?;
        self.capturing = true;
        debug!("capture started");
        Ok(())
    }

    /// Stop continuous capture.
    pub fn stop_capture(&mut self) -> Result<()> {
        if !self.present || !self.capturing {
            return Ok(());
        }
        self.driver.stop_capture()?;
        self.capturing = false;
        debug!("capture stopped");
        Ok(())
    }

    /// Block for the next raw frame.
    pub fn retrieve_frame(&mut self) -> Result<RawFrame> {
        if !self.present || !self.capturing {
            return Err(CameraError::FrameRetrievalFailed(
                "capture is not running".to_owned(),
            ));
        }
        self.driver
            .retrieve_frame()
            .map_err(|err| match err {
                CameraError::FrameRetrievalFailed(_) => err,
                other => CameraError::FrameRetrievalFailed(other.to_string()),
            })
    }

    /// Read a raw register, `None` without a connection.
    pub fn read_register(&mut self, address: u32) -> Result<Option<u32>> {
        if !self.present {
            return Ok(None);
        }
        self.driver
            .read_register(address)
            .map(Some)
            .map_err(|err| register_error(address, err))
    }

    /// Write a raw register.
    pub fn write_register(&mut self, address: u32, value: u32) -> Result<()> {
        if !self.present {
            return Ok(());
        }
        self.driver
            .write_register(address, value)
            .map_err(|err| register_error(address, err))
    }

    /// Full property state, `None` without a connection.
    pub fn property_state(&mut self, kind: PropertyKind) -> Result<Option<PropertyState>> {
        if !self.present {
            return Ok(None);
        }
        self.driver
            .property(kind)
            .map(Some)
            .map_err(|err| property_error(kind, err))
    }

    /// Write a full property state verbatim.
    pub fn set_property_state(&mut self, kind: PropertyKind, state: &PropertyState) -> Result<()> {
        if !self.present {
            return Ok(());
        }
        self.driver
            .set_property(kind, state)
            .map_err(|err| property_error(kind, err))
    }

    /// Read a property in its kind's unit convention.
    pub fn property(&mut self, kind: PropertyKind) -> Result<Option<PropertyValue>> {
        Ok(self.property_state(kind)?.map(|state| {
            if kind.is_absolute() {
                PropertyValue::Absolute(state.abs_value)
            } else {
                PropertyValue::Integer(state.value_a)
            }
        }))
    }

    /// Switch a property on in manual mode and write `value`.
    pub fn set_property(&mut self, kind: PropertyKind, value: PropertyValue) -> Result<()> {
        self.modify_property(kind, |state| {
            state.on_off = true;
            state.auto_manual = false;
            match value {
                PropertyValue::Absolute(abs) => {
                    state.abs_control = true;
                    state.abs_value = abs;
                }
                PropertyValue::Integer(code) => {
                    state.abs_control = false;
                    state.value_a = code;
                }
            }
        })?;
        debug!(?kind, ?value, "property written");
        Ok(())
    }

    /// Switch a property on in manual mode, keeping its value.
    pub fn set_property_on(&mut self, kind: PropertyKind) -> Result<()> {
        self.modify_property(kind, |state| {
            state.on_off = true;
            state.auto_manual = false;
        })
    }

    /// Switch a property off.
    pub fn set_property_off(&mut self, kind: PropertyKind) -> Result<()> {
        self.modify_property(kind, |state| {
            state.on_off = false;
            state.auto_manual = false;
        })
    }

    /// Read-modify-write of a property state.
    pub fn modify_property<F>(&mut self, kind: PropertyKind, edit: F) -> Result<()>
    where
        F: FnOnce(&mut PropertyState),
    {
        let Some(mut state) = self.property_state(kind)? else {
            return Ok(());
        };
        edit(&mut state);
        self.set_property_state(kind, &state)
    }

    /// Ask the device whether it would accept `settings`.
    pub fn validate_format(&mut self, settings: &ImageSettings) -> Result<FormatValidation> {
        if !self.present {
            return Err(CameraError::NotConnected);
        }
        self.driver.validate_format(settings)
    }

    /// Apply image settings. Capture must be stopped.
    pub fn set_format(&mut self, settings: &ImageSettings, packet_bytes: u32) -> Result<()> {
        if !self.present {
            return Err(CameraError::NotConnected);
        }
        if self.capturing {
            return Err(CameraError::FormatConfigurationInvalid(
                "image format cannot change while capturing".to_owned(),
            ));
        }
        self.driver.set_format(settings, packet_bytes)
    }

    /// Image settings currently applied on the device.
    pub fn format(&mut self) -> Result<ImageSettings> {
        if !self.present {
            return Err(CameraError::NotConnected);
        }
        self.driver.format()
    }

    /// Switch the LUT feature.
    pub fn enable_lut(&mut self, enabled: bool) -> Result<()> {
        if !self.present {
            return Ok(());
        }
        self.driver.enable_lut(enabled)
    }

    /// Select the active LUT bank.
    pub fn set_active_lut_bank(&mut self, bank: u32) -> Result<()> {
        if !self.present {
            return Ok(());
        }
        self.driver.set_active_lut_bank(bank)
    }

    /// Active LUT bank, `None` without a connection.
    pub fn active_lut_bank(&mut self) -> Result<Option<u32>> {
        if !self.present {
            return Ok(None);
        }
        self.driver.active_lut_bank().map(Some)
    }

    /// Upload one channel of a LUT bank.
    pub fn set_lut_channel(&mut self, bank: u32, channel: LutChannel, table: &[u16]) -> Result<()> {
        if !self.present {
            return Ok(());
        }
        self.driver.set_lut_channel(bank, channel, table)
    }

    /// Configure the strobe output.
    pub fn set_strobe(&mut self, strobe: &StrobeSettings) -> Result<()> {
        if !self.present {
            return Ok(());
        }
        debug!(?strobe, "setting strobe output");
        self.driver.set_strobe(strobe)
    }

    /// Point the auto-exposure / white-balance region at `roi`.
    ///
    /// Best-effort tuning: failures are logged and never propagated.
    pub fn write_roi(&mut self, roi: Roi) {
        if let Err(err) = self.try_write_roi(roi) {
            warn!(error = %err, "ROI register tuning skipped");
        }
    }

    fn try_write_roi(&mut self, roi: Roi) -> Result<()> {
        let Some(flags) = self.read_register(ROI_FLAGS_REGISTER)? else {
            return Ok(());
        };
        self.write_register(ROI_FLAGS_REGISTER, flags | ROI_ENABLE_BIT)?;

        let flags = self.read_register(ROI_FLAGS_REGISTER)?.unwrap_or_default();
        debug!(
            presence = flags & ROI_PRESENCE_BIT != 0,
            enabled = flags & ROI_ENABLE_BIT != 0,
            "ROI flags"
        );

        let base = self.roi_base()?;
        debug!(?roi, base = format_args!("{base:#x}"), "writing ROI");
        self.write_register(base + 0x8, pack_pair(roi.left, roi.top))?;
        self.write_register(base + 0xC, pack_pair(roi.width, roi.height))
    }

    /// Read the region currently programmed, logging it with its units.
    pub fn read_roi(&mut self) -> Result<Option<Roi>> {
        let Some(flags) = self.read_register(ROI_FLAGS_REGISTER)? else {
            return Ok(None);
        };
        debug!(
            presence = flags & ROI_PRESENCE_BIT != 0,
            enabled = flags & ROI_ENABLE_BIT != 0,
            "ROI flags"
        );
        let base = self.roi_base()?;
        let (left, top) = unpack_pair(self.read_register(base + 0x8)?.unwrap_or_default());
        let (width, height) = unpack_pair(self.read_register(base + 0xC)?.unwrap_or_default());
        let (left_unit, top_unit) = unpack_pair(self.read_register(base)?.unwrap_or_default());
        let (width_unit, height_unit) =
            unpack_pair(self.read_register(base + 0x4)?.unwrap_or_default());
        debug!(left_unit, top_unit, width_unit, height_unit, "ROI units");

        Ok(Some(Roi {
            left,
            top,
            width,
            height,
        }))
    }

    fn roi_base(&mut self) -> Result<u32> {
        let offset = self.read_register(ROI_OFFSET_REGISTER)?.unwrap_or_default();
        offset
            .checked_mul(4)
            .and_then(|bytes| bytes.checked_sub(REGISTER_SPACE_BASE))
            .ok_or_else(|| CameraError::RegisterAccessFailed {
                address: ROI_OFFSET_REGISTER,
                message: format!("ROI offset {offset:#x} outside register space"),
            })
    }

    /// Borrow the underlying driver.
    pub const fn driver(&self) -> &D {
        &self.driver
    }
}

impl<D: DeviceDriver> Drop for CameraSession<D> {
    fn drop(&mut self) {
        self.close();
    }
}

const fn pack_pair(high: u32, low: u32) -> u32 {
    ((high & 0xFFFF) << 16) | (low & 0xFFFF)
}

const fn unpack_pair(value: u32) -> (u32, u32) {
    (value >> 16, value & 0xFFFF)
}

fn register_error(address: u32, err: CameraError) -> CameraError {
    match err {
        CameraError::RegisterAccessFailed { .. } => err,
        other => CameraError::RegisterAccessFailed {
            address,
            message: other.to_string(),
        },
    }
}

fn property_error(kind: PropertyKind, err: CameraError) -> CameraError {
    match err {
        CameraError::PropertyAccessFailed { .. } => err,
        other => CameraError::PropertyAccessFailed {
            kind,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{DriverCall, MockDriver};

    #[test]
    fn test_open_without_camera() {
        let (driver, _handle) = MockDriver::builder().camera_count(0).build();
        let mut session = CameraSession::new(driver);
        let err = session.open().expect_err("open should fail");
        assert!(matches!(err, CameraError::NoDeviceFound));
        assert!(!session.is_present());
    }

    #[test]
    fn test_open_connect_failure() {
        let (driver, _handle) = MockDriver::builder().fail_connect().build();
        let mut session = CameraSession::new(driver);
        let err = session.open().expect_err("open should fail");
        assert!(matches!(err, CameraError::ConnectFailed(_)));
        assert!(!session.is_present());
    }

    #[test]
    fn test_open_reads_identity() {
        let (driver, _handle) = MockDriver::builder().build();
        let mut session = CameraSession::new(driver);
        session.open().expect("open should succeed");
        assert!(session.is_present());
        let info = session.info().expect("info should be populated");
        assert_eq!(info.sensor_resolution, "1288x964");
    }

    #[test]
    fn test_operations_skipped_without_connection() {
        let (driver, handle) = MockDriver::builder().build();
        let mut session = CameraSession::new(driver);

        session
            .set_property(PropertyKind::Gain, PropertyValue::Absolute(6.0))
            .expect("set should be skipped");
        assert_eq!(
            session.read_register(0x1A70).expect("read should be skipped"),
            None
        );
        assert_eq!(
            session
                .property(PropertyKind::Shutter)
                .expect("get should be skipped"),
            None
        );
        assert!(handle.calls().is_empty());
    }

    #[test]
    fn test_set_property_conventions() {
        let (driver, handle) = MockDriver::builder().build();
        let mut session = CameraSession::new(driver);
        session.open().expect("open should succeed");

        session
            .set_property(PropertyKind::Saturation, PropertyValue::Absolute(100.0))
            .expect("set saturation");
        session
            .set_property(PropertyKind::Sharpness, PropertyValue::Integer(819))
            .expect("set sharpness");

        let saturation = handle.property(PropertyKind::Saturation);
        assert!(saturation.on_off);
        assert!(saturation.abs_control);
        assert!((saturation.abs_value - 100.0).abs() < f32::EPSILON);

        let sharpness = handle.property(PropertyKind::Sharpness);
        assert!(sharpness.on_off);
        assert!(!sharpness.abs_control);
        assert_eq!(sharpness.value_a, 819);
    }

    #[test]
    fn test_property_failure_carries_kind() {
        let (driver, _handle) = MockDriver::builder()
            .fail_property(PropertyKind::Gamma)
            .build();
        let mut session = CameraSession::new(driver);
        session.open().expect("open should succeed");

        let err = session
            .set_property(PropertyKind::Gamma, PropertyValue::Absolute(1.5))
            .expect_err("gamma should fail");
        assert!(matches!(
            err,
            CameraError::PropertyAccessFailed {
                kind: PropertyKind::Gamma,
                ..
            }
        ));
    }

    #[test]
    fn test_write_roi_registers() {
        let (driver, handle) = MockDriver::builder().build();
        let mut session = CameraSession::new(driver);
        session.open().expect("open should succeed");

        session.write_roi(Roi::centred_fifth(1288, 964));

        let base = handle.roi_base();
        assert_eq!(handle.register(base + 0x8), (515 << 16) | 385);
        assert_eq!(handle.register(base + 0xC), (257 << 16) | 192);
        assert_ne!(handle.register(ROI_FLAGS_REGISTER) & ROI_ENABLE_BIT, 0);

        let roi = session
            .read_roi()
            .expect("read_roi should succeed")
            .expect("connected session returns a region");
        assert_eq!(roi, Roi::centred_fifth(1288, 964));
    }

    #[test]
    fn test_write_roi_failure_is_not_fatal() {
        let (driver, _handle) = MockDriver::builder().fail_registers().build();
        let mut session = CameraSession::new(driver);
        session.open().expect("open should succeed");
        session.write_roi(Roi::centred_fifth(1288, 964));
        assert!(session.is_present());
    }

    #[test]
    fn test_close_stops_capture_and_is_idempotent() {
        let (driver, handle) = MockDriver::builder().build();
        let mut session = CameraSession::new(driver);
        session.open().expect("open should succeed");
        session.start_capture().expect("start should succeed");

        session.close();
        session.close();

        assert!(!session.is_present());
        assert!(!session.is_capturing());
        let calls = handle.calls();
        let stops = calls.iter().filter(|c| **c == DriverCall::StopCapture).count();
        let disconnects = calls.iter().filter(|c| **c == DriverCall::Disconnect).count();
        assert_eq!(stops, 1);
        assert_eq!(disconnects, 1);
    }

    #[test]
    fn test_retrieve_requires_capture() {
        let (driver, _handle) = MockDriver::builder().build();
        let mut session = CameraSession::new(driver);
        session.open().expect("open should succeed");
        let err = session.retrieve_frame().expect_err("not capturing");
        assert!(matches!(err, CameraError::FrameRetrievalFailed(_)));
    }
}
