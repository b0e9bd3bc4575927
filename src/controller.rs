//! Parameter controller: the camera's logical configuration, unit
//! conversions, and the protocols that push it to the device.

use tracing::{debug, info, warn};

use crate::config::CameraSettings;
use crate::exposure::ExposureState;
use crate::geometry::{raw_mode, Binning, FrameGeometry, RawMode};
use crate::lut::{LutBank, LutMode};
use crate::session::{CameraSession, PropertyValue, Roi};
use crate::traits::{
    CameraError, DeviceDriver, ImageSettings, LutChannel, PixelFormat, PropertyKind, Result,
    StrobeSettings,
};
use crate::white_balance::{WhiteBalance, WhiteBalanceMode};

const SATURATION_SCALE: f32 = 4.0;
const SHARPNESS_DEVICE_MAX: u32 = 4095;
const SHARPNESS_CONTROL_MAX: u32 = 10;

/// A parameter change worth flagging on the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Exposure was written.
    ExposureChanged,
    /// Gain was written.
    GainChanged,
    /// Binning was reconfigured.
    BinningChanged,
}

impl Marker {
    /// All markers in overlay order.
    pub const ALL: [Self; 3] = [Self::ExposureChanged, Self::GainChanged, Self::BinningChanged];

    const fn bit(self) -> u8 {
        match self {
            Self::ExposureChanged => 1,
            Self::GainChanged => 2,
            Self::BinningChanged => 4,
        }
    }
}

/// Set of markers raised since the last frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingMarkers(u8);

impl PendingMarkers {
    /// Raise a marker.
    pub fn insert(&mut self, marker: Marker) {
        self.0 |= marker.bit();
    }

    /// Whether `marker` is raised.
    #[must_use]
    pub const fn contains(self, marker: Marker) -> bool {
        self.0 & marker.bit() != 0
    }

    /// Whether no marker is raised.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Return the raised markers and clear them.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Raised markers in overlay order.
    pub fn iter(self) -> impl Iterator<Item = Marker> {
        Marker::ALL.into_iter().filter(move |m| self.contains(*m))
    }
}

/// Gain factor to device decibels.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn gain_to_db(gain: u32) -> f32 {
    (20.0 * f64::from(gain.max(1)).log10()) as f32
}

/// Device decibels to the nearest gain factor.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn db_to_gain(db: f32) -> u32 {
    10f64.powf(f64::from(db) / 20.0).round().max(0.0) as u32
}

/// Control saturation (0-100) to the device's absolute range (0-400).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn saturation_to_device(saturation: u32) -> f32 {
    saturation as f32 * SATURATION_SCALE
}

/// Device saturation to the control range, truncating.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn saturation_from_device(value: f32) -> u32 {
    (value / SATURATION_SCALE).max(0.0) as u32
}

/// Control sharpness (0-10) to the device code (0-4095), rounding down.
#[must_use]
pub const fn sharpness_to_device(sharpness: u32) -> u32 {
    sharpness * SHARPNESS_DEVICE_MAX / SHARPNESS_CONTROL_MAX
}

/// Device sharpness code to the nearest control value.
#[must_use]
pub const fn sharpness_from_device(code: u32) -> u32 {
    (code * SHARPNESS_CONTROL_MAX + SHARPNESS_DEVICE_MAX / 2) / SHARPNESS_DEVICE_MAX
}

/// Logical camera configuration and its derived state.
///
/// Setters update the cached value first and then write the device, so a
/// failed write still leaves the requested value cached. Without a
/// connection, only the cache changes.
#[derive(Debug, Clone)]
pub struct ParameterController {
    settings: CameraSettings,
    exposure: ExposureState,
    white_balance: WhiteBalance,
    geometry: Option<FrameGeometry>,
    output_pitch: Option<u32>,
    markers: PendingMarkers,
}

impl ParameterController {
    /// Controller holding `settings`, nothing applied yet.
    #[must_use]
    pub fn new(settings: CameraSettings) -> Self {
        let settings = settings.clamped();
        Self {
            exposure: ExposureState::new(settings.exposure_ms, settings.max_framerate_fps),
            white_balance: WhiteBalance::new(settings.red_gain, settings.blue_gain),
            settings,
            geometry: None,
            output_pitch: None,
            markers: PendingMarkers::default(),
        }
    }

    /// Cached parameter values.
    #[must_use]
    pub const fn settings(&self) -> &CameraSettings {
        &self.settings
    }

    /// Current frame geometry, once binning has been applied.
    #[must_use]
    pub const fn geometry(&self) -> Option<&FrameGeometry> {
        self.geometry.as_ref()
    }

    /// Exposure timing.
    #[must_use]
    pub const fn exposure(&self) -> &ExposureState {
        &self.exposure
    }

    /// White-balance state.
    #[must_use]
    pub const fn white_balance(&self) -> &WhiteBalance {
        &self.white_balance
    }

    /// Duration of one frame in nanoseconds.
    #[must_use]
    pub const fn frame_duration_ns(&self) -> u64 {
        self.exposure.frame_duration_ns()
    }

    /// Consume the markers raised since the last call.
    pub fn take_markers(&mut self) -> PendingMarkers {
        self.markers.take()
    }

    /// Push the whole configuration to a freshly opened device.
    ///
    /// Binning goes first since it fixes the geometry. Strobe and ROI
    /// failures are logged; anything else aborts startup.
    pub fn apply_all<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        strobe: &StrobeSettings,
        tune_roi: bool,
    ) -> Result<()> {
        self.configure_binning(session)?;
        self.markers.insert(Marker::BinningChanged);

        self.write_exposure(session)?;
        self.write_gain(session)?;
        self.write_black_level(session)?;
        self.write_saturation(session)?;

        if let Err(err) = session.set_strobe(strobe) {
            warn!(error = %err, "strobe setup failed");
        }

        self.settings.lut1.upload(session, 0)?;
        self.settings.lut2.upload(session, 1)?;
        self.settings.lut.apply(session, self.settings.gamma)?;

        // Sharpness only sticks once the LUT is configured.
        session.set_property_on(PropertyKind::Sharpness)?;
        self.write_sharpness(session)?;

        self.white_balance.set_mode(session, self.settings.white_balance)?;

        if tune_roi {
            if let Some(geometry) = &self.geometry {
                session.write_roi(Roi::centred_fifth(
                    geometry.output_width,
                    geometry.output_height,
                ));
            }
        }

        info!(
            binning = %self.settings.binning,
            exposure_ms = self.exposure.exposure_ms(),
            framerate = self.exposure.effective_framerate_fps(),
            "camera configured"
        );
        Ok(())
    }

    /// Change binning with the stop, reconfigure, restart protocol.
    pub fn set_binning<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        binning: Binning,
    ) -> Result<()> {
        self.settings.binning = binning;
        self.markers.insert(Marker::BinningChanged);
        if !session.is_present() {
            return Ok(());
        }

        let was_capturing = session.is_capturing();
        if was_capturing {
            session.stop_capture()?;
        }
        let configured = self.configure_binning(session);
        if was_capturing {
            session.start_capture()?;
        }
        configured
    }

    fn configure_binning<D: DeviceDriver>(&mut self, session: &mut CameraSession<D>) -> Result<()> {
        let binning = self.settings.binning;
        let sensor = session
            .info()
            .map(|info| info.sensor_resolution.clone())
            .ok_or(CameraError::NotConnected)?;
        let mode = raw_mode(&sensor, binning)?;

        let requested = ImageSettings {
            mode: binning.video_mode(),
            offset_x: 0,
            offset_y: 0,
            width: mode.raw_width,
            height: mode.raw_height,
            pixel_format: PixelFormat::Rgb8,
        };

        let packet_bytes = match session.validate_format(&requested) {
            Ok(validation) => {
                if !validation.valid {
                    warn!(?requested, "device rejects image settings, applying anyway");
                }
                validation.recommended_packet_bytes
            }
            Err(err) => {
                warn!(error = %err, "image settings validation failed");
                0
            }
        };

        session.set_format(&requested, packet_bytes)?;
        let applied = session.format()?;
        debug!(?applied, packet_bytes, "image settings applied");

        let mut geometry = FrameGeometry::new(
            binning,
            RawMode {
                raw_width: applied.width,
                raw_height: applied.height,
                ..mode
            },
            applied.pixel_format,
        )?;
        if let Some(pitch) = self.output_pitch {
            geometry = geometry.with_output_pitch(pitch);
        }
        info!(
            binning = %binning,
            raw_width = geometry.raw_width,
            raw_height = geometry.raw_height,
            width = geometry.output_width,
            height = geometry.output_height,
            pitch = geometry.output_pitch,
            "frame geometry"
        );
        self.geometry = Some(geometry);
        Ok(())
    }

    /// Adopt the output row stride negotiated with the host.
    pub fn set_output_pitch(&mut self, pitch: u32) {
        self.output_pitch = Some(pitch);
        if let Some(geometry) = self.geometry.take() {
            self.geometry = Some(geometry.with_output_pitch(pitch));
        }
    }

    /// Change exposure; frame rate and duration follow.
    pub fn set_exposure<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        exposure_ms: f64,
    ) -> Result<()> {
        self.settings.exposure_ms = exposure_ms;
        self.exposure.set_exposure_ms(exposure_ms);
        self.write_exposure(session)
    }

    fn write_exposure<D: DeviceDriver>(&mut self, session: &mut CameraSession<D>) -> Result<()> {
        self.markers.insert(Marker::ExposureChanged);
        self.exposure.apply(session)
    }

    /// Exposure in ms, refreshed from the device when connected.
    pub fn exposure_ms<D: DeviceDriver>(&mut self, session: &mut CameraSession<D>) -> Result<f64> {
        self.exposure.refresh(session)?;
        self.settings.exposure_ms = self.exposure.exposure_ms();
        Ok(self.settings.exposure_ms)
    }

    /// Change the frame-rate ceiling and re-apply exposure timing.
    pub fn set_max_framerate<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        max_framerate_fps: f64,
    ) -> Result<()> {
        self.settings.max_framerate_fps = max_framerate_fps;
        self.exposure.set_max_framerate_fps(max_framerate_fps);
        if session.is_present() {
            self.write_exposure(session)?;
        }
        Ok(())
    }

    /// Change the linear gain factor.
    pub fn set_gain<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        gain: u32,
    ) -> Result<()> {
        self.settings.gain = gain;
        self.write_gain(session)
    }

    fn write_gain<D: DeviceDriver>(&mut self, session: &mut CameraSession<D>) -> Result<()> {
        self.markers.insert(Marker::GainChanged);
        let db = gain_to_db(self.settings.gain);
        debug!(gain = self.settings.gain, db, "setting gain");
        session.set_property(PropertyKind::Gain, PropertyValue::Absolute(db))
    }

    /// Gain factor, refreshed from the device when connected.
    pub fn gain<D: DeviceDriver>(&mut self, session: &mut CameraSession<D>) -> Result<u32> {
        if let Some(PropertyValue::Absolute(db)) = session.property(PropertyKind::Gain)? {
            self.settings.gain = db_to_gain(db);
        }
        Ok(self.settings.gain)
    }

    /// Change the black level.
    pub fn set_black_level<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        black_level: u32,
    ) -> Result<()> {
        self.settings.black_level = black_level;
        self.write_black_level(session)
    }

    fn write_black_level<D: DeviceDriver>(&self, session: &mut CameraSession<D>) -> Result<()> {
        session.set_property(
            PropertyKind::Brightness,
            PropertyValue::Integer(self.settings.black_level),
        )
    }

    /// Black level, refreshed from the device when connected.
    pub fn black_level<D: DeviceDriver>(&mut self, session: &mut CameraSession<D>) -> Result<u32> {
        if let Some(PropertyValue::Integer(code)) = session.property(PropertyKind::Brightness)? {
            self.settings.black_level = code;
        }
        Ok(self.settings.black_level)
    }

    /// Change saturation (0-100).
    pub fn set_saturation<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        saturation: u32,
    ) -> Result<()> {
        self.settings.saturation = saturation;
        self.write_saturation(session)
    }

    fn write_saturation<D: DeviceDriver>(&self, session: &mut CameraSession<D>) -> Result<()> {
        session.set_property(
            PropertyKind::Saturation,
            PropertyValue::Absolute(saturation_to_device(self.settings.saturation)),
        )
    }

    /// Saturation, refreshed from the device when connected.
    pub fn saturation<D: DeviceDriver>(&mut self, session: &mut CameraSession<D>) -> Result<u32> {
        if let Some(PropertyValue::Absolute(value)) = session.property(PropertyKind::Saturation)? {
            self.settings.saturation = saturation_from_device(value);
        }
        Ok(self.settings.saturation)
    }

    /// Change sharpness (0-10).
    pub fn set_sharpness<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        sharpness: u32,
    ) -> Result<()> {
        self.settings.sharpness = sharpness;
        self.write_sharpness(session)
    }

    fn write_sharpness<D: DeviceDriver>(&self, session: &mut CameraSession<D>) -> Result<()> {
        session.set_property(
            PropertyKind::Sharpness,
            PropertyValue::Integer(sharpness_to_device(self.settings.sharpness)),
        )
    }

    /// Sharpness, refreshed from the device when connected.
    pub fn sharpness<D: DeviceDriver>(&mut self, session: &mut CameraSession<D>) -> Result<u32> {
        if let Some(PropertyValue::Integer(code)) = session.property(PropertyKind::Sharpness)? {
            self.settings.sharpness = sharpness_from_device(code);
        }
        Ok(self.settings.sharpness)
    }

    /// Change the white-balance mode.
    pub fn set_white_balance<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        mode: WhiteBalanceMode,
    ) -> Result<()> {
        self.settings.white_balance = mode;
        self.white_balance.set_mode(session, mode)
    }

    /// Set the red gain; switches white balance to manual.
    pub fn set_red_gain<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        red_gain: u32,
    ) -> Result<()> {
        self.settings.red_gain = red_gain;
        self.settings.white_balance = WhiteBalanceMode::Manual;
        self.white_balance.set_red_gain(session, red_gain)
    }

    /// Set the blue gain; switches white balance to manual.
    pub fn set_blue_gain<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        blue_gain: u32,
    ) -> Result<()> {
        self.settings.blue_gain = blue_gain;
        self.settings.white_balance = WhiteBalanceMode::Manual;
        self.white_balance.set_blue_gain(session, blue_gain)
    }

    /// Red and blue gains; read from the device unless in auto mode.
    pub fn white_balance_gains<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
    ) -> Result<(u32, u32)> {
        self.white_balance.refresh_gains(session)?;
        self.settings.red_gain = self.white_balance.red_gain();
        self.settings.blue_gain = self.white_balance.blue_gain();
        Ok((self.settings.red_gain, self.settings.blue_gain))
    }

    /// Advance a running one-push white balance by one frame.
    pub fn tick_white_balance<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
    ) -> Result<()> {
        let result = self.white_balance.tick(session);
        self.settings.white_balance = self.white_balance.mode();
        self.settings.red_gain = self.white_balance.red_gain();
        self.settings.blue_gain = self.white_balance.blue_gain();
        result
    }

    /// Change the intensity mapping mode.
    pub fn set_lut_mode<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        mode: LutMode,
    ) -> Result<()> {
        self.settings.lut = mode;
        mode.apply(session, self.settings.gamma)
    }

    /// LUT mode decoded from the selected bank when connected.
    pub fn lut_mode<D: DeviceDriver>(&mut self, session: &mut CameraSession<D>) -> Result<LutMode> {
        if let Some(bank) = session.active_lut_bank()? {
            self.settings.lut = LutMode::from_active_bank(bank);
        }
        Ok(self.settings.lut)
    }

    /// Parameters of LUT bank 0 or 1.
    #[must_use]
    pub const fn lut_bank(&self, bank: u32) -> Option<&LutBank> {
        match bank {
            0 => Some(&self.settings.lut1),
            1 => Some(&self.settings.lut2),
            _ => None,
        }
    }

    fn lut_bank_mut(&mut self, bank: u32) -> Result<&mut LutBank> {
        match bank {
            0 => Ok(&mut self.settings.lut1),
            1 => Ok(&mut self.settings.lut2),
            other => Err(CameraError::Config(format!("no LUT bank {other}"))),
        }
    }

    /// Change one channel offset of a bank and re-upload that channel.
    pub fn set_lut_offset<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        bank: u32,
        channel: LutChannel,
        offset: u16,
    ) -> Result<()> {
        let params = self.lut_bank_mut(bank)?;
        if let Some(slot) = params.offsets.get_mut(channel.index()) {
            *slot = offset;
        }
        let params = *params;
        params.upload_channel(session, bank, channel)
    }

    /// Change a bank's gamma and re-upload all its channels.
    pub fn set_lut_gamma<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        bank: u32,
        gamma: f64,
    ) -> Result<()> {
        let params = self.lut_bank_mut(bank)?;
        params.gamma = gamma;
        let params = *params;
        params.upload(session, bank)
    }

    /// Change a bank's gain and re-upload all its channels.
    pub fn set_lut_gain<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        bank: u32,
        gain: f64,
    ) -> Result<()> {
        let params = self.lut_bank_mut(bank)?;
        params.gain = gain;
        let params = *params;
        params.upload(session, bank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{DriverCall, MockDriver, MockDriverBuilder, MockHandle};

    fn open(builder: MockDriverBuilder) -> (CameraSession<MockDriver>, MockHandle) {
        let (driver, handle) = builder.build();
        let mut session = CameraSession::new(driver);
        session.open().expect("open should succeed");
        (session, handle)
    }

    fn configured() -> (CameraSession<MockDriver>, MockHandle, ParameterController) {
        let (mut session, handle) = open(MockDriver::builder());
        let mut controller = ParameterController::new(CameraSettings::default());
        controller
            .apply_all(&mut session, &StrobeSettings::default(), true)
            .expect("startup should succeed");
        (session, handle, controller)
    }

    #[test]
    fn test_gain_round_trip() {
        for gain in 1..=16 {
            assert_eq!(db_to_gain(gain_to_db(gain)), gain, "gain {gain}");
        }
        assert!((gain_to_db(1)).abs() < f32::EPSILON);
    }

    #[test]
    fn test_saturation_and_sharpness_scaling() {
        assert!((saturation_to_device(25) - 100.0).abs() < f32::EPSILON);
        assert_eq!(saturation_from_device(100.0), 25);
        assert_eq!(saturation_from_device(103.9), 25);
        assert_eq!(sharpness_to_device(2), 819);
        for sharpness in 0..=10 {
            assert_eq!(sharpness_from_device(sharpness_to_device(sharpness)), sharpness);
        }
    }

    #[test]
    fn test_markers_are_consumed_once() {
        let mut markers = PendingMarkers::default();
        markers.insert(Marker::GainChanged);
        markers.insert(Marker::BinningChanged);

        let taken = markers.take();
        assert!(markers.is_empty());
        assert_eq!(
            taken.iter().collect::<Vec<_>>(),
            vec![Marker::GainChanged, Marker::BinningChanged]
        );
    }

    #[test]
    fn test_startup_order() {
        let (_session, handle, controller) = configured();
        let calls = handle.calls();

        let position = |wanted: fn(&DriverCall) -> bool| {
            calls
                .iter()
                .position(wanted)
                .expect("call should be present")
        };
        let format = position(|c| matches!(c, DriverCall::SetFormat { .. }));
        let shutter = position(|c| {
            matches!(c, DriverCall::SetProperty { kind: PropertyKind::Shutter, .. })
        });
        let lut = position(|c| matches!(c, DriverCall::SetLutChannel { .. }));
        let sharpness = position(|c| {
            matches!(c, DriverCall::SetProperty { kind: PropertyKind::Sharpness, .. })
        });
        let wb = position(|c| {
            matches!(c, DriverCall::SetProperty { kind: PropertyKind::WhiteBalance, .. })
        });
        assert!(format < shutter && shutter < lut && lut < sharpness && sharpness < wb);

        let geometry = controller.geometry().expect("geometry should be set");
        assert_eq!((geometry.output_width, geometry.output_height), (1288, 964));
        assert_eq!(handle.strobe(), Some(StrobeSettings::default()));
        assert!(handle.lut_table(1, LutChannel::Green).is_some());
    }

    #[test]
    fn test_startup_values_reach_device() {
        let (_session, handle, _controller) = configured();

        let gain = handle.property(PropertyKind::Gain);
        assert!(gain.abs_value.abs() < 1e-6);
        assert_eq!(handle.property(PropertyKind::Brightness).value_a, 15);
        let saturation = handle.property(PropertyKind::Saturation);
        assert!((saturation.abs_value - 100.0).abs() < f32::EPSILON);
        assert_eq!(handle.property(PropertyKind::Sharpness).value_a, 819);
        let wb = handle.property(PropertyKind::WhiteBalance);
        assert_eq!((wb.value_a, wb.value_b), (425, 727));
        assert!(handle.lut_enabled());
        assert_eq!(handle.active_lut_bank(), 0);
    }

    #[test]
    fn test_startup_tolerates_missing_roi_registers() {
        let (mut session, _handle) = open(MockDriver::builder().fail_registers());
        let mut controller = ParameterController::new(CameraSettings::default());
        controller
            .apply_all(&mut session, &StrobeSettings::default(), true)
            .expect("ROI failures are not fatal");
    }

    #[test]
    fn test_startup_tolerates_rejected_format() {
        let (mut session, _handle) = open(MockDriver::builder().reject_formats());
        let mut controller = ParameterController::new(CameraSettings::default());
        controller
            .apply_all(&mut session, &StrobeSettings::default(), false)
            .expect("validation rejection is only logged");
    }

    #[test]
    fn test_startup_fails_on_property_error() {
        let (mut session, _handle) = open(MockDriver::builder().fail_property(PropertyKind::Gain));
        let mut controller = ParameterController::new(CameraSettings::default());
        let err = controller
            .apply_all(&mut session, &StrobeSettings::default(), false)
            .expect_err("gain failure aborts startup");
        assert!(matches!(
            err,
            CameraError::PropertyAccessFailed {
                kind: PropertyKind::Gain,
                ..
            }
        ));
    }

    #[test]
    fn test_startup_fails_on_unparsable_sensor() {
        let (mut session, _handle) = open(MockDriver::builder().sensor_resolution("unknown"));
        let mut controller = ParameterController::new(CameraSettings::default());
        let err = controller
            .apply_all(&mut session, &StrobeSettings::default(), false)
            .expect_err("unknown resolution aborts startup");
        assert!(matches!(err, CameraError::FormatConfigurationInvalid(_)));
    }

    #[test]
    fn test_binning_change_while_capturing() {
        let (mut session, handle, mut controller) = configured();
        session.start_capture().expect("start should succeed");
        handle.clear_calls();

        controller
            .set_binning(&mut session, Binning::Four)
            .expect("binning should change");

        let calls = handle.calls();
        let kinds: Vec<_> = calls
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    DriverCall::StopCapture | DriverCall::SetFormat { .. } | DriverCall::StartCapture
                )
            })
            .collect();
        assert!(matches!(kinds.as_slice(), [
            DriverCall::StopCapture,
            DriverCall::SetFormat { .. },
            DriverCall::StartCapture
        ]));
        assert!(session.is_capturing());

        let geometry = controller.geometry().expect("geometry should be set");
        assert_eq!((geometry.raw_width, geometry.raw_height), (320, 240));
        assert_eq!((geometry.output_width, geometry.output_height), (1288, 964));
        assert_eq!(handle.format().mode, crate::traits::VideoMode::Mode5);
        assert!(controller.take_markers().contains(Marker::BinningChanged));
    }

    #[test]
    fn test_binning_without_connection_only_caches() {
        let (driver, handle) = MockDriver::builder().build();
        let mut session = CameraSession::new(driver);
        let mut controller = ParameterController::new(CameraSettings::default());
        controller
            .set_binning(&mut session, Binning::Two)
            .expect("cache update succeeds");
        assert_eq!(controller.settings().binning, Binning::Two);
        assert!(controller.geometry().is_none());
        assert!(handle.calls().is_empty());
    }

    #[test]
    fn test_getters_read_back() {
        let (mut session, handle, mut controller) = configured();

        controller.set_gain(&mut session, 8).expect("set gain");
        assert_eq!(controller.gain(&mut session).expect("get gain"), 8);

        controller.set_saturation(&mut session, 25).expect("set saturation");
        assert_eq!(controller.saturation(&mut session).expect("get saturation"), 25);

        controller.set_sharpness(&mut session, 2).expect("set sharpness");
        assert_eq!(controller.sharpness(&mut session).expect("get sharpness"), 2);

        let mut brightness = handle.property(PropertyKind::Brightness);
        brightness.value_a = 7;
        handle.set_property(PropertyKind::Brightness, brightness);
        assert_eq!(controller.black_level(&mut session).expect("get black level"), 7);
    }

    #[test]
    fn test_lut_mode_read_back_is_ambiguous() {
        let (mut session, _handle, mut controller) = configured();
        controller
            .set_lut_mode(&mut session, LutMode::Lut2)
            .expect("set lut2");
        assert_eq!(controller.lut_mode(&mut session).expect("get"), LutMode::Lut2);

        controller
            .set_lut_mode(&mut session, LutMode::Gamma)
            .expect("set gamma");
        assert_eq!(controller.lut_mode(&mut session).expect("get"), LutMode::Lut2);
    }

    #[test]
    fn test_lut_offset_reuploads_one_channel() {
        let (mut session, handle, mut controller) = configured();
        handle.clear_calls();

        controller
            .set_lut_offset(&mut session, 1, LutChannel::Red, 40)
            .expect("set offset");

        assert_eq!(
            handle.calls(),
            vec![DriverCall::SetLutChannel {
                bank: 1,
                channel: LutChannel::Red
            }]
        );
        let table = handle.lut_table(1, LutChannel::Red).expect("table");
        assert!(table[..40].iter().all(|&v| v == 0));
        assert_eq!(controller.lut_bank(1).expect("bank").offsets[0], 40);
        assert!(controller.set_lut_gamma(&mut session, 2, 1.0).is_err());
    }

    #[test]
    fn test_failed_write_keeps_requested_value() {
        let (mut session, handle, mut controller) = configured();
        handle.set_fail_property(PropertyKind::Saturation, true);

        assert!(controller.set_saturation(&mut session, 60).is_err());
        assert_eq!(controller.settings().saturation, 60);
    }

    #[test]
    fn test_max_framerate_reapplies_exposure() {
        let (mut session, handle, mut controller) = configured();
        controller
            .set_exposure(&mut session, 5.0)
            .expect("set exposure");
        assert_eq!(controller.frame_duration_ns(), 40_000_000);

        controller
            .set_max_framerate(&mut session, 100.0)
            .expect("set ceiling");
        assert_eq!(controller.frame_duration_ns(), 10_000_000);
        assert!((handle.property(PropertyKind::FrameRate).abs_value - 100.0).abs() < 1e-3);
    }
}
