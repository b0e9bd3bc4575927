//! Camera source: the surface a host pipeline drives.
//!
//! Lifecycle is `start` (open and configure), `set_caps` (negotiate and
//! begin capture), repeated `create`, then `stop`. Parameters can be set
//! and queried at any time from any thread; every call takes the source
//! lock, so a change never lands in the middle of a frame.

use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::caps::VideoCaps;
use crate::config::{
    clamp_setting, CameraSettings, SourceConfig, BLACK_LEVEL_RANGE, EXPOSURE_RANGE_MS,
    GAIN_RANGE, LUT_GAIN_RANGE, LUT_GAMMA_RANGE, LUT_OFFSET_RANGE, MAX_FRAMERATE_RANGE,
    SATURATION_RANGE, SHARPNESS_RANGE, WB_GAIN_RANGE,
};
use crate::controller::ParameterController;
use crate::geometry::{Binning, FrameGeometry};
use crate::lut::{LutBank, LutMode};
use crate::pump::{FlowOutcome, FramePump, VideoBuffer};
use crate::session::CameraSession;
use crate::traits::{CameraError, DeviceDriver, LutChannel, Result};
use crate::white_balance::WhiteBalanceMode;

/// One runtime parameter change, parsed from `name=value`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Setting {
    /// `exposure`, ms.
    Exposure(f64),
    /// `gain`, linear factor.
    Gain(u32),
    /// `blacklevel`.
    BlackLevel(u32),
    /// `rgain`.
    RedGain(u32),
    /// `bgain`.
    BlueGain(u32),
    /// `binning`.
    Binning(Binning),
    /// `whitebalance`.
    WhiteBalance(WhiteBalanceMode),
    /// `maxframerate`, fps.
    MaxFramerate(f64),
    /// `lut`.
    Lut(LutMode),
    /// `lut{1,2}offset{red,green,blue}`.
    LutOffset {
        /// Bank index, 0 or 1.
        bank: u32,
        /// Channel addressed.
        channel: LutChannel,
        /// Input offset.
        offset: u16,
    },
    /// `lut{1,2}gamma`.
    LutGamma {
        /// Bank index, 0 or 1.
        bank: u32,
        /// Curve exponent.
        gamma: f64,
    },
    /// `lut{1,2}gain`.
    LutGain {
        /// Bank index, 0 or 1.
        bank: u32,
        /// Curve gain.
        gain: f64,
    },
    /// `saturation`.
    Saturation(u32),
    /// `sharpness`.
    Sharpness(u32),
}

impl Setting {
    /// Copy with the value pulled into its accepted range.
    #[must_use]
    pub fn clamped(self) -> Self {
        match self {
            Self::Exposure(v) => Self::Exposure(clamp_setting("exposure", v, EXPOSURE_RANGE_MS)),
            Self::Gain(v) => Self::Gain(clamp_setting("gain", v, GAIN_RANGE)),
            Self::BlackLevel(v) => {
                Self::BlackLevel(clamp_setting("blacklevel", v, BLACK_LEVEL_RANGE))
            }
            Self::RedGain(v) => Self::RedGain(clamp_setting("rgain", v, WB_GAIN_RANGE)),
            Self::BlueGain(v) => Self::BlueGain(clamp_setting("bgain", v, WB_GAIN_RANGE)),
            Self::MaxFramerate(v) => {
                Self::MaxFramerate(clamp_setting("maxframerate", v, MAX_FRAMERATE_RANGE))
            }
            Self::LutOffset {
                bank,
                channel,
                offset,
            } => Self::LutOffset {
                bank,
                channel,
                offset: clamp_setting("lutoffset", offset, LUT_OFFSET_RANGE),
            },
            Self::LutGamma { bank, gamma } => Self::LutGamma {
                bank,
                gamma: clamp_setting("lutgamma", gamma, LUT_GAMMA_RANGE),
            },
            Self::LutGain { bank, gain } => Self::LutGain {
                bank,
                gain: clamp_setting("lutgain", gain, LUT_GAIN_RANGE),
            },
            Self::Saturation(v) => {
                Self::Saturation(clamp_setting("saturation", v, SATURATION_RANGE))
            }
            Self::Sharpness(v) => Self::Sharpness(clamp_setting("sharpness", v, SHARPNESS_RANGE)),
            other @ (Self::Binning(_) | Self::WhiteBalance(_) | Self::Lut(_)) => other,
        }
    }
}

fn parse_value<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CameraError::Config(format!("invalid value {value:?} for {name}")))
}

fn channel_name(channel: LutChannel) -> &'static str {
    match channel {
        LutChannel::Red => "red",
        LutChannel::Green => "green",
        LutChannel::Blue => "blue",
    }
}

/// Parse `lut1gamma`, `lut2offsetblue` and friends.
fn parse_lut_setting(name: &str, value: &str) -> Result<Option<Setting>> {
    let Some(rest) = name.strip_prefix("lut") else {
        return Ok(None);
    };
    let (bank, field) = if let Some(field) = rest.strip_prefix('1') {
        (0, field)
    } else if let Some(field) = rest.strip_prefix('2') {
        (1, field)
    } else {
        return Ok(None);
    };

    let setting = match field {
        "gamma" => Setting::LutGamma {
            bank,
            gamma: parse_value(name, value)?,
        },
        "gain" => Setting::LutGain {
            bank,
            gain: parse_value(name, value)?,
        },
        _ => {
            let Some(channel) = field
                .strip_prefix("offset")
                .and_then(|c| LutChannel::ALL.into_iter().find(|ch| channel_name(*ch) == c))
            else {
                return Ok(None);
            };
            Setting::LutOffset {
                bank,
                channel,
                offset: parse_value(name, value)?,
            }
        }
    };
    Ok(Some(setting))
}

impl FromStr for Setting {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self> {
        let (name, value) = s
            .split_once('=')
            .ok_or_else(|| CameraError::Config(format!("expected name=value, got {s:?}")))?;
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();

        let setting = match name.as_str() {
            "exposure" => Self::Exposure(parse_value(&name, value)?),
            "gain" => Self::Gain(parse_value(&name, value)?),
            "blacklevel" => Self::BlackLevel(parse_value(&name, value)?),
            "rgain" => Self::RedGain(parse_value(&name, value)?),
            "bgain" => Self::BlueGain(parse_value(&name, value)?),
            "binning" => Self::Binning(Binning::try_from(parse_value::<u32>(&name, value)?)?),
            "whitebalance" => Self::WhiteBalance(value.parse()?),
            "maxframerate" => Self::MaxFramerate(parse_value(&name, value)?),
            "lut" => Self::Lut(value.parse()?),
            "saturation" => Self::Saturation(parse_value(&name, value)?),
            "sharpness" => Self::Sharpness(parse_value(&name, value)?),
            other => parse_lut_setting(other, value)?
                .ok_or_else(|| CameraError::Config(format!("unknown setting {other:?}")))?,
        };
        Ok(setting)
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exposure(v) => write!(f, "exposure={v}"),
            Self::Gain(v) => write!(f, "gain={v}"),
            Self::BlackLevel(v) => write!(f, "blacklevel={v}"),
            Self::RedGain(v) => write!(f, "rgain={v}"),
            Self::BlueGain(v) => write!(f, "bgain={v}"),
            Self::Binning(v) => write!(f, "binning={v}"),
            Self::WhiteBalance(v) => write!(f, "whitebalance={v}"),
            Self::MaxFramerate(v) => write!(f, "maxframerate={v}"),
            Self::Lut(v) => write!(f, "lut={v}"),
            Self::LutOffset {
                bank,
                channel,
                offset,
            } => write!(f, "lut{}offset{}={offset}", bank + 1, channel_name(*channel)),
            Self::LutGamma { bank, gamma } => write!(f, "lut{}gamma={gamma}", bank + 1),
            Self::LutGain { bank, gain } => write!(f, "lut{}gain={gain}", bank + 1),
            Self::Saturation(v) => write!(f, "saturation={v}"),
            Self::Sharpness(v) => write!(f, "sharpness={v}"),
        }
    }
}

/// Consumer of produced buffers.
pub trait Downstream {
    /// Accept one buffer.
    fn accept(&mut self, buffer: VideoBuffer) -> Result<()>;
}

impl Downstream for Vec<VideoBuffer> {
    fn accept(&mut self, buffer: VideoBuffer) -> Result<()> {
        self.push(buffer);
        Ok(())
    }
}

struct SourceState<D: DeviceDriver> {
    session: CameraSession<D>,
    controller: ParameterController,
    pump: FramePump,
    config: SourceConfig,
}

/// A live camera source over a device driver.
pub struct CameraSource<D: DeviceDriver> {
    inner: Mutex<SourceState<D>>,
}

impl<D: DeviceDriver> CameraSource<D> {
    /// Source over `driver`, configured but not yet started.
    pub fn new(driver: D, config: SourceConfig) -> Self {
        let controller = ParameterController::new(config.camera.clone());
        Self {
            inner: Mutex::new(SourceState {
                session: CameraSession::new(driver),
                controller,
                pump: FramePump::new(&config),
                config,
            }),
        }
    }

    /// Source configuration as loaded.
    pub fn config(&self) -> SourceConfig {
        self.inner.lock().config.clone()
    }

    /// Open the camera and push the whole configuration to it.
    ///
    /// The device is closed again if any step fails.
    pub fn start(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        state.session.open()?;
        let applied = state.controller.apply_all(
            &mut state.session,
            &state.config.strobe,
            state.config.tune_roi,
        );
        if let Err(err) = applied {
            warn!(error = %err, "camera configuration failed, closing");
            state.session.close();
            return Err(err);
        }
        state.pump.reset();
        if let Some(info) = state.session.info() {
            info!(
                model = %info.model,
                serial = info.serial_number,
                "camera source started"
            );
        }
        Ok(())
    }

    /// Stop capture and release the camera. Safe to call repeatedly.
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        state.session.close();
        state.pump.reset();
        debug!("camera source stopped");
    }

    /// Caps this source can produce right now: fixed once a camera is
    /// open, the template otherwise.
    pub fn caps(&self) -> VideoCaps {
        let state = self.inner.lock();
        if !state.session.is_present() {
            return VideoCaps::template();
        }
        state.controller.geometry().map_or_else(VideoCaps::template, |geometry| {
            VideoCaps::rgb(geometry.output_width, geometry.output_height)
        })
    }

    /// Accept negotiated caps and start capture.
    pub fn set_caps(&self, caps: &VideoCaps) -> Result<()> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        if !state.session.is_present() {
            return Err(CameraError::NotConnected);
        }
        let geometry = state
            .controller
            .geometry()
            .copied()
            .ok_or(CameraError::NotConnected)?;
        caps.check_output(geometry.output_width, geometry.output_height)?;
        if state.session.is_capturing() {
            state.session.stop_capture()?;
        }
        if let Some(stride) = caps.stride() {
            state.controller.set_output_pitch(stride);
        }
        state.session.start_capture()?;
        info!(%caps, "capture started");
        Ok(())
    }

    /// Produce the next buffer, or end-of-stream.
    pub fn create(&self) -> Result<FlowOutcome> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        state.pump.create(&mut state.session, &mut state.controller)
    }

    /// Negotiate fixed caps if needed and push buffers into `sink` until
    /// end-of-stream. Returns the number of buffers pushed.
    pub fn run<S: Downstream>(&self, sink: &mut S) -> Result<u64> {
        if !self.is_capturing() {
            let caps = self.caps();
            self.set_caps(&caps)?;
        }

        let mut pushed = 0u64;
        loop {
            match self.create()? {
                FlowOutcome::Buffer(buffer) => {
                    sink.accept(buffer)?;
                    pushed += 1;
                }
                FlowOutcome::EndOfStream => {
                    info!(frames = pushed, "end of stream");
                    return Ok(pushed);
                }
            }
        }
    }

    /// Apply a parameter change. The cached value is updated even when the
    /// device write fails; the failure is logged and returned.
    pub fn set(&self, setting: Setting) -> Result<()> {
        let setting = setting.clamped();
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let session = &mut state.session;
        let controller = &mut state.controller;

        debug!(%setting, "setting parameter");
        let result = match setting {
            Setting::Exposure(v) => controller.set_exposure(session, v),
            Setting::Gain(v) => controller.set_gain(session, v),
            Setting::BlackLevel(v) => controller.set_black_level(session, v),
            Setting::RedGain(v) => controller.set_red_gain(session, v),
            Setting::BlueGain(v) => controller.set_blue_gain(session, v),
            Setting::Binning(v) => controller.set_binning(session, v),
            Setting::WhiteBalance(v) => controller.set_white_balance(session, v),
            Setting::MaxFramerate(v) => controller.set_max_framerate(session, v),
            Setting::Lut(v) => controller.set_lut_mode(session, v),
            Setting::LutOffset {
                bank,
                channel,
                offset,
            } => controller.set_lut_offset(session, bank, channel, offset),
            Setting::LutGamma { bank, gamma } => controller.set_lut_gamma(session, bank, gamma),
            Setting::LutGain { bank, gain } => controller.set_lut_gain(session, bank, gain),
            Setting::Saturation(v) => controller.set_saturation(session, v),
            Setting::Sharpness(v) => controller.set_sharpness(session, v),
        };
        if let Err(err) = &result {
            warn!(%setting, error = %err, "parameter write failed");
        }
        result
    }

    fn query<T, F, C>(&self, name: &str, read: F, cached: C) -> T
    where
        F: FnOnce(&mut ParameterController, &mut CameraSession<D>) -> Result<T>,
        C: FnOnce(&CameraSettings) -> T,
    {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        match read(&mut state.controller, &mut state.session) {
            Ok(value) => value,
            Err(err) => {
                warn!(parameter = name, error = %err, "read failed, reporting cached value");
                cached(state.controller.settings())
            }
        }
    }

    /// Exposure time, ms.
    pub fn exposure(&self) -> f64 {
        self.query("exposure", ParameterController::exposure_ms, |s| s.exposure_ms)
    }

    /// Linear gain factor.
    pub fn gain(&self) -> u32 {
        self.query("gain", ParameterController::gain, |s| s.gain)
    }

    /// Black level.
    pub fn black_level(&self) -> u32 {
        self.query("blacklevel", ParameterController::black_level, |s| s.black_level)
    }

    /// Red white-balance gain.
    pub fn red_gain(&self) -> u32 {
        self.query(
            "rgain",
            |c, s| c.white_balance_gains(s).map(|(red, _)| red),
            |s| s.red_gain,
        )
    }

    /// Blue white-balance gain.
    pub fn blue_gain(&self) -> u32 {
        self.query(
            "bgain",
            |c, s| c.white_balance_gains(s).map(|(_, blue)| blue),
            |s| s.blue_gain,
        )
    }

    /// Saturation, 0-100.
    pub fn saturation(&self) -> u32 {
        self.query("saturation", ParameterController::saturation, |s| s.saturation)
    }

    /// Sharpness, 0-10.
    pub fn sharpness(&self) -> u32 {
        self.query("sharpness", ParameterController::sharpness, |s| s.sharpness)
    }

    /// LUT mode as far as the device can report it.
    pub fn lut(&self) -> LutMode {
        self.query("lut", ParameterController::lut_mode, |s| s.lut)
    }

    /// Binning level.
    pub fn binning(&self) -> Binning {
        self.inner.lock().controller.settings().binning
    }

    /// White-balance mode.
    pub fn white_balance(&self) -> WhiteBalanceMode {
        self.inner.lock().controller.settings().white_balance
    }

    /// Frame-rate ceiling, fps.
    pub fn max_framerate(&self) -> f64 {
        self.inner.lock().controller.settings().max_framerate_fps
    }

    /// Parameters of LUT bank 0 or 1.
    pub fn lut_bank(&self, bank: u32) -> Option<LutBank> {
        self.inner.lock().controller.lut_bank(bank).copied()
    }

    /// Current frame geometry, once the camera is configured.
    pub fn geometry(&self) -> Option<FrameGeometry> {
        self.inner.lock().controller.geometry().copied()
    }

    /// Duration of one frame, ns.
    pub fn frame_duration_ns(&self) -> u64 {
        self.inner.lock().controller.frame_duration_ns()
    }

    /// Whether a camera is open.
    pub fn device_present(&self) -> bool {
        self.inner.lock().session.is_present()
    }

    /// Whether capture is running.
    pub fn is_capturing(&self) -> bool {
        self.inner.lock().session.is_capturing()
    }

    /// Whether a one-push white balance is still calibrating.
    pub fn one_push_in_progress(&self) -> bool {
        self.inner
            .lock()
            .controller
            .white_balance()
            .one_push_in_progress()
    }

    /// Frames produced since start.
    pub fn frame_count(&self) -> u64 {
        self.inner.lock().pump.frame_count()
    }
}
