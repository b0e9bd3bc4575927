//! V4L2 backend for [`DeviceDriver`] using the v4l crate.
//!
//! Properties map onto the standard user and camera-class controls. V4L2
//! has no register space, strobe output or LUT banks: register and strobe
//! calls fail, and the LUT is applied in software on retrieved frames.
//! Properties the device lacks are held in a local cache so that a full
//! configuration can still be pushed.

use std::collections::HashMap;

use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::control::{Control, Value};
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use crate::lut::LUT_ENTRIES;
use crate::traits::{
    CameraError, CameraInfo, DeviceDriver, FormatValidation, ImageSettings, LutChannel,
    PixelFormat, PropertyKind, PropertyState, RawFrame, Result, StrobeSettings, VideoMode,
};

const CID_BRIGHTNESS: u32 = 0x0098_0900;
const CID_SATURATION: u32 = 0x0098_0902;
const CID_AUTO_WHITE_BALANCE: u32 = 0x0098_090c;
const CID_DO_WHITE_BALANCE: u32 = 0x0098_090d;
const CID_RED_BALANCE: u32 = 0x0098_090e;
const CID_BLUE_BALANCE: u32 = 0x0098_090f;
const CID_GAMMA: u32 = 0x0098_0910;
const CID_GAIN: u32 = 0x0098_0913;
const CID_SHARPNESS: u32 = 0x0098_091b;
const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;

const EXPOSURE_MANUAL: i64 = 1;
const EXPOSURE_APERTURE_PRIORITY: i64 = 3;
/// `EXPOSURE_ABSOLUTE` counts in 100 µs steps.
const EXPOSURE_UNITS_PER_MS: f32 = 10.0;
/// `GAMMA` is commonly scaled by 100.
const GAMMA_SCALE: f32 = 100.0;

const BUFFER_COUNT: u32 = 4;

fn rgb_fourcc() -> FourCC {
    FourCC::new(b"RGB3")
}

fn grey_fourcc() -> FourCC {
    FourCC::new(b"GREY")
}

fn io_error(context: &str, err: &std::io::Error) -> CameraError {
    CameraError::Device(format!("{context}: {err}"))
}

fn value_i64(control: &Control) -> Option<i64> {
    match control.value {
        Value::Integer(v) => Some(v),
        Value::Boolean(b) => Some(i64::from(b)),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_control(value: f32) -> i64 {
    value.round() as i64
}

#[allow(clippy::cast_precision_loss)]
fn from_control(value: i64) -> f32 {
    value as f32
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_code(value: i64) -> u32 {
    value.clamp(0, i64::from(u32::MAX)) as u32
}

/// Software stand-in for the device LUT.
#[derive(Debug, Default)]
struct SoftwareLut {
    enabled: bool,
    active_bank: u32,
    tables: HashMap<(u32, LutChannel), Vec<u16>>,
}

impl SoftwareLut {
    /// Map 8-bit samples through the active bank. Tables are 9-bit in and out.
    fn apply(&self, data: &mut [u8], pixel_format: PixelFormat) {
        if !self.enabled {
            return;
        }
        let lookup = |channel: LutChannel| self.tables.get(&(self.active_bank, channel));
        match pixel_format {
            PixelFormat::Rgb8 => {
                let tables = LutChannel::ALL.map(lookup);
                for pixel in data.chunks_exact_mut(3) {
                    for (sample, table) in pixel.iter_mut().zip(&tables) {
                        if let Some(table) = table {
                            *sample = map_sample(table, *sample);
                        }
                    }
                }
            }
            PixelFormat::Mono8 => {
                if let Some(table) = lookup(LutChannel::Green) {
                    for sample in data.iter_mut() {
                        *sample = map_sample(table, *sample);
                    }
                }
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn map_sample(table: &[u16], sample: u8) -> u8 {
    let index = (usize::from(sample) * 2).min(LUT_ENTRIES - 1);
    table
        .get(index)
        .map_or(sample, |&v| (v / 2).min(u16::from(u8::MAX)) as u8)
}

/// An open V4L2 capture device.
struct Connection {
    device: Device,
    /// Supported control ids with their (min, max).
    controls: HashMap<u32, (i64, i64)>,
    card: String,
    driver: String,
    bus: String,
    mode: VideoMode,
    framerate_limited: bool,
    stream: Option<Stream<'static>>,
}

/// [`DeviceDriver`] over `/dev/video*` nodes.
#[derive(Default)]
pub struct V4l2Driver {
    /// Fixed `/dev/videoN` node, bypassing enumeration order.
    node: Option<usize>,
    connection: Option<Connection>,
    /// Properties the device does not implement, kept locally.
    emulated: HashMap<PropertyKind, PropertyState>,
    lut: SoftwareLut,
}

impl V4l2Driver {
    /// Driver with no device open.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver that always connects to `/dev/video{node}`.
    #[must_use]
    pub fn with_node(node: usize) -> Self {
        Self {
            node: Some(node),
            ..Self::default()
        }
    }

    fn connection(&mut self) -> Result<&mut Connection> {
        self.connection.as_mut().ok_or(CameraError::NotConnected)
    }

    fn emulated(&mut self, kind: PropertyKind) -> PropertyState {
        *self.emulated.entry(kind).or_insert_with(|| PropertyState {
            present: false,
            on_off: true,
            abs_control: kind.is_absolute(),
            ..PropertyState::default()
        })
    }
}

impl Connection {
    fn open(index: usize) -> Result<Self> {
        let device = Device::new(index).map_err(|err| CameraError::ConnectFailed(err.to_string()))?;
        let caps = device
            .query_caps()
            .map_err(|err| CameraError::ConnectFailed(err.to_string()))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::ConnectFailed(format!(
                "{} cannot capture video",
                caps.card
            )));
        }

        let controls = device
            .query_controls()
            .map(|descriptions| {
                descriptions
                    .into_iter()
                    .map(|d| (d.id, (d.minimum, d.maximum)))
                    .collect()
            })
            .unwrap_or_else(|err| {
                warn!(error = %err, "control enumeration failed");
                HashMap::new()
            });

        Ok(Self {
            device,
            controls,
            card: caps.card,
            driver: caps.driver,
            bus: caps.bus,
            mode: VideoMode::Mode0,
            framerate_limited: true,
            stream: None,
        })
    }

    fn has(&self, id: u32) -> bool {
        self.controls.contains_key(&id)
    }

    fn get(&self, id: u32) -> Result<i64> {
        let control = self
            .device
            .control(id)
            .map_err(|err| io_error("read control", &err))?;
        value_i64(&control)
            .ok_or_else(|| CameraError::Device(format!("control {id:#x} is not numeric")))
    }

    fn set(&self, id: u32, value: i64) -> Result<()> {
        let value = self
            .controls
            .get(&id)
            .map_or(value, |&(min, max)| value.max(min).min(max));
        self.device
            .set_control(Control {
                id,
                value: Value::Integer(value),
            })
            .map_err(|err| io_error("write control", &err))
    }

    fn sizes(&self, fourcc: FourCC) -> Vec<(u32, u32, u32, u32)> {
        self.device
            .enum_framesizes(fourcc)
            .unwrap_or_default()
            .into_iter()
            .flat_map(|size| match size.size {
                FrameSizeEnum::Discrete(d) => vec![(d.width, d.height, d.width, d.height)],
                FrameSizeEnum::Stepwise(s) => {
                    vec![(s.min_width, s.min_height, s.max_width, s.max_height)]
                }
            })
            .collect()
    }

    #[allow(clippy::cast_precision_loss)]
    fn framerate(&self) -> Result<f32> {
        let params = self
            .device
            .params()
            .map_err(|err| io_error("read stream parameters", &err))?;
        let interval = params.interval;
        if interval.numerator == 0 {
            return Ok(0.0);
        }
        Ok(interval.denominator as f32 / interval.numerator as f32)
    }

    #[allow(clippy::cast_precision_loss)]
    fn max_framerate(&self, width: u32, height: u32) -> Option<f32> {
        let intervals = self
            .device
            .enum_frameintervals(rgb_fourcc(), width, height)
            .ok()?;
        intervals
            .into_iter()
            .filter_map(|interval| match interval.interval {
                FrameIntervalEnum::Discrete(f) if f.numerator > 0 => {
                    Some(f.denominator as f32 / f.numerator as f32)
                }
                FrameIntervalEnum::Stepwise(s) if s.min.numerator > 0 => {
                    Some(s.min.denominator as f32 / s.min.numerator as f32)
                }
                _ => None,
            })
            .reduce(f32::max)
    }
}

impl DeviceDriver for V4l2Driver {
    fn camera_count(&mut self) -> Result<u32> {
        if self.node.is_some() {
            return Ok(1);
        }
        let nodes = v4l::context::enum_devices();
        Ok(u32::try_from(nodes.len()).unwrap_or(u32::MAX))
    }

    fn connect(&mut self, index: u32) -> Result<()> {
        let node = match self.node {
            Some(node) => node,
            None => {
                let mut nodes = v4l::context::enum_devices();
                nodes.sort_by_key(v4l::context::Node::index);
                nodes
                    .get(index as usize)
                    .map(v4l::context::Node::index)
                    .ok_or(CameraError::NoDeviceFound)?
            }
        };
        let connection = Connection::open(node)?;
        debug!(
            node,
            card = %connection.card,
            controls = connection.controls.len(),
            "V4L2 device opened"
        );
        self.connection = Some(connection);
        self.emulated.clear();
        self.lut = SoftwareLut::default();
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.connection = None;
        Ok(())
    }

    fn camera_info(&mut self) -> Result<CameraInfo> {
        let connection = self.connection()?;
        let largest = connection
            .sizes(rgb_fourcc())
            .into_iter()
            .map(|(_, _, w, h)| (w, h))
            .max_by_key(|&(w, h)| u64::from(w) * u64::from(h));
        let (width, height) = match largest {
            Some(size) => size,
            None => {
                let format = connection
                    .device
                    .format()
                    .map_err(|err| io_error("read format", &err))?;
                (format.width, format.height)
            }
        };

        Ok(CameraInfo {
            model: connection.card.clone(),
            vendor: connection.driver.clone(),
            sensor_info: connection.bus.clone(),
            sensor_resolution: format!("{width}x{height}"),
            serial_number: 0,
        })
    }

    fn property(&mut self, kind: PropertyKind) -> Result<PropertyState> {
        let connection = self.connection()?;
        let state = match kind {
            PropertyKind::FrameRate => PropertyState {
                present: true,
                on_off: connection.framerate_limited,
                abs_control: true,
                abs_value: connection.framerate()?,
                ..PropertyState::default()
            },
            PropertyKind::Shutter if connection.has(CID_EXPOSURE_ABSOLUTE) => {
                let auto = connection.has(CID_EXPOSURE_AUTO)
                    && connection.get(CID_EXPOSURE_AUTO)? != EXPOSURE_MANUAL;
                PropertyState {
                    present: true,
                    on_off: true,
                    auto_manual: auto,
                    abs_control: true,
                    abs_value: from_control(connection.get(CID_EXPOSURE_ABSOLUTE)?)
                        / EXPOSURE_UNITS_PER_MS,
                    ..PropertyState::default()
                }
            }
            PropertyKind::WhiteBalance
                if connection.has(CID_RED_BALANCE) && connection.has(CID_BLUE_BALANCE) =>
            {
                let auto = connection.has(CID_AUTO_WHITE_BALANCE)
                    && connection.get(CID_AUTO_WHITE_BALANCE)? != 0;
                PropertyState {
                    present: true,
                    on_off: true,
                    auto_manual: auto,
                    value_a: to_code(connection.get(CID_RED_BALANCE)?),
                    value_b: to_code(connection.get(CID_BLUE_BALANCE)?),
                    ..PropertyState::default()
                }
            }
            PropertyKind::Gain | PropertyKind::Saturation | PropertyKind::Gamma => {
                match absolute_control(kind).filter(|&(id, _)| connection.has(id)) {
                    Some((id, scale)) => PropertyState {
                        present: true,
                        on_off: true,
                        abs_control: true,
                        abs_value: from_control(connection.get(id)?) / scale,
                        ..PropertyState::default()
                    },
                    None => return Ok(self.emulated(kind)),
                }
            }
            PropertyKind::Brightness | PropertyKind::Sharpness => {
                let id = if kind == PropertyKind::Brightness {
                    CID_BRIGHTNESS
                } else {
                    CID_SHARPNESS
                };
                if !connection.has(id) {
                    return Ok(self.emulated(kind));
                }
                PropertyState {
                    present: true,
                    on_off: true,
                    value_a: to_code(connection.get(id)?),
                    ..PropertyState::default()
                }
            }
            PropertyKind::Shutter | PropertyKind::WhiteBalance => return Ok(self.emulated(kind)),
        };
        Ok(state)
    }

    fn set_property(&mut self, kind: PropertyKind, state: &PropertyState) -> Result<()> {
        let connection = self.connection()?;
        match kind {
            PropertyKind::FrameRate => {
                connection.framerate_limited = state.on_off;
                if state.on_off {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let fps = state.abs_value.round().max(1.0) as u32;
                    connection
                        .device
                        .set_params(&Parameters::with_fps(fps))
                        .map_err(|err| io_error("write stream parameters", &err))?;
                } else if let Some(fps) = connection
                    .device
                    .format()
                    .ok()
                    .and_then(|f| connection.max_framerate(f.width, f.height))
                {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let fps = fps.round().max(1.0) as u32;
                    connection
                        .device
                        .set_params(&Parameters::with_fps(fps))
                        .map_err(|err| io_error("write stream parameters", &err))?;
                }
                return Ok(());
            }
            PropertyKind::Shutter if connection.has(CID_EXPOSURE_ABSOLUTE) => {
                if connection.has(CID_EXPOSURE_AUTO) {
                    let mode = if state.auto_manual {
                        EXPOSURE_APERTURE_PRIORITY
                    } else {
                        EXPOSURE_MANUAL
                    };
                    connection.set(CID_EXPOSURE_AUTO, mode)?;
                }
                if !state.auto_manual {
                    connection.set(
                        CID_EXPOSURE_ABSOLUTE,
                        to_control(state.abs_value * EXPOSURE_UNITS_PER_MS),
                    )?;
                }
                return Ok(());
            }
            PropertyKind::WhiteBalance
                if connection.has(CID_RED_BALANCE) && connection.has(CID_BLUE_BALANCE) =>
            {
                if connection.has(CID_AUTO_WHITE_BALANCE) {
                    connection.set(CID_AUTO_WHITE_BALANCE, i64::from(state.auto_manual))?;
                }
                if state.one_push && connection.has(CID_DO_WHITE_BALANCE) {
                    connection.set(CID_DO_WHITE_BALANCE, 1)?;
                } else if !state.auto_manual {
                    connection.set(CID_RED_BALANCE, i64::from(state.value_a))?;
                    connection.set(CID_BLUE_BALANCE, i64::from(state.value_b))?;
                }
                return Ok(());
            }
            PropertyKind::Gain | PropertyKind::Saturation | PropertyKind::Gamma => {
                if let Some((id, scale)) =
                    absolute_control(kind).filter(|&(id, _)| connection.has(id))
                {
                    if state.on_off {
                        connection.set(id, to_control(state.abs_value * scale))?;
                    }
                    return Ok(());
                }
            }
            PropertyKind::Brightness | PropertyKind::Sharpness => {
                let id = if kind == PropertyKind::Brightness {
                    CID_BRIGHTNESS
                } else {
                    CID_SHARPNESS
                };
                if connection.has(id) {
                    return connection.set(id, i64::from(state.value_a));
                }
            }
            PropertyKind::Shutter | PropertyKind::WhiteBalance => {}
        }

        debug!(?kind, "property not implemented by device, caching locally");
        self.emulated.insert(
            kind,
            PropertyState {
                present: false,
                one_push: false,
                ..*state
            },
        );
        Ok(())
    }

    fn read_register(&mut self, address: u32) -> Result<u32> {
        Err(CameraError::RegisterAccessFailed {
            address,
            message: "V4L2 devices expose no register space".to_owned(),
        })
    }

    fn write_register(&mut self, address: u32, _value: u32) -> Result<()> {
        Err(CameraError::RegisterAccessFailed {
            address,
            message: "V4L2 devices expose no register space".to_owned(),
        })
    }

    fn validate_format(&mut self, settings: &ImageSettings) -> Result<FormatValidation> {
        let connection = self.connection()?;
        let fourcc = match settings.pixel_format {
            PixelFormat::Rgb8 => rgb_fourcc(),
            PixelFormat::Mono8 => grey_fourcc(),
        };
        let sizes = connection.sizes(fourcc);
        let valid = sizes.is_empty()
            || sizes.iter().any(|&(min_w, min_h, max_w, max_h)| {
                (min_w..=max_w).contains(&settings.width)
                    && (min_h..=max_h).contains(&settings.height)
            });
        Ok(FormatValidation {
            valid,
            recommended_packet_bytes: 0,
        })
    }

    fn set_format(&mut self, settings: &ImageSettings, _packet_bytes: u32) -> Result<()> {
        let connection = self.connection()?;
        if connection.stream.is_some() {
            return Err(CameraError::FormatConfigurationInvalid(
                "image format cannot change while capturing".to_owned(),
            ));
        }
        let fourcc = match settings.pixel_format {
            PixelFormat::Rgb8 => rgb_fourcc(),
            PixelFormat::Mono8 => grey_fourcc(),
        };
        let applied = connection
            .device
            .set_format(&Format::new(settings.width, settings.height, fourcc))
            .map_err(|err| CameraError::FormatConfigurationInvalid(err.to_string()))?;
        if applied.fourcc != fourcc {
            return Err(CameraError::FormatConfigurationInvalid(format!(
                "device chose {} instead of {fourcc}",
                applied.fourcc
            )));
        }
        connection.mode = settings.mode;
        debug!(format = %applied, mode = ?settings.mode, "V4L2 format applied");
        Ok(())
    }

    fn format(&mut self) -> Result<ImageSettings> {
        let connection = self.connection()?;
        let format = connection
            .device
            .format()
            .map_err(|err| io_error("read format", &err))?;
        let pixel_format = if format.fourcc == grey_fourcc() {
            PixelFormat::Mono8
        } else if format.fourcc == rgb_fourcc() {
            PixelFormat::Rgb8
        } else {
            return Err(CameraError::FormatConfigurationInvalid(format!(
                "unsupported pixel format {}",
                format.fourcc
            )));
        };
        Ok(ImageSettings {
            mode: connection.mode,
            offset_x: 0,
            offset_y: 0,
            width: format.width,
            height: format.height,
            pixel_format,
        })
    }

    fn enable_lut(&mut self, enabled: bool) -> Result<()> {
        self.connection()?;
        self.lut.enabled = enabled;
        Ok(())
    }

    fn set_active_lut_bank(&mut self, bank: u32) -> Result<()> {
        self.connection()?;
        self.lut.active_bank = bank;
        Ok(())
    }

    fn active_lut_bank(&mut self) -> Result<u32> {
        self.connection()?;
        Ok(self.lut.active_bank)
    }

    fn set_lut_channel(&mut self, bank: u32, channel: LutChannel, table: &[u16]) -> Result<()> {
        self.connection()?;
        self.lut.tables.insert((bank, channel), table.to_vec());
        Ok(())
    }

    fn set_strobe(&mut self, _strobe: &StrobeSettings) -> Result<()> {
        self.connection()?;
        Err(CameraError::Device(
            "strobe output is not available over V4L2".to_owned(),
        ))
    }

    fn start_capture(&mut self) -> Result<()> {
        let connection = self.connection()?;
        if connection.stream.is_some() {
            return Err(CameraError::Device("capture already running".to_owned()));
        }
        let stream = Stream::with_buffers(&connection.device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|err| io_error("start stream", &err))?;
        connection.stream = Some(stream);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<()> {
        let connection = self.connection()?;
        // Dropping the stream turns streaming off and unmaps the buffers.
        if connection.stream.take().is_some() {
            debug!("V4L2 stream stopped");
        }
        Ok(())
    }

    fn retrieve_frame(&mut self) -> Result<RawFrame> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(CameraError::NotConnected)?;
        let format = connection
            .device
            .format()
            .map_err(|err| CameraError::FrameRetrievalFailed(err.to_string()))?;
        let stream = connection.stream.as_mut().ok_or_else(|| {
            CameraError::FrameRetrievalFailed("capture is not running".to_owned())
        })?;

        let (buffer, meta) = stream
            .next()
            .map_err(|err| CameraError::FrameRetrievalFailed(err.to_string()))?;
        let used = (meta.bytesused as usize).min(buffer.len());
        let mut data = buffer.get(..used).unwrap_or(buffer).to_vec();

        let pixel_format = if format.fourcc == grey_fourcc() {
            PixelFormat::Mono8
        } else {
            PixelFormat::Rgb8
        };
        self.lut.apply(&mut data, pixel_format);

        Ok(RawFrame {
            data,
            width: format.width,
            height: format.height,
            stride: format.stride,
            pixel_format,
        })
    }
}

/// Control id and unit scale of the absolute-valued properties.
const fn absolute_control(kind: PropertyKind) -> Option<(u32, f32)> {
    match kind {
        PropertyKind::Gain => Some((CID_GAIN, 1.0)),
        PropertyKind::Saturation => Some((CID_SATURATION, 1.0)),
        PropertyKind::Gamma => Some((CID_GAMMA, GAMMA_SCALE)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_lut_maps_through_active_bank() {
        let mut lut = SoftwareLut::default();
        let invert: Vec<u16> = (0..LUT_ENTRIES as u16).rev().collect();
        let identity: Vec<u16> = (0..LUT_ENTRIES as u16).collect();
        lut.tables.insert((1, LutChannel::Red), invert);
        lut.tables.insert((1, LutChannel::Green), identity.clone());
        lut.tables.insert((1, LutChannel::Blue), identity);

        let mut data = vec![0u8, 100, 255, 10, 20, 30];
        lut.apply(&mut data, PixelFormat::Rgb8);
        assert_eq!(data, vec![0, 100, 255, 10, 20, 30], "disabled LUT is a no-op");

        lut.enabled = true;
        lut.active_bank = 1;
        lut.apply(&mut data, PixelFormat::Rgb8);
        assert_eq!(data, vec![255, 100, 255, 245, 20, 30]);
    }

    #[test]
    fn test_map_sample_is_clamped() {
        assert_eq!(map_sample(&[1023; LUT_ENTRIES], 7), 255);
        assert_eq!(map_sample(&[], 7), 7);
    }

    #[test]
    fn test_driver_requires_connection() {
        let mut driver = V4l2Driver::new();
        assert!(matches!(
            driver.property(PropertyKind::Gain),
            Err(CameraError::NotConnected)
        ));
        assert!(matches!(
            driver.retrieve_frame(),
            Err(CameraError::NotConnected)
        ));
        assert!(driver.read_register(0x1A70).is_err());
        driver.disconnect().expect("disconnect without device is a no-op");
    }
}
