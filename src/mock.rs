//! Mock camera driver for testing without hardware.
//!
//! [`MockDriver`] behaves like a small register-and-property machine. A
//! [`MockHandle`] sharing the same state lets tests inspect what was written
//! and script device-side behaviour (one-push completion, failures).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::traits::{
    CameraError, CameraInfo, DeviceDriver, FormatValidation, ImageSettings, LutChannel,
    PixelFormat, PropertyKind, PropertyState, RawFrame, Result, StrobeSettings, VideoMode,
};

const ROI_FLAGS_REGISTER: u32 = 0x1A70;
const ROI_OFFSET_REGISTER: u32 = 0x1A74;
const ROI_PRESENCE_BIT: u32 = 0x8000_0000;
const REGISTER_SPACE_BASE: u32 = 0x00F0_0000;
const MOCK_ROI_BASE: u32 = 0x2000;
const MOCK_PACKET_BYTES: u32 = 4096;

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// Eight vertical colour bars.
    ColorBars,
    /// Horizontal grey gradient from dark to light.
    Gradient,
    /// Solid colour with the given R, G, B values.
    Solid(u8, u8, u8),
    /// Red and green carry the low byte of x and y, blue the frame counter.
    Coordinates,
}

/// Mutating calls the driver received, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    /// `connect(index)`.
    Connect(u32),
    /// `disconnect()`.
    Disconnect,
    /// `set_property(kind, state)`.
    SetProperty {
        /// Property addressed.
        kind: PropertyKind,
        /// State written.
        state: PropertyState,
    },
    /// `write_register(address, value)`.
    WriteRegister {
        /// Register address.
        address: u32,
        /// Value written.
        value: u32,
    },
    /// `set_format(settings, packet_bytes)`.
    SetFormat {
        /// Settings applied.
        settings: ImageSettings,
        /// Packet size requested.
        packet_bytes: u32,
    },
    /// `enable_lut(enabled)`.
    EnableLut(bool),
    /// `set_active_lut_bank(bank)`.
    SetActiveLutBank(u32),
    /// `set_lut_channel(bank, channel, _)`.
    SetLutChannel {
        /// Bank addressed.
        bank: u32,
        /// Channel addressed.
        channel: LutChannel,
    },
    /// `set_strobe(_)`.
    SetStrobe,
    /// `start_capture()`.
    StartCapture,
    /// `stop_capture()`.
    StopCapture,
}

#[derive(Debug)]
struct MockState {
    camera_count: u32,
    fail_connect: bool,
    fail_registers: bool,
    fail_retrieval: bool,
    reject_formats: bool,
    failing_properties: HashSet<PropertyKind>,
    connected: bool,
    capturing: bool,
    info: CameraInfo,
    properties: HashMap<PropertyKind, PropertyState>,
    registers: HashMap<u32, u32>,
    format: ImageSettings,
    lut_enabled: bool,
    active_lut_bank: u32,
    lut_tables: HashMap<(u32, LutChannel), Vec<u16>>,
    strobe: Option<StrobeSettings>,
    pattern: TestPattern,
    stride_padding: u32,
    shutter_step_ms: Option<f32>,
    one_push_after: Option<u32>,
    one_push_remaining: Option<u32>,
    one_push_result: (u32, u32),
    frames_delivered: u64,
    calls: Vec<DriverCall>,
}

impl MockState {
    fn property_mut(&mut self, kind: PropertyKind) -> Result<&mut PropertyState> {
        if self.failing_properties.contains(&kind) {
            return Err(CameraError::PropertyAccessFailed {
                kind,
                message: "injected property failure".to_owned(),
            });
        }
        Ok(self.properties.entry(kind).or_default())
    }

    fn finish_one_push(&mut self) {
        let (red, blue) = self.one_push_result;
        let wb = self.properties.entry(PropertyKind::WhiteBalance).or_default();
        wb.one_push = false;
        wb.value_a = red;
        wb.value_b = blue;
        self.one_push_remaining = None;
    }

    fn advance_one_push(&mut self) {
        match self.one_push_remaining {
            Some(0) => self.finish_one_push(),
            Some(n) => self.one_push_remaining = Some(n - 1),
            None => {}
        }
    }

    fn check_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(CameraError::NotConnected)
        }
    }

    fn check_registers(&self, address: u32) -> Result<()> {
        self.check_connected()?;
        if self.fail_registers {
            return Err(CameraError::RegisterAccessFailed {
                address,
                message: "injected register failure".to_owned(),
            });
        }
        Ok(())
    }
}

/// Builder for a [`MockDriver`] and its [`MockHandle`].
#[derive(Debug, Clone)]
pub struct MockDriverBuilder {
    camera_count: u32,
    fail_connect: bool,
    fail_registers: bool,
    fail_retrieval: bool,
    reject_formats: bool,
    failing_properties: HashSet<PropertyKind>,
    sensor_resolution: String,
    pattern: TestPattern,
    stride_padding: u32,
    shutter_step_ms: Option<f32>,
    one_push_after: Option<u32>,
    one_push_result: (u32, u32),
}

impl Default for MockDriverBuilder {
    fn default() -> Self {
        Self {
            camera_count: 1,
            fail_connect: false,
            fail_registers: false,
            fail_retrieval: false,
            reject_formats: false,
            failing_properties: HashSet::new(),
            sensor_resolution: "1288x964".to_owned(),
            pattern: TestPattern::Coordinates,
            stride_padding: 0,
            shutter_step_ms: None,
            one_push_after: None,
            one_push_result: (512, 640),
        }
    }
}

impl MockDriverBuilder {
    /// Number of cameras enumeration reports.
    #[must_use]
    pub const fn camera_count(mut self, count: u32) -> Self {
        self.camera_count = count;
        self
    }

    /// Make `connect` fail.
    #[must_use]
    pub const fn fail_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Make every access to `kind` fail.
    #[must_use]
    pub fn fail_property(mut self, kind: PropertyKind) -> Self {
        self.failing_properties.insert(kind);
        self
    }

    /// Make every register access fail.
    #[must_use]
    pub const fn fail_registers(mut self) -> Self {
        self.fail_registers = true;
        self
    }

    /// Make frame retrieval fail.
    #[must_use]
    pub const fn fail_retrieval(mut self) -> Self {
        self.fail_retrieval = true;
        self
    }

    /// Report every image format as invalid.
    #[must_use]
    pub const fn reject_formats(mut self) -> Self {
        self.reject_formats = true;
        self
    }

    /// Sensor resolution string reported in the camera info.
    #[must_use]
    pub fn sensor_resolution(mut self, resolution: &str) -> Self {
        resolution.clone_into(&mut self.sensor_resolution);
        self
    }

    /// Pattern painted into delivered frames.
    #[must_use]
    pub const fn pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Extra bytes appended to every raw row.
    #[must_use]
    pub const fn stride_padding(mut self, bytes: u32) -> Self {
        self.stride_padding = bytes;
        self
    }

    /// Quantise written exposure times to multiples of `step`.
    #[must_use]
    pub const fn shutter_step_ms(mut self, step: f32) -> Self {
        self.shutter_step_ms = Some(step);
        self
    }

    /// Complete a one-push white balance after `frames` delivered frames.
    /// Without this, one-push never completes on its own.
    #[must_use]
    pub const fn one_push_after(mut self, frames: u32) -> Self {
        self.one_push_after = Some(frames);
        self
    }

    /// Red and blue gains a completed one-push settles on.
    #[must_use]
    pub const fn one_push_result(mut self, red: u32, blue: u32) -> Self {
        self.one_push_result = (red, blue);
        self
    }

    /// Build the driver and a handle onto its state.
    #[must_use]
    pub fn build(self) -> (MockDriver, MockHandle) {
        let (width, height) = parse_resolution(&self.sensor_resolution);
        let state = MockState {
            camera_count: self.camera_count,
            fail_connect: self.fail_connect,
            fail_registers: self.fail_registers,
            fail_retrieval: self.fail_retrieval,
            reject_formats: self.reject_formats,
            failing_properties: self.failing_properties,
            connected: false,
            capturing: false,
            info: CameraInfo {
                model: "Mock Camera".to_owned(),
                vendor: "mock".to_owned(),
                sensor_info: "Mock RGB sensor".to_owned(),
                sensor_resolution: self.sensor_resolution,
                serial_number: 1,
            },
            properties: default_properties(),
            registers: HashMap::from([
                (ROI_FLAGS_REGISTER, ROI_PRESENCE_BIT),
                (
                    ROI_OFFSET_REGISTER,
                    (REGISTER_SPACE_BASE + MOCK_ROI_BASE) / 4,
                ),
                (MOCK_ROI_BASE, (8 << 16) | 2),
                (MOCK_ROI_BASE + 0x4, (8 << 16) | 2),
            ]),
            format: ImageSettings {
                mode: VideoMode::Mode0,
                offset_x: 0,
                offset_y: 0,
                width,
                height,
                pixel_format: PixelFormat::Rgb8,
            },
            lut_enabled: false,
            active_lut_bank: 0,
            lut_tables: HashMap::new(),
            strobe: None,
            pattern: self.pattern,
            stride_padding: self.stride_padding,
            shutter_step_ms: self.shutter_step_ms,
            one_push_after: self.one_push_after,
            one_push_remaining: None,
            one_push_result: self.one_push_result,
            frames_delivered: 0,
            calls: Vec::new(),
        };
        let state = Arc::new(Mutex::new(state));
        (
            MockDriver {
                state: Arc::clone(&state),
            },
            MockHandle { state },
        )
    }
}

/// In-memory camera implementing [`DeviceDriver`].
#[derive(Debug)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    /// Start configuring a mock camera.
    #[must_use]
    pub fn builder() -> MockDriverBuilder {
        MockDriverBuilder::default()
    }
}

impl DeviceDriver for MockDriver {
    fn camera_count(&mut self) -> Result<u32> {
        Ok(self.state.lock().camera_count)
    }

    fn connect(&mut self, index: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::Connect(index));
        if state.fail_connect || index >= state.camera_count {
            return Err(CameraError::Device(format!("no camera at index {index}")));
        }
        state.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::Disconnect);
        state.connected = false;
        state.capturing = false;
        Ok(())
    }

    fn camera_info(&mut self) -> Result<CameraInfo> {
        let state = self.state.lock();
        state.check_connected()?;
        Ok(state.info.clone())
    }

    fn property(&mut self, kind: PropertyKind) -> Result<PropertyState> {
        let mut state = self.state.lock();
        state.check_connected()?;
        state.property_mut(kind).map(|property| *property)
    }

    fn set_property(&mut self, kind: PropertyKind, new: &PropertyState) -> Result<()> {
        let mut state = self.state.lock();
        state.check_connected()?;
        state.calls.push(DriverCall::SetProperty { kind, state: *new });

        let step = state.shutter_step_ms;
        let arm = state.one_push_after;
        let property = state.property_mut(kind)?;
        let starting_one_push = kind == PropertyKind::WhiteBalance && new.one_push && !property.one_push;
        *property = *new;
        property.present = true;
        if kind == PropertyKind::Shutter {
            if let Some(step) = step.filter(|step| *step > 0.0) {
                property.abs_value = (new.abs_value / step).round() * step;
            }
        }

        if starting_one_push {
            state.one_push_remaining = arm;
        } else if kind == PropertyKind::WhiteBalance && !new.one_push {
            state.one_push_remaining = None;
        }
        Ok(())
    }

    fn read_register(&mut self, address: u32) -> Result<u32> {
        let state = self.state.lock();
        state.check_registers(address)?;
        Ok(state.registers.get(&address).copied().unwrap_or_default())
    }

    fn write_register(&mut self, address: u32, value: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.check_registers(address)?;
        state.calls.push(DriverCall::WriteRegister { address, value });
        state.registers.insert(address, value);
        Ok(())
    }

    fn validate_format(&mut self, settings: &ImageSettings) -> Result<FormatValidation> {
        let state = self.state.lock();
        state.check_connected()?;
        Ok(FormatValidation {
            valid: !state.reject_formats && settings.width > 0 && settings.height > 0,
            recommended_packet_bytes: MOCK_PACKET_BYTES,
        })
    }

    fn set_format(&mut self, settings: &ImageSettings, packet_bytes: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.check_connected()?;
        state.calls.push(DriverCall::SetFormat {
            settings: *settings,
            packet_bytes,
        });
        if state.capturing {
            return Err(CameraError::Device(
                "format cannot change while capturing".to_owned(),
            ));
        }
        state.format = *settings;
        Ok(())
    }

    fn format(&mut self) -> Result<ImageSettings> {
        let state = self.state.lock();
        state.check_connected()?;
        Ok(state.format)
    }

    fn enable_lut(&mut self, enabled: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.check_connected()?;
        state.calls.push(DriverCall::EnableLut(enabled));
        state.lut_enabled = enabled;
        Ok(())
    }

    fn set_active_lut_bank(&mut self, bank: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.check_connected()?;
        state.calls.push(DriverCall::SetActiveLutBank(bank));
        state.active_lut_bank = bank;
        Ok(())
    }

    fn active_lut_bank(&mut self) -> Result<u32> {
        let state = self.state.lock();
        state.check_connected()?;
        Ok(state.active_lut_bank)
    }

    fn set_lut_channel(&mut self, bank: u32, channel: LutChannel, table: &[u16]) -> Result<()> {
        let mut state = self.state.lock();
        state.check_connected()?;
        state.calls.push(DriverCall::SetLutChannel { bank, channel });
        state.lut_tables.insert((bank, channel), table.to_vec());
        Ok(())
    }

    fn set_strobe(&mut self, strobe: &StrobeSettings) -> Result<()> {
        let mut state = self.state.lock();
        state.check_connected()?;
        state.calls.push(DriverCall::SetStrobe);
        state.strobe = Some(*strobe);
        Ok(())
    }

    fn start_capture(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.check_connected()?;
        state.calls.push(DriverCall::StartCapture);
        if state.capturing {
            return Err(CameraError::Device("capture already running".to_owned()));
        }
        state.capturing = true;
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.check_connected()?;
        state.calls.push(DriverCall::StopCapture);
        state.capturing = false;
        Ok(())
    }

    fn retrieve_frame(&mut self) -> Result<RawFrame> {
        let mut state = self.state.lock();
        state.check_connected()?;
        if !state.capturing {
            return Err(CameraError::FrameRetrievalFailed(
                "capture is not running".to_owned(),
            ));
        }
        if state.fail_retrieval {
            return Err(CameraError::FrameRetrievalFailed(
                "injected retrieval failure".to_owned(),
            ));
        }

        let format = state.format;
        let stride = format.width * format.pixel_format.bytes_per_pixel() + state.stride_padding;
        let data = generate_test_frame(&format, stride, state.pattern, state.frames_delivered);
        state.frames_delivered += 1;
        state.advance_one_push();

        Ok(RawFrame {
            data,
            width: format.width,
            height: format.height,
            stride,
            pixel_format: format.pixel_format,
        })
    }
}

/// Shared view onto a [`MockDriver`]'s state for assertions and scripting.
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Mutating calls received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Current device-side state of a property.
    #[must_use]
    pub fn property(&self, kind: PropertyKind) -> PropertyState {
        self.state
            .lock()
            .properties
            .get(&kind)
            .copied()
            .unwrap_or_default()
    }

    /// Overwrite a property as if the device changed it.
    pub fn set_property(&self, kind: PropertyKind, property: PropertyState) {
        self.state.lock().properties.insert(kind, property);
    }

    /// Current value of a register (0 when never written).
    #[must_use]
    pub fn register(&self, address: u32) -> u32 {
        self.state
            .lock()
            .registers
            .get(&address)
            .copied()
            .unwrap_or_default()
    }

    /// Base address of the ROI register block.
    #[must_use]
    pub fn roi_base(&self) -> u32 {
        self.register(ROI_OFFSET_REGISTER)
            .wrapping_mul(4)
            .wrapping_sub(REGISTER_SPACE_BASE)
    }

    /// Whether the LUT feature is switched on.
    #[must_use]
    pub fn lut_enabled(&self) -> bool {
        self.state.lock().lut_enabled
    }

    /// Selected LUT bank.
    #[must_use]
    pub fn active_lut_bank(&self) -> u32 {
        self.state.lock().active_lut_bank
    }

    /// Table last uploaded to `bank`/`channel`.
    #[must_use]
    pub fn lut_table(&self, bank: u32, channel: LutChannel) -> Option<Vec<u16>> {
        self.state.lock().lut_tables.get(&(bank, channel)).cloned()
    }

    /// Strobe configuration last written.
    #[must_use]
    pub fn strobe(&self) -> Option<StrobeSettings> {
        self.state.lock().strobe
    }

    /// Image settings currently applied.
    #[must_use]
    pub fn format(&self) -> ImageSettings {
        self.state.lock().format
    }

    /// Whether the driver is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Whether capture is running.
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.state.lock().capturing
    }

    /// Frames delivered since the driver was built.
    #[must_use]
    pub fn frames_delivered(&self) -> u64 {
        self.state.lock().frames_delivered
    }

    /// Complete a running one-push white balance immediately.
    pub fn finish_one_push(&self) {
        self.state.lock().finish_one_push();
    }

    /// Toggle injected retrieval failures.
    pub fn set_fail_retrieval(&self, fail: bool) {
        self.state.lock().fail_retrieval = fail;
    }

    /// Toggle injected failures for one property.
    pub fn set_fail_property(&self, kind: PropertyKind, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_properties.insert(kind);
        } else {
            state.failing_properties.remove(&kind);
        }
    }
}

fn default_properties() -> HashMap<PropertyKind, PropertyState> {
    let absolute = |value: f32| PropertyState {
        present: true,
        on_off: true,
        abs_control: true,
        abs_value: value,
        ..PropertyState::default()
    };
    let integer = |value: u32| PropertyState {
        present: true,
        on_off: true,
        value_a: value,
        ..PropertyState::default()
    };

    HashMap::from([
        (PropertyKind::Shutter, absolute(40.0)),
        (PropertyKind::Gain, absolute(0.0)),
        (PropertyKind::Brightness, integer(15)),
        (PropertyKind::Saturation, absolute(100.0)),
        (PropertyKind::Sharpness, integer(1024)),
        (
            PropertyKind::WhiteBalance,
            PropertyState {
                value_b: 727,
                ..integer(425)
            },
        ),
        (PropertyKind::Gamma, absolute(1.0)),
        (PropertyKind::FrameRate, absolute(25.0)),
    ])
}

fn parse_resolution(resolution: &str) -> (u32, u32) {
    resolution
        .split_once('x')
        .and_then(|(w, h)| Some((w.trim().parse().ok()?, h.trim().parse().ok()?)))
        .unwrap_or((0, 0))
}

/// Render one frame of `pattern`; bytes past the image width in each row stay zero.
fn generate_test_frame(format: &ImageSettings, stride: u32, pattern: TestPattern, frame: u64) -> Vec<u8> {
    let bpp = format.pixel_format.bytes_per_pixel() as usize;
    let width = format.width as usize;
    let stride = stride as usize;
    let mut data = vec![0u8; stride * format.height as usize];

    for (y, row) in data.chunks_exact_mut(stride).enumerate() {
        for (x, pixel) in row.chunks_mut(bpp).take(width).enumerate() {
            let rgb = pattern_pixel(pattern, x, y, width, frame);
            if bpp == 1 {
                pixel.fill(rgb[1]);
            } else {
                for (dst, src) in pixel.iter_mut().zip(rgb) {
                    *dst = src;
                }
            }
        }
    }

    data
}

#[allow(clippy::cast_possible_truncation)]
fn pattern_pixel(pattern: TestPattern, x: usize, y: usize, width: usize, frame: u64) -> [u8; 3] {
    const BARS: [[u8; 3]; 8] = [
        [255, 255, 255],
        [255, 255, 0],
        [0, 255, 255],
        [0, 255, 0],
        [255, 0, 255],
        [255, 0, 0],
        [0, 0, 255],
        [0, 0, 0],
    ];

    match pattern {
        TestPattern::ColorBars => {
            let bar_width = (width / 8).max(1);
            BARS.get(x / bar_width).copied().unwrap_or([0; 3])
        }
        TestPattern::Gradient => {
            let value = (x * 255 / width.max(1)) as u8;
            [value; 3]
        }
        TestPattern::Solid(r, g, b) => [r, g, b],
        TestPattern::Coordinates => [x as u8, y as u8, frame as u8],
    }
}
