//! Frame pump: one raw frame in, one timestamped full-resolution buffer out.

use tracing::{error, trace, warn};

use crate::config::SourceConfig;
use crate::controller::{Marker, ParameterController, PendingMarkers};
use crate::geometry::{reconstruct, FrameGeometry, Reconstruction};
use crate::session::CameraSession;
use crate::traits::{CameraError, DeviceDriver, Result};

const MARKER_SIZE: u32 = 100;
const MARKER_SPACING: u32 = 150;

/// A produced video buffer with its timing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoBuffer {
    /// Pixel data, `stride * height` bytes.
    pub data: Vec<u8>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per row.
    pub stride: u32,
    /// Presentation timestamp, ns. Unset when the host stamps buffers.
    pub pts: Option<u64>,
    /// Decode timestamp, ns. Unset when the host stamps buffers.
    pub dts: Option<u64>,
    /// Frame duration, ns.
    pub duration: u64,
    /// Sequence number of this frame.
    pub offset: u64,
    /// Sequence number of the next frame.
    pub offset_end: u64,
    /// Parameter changes flagged on this frame.
    pub markers: PendingMarkers,
}

/// Result of one pump step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    /// A buffer for downstream.
    Buffer(VideoBuffer),
    /// The configured frame count was reached.
    EndOfStream,
}

/// Per-stream acquisition state.
#[derive(Debug, Clone)]
pub struct FramePump {
    num_buffers: Option<u64>,
    do_timestamp: bool,
    reconstruction: Reconstruction,
    overlay_markers: bool,
    frame_count: u64,
    last_timestamp_ns: u64,
}

impl FramePump {
    /// Pump configured from the source settings.
    #[must_use]
    pub const fn new(config: &SourceConfig) -> Self {
        Self {
            num_buffers: config.num_buffers,
            do_timestamp: config.do_timestamp,
            reconstruction: config.reconstruction,
            overlay_markers: config.overlay_markers,
            frame_count: 0,
            last_timestamp_ns: 0,
        }
    }

    /// Restart counting and timestamps at zero.
    pub fn reset(&mut self) {
        self.frame_count = 0;
        self.last_timestamp_ns = 0;
    }

    /// Frames produced so far.
    #[must_use]
    pub const fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Timestamp of the last produced frame, ns.
    #[must_use]
    pub const fn last_timestamp_ns(&self) -> u64 {
        self.last_timestamp_ns
    }

    /// Retrieve, reconstruct and stamp one frame.
    ///
    /// Retrieval failures end the stream and are returned. White-balance
    /// monitoring failures are only logged.
    pub fn create<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        controller: &mut ParameterController,
    ) -> Result<FlowOutcome> {
        let raw = session.retrieve_frame().map_err(|err| {
            error!(error = %err, frame = self.frame_count, "frame retrieval failed");
            err
        })?;

        let geometry = controller
            .geometry()
            .copied()
            .ok_or_else(|| {
                CameraError::FrameRetrievalFailed("frame geometry not configured".to_owned())
            })?
            .with_raw_pitch(raw.stride);
        if raw.width != geometry.raw_width || raw.height != geometry.raw_height {
            return Err(CameraError::FrameRetrievalFailed(format!(
                "device delivered {}x{}, expected {}x{}",
                raw.width, raw.height, geometry.raw_width, geometry.raw_height
            )));
        }

        let mut data = vec![0u8; geometry.image_size()];
        reconstruct(&geometry, self.reconstruction, &raw.data, &mut data)?;

        let markers = controller.take_markers();
        if self.overlay_markers {
            draw_markers(&geometry, markers, &mut data);
        }

        let duration = controller.frame_duration_ns();
        self.last_timestamp_ns += duration;
        let timestamp = (!self.do_timestamp).then_some(self.last_timestamp_ns);

        let offset = self.frame_count;
        self.frame_count += 1;
        trace!(offset, timestamp = self.last_timestamp_ns, duration, "frame");

        if self
            .num_buffers
            .is_some_and(|limit| self.frame_count >= limit)
        {
            return Ok(FlowOutcome::EndOfStream);
        }

        if let Err(err) = controller.tick_white_balance(session) {
            warn!(error = %err, "white balance monitoring failed");
        }

        Ok(FlowOutcome::Buffer(VideoBuffer {
            data,
            width: geometry.output_width,
            height: geometry.output_height,
            stride: geometry.output_pitch,
            pts: timestamp,
            dts: timestamp,
            duration,
            offset,
            offset_end: self.frame_count,
            markers,
        }))
    }
}

/// Paint a white square per raised marker along the bottom of the frame.
pub fn draw_markers(geometry: &FrameGeometry, markers: PendingMarkers, data: &mut [u8]) {
    let bpp = geometry.bytes_per_pixel as usize;
    let pitch = geometry.output_pitch as usize;
    let first_row = geometry.output_height.saturating_sub(MARKER_SIZE) as usize;

    for (slot, marker) in (0u32..).zip(Marker::ALL) {
        if !markers.contains(marker) {
            continue;
        }
        let left = (slot * MARKER_SPACING).min(geometry.output_width) as usize;
        let right = (slot * MARKER_SPACING + MARKER_SIZE).min(geometry.output_width) as usize;
        for row in data
            .chunks_mut(pitch)
            .take(geometry.output_height as usize)
            .skip(first_row)
        {
            if let Some(span) = row.get_mut(left * bpp..right * bpp) {
                span.fill(u8::MAX);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraSettings;
    use crate::geometry::Binning;
    use crate::mock::{MockDriver, MockHandle, TestPattern};
    use crate::traits::StrobeSettings;

    fn started(config: &SourceConfig) -> (CameraSession<MockDriver>, MockHandle, ParameterController) {
        let (driver, handle) = MockDriver::builder()
            .pattern(TestPattern::Solid(10, 20, 30))
            .build();
        let mut session = CameraSession::new(driver);
        session.open().expect("open should succeed");
        let mut controller = ParameterController::new(config.camera.clone());
        controller
            .apply_all(&mut session, &StrobeSettings::default(), false)
            .expect("startup should succeed");
        session.start_capture().expect("start should succeed");
        (session, handle, controller)
    }

    fn buffer(outcome: FlowOutcome) -> VideoBuffer {
        match outcome {
            FlowOutcome::Buffer(buffer) => buffer,
            FlowOutcome::EndOfStream => unreachable!("unexpected end of stream"),
        }
    }

    #[test]
    fn test_offsets_and_timestamps() {
        let config = SourceConfig::default();
        let (mut session, _handle, mut controller) = started(&config);
        let mut pump = FramePump::new(&config);

        let first = buffer(pump.create(&mut session, &mut controller).expect("frame 0"));
        let second = buffer(pump.create(&mut session, &mut controller).expect("frame 1"));

        assert_eq!((first.offset, first.offset_end), (0, 1));
        assert_eq!((second.offset, second.offset_end), (1, 2));
        assert_eq!(first.duration, 40_000_000);
        assert_eq!(first.pts, Some(40_000_000));
        assert_eq!(first.dts, first.pts);
        assert_eq!(second.pts, Some(80_000_000));
        assert_eq!(first.data.len(), (first.stride * first.height) as usize);
    }

    #[test]
    fn test_host_timestamping_leaves_pts_unset() {
        let config = SourceConfig {
            do_timestamp: true,
            ..SourceConfig::default()
        };
        let (mut session, _handle, mut controller) = started(&config);
        let mut pump = FramePump::new(&config);

        let frame = buffer(pump.create(&mut session, &mut controller).expect("frame"));
        assert_eq!(frame.pts, None);
        assert_eq!(frame.dts, None);
        assert_eq!(frame.duration, 40_000_000);
        assert_eq!(pump.last_timestamp_ns(), 40_000_000);
    }

    #[test]
    fn test_end_of_stream_at_limit() {
        let config = SourceConfig {
            num_buffers: Some(3),
            ..SourceConfig::default()
        };
        let (mut session, _handle, mut controller) = started(&config);
        let mut pump = FramePump::new(&config);

        for _ in 0..2 {
            assert!(matches!(
                pump.create(&mut session, &mut controller).expect("frame"),
                FlowOutcome::Buffer(_)
            ));
        }
        assert_eq!(
            pump.create(&mut session, &mut controller).expect("frame"),
            FlowOutcome::EndOfStream
        );
    }

    #[test]
    fn test_retrieval_failure_is_fatal() {
        let config = SourceConfig::default();
        let (mut session, handle, mut controller) = started(&config);
        let mut pump = FramePump::new(&config);
        handle.set_fail_retrieval(true);

        let err = pump
            .create(&mut session, &mut controller)
            .expect_err("retrieval should fail");
        assert!(matches!(err, CameraError::FrameRetrievalFailed(_)));
        assert_eq!(pump.frame_count(), 0);
    }

    #[test]
    fn test_markers_travel_with_first_frame() {
        let config = SourceConfig {
            overlay_markers: true,
            ..SourceConfig::default()
        };
        let (mut session, _handle, mut controller) = started(&config);
        let mut pump = FramePump::new(&config);

        let first = buffer(pump.create(&mut session, &mut controller).expect("frame"));
        assert!(first.markers.contains(Marker::ExposureChanged));
        assert!(first.markers.contains(Marker::GainChanged));
        assert!(first.markers.contains(Marker::BinningChanged));

        let bottom = ((first.height - 1) * first.stride) as usize;
        assert_eq!(&first.data[bottom..bottom + 3], &[255, 255, 255]);
        let gap = bottom + 120 * 3;
        assert_eq!(&first.data[gap..gap + 3], &[10, 20, 30]);
        let binning_square = bottom + 310 * 3;
        assert_eq!(&first.data[binning_square..binning_square + 3], &[255, 255, 255]);

        let second = buffer(pump.create(&mut session, &mut controller).expect("frame"));
        assert!(second.markers.is_empty());
        assert_eq!(&second.data[bottom..bottom + 3], &[10, 20, 30]);
    }

    #[test]
    fn test_binned_frame_keeps_output_size() {
        let config = SourceConfig {
            camera: CameraSettings {
                binning: Binning::Four,
                ..CameraSettings::default()
            },
            ..SourceConfig::default()
        };
        let (mut session, _handle, mut controller) = started(&config);
        let mut pump = FramePump::new(&config);

        let frame = buffer(pump.create(&mut session, &mut controller).expect("frame"));
        assert_eq!((frame.width, frame.height), (1288, 964));
        assert!(frame.data[..(2 * frame.stride) as usize].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_draw_markers_clips_to_frame() {
        let geometry = FrameGeometry::new(
            Binning::One,
            crate::geometry::RawMode {
                sensor_width: 120,
                sensor_height: 50,
                raw_width: 120,
                raw_height: 50,
            },
            crate::traits::PixelFormat::Rgb8,
        )
        .expect("geometry");
        let mut data = vec![0u8; geometry.image_size()];
        let mut markers = PendingMarkers::default();
        markers.insert(Marker::GainChanged);
        draw_markers(&geometry, markers, &mut data);

        assert!(data[..150 * 3].iter().all(|&b| b == 0));
        assert!(data[..(120 * 3)].iter().all(|&b| b == 0));
        let row = &data[(10 * 120 * 3) as usize..(11 * 120 * 3) as usize];
        assert!(row.iter().all(|&b| b == 0));
    }
}
