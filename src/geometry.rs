//! Frame geometry and reconstruction of full-resolution frames from binned ones.
//!
//! The consumer always sees the full sensor size. Binned readouts are
//! expanded back by pixel replication; when a binning mode is not an exact
//! divisor of the sensor, the image is centred vertically and the remaining
//! rows and trailing columns are filled with black.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::traits::{CameraError, PixelFormat, Result, VideoMode};

/// Sensor binning factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Binning {
    /// Full resolution.
    #[default]
    One,
    /// 2x2 binning.
    Two,
    /// 4x4 binning.
    Four,
}

impl Binning {
    /// Linear reduction factor.
    #[must_use]
    pub const fn factor(self) -> u32 {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 4,
        }
    }

    /// Acquisition mode delivering this binning level.
    #[must_use]
    pub const fn video_mode(self) -> VideoMode {
        match self {
            Self::One => VideoMode::Mode0,
            Self::Two => VideoMode::Mode1,
            Self::Four => VideoMode::Mode5,
        }
    }
}

impl TryFrom<u32> for Binning {
    type Error = CameraError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            4 => Ok(Self::Four),
            other => Err(CameraError::Config(format!(
                "binning must be 1, 2 or 4, got {other}"
            ))),
        }
    }
}

impl From<Binning> for u32 {
    fn from(binning: Binning) -> Self {
        binning.factor()
    }
}

impl fmt::Display for Binning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.factor())
    }
}

/// Sensor and raw dimensions for one binning level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMode {
    /// Native sensor width.
    pub sensor_width: u32,
    /// Native sensor height.
    pub sensor_height: u32,
    /// Width delivered by the device.
    pub raw_width: u32,
    /// Height delivered by the device.
    pub raw_height: u32,
}

/// Raw sizes of known sensors: (resolution, bin-2 size, bin-4 size).
///
/// Bin-4 sizes of these sensors are not exact quarters.
const KNOWN_SENSORS: [(&str, (u32, u32), (u32, u32)); 2] = [
    ("1288x964", (644, 482), (320, 240)),
    ("808x608", (404, 304), (200, 122)),
];

/// Look up the raw acquisition size for a sensor resolution string.
pub fn raw_mode(sensor_resolution: &str, binning: Binning) -> Result<RawMode> {
    let (sensor_width, sensor_height) = parse_resolution(sensor_resolution)?;

    let known = KNOWN_SENSORS
        .iter()
        .find(|(name, _, _)| *name == sensor_resolution);

    let (raw_width, raw_height) = match (binning, known) {
        (Binning::One, _) => (sensor_width, sensor_height),
        (Binning::Two, Some((_, half, _))) => *half,
        (Binning::Four, Some((_, _, quarter))) => *quarter,
        (_, None) => (
            sensor_width / binning.factor(),
            sensor_height / binning.factor(),
        ),
    };

    Ok(RawMode {
        sensor_width,
        sensor_height,
        raw_width,
        raw_height,
    })
}

fn parse_resolution(text: &str) -> Result<(u32, u32)> {
    let invalid = || {
        CameraError::FormatConfigurationInvalid(format!("unrecognised sensor resolution {text:?}"))
    };
    let (width, height) = text.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
    let width: u32 = width.trim().parse().map_err(|_| invalid())?;
    let height: u32 = height.trim().parse().map_err(|_| invalid())?;
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    Ok((width, height))
}

/// Derived frame layout for the current binning level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    /// Binning level this geometry was derived for.
    pub binning: Binning,
    /// Native sensor width.
    pub sensor_width: u32,
    /// Native sensor height.
    pub sensor_height: u32,
    /// Width delivered by the device.
    pub raw_width: u32,
    /// Height delivered by the device.
    pub raw_height: u32,
    /// Output width, always the sensor width.
    pub output_width: u32,
    /// Output height, always the sensor height.
    pub output_height: u32,
    /// Bytes per pixel in both raw and output frames.
    pub bytes_per_pixel: u32,
    /// Bytes per raw row.
    pub raw_pitch: u32,
    /// Bytes per output row.
    pub output_pitch: u32,
}

impl FrameGeometry {
    /// Derive the geometry for a raw mode. Output rows are tightly packed.
    pub fn new(binning: Binning, mode: RawMode, pixel_format: PixelFormat) -> Result<Self> {
        let factor = binning.factor();
        if mode.raw_width == 0 || mode.raw_height == 0 {
            return Err(CameraError::FormatConfigurationInvalid(format!(
                "empty raw mode {}x{}",
                mode.raw_width, mode.raw_height
            )));
        }
        if mode.raw_width * factor > mode.sensor_width
            || mode.raw_height * factor > mode.sensor_height
        {
            return Err(CameraError::FormatConfigurationInvalid(format!(
                "{}x{} binned by {factor} exceeds sensor {}x{}",
                mode.raw_width, mode.raw_height, mode.sensor_width, mode.sensor_height
            )));
        }

        let bytes_per_pixel = pixel_format.bytes_per_pixel();
        Ok(Self {
            binning,
            sensor_width: mode.sensor_width,
            sensor_height: mode.sensor_height,
            raw_width: mode.raw_width,
            raw_height: mode.raw_height,
            output_width: mode.sensor_width,
            output_height: mode.sensor_height,
            bytes_per_pixel,
            raw_pitch: mode.raw_width * bytes_per_pixel,
            output_pitch: mode.sensor_width * bytes_per_pixel,
        })
    }

    /// Use a wider output row stride, e.g. one negotiated with the host.
    #[must_use]
    pub fn with_output_pitch(mut self, pitch: u32) -> Self {
        self.output_pitch = pitch.max(self.output_width * self.bytes_per_pixel);
        self
    }

    /// Use the row stride the device actually delivered.
    #[must_use]
    pub fn with_raw_pitch(mut self, pitch: u32) -> Self {
        self.raw_pitch = pitch.max(self.raw_width * self.bytes_per_pixel);
        self
    }

    /// Bytes in one output frame.
    #[must_use]
    pub const fn image_size(&self) -> usize {
        self.output_pitch as usize * self.output_height as usize
    }

    /// Bytes in one raw frame.
    #[must_use]
    pub const fn raw_size(&self) -> usize {
        self.raw_pitch as usize * self.raw_height as usize
    }

    /// Blank rows above the replicated image.
    #[must_use]
    pub const fn top_padding(&self) -> u32 {
        self.output_height
            .saturating_sub(self.binning.factor() * self.raw_height)
            / 2
    }

    /// Blank pixels at the end of each replicated row.
    #[must_use]
    pub const fn trailing_columns(&self) -> u32 {
        self.output_width
            .saturating_sub(self.binning.factor() * self.raw_width)
    }
}

/// How binned frames are expanded to full resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reconstruction {
    /// Nearest-neighbour replication into NxN blocks.
    #[default]
    Duplicate,
    /// Experimental bilinear interpolation. Not validated; binning 2 only.
    Interpolate,
}

/// Expand `raw` into the full-resolution `output` buffer.
pub fn reconstruct(
    geometry: &FrameGeometry,
    strategy: Reconstruction,
    raw: &[u8],
    output: &mut [u8],
) -> Result<()> {
    if raw.len() < geometry.raw_size() {
        return Err(CameraError::FrameRetrievalFailed(format!(
            "raw frame has {} bytes, expected {}",
            raw.len(),
            geometry.raw_size()
        )));
    }
    if output.len() < geometry.image_size() {
        return Err(CameraError::FrameRetrievalFailed(format!(
            "output buffer has {} bytes, expected {}",
            output.len(),
            geometry.image_size()
        )));
    }

    match (geometry.binning, strategy) {
        (Binning::One, _) => copy_rows(geometry, raw, output),
        (Binning::Two, Reconstruction::Interpolate) => interpolate_2x(geometry, raw, output),
        (Binning::Four, Reconstruction::Interpolate) => {
            warn!("interpolation is not available at binning 4, duplicating instead");
            duplicate(geometry, raw, output);
        }
        (_, Reconstruction::Duplicate) => duplicate(geometry, raw, output),
    }
    Ok(())
}

fn rows<'a>(buffer: &'a [u8], pitch: u32, width_bytes: u32) -> impl Iterator<Item = &'a [u8]> {
    buffer
        .chunks(pitch as usize)
        .map(move |row| row.get(..width_bytes as usize).unwrap_or(row))
}

fn copy_rows(geometry: &FrameGeometry, raw: &[u8], output: &mut [u8]) {
    let row_bytes = geometry.raw_pitch.min(geometry.output_pitch) as usize;
    for (dst, src) in output
        .chunks_mut(geometry.output_pitch as usize)
        .zip(raw.chunks(geometry.raw_pitch as usize))
        .take(geometry.output_height as usize)
    {
        let n = row_bytes.min(src.len()).min(dst.len());
        if let (Some(d), Some(s)) = (dst.get_mut(..n), src.get(..n)) {
            d.copy_from_slice(s);
        }
    }
}

fn duplicate(geometry: &FrameGeometry, raw: &[u8], output: &mut [u8]) {
    let factor = geometry.binning.factor() as usize;
    let bpp = geometry.bytes_per_pixel as usize;
    let pitch = geometry.output_pitch as usize;
    let top = geometry.top_padding() as usize;

    // One expanded row, reused for every output row of the block.
    let mut expanded = vec![0u8; pitch];
    let mut out_rows = output.chunks_mut(pitch).take(geometry.output_height as usize);

    for row in out_rows.by_ref().take(top) {
        row.fill(0);
    }

    for src in rows(raw, geometry.raw_pitch, geometry.raw_pitch).take(geometry.raw_height as usize)
    {
        expanded.fill(0);
        for (pixel, block) in src
            .chunks_exact(bpp)
            .zip(expanded.chunks_exact_mut(bpp * factor))
        {
            for dst in block.chunks_exact_mut(bpp) {
                dst.copy_from_slice(pixel);
            }
        }
        for row in out_rows.by_ref().take(factor) {
            let n = row.len().min(expanded.len());
            if let (Some(d), Some(s)) = (row.get_mut(..n), expanded.get(..n)) {
                d.copy_from_slice(s);
            }
        }
    }

    for row in out_rows {
        row.fill(0);
    }
}

/// Bilinear 2x upsampling: source pixels land on even coordinates, odd
/// columns average their horizontal neighbours and odd rows average the
/// rows above and below. The last row and column repeat the edge.
fn interpolate_2x(geometry: &FrameGeometry, raw: &[u8], output: &mut [u8]) {
    let bpp = geometry.bytes_per_pixel as usize;
    let pitch = geometry.output_pitch as usize;
    let raw_width = geometry.raw_width as usize;

    let widen = |src: &[u8], dst: &mut [u8]| {
        dst.fill(0);
        let pixels: Vec<&[u8]> = src.chunks_exact(bpp).take(raw_width).collect();
        for (x, pixel) in pixels.iter().enumerate() {
            let next = pixels.get(x + 1).unwrap_or(pixel);
            let base = 2 * x * bpp;
            for (c, (&a, &b)) in pixel.iter().zip(next.iter()).enumerate() {
                if let Some(v) = dst.get_mut(base + c) {
                    *v = a;
                }
                if let Some(v) = dst.get_mut(base + bpp + c) {
                    *v = average(a, b);
                }
            }
        }
    };

    let source_rows: Vec<&[u8]> = rows(raw, geometry.raw_pitch, geometry.raw_pitch)
        .take(geometry.raw_height as usize)
        .collect();
    let mut current = vec![0u8; pitch];
    let mut next = vec![0u8; pitch];
    let mut out_rows = output.chunks_mut(pitch);

    for (y, src) in source_rows.iter().enumerate() {
        widen(src, &mut current);
        widen(source_rows.get(y + 1).unwrap_or(src), &mut next);

        if let Some(row) = out_rows.next() {
            row.copy_from_slice(current.get(..row.len()).unwrap_or(&current));
        }
        if let Some(row) = out_rows.next() {
            for ((dst, &a), &b) in row.iter_mut().zip(current.iter()).zip(next.iter()) {
                *dst = average(a, b);
            }
        }
    }

    for row in out_rows {
        row.fill(0);
    }
}

const fn average(a: u8, b: u8) -> u8 {
    ((a as u16 + b as u16) / 2) as u8
}
