//! Structural checks on produced buffers.
//!
//! Used by the `--verify` mode of the command-line tool and by the
//! integration tests to confirm that binned frames were expanded
//! correctly and that buffer metadata forms a clean sequence.

use crate::geometry::FrameGeometry;
use crate::pump::VideoBuffer;
use crate::traits::{CameraError, Result};

/// Tolerance used when comparing against an expected colour.
pub const COLOR_TOLERANCE: u32 = 15;

fn pixel_at(buffer: &VideoBuffer, bpp: u32, x: u32, y: u32) -> Option<&[u8]> {
    let start = (y * buffer.stride + x * bpp) as usize;
    buffer.data.get(start..start + bpp as usize)
}

fn check_size(buffer: &VideoBuffer, geometry: &FrameGeometry) -> Result<()> {
    if buffer.width != geometry.output_width || buffer.height != geometry.output_height {
        return Err(CameraError::Validation(format!(
            "buffer is {}x{}, expected {}x{}",
            buffer.width, buffer.height, geometry.output_width, geometry.output_height
        )));
    }
    let expected = buffer.stride as usize * buffer.height as usize;
    if buffer.data.len() < expected {
        return Err(CameraError::Validation(format!(
            "buffer holds {} bytes, expected {expected}",
            buffer.data.len()
        )));
    }
    Ok(())
}

/// Validates that every NxN block of a binned frame is uniform.
///
/// Each block is compared against its top-left pixel. Frames captured
/// without binning pass trivially.
///
/// # Errors
///
/// Returns `Validation` if the buffer size does not match `geometry` or
/// any pixel differs from its block origin.
pub fn validate_block_replication(buffer: &VideoBuffer, geometry: &FrameGeometry) -> Result<()> {
    check_size(buffer, geometry)?;
    let factor = geometry.binning.factor();
    if factor == 1 {
        return Ok(());
    }
    let bpp = geometry.bytes_per_pixel;
    let top = geometry.top_padding();

    for by in 0..geometry.raw_height {
        for bx in 0..geometry.raw_width {
            let (x0, y0) = (bx * factor, top + by * factor);
            let origin = pixel_at(buffer, bpp, x0, y0).ok_or_else(|| {
                CameraError::Validation(format!("block origin ({x0}, {y0}) out of bounds"))
            })?;
            for dy in 0..factor {
                for dx in 0..factor {
                    if pixel_at(buffer, bpp, x0 + dx, y0 + dy) != Some(origin) {
                        return Err(CameraError::Validation(format!(
                            "pixel ({}, {}) differs from block origin ({x0}, {y0})",
                            x0 + dx,
                            y0 + dy
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Validates that the rows above and below the image, and the trailing
/// columns, are black.
///
/// # Errors
///
/// Returns `Validation` on the first non-zero padding byte.
pub fn validate_padding(buffer: &VideoBuffer, geometry: &FrameGeometry) -> Result<()> {
    check_size(buffer, geometry)?;
    let factor = geometry.binning.factor();
    let bpp = geometry.bytes_per_pixel;
    let top = geometry.top_padding();
    let image_end = top + factor * geometry.raw_height;
    let image_right = geometry.output_width - geometry.trailing_columns();
    let row_bytes = (geometry.output_width * bpp) as usize;

    for (y, row) in (0u32..).zip(buffer.data.chunks(buffer.stride as usize)) {
        if y >= geometry.output_height {
            break;
        }
        let row = row.get(..row_bytes).unwrap_or(row);
        let blank = if y < top || y >= image_end {
            row
        } else {
            row.get((image_right * bpp) as usize..).unwrap_or_default()
        };
        if let Some(offset) = blank.iter().position(|&b| b != 0) {
            return Err(CameraError::Validation(format!(
                "padding byte {offset} of row {y} is not black"
            )));
        }
    }
    Ok(())
}

/// Validates that buffer offsets count up by one and that timestamps,
/// when present, advance by each buffer's duration.
///
/// # Errors
///
/// Returns `Validation` if `buffers` is empty, offsets have a gap, or a
/// timestamp does not follow from the previous one.
pub fn validate_buffer_sequence(buffers: &[VideoBuffer]) -> Result<()> {
    let Some(first) = buffers.first() else {
        return Err(CameraError::Validation(
            "cannot validate an empty buffer sequence".to_owned(),
        ));
    };
    if first.offset_end != first.offset + 1 {
        return Err(CameraError::Validation(format!(
            "offset_end {} does not follow offset {}",
            first.offset_end, first.offset
        )));
    }

    for (index, pair) in buffers.windows(2).enumerate() {
        let [prev, curr] = pair else { continue };
        if curr.offset != prev.offset_end || curr.offset_end != curr.offset + 1 {
            return Err(CameraError::Validation(format!(
                "offset gap at index {}: expected {}, got {}..{}",
                index + 1,
                prev.offset_end,
                curr.offset,
                curr.offset_end
            )));
        }
        if let (Some(prev_pts), Some(curr_pts)) = (prev.pts, curr.pts) {
            if curr_pts != prev_pts + curr.duration {
                return Err(CameraError::Validation(format!(
                    "timestamp at index {} is {curr_pts}, expected {}",
                    index + 1,
                    prev_pts + curr.duration
                )));
            }
        }
    }
    Ok(())
}

/// Validates that the pixel at (`x`, `y`) matches `expected` within
/// [`COLOR_TOLERANCE`].
///
/// # Errors
///
/// Returns `Validation` if the pixel is out of bounds or differs.
pub fn validate_pixel(
    buffer: &VideoBuffer,
    x: u32,
    y: u32,
    expected: (u8, u8, u8),
) -> Result<()> {
    let actual = match pixel_at(buffer, 3, x, y) {
        Some(&[r, g, b]) => (r, g, b),
        _ => {
            return Err(CameraError::Validation(format!(
                "pixel ({x}, {y}) is out of bounds"
            )))
        }
    };
    if !colors_match(actual, expected, COLOR_TOLERANCE) {
        return Err(CameraError::Validation(format!(
            "pixel ({x}, {y}) is RGB{actual:?}, expected RGB{expected:?}"
        )));
    }
    Ok(())
}

/// Whether two RGB colours are within `tolerance` on every channel.
#[must_use]
pub fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u32) -> bool {
    let (ar, ag, ab) = actual;
    let (er, eg, eb) = expected;

    let r_diff = u32::from(ar.abs_diff(er));
    let g_diff = u32::from(ag.abs_diff(eg));
    let b_diff = u32::from(ab.abs_diff(eb));

    r_diff <= tolerance && g_diff <= tolerance && b_diff <= tolerance
}
