//! Coupling of exposure time, frame rate and frame duration.

use tracing::debug;

use crate::session::{CameraSession, PropertyValue};
use crate::traits::{DeviceDriver, PropertyKind, Result};

const NANOS_PER_SECOND: f64 = 1e9;
const MILLIS_PER_SECOND: f64 = 1000.0;

/// Exposure time and the frame timing it implies.
///
/// The effective frame rate is `1000 / exposure_ms`, capped at the user
/// ceiling. When the cap applies, the device's frame-rate limiter is engaged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureState {
    exposure_ms: f64,
    max_framerate_fps: f64,
    effective_framerate_fps: f64,
    frame_duration_ns: u64,
    framerate_limited: bool,
}

impl ExposureState {
    /// Derive timing for an exposure and ceiling.
    #[must_use]
    pub fn new(exposure_ms: f64, max_framerate_fps: f64) -> Self {
        let mut state = Self {
            exposure_ms,
            max_framerate_fps,
            effective_framerate_fps: 0.0,
            frame_duration_ns: 0,
            framerate_limited: false,
        };
        state.recompute();
        state
    }

    /// Exposure time in milliseconds.
    #[must_use]
    pub const fn exposure_ms(&self) -> f64 {
        self.exposure_ms
    }

    /// User frame-rate ceiling.
    #[must_use]
    pub const fn max_framerate_fps(&self) -> f64 {
        self.max_framerate_fps
    }

    /// Frame rate actually produced.
    #[must_use]
    pub const fn effective_framerate_fps(&self) -> f64 {
        self.effective_framerate_fps
    }

    /// Duration of one frame in nanoseconds.
    #[must_use]
    pub const fn frame_duration_ns(&self) -> u64 {
        self.frame_duration_ns
    }

    /// Whether the frame-rate limiter is engaged.
    #[must_use]
    pub const fn framerate_limited(&self) -> bool {
        self.framerate_limited
    }

    /// Change the exposure time and recompute timing.
    pub fn set_exposure_ms(&mut self, exposure_ms: f64) {
        self.exposure_ms = exposure_ms;
        self.recompute();
    }

    /// Change the ceiling and recompute timing.
    pub fn set_max_framerate_fps(&mut self, max_framerate_fps: f64) {
        self.max_framerate_fps = max_framerate_fps;
        self.recompute();
    }

    fn recompute(&mut self) {
        let implied = MILLIS_PER_SECOND / self.exposure_ms;
        self.framerate_limited = implied > self.max_framerate_fps;
        self.effective_framerate_fps = implied.min(self.max_framerate_fps);
        self.frame_duration_ns = duration_ns(self.effective_framerate_fps);
    }

    /// Adopt the values the device actually applied.
    fn finalize(&mut self, exposure_ms: f64, framerate_fps: Option<f64>) {
        self.exposure_ms = exposure_ms;
        let rate = framerate_fps.unwrap_or(MILLIS_PER_SECOND / exposure_ms);
        self.effective_framerate_fps = rate.min(self.max_framerate_fps);
        self.frame_duration_ns = duration_ns(self.effective_framerate_fps);
    }

    /// Write exposure (and the frame-rate cap when engaged) to the device,
    /// then read back what was applied and finalize the frame duration.
    pub fn apply<D: DeviceDriver>(&mut self, session: &mut CameraSession<D>) -> Result<()> {
        self.recompute();

        #[allow(clippy::cast_possible_truncation)]
        let exposure = self.exposure_ms as f32;

        if self.framerate_limited {
            #[allow(clippy::cast_possible_truncation)]
            let rate = self.effective_framerate_fps as f32;
            debug!(
                framerate = rate,
                duration_us = self.frame_duration_ns / 1000,
                exposure_ms = exposure,
                "requesting capped frame rate and exposure"
            );
            session.set_property(PropertyKind::FrameRate, PropertyValue::Absolute(rate))?;
            session.set_property(PropertyKind::Shutter, PropertyValue::Absolute(exposure))?;

            let rate = absolute(session, PropertyKind::FrameRate)?;
            let exposure = absolute(session, PropertyKind::Shutter)?;
            if let Some(exposure) = exposure {
                self.finalize(exposure, rate.or(Some(self.effective_framerate_fps)));
            }
        } else {
            debug!(
                duration_us = self.frame_duration_ns / 1000,
                exposure_ms = exposure,
                "requesting exposure"
            );
            session.set_property_off(PropertyKind::FrameRate)?;
            session.set_property(PropertyKind::Shutter, PropertyValue::Absolute(exposure))?;

            if let Some(exposure) = absolute(session, PropertyKind::Shutter)? {
                self.finalize(exposure, None);
            }
        }

        debug!(
            framerate = self.effective_framerate_fps,
            duration_us = self.frame_duration_ns / 1000,
            exposure_ms = self.exposure_ms,
            "exposure applied"
        );
        Ok(())
    }

    /// Refresh the exposure time from the device.
    pub fn refresh<D: DeviceDriver>(&mut self, session: &mut CameraSession<D>) -> Result<()> {
        if let Some(exposure) = absolute(session, PropertyKind::Shutter)? {
            self.exposure_ms = exposure;
        }
        Ok(())
    }
}

fn absolute<D: DeviceDriver>(
    session: &mut CameraSession<D>,
    kind: PropertyKind,
) -> Result<Option<f64>> {
    Ok(match session.property(kind)? {
        Some(PropertyValue::Absolute(value)) if value > 0.0 => Some(f64::from(value)),
        _ => None,
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn duration_ns(framerate_fps: f64) -> u64 {
    (NANOS_PER_SECOND / framerate_fps).round() as u64
}
