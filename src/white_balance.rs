//! White-balance state machine: manual gains, continuous auto, and a
//! bounded one-push calibration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::session::CameraSession;
use crate::traits::{CameraError, DeviceDriver, PropertyKind, Result};

/// Frames a one-push calibration may run before it is aborted.
pub const ONE_PUSH_FRAME_LIMIT: u32 = 100;

/// User-facing white-balance mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhiteBalanceMode {
    /// Fixed red/blue gains, auto white balance disabled.
    #[default]
    #[serde(alias = "disabled")]
    Manual,
    /// One-shot calibration that settles back to manual gains.
    #[serde(rename = "onepush")]
    OnePush,
    /// Continuous device-side adjustment.
    Auto,
}

impl fmt::Display for WhiteBalanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Manual => "manual",
            Self::OnePush => "onepush",
            Self::Auto => "auto",
        })
    }
}

impl FromStr for WhiteBalanceMode {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" | "disabled" => Ok(Self::Manual),
            "onepush" | "one-push" => Ok(Self::OnePush),
            "auto" => Ok(Self::Auto),
            other => Err(CameraError::Config(format!(
                "unknown white balance mode {other:?}"
            ))),
        }
    }
}

/// Internal state, including the one-push countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhiteBalanceState {
    /// Gains held and written directly.
    Manual,
    /// Device adjusts continuously; gains are served from cache.
    Auto,
    /// One-push running, aborted when `remaining_frames` reaches zero.
    OnePushActive {
        /// Frames left before the calibration is aborted.
        remaining_frames: u32,
    },
}

/// White balance of one camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhiteBalance {
    state: WhiteBalanceState,
    red_gain: u32,
    blue_gain: u32,
}

impl WhiteBalance {
    /// Manual white balance with the given gains.
    #[must_use]
    pub const fn new(red_gain: u32, blue_gain: u32) -> Self {
        Self {
            state: WhiteBalanceState::Manual,
            red_gain,
            blue_gain,
        }
    }

    /// Current state, including the one-push countdown.
    #[must_use]
    pub const fn state(&self) -> WhiteBalanceState {
        self.state
    }

    /// Mode as reported to the user; a running one-push reports `OnePush`.
    #[must_use]
    pub const fn mode(&self) -> WhiteBalanceMode {
        match self.state {
            WhiteBalanceState::Manual => WhiteBalanceMode::Manual,
            WhiteBalanceState::Auto => WhiteBalanceMode::Auto,
            WhiteBalanceState::OnePushActive { .. } => WhiteBalanceMode::OnePush,
        }
    }

    /// Whether a one-push calibration is running.
    #[must_use]
    pub const fn one_push_in_progress(&self) -> bool {
        matches!(self.state, WhiteBalanceState::OnePushActive { .. })
    }

    /// Cached red gain.
    #[must_use]
    pub const fn red_gain(&self) -> u32 {
        self.red_gain
    }

    /// Cached blue gain.
    #[must_use]
    pub const fn blue_gain(&self) -> u32 {
        self.blue_gain
    }

    /// Enter `mode` and program the device accordingly.
    ///
    /// The state changes even when the device write fails.
    pub fn set_mode<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        mode: WhiteBalanceMode,
    ) -> Result<()> {
        match mode {
            WhiteBalanceMode::Manual => {
                self.state = WhiteBalanceState::Manual;
                self.write_manual(session)
            }
            WhiteBalanceMode::Auto => {
                self.state = WhiteBalanceState::Auto;
                debug!("enabling continuous white balance");
                session.modify_property(PropertyKind::WhiteBalance, |wb| {
                    wb.on_off = true;
                    wb.auto_manual = true;
                    wb.one_push = false;
                })
            }
            WhiteBalanceMode::OnePush => {
                self.state = WhiteBalanceState::OnePushActive {
                    remaining_frames: ONE_PUSH_FRAME_LIMIT,
                };
                debug!("starting one-push white balance");
                // Auto must be written off before the trigger is accepted.
                session.modify_property(PropertyKind::WhiteBalance, |wb| {
                    wb.on_off = true;
                    wb.auto_manual = false;
                    wb.one_push = false;
                })?;
                session.modify_property(PropertyKind::WhiteBalance, |wb| {
                    wb.on_off = true;
                    wb.auto_manual = false;
                    wb.one_push = true;
                })
            }
        }
    }

    /// Re-apply the current mode, e.g. after the connection opened.
    pub fn apply<D: DeviceDriver>(&mut self, session: &mut CameraSession<D>) -> Result<()> {
        self.set_mode(session, self.mode())
    }

    /// Set the red gain; leaves any other mode for manual.
    pub fn set_red_gain<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        red_gain: u32,
    ) -> Result<()> {
        self.red_gain = red_gain;
        self.set_mode(session, WhiteBalanceMode::Manual)
    }

    /// Set the blue gain; leaves any other mode for manual.
    pub fn set_blue_gain<D: DeviceDriver>(
        &mut self,
        session: &mut CameraSession<D>,
        blue_gain: u32,
    ) -> Result<()> {
        self.blue_gain = blue_gain;
        self.set_mode(session, WhiteBalanceMode::Manual)
    }

    /// Refresh cached gains from the device. In auto mode the cache is kept.
    pub fn refresh_gains<D: DeviceDriver>(&mut self, session: &mut CameraSession<D>) -> Result<()> {
        if self.state == WhiteBalanceState::Auto {
            return Ok(());
        }
        if let Some(wb) = session.property_state(PropertyKind::WhiteBalance)? {
            self.red_gain = wb.value_a;
            self.blue_gain = wb.value_b;
        }
        Ok(())
    }

    /// Advance a running one-push by one frame.
    ///
    /// Completion on the device adopts its gains; running out of frames
    /// rewrites the last known gains and returns to manual.
    pub fn tick<D: DeviceDriver>(&mut self, session: &mut CameraSession<D>) -> Result<()> {
        let WhiteBalanceState::OnePushActive { remaining_frames } = self.state else {
            return Ok(());
        };

        match session.property_state(PropertyKind::WhiteBalance) {
            Ok(Some(wb)) if !wb.one_push => {
                self.state = WhiteBalanceState::Manual;
                self.red_gain = wb.value_a;
                self.blue_gain = wb.value_b;
                info!(
                    red = wb.value_a,
                    blue = wb.value_b,
                    frames = ONE_PUSH_FRAME_LIMIT - remaining_frames,
                    "one-push white balance complete"
                );
                return Ok(());
            }
            Ok(_) => {}
            // An unreadable status counts as still running so the countdown always ends.
            Err(err) => warn!(error = %err, "one-push status read failed"),
        }

        let remaining_frames = remaining_frames.saturating_sub(1);
        if remaining_frames > 0 {
            self.state = WhiteBalanceState::OnePushActive { remaining_frames };
            return Ok(());
        }

        warn!(
            frames = ONE_PUSH_FRAME_LIMIT,
            "one-push white balance did not complete, restoring manual gains"
        );
        self.state = WhiteBalanceState::Manual;
        self.write_manual(session)
    }

    fn write_manual<D: DeviceDriver>(&self, session: &mut CameraSession<D>) -> Result<()> {
        debug!(red = self.red_gain, blue = self.blue_gain, "manual white balance");
        let (red, blue) = (self.red_gain, self.blue_gain);
        session.modify_property(PropertyKind::WhiteBalance, |wb| {
            wb.on_off = true;
            wb.auto_manual = false;
            wb.one_push = false;
            wb.abs_control = false;
            wb.value_a = red;
            wb.value_b = blue;
        })
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

    #[test]
    fn test_manual_writes_gains() {
        let (mut session, handle) = open(MockDriver::builder());
        let mut wb = WhiteBalance::new(500, 600);
        wb.apply(&mut session).expect("apply should succeed");

        let property = handle.property(PropertyKind::WhiteBalance);
        assert!(property.on_off);
        assert!(!property.auto_manual);
        assert!(!property.one_push);
        assert_eq!((property.value_a, property.value_b), (500, 600));
    }

    #[test]
    fn test_one_push_sequencing() {
        let (mut session, handle) = open(MockDriver::builder());
        handle.clear_calls();
        let mut wb = WhiteBalance::new(425, 727);
        wb.set_mode(&mut session, WhiteBalanceMode::OnePush)
            .expect("one-push should start");

        let writes: Vec<_> = handle
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                DriverCall::SetProperty {
                    kind: PropertyKind::WhiteBalance,
                    state,
                } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(writes.len(), 2);
        assert!(!writes[0].auto_manual && !writes[0].one_push);
        assert!(!writes[1].auto_manual && writes[1].one_push);
        assert!(wb.one_push_in_progress());
        assert_eq!(wb.mode(), WhiteBalanceMode::OnePush);
    }

    #[test]
    fn test_one_push_completion_adopts_gains() {
        let (mut session, handle) = open(MockDriver::builder().one_push_result(610, 590));
        let mut wb = WhiteBalance::new(425, 727);
        wb.set_mode(&mut session, WhiteBalanceMode::OnePush)
            .expect("one-push should start");

        wb.tick(&mut session).expect("tick should succeed");
        assert!(wb.one_push_in_progress());

        handle.finish_one_push();
        wb.tick(&mut session).expect("tick should succeed");
        assert_eq!(wb.mode(), WhiteBalanceMode::Manual);
        assert_eq!((wb.red_gain(), wb.blue_gain()), (610, 590));
    }

    #[test]
    fn test_one_push_aborts_at_limit() {
        let (mut session, handle) = open(MockDriver::builder());
        let mut wb = WhiteBalance::new(425, 727);
        wb.set_mode(&mut session, WhiteBalanceMode::OnePush)
            .expect("one-push should start");

        for tick in 1..ONE_PUSH_FRAME_LIMIT {
            wb.tick(&mut session).expect("tick should succeed");
            assert!(wb.one_push_in_progress(), "still running at tick {tick}");
        }
        wb.tick(&mut session).expect("tick should succeed");
        assert!(!wb.one_push_in_progress());
        assert_eq!(wb.mode(), WhiteBalanceMode::Manual);

        let property = handle.property(PropertyKind::WhiteBalance);
        assert!(!property.one_push);
        assert_eq!((property.value_a, property.value_b), (425, 727));
    }

    #[test]
    fn test_one_push_ends_when_status_unreadable() {
        let (mut session, handle) = open(MockDriver::builder());
        let mut wb = WhiteBalance::new(425, 727);
        wb.set_mode(&mut session, WhiteBalanceMode::OnePush)
            .expect("one-push should start");
        handle.set_fail_property(PropertyKind::WhiteBalance, true);

        for tick in 1..ONE_PUSH_FRAME_LIMIT {
            wb.tick(&mut session).expect("read failures are not fatal");
            assert!(wb.one_push_in_progress(), "still running at tick {tick}");
        }
        // The restoring write fails too, but the countdown is over.
        assert!(wb.tick(&mut session).is_err());
        assert!(!wb.one_push_in_progress());
        assert_eq!(wb.mode(), WhiteBalanceMode::Manual);
    }

    #[test]
    fn test_gain_write_cancels_one_push() {
        let (mut session, handle) = open(MockDriver::builder());
        let mut wb = WhiteBalance::new(425, 727);
        wb.set_mode(&mut session, WhiteBalanceMode::OnePush)
            .expect("one-push should start");

        wb.set_red_gain(&mut session, 300).expect("set should succeed");
        assert_eq!(wb.mode(), WhiteBalanceMode::Manual);
        assert_eq!(handle.property(PropertyKind::WhiteBalance).value_a, 300);
    }

    #[test]
    fn test_auto_serves_cached_gains() {
        let (mut session, handle) = open(MockDriver::builder());
        let mut wb = WhiteBalance::new(425, 727);
        wb.set_mode(&mut session, WhiteBalanceMode::Auto)
            .expect("auto should succeed");
        assert!(handle.property(PropertyKind::WhiteBalance).auto_manual);

        let mut drifted = handle.property(PropertyKind::WhiteBalance);
        drifted.value_a = 1;
        handle.set_property(PropertyKind::WhiteBalance, drifted);

        wb.refresh_gains(&mut session).expect("refresh should succeed");
        assert_eq!(wb.red_gain(), 425);

        wb.set_mode(&mut session, WhiteBalanceMode::Manual)
            .expect("manual should succeed");
        wb.refresh_gains(&mut session).expect("refresh should succeed");
        assert_eq!(wb.red_gain(), 425);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(
            "disabled".parse::<WhiteBalanceMode>().expect("parse"),
            WhiteBalanceMode::Manual
        );
        assert_eq!(
            "onepush".parse::<WhiteBalanceMode>().expect("parse"),
            WhiteBalanceMode::OnePush
        );
        assert!("sometimes".parse::<WhiteBalanceMode>().is_err());
    }
}
