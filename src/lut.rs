//! Intensity lookup tables: a gamma curve with a linear toe near black.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::session::{CameraSession, PropertyValue};
use crate::traits::{CameraError, DeviceDriver, LutChannel, PropertyKind, Result};

/// Entries per channel table (9-bit input).
pub const LUT_ENTRIES: usize = 512;
/// Largest table value (9-bit output).
pub const LUT_MAX: u16 = 511;

/// Compute one 512-entry table.
///
/// Inputs below `offset` map to black. Within `linear_cutoff` of the offset
/// the curve is `slope * (i - offset)`; above it the curve is
/// `(gain * x^gamma - output_offset) * 511` with `x = (i - offset) / 511`.
/// Entries are clamped to `[0, 511]` and never decrease.
#[must_use]
pub fn compute_curve(
    offset: u16,
    gamma: f64,
    gain: f64,
    slope: f64,
    linear_cutoff: u16,
    output_offset: f64,
) -> [u16; LUT_ENTRIES] {
    let max = f64::from(LUT_MAX);
    let mut table = [0u16; LUT_ENTRIES];
    let mut floor = 0u16;

    for (i, entry) in (0u16..).zip(table.iter_mut()) {
        if i < offset {
            continue;
        }
        let d = i - offset;
        let value = if d <= linear_cutoff {
            slope * f64::from(d)
        } else {
            let x = f64::from(d) / max;
            gain.mul_add(x.powf(gamma), -output_offset) * max
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let value = if value.is_nan() {
            0
        } else {
            value.clamp(0.0, max) as u16
        };
        floor = floor.max(value);
        *entry = floor;
    }

    table
}

/// Parameters of one LUT bank.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LutBank {
    /// Input offset per R/G/B channel, 0-511.
    pub offsets: [u16; 3],
    /// Curve exponent, 0-4.
    pub gamma: f64,
    /// Curve gain, 0-1000.
    pub gain: f64,
    /// Slope of the linear toe.
    pub slope: f64,
    /// Length of the linear toe in input steps.
    pub linear_cutoff: u16,
    /// Output offset subtracted from the gamma section.
    pub output_offset: f64,
}

impl LutBank {
    /// Factory setting of bank 0 (Rec. 709 toe).
    #[must_use]
    pub const fn bank1_default() -> Self {
        Self {
            offsets: [0; 3],
            gamma: 0.45,
            gain: 1.099,
            slope: 4.5,
            linear_cutoff: 9,
            output_offset: 0.099,
        }
    }

    /// Factory setting of bank 1 (lifted blacks, steeper toe).
    #[must_use]
    pub const fn bank2_default() -> Self {
        Self {
            offsets: [10; 3],
            gamma: 0.45,
            gain: 1.501,
            slope: 9.0,
            linear_cutoff: 5,
            output_offset: 0.099,
        }
    }

    /// Table for one channel of this bank.
    #[must_use]
    pub fn curve(&self, channel: LutChannel) -> [u16; LUT_ENTRIES] {
        compute_curve(
            self.offsets.get(channel.index()).copied().unwrap_or_default(),
            self.gamma,
            self.gain,
            self.slope,
            self.linear_cutoff,
            self.output_offset,
        )
    }

    /// Compute and upload one channel of this bank to device bank `bank`.
    pub fn upload_channel<D: DeviceDriver>(
        &self,
        session: &mut CameraSession<D>,
        bank: u32,
        channel: LutChannel,
    ) -> Result<()> {
        debug!(
            bank,
            ?channel,
            offset = self.offsets.get(channel.index()).copied().unwrap_or_default(),
            gamma = self.gamma,
            gain = self.gain,
            "uploading LUT channel"
        );
        session.set_lut_channel(bank, channel, &self.curve(channel))
    }

    /// Compute and upload all three channels.
    pub fn upload<D: DeviceDriver>(&self, session: &mut CameraSession<D>, bank: u32) -> Result<()> {
        LutChannel::ALL
            .iter()
            .try_for_each(|&channel| self.upload_channel(session, bank, channel))
    }
}

/// Which intensity mapping the device applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LutMode {
    /// LUT and hardware gamma off.
    Off,
    /// LUT bank 0.
    #[default]
    #[serde(rename = "1")]
    Lut1,
    /// LUT bank 1.
    #[serde(rename = "2")]
    Lut2,
    /// Scalar hardware gamma, LUT feature left as it is.
    Gamma,
}

impl LutMode {
    /// Apply the mode to the device. `gamma` is used in [`LutMode::Gamma`].
    pub fn apply<D: DeviceDriver>(self, session: &mut CameraSession<D>, gamma: f32) -> Result<()> {
        debug!(mode = %self, "applying LUT mode");
        match self {
            Self::Off => {
                session.enable_lut(false)?;
                session.set_property_off(PropertyKind::Gamma)
            }
            Self::Lut1 => {
                session.enable_lut(true)?;
                session.set_active_lut_bank(0)
            }
            Self::Lut2 => {
                session.enable_lut(true)?;
                session.set_active_lut_bank(1)
            }
            Self::Gamma => session.set_property(PropertyKind::Gamma, PropertyValue::Absolute(gamma)),
        }
    }

    /// Decode the mode from the active bank.
    ///
    /// The device only reports the selected bank, so `Off` and `Gamma` cannot
    /// be told apart; anything other than bank 0 or 1 reads back as `Off`.
    #[must_use]
    pub const fn from_active_bank(bank: u32) -> Self {
        match bank {
            0 => Self::Lut1,
            1 => Self::Lut2,
            _ => Self::Off,
        }
    }
}

impl fmt::Display for LutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Off => "off",
            Self::Lut1 => "1",
            Self::Lut2 => "2",
            Self::Gamma => "gamma",
        };
        f.write_str(name)
    }
}

impl FromStr for LutMode {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "1" | "lut1" => Ok(Self::Lut1),
            "2" | "lut2" => Ok(Self::Lut2),
            "gamma" => Ok(Self::Gamma),
            other => Err(CameraError::Config(format!("unknown LUT mode {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{DriverCall, MockDriver};

    fn assert_monotonic(table: &[u16]) {
        for (i, pair) in table.windows(2).enumerate() {
            assert!(pair[0] <= pair[1], "entry {i} decreases: {pair:?}");
        }
    }

    #[test]
    fn test_default_banks_are_monotonic() {
        for bank in [LutBank::bank1_default(), LutBank::bank2_default()] {
            for channel in LutChannel::ALL {
                assert_monotonic(&bank.curve(channel));
            }
        }
    }

    #[test]
    fn test_steep_gamma_stays_monotonic() {
        assert_monotonic(&compute_curve(0, 2.5, 1.0, 4.5, 9, 0.099));
        assert_monotonic(&compute_curve(300, 4.0, 1000.0, 9.0, 5, 0.099));
        assert_monotonic(&compute_curve(511, 0.0, 0.0, 0.0, 0, 0.0));
    }

    #[test]
    fn test_curve_sections() {
        let table = compute_curve(10, 0.45, 1.099, 4.5, 9, 0.099);
        assert!(table[..10].iter().all(|&v| v == 0));
        assert_eq!(table[10], 0);
        assert_eq!(table[12], 9);
        assert_eq!(table[19], 40);
        assert!(table[20] >= 40);
        assert_eq!(table[511], 506);
    }

    #[test]
    fn test_curve_is_clamped() {
        let table = compute_curve(0, 1.0, 1000.0, 100.0, 9, 0.0);
        assert!(table.iter().all(|&v| v <= LUT_MAX));
        assert_eq!(table[511], LUT_MAX);
    }

    #[test]
    fn test_mode_readback_is_ambiguous() {
        assert_eq!(LutMode::from_active_bank(0), LutMode::Lut1);
        assert_eq!(LutMode::from_active_bank(1), LutMode::Lut2);
        assert_eq!(LutMode::from_active_bank(7), LutMode::Off);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("gamma".parse::<LutMode>().expect("parse"), LutMode::Gamma);
        assert_eq!("2".parse::<LutMode>().expect("parse"), LutMode::Lut2);
        assert!("3".parse::<LutMode>().is_err());
    }

    #[test]
    fn test_apply_modes() {
        let (driver, handle) = MockDriver::builder().build();
        let mut session = CameraSession::new(driver);
        session.open().expect("open");

        LutMode::Lut2.apply(&mut session, 1.5).expect("lut2");
        assert!(handle.lut_enabled());
        assert_eq!(handle.active_lut_bank(), 1);

        LutMode::Gamma.apply(&mut session, 1.5).expect("gamma");
        assert!(handle.lut_enabled(), "gamma leaves the LUT feature alone");
        let gamma = handle.property(PropertyKind::Gamma);
        assert!(gamma.on_off);
        assert!((gamma.abs_value - 1.5).abs() < f32::EPSILON);

        LutMode::Off.apply(&mut session, 1.5).expect("off");
        assert!(!handle.lut_enabled());
        assert!(!handle.property(PropertyKind::Gamma).on_off);
    }

    #[test]
    fn test_upload_bank() {
        let (driver, handle) = MockDriver::builder().build();
        let mut session = CameraSession::new(driver);
        session.open().expect("open");

        let mut bank = LutBank::bank2_default();
        bank.offsets = [1, 2, 3];
        bank.upload(&mut session, 1).expect("upload");

        let uploads: Vec<_> = handle
            .calls()
            .into_iter()
            .filter(|c| matches!(c, DriverCall::SetLutChannel { .. }))
            .collect();
        assert_eq!(uploads.len(), 3);
        let blue = handle.lut_table(1, LutChannel::Blue).expect("blue table");
        assert_eq!(blue, bank.curve(LutChannel::Blue).to_vec());
    }
}
