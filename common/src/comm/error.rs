use crate::ToPrettyString;
use bitflags::bitflags;
use postcard::experimental::max_size::MaxSize;
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags! {
  /// Every fault condition which can be active on the vehicle.
  ///
  /// Flags are raised and cleared by the task which owns the condition and are
  /// continuously exposed to telemetry. Some flags block arming, see
  /// `ErrorFlags::BLOCKING`.
  #[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
  )]
  pub struct ErrorFlags : u32 {
    /// No stored configuration was found, built-in defaults are in use.
    const NO_CONFIG = 1 << 0;

    /// The stored configuration was unusable and was replaced by defaults.
    const NON_USER_CONFIG = 1 << 1;

    /// Pyro channel 0 is bound but has no continuity.
    const NO_PYRO_0 = 1 << 2;

    /// Pyro channel 1 is bound but has no continuity.
    const NO_PYRO_1 = 1 << 3;

    /// Pyro channel 2 is bound but has no continuity.
    const NO_PYRO_2 = 1 << 4;

    /// Pyro channel 3 is bound but has no continuity.
    const NO_PYRO_3 = 1 << 5;

    /// Battery voltage is low.
    const BAT_LOW = 1 << 6;

    /// Battery voltage is critical.
    const BAT_CRITICAL = 1 << 7;

    /// IMU unit 0 was eliminated from fusion.
    const IMU_0 = 1 << 8;

    /// IMU unit 1 was eliminated from fusion.
    const IMU_1 = 1 << 9;

    /// IMU unit 2 was eliminated from fusion.
    const IMU_2 = 1 << 10;

    /// Barometer unit 0 was eliminated from fusion.
    const BARO_0 = 1 << 11;

    /// Barometer unit 1 was eliminated from fusion.
    const BARO_1 = 1 << 12;

    /// Barometer unit 2 was eliminated from fusion.
    const BARO_2 = 1 << 13;

    /// Every IMU unit was eliminated.
    const IMU_EXHAUSTED = 1 << 14;

    /// Every barometer unit was eliminated.
    const BARO_EXHAUSTED = 1 << 15;

    /// The Kalman filter failed numerically and held its previous estimate.
    const FILTER = 1 << 16;

    /// Calibration did not converge.
    const CALIBRATION = 1 << 17;

    /// The recorder queue overflowed and records were dropped.
    const LOG_FULL = 1 << 18;

    /// A task missed its deadline for fresh input data.
    const STALE_DATA = 1 << 19;

    /// Any pyro channel without continuity.
    const NO_PYRO = Self::NO_PYRO_0.bits()
      | Self::NO_PYRO_1.bits()
      | Self::NO_PYRO_2.bits()
      | Self::NO_PYRO_3.bits();

    /// Flags which prevent the vehicle from arming.
    const BLOCKING = Self::NO_PYRO.bits()
      | Self::BAT_CRITICAL.bits()
      | Self::CALIBRATION.bits()
      | Self::FILTER.bits();
  }
}

/// The number of pyro channels that have a dedicated continuity flag.
pub const MAX_PYRO_CHANNELS: u8 = 4;

impl ErrorFlags {
  /// The continuity flag of a pyro channel.
  pub fn no_pyro(channel: u8) -> ErrorFlags {
    match channel {
      0 => Self::NO_PYRO_0,
      1 => Self::NO_PYRO_1,
      2 => Self::NO_PYRO_2,
      3 => Self::NO_PYRO_3,
      _ => Self::empty(),
    }
  }

  /// The elimination flag of an IMU unit.
  pub fn imu(unit: usize) -> ErrorFlags {
    match unit {
      0 => Self::IMU_0,
      1 => Self::IMU_1,
      2 => Self::IMU_2,
      _ => Self::empty(),
    }
  }

  /// The elimination flag of a barometer unit.
  pub fn baro(unit: usize) -> ErrorFlags {
    match unit {
      0 => Self::BARO_0,
      1 => Self::BARO_1,
      2 => Self::BARO_2,
      _ => Self::empty(),
    }
  }

  /// True if any flag which blocks arming is set.
  pub fn blocks_arming(self) -> bool {
    self.intersects(Self::BLOCKING)
  }
}

impl MaxSize for ErrorFlags {
  const POSTCARD_MAX_SIZE: usize = u32::POSTCARD_MAX_SIZE;
}

impl fmt::Display for ErrorFlags {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_empty() {
      return write!(f, "none");
    }

    let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
    write!(f, "{}", names.join(" | "))
  }
}

impl ToPrettyString for ErrorFlags {
  /// Blocking flags are shown in red, the remainder in yellow.
  fn to_pretty_string(&self) -> String {
    if self.is_empty() {
      return "\x1b[32mnone\x1b[0m".to_owned();
    }

    self
      .iter_names()
      .map(|(name, flag)| {
        if flag.blocks_arming() {
          format!("\x1b[31m{name}\x1b[0m")
        } else {
          format!("\x1b[33m{name}\x1b[0m")
        }
      })
      .collect::<Vec<_>>()
      .join(" ")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn blocking_flags() {
    assert!(ErrorFlags::NO_PYRO_1.blocks_arming());
    assert!(ErrorFlags::FILTER.blocks_arming());
    assert!(!ErrorFlags::BAT_LOW.blocks_arming());
    assert!(!(ErrorFlags::IMU_0 | ErrorFlags::LOG_FULL).blocks_arming());
  }

  #[test]
  fn display_lists_names() {
    let flags = ErrorFlags::BAT_LOW | ErrorFlags::IMU_2;
    assert_eq!(flags.to_string(), "BAT_LOW | IMU_2");
    assert_eq!(ErrorFlags::empty().to_string(), "none");
  }
}
