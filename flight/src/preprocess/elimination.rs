use common::{
  comm::{BaroSample, ImuSample},
  config::SensorConfig,
};

/// Largest plausible acceleration on any axis, in g. A saturated axis reads
/// exactly this value and is rejected.
pub const ACCEL_LIMIT: f32 = 32.0;

/// Largest plausible angular rate on any axis, in deg/s.
pub const GYRO_LIMIT: f32 = 2000.0;

/// Plausible static pressure range, in pascals.
pub const PRESSURE_RANGE: (f32, f32) = (10_000.0, 120_000.0);

/// Plausible temperature range, in degrees Celsius.
pub const TEMPERATURE_RANGE: (f32, f32) = (-40.0, 85.0);

/// A sample that can be judged on its own and compared for freezing.
pub trait Checked {
  /// True if every value lies in its physically plausible range.
  fn in_bounds(&self) -> bool;

  /// True if the measured values are bit-identical. Timestamps are ignored.
  fn same_reading(&self, other: &Self) -> bool;
}

fn within(value: f32, (low, high): (f32, f32)) -> bool {
  value >= low && value <= high
}

impl Checked for ImuSample {
  fn in_bounds(&self) -> bool {
    let accel_ok = self
      .accel
      .to_array()
      .iter()
      .all(|a| a.is_finite() && a.abs() < ACCEL_LIMIT);

    let gyro_ok = self
      .gyro
      .to_array()
      .iter()
      .all(|g| g.is_finite() && g.abs() <= GYRO_LIMIT);

    accel_ok && gyro_ok && within(self.temperature, TEMPERATURE_RANGE)
  }

  fn same_reading(&self, other: &Self) -> bool {
    let bits = |s: &ImuSample| {
      [
        s.accel.x, s.accel.y, s.accel.z, s.gyro.x, s.gyro.y, s.gyro.z,
        s.temperature,
      ]
      .map(f32::to_bits)
    };

    bits(self) == bits(other)
  }
}

impl Checked for BaroSample {
  fn in_bounds(&self) -> bool {
    within(self.pressure, PRESSURE_RANGE)
      && within(self.temperature, TEMPERATURE_RANGE)
  }

  fn same_reading(&self, other: &Self) -> bool {
    self.pressure.to_bits() == other.pressure.to_bits()
      && self.temperature.to_bits() == other.temperature.to_bits()
  }
}

/// The verdict on one unit for one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SensorHealth {
  /// Neither frozen nor out of bounds.
  pub ok: bool,

  /// The unit has repeated the same reading for too long.
  pub frozen: bool,

  /// A value left its plausible range.
  pub out_of_bounds: bool,
}

/// Tracks the health of a single sensor unit across ticks.
#[derive(Clone, Debug)]
pub struct UnitMonitor<S> {
  previous: Option<S>,
  identical_ticks: u16,
  fault_counter: u16,
  eliminated: bool,
}

impl<S> Default for UnitMonitor<S> {
  fn default() -> Self {
    UnitMonitor {
      previous: None,
      identical_ticks: 0,
      fault_counter: 0,
      eliminated: false,
    }
  }
}

impl<S: Checked + Copy> UnitMonitor<S> {
  /// Judges this tick's sample and updates the fault counter and the
  /// elimination latch.
  pub fn update(&mut self, sample: &S, config: &SensorConfig) -> SensorHealth {
    let out_of_bounds = !sample.in_bounds();

    match &self.previous {
      Some(previous) if previous.same_reading(sample) => {
        self.identical_ticks = self.identical_ticks.saturating_add(1);
      }
      _ => self.identical_ticks = 0,
    }

    self.previous = Some(*sample);

    let frozen = self.identical_ticks >= config.freeze_ticks;
    let ok = !frozen && !out_of_bounds;

    if ok {
      self.fault_counter = self.fault_counter.saturating_sub(1);
    } else {
      self.fault_counter =
        self.fault_counter.saturating_add(1).min(config.fault_limit);
    }

    if !self.eliminated && self.fault_counter >= config.fault_limit {
      self.eliminated = true;
    } else if self.eliminated && self.fault_counter <= config.rejoin_level {
      self.eliminated = false;
    }

    SensorHealth {
      ok,
      frozen,
      out_of_bounds,
    }
  }

  /// True while the unit is excluded from fusion.
  pub fn is_eliminated(&self) -> bool {
    self.eliminated
  }

  #[cfg(test)]
  pub(crate) fn fault_counter(&self) -> u16 {
    self.fault_counter
  }
}
