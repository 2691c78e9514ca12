//! Produces the vertical state and attitude of the vehicle from the fused
//! measurement of each tick.

mod kalman;
mod orientation;

pub use kalman::{KalmanFilter, NoiseModel, DT};
pub use orientation::OrientationFilter;

use crate::preprocess::{FusedMeasurement, GRAVITY};
use common::comm::{sensor::Millis, ErrorFlags, EstimationOutput};

/// Owns the filter states. Nothing outside the estimator can reach them, the
/// rest of the system only sees the `EstimationOutput` copies it hands out.
#[derive(Clone, Debug)]
pub struct Estimator {
  kalman: KalmanFilter,
  orientation: OrientationFilter,
  filter_failed: bool,
}

impl Default for Estimator {
  fn default() -> Self {
    Estimator::new(NoiseModel::default())
  }
}

impl Estimator {
  /// Constructs an estimator at rest at zero height.
  pub fn new(noise: NoiseModel) -> Self {
    Estimator {
      kalman: KalmanFilter::new(noise),
      orientation: OrientationFilter::default(),
      filter_failed: false,
    }
  }

  /// `FILTER` while the last update with a measurement failed.
  pub fn flags(&self) -> ErrorFlags {
    if self.filter_failed {
      ErrorFlags::FILTER
    } else {
      ErrorFlags::empty()
    }
  }

  /// Restarts both filters, used when the ground reference changes.
  pub fn reset(&mut self) {
    self.kalman.reset();
    self.orientation.reset();
  }

  /// Runs one tick of both filters and packages the result.
  ///
  /// A measurement class that is not valid this tick is left out of the
  /// update. With neither class valid the filter only predicts.
  pub fn update(
    &mut self,
    measurement: &FusedMeasurement,
    timestamp: Millis,
  ) -> EstimationOutput {
    let validity = measurement.validity;

    let altitude = validity.baro.then_some(measurement.altitude);
    let acceleration = validity
      .imu
      .then_some(measurement.acceleration.z - GRAVITY);

    match self.kalman.step(altitude, acceleration) {
      Ok(()) if altitude.is_some() || acceleration.is_some() => {
        self.filter_failed = false;
      }
      Ok(()) => {}
      Err(_) => self.filter_failed = true,
    }

    if validity.imu {
      self.orientation.update(
        measurement.angular_rate,
        measurement.acceleration,
        DT,
      );
    }

    let [height, velocity, acceleration] = self.kalman.state();

    EstimationOutput {
      height,
      velocity,
      acceleration,
      orientation: self.orientation.orientation(),
      timestamp,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::preprocess::Validity;
  use common::comm::Vector;

  fn at_rest(altitude: f32) -> FusedMeasurement {
    FusedMeasurement {
      acceleration: Vector::new(0.0, 0.0, GRAVITY),
      angular_rate: Vector::ZERO,
      pressure: 100_000.0,
      altitude,
      validity: Validity {
        imu: true,
        baro: true,
      },
    }
  }

  #[test]
  fn settles_on_barometric_height() {
    let mut estimator = Estimator::default();
    let mut output = EstimationOutput::default();

    for tick in 0..500 {
      output = estimator.update(&at_rest(12.0), tick * 10);
    }

    assert!((output.height - 12.0).abs() < 0.5, "{output}");
    assert!(output.velocity.abs() < 0.5, "{output}");
    assert_eq!(output.timestamp, 4_990);
    assert!(estimator.flags().is_empty());
  }

  #[test]
  fn failure_is_flagged_until_next_successful_update() {
    let noise = NoiseModel {
      process: [0.0; 3],
      baro: 0.0,
      accel: 0.0,
      initial: 0.0,
    };
    let mut estimator = Estimator::new(noise);

    let held = estimator.update(&at_rest(5.0), 0);
    assert_eq!(estimator.flags(), ErrorFlags::FILTER);
    assert_eq!(held.height, 0.0);

    // dead reckoning alone does not clear the flag
    let mut blind = at_rest(5.0);
    blind.validity = Validity {
      imu: false,
      baro: false,
    };
    estimator.update(&blind, 10);
    assert_eq!(estimator.flags(), ErrorFlags::FILTER);
  }
}
