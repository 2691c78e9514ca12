use common::{
  comm::Vector,
  config::{AccelCalibration, CalibrationData},
};

/// Consistent samples required before calibration may converge.
pub const CALIB_SAMPLES: u32 = 100;

/// Inconsistent samples tolerated before calibration is abandoned.
pub const MAX_FAULTY_CALIB: u32 = 100;

/// Largest gyro magnitude of a still vehicle, in deg/s.
pub const CALIB_GYRO_LIMIT: f32 = 5.0;

/// Largest summed per-axis gyro variance of a still vehicle, in (deg/s)².
pub const CALIB_VARIANCE_LIMIT: f32 = 0.5;

/// Relative deviation of the acceleration magnitude from 1 g still accepted.
pub const CALIB_ACCEL_TOLERANCE: f32 = 0.1;

/// Where the calibration procedure stands.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CalibrationStatus {
  /// Accumulating still samples.
  Collecting,

  /// Enough still samples were seen.
  Converged {
    /// The derived calibration.
    data: CalibrationData,

    /// Mean static pressure over the accumulated samples, in pascals.
    ground_pressure: f32,
  },

  /// Too many inconsistent samples were seen. The seed calibration remains
  /// in use.
  Aborted,
}

/// Derives gyro bias and gravity alignment from a vehicle at rest.
#[derive(Clone, Debug)]
pub struct Calibrator {
  status: CalibrationStatus,
  count: u32,
  faulty: u32,
  gyro_sum: Vector,
  gyro_square_sum: Vector,
  accel_sum: Vector,
  pressure_sum: f64,
}

impl Default for Calibrator {
  fn default() -> Self {
    Calibrator {
      status: CalibrationStatus::Collecting,
      count: 0,
      faulty: 0,
      gyro_sum: Vector::ZERO,
      gyro_square_sum: Vector::ZERO,
      accel_sum: Vector::ZERO,
      pressure_sum: 0.0,
    }
  }
}

impl Calibrator {
  /// The current status.
  pub fn status(&self) -> CalibrationStatus {
    self.status
  }

  /// Forgets everything and starts collecting again.
  pub fn restart(&mut self) {
    *self = Calibrator::default();
  }

  fn reset_accumulation(&mut self) {
    self.count = 0;
    self.gyro_sum = Vector::ZERO;
    self.gyro_square_sum = Vector::ZERO;
    self.accel_sum = Vector::ZERO;
    self.pressure_sum = 0.0;
  }

  fn reject(&mut self) {
    self.reset_accumulation();
    self.faulty += 1;

    if self.faulty >= MAX_FAULTY_CALIB {
      self.status = CalibrationStatus::Aborted;
    }
  }

  /// Feeds one fused, uncalibrated sample. Acceleration is in g and angular
  /// rate in deg/s. Does nothing once the procedure has finished.
  pub fn feed(
    &mut self,
    accel: Vector,
    gyro: Vector,
    pressure: f32,
  ) -> CalibrationStatus {
    if self.status != CalibrationStatus::Collecting {
      return self.status;
    }

    let still = gyro.norm() < CALIB_GYRO_LIMIT
      && (accel.norm() - 1.0).abs() <= CALIB_ACCEL_TOLERANCE;

    if !still {
      self.reject();
      return self.status;
    }

    self.count += 1;
    self.gyro_sum = self.gyro_sum + gyro;
    self.gyro_square_sum = self.gyro_square_sum
      + Vector::new(gyro.x * gyro.x, gyro.y * gyro.y, gyro.z * gyro.z);
    self.accel_sum = self.accel_sum + accel;
    self.pressure_sum += f64::from(pressure);

    if self.count < CALIB_SAMPLES {
      return self.status;
    }

    let n = self.count as f32;
    let gyro_mean = self.gyro_sum * (1.0 / n);
    let square_mean = self.gyro_square_sum * (1.0 / n);
    let variance = (square_mean.x - gyro_mean.x * gyro_mean.x)
      + (square_mean.y - gyro_mean.y * gyro_mean.y)
      + (square_mean.z - gyro_mean.z * gyro_mean.z);

    if variance >= CALIB_VARIANCE_LIMIT {
      self.reject();
      return self.status;
    }

    let accel_mean = self.accel_sum * (1.0 / n);

    self.status = CalibrationStatus::Converged {
      data: CalibrationData {
        gyro_bias: gyro_mean,
        accel: align_with_z(accel_mean),
      },
      ground_pressure: (self.pressure_sum / f64::from(self.count)) as f32,
    };

    self.status
  }
}

/// The rotation which takes `gravity` onto body +Z.
pub fn align_with_z(gravity: Vector) -> AccelCalibration {
  let Some(direction) = gravity.normalized() else {
    return CalibrationData::default().accel;
  };

  let cos = direction.dot(Vector::UNIT_Z).clamp(-1.0, 1.0);

  match direction.cross(Vector::UNIT_Z).normalized() {
    Some(axis) => AccelCalibration {
      axis,
      angle: cos.acos(),
    },
    None if cos > 0.0 => CalibrationData::default().accel,
    None => AccelCalibration {
      axis: Vector::new(1.0, 0.0, 0.0),
      angle: std::f32::consts::PI,
    },
  }
}

/// Rotates `v` about the unit `axis` by `angle` radians (Rodrigues).
pub fn rotate(v: Vector, calibration: &AccelCalibration) -> Vector {
  let k = calibration.axis;
  let (sin, cos) = calibration.angle.sin_cos();

  v * cos + k.cross(v) * sin + k * (k.dot(v) * (1.0 - cos))
}
