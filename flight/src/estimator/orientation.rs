use crate::preprocess::GRAVITY;
use common::comm::{Quaternion, Vector};

/// Proportional gain pulling the attitude towards the measured gravity
/// direction, in 1/s.
const KP: f32 = 1.0;

/// Relative deviation of the specific force from 1 g within which the
/// accelerometer is trusted as a gravity reference.
const ACCEL_TRUST: f32 = 0.1;

/// A complementary attitude filter: integrates the gyro and, while the
/// vehicle is not accelerating, corrects drift towards the measured vertical.
#[derive(Clone, Copy, Debug, Default)]
pub struct OrientationFilter {
  q: Quaternion,
}

impl OrientationFilter {
  /// The current attitude.
  pub fn orientation(&self) -> Quaternion {
    self.q
  }

  /// Forgets the attitude.
  pub fn reset(&mut self) {
    self.q = Quaternion::IDENTITY;
  }

  /// Advances the attitude by `dt` seconds given the calibrated angular rate
  /// in rad/s and specific force in m/s².
  pub fn update(&mut self, rate: Vector, accel: Vector, dt: f32) {
    let mut omega = rate;

    if ((accel.norm() / GRAVITY) - 1.0).abs() <= ACCEL_TRUST {
      if let Some(measured) = accel.normalized() {
        // vertical as the current attitude expects to see it in the body frame
        let expected = self.q.conjugate().rotate(Vector::UNIT_Z);
        omega = omega + measured.cross(expected) * KP;
      }
    }

    let Some(axis) = omega.normalized() else {
      return;
    };

    let step = Quaternion::from_axis_angle(axis, omega.norm() * dt);
    self.q = (self.q * step).normalized();
  }
}
