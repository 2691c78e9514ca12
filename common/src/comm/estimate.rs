use super::sensor::{Millis, Vector};
use postcard::experimental::max_size::MaxSize;
use serde::{Deserialize, Serialize};
use std::{fmt, ops::Mul};

/// A rotation from the body frame into the local level frame, stored as a
/// unit quaternion.
#[derive(Deserialize, Serialize, Clone, Copy, MaxSize, Debug, PartialEq)]
pub struct Quaternion {
  /// Scalar part.
  pub w: f32,

  /// X component of the vector part.
  pub x: f32,

  /// Y component of the vector part.
  pub y: f32,

  /// Z component of the vector part.
  pub z: f32,
}

impl Default for Quaternion {
  fn default() -> Self {
    Quaternion::IDENTITY
  }
}

impl Quaternion {
  /// The rotation which leaves every vector unchanged.
  pub const IDENTITY: Quaternion = Quaternion {
    w: 1.0,
    x: 0.0,
    y: 0.0,
    z: 0.0,
  };

  /// Constructs the rotation of `angle` radians about the (unit) `axis`.
  pub fn from_axis_angle(axis: Vector, angle: f32) -> Self {
    let (sin, cos) = (angle / 2.0).sin_cos();

    Quaternion {
      w: cos,
      x: axis.x * sin,
      y: axis.y * sin,
      z: axis.z * sin,
    }
  }

  /// The conjugate, which is the inverse rotation for a unit quaternion.
  pub fn conjugate(self) -> Self {
    Quaternion {
      w: self.w,
      x: -self.x,
      y: -self.y,
      z: -self.z,
    }
  }

  /// Returns the quaternion rescaled to unit length. A degenerate quaternion
  /// collapses back to the identity.
  pub fn normalized(self) -> Self {
    let norm = (self.w * self.w
      + self.x * self.x
      + self.y * self.y
      + self.z * self.z)
      .sqrt();

    if norm < f32::EPSILON || !norm.is_finite() {
      return Quaternion::IDENTITY;
    }

    Quaternion {
      w: self.w / norm,
      x: self.x / norm,
      y: self.y / norm,
      z: self.z / norm,
    }
  }

  /// Rotates a body-frame vector into the level frame.
  pub fn rotate(self, vector: Vector) -> Vector {
    let pure = Quaternion {
      w: 0.0,
      x: vector.x,
      y: vector.y,
      z: vector.z,
    };
    let rotated = self * pure * self.conjugate();

    Vector::new(rotated.x, rotated.y, rotated.z)
  }

  /// Angle between the body +Z axis and the level-frame vertical, in degrees.
  pub fn tilt_degrees(self) -> f32 {
    let up = self.rotate(Vector::UNIT_Z);
    up.z.clamp(-1.0, 1.0).acos().to_degrees()
  }
}

impl Mul for Quaternion {
  type Output = Quaternion;

  fn mul(self, rhs: Quaternion) -> Quaternion {
    Quaternion {
      w: self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
      x: self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
      y: self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
      z: self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
    }
  }
}

/// The state estimate produced by the estimator after every control tick.
///
/// Exposed to the dispatcher, health monitor and telemetry as an immutable
/// copy; nothing downstream can alter the estimator's internal state.
#[derive(
  Deserialize, Serialize, Clone, Copy, MaxSize, Debug, PartialEq, Default,
)]
pub struct EstimationOutput {
  /// Height above the ground reference, in meters.
  pub height: f32,

  /// Vertical velocity, in meters per second, positive up.
  pub velocity: f32,

  /// Vertical acceleration with gravity removed, in meters per second
  /// squared, positive up.
  pub acceleration: f32,

  /// Attitude of the vehicle.
  pub orientation: Quaternion,

  /// Tick time of the measurement this estimate incorporates.
  pub timestamp: Millis,
}

impl fmt::Display for EstimationOutput {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "h = {:.2} m, v = {:.2} m/s, a = {:.2} m/s², tilt = {:.1}°",
      self.height,
      self.velocity,
      self.acceleration,
      self.orientation.tilt_degrees()
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn quarter_turn_about_x_maps_z_onto_minus_y() {
    let q = Quaternion::from_axis_angle(
      Vector::new(1.0, 0.0, 0.0),
      std::f32::consts::FRAC_PI_2,
    );
    let rotated = q.rotate(Vector::UNIT_Z);

    assert!(rotated.x.abs() < 1e-6);
    assert!((rotated.y + 1.0).abs() < 1e-6);
    assert!(rotated.z.abs() < 1e-6);
    assert!((q.tilt_degrees() - 90.0).abs() < 1e-3);
  }
}
