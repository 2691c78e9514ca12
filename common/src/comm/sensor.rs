use postcard::experimental::max_size::MaxSize;
use serde::{Deserialize, Serialize};
use std::{
  fmt,
  ops::{Add, Mul, Sub},
};

/// Number of redundant IMU units on the vehicle.
pub const NUM_IMU: usize = 3;

/// Number of redundant barometer units on the vehicle.
pub const NUM_BARO: usize = 3;

/// Millisecond timestamp, counted from boot.
pub type Millis = u32;

/// Represents a three-axis vector in the body frame.
#[derive(
  Deserialize, Serialize, Clone, Copy, MaxSize, Debug, PartialEq, Default,
)]
pub struct Vector {
  /// Component along the body X axis.
  pub x: f32,

  /// Component along the body Y axis.
  pub y: f32,

  /// Component along the body Z axis, the long axis of the vehicle.
  pub z: f32,
}

impl Vector {
  /// The zero vector.
  pub const ZERO: Vector = Vector::new(0.0, 0.0, 0.0);

  /// Unit vector along body +Z.
  pub const UNIT_Z: Vector = Vector::new(0.0, 0.0, 1.0);

  /// Constructs a vector from its components.
  pub const fn new(x: f32, y: f32, z: f32) -> Self {
    Vector { x, y, z }
  }

  /// Dot product of two vectors.
  pub fn dot(self, other: Vector) -> f32 {
    self.x * other.x + self.y * other.y + self.z * other.z
  }

  /// Cross product `self × other`.
  pub fn cross(self, other: Vector) -> Vector {
    Vector {
      x: self.y * other.z - self.z * other.y,
      y: self.z * other.x - self.x * other.z,
      z: self.x * other.y - self.y * other.x,
    }
  }

  /// Euclidean length.
  pub fn norm(self) -> f32 {
    self.dot(self).sqrt()
  }

  /// Returns the vector scaled to unit length, or `None` for a (near) zero
  /// vector.
  pub fn normalized(self) -> Option<Vector> {
    let norm = self.norm();

    if norm < f32::EPSILON {
      None
    } else {
      Some(self * (1.0 / norm))
    }
  }

  /// The components as an array, in x, y, z order.
  pub fn to_array(self) -> [f32; 3] {
    [self.x, self.y, self.z]
  }

  /// Builds a vector from an array in x, y, z order.
  pub fn from_array(array: [f32; 3]) -> Self {
    Vector::new(array[0], array[1], array[2])
  }
}

impl Add for Vector {
  type Output = Vector;

  fn add(self, rhs: Vector) -> Vector {
    Vector::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
  }
}

impl Sub for Vector {
  type Output = Vector;

  fn sub(self, rhs: Vector) -> Vector {
    Vector::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
  }
}

impl Mul<f32> for Vector {
  type Output = Vector;

  fn mul(self, rhs: f32) -> Vector {
    Vector::new(self.x * rhs, self.y * rhs, self.z * rhs)
  }
}

impl fmt::Display for Vector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
  }
}

/// A single raw reading of one IMU unit.
#[derive(
  Deserialize, Serialize, Clone, Copy, MaxSize, Debug, PartialEq, Default,
)]
pub struct ImuSample {
  /// Specific force, in units of g.
  pub accel: Vector,

  /// Angular rate, in degrees per second.
  pub gyro: Vector,

  /// Die temperature, in degrees Celsius.
  pub temperature: f32,

  /// When the sample was captured.
  pub timestamp: Millis,
}

/// A single raw reading of one barometer unit.
#[derive(
  Deserialize, Serialize, Clone, Copy, MaxSize, Debug, PartialEq, Default,
)]
pub struct BaroSample {
  /// Static pressure, in pascals.
  pub pressure: f32,

  /// Temperature, in degrees Celsius.
  pub temperature: f32,

  /// When the sample was captured.
  pub timestamp: Millis,
}

/// Every raw sample captured during one tick, indexed by unit.
///
/// The sensor-read collaborator guarantees that unit indices are fixed and
/// that a frame is never torn: all samples belong to the same read cycle.
#[derive(
  Deserialize, Serialize, Clone, Copy, MaxSize, Debug, PartialEq, Default,
)]
pub struct RawFrame {
  /// Samples of the IMU units.
  pub imu: [ImuSample; NUM_IMU],

  /// Samples of the barometer units.
  pub baro: [BaroSample; NUM_BARO],

  /// When the frame was assembled.
  pub timestamp: Millis,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cross_product_is_right_handed() {
    let x = Vector::new(1.0, 0.0, 0.0);
    let y = Vector::new(0.0, 1.0, 0.0);

    assert_eq!(x.cross(y), Vector::UNIT_Z);
  }

  #[test]
  fn zero_vector_cannot_be_normalized() {
    assert!(Vector::ZERO.normalized().is_none());

    let unit = Vector::new(0.0, 3.0, 4.0).normalized().unwrap();
    assert!((unit.norm() - 1.0).abs() < 1e-6);
  }
}
