//! The seams between the flight core and the board it runs on. Register level
//! drivers live behind these traits; the core never talks to a bus directly.

use common::comm::RawFrame;

/// Produces one frame of raw samples from every sensor unit.
pub trait SensorSource: Send {
  /// Reads every unit once. The frame is never torn: all samples belong to
  /// the same read cycle and each unit keeps its index.
  fn read(&mut self) -> RawFrame;
}

/// Drives the vehicle's outputs.
pub trait Actuator: Send {
  /// Fires the pyro channel. A fire is never cancelled once issued.
  fn fire_pyro(&mut self, channel: u8);

  /// Commands a servo, `position` in tenths of a percent of travel.
  fn set_servo(&mut self, channel: u8, position: u16);

  /// Drives a low-level digital output.
  fn set_io(&mut self, channel: u8, high: bool);
}

/// Measures whether an igniter is connected to a pyro channel.
pub trait Continuity: Send {
  /// True if the channel's circuit is closed.
  fn has_continuity(&self, channel: u8) -> bool;
}

/// Measures the supply.
pub trait PowerSensor: Send {
  /// Battery voltage, in volts.
  fn battery_voltage(&self) -> f32;
}
