use crate::ToPrettyString;
use postcard::experimental::max_size::MaxSize;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The flight phase the vehicle is believed to be in.
///
/// Variants are declared in flight order, so the derived ordering can be used
/// to ask questions such as "is the vehicle past Ready".
#[derive(
  Clone,
  Copy,
  Debug,
  Default,
  Deserialize,
  Eq,
  Hash,
  MaxSize,
  Ord,
  PartialEq,
  PartialOrd,
  Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FlightPhase {
  /// No valid estimate has been produced yet.
  #[default]
  Invalid,

  /// On the pad, collecting calibration statistics.
  Calibrating,

  /// Calibrated and waiting for liftoff.
  Ready,

  /// Motor burning.
  Thrusting,

  /// Motor burnt out, still ascending.
  Coasting,

  /// Apogee passed, descending under the drogue.
  DrogueDescent,

  /// Descending under the main canopy.
  MainDescent,

  /// On the ground after flight.
  Touchdown,
}

impl FlightPhase {
  /// Every phase in flight order.
  pub const ALL: [FlightPhase; 8] = [
    FlightPhase::Invalid,
    FlightPhase::Calibrating,
    FlightPhase::Ready,
    FlightPhase::Thrusting,
    FlightPhase::Coasting,
    FlightPhase::DrogueDescent,
    FlightPhase::MainDescent,
    FlightPhase::Touchdown,
  ];

  /// The event emitted when this phase is entered, if any.
  pub fn entry_event(self) -> Option<Event> {
    match self {
      Self::Invalid => None,
      Self::Calibrating => Some(Event::Calibrate),
      Self::Ready => Some(Event::Ready),
      Self::Thrusting => Some(Event::Liftoff),
      Self::Coasting => Some(Event::Burnout),
      Self::DrogueDescent => Some(Event::Apogee),
      Self::MainDescent => Some(Event::MainDeployment),
      Self::Touchdown => Some(Event::Touchdown),
    }
  }

  /// True once the vehicle has left the pad. Configuration is locked and
  /// test triggers are refused from here on.
  pub fn is_in_flight(self) -> bool {
    self >= Self::Thrusting
  }
}

impl fmt::Display for FlightPhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}",
      match self {
        Self::Invalid => "invalid",
        Self::Calibrating => "calibrating",
        Self::Ready => "ready",
        Self::Thrusting => "thrusting",
        Self::Coasting => "coasting",
        Self::DrogueDescent => "drogue_descent",
        Self::MainDescent => "main_descent",
        Self::Touchdown => "touchdown",
      }
    )
  }
}

impl ToPrettyString for FlightPhase {
  /// Colors ground phases green, powered and ballistic flight red and the
  /// recovery phases blue.
  fn to_pretty_string(&self) -> String {
    let color = match self {
      Self::Invalid => "38;5;248",
      Self::Calibrating | Self::Ready => "32",
      Self::Thrusting | Self::Coasting => "31",
      Self::DrogueDescent | Self::MainDescent => "34",
      Self::Touchdown => "33",
    };

    format!("\x1b[{color}m{self}\x1b[0m")
  }
}

/// A discrete occurrence which may have actions bound to it in the
/// `ActionMap`.
#[derive(
  Clone,
  Copy,
  Debug,
  Deserialize,
  Eq,
  Hash,
  MaxSize,
  Ord,
  PartialEq,
  PartialOrd,
  Serialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Event {
  /// Calibration started.
  Calibrate = 0,

  /// Vehicle is ready for launch.
  Ready = 1,

  /// Liftoff detected.
  Liftoff = 2,

  /// Motor burnout detected.
  Burnout = 3,

  /// Apogee detected.
  Apogee = 4,

  /// Main deployment altitude reached.
  MainDeployment = 5,

  /// Touchdown detected.
  Touchdown = 6,

  /// First user-defined event, emitted by a timer.
  Custom1 = 7,

  /// Second user-defined event, emitted by a timer.
  Custom2 = 8,
}

/// Number of distinct events.
pub const NUM_EVENTS: usize = 9;

impl Event {
  /// Every event, ordered by id.
  pub const ALL: [Event; NUM_EVENTS] = [
    Event::Calibrate,
    Event::Ready,
    Event::Liftoff,
    Event::Burnout,
    Event::Apogee,
    Event::MainDeployment,
    Event::Touchdown,
    Event::Custom1,
    Event::Custom2,
  ];

  /// The stable numeric id of the event.
  pub fn id(self) -> u8 {
    self as u8
  }
}

impl TryFrom<u8> for Event {
  type Error = u8;

  fn try_from(id: u8) -> Result<Self, Self::Error> {
    Event::ALL.get(usize::from(id)).copied().ok_or(id)
  }
}

impl fmt::Display for Event {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}",
      match self {
        Self::Calibrate => "calibrate",
        Self::Ready => "ready",
        Self::Liftoff => "liftoff",
        Self::Burnout => "burnout",
        Self::Apogee => "apogee",
        Self::MainDeployment => "main_deployment",
        Self::Touchdown => "touchdown",
        Self::Custom1 => "custom1",
        Self::Custom2 => "custom2",
      }
    )
  }
}

impl FromStr for Event {
  type Err = ();

  fn from_str(string: &str) -> Result<Self, Self::Err> {
    Event::ALL
      .into_iter()
      .find(|event| event.to_string() == string)
      .ok_or(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn event_ids_round_trip() {
    for event in Event::ALL {
      assert_eq!(Event::try_from(event.id()), Ok(event));
      assert_eq!(event.to_string().parse::<Event>(), Ok(event));
    }

    assert_eq!(Event::try_from(NUM_EVENTS as u8), Err(NUM_EVENTS as u8));
  }

  #[test]
  fn display_matches_serialized_names() {
    for event in Event::ALL {
      let json = serde_json::to_value(event).unwrap();
      assert_eq!(json, event.to_string());
    }

    for phase in FlightPhase::ALL {
      let json = serde_json::to_value(phase).unwrap();
      assert_eq!(json, phase.to_string());
    }
  }

  #[test]
  fn phases_are_ordered_in_flight_order() {
    assert!(FlightPhase::ALL.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(!FlightPhase::Ready.is_in_flight());
    assert!(FlightPhase::Thrusting.is_in_flight());
  }
}
