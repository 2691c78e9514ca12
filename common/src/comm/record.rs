use super::{
  action::Action,
  error::ErrorFlags,
  estimate::EstimationOutput,
  phase::{Event, FlightPhase},
  sensor::{BaroSample, ImuSample, Millis},
};
use postcard::experimental::max_size::MaxSize;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Everything the flight computer hands to the recording collaborator.
#[derive(Clone, Copy, Debug, Deserialize, MaxSize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordPayload {
  /// A raw sample of one IMU unit.
  Imu {
    /// Index of the unit.
    unit: u8,

    /// The sample as read.
    sample: ImuSample,
  },

  /// A raw sample of one barometer unit.
  Baro {
    /// Index of the unit.
    unit: u8,

    /// The sample as read.
    sample: BaroSample,
  },

  /// Battery voltage, in millivolts.
  Voltage(u16),

  /// The state estimate of one tick.
  Estimation(EstimationOutput),

  /// A flight phase transition.
  PhaseChange {
    /// The phase left.
    from: FlightPhase,

    /// The phase entered.
    to: FlightPhase,
  },

  /// An event was dispatched.
  Event(Event),

  /// An action was executed.
  Action(Action),

  /// The set of active error flags changed.
  ErrorChange {
    /// Flags raised by this change.
    raised: ErrorFlags,

    /// Flags cleared by this change.
    cleared: ErrorFlags,

    /// Every flag active after the change.
    active: ErrorFlags,
  },
}

/// A timestamped, tagged record.
#[derive(Clone, Copy, Debug, Deserialize, MaxSize, PartialEq, Serialize)]
pub struct Record {
  /// Milliseconds since boot.
  pub timestamp: Millis,

  /// What was recorded.
  pub payload: RecordPayload,
}

impl Record {
  /// Constructs a record.
  pub fn new(timestamp: Millis, payload: RecordPayload) -> Self {
    Record { timestamp, payload }
  }
}

impl fmt::Display for Record {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{:>8} ms] ", self.timestamp)?;

    match &self.payload {
      RecordPayload::Imu { unit, sample } => write!(
        f,
        "imu {unit}: accel {} g, gyro {} deg/s",
        sample.accel, sample.gyro
      ),
      RecordPayload::Baro { unit, sample } => {
        write!(f, "baro {unit}: {:.1} Pa", sample.pressure)
      }
      RecordPayload::Voltage(millivolts) => {
        write!(f, "battery {:.2} V", f32::from(*millivolts) / 1000.0)
      }
      RecordPayload::Estimation(estimate) => write!(f, "{estimate}"),
      RecordPayload::PhaseChange { from, to } => write!(f, "{from} -> {to}"),
      RecordPayload::Event(event) => write!(f, "event {event}"),
      RecordPayload::Action(action) => write!(f, "action {action}"),
      RecordPayload::ErrorChange { active, .. } => {
        write!(f, "errors: {active}")
      }
    }
  }
}
