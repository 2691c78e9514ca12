/// Raw samples produced by the redundant IMU and barometer units.
pub mod sensor;

/// The immutable state estimate published after every control tick.
pub mod estimate;

/// Flight phases and the events emitted when they change.
pub mod phase;

/// Configurable actions and the event to action table.
pub mod action;

/// The process-wide set of active fault conditions.
pub mod error;

/// Timestamped records accepted by the recording collaborator.
pub mod record;

pub use action::{Action, ActionMap, ActionMapError, OutputLayout};
pub use error::ErrorFlags;
pub use estimate::{EstimationOutput, Quaternion};
pub use phase::{Event, FlightPhase};
pub use record::{Record, RecordPayload};
pub use sensor::{BaroSample, ImuSample, RawFrame, Vector};
