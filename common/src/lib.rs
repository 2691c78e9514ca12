#![warn(missing_docs)]

//! Common consists of the shared types of the flight computer core. Every
//! value that crosses a task boundary or leaves the vehicle, such as sensor
//! samples, state estimates, flight phases, events, actions, error flags and
//! telemetry records, is defined here along with the persisted configuration.

/// All structs and definitions exchanged between the flight computer tasks and
/// its recording / telemetry collaborators.
pub mod comm;

/// The persisted flight configuration and its built-in defaults.
pub mod config;

/// Trait providing a method to create a pretty, terminal-friendly
/// representation of the underlying.
pub trait ToPrettyString {
  /// Provides a representation of the underlying which is preferable when
  /// displaying to the console but not as a raw string.
  ///
  /// ANSI codes such as color codes, for example, can be used in a "pretty
  /// string" but would be atypical in a `fmt::Display` implementation.
  fn to_pretty_string(&self) -> String;
}
