//! Executes the actions bound to events.
//!
//! Phase transitions, expired timers and operator test triggers all end up in
//! `Dispatcher::dispatch`, which walks the event's action list in order. A
//! pyro channel fires at most once per boot.

use crate::{hardware::Actuator, recorder::Recorder};
use common::{
  comm::{
    sensor::Millis,
    Action,
    ActionMap,
    Event,
    FlightPhase,
    Record,
    RecordPayload,
  },
  config::{TestingConfig, TimerConfig, NUM_TIMERS},
};
use std::{collections::BTreeSet, error::Error, fmt};

/// Why a manual test trigger was refused.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TriggerRejected {
  /// Ground test mode is off.
  TestingDisabled,

  /// The phrase did not match the configured one.
  WrongPhrase,

  /// The vehicle is past `Ready`.
  InFlight(FlightPhase),
}

impl fmt::Display for TriggerRejected {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::TestingDisabled => write!(f, "testing mode is disabled"),
      Self::WrongPhrase => write!(f, "test phrase does not match"),
      Self::InFlight(phase) => {
        write!(f, "test triggers are refused while {phase}")
      }
    }
  }
}

impl Error for TriggerRejected {}

#[derive(Clone, Copy, Debug, PartialEq)]
enum TimerState {
  Idle,
  Armed { deadline: Millis },
  Expired,
}

/// Executes actions and keeps the per-boot firing guard and timers.
#[derive(Debug)]
pub struct Dispatcher {
  fired: BTreeSet<u8>,
  timers: [(Option<TimerConfig>, TimerState); NUM_TIMERS],
}

impl Dispatcher {
  /// Constructs a dispatcher with the configured timers idle.
  pub fn new(timers: [Option<TimerConfig>; NUM_TIMERS]) -> Self {
    Dispatcher {
      fired: BTreeSet::new(),
      timers: timers.map(|timer| (timer, TimerState::Idle)),
    }
  }

  /// Takes over new timer settings. Timers already armed keep running.
  pub fn set_timers(&mut self, timers: [Option<TimerConfig>; NUM_TIMERS]) {
    for (slot, timer) in self.timers.iter_mut().zip(timers) {
      if slot.0 != timer {
        *slot = (timer, TimerState::Idle);
      }
    }
  }

  #[cfg(test)]
  pub(crate) fn has_fired(&self, channel: u8) -> bool {
    self.fired.contains(&channel)
  }

  /// Executes every action bound to `event`, in order, and arms the timers
  /// started by it. Returns the actions actually executed; a pyro channel
  /// which has already fired is skipped.
  pub fn dispatch(
    &mut self,
    event: Event,
    now: Millis,
    map: &ActionMap,
    actuator: &mut dyn Actuator,
    recorder: &Recorder,
  ) -> Vec<Action> {
    let mut executed = Vec::with_capacity(map.actions(event).len());

    for action in map.actions(event) {
      match *action {
        Action::FirePyro { channel } => {
          if !self.fired.insert(channel) {
            continue;
          }

          actuator.fire_pyro(channel);
        }
        Action::SetServo { channel, position } => {
          actuator.set_servo(channel, position);
        }
        Action::SetIo { channel, high } => actuator.set_io(channel, high),
        Action::Recorder { enabled } => recorder.set_recording(enabled),
      }

      executed.push(*action);
    }

    let _ = recorder.record(Record::new(now, RecordPayload::Event(event)));

    for action in &executed {
      let _ = recorder.record(Record::new(now, RecordPayload::Action(*action)));
    }

    for (timer, state) in self.timers.iter_mut() {
      let Some(timer) = timer else {
        continue;
      };

      if timer.start == event && *state == TimerState::Idle {
        *state = TimerState::Armed {
          deadline: now.saturating_add(timer.duration_ms),
        };
      }
    }

    executed
  }

  /// The events of every armed timer whose deadline has passed. Each timer
  /// expires once.
  pub fn expired_timers(&mut self, now: Millis) -> Vec<Event> {
    let mut expired = Vec::new();

    for (timer, state) in self.timers.iter_mut() {
      let (Some(timer), TimerState::Armed { deadline }) = (timer, *state) else {
        continue;
      };

      if now >= deadline {
        *state = TimerState::Expired;
        expired.push(timer.trigger);
      }
    }

    expired
  }

  /// Dispatches `event` on behalf of the operator, bypassing the sensor
  /// conditions but not the firing guard. Nothing happens when the trigger
  /// is refused.
  pub fn trigger(
    &mut self,
    event: Event,
    phrase: &str,
    phase: FlightPhase,
    testing: &TestingConfig,
    now: Millis,
    map: &ActionMap,
    actuator: &mut dyn Actuator,
    recorder: &Recorder,
  ) -> Result<Vec<Action>, TriggerRejected> {
    if !testing.enabled {
      return Err(TriggerRejected::TestingDisabled);
    }

    if !testing.accepts(phrase) {
      return Err(TriggerRejected::WrongPhrase);
    }

    if phase > FlightPhase::Ready {
      return Err(TriggerRejected::InFlight(phase));
    }

    Ok(self.dispatch(event, now, map, actuator, recorder))
  }
}
