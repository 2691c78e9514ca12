//! The flight phase state machine.
//!
//! Each phase owns one function that checks only that phase's outgoing
//! edges. The machine never skips a phase and, apart from the ground test
//! loopback from `Ready` to `Calibrating`, only ever moves forward.

use common::{
  comm::{ErrorFlags, EstimationOutput, Event, FlightPhase},
  config::Thresholds,
};
use std::fmt;

/// Length of one control tick, in milliseconds.
pub const TICK_MS: u32 = 10;

/// Everything a phase may look at when deciding whether to move on.
#[derive(Clone, Copy, Debug)]
pub struct PhaseInputs {
  /// The estimate of this tick.
  pub estimate: EstimationOutput,

  /// Every active error flag.
  pub flags: ErrorFlags,

  /// Calibration has converged.
  pub calibrated: bool,

  /// The operator asked for a recalibration this tick.
  pub recalibrate: bool,

  /// Ground test mode is enabled.
  pub testing: bool,
}

/// A phase change and the event it emits.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transition {
  /// The phase left.
  pub from: FlightPhase,

  /// The phase entered.
  pub to: FlightPhase,

  /// The event emitted by entering `to`.
  pub event: Event,
}

impl fmt::Display for Transition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} -> {} ({})", self.from, self.to, self.event)
  }
}

type PhaseFn = fn(&mut FlightStateMachine, &PhaseInputs) -> Option<FlightPhase>;

/// The outgoing edge check of every phase, indexed in flight order.
pub const TRANSITIONS: [(FlightPhase, PhaseFn); 8] = [
  (FlightPhase::Invalid, invalid),
  (FlightPhase::Calibrating, calibrating),
  (FlightPhase::Ready, ready),
  (FlightPhase::Thrusting, thrusting),
  (FlightPhase::Coasting, coasting),
  (FlightPhase::DrogueDescent, drogue_descent),
  (FlightPhase::MainDescent, main_descent),
  (FlightPhase::Touchdown, touchdown),
];

/// Number of ticks a condition lasting `ms` milliseconds spans.
fn dwell_ticks(ms: u32) -> u32 {
  (ms / TICK_MS).max(1)
}

/// Decides the flight phase from the stream of estimates.
#[derive(Clone, Debug)]
pub struct FlightStateMachine {
  phase: FlightPhase,
  thresholds: Thresholds,

  /// Consecutive ticks the current phase's dwell condition has held.
  dwell: u32,

  /// Ticks spent in the current phase.
  ticks_in_phase: u32,

  /// Velocity of the previous tick.
  previous_velocity: Option<f32>,
  thrusted: bool,
}

impl FlightStateMachine {
  /// Constructs a machine in `Invalid`.
  pub fn new(thresholds: Thresholds) -> Self {
    FlightStateMachine {
      phase: FlightPhase::Invalid,
      thresholds,
      dwell: 0,
      ticks_in_phase: 0,
      previous_velocity: None,
      thrusted: false,
    }
  }

  /// The current phase.
  pub fn phase(&self) -> FlightPhase {
    self.phase
  }

  /// Replaces the thresholds, used when the configuration changes on the
  /// ground.
  pub fn set_thresholds(&mut self, thresholds: Thresholds) {
    self.thresholds = thresholds;
  }

  /// Advances by one tick, returning the transition taken, if any.
  pub fn step(&mut self, inputs: &PhaseInputs) -> Option<Transition> {
    self.ticks_in_phase = self.ticks_in_phase.saturating_add(1);

    let (_, check) = TRANSITIONS[self.phase as usize];
    let next = check(self, inputs);

    self.previous_velocity = Some(inputs.estimate.velocity);

    let to = next?;
    let from = self.phase;

    self.phase = to;
    self.dwell = 0;
    self.ticks_in_phase = 0;

    if to == FlightPhase::Thrusting {
      self.thrusted = true;
    }

    Some(Transition {
      from,
      to,
      event: to.entry_event()?,
    })
  }

  /// Counts a dwell condition, returning true once it has held for `ms`.
  fn held_for(&mut self, condition: bool, ms: u32) -> bool {
    if condition {
      self.dwell += 1;
    } else {
      self.dwell = 0;
    }

    self.dwell >= dwell_ticks(ms)
  }
}

fn invalid(_: &mut FlightStateMachine, _: &PhaseInputs) -> Option<FlightPhase> {
  Some(FlightPhase::Calibrating)
}

fn calibrating(
  _: &mut FlightStateMachine,
  inputs: &PhaseInputs,
) -> Option<FlightPhase> {
  (inputs.calibrated && !inputs.flags.blocks_arming())
    .then_some(FlightPhase::Ready)
}

fn ready(
  machine: &mut FlightStateMachine,
  inputs: &PhaseInputs,
) -> Option<FlightPhase> {
  if inputs.recalibrate && inputs.testing && !machine.thrusted {
    return Some(FlightPhase::Calibrating);
  }

  let thresholds = machine.thresholds;
  let accelerating = inputs.estimate.acceleration
    > thresholds.liftoff_acceleration
    && !inputs.flags.blocks_arming();

  machine
    .held_for(accelerating, thresholds.liftoff_dwell_ms)
    .then_some(FlightPhase::Thrusting)
}

fn thrusting(
  machine: &mut FlightStateMachine,
  inputs: &PhaseInputs,
) -> Option<FlightPhase> {
  let thresholds = machine.thresholds;
  let burnt_out =
    inputs.estimate.acceleration < thresholds.burnout_acceleration;

  machine
    .held_for(burnt_out, thresholds.burnout_dwell_ms)
    .then_some(FlightPhase::Coasting)
}

fn coasting(
  machine: &mut FlightStateMachine,
  inputs: &PhaseInputs,
) -> Option<FlightPhase> {
  let velocity = inputs.estimate.velocity;
  let crossed = machine
    .previous_velocity
    .is_some_and(|previous| previous > 0.0 && velocity <= 0.0);

  let timed_out = machine.ticks_in_phase
    >= dwell_ticks(machine.thresholds.apogee_timeout_ms);

  (crossed || timed_out).then_some(FlightPhase::DrogueDescent)
}

fn drogue_descent(
  machine: &mut FlightStateMachine,
  inputs: &PhaseInputs,
) -> Option<FlightPhase> {
  (inputs.estimate.height < machine.thresholds.main_altitude)
    .then_some(FlightPhase::MainDescent)
}

fn main_descent(
  machine: &mut FlightStateMachine,
  inputs: &PhaseInputs,
) -> Option<FlightPhase> {
  let thresholds = machine.thresholds;
  let landed = inputs.estimate.velocity.abs() < thresholds.touchdown_velocity
    && inputs.estimate.height.abs() < thresholds.touchdown_height;

  machine
    .held_for(landed, thresholds.touchdown_dwell_ms)
    .then_some(FlightPhase::Touchdown)
}

fn touchdown(
  _: &mut FlightStateMachine,
  _: &PhaseInputs,
) -> Option<FlightPhase> {
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  fn inputs(height: f32, velocity: f32, acceleration: f32) -> PhaseInputs {
    PhaseInputs {
      estimate: EstimationOutput {
        height,
        velocity,
        acceleration,
        ..EstimationOutput::default()
      },
      flags: ErrorFlags::empty(),
      calibrated: true,
      recalibrate: false,
      testing: false,
    }
  }

  fn ready_machine() -> FlightStateMachine {
    let mut machine = FlightStateMachine::new(Thresholds::default());
    let rest = inputs(0.0, 0.0, 0.0);

    assert_eq!(machine.step(&rest).map(|t| t.event), Some(Event::Calibrate));
    assert_eq!(machine.step(&rest).map(|t| t.event), Some(Event::Ready));
    machine
  }

  #[test]
  fn transition_table_is_in_flight_order() {
    for (index, (phase, _)) in TRANSITIONS.iter().enumerate() {
      assert_eq!(*phase as usize, index);
    }
  }

  #[test]
  fn liftoff_fires_on_fifth_qualifying_tick() {
    let mut machine = ready_machine();
    let boost = inputs(0.0, 0.0, 40.0);

    for _ in 0..4 {
      assert_eq!(machine.step(&boost), None);
    }

    let transition = machine.step(&boost).unwrap();
    assert_eq!(transition.event, Event::Liftoff);
    assert_eq!(machine.phase(), FlightPhase::Thrusting);
  }

  #[test]
  fn interrupted_dwell_starts_over() {
    let mut machine = ready_machine();
    let boost = inputs(0.0, 0.0, 40.0);

    for _ in 0..4 {
      machine.step(&boost);
    }

    machine.step(&inputs(0.0, 0.0, 0.0));

    for _ in 0..4 {
      assert_eq!(machine.step(&boost), None);
    }

    assert!(machine.step(&boost).is_some());
  }

  #[test]
  fn blocking_flag_prevents_liftoff() {
    let mut machine = ready_machine();
    let mut boost = inputs(0.0, 0.0, 40.0);
    boost.flags = ErrorFlags::NO_PYRO_0;

    for _ in 0..100 {
      assert_eq!(machine.step(&boost), None);
    }

    assert_eq!(machine.phase(), FlightPhase::Ready);
  }

  #[test]
  fn blocking_flag_prevents_ready() {
    let mut machine = FlightStateMachine::new(Thresholds::default());
    let mut rest = inputs(0.0, 0.0, 0.0);
    rest.flags = ErrorFlags::BAT_CRITICAL;

    machine.step(&rest);
    assert_eq!(machine.step(&rest), None);
    assert_eq!(machine.phase(), FlightPhase::Calibrating);

    rest.flags = ErrorFlags::BAT_LOW;
    assert!(machine.step(&rest).is_some());
  }

  #[test]
  fn full_flight_visits_every_phase_in_order() {
    let mut machine = ready_machine();
    let mut events = vec![];

    let mut run = |machine: &mut FlightStateMachine,
                   input: PhaseInputs,
                   ticks: usize| {
      for _ in 0..ticks {
        if let Some(transition) = machine.step(&input) {
          events.push(transition.event);
        }
      }
    };

    run(&mut machine, inputs(10.0, 20.0, 60.0), 10);
    run(&mut machine, inputs(300.0, 80.0, -12.0), 20);
    run(&mut machine, inputs(800.0, 0.5, -9.8), 3);
    run(&mut machine, inputs(800.0, -0.5, -9.8), 1);
    run(&mut machine, inputs(150.0, -20.0, 0.0), 1);
    run(&mut machine, inputs(0.5, -0.2, 0.0), 100);

    assert_eq!(
      events,
      [
        Event::Liftoff,
        Event::Burnout,
        Event::Apogee,
        Event::MainDeployment,
        Event::Touchdown,
      ]
    );
    assert_eq!(machine.phase(), FlightPhase::Touchdown);
  }

  #[test]
  fn apogee_timeout_forces_drogue() {
    let thresholds = Thresholds {
      apogee_timeout_ms: 1_000,
      ..Thresholds::default()
    };
    let mut machine = FlightStateMachine::new(thresholds);
    machine.phase = FlightPhase::Coasting;

    let climbing = inputs(500.0, 10.0, -9.8);

    for _ in 0..99 {
      assert_eq!(machine.step(&climbing), None);
    }

    assert_eq!(machine.step(&climbing).unwrap().event, Event::Apogee);
  }

  #[test]
  fn velocity_sign_change_declares_apogee() {
    let mut machine = FlightStateMachine::new(Thresholds::default());
    machine.phase = FlightPhase::Coasting;

    assert_eq!(machine.step(&inputs(700.0, 5.0, -9.8)), None);

    let transition = machine.step(&inputs(701.0, -1.0, -9.8)).unwrap();
    assert_eq!(transition.from, FlightPhase::Coasting);
    assert_eq!(transition.to, FlightPhase::DrogueDescent);
    assert_eq!(transition.event, Event::Apogee);
  }

  #[test]
  fn recalibration_loopback_needs_testing_mode() {
    let mut machine = ready_machine();
    let mut request = inputs(0.0, 0.0, 0.0);
    request.recalibrate = true;

    assert_eq!(machine.step(&request), None);

    request.testing = true;
    let transition = machine.step(&request).unwrap();
    assert_eq!(transition.to, FlightPhase::Calibrating);
    assert_eq!(transition.event, Event::Calibrate);
  }
}
