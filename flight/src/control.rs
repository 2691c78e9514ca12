//! The 100 Hz control task: preprocessing, estimation, the phase machine and
//! action dispatch, in that order, on one thread.

use crate::{
  dispatch::Dispatcher,
  estimator::Estimator,
  fsm::{FlightStateMachine, PhaseInputs, TICK_MS},
  hardware::{Actuator, SensorSource},
  preprocess::{FusedMeasurement, Preprocessor},
  snapshot::SnapshotReader,
  state::{SharedState, Ticker},
};
use common::{
  comm::{
    sensor::Millis,
    Action,
    ErrorFlags,
    Event,
    FlightPhase,
    RawFrame,
    Record,
    RecordPayload,
  },
  config::{CalibrationData, Config},
};
use jeflog::{pass, warn};
use std::{
  sync::{mpsc::Receiver, Arc},
  time::Duration,
};

/// Period of the control and sensor threads.
pub const CONTROL_PERIOD: Duration = Duration::from_millis(TICK_MS as u64);

/// Longest wait for the newest raw frame.
pub const FRAME_TIMEOUT: Duration = Duration::from_millis(2);

/// Consecutive ticks without a fresh frame before data counts as stale.
pub const STALE_TICKS: u32 = 3;

/// Requests from the ground, serviced at the end of a control tick.
#[derive(Clone, Debug, PartialEq)]
pub enum GroundCommand {
  /// Dispatch `event` as a test, if `phrase` is accepted.
  Trigger { event: Event, phrase: String },

  /// Calibrate again, either restarting a running calibration or looping
  /// back from `Ready`.
  Recalibrate,
}

/// Everything the control task owns between ticks.
#[derive(Debug)]
pub struct ControlLoop<A: Actuator> {
  preprocessor: Preprocessor,
  estimator: Estimator,
  fsm: FlightStateMachine,
  dispatcher: Dispatcher,
  actuator: A,

  /// Cached configuration, refreshed when the generation changes.
  config: Arc<Config>,
  generation: u64,

  /// Time of the previous tick.
  last_tick: Option<Millis>,
}

impl<A: Actuator> ControlLoop<A> {
  /// Constructs the control task from the configuration in effect, driving
  /// every servo to its initial position.
  pub fn new(shared: &SharedState, mut actuator: A) -> Self {
    let generation = shared.config.generation();
    let config = shared.config.current();

    let servos = config.outputs.servo_channels;

    for (channel, &position) in (0..servos).zip(&config.initial_servo_positions)
    {
      actuator.set_servo(channel, position);
    }

    ControlLoop {
      preprocessor: Preprocessor::new(config.sensors, config.calibration),
      estimator: Estimator::default(),
      fsm: FlightStateMachine::new(config.thresholds),
      dispatcher: Dispatcher::new(config.timers),
      actuator,
      config,
      generation,
      last_tick: None,
    }
  }

  #[cfg(test)]
  pub(crate) fn phase(&self) -> FlightPhase {
    self.fsm.phase()
  }

  #[cfg(test)]
  pub(crate) fn actuator(&self) -> &A {
    &self.actuator
  }

  /// Runs one control tick on `frame`, then services `commands`.
  pub fn tick(
    &mut self,
    frame: &RawFrame,
    shared: &SharedState,
    commands: impl IntoIterator<Item = GroundCommand>,
  ) {
    self.refresh_config(shared);
    record_frame(frame, shared);

    let measurement = self.preprocessor.process(frame, self.fsm.phase());
    self.advance(measurement, frame.timestamp, shared, commands);
  }

  /// Runs one control tick without a fresh frame. The estimator dead reckons
  /// on the held values while the phase machine, the timers and `commands`
  /// are serviced as usual. Time advances by one tick from the previous one.
  pub fn tick_without_frame(
    &mut self,
    shared: &SharedState,
    commands: impl IntoIterator<Item = GroundCommand>,
  ) {
    self.refresh_config(shared);

    let now = self
      .last_tick
      .map_or_else(|| shared.now(), |last| last.wrapping_add(TICK_MS));
    let measurement = self.preprocessor.held();

    self.advance(measurement, now, shared, commands);
  }

  fn advance(
    &mut self,
    measurement: FusedMeasurement,
    now: Millis,
    shared: &SharedState,
    commands: impl IntoIterator<Item = GroundCommand>,
  ) {
    self.last_tick = Some(now);

    let mut recalibrate = false;
    let mut triggers = Vec::new();

    for command in commands {
      match command {
        GroundCommand::Recalibrate => recalibrate = true,
        GroundCommand::Trigger { event, phrase } => {
          triggers.push((event, phrase))
        }
      }
    }

    let phase = self.fsm.phase();

    if let Some(calibration) = self.preprocessor.take_unsaved_calibration() {
      // heights so far are relative to the first sample, not the ground
      self.estimator.reset();
      self.store_calibration(calibration, shared);
    }

    let estimate = self.estimator.update(&measurement, now);
    shared.estimate.publish(estimate);

    let _ = shared
      .recorder
      .record(Record::new(now, RecordPayload::Estimation(estimate)));

    shared.update_errors(
      Preprocessor::OWNED_FLAGS,
      self.preprocessor.flags(),
      now,
    );
    shared.update_errors(ErrorFlags::FILTER, self.estimator.flags(), now);

    if recalibrate && phase == FlightPhase::Calibrating {
      pass!("Restarting calibration.");
      self.preprocessor.restart_calibration();
    }

    let inputs = PhaseInputs {
      estimate,
      flags: shared.errors.get(),
      calibrated: self.preprocessor.is_calibrated(),
      recalibrate,
      testing: self.config.testing.enabled,
    };

    if let Some(transition) = self.fsm.step(&inputs) {
      shared.phase.publish(transition.to);
      let executed = self.dispatch(transition.event, now, shared);

      let _ = shared.recorder.record(Record::new(
        now,
        RecordPayload::PhaseChange {
          from: transition.from,
          to: transition.to,
        },
      ));

      if transition.to == FlightPhase::Calibrating {
        self.preprocessor.restart_calibration();
      }

      pass!("{transition} at {now} ms, {estimate}.");
      log_actions(transition.event, &executed);
    } else if recalibrate && phase == FlightPhase::Ready {
      warn!("Recalibration refused. Testing mode must be enabled.");
    }

    for event in self.dispatcher.expired_timers(now) {
      let executed = self.dispatch(event, now, shared);
      pass!("Timer emitted {event} at {now} ms.");
      log_actions(event, &executed);
    }

    for (event, phrase) in triggers {
      let result = self.dispatcher.trigger(
        event,
        &phrase,
        self.fsm.phase(),
        &self.config.testing,
        now,
        &self.config.action_map,
        &mut self.actuator,
        &shared.recorder,
      );

      match result {
        Ok(executed) => {
          pass!("Test trigger {event} accepted.");
          log_actions(event, &executed);
        }
        Err(error) => warn!("Test trigger {event} rejected: {error}."),
      }
    }
  }

  fn dispatch(
    &mut self,
    event: Event,
    now: Millis,
    shared: &SharedState,
  ) -> Vec<Action> {
    self.dispatcher.dispatch(
      event,
      now,
      &self.config.action_map,
      &mut self.actuator,
      &shared.recorder,
    )
  }

  fn refresh_config(&mut self, shared: &SharedState) {
    let generation = shared.config.generation();

    if generation == self.generation {
      return;
    }

    self.generation = generation;

    // a write racing the liftoff edge must not reach the flight
    if self.fsm.phase().is_in_flight() {
      warn!("Configuration generation {generation} ignored in flight.");
      return;
    }

    self.config = shared.config.current();

    self.fsm.set_thresholds(self.config.thresholds);
    self.dispatcher.set_timers(self.config.timers);
    self.preprocessor.set_config(self.config.sensors);
  }

  fn store_calibration(
    &mut self,
    calibration: CalibrationData,
    shared: &SharedState,
  ) {
    let mut config = (*self.config).clone();
    config.calibration = calibration;

    match shared.write_config(config) {
      Ok(()) => pass!(
        "Calibration converged with gyro bias {} deg/s.",
        calibration.gyro_bias
      ),
      Err(error) => warn!("Calibration converged but was not stored: {error}"),
    }
  }
}

fn record_frame(frame: &RawFrame, shared: &SharedState) {
  if !shared.recorder.is_recording() {
    return;
  }

  for (unit, sample) in (0..).zip(frame.imu) {
    let payload = RecordPayload::Imu { unit, sample };
    let _ = shared.recorder.record(Record::new(frame.timestamp, payload));
  }

  for (unit, sample) in (0..).zip(frame.baro) {
    let payload = RecordPayload::Baro { unit, sample };
    let _ = shared.recorder.record(Record::new(frame.timestamp, payload));
  }
}

fn log_actions(event: Event, executed: &[Action]) {
  for action in executed {
    pass!("{event}: {action}");
  }
}

/// Reads the sensors at the control rate and publishes every frame.
pub fn read_sensors<S>(shared: SharedState, mut source: S) -> impl FnOnce()
where
  S: SensorSource + 'static,
{
  move || {
    let mut ticker = Ticker::new(CONTROL_PERIOD);

    while shared.is_running() {
      shared.frame.publish(source.read());
      ticker.wait();
    }
  }
}

/// Runs the control task until shutdown.
pub fn control<A>(
  shared: SharedState,
  actuator: A,
  commands: Receiver<GroundCommand>,
) -> impl FnOnce()
where
  A: Actuator + 'static,
{
  move || {
    let mut control = ControlLoop::new(&shared, actuator);
    let mut frames = SnapshotReader::new(shared.frame.clone());
    let mut ticker = Ticker::new(CONTROL_PERIOD);
    let mut missed: u32 = 0;

    while shared.is_running() {
      let snapshot = frames.read(FRAME_TIMEOUT);

      if snapshot.stale {
        missed = missed.saturating_add(1);

        if missed >= STALE_TICKS {
          let stale = ErrorFlags::STALE_DATA;
          shared.update_errors(stale, stale, shared.now());
        }

        control.tick_without_frame(&shared, commands.try_iter());
      } else {
        missed = 0;

        let frame = snapshot.value;
        shared.update_errors(
          ErrorFlags::STALE_DATA,
          ErrorFlags::empty(),
          frame.timestamp,
        );

        control.tick(&frame, &shared, commands.try_iter());
      }

      ticker.wait();
    }
  }
}
