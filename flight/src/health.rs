//! Watches the pyro circuits, the battery and the recording queue.

use crate::{
  hardware::{Continuity, PowerSensor},
  state::{SharedState, Ticker},
};
use common::{
  comm::{sensor::Millis, ErrorFlags, FlightPhase, Record, RecordPayload},
  config::BatteryConfig,
};
use jeflog::{fail, warn};
use std::{collections::BTreeSet, fmt, time::Duration};

/// How often the monitor runs.
pub const HEALTH_PERIOD: Duration = Duration::from_millis(10);

/// Ticks between two battery voltage records.
pub const VOLTAGE_RECORD_TICKS: u32 = 100;

/// Charge level of the battery.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum BatteryLevel {
  #[default]
  Ok,
  Low,
  Critical,
}

impl BatteryLevel {
  /// Classifies `voltage` against the configured thresholds.
  pub fn classify(voltage: f32, thresholds: &BatteryConfig) -> Self {
    if voltage < thresholds.critical_voltage {
      BatteryLevel::Critical
    } else if voltage < thresholds.low_voltage {
      BatteryLevel::Low
    } else {
      BatteryLevel::Ok
    }
  }

  fn flags(self) -> ErrorFlags {
    match self {
      Self::Ok => ErrorFlags::empty(),
      Self::Low => ErrorFlags::BAT_LOW,
      Self::Critical => ErrorFlags::BAT_CRITICAL,
    }
  }
}

impl fmt::Display for BatteryLevel {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Ok => write!(f, "ok"),
      Self::Low => write!(f, "low"),
      Self::Critical => write!(f, "critical"),
    }
  }
}

/// Per-tick health checks. Owns the `NO_PYRO_n`, `BAT_*` and `LOG_FULL`
/// flags.
#[derive(Debug, Default)]
pub struct HealthMonitor {
  /// Configuration generation `channels` was computed from.
  generation: Option<u64>,

  /// Pyro channels bound to a `FirePyro` action.
  channels: BTreeSet<u8>,
  battery: Option<BatteryLevel>,
  ticks: u32,
}

impl HealthMonitor {
  #[cfg(test)]
  pub(crate) fn channels(&self) -> &BTreeSet<u8> {
    &self.channels
  }

  /// The battery level of the last tick.
  pub fn battery(&self) -> Option<BatteryLevel> {
    self.battery
  }

  /// Runs one round of checks against `board`, updating the shared flags.
  pub fn tick<B>(&mut self, board: &B, shared: &SharedState, now: Millis)
  where
    B: Continuity + PowerSensor + ?Sized,
  {
    let generation = shared.config.generation();
    let config = shared.config.current();

    if self.generation != Some(generation) {
      self.channels = config.action_map.pyro_channels();
      self.generation = Some(generation);
    }

    let phase = shared.phase.latest();

    // once the vehicle has left the pad a fired igniter reads open, which
    // says nothing about the health of the circuit
    if phase < FlightPhase::Thrusting {
      let mut open = ErrorFlags::empty();

      for &channel in &self.channels {
        if !board.has_continuity(channel) {
          open |= ErrorFlags::no_pyro(channel);
        }
      }

      shared.update_errors(ErrorFlags::NO_PYRO, open, now);
    }

    let voltage = board.battery_voltage();
    let level = BatteryLevel::classify(voltage, &config.battery);

    if self.battery != Some(level) {
      if level != BatteryLevel::Ok {
        warn!("Battery is {level} at {voltage:.2} V.");
      }

      shared.update_errors(
        ErrorFlags::BAT_LOW | ErrorFlags::BAT_CRITICAL,
        level.flags(),
        now,
      );
      self.battery = Some(level);
    }

    let log_full = if shared.recorder.is_overflowing() {
      ErrorFlags::LOG_FULL
    } else {
      ErrorFlags::empty()
    };

    shared.update_errors(ErrorFlags::LOG_FULL, log_full, now);

    if self.ticks % VOLTAGE_RECORD_TICKS == 0 {
      let millivolts = (voltage * 1000.0).clamp(0.0, f32::from(u16::MAX));
      let record = Record::new(now, RecordPayload::Voltage(millivolts as u16));

      let _ = shared.recorder.record(record);
    }

    self.ticks = self.ticks.wrapping_add(1);
  }
}

/// Runs the health monitor until shutdown.
pub fn monitor<B>(shared: SharedState, board: B) -> impl FnOnce()
where
  B: Continuity + PowerSensor + 'static,
{
  move || {
    let mut monitor = HealthMonitor::default();
    let mut ticker = Ticker::new(HEALTH_PERIOD);

    while shared.is_running() {
      monitor.tick(&board, &shared, shared.now());
      ticker.wait();
    }

    if monitor.battery() == Some(BatteryLevel::Critical) {
      fail!("Shut down with a critical battery.");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{hardware::mocks::MockBoard, state::tests::shared_state};
  use common::{
    comm::{Action, Event},
    config::Config,
  };

  #[test]
  fn only_bound_channels_are_checked() {
    let (shared, _records, _configs) = shared_state(Config::default());
    let mut monitor = HealthMonitor::default();
    let mut board = MockBoard::default();

    board.connected.remove(&3);
    monitor.tick(&board, &shared, 0);

    assert_eq!(monitor.channels(), &BTreeSet::from([0, 1]));
    assert!(!shared.errors.get().intersects(ErrorFlags::NO_PYRO));

    board.connected.remove(&1);
    monitor.tick(&board, &shared, 10);

    assert_eq!(shared.errors.get(), ErrorFlags::NO_PYRO_1);
    assert!(shared.errors.get().blocks_arming());

    board.connected.insert(1);
    monitor.tick(&board, &shared, 20);

    assert!(shared.errors.get().is_empty());
  }

  #[test]
  fn channels_follow_configuration_changes() {
    let (shared, _records, _configs) = shared_state(Config::default());
    let mut monitor = HealthMonitor::default();
    let mut board = MockBoard::default();
    board.connected.remove(&2);

    monitor.tick(&board, &shared, 0);
    assert!(shared.errors.get().is_empty());

    let mut config = Config::default();
    config.outputs.pyro_channels = 4;
    config
      .action_map
      .bind(Event::Burnout, vec![Action::FirePyro { channel: 2 }])
      .unwrap();
    shared.write_config(config).unwrap();

    monitor.tick(&board, &shared, 10);
    assert_eq!(shared.errors.get(), ErrorFlags::NO_PYRO_2);
  }

  #[test]
  fn continuity_is_ignored_in_flight() {
    let (shared, _records, _configs) = shared_state(Config::default());
    let mut monitor = HealthMonitor::default();
    let mut board = MockBoard::default();

    monitor.tick(&board, &shared, 0);

    shared.phase.publish(FlightPhase::DrogueDescent);
    board.connected.clear();
    monitor.tick(&board, &shared, 10);

    assert!(shared.errors.get().is_empty());
  }

  #[test]
  fn battery_flags_follow_level_transitions() {
    let (shared, records, _configs) = shared_state(Config::default());
    shared.recorder.set_recording(true);

    let mut monitor = HealthMonitor::default();
    let mut board = MockBoard::default();

    monitor.tick(&board, &shared, 0);
    assert_eq!(monitor.battery(), Some(BatteryLevel::Ok));

    board.voltage = 7.0;
    monitor.tick(&board, &shared, 10);
    assert_eq!(shared.errors.get(), ErrorFlags::BAT_LOW);
    assert!(!shared.errors.get().blocks_arming());

    board.voltage = 6.5;
    monitor.tick(&board, &shared, 20);
    monitor.tick(&board, &shared, 30);
    assert_eq!(shared.errors.get(), ErrorFlags::BAT_CRITICAL);
    assert!(shared.errors.get().blocks_arming());

    let changes = records
      .try_iter()
      .filter(|r| matches!(r.payload, RecordPayload::ErrorChange { .. }))
      .count();
    assert_eq!(changes, 2);
  }

  #[test]
  fn voltage_is_recorded_once_per_hundred_ticks() {
    let (shared, records, _configs) = shared_state(Config::default());
    shared.recorder.set_recording(true);

    let mut monitor = HealthMonitor::default();
    let board = MockBoard::default();

    for tick in 0..250 {
      monitor.tick(&board, &shared, tick * 10);
    }

    let voltages: Vec<_> = records
      .try_iter()
      .filter_map(|r| match r.payload {
        RecordPayload::Voltage(mv) => Some((r.timestamp, mv)),
        _ => None,
      })
      .collect();

    assert_eq!(voltages, [(0, 8_000), (1_000, 8_000), (2_000, 8_000)]);
  }
}
