use crate::comm::{
  action::{Action, ActionMap, ActionMapError, OutputLayout},
  error::MAX_PYRO_CHANNELS,
  phase::Event,
  sensor::Vector,
};
use serde::{Deserialize, Serialize};
use std::{error::Error, fmt};

/// The stored configuration is discarded in favour of the defaults whenever
/// this number differs from the one it was saved with.
pub const CONFIG_VERSION: u32 = 3;

/// Number of configurable event timers.
pub const NUM_TIMERS: usize = 2;

/// The complete persisted configuration of the flight computer.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
  /// Must be serialized first so that it can be checked before the rest of
  /// the blob is interpreted.
  pub version: u32,

  /// Actions executed for each event.
  pub action_map: ActionMap,

  /// Timers which emit custom events a fixed time after a start event.
  pub timers: [Option<TimerConfig>; NUM_TIMERS],

  /// Phase transition thresholds.
  pub thresholds: Thresholds,

  /// Redundant sensor fault handling.
  pub sensors: SensorConfig,

  /// Calibration used until (or if) a fresh calibration converges.
  pub calibration: CalibrationData,

  /// The output channels present on the board.
  pub outputs: OutputLayout,

  /// Position each servo is driven to at boot, in tenths of a percent.
  pub initial_servo_positions: [u16; 2],

  /// Battery level thresholds.
  pub battery: BatteryConfig,

  /// Manual test trigger settings.
  pub testing: TestingConfig,

  /// False if this configuration was produced by the built-in defaults.
  pub set_by_user: bool,
}

/// Emits `trigger` once `duration_ms` has elapsed since `start` was
/// dispatched.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct TimerConfig {
  /// The event which arms the timer.
  pub start: Event,

  /// The event emitted when the timer expires.
  pub trigger: Event,

  /// Time from `start` to `trigger`, in milliseconds.
  pub duration_ms: u32,
}

/// Thresholds driving the flight phase state machine.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Thresholds {
  /// Vertical acceleration above which liftoff is considered, in m/s².
  pub liftoff_acceleration: f32,

  /// How long the liftoff acceleration must persist, in milliseconds.
  pub liftoff_dwell_ms: u32,

  /// Vertical acceleration below which the motor is considered burnt out, in
  /// m/s².
  pub burnout_acceleration: f32,

  /// How long the burnout condition must persist, in milliseconds.
  pub burnout_dwell_ms: u32,

  /// Time after burnout at which apogee is declared regardless of velocity,
  /// in milliseconds.
  pub apogee_timeout_ms: u32,

  /// Height below which the main parachute is deployed, in meters.
  pub main_altitude: f32,

  /// Speed below which the vehicle may be considered landed, in m/s.
  pub touchdown_velocity: f32,

  /// Height below which the vehicle may be considered landed, in meters.
  pub touchdown_height: f32,

  /// How long the landed condition must persist, in milliseconds.
  pub touchdown_dwell_ms: u32,
}

impl Default for Thresholds {
  fn default() -> Self {
    Thresholds {
      liftoff_acceleration: 3.0 * 9.81,
      liftoff_dwell_ms: 50,
      burnout_acceleration: 0.0,
      burnout_dwell_ms: 100,
      apogee_timeout_ms: 25_000,
      main_altitude: 200.0,
      touchdown_velocity: 2.0,
      touchdown_height: 50.0,
      touchdown_dwell_ms: 1_000,
    }
  }
}

impl Thresholds {
  fn is_usable(&self) -> bool {
    let levels = [
      self.liftoff_acceleration,
      self.burnout_acceleration,
      self.main_altitude,
      self.touchdown_velocity,
      self.touchdown_height,
    ];
    let times = [
      self.liftoff_dwell_ms,
      self.burnout_dwell_ms,
      self.apogee_timeout_ms,
      self.touchdown_dwell_ms,
    ];

    levels.iter().all(|level| level.is_finite())
      && times.iter().all(|&ms| ms > 0)
  }
}

/// How redundant sensor units are judged and eliminated.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct SensorConfig {
  /// Consecutive identical samples after which a unit counts as frozen.
  pub freeze_ticks: u16,

  /// Fault counter value at which a unit is eliminated.
  pub fault_limit: u16,

  /// Fault counter value at or below which an eliminated unit is admitted
  /// again.
  pub rejoin_level: u16,
}

impl Default for SensorConfig {
  fn default() -> Self {
    SensorConfig {
      freeze_ticks: 5,
      fault_limit: 10,
      rejoin_level: 0,
    }
  }
}

impl SensorConfig {
  fn is_usable(&self) -> bool {
    self.freeze_ticks >= 1
      && self.rejoin_level < self.fault_limit
      && self.fault_limit < u16::MAX
  }
}

/// Calibration of the inertial sensors, derived on the pad.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct CalibrationData {
  /// Gyro reading at rest, subtracted from every sample, in deg/s.
  pub gyro_bias: Vector,

  /// Rotation aligning measured gravity with body +Z.
  pub accel: AccelCalibration,
}

impl Default for CalibrationData {
  fn default() -> Self {
    CalibrationData {
      gyro_bias: Vector::ZERO,
      accel: AccelCalibration {
        axis: Vector::UNIT_Z,
        angle: 0.0,
      },
    }
  }
}

/// An axis-angle rotation applied to every acceleration sample.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct AccelCalibration {
  /// Unit rotation axis.
  pub axis: Vector,

  /// Rotation angle, in radians.
  pub angle: f32,
}

/// Battery voltage thresholds.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct BatteryConfig {
  /// Below this voltage the battery is low.
  pub low_voltage: f32,

  /// Below this voltage the battery is critical.
  pub critical_voltage: f32,
}

impl Default for BatteryConfig {
  fn default() -> Self {
    BatteryConfig {
      low_voltage: 7.2,
      critical_voltage: 6.8,
    }
  }
}

/// Settings of the manual test trigger interface.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TestingConfig {
  /// Test triggers are refused unless this is set.
  pub enabled: bool,

  /// Phrase every test trigger must carry.
  pub phrase: String,
}

impl TestingConfig {
  /// True if a trigger carrying `phrase` may be honoured.
  pub fn accepts(&self, phrase: &str) -> bool {
    self.enabled && !self.phrase.is_empty() && self.phrase == phrase
  }
}

/// Reasons a configuration is refused.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigError {
  /// The configuration was saved by a different firmware version.
  VersionMismatch {
    /// The version found in the stored blob.
    found: u32,
  },

  /// An action binding is invalid.
  Actions(ActionMapError),

  /// A timer must emit a custom event different from its start event.
  Timer {
    /// Index of the offending timer.
    index: usize,
  },

  /// The board declares more pyro channels than have a continuity flag.
  PyroChannels {
    /// The number of channels declared.
    count: u8,
  },

  /// The fault handling settings cannot work: freezing needs at least one
  /// tick and re-admission must lie below the elimination limit.
  Sensors,

  /// A phase threshold is not finite or a dwell time is zero.
  Thresholds,

  /// The low battery threshold must lie above the critical one.
  Battery,
}

impl fmt::Display for ConfigError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::VersionMismatch { found } => write!(
        f,
        "configuration version {found} does not match {CONFIG_VERSION}"
      ),
      Self::Actions(error) => write!(f, "invalid action map: {error}"),
      Self::Timer { index } => write!(
        f,
        "timer {index} must emit custom1 or custom2 and differ from its \
         start event"
      ),
      Self::PyroChannels { count } => write!(
        f,
        "{count} pyro channels declared, at most {MAX_PYRO_CHANNELS} are \
         supported"
      ),
      Self::Sensors => write!(
        f,
        "sensor settings need freeze_ticks >= 1 and rejoin_level < \
         fault_limit < {}",
        u16::MAX
      ),
      Self::Thresholds => write!(
        f,
        "thresholds must be finite and dwell times must be non-zero"
      ),
      Self::Battery => {
        write!(f, "low battery voltage must exceed the critical voltage")
      }
    }
  }
}

impl Error for ConfigError {}

impl From<ActionMapError> for ConfigError {
  fn from(error: ActionMapError) -> Self {
    ConfigError::Actions(error)
  }
}

impl Default for Config {
  /// The built-in configuration: drogue on pyro 0 at apogee, main on pyro 1
  /// at the main deployment altitude, recording from liftoff to touchdown.
  fn default() -> Self {
    let mut action_map = ActionMap::new();

    let bindings = [
      (Event::Liftoff, vec![Action::Recorder { enabled: true }]),
      (Event::Apogee, vec![Action::FirePyro { channel: 0 }]),
      (Event::MainDeployment, vec![Action::FirePyro { channel: 1 }]),
      (Event::Touchdown, vec![Action::Recorder { enabled: false }]),
    ];

    for (event, actions) in bindings {
      // the default bindings are well below the per-event limit
      let _ = action_map.bind(event, actions);
    }

    Config {
      version: CONFIG_VERSION,
      action_map,
      timers: [None; NUM_TIMERS],
      thresholds: Thresholds::default(),
      sensors: SensorConfig::default(),
      calibration: CalibrationData::default(),
      outputs: OutputLayout::default(),
      initial_servo_positions: [0; 2],
      battery: BatteryConfig::default(),
      testing: TestingConfig::default(),
      set_by_user: false,
    }
  }
}

impl Config {
  /// Checks the whole configuration. A configuration which fails validation
  /// must not be applied in part.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.version != CONFIG_VERSION {
      return Err(ConfigError::VersionMismatch {
        found: self.version,
      });
    }

    if self.outputs.pyro_channels > MAX_PYRO_CHANNELS {
      return Err(ConfigError::PyroChannels {
        count: self.outputs.pyro_channels,
      });
    }

    self.action_map.validate(&self.outputs)?;

    for (index, timer) in self.timers.iter().enumerate() {
      let Some(timer) = timer else {
        continue;
      };

      let custom = matches!(timer.trigger, Event::Custom1 | Event::Custom2);

      if !custom || timer.start == timer.trigger {
        return Err(ConfigError::Timer { index });
      }
    }

    if !self.sensors.is_usable() {
      return Err(ConfigError::Sensors);
    }

    if !self.thresholds.is_usable() {
      return Err(ConfigError::Thresholds);
    }

    let battery = &self.battery;
    let finite =
      battery.low_voltage.is_finite() && battery.critical_voltage.is_finite();

    if !finite || battery.low_voltage <= battery.critical_voltage {
      return Err(ConfigError::Battery);
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    assert_eq!(Config::default().validate(), Ok(()));
  }

  #[test]
  fn timer_must_emit_custom_event() {
    let mut config = Config::default();
    config.timers[1] = Some(TimerConfig {
      start: Event::Liftoff,
      trigger: Event::Apogee,
      duration_ms: 1_000,
    });

    assert_eq!(config.validate(), Err(ConfigError::Timer { index: 1 }));
  }

  #[test]
  fn pyro_channels_are_capped_at_the_continuity_flags() {
    let mut config = Config::default();
    config.outputs.pyro_channels = 8;
    config
      .action_map
      .bind(Event::Apogee, vec![Action::FirePyro { channel: 5 }])
      .unwrap();

    assert_eq!(
      config.validate(),
      Err(ConfigError::PyroChannels { count: 8 })
    );

    config.outputs.pyro_channels = MAX_PYRO_CHANNELS;
    assert!(matches!(config.validate(), Err(ConfigError::Actions(_))));
  }

  #[test]
  fn unusable_sensor_settings_are_rejected() {
    let settings = [
      SensorConfig {
        fault_limit: 0,
        ..SensorConfig::default()
      },
      SensorConfig {
        freeze_ticks: 0,
        ..SensorConfig::default()
      },
      SensorConfig {
        fault_limit: 4,
        rejoin_level: 4,
        ..SensorConfig::default()
      },
      SensorConfig {
        fault_limit: u16::MAX,
        ..SensorConfig::default()
      },
    ];

    for sensors in settings {
      let config = Config {
        sensors,
        ..Config::default()
      };

      assert_eq!(config.validate(), Err(ConfigError::Sensors), "{sensors:?}");
    }
  }

  #[test]
  fn thresholds_must_be_finite_with_dwell() {
    let mut config = Config::default();
    config.thresholds.main_altitude = f32::NAN;
    assert_eq!(config.validate(), Err(ConfigError::Thresholds));

    let mut config = Config::default();
    config.thresholds.liftoff_dwell_ms = 0;
    assert_eq!(config.validate(), Err(ConfigError::Thresholds));
  }

  #[test]
  fn testing_phrase_must_match() {
    let testing = TestingConfig {
      enabled: true,
      phrase: "sudo fire".to_owned(),
    };

    assert!(testing.accepts("sudo fire"));
    assert!(!testing.accepts("fire"));
    assert!(!TestingConfig::default().accepts(""));
  }
}
