use crate::{
  control::{self, GroundCommand},
  health,
  operator,
  recorder::{RecordWriter, Recorder, RecorderConfig},
  sim::{SimulatedVehicle, SimulationConfig},
  snapshot::Published,
  store::{self, ConfigStore, FileStore},
  Args,
  LANDED_LINGER,
  MONITOR_PERIOD,
};
use common::{
  comm::{
    sensor::Millis,
    ErrorFlags,
    EstimationOutput,
    FlightPhase,
    RawFrame,
    Record,
    RecordPayload,
  },
  config::{Config, ConfigError},
};
use jeflog::{fail, pass, task, warn};
use std::{
  fmt,
  sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    mpsc::{self, Receiver, Sender},
    Arc,
    RwLock,
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

/// Holds all shared state that should be accessible concurrently in multiple
/// contexts.
///
/// Values written by exactly one thread are `Published` by copy, so readers
/// never block a writer for longer than a copy. **Do not abuse this struct.**
/// It is intended for what would typically be global state.
#[derive(Clone, Debug)]
pub struct SharedState {
  /// The current flight phase, written only by the control thread.
  pub phase: Arc<Published<FlightPhase>>,

  /// The newest state estimate, written only by the control thread.
  pub estimate: Arc<Published<EstimationOutput>>,

  /// The newest raw frame, written only by the sensor thread.
  pub frame: Arc<Published<RawFrame>>,

  /// Every active error flag.
  pub errors: Arc<ErrorSet>,

  /// The configuration in effect.
  pub config: Arc<ConfigCell>,

  /// Producer handle of the flight recording.
  pub recorder: Recorder,

  /// Cleared to ask every worker thread to return.
  pub running: Arc<AtomicBool>,

  config_writer: Sender<Arc<Config>>,
  boot: Instant,
}

impl SharedState {
  /// Constructs the shared state around the loaded configuration. Accepted
  /// configuration changes are sent to `config_writer` for persisting.
  pub fn new(
    config: Config,
    recorder: Recorder,
    config_writer: Sender<Arc<Config>>,
  ) -> Self {
    SharedState {
      phase: Arc::new(Published::new(FlightPhase::Invalid)),
      estimate: Arc::new(Published::new(EstimationOutput::default())),
      frame: Arc::new(Published::new(RawFrame::default())),
      errors: Arc::new(ErrorSet::default()),
      config: Arc::new(ConfigCell::new(config)),
      recorder,
      running: Arc::new(AtomicBool::new(true)),
      config_writer,
      boot: Instant::now(),
    }
  }

  /// Milliseconds since boot.
  pub fn now(&self) -> Millis {
    Millis::try_from(self.boot.elapsed().as_millis()).unwrap_or(Millis::MAX)
  }

  /// True until shutdown has been requested.
  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::Relaxed)
  }

  /// Makes `active` the state of the flags in `mask`, recording the change if
  /// there is one.
  pub fn update_errors(
    &self,
    mask: ErrorFlags,
    active: ErrorFlags,
    timestamp: Millis,
  ) {
    let Some(change) = self.errors.assign(mask, active) else {
      return;
    };

    if let RecordPayload::ErrorChange {
      raised, cleared, ..
    } = change
    {
      if !raised.is_empty() {
        warn!("Raised error flags: {raised}");
      }

      if !cleared.is_empty() {
        pass!("Cleared error flags: {cleared}");
      }
    }

    let _ = self.recorder.record(Record::new(timestamp, change));
  }

  /// Validates and installs a new configuration, then hands it off to be
  /// persisted. Refused once the vehicle is past `Ready`.
  pub fn write_config(&self, config: Config) -> Result<(), ConfigWriteError> {
    let config = Arc::new(config);
    self.config.replace(config.clone(), self.phase.latest())?;

    if self.config_writer.send(config).is_err() {
      warn!("Configuration writer is gone. Change will not persist.");
    }

    Ok(())
  }
}

/// The process-wide set of active error flags.
///
/// Each flag has one owning component; owners assign their whole subset at
/// once so concurrent owners never overwrite each other's flags.
#[derive(Debug, Default)]
pub struct ErrorSet {
  bits: AtomicU32,
}

impl ErrorSet {
  /// Every active flag.
  pub fn get(&self) -> ErrorFlags {
    ErrorFlags::from_bits_truncate(self.bits.load(Ordering::Acquire))
  }

  /// Sets the flags in `mask` to their state in `active`, leaving every
  /// other flag alone. Returns the change as a record payload, or `None` if
  /// nothing changed.
  pub fn assign(
    &self,
    mask: ErrorFlags,
    active: ErrorFlags,
  ) -> Option<RecordPayload> {
    let active = active & mask;

    let previous = self
      .bits
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
        let next = (bits & !mask.bits()) | active.bits();
        (next != bits).then_some(next)
      })
      .ok()?;

    let previous = ErrorFlags::from_bits_truncate(previous);
    let current = previous.difference(mask).union(active);

    Some(RecordPayload::ErrorChange {
      raised: current.difference(previous),
      cleared: previous.difference(current),
      active: current,
    })
  }
}

/// Why a configuration write was refused.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigWriteError {
  /// The vehicle is in flight.
  Locked {
    /// The phase at the time of the write.
    phase: FlightPhase,
  },

  /// The configuration failed validation.
  Invalid(ConfigError),
}

impl From<ConfigError> for ConfigWriteError {
  fn from(error: ConfigError) -> Self {
    ConfigWriteError::Invalid(error)
  }
}

impl fmt::Display for ConfigWriteError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Locked { phase } => {
        write!(f, "configuration is locked while {phase}")
      }
      Self::Invalid(error) => write!(f, "{error}"),
    }
  }
}

impl std::error::Error for ConfigWriteError {}

/// The configuration in effect, replaced as a whole. The generation lets
/// readers notice a change without comparing configurations.
#[derive(Debug)]
pub struct ConfigCell {
  current: RwLock<Arc<Config>>,
  generation: AtomicU64,
}

impl ConfigCell {
  /// A cell holding `config` as generation zero.
  pub fn new(config: Config) -> Self {
    ConfigCell {
      current: RwLock::new(Arc::new(config)),
      generation: AtomicU64::new(0),
    }
  }

  /// The configuration in effect.
  pub fn current(&self) -> Arc<Config> {
    self
      .current
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  /// Incremented by every accepted replacement.
  pub fn generation(&self) -> u64 {
    self.generation.load(Ordering::Acquire)
  }

  /// Installs `config` if it is valid and `phase` allows it.
  pub fn replace(
    &self,
    config: Arc<Config>,
    phase: FlightPhase,
  ) -> Result<(), ConfigWriteError> {
    if phase > FlightPhase::Ready {
      return Err(ConfigWriteError::Locked { phase });
    }

    config.validate()?;

    let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
    *current = config;
    self.generation.fetch_add(1, Ordering::AcqRel);

    Ok(())
  }
}

/// Sleeps until fixed, absolute deadlines so a slow iteration does not shift
/// every later one.
#[derive(Debug)]
pub struct Ticker {
  period: Duration,
  next: Instant,
}

impl Ticker {
  /// A ticker whose first deadline is one period from now.
  pub fn new(period: Duration) -> Self {
    Ticker {
      period,
      next: Instant::now() + period,
    }
  }

  /// Sleeps until the next deadline. A ticker more than one period behind
  /// skips the missed deadlines instead of bursting through them.
  pub fn wait(&mut self) {
    let now = Instant::now();

    if self.next > now {
      thread::sleep(self.next - now);
    } else if now - self.next > self.period {
      self.next = now;
    }

    self.next += self.period;
  }
}

#[derive(Debug)]
pub enum ProgramState {
  /// The initialization state, which loads the configuration, spawns every
  /// worker thread and transitions to the `Flight` state.
  Init {
    /// Command line options.
    args: Args,
  },

  /// State which supervises the worker threads until the run is over.
  Flight {
    /// The shared flight state.
    shared: SharedState,

    /// Worker threads which return once `running` is cleared.
    workers: Vec<JoinHandle<()>>,

    /// The recording writer, finished last.
    writer: RecordWriter,

    /// When the run ends regardless of the phase.
    deadline: Option<Instant>,

    /// When touchdown was first observed.
    landed_at: Option<Instant>,
  },

  /// State which stops the worker threads and flushes the recording.
  Shutdown {
    /// The shared flight state.
    shared: SharedState,

    /// Worker threads which return once `running` is cleared.
    workers: Vec<JoinHandle<()>>,

    /// The recording writer.
    writer: RecordWriter,
  },

  /// Nothing is left running.
  Halted,
}

impl ProgramState {
  /// Perform transition to the next state, returning the next state.
  pub fn next(self) -> Self {
    match self {
      ProgramState::Init { args } => init(args),
      ProgramState::Flight {
        shared,
        workers,
        writer,
        deadline,
        landed_at,
      } => flight(shared, workers, writer, deadline, landed_at),
      ProgramState::Shutdown {
        shared,
        workers,
        writer,
      } => shutdown(shared, workers, writer),
      ProgramState::Halted => ProgramState::Halted,
    }
  }
}

impl fmt::Display for ProgramState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Init { .. } => write!(f, "Init"),
      Self::Flight { shared, .. } => {
        write!(f, "Flight(phase = {})", shared.phase.latest())
      }
      Self::Shutdown { .. } => write!(f, "Shutdown"),
      Self::Halted => write!(f, "Halted"),
    }
  }
}

fn init(args: Args) -> ProgramState {
  task!("Loading configuration from {}.", args.config.display());

  let store = FileStore::new(&args.config);
  let (config, boot_flags) = store::load_or_default(&store);

  let mut recorder_config = RecorderConfig {
    enabled: !args.disable_file_logging,
    ..RecorderConfig::default()
  };

  if let Some(log_dir) = &args.log_dir {
    recorder_config.log_dir = log_dir.clone();
  }

  let (recorder, writer) = match RecordWriter::start(recorder_config.clone()) {
    Ok(started) => {
      if recorder_config.enabled {
        pass!("Recording to {}.", recorder_config.log_dir.display());
      }

      started
    }
    Err(error) => {
      fail!("Failed to start recording writer: {error}. Recording disabled.");

      let disabled = RecorderConfig {
        enabled: false,
        ..recorder_config
      };

      match RecordWriter::start(disabled) {
        Ok(started) => started,
        Err(error) => {
          fail!("Failed to start even a discarding writer: {error}");
          return ProgramState::Halted;
        }
      }
    }
  };

  let (config_tx, config_rx) = mpsc::channel();
  let shared = SharedState::new(config, recorder, config_tx);

  shared.update_errors(
    ErrorFlags::NO_CONFIG | ErrorFlags::NON_USER_CONFIG,
    boot_flags,
    shared.now(),
  );

  let vehicle = SimulatedVehicle::new(SimulationConfig {
    seed: args.seed,
    freeze_imu: args.freeze_imu,
    freeze_baro: args.freeze_baro,
    cut_continuity: args.no_continuity,
    battery_voltage: args.battery,
    ..SimulationConfig::default()
  });

  let (command_tx, command_rx) = mpsc::channel::<GroundCommand>();

  thread::spawn(persist_configs(Box::new(store), config_rx));
  thread::spawn(operator::console(shared.clone(), command_tx));

  let workers = vec![
    thread::spawn(control::read_sensors(shared.clone(), vehicle.clone())),
    thread::spawn(control::control(
      shared.clone(),
      vehicle.clone(),
      command_rx,
    )),
    thread::spawn(health::monitor(shared.clone(), vehicle)),
  ];

  pass!("Spawned worker threads.");

  ProgramState::Flight {
    shared,
    workers,
    writer,
    deadline: args.duration.map(|seconds| {
      Instant::now() + Duration::from_secs_f64(seconds)
    }),
    landed_at: None,
  }
}

fn flight(
  shared: SharedState,
  workers: Vec<JoinHandle<()>>,
  writer: RecordWriter,
  deadline: Option<Instant>,
  mut landed_at: Option<Instant>,
) -> ProgramState {
  let mut phase = shared.phase.latest();

  loop {
    thread::sleep(MONITOR_PERIOD);

    let now = Instant::now();
    let current = shared.phase.latest();

    if current != phase {
      phase = current;

      if phase == FlightPhase::Touchdown {
        landed_at.get_or_insert(now);
      }

      // surface the change through the program state log
      return ProgramState::Flight {
        shared,
        workers,
        writer,
        deadline,
        landed_at,
      };
    }

    let out_of_time = deadline.is_some_and(|deadline| now >= deadline);
    let settled =
      landed_at.is_some_and(|landed| now - landed >= LANDED_LINGER);

    if out_of_time || settled {
      return ProgramState::Shutdown {
        shared,
        workers,
        writer,
      };
    }

    if workers.iter().any(JoinHandle::is_finished) {
      fail!("A worker thread stopped unexpectedly.");

      return ProgramState::Shutdown {
        shared,
        workers,
        writer,
      };
    }
  }
}

fn shutdown(
  shared: SharedState,
  workers: Vec<JoinHandle<()>>,
  writer: RecordWriter,
) -> ProgramState {
  shared.running.store(false, Ordering::Relaxed);

  for worker in workers {
    if worker.join().is_err() {
      fail!("A worker thread panicked.");
    }
  }

  let estimate = shared.estimate.latest();
  pass!("Stopped in {} with {estimate}.", shared.phase.latest());

  if let Err(error) = writer.finish() {
    fail!("Failed to finish recording: {error}");
  }

  let dropped = shared.recorder.dropped();

  if dropped > 0 {
    warn!("{dropped} records were dropped because the queue was full.");
  }

  ProgramState::Halted
}

/// Persists every configuration accepted at runtime, in order.
fn persist_configs(
  store: Box<dyn ConfigStore>,
  configs: Receiver<Arc<Config>>,
) -> impl FnOnce() {
  move || {
    for config in configs {
      match store.save(&config) {
        Ok(()) => pass!("Persisted configuration."),
        Err(error) => fail!("Failed to persist configuration: {error}"),
      }
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use common::comm::{Action, Event};

  /// Shared state with a bare recording channel and a configuration sink.
  pub(crate) fn shared_state(
    config: Config,
  ) -> (SharedState, Receiver<Record>, Receiver<Arc<Config>>) {
    let (recorder, records) = Recorder::channel(4_096);
    let (config_tx, configs) = mpsc::channel();

    (SharedState::new(config, recorder, config_tx), records, configs)
  }

  #[test]
  fn owners_only_touch_their_flags() {
    let errors = ErrorSet::default();
    let imu = ErrorFlags::IMU_0 | ErrorFlags::IMU_1;

    errors.assign(ErrorFlags::FILTER, ErrorFlags::FILTER);
    let change = errors.assign(imu, ErrorFlags::IMU_1 | ErrorFlags::BAT_LOW);

    assert_eq!(errors.get(), ErrorFlags::FILTER | ErrorFlags::IMU_1);
    assert_eq!(
      change,
      Some(RecordPayload::ErrorChange {
        raised: ErrorFlags::IMU_1,
        cleared: ErrorFlags::empty(),
        active: ErrorFlags::FILTER | ErrorFlags::IMU_1,
      })
    );

    assert_eq!(errors.assign(imu, ErrorFlags::IMU_1), None);

    let change = errors.assign(imu, ErrorFlags::empty());
    assert!(matches!(
      change,
      Some(RecordPayload::ErrorChange { cleared, .. })
        if cleared == ErrorFlags::IMU_1
    ));
  }

  #[test]
  fn error_changes_are_recorded() {
    let (shared, records, _configs) = shared_state(Config::default());
    shared.recorder.set_recording(true);

    shared.update_errors(ErrorFlags::LOG_FULL, ErrorFlags::LOG_FULL, 30);
    shared.update_errors(ErrorFlags::LOG_FULL, ErrorFlags::LOG_FULL, 40);

    let recorded: Vec<_> = records.try_iter().collect();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].timestamp, 30);
  }

  #[test]
  fn config_writes_lock_in_flight() {
    let (shared, _records, configs) = shared_state(Config::default());

    let mut config = Config::default();
    config.thresholds.main_altitude = 300.0;

    shared.write_config(config.clone()).unwrap();
    assert_eq!(shared.config.generation(), 1);
    assert_eq!(*configs.try_recv().unwrap(), config);

    shared.phase.publish(FlightPhase::Thrusting);
    assert_eq!(
      shared.write_config(Config::default()),
      Err(ConfigWriteError::Locked {
        phase: FlightPhase::Thrusting
      })
    );
    assert_eq!(shared.config.current().thresholds.main_altitude, 300.0);
    assert!(configs.try_recv().is_err());
  }

  #[test]
  fn invalid_config_is_refused() {
    let (shared, _records, _configs) = shared_state(Config::default());

    let mut config = Config::default();
    config.action_map = Default::default();
    config
      .action_map
      .bind(Event::Apogee, vec![Action::FirePyro { channel: 9 }])
      .unwrap();

    assert!(matches!(
      shared.write_config(config),
      Err(ConfigWriteError::Invalid(_))
    ));
    assert_eq!(shared.config.generation(), 0);
  }
}
