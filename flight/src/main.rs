mod control;
mod dispatch;
mod estimator;
mod fsm;
mod hardware;
mod health;
mod linalg;
mod operator;
mod preprocess;
mod recorder;
mod sim;
mod snapshot;
mod state;
mod store;

use clap::{Parser, Subcommand};
use jeflog::{fail, pass};
use state::ProgramState;
use std::{
  path::{Path, PathBuf},
  process::ExitCode,
  time::Duration,
};

/// How long the program keeps running after touchdown.
const LANDED_LINGER: Duration = Duration::from_secs(2);

/// How often the main thread checks on the flight.
const MONITOR_PERIOD: Duration = Duration::from_millis(100);

/// Command-line arguments for the flight computer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(subcommand)]
  mode: Option<Mode>,

  /// Persisted configuration file
  #[arg(long, default_value = "flight_config.postcard")]
  pub config: PathBuf,

  /// Directory for recordings (default: $HOME/flight_recordings)
  #[arg(long)]
  pub log_dir: Option<PathBuf>,

  /// Disable file recording (enabled by default)
  #[arg(long, default_value_t = false)]
  pub disable_file_logging: bool,

  /// Stop after this many seconds even if the vehicle has not landed
  #[arg(long)]
  pub duration: Option<f64>,

  /// Seed of the simulated sensor noise
  #[arg(long, default_value_t = 0)]
  pub seed: u64,

  /// Freeze the output of one simulated IMU unit
  #[arg(long)]
  pub freeze_imu: Option<usize>,

  /// Freeze the output of one simulated barometer unit
  #[arg(long)]
  pub freeze_baro: Option<usize>,

  /// Leave one simulated pyro channel without an igniter
  #[arg(long)]
  pub no_continuity: Option<u8>,

  /// Simulated battery voltage at boot
  #[arg(long, default_value_t = 8.2)]
  pub battery: f32,
}

#[derive(Subcommand, Debug)]
enum Mode {
  /// Print a recording as JSON lines
  Dump {
    /// Recording file to read
    file: PathBuf,
  },
}

fn main() -> ExitCode {
  let args = Args::parse();

  if let Some(Mode::Dump { file }) = &args.mode {
    return dump(file);
  }

  let mut state = ProgramState::Init { args };

  loop {
    pass!("Transitioned to state: {state}");

    if let ProgramState::Halted = state {
      return ExitCode::SUCCESS;
    }

    state = state.next();
  }
}

fn dump(file: &Path) -> ExitCode {
  let records = match recorder::read_recording(file) {
    Ok(records) => records,
    Err(error) => {
      fail!("Failed to read {}: {error}", file.display());
      return ExitCode::FAILURE;
    }
  };

  for record in records {
    match serde_json::to_string(&record) {
      Ok(line) => println!("{line}"),
      Err(error) => {
        fail!("Failed to encode record: {error}");
        return ExitCode::FAILURE;
      }
    }
  }

  ExitCode::SUCCESS
}
