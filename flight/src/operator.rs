//! Line based operator console on stdin, used for ground tests.

use crate::{control::GroundCommand, state::SharedState};
use bimap::BiHashMap;
use common::{comm::Event, config::TestingConfig, ToPrettyString};
use jeflog::{fail, pass, warn};
use std::{
  fmt,
  io::{self, BufRead},
  sync::mpsc::Sender,
};

/// A parsed console line.
#[derive(Clone, Debug, PartialEq)]
pub enum OperatorCommand {
  /// Dispatch an event as a test.
  Trigger { event: Event, phrase: String },

  /// Calibrate again.
  Recalibrate,

  /// Print the phase, the estimate and the active flags.
  Status,

  /// Enable testing mode with the given phrase, or disable it.
  Testing(Option<String>),

  /// List the commands.
  Help,
}

/// Why a console line was not understood.
#[derive(Clone, Debug, PartialEq)]
pub enum ParseError {
  UnknownCommand(String),
  UnknownEvent(String),
  MissingArgument(&'static str),
}

impl fmt::Display for ParseError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::UnknownCommand(command) => {
        write!(f, "unknown command '{command}', try 'help'")
      }
      Self::UnknownEvent(event) => write!(f, "unknown event '{event}'"),
      Self::MissingArgument(argument) => write!(f, "missing {argument}"),
    }
  }
}

impl std::error::Error for ParseError {}

/// Console names of every event.
pub fn event_names() -> BiHashMap<&'static str, Event> {
  let mut names = BiHashMap::new();

  names.insert("calibrate", Event::Calibrate);
  names.insert("ready", Event::Ready);
  names.insert("liftoff", Event::Liftoff);
  names.insert("burnout", Event::Burnout);
  names.insert("apogee", Event::Apogee);
  names.insert("main", Event::MainDeployment);
  names.insert("touchdown", Event::Touchdown);
  names.insert("custom1", Event::Custom1);
  names.insert("custom2", Event::Custom2);

  names
}

/// Resolves a console name or a full event name.
fn parse_event(
  word: &str,
  names: &BiHashMap<&'static str, Event>,
) -> Result<Event, ParseError> {
  names
    .get_by_left(word)
    .copied()
    .or_else(|| word.parse().ok())
    .ok_or_else(|| ParseError::UnknownEvent(word.to_owned()))
}

/// Parses one console line. Blank lines yield `None`.
pub fn parse(
  line: &str,
  names: &BiHashMap<&'static str, Event>,
) -> Result<Option<OperatorCommand>, ParseError> {
  let mut words = line.split_whitespace();

  let Some(command) = words.next() else {
    return Ok(None);
  };

  let command = match command {
    "trigger" => {
      let event = words.next().ok_or(ParseError::MissingArgument("event"))?;
      let phrase = words.next().ok_or(ParseError::MissingArgument("phrase"))?;

      OperatorCommand::Trigger {
        event: parse_event(event, names)?,
        phrase: phrase.to_owned(),
      }
    }
    "recalibrate" => OperatorCommand::Recalibrate,
    "status" => OperatorCommand::Status,
    "testing" => match words.next() {
      Some("on") => {
        let phrase =
          words.next().ok_or(ParseError::MissingArgument("phrase"))?;
        OperatorCommand::Testing(Some(phrase.to_owned()))
      }
      Some("off") => OperatorCommand::Testing(None),
      _ => return Err(ParseError::MissingArgument("'on' or 'off'")),
    },
    "help" => OperatorCommand::Help,
    other => return Err(ParseError::UnknownCommand(other.to_owned())),
  };

  Ok(Some(command))
}

fn execute(
  command: OperatorCommand,
  shared: &SharedState,
  commands: &Sender<GroundCommand>,
  names: &BiHashMap<&'static str, Event>,
) {
  let ground = match command {
    OperatorCommand::Trigger { event, phrase } => {
      GroundCommand::Trigger { event, phrase }
    }
    OperatorCommand::Recalibrate => GroundCommand::Recalibrate,
    OperatorCommand::Status => {
      pass!(
        "{} | {} | errors: {} | recording: {}",
        shared.phase.latest().to_pretty_string(),
        shared.estimate.latest(),
        shared.errors.get().to_pretty_string(),
        shared.recorder.is_recording()
      );
      return;
    }
    OperatorCommand::Testing(phrase) => {
      let mut config = (*shared.config.current()).clone();
      config.testing = TestingConfig {
        enabled: phrase.is_some(),
        phrase: phrase.unwrap_or_default(),
      };

      match shared.write_config(config) {
        Ok(()) => pass!("Testing mode updated."),
        Err(error) => warn!("Testing mode unchanged: {error}."),
      }

      return;
    }
    OperatorCommand::Help => {
      let mut events: Vec<_> = names.left_values().copied().collect();
      events.sort_unstable();

      pass!(
        "Commands: trigger <event> <phrase>, recalibrate, status, testing \
         on <phrase>, testing off. Events: {}.",
        events.join(", ")
      );
      return;
    }
  };

  if commands.send(ground).is_err() {
    fail!("Control task is not accepting commands.");
  }
}

/// Reads operator commands from stdin until it closes.
pub fn console(
  shared: SharedState,
  commands: Sender<GroundCommand>,
) -> impl FnOnce() {
  move || {
    let names = event_names();

    for line in io::stdin().lock().lines() {
      let line = match line {
        Ok(line) => line,
        Err(error) => {
          fail!("Failed to read operator input: {error}");
          break;
        }
      };

      match parse(&line, &names) {
        Ok(Some(command)) => execute(command, &shared, &commands, &names),
        Ok(None) => {}
        Err(error) => warn!("{error}."),
      }
    }
  }
}
