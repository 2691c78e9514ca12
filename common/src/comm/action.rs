use super::phase::Event;
use postcard::experimental::max_size::MaxSize;
use serde::{Deserialize, Serialize};
use std::{
  collections::{BTreeMap, BTreeSet},
  error::Error,
  fmt,
};

/// The maximum number of actions which may be bound to a single event.
pub const MAX_ACTIONS_PER_EVENT: usize = 16;

/// A single configurable output operation.
#[derive(
  Clone, Copy, Debug, Deserialize, Eq, Hash, MaxSize, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Action {
  /// Fires the pyrotechnic charge wired to the high-current channel.
  FirePyro {
    /// Zero-based pyro channel.
    channel: u8,
  },

  /// Commands a servo to a position.
  SetServo {
    /// Zero-based servo channel.
    channel: u8,

    /// Position, in tenths of a percent of travel (0 to 1000).
    position: u16,
  },

  /// Drives a low-level digital output.
  SetIo {
    /// Zero-based IO channel.
    channel: u8,

    /// True to drive the output high.
    high: bool,
  },

  /// Starts or stops the flight recorder.
  Recorder {
    /// True to start recording, false to stop.
    enabled: bool,
  },
}

impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::FirePyro { channel } => write!(f, "fire pyro {channel}"),
      Self::SetServo { channel, position } => {
        write!(f, "set servo {channel} to {position}")
      }
      Self::SetIo { channel, high } => {
        write!(f, "set io {channel} {}", if *high { "high" } else { "low" })
      }
      Self::Recorder { enabled } => {
        write!(f, "{} recorder", if *enabled { "start" } else { "stop" })
      }
    }
  }
}

/// Describes how many output channels of each kind the board provides.
#[derive(
  Clone, Copy, Debug, Deserialize, Eq, Hash, MaxSize, PartialEq, Serialize,
)]
pub struct OutputLayout {
  /// Number of high-current pyro channels.
  pub pyro_channels: u8,

  /// Number of servo outputs.
  pub servo_channels: u8,

  /// Number of low-level digital outputs.
  pub io_channels: u8,
}

impl Default for OutputLayout {
  fn default() -> Self {
    OutputLayout {
      pyro_channels: 2,
      servo_channels: 2,
      io_channels: 4,
    }
  }
}

impl OutputLayout {
  /// Checks that the channel an action refers to exists on the board.
  pub fn supports(&self, action: &Action) -> bool {
    match *action {
      Action::FirePyro { channel } => channel < self.pyro_channels,
      Action::SetServo { channel, position } => {
        channel < self.servo_channels && position <= 1000
      }
      Action::SetIo { channel, .. } => channel < self.io_channels,
      Action::Recorder { .. } => true,
    }
  }
}

/// Reasons an `ActionMap` is refused when loaded or edited.
#[derive(Clone, Debug, PartialEq)]
pub enum ActionMapError {
  /// More than `MAX_ACTIONS_PER_EVENT` actions were bound to one event.
  TooManyActions {
    /// The offending event.
    event: Event,

    /// How many actions were supplied.
    count: usize,
  },

  /// An action refers to an output the board does not have.
  UnknownChannel {
    /// The event the action is bound to.
    event: Event,

    /// The offending action.
    action: Action,
  },
}

impl fmt::Display for ActionMapError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::TooManyActions { event, count } => write!(
        f,
        "{count} actions bound to event {event}, at most \
         {MAX_ACTIONS_PER_EVENT} are allowed"
      ),
      Self::UnknownChannel { event, action } => write!(
        f,
        "action '{action}' bound to event {event} refers to a channel the \
         board does not have"
      ),
    }
  }
}

impl Error for ActionMapError {}

/// Binds events to the ordered list of actions executed when they occur.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ActionMap {
  bindings: BTreeMap<Event, Vec<Action>>,
}

impl ActionMap {
  /// Constructs a map with no bindings.
  pub fn new() -> Self {
    ActionMap::default()
  }

  /// Replaces the actions bound to `event`. Binding an empty list unbinds the
  /// event.
  pub fn bind(
    &mut self,
    event: Event,
    actions: Vec<Action>,
  ) -> Result<(), ActionMapError> {
    if actions.len() > MAX_ACTIONS_PER_EVENT {
      return Err(ActionMapError::TooManyActions {
        event,
        count: actions.len(),
      });
    }

    if actions.is_empty() {
      self.bindings.remove(&event);
    } else {
      self.bindings.insert(event, actions);
    }

    Ok(())
  }

  /// The actions bound to `event`, in execution order. Unmapped events yield
  /// an empty slice.
  pub fn actions(&self, event: Event) -> &[Action] {
    self.bindings.get(&event).map_or(&[], Vec::as_slice)
  }

  /// Iterates over every bound event and its actions.
  pub fn iter(&self) -> impl Iterator<Item = (Event, &[Action])> + '_ {
    self
      .bindings
      .iter()
      .map(|(event, actions)| (*event, actions.as_slice()))
  }

  /// Checks every binding against the list length limit and the board's
  /// output layout.
  pub fn validate(&self, layout: &OutputLayout) -> Result<(), ActionMapError> {
    for (event, actions) in self.iter() {
      if actions.len() > MAX_ACTIONS_PER_EVENT {
        return Err(ActionMapError::TooManyActions {
          event,
          count: actions.len(),
        });
      }

      if let Some(action) = actions.iter().find(|a| !layout.supports(a)) {
        return Err(ActionMapError::UnknownChannel {
          event,
          action: *action,
        });
      }
    }

    Ok(())
  }

  /// The pyro channels bound to any `FirePyro` action.
  pub fn pyro_channels(&self) -> BTreeSet<u8> {
    self
      .bindings
      .values()
      .flatten()
      .filter_map(|action| match action {
        Action::FirePyro { channel } => Some(*channel),
        _ => None,
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unmapped_event_has_no_actions() {
    let map = ActionMap::new();
    assert!(map.actions(Event::Apogee).is_empty());
  }

  #[test]
  fn binding_more_than_the_limit_is_refused() {
    let mut map = ActionMap::new();
    let actions = vec![Action::Recorder { enabled: true }; 17];

    assert_eq!(
      map.bind(Event::Liftoff, actions),
      Err(ActionMapError::TooManyActions {
        event: Event::Liftoff,
        count: 17,
      })
    );
  }

  #[test]
  fn unknown_channel_is_rejected() {
    let mut map = ActionMap::new();
    map
      .bind(Event::Apogee, vec![Action::FirePyro { channel: 5 }])
      .unwrap();

    let result = map.validate(&OutputLayout::default());
    assert!(matches!(
      result,
      Err(ActionMapError::UnknownChannel { event: Event::Apogee, .. })
    ));
  }

  #[test]
  fn pyro_channels_collects_bound_channels() {
    let mut map = ActionMap::new();
    map
      .bind(
        Event::Apogee,
        vec![
          Action::FirePyro { channel: 0 },
          Action::SetServo {
            channel: 1,
            position: 500,
          },
        ],
      )
      .unwrap();
    map
      .bind(Event::MainDeployment, vec![Action::FirePyro { channel: 1 }])
      .unwrap();

    assert_eq!(map.pyro_channels(), BTreeSet::from([0, 1]));
  }
}
