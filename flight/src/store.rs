use common::{
  comm::ErrorFlags,
  config::{Config, ConfigError, CONFIG_VERSION},
};
use jeflog::{pass, warn};
use std::{
  fmt,
  fs,
  io,
  path::{Path, PathBuf},
};

/// Errors of the persisted configuration store.
#[derive(Debug)]
pub enum StoreError {
  /// Nothing has been stored yet.
  NotFound,

  /// The storage could not be accessed.
  Io(io::Error),

  /// The stored blob could not be decoded.
  Decode(postcard::Error),

  /// The stored configuration is not acceptable.
  Invalid(ConfigError),
}

impl From<io::Error> for StoreError {
  fn from(error: io::Error) -> Self {
    if error.kind() == io::ErrorKind::NotFound {
      StoreError::NotFound
    } else {
      StoreError::Io(error)
    }
  }
}

impl From<postcard::Error> for StoreError {
  fn from(error: postcard::Error) -> Self {
    StoreError::Decode(error)
  }
}

impl From<ConfigError> for StoreError {
  fn from(error: ConfigError) -> Self {
    StoreError::Invalid(error)
  }
}

impl fmt::Display for StoreError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::NotFound => write!(f, "no stored configuration"),
      Self::Io(error) => write!(f, "IO error: {error}"),
      Self::Decode(error) => {
        write!(f, "failed to decode configuration: {error}")
      }
      Self::Invalid(error) => write!(f, "{error}"),
    }
  }
}

impl std::error::Error for StoreError {}

/// Reads and writes the whole configuration at once.
pub trait ConfigStore: Send {
  /// Loads the stored configuration.
  fn load(&self) -> Result<Config, StoreError>;

  /// Replaces the stored configuration.
  fn save(&self, config: &Config) -> Result<(), StoreError>;
}

/// Stores the configuration as a postcard blob in a single file.
#[derive(Clone, Debug)]
pub struct FileStore {
  path: PathBuf,
}

impl FileStore {
  /// A store backed by the file at `path`.
  pub fn new(path: impl Into<PathBuf>) -> Self {
    FileStore { path: path.into() }
  }

  /// Location of the backing file.
  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl ConfigStore for FileStore {
  fn load(&self) -> Result<Config, StoreError> {
    let blob = fs::read(&self.path)?;

    // the version is the first field, so it can be checked on its own before
    // the remainder is trusted to have the current layout
    let (version, _) = postcard::take_from_bytes::<u32>(&blob)?;

    if version != CONFIG_VERSION {
      return Err(ConfigError::VersionMismatch { found: version }.into());
    }

    let config: Config = postcard::from_bytes(&blob)?;
    config.validate()?;

    Ok(config)
  }

  fn save(&self, config: &Config) -> Result<(), StoreError> {
    let blob = postcard::to_allocvec(config)?;

    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent)?;
    }

    let staging = self.path.with_extension("tmp");
    fs::write(&staging, blob)?;
    fs::rename(&staging, &self.path)?;

    Ok(())
  }
}

/// Loads the configuration, falling back to the built-in defaults. The
/// returned flags say why the defaults are in use.
pub fn load_or_default(store: &dyn ConfigStore) -> (Config, ErrorFlags) {
  match store.load() {
    Ok(config) => {
      pass!("Loaded stored configuration.");
      (config, ErrorFlags::empty())
    }
    Err(StoreError::NotFound) => {
      warn!("No stored configuration. Using defaults.");
      (Config::default(), ErrorFlags::NO_CONFIG)
    }
    Err(error) => {
      warn!("Stored configuration rejected ({error}). Using defaults.");
      (Config::default(), ErrorFlags::NON_USER_CONFIG)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use common::comm::{Action, Event};

  fn scratch(name: &str) -> FileStore {
    let path = std::env::temp_dir().join(format!(
      "flight-store-{name}-{}.postcard",
      std::process::id()
    ));
    let _ = fs::remove_file(&path);
    FileStore::new(path)
  }

  #[test]
  fn missing_file_uses_defaults_with_no_config() {
    let store = scratch("missing");

    assert!(matches!(store.load(), Err(StoreError::NotFound)));
    assert_eq!(
      load_or_default(&store),
      (Config::default(), ErrorFlags::NO_CONFIG)
    );
  }

  #[test]
  fn saved_configuration_loads_back() {
    let store = scratch("saved");
    let mut config = Config::default();
    config.set_by_user = true;
    config.thresholds.main_altitude = 350.0;

    store.save(&config).unwrap();
    assert_eq!(load_or_default(&store), (config, ErrorFlags::empty()));

    let _ = fs::remove_file(store.path());
  }

  #[test]
  fn version_mismatch_uses_defaults_with_non_user_config() {
    let store = scratch("version");
    let config = Config {
      version: CONFIG_VERSION + 1,
      set_by_user: true,
      ..Config::default()
    };

    fs::write(store.path(), postcard::to_allocvec(&config).unwrap()).unwrap();

    assert!(matches!(
      store.load(),
      Err(StoreError::Invalid(ConfigError::VersionMismatch { .. }))
    ));
    assert_eq!(
      load_or_default(&store),
      (Config::default(), ErrorFlags::NON_USER_CONFIG)
    );

    let _ = fs::remove_file(store.path());
  }

  #[test]
  fn unknown_channel_rejects_whole_configuration() {
    let store = scratch("channel");
    let mut config = Config::default();
    config.set_by_user = true;
    config
      .action_map
      .bind(Event::Burnout, vec![Action::FirePyro { channel: 7 }])
      .unwrap();

    fs::write(store.path(), postcard::to_allocvec(&config).unwrap()).unwrap();

    let (loaded, flags) = load_or_default(&store);
    assert_eq!(loaded, Config::default());
    assert_eq!(flags, ErrorFlags::NON_USER_CONFIG);

    let _ = fs::remove_file(store.path());
  }
}
