use common::{
  comm::{Action, Event, OutputLayout},
  config::{Config, ConfigError, TimerConfig, CONFIG_VERSION},
};

fn populated() -> anyhow::Result<Config> {
  let mut config = Config::default();

  config.action_map.bind(
    Event::Apogee,
    vec![
      Action::FirePyro { channel: 0 },
      Action::SetServo {
        channel: 1,
        position: 750,
      },
      Action::SetIo {
        channel: 3,
        high: true,
      },
    ],
  )?;

  config.timers[0] = Some(TimerConfig {
    start: Event::Liftoff,
    trigger: Event::Custom1,
    duration_ms: 4_500,
  });

  config.testing.enabled = true;
  config.testing.phrase = "go for test".to_owned();
  config.set_by_user = true;

  Ok(config)
}

#[test]
fn postcard_blob_starts_with_version() -> anyhow::Result<()> {
  let config = populated()?;
  let blob = postcard::to_allocvec(&config)?;

  let (version, _) = postcard::take_from_bytes::<u32>(&blob)?;
  assert_eq!(version, CONFIG_VERSION);

  let decoded: Config = postcard::from_bytes(&blob)?;
  assert_eq!(decoded, config);
  assert_eq!(
    decoded.action_map.actions(Event::Apogee),
    config.action_map.actions(Event::Apogee)
  );

  Ok(())
}

#[test]
fn json_names_are_snake_case() -> anyhow::Result<()> {
  let config = populated()?;
  let json = serde_json::to_value(&config)?;

  assert_eq!(json["timers"][0]["trigger"], "custom1");
  let apogee = &json["action_map"]["bindings"]["apogee"];
  assert_eq!(apogee[0]["fire_pyro"]["channel"], 0);

  Ok(())
}

#[test]
fn binding_outside_layout_rejects_whole_config() -> anyhow::Result<()> {
  let mut config = populated()?;
  config.outputs = OutputLayout {
    pyro_channels: 2,
    servo_channels: 1,
    io_channels: 4,
  };

  assert!(matches!(config.validate(), Err(ConfigError::Actions(_))));
  Ok(())
}
