//! A one-dimensional vehicle model standing in for the board. It flies a
//! single-stage rocket off the pad, deploys a canopy for each fired pyro
//! channel and produces noisy samples for every redundant sensor unit.

use crate::{
  fsm::TICK_MS,
  hardware::{Actuator, Continuity, PowerSensor, SensorSource},
  preprocess::GRAVITY,
};
use common::comm::{
  error::MAX_PYRO_CHANNELS,
  sensor::{Millis, NUM_BARO, NUM_IMU},
  BaroSample,
  ImuSample,
  RawFrame,
  Vector,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::{Arc, Mutex, MutexGuard};

/// Parameters of the simulated flight and the faults injected into it.
#[derive(Clone, Debug)]
pub struct SimulationConfig {
  /// Seed of the sensor noise.
  pub seed: u64,

  /// Time on the pad before ignition, in milliseconds.
  pub ignition_ms: Millis,

  /// Acceleration produced by the motor, in m/s².
  pub thrust: f32,

  /// Burn time of the motor, in milliseconds.
  pub burn_ms: Millis,

  /// Quadratic drag coefficient of the bare airframe, in 1/m.
  pub drag: f32,

  /// Descent rate under the drogue, in m/s.
  pub drogue_rate: f32,

  /// Descent rate under the main canopy, in m/s.
  pub main_rate: f32,

  /// Pyro channel deploying the drogue.
  pub drogue_channel: u8,

  /// Pyro channel deploying the main canopy.
  pub main_channel: u8,

  /// Static pressure on the pad, in pascals.
  pub ground_pressure: f32,

  /// Constant gyro offset of every IMU unit, in deg/s.
  pub gyro_bias: Vector,

  /// IMU unit whose output is stuck from the start.
  pub freeze_imu: Option<usize>,

  /// Barometer unit whose output is stuck from the start.
  pub freeze_baro: Option<usize>,

  /// Pyro channel without an igniter.
  pub cut_continuity: Option<u8>,

  /// Battery voltage at boot, in volts.
  pub battery_voltage: f32,
}

impl Default for SimulationConfig {
  fn default() -> Self {
    SimulationConfig {
      seed: 0,
      ignition_ms: 5_000,
      thrust: 60.0,
      burn_ms: 2_000,
      drag: 5e-4,
      drogue_rate: 25.0,
      main_rate: 6.0,
      drogue_channel: 0,
      main_channel: 1,
      ground_pressure: 98_000.0,
      gyro_bias: Vector::new(0.3, -0.2, 0.1),
      freeze_imu: None,
      freeze_baro: None,
      cut_continuity: None,
      battery_voltage: 8.2,
    }
  }
}

/// Peak noise amplitudes.
const ACCEL_NOISE: f32 = 0.005;
const GYRO_NOISE: f32 = 0.05;
const PRESSURE_NOISE: f32 = 2.0;

#[derive(Debug)]
struct Model {
  config: SimulationConfig,
  rng: StdRng,
  time: Millis,
  height: f32,
  velocity: f32,
  acceleration: f32,
  drogue: bool,
  main: bool,
  landed: bool,
  continuity: [bool; MAX_PYRO_CHANNELS as usize],
  battery: f32,
  fired: Vec<u8>,
  servos: Vec<(u8, u16)>,
  io: Vec<(u8, bool)>,
  frozen_imu: [Option<ImuSample>; NUM_IMU],
  frozen_baro: [Option<BaroSample>; NUM_BARO],
}

impl Model {
  fn new(config: SimulationConfig) -> Self {
    let mut continuity = [true; MAX_PYRO_CHANNELS as usize];

    if let Some(slot) = config
      .cut_continuity
      .and_then(|channel| continuity.get_mut(channel as usize))
    {
      *slot = false;
    }

    Model {
      rng: StdRng::seed_from_u64(config.seed),
      battery: config.battery_voltage,
      time: 0,
      height: 0.0,
      velocity: 0.0,
      acceleration: 0.0,
      drogue: false,
      main: false,
      landed: false,
      continuity,
      fired: Vec::new(),
      servos: Vec::new(),
      io: Vec::new(),
      frozen_imu: [None; NUM_IMU],
      frozen_baro: [None; NUM_BARO],
      config,
    }
  }

  /// Advances the trajectory by one tick.
  fn advance(&mut self) {
    let dt = TICK_MS as f32 / 1000.0;
    self.time += TICK_MS;

    let config = &self.config;
    let burning = self.time > config.ignition_ms
      && self.time <= config.ignition_ms + config.burn_ms;

    if self.landed || (!burning && self.height <= 0.0 && self.velocity <= 0.0)
    {
      self.acceleration = 0.0;
      self.velocity = 0.0;
      self.height = self.height.max(0.0);
      return;
    }

    let thrust = if burning { config.thrust } else { 0.0 };

    // the canopy of the slowest descent rate deployed sets the drag
    let drag = match (self.drogue, self.main) {
      (_, true) => GRAVITY / (config.main_rate * config.main_rate),
      (true, false) => GRAVITY / (config.drogue_rate * config.drogue_rate),
      (false, false) => config.drag,
    };

    let drag = -drag * self.velocity * self.velocity.abs();
    self.acceleration = thrust - GRAVITY + drag;
    self.velocity += self.acceleration * dt;
    self.height += self.velocity * dt;

    if self.height <= 0.0 && self.velocity < 0.0 && !burning {
      self.height = 0.0;
      self.velocity = 0.0;
      self.acceleration = 0.0;
      self.landed = true;
    }
  }

  fn noise(&mut self, amplitude: f32) -> f32 {
    self.rng.gen_range(-amplitude..=amplitude)
  }

  fn noisy(&mut self, value: Vector, amplitude: f32) -> Vector {
    value
      + Vector::new(
        self.noise(amplitude),
        self.noise(amplitude),
        self.noise(amplitude),
      )
  }

  fn pressure(&self) -> f32 {
    let ratio = 1.0 - self.height / 44_330.0;
    self.config.ground_pressure * ratio.powf(5.255)
  }

  fn frame(&mut self) -> RawFrame {
    let timestamp = self.time;

    // an accelerometer measures specific force, 1 g along +Z at rest
    let specific_force =
      Vector::new(0.0, 0.0, (self.acceleration + GRAVITY) / GRAVITY);
    let pressure = self.pressure();
    let gyro_bias = self.config.gyro_bias;

    let mut frame = RawFrame {
      timestamp,
      ..RawFrame::default()
    };

    for unit in 0..NUM_IMU {
      let sample = ImuSample {
        accel: self.noisy(specific_force, ACCEL_NOISE),
        gyro: self.noisy(gyro_bias, GYRO_NOISE),
        temperature: 20.0,
        timestamp,
      };

      frame.imu[unit] = if self.config.freeze_imu == Some(unit) {
        *self.frozen_imu[unit].get_or_insert(sample)
      } else {
        sample
      };
    }

    for unit in 0..NUM_BARO {
      let sample = BaroSample {
        pressure: pressure + self.noise(PRESSURE_NOISE),
        temperature: 20.0,
        timestamp,
      };

      frame.baro[unit] = if self.config.freeze_baro == Some(unit) {
        *self.frozen_baro[unit].get_or_insert(sample)
      } else {
        sample
      };
    }

    frame
  }
}

/// The simulated board. Every clone drives the same vehicle, so one clone
/// can feed the sensor thread while another takes the actuator commands.
#[derive(Clone, Debug)]
pub struct SimulatedVehicle {
  model: Arc<Mutex<Model>>,
}

impl SimulatedVehicle {
  /// Places a vehicle on the pad.
  pub fn new(config: SimulationConfig) -> Self {
    SimulatedVehicle {
      model: Arc::new(Mutex::new(Model::new(config))),
    }
  }

  fn model(&self) -> MutexGuard<'_, Model> {
    self.model.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// True height above the pad, in meters.
  #[cfg(test)]
  pub(crate) fn height(&self) -> f32 {
    self.model().height
  }

  /// True once the vehicle is back on the ground.
  #[cfg(test)]
  pub(crate) fn is_landed(&self) -> bool {
    self.model().landed
  }

  /// Every pyro channel fired, in order.
  #[cfg(test)]
  pub(crate) fn fired(&self) -> Vec<u8> {
    self.model().fired.clone()
  }

  /// Every servo command, in order.
  #[cfg(test)]
  pub(crate) fn servos(&self) -> Vec<(u8, u16)> {
    self.model().servos.clone()
  }

  /// Every digital output command, in order.
  #[cfg(test)]
  pub(crate) fn io(&self) -> Vec<(u8, bool)> {
    self.model().io.clone()
  }

  /// Drops the battery voltage by `volts`.
  #[cfg(test)]
  pub(crate) fn sag_battery(&self, volts: f32) {
    self.model().battery -= volts;
  }
}

impl SensorSource for SimulatedVehicle {
  fn read(&mut self) -> RawFrame {
    let mut model = self.model();
    model.advance();
    model.frame()
  }
}

impl Actuator for SimulatedVehicle {
  fn fire_pyro(&mut self, channel: u8) {
    let mut model = self.model();
    model.fired.push(channel);

    let connected = model
      .continuity
      .get(channel as usize)
      .copied()
      .unwrap_or(false);

    if !connected {
      return;
    }

    // the igniter burns through
    model.continuity[channel as usize] = false;

    if channel == model.config.drogue_channel {
      model.drogue = true;
    }

    if channel == model.config.main_channel {
      model.main = true;
    }
  }

  fn set_servo(&mut self, channel: u8, position: u16) {
    self.model().servos.push((channel, position));
  }

  fn set_io(&mut self, channel: u8, high: bool) {
    self.model().io.push((channel, high));
  }
}

impl Continuity for SimulatedVehicle {
  fn has_continuity(&self, channel: u8) -> bool {
    self
      .model()
      .continuity
      .get(channel as usize)
      .copied()
      .unwrap_or(false)
  }
}

impl PowerSensor for SimulatedVehicle {
  fn battery_voltage(&self) -> f32 {
    self.model().battery
  }
}
