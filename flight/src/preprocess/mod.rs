//! Turns the raw samples of the redundant sensor units into one calibrated
//! measurement in SI units per tick.

mod calibration;
mod elimination;
mod median;

pub use calibration::{CalibrationStatus, Calibrator};
pub use elimination::UnitMonitor;
pub use median::{MedianFilter, MEDIAN_WINDOW};

use common::{
  comm::{
    sensor::{NUM_BARO, NUM_IMU},
    BaroSample,
    ErrorFlags,
    FlightPhase,
    ImuSample,
    RawFrame,
    Vector,
  },
  config::{CalibrationData, SensorConfig},
};
use std::f32::consts::PI;

/// Standard gravity, in m/s².
pub const GRAVITY: f32 = 9.81;

/// Pressure assumed before any barometer has produced a sample, in pascals.
const SEA_LEVEL_PRESSURE: f32 = 101_325.0;

/// Which measurement classes had at least one surviving unit this tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Validity {
  /// The IMU values are fresh.
  pub imu: bool,

  /// The barometer values are fresh.
  pub baro: bool,
}

/// The calibrated, fused measurement of one tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FusedMeasurement {
  /// Specific force in the calibrated body frame, in m/s².
  pub acceleration: Vector,

  /// Angular rate with the gyro bias removed, in rad/s.
  pub angular_rate: Vector,

  /// Static pressure, in pascals.
  pub pressure: f32,

  /// Height above the ground reference pressure, in meters.
  pub altitude: f32,

  /// Which of the values above are fresh.
  pub validity: Validity,
}

/// Barometric altitude of `pressure` above the level at which `ground`
/// was measured.
pub fn altitude(pressure: f32, ground: f32) -> f32 {
  44_330.0 * (1.0 - (pressure / ground).powf(1.0 / 5.255))
}

#[derive(Clone, Debug, Default)]
struct Medians {
  accel: [MedianFilter<MEDIAN_WINDOW>; 3],
  gyro: [MedianFilter<MEDIAN_WINDOW>; 3],
  pressure: MedianFilter<MEDIAN_WINDOW>,
}

fn median_of(
  filters: &mut [MedianFilter<MEDIAN_WINDOW>; 3],
  v: Vector,
) -> Vector {
  Vector::new(
    filters[0].push(v.x),
    filters[1].push(v.y),
    filters[2].push(v.z),
  )
}

/// Owns the per-unit health state, the calibration and the one-slot memory
/// of the previous fused values.
#[derive(Debug)]
pub struct Preprocessor {
  config: SensorConfig,
  imu: [UnitMonitor<ImuSample>; NUM_IMU],
  baro: [UnitMonitor<BaroSample>; NUM_BARO],
  medians: Medians,

  /// Previous fused IMU values, acceleration in g and rate in deg/s.
  last_imu: Option<(Vector, Vector)>,

  /// Previous fused pressure.
  last_pressure: Option<f32>,

  ground_pressure: Option<f32>,
  calibration: CalibrationData,
  calibrator: Calibrator,

  /// A converged calibration not yet collected for persisting.
  unsaved: Option<CalibrationData>,
  flags: ErrorFlags,
}

impl Preprocessor {
  /// Flags which only the preprocessor raises and clears.
  pub const OWNED_FLAGS: ErrorFlags = ErrorFlags::IMU_0
    .union(ErrorFlags::IMU_1)
    .union(ErrorFlags::IMU_2)
    .union(ErrorFlags::BARO_0)
    .union(ErrorFlags::BARO_1)
    .union(ErrorFlags::BARO_2)
    .union(ErrorFlags::IMU_EXHAUSTED)
    .union(ErrorFlags::BARO_EXHAUSTED)
    .union(ErrorFlags::CALIBRATION);

  /// Constructs a preprocessor starting from the stored calibration seed.
  pub fn new(config: SensorConfig, seed: CalibrationData) -> Self {
    Preprocessor {
      config,
      imu: Default::default(),
      baro: Default::default(),
      medians: Medians::default(),
      last_imu: None,
      last_pressure: None,
      ground_pressure: None,
      calibration: seed,
      calibrator: Calibrator::default(),
      unsaved: None,
      flags: ErrorFlags::empty(),
    }
  }

  /// Takes over new fault handling settings. Fault counters carry over.
  pub fn set_config(&mut self, config: SensorConfig) {
    self.config = config;
  }

  /// The subset of `OWNED_FLAGS` currently active.
  pub fn flags(&self) -> ErrorFlags {
    self.flags
  }

  /// True once calibration has converged since boot or the last restart.
  pub fn is_calibrated(&self) -> bool {
    matches!(self.calibrator.status(), CalibrationStatus::Converged { .. })
  }

  /// Restarts calibration, clearing a previous failure.
  pub fn restart_calibration(&mut self) {
    self.calibrator.restart();
    self.flags.remove(ErrorFlags::CALIBRATION);
  }

  /// Hands out a freshly converged calibration once so it can be persisted.
  pub fn take_unsaved_calibration(&mut self) -> Option<CalibrationData> {
    self.unsaved.take()
  }

  /// Fuses one raw frame. Calibration samples are only collected while the
  /// vehicle is calibrating.
  pub fn process(
    &mut self,
    frame: &RawFrame,
    phase: FlightPhase,
  ) -> FusedMeasurement {
    let (imu, imu_valid) = self.fuse_imu(&frame.imu);
    let (pressure, baro_valid) = self.fuse_baro(&frame.baro);

    let (accel_g, gyro_dps) = imu;
    let ground = *self.ground_pressure.get_or_insert(pressure);

    if phase == FlightPhase::Calibrating && imu_valid && baro_valid {
      self.feed_calibration(accel_g, gyro_dps, pressure);
    }

    let ground = self.ground_pressure.unwrap_or(ground);
    let validity = Validity {
      imu: imu_valid,
      baro: baro_valid,
    };

    self.convert(accel_g, gyro_dps, pressure, ground, validity)
  }

  /// The previous fused values with neither class valid, used on ticks
  /// without a fresh frame so the estimator only predicts.
  pub fn held(&self) -> FusedMeasurement {
    let (accel_g, gyro_dps) =
      self.last_imu.unwrap_or((Vector::UNIT_Z, Vector::ZERO));
    let ground = self.ground_pressure.unwrap_or(SEA_LEVEL_PRESSURE);
    let pressure = self.last_pressure.unwrap_or(ground);
    let validity = Validity {
      imu: false,
      baro: false,
    };

    self.convert(accel_g, gyro_dps, pressure, ground, validity)
  }

  fn convert(
    &self,
    accel_g: Vector,
    gyro_dps: Vector,
    pressure: f32,
    ground: f32,
    validity: Validity,
  ) -> FusedMeasurement {
    let gyro = gyro_dps - self.calibration.gyro_bias;

    FusedMeasurement {
      acceleration: calibration::rotate(
        accel_g * GRAVITY,
        &self.calibration.accel,
      ),
      angular_rate: gyro * (PI / 180.0),
      pressure,
      altitude: altitude(pressure, ground),
      validity,
    }
  }

  fn feed_calibration(&mut self, accel: Vector, gyro: Vector, pressure: f32) {
    let before = self.calibrator.status();
    let after = self.calibrator.feed(accel, gyro, pressure);

    if before == after {
      return;
    }

    match after {
      CalibrationStatus::Converged {
        data,
        ground_pressure,
      } => {
        self.calibration = data;
        self.ground_pressure = Some(ground_pressure);
        self.unsaved = Some(data);
      }
      CalibrationStatus::Aborted => self.flags.insert(ErrorFlags::CALIBRATION),
      CalibrationStatus::Collecting => {}
    }
  }

  /// Averages the surviving IMU units, skipping samples which are out of
  /// bounds this tick. Returns the previous fused value and `false` when no
  /// sample is usable.
  fn fuse_imu(
    &mut self,
    samples: &[ImuSample; NUM_IMU],
  ) -> ((Vector, Vector), bool) {
    let mut accel = Vector::ZERO;
    let mut gyro = Vector::ZERO;
    let mut count = 0;

    for (unit, sample) in samples.iter().enumerate() {
      let monitor = &mut self.imu[unit];
      let health = monitor.update(sample, &self.config);
      self.flags.set(ErrorFlags::imu(unit), monitor.is_eliminated());

      if !monitor.is_eliminated() && !health.out_of_bounds {
        accel = accel + sample.accel;
        gyro = gyro + sample.gyro;
        count += 1;
      }
    }

    let exhausted = self.imu.iter().all(UnitMonitor::is_eliminated);
    self.flags.set(ErrorFlags::IMU_EXHAUSTED, exhausted);

    if count == 0 {
      let held = self.last_imu.unwrap_or((Vector::UNIT_Z, Vector::ZERO));
      return (held, false);
    }

    let scale = 1.0 / count as f32;
    let (mut accel, mut gyro) = (accel * scale, gyro * scale);

    if cfg!(feature = "median-filter") {
      accel = median_of(&mut self.medians.accel, accel);
      gyro = median_of(&mut self.medians.gyro, gyro);
    }

    self.last_imu = Some((accel, gyro));
    ((accel, gyro), true)
  }

  /// Averages the surviving barometer units, holding the previous value when
  /// no sample is usable.
  fn fuse_baro(&mut self, samples: &[BaroSample; NUM_BARO]) -> (f32, bool) {
    let mut sum = 0.0;
    let mut count = 0;

    for (unit, sample) in samples.iter().enumerate() {
      let monitor = &mut self.baro[unit];
      let health = monitor.update(sample, &self.config);
      self.flags.set(ErrorFlags::baro(unit), monitor.is_eliminated());

      if !monitor.is_eliminated() && !health.out_of_bounds {
        sum += sample.pressure;
        count += 1;
      }
    }

    let exhausted = self.baro.iter().all(UnitMonitor::is_eliminated);
    self.flags.set(ErrorFlags::BARO_EXHAUSTED, exhausted);

    if count == 0 {
      let held = self
        .last_pressure
        .or(self.ground_pressure)
        .unwrap_or(SEA_LEVEL_PRESSURE);
      return (held, false);
    }

    let mut pressure = sum / count as f32;

    if cfg!(feature = "median-filter") {
      pressure = self.medians.pressure.push(pressure);
    }

    self.last_pressure = Some(pressure);
    (pressure, true)
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  /// A frame of three identical, healthy units reading `accel` g and
  /// `pressure` Pa with a little per-tick variation to avoid freezing. The
  /// pressure step is larger than one f32 ulp at 100 kPa.
  pub(crate) fn frame(tick: u32, accel: Vector, pressure: f32) -> RawFrame {
    let jitter = (tick % 7) as f32 * 1e-4;
    let pressure_jitter = (tick % 7) as f32 * 0.01;
    let imu = ImuSample {
      accel: accel + Vector::new(jitter, 0.0, 0.0),
      gyro: Vector::new(0.1, jitter, -0.1),
      temperature: 22.0,
      timestamp: tick * 10,
    };
    let baro = BaroSample {
      pressure: pressure + pressure_jitter,
      temperature: 22.0,
      timestamp: tick * 10,
    };

    RawFrame {
      imu: [imu; NUM_IMU],
      baro: [baro; NUM_BARO],
      timestamp: tick * 10,
    }
  }

  #[test]
  fn altitude_at_ground_pressure_is_zero() {
    assert!(altitude(100_000.0, 100_000.0).abs() < 1e-3);

    // roughly 8.3 m per hectopascal near sea level
    let one_hpa = altitude(101_225.0, 101_325.0);
    assert!((one_hpa - 8.3).abs() < 0.3, "{one_hpa}");
  }

  #[test]
  fn converts_to_si_units() {
    let mut preprocessor =
      Preprocessor::new(SensorConfig::default(), CalibrationData::default());

    let measurement = preprocessor.process(
      &frame(0, Vector::new(0.0, 0.0, 2.0), 100_000.0),
      FlightPhase::Invalid,
    );

    assert!((measurement.acceleration.z - 2.0 * GRAVITY).abs() < 1e-4);
    let roll_rate = 0.1_f32.to_radians();
    assert!((measurement.angular_rate.x - roll_rate).abs() < 1e-6);
    assert!(measurement.altitude.abs() < 1e-3);
    assert_eq!(measurement.validity, Validity { imu: true, baro: true });
  }

  #[test]
  fn faulty_unit_is_excluded_from_average() {
    let config = SensorConfig::default();
    let mut preprocessor =
      Preprocessor::new(config, CalibrationData::default());

    let mut last = None;

    for tick in 0..=u32::from(config.fault_limit) {
      let mut raw = frame(tick, Vector::UNIT_Z, 100_000.0);
      raw.baro[1].pressure = 200_000.0;
      last = Some(preprocessor.process(&raw, FlightPhase::Ready));
    }

    let Some(last) = last else { unreachable!() };
    assert!(preprocessor.flags().contains(ErrorFlags::BARO_1));
    assert!((last.pressure - 100_000.0).abs() < 0.1);
  }

  #[test]
  fn frozen_unit_is_dropped_from_the_average() {
    let config = SensorConfig::default();
    let mut preprocessor =
      Preprocessor::new(config, CalibrationData::default());

    let mut last = None;

    for tick in 0..40 {
      let mut raw = frame(tick, Vector::UNIT_Z, 99_000.0);
      raw.baro[1].pressure = 95_000.0;
      raw.baro[2].pressure += 100.0;

      let measurement = preprocessor.process(&raw, FlightPhase::Ready);
      last = Some((raw, measurement));
    }

    let Some((raw, measurement)) = last else { unreachable!() };
    let expected = (raw.baro[0].pressure + raw.baro[2].pressure) / 2.0;

    assert_eq!(preprocessor.flags(), ErrorFlags::BARO_1);
    assert!(measurement.validity.baro);
    assert!(
      (measurement.pressure - expected).abs() < 0.1,
      "{} != {expected}",
      measurement.pressure
    );
  }

  #[test]
  fn held_measurement_is_invalid_and_keeps_last_values() {
    let mut preprocessor =
      Preprocessor::new(SensorConfig::default(), CalibrationData::default());

    let raw = frame(0, Vector::UNIT_Z, 99_000.0);
    let fresh = preprocessor.process(&raw, FlightPhase::Ready);
    let held = preprocessor.held();

    assert_eq!(held.validity, Validity { imu: false, baro: false });
    assert_eq!(held.pressure, fresh.pressure);
    assert_eq!(held.acceleration, fresh.acceleration);
  }

  #[test]
  fn exhausted_class_holds_last_value() {
    let config = SensorConfig::default();
    let mut preprocessor =
      Preprocessor::new(config, CalibrationData::default());

    let first = frame(0, Vector::UNIT_Z, 99_000.0);
    preprocessor.process(&first, FlightPhase::Ready);

    let mut measurement = None;

    for tick in 1..=u32::from(config.fault_limit) {
      let mut raw = frame(tick, Vector::UNIT_Z, 99_000.0);

      for baro in raw.baro.iter_mut() {
        baro.pressure = 1_000.0;
      }

      measurement = Some(preprocessor.process(&raw, FlightPhase::Ready));
    }

    let Some(measurement) = measurement else { unreachable!() };
    assert!(preprocessor.flags().contains(ErrorFlags::BARO_EXHAUSTED));
    assert!(!measurement.validity.baro);
    assert!(measurement.validity.imu);
    assert!((measurement.pressure - 99_000.0).abs() < 0.01);
  }

  #[test]
  fn calibration_rotates_gravity_onto_z() {
    let mut preprocessor =
      Preprocessor::new(SensorConfig::default(), CalibrationData::default());

    // mounted on its side: gravity along body +X
    let sideways = Vector::new(1.0, 0.0, 0.0);

    for tick in 0..100 {
      let raw = frame(tick, sideways, 100_000.0);
      preprocessor.process(&raw, FlightPhase::Calibrating);
    }

    assert!(preprocessor.is_calibrated());
    assert!(preprocessor.take_unsaved_calibration().is_some());
    assert!(preprocessor.take_unsaved_calibration().is_none());

    let raw = frame(100, sideways, 100_000.0);
    let measurement = preprocessor.process(&raw, FlightPhase::Ready);

    assert!((measurement.acceleration.z - GRAVITY).abs() < 0.01);
    assert!(measurement.acceleration.x.abs() < 0.01);
    assert!(measurement.angular_rate.norm() < 1e-3);
  }

  #[test]
  fn failed_calibration_raises_flag_until_restart() {
    let mut preprocessor =
      Preprocessor::new(SensorConfig::default(), CalibrationData::default());

    for tick in 0..100 {
      // 2 g is not a vehicle at rest
      let raw = frame(tick, Vector::new(0.0, 0.0, 2.0), 100_000.0);
      preprocessor.process(&raw, FlightPhase::Calibrating);
    }

    assert!(preprocessor.flags().contains(ErrorFlags::CALIBRATION));

    preprocessor.restart_calibration();
    assert!(!preprocessor.flags().contains(ErrorFlags::CALIBRATION));
  }
}
