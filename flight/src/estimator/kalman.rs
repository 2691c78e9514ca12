use crate::linalg::{ColumnVector, Matrix, SingularMatrix};

/// Time between two control ticks, in seconds.
pub const DT: f32 = 0.01;

/// Determinants smaller than this are treated as singular.
const INVERSION_EPS: f32 = 1e-12;

/// Noise parameters of the vertical channel filter.
#[derive(Clone, Copy, Debug)]
pub struct NoiseModel {
  /// Diagonal of the process noise covariance for height, velocity and
  /// acceleration.
  pub process: [f32; 3],

  /// Variance of the barometric altitude, in m².
  pub baro: f32,

  /// Variance of the vertical acceleration, in (m/s²)².
  pub accel: f32,

  /// Initial variance of every state.
  pub initial: f32,
}

impl Default for NoiseModel {
  fn default() -> Self {
    NoiseModel {
      process: [1e-5, 1e-3, 0.5],
      baro: 2.0,
      accel: 0.1,
      initial: 1.0,
    }
  }
}

/// A linear Kalman filter over height, vertical velocity and vertical
/// acceleration with a constant-acceleration motion model.
#[derive(Clone, Debug)]
pub struct KalmanFilter {
  x: ColumnVector<3>,
  p: Matrix<3, 3>,
  f: Matrix<3, 3>,
  q: Matrix<3, 3>,
  noise: NoiseModel,
}

impl KalmanFilter {
  /// Constructs a filter at rest at zero height.
  pub fn new(noise: NoiseModel) -> Self {
    let mut q = Matrix::zeros();

    for (i, variance) in noise.process.iter().enumerate() {
      q[(i, i)] = *variance;
    }

    KalmanFilter {
      x: ColumnVector::zeros(),
      p: Matrix::identity().scale(noise.initial),
      f: Matrix::from_rows([
        [1.0, DT, DT * DT / 2.0],
        [0.0, 1.0, DT],
        [0.0, 0.0, 1.0],
      ]),
      q,
      noise,
    }
  }

  /// Forgets the current estimate, leaving the filter at rest at zero
  /// height.
  pub fn reset(&mut self) {
    *self = KalmanFilter::new(self.noise);
  }

  /// Height, velocity and acceleration.
  pub fn state(&self) -> [f32; 3] {
    [self.x.at(0), self.x.at(1), self.x.at(2)]
  }

  #[cfg(test)]
  pub(crate) fn covariance(&self) -> &Matrix<3, 3> {
    &self.p
  }

  /// Runs one predict and, for every measurement present, one update.
  ///
  /// When the innovation covariance cannot be inverted, the state and
  /// covariance from before this step are restored and the error returned.
  pub fn step(
    &mut self,
    altitude: Option<f32>,
    acceleration: Option<f32>,
  ) -> Result<(), SingularMatrix> {
    let (x, p) = (self.x, self.p);

    self.predict();

    let result = match (altitude, acceleration) {
      (Some(h), Some(a)) => self.correct(
        Matrix::from_rows([[1.0, 0.0, 0.0], [0.0, 0.0, 1.0]]),
        ColumnVector::column([h, a]),
        Matrix::from_rows([[self.noise.baro, 0.0], [0.0, self.noise.accel]]),
      ),
      (Some(h), None) => self.correct(
        Matrix::from_rows([[1.0, 0.0, 0.0]]),
        ColumnVector::column([h]),
        Matrix::from_rows([[self.noise.baro]]),
      ),
      (None, Some(a)) => self.correct(
        Matrix::from_rows([[0.0, 0.0, 1.0]]),
        ColumnVector::column([a]),
        Matrix::from_rows([[self.noise.accel]]),
      ),
      (None, None) => Ok(()),
    };

    if result.is_err() {
      self.x = x;
      self.p = p;
    }

    result
  }

  fn predict(&mut self) {
    self.x = self.f * self.x;
    self.p = self.f * self.p * self.f.transpose() + self.q;
  }

  fn correct<const M: usize>(
    &mut self,
    h: Matrix<M, 3>,
    z: ColumnVector<M>,
    r: Matrix<M, M>,
  ) -> Result<(), SingularMatrix> {
    let ht = h.transpose();
    let s = h * self.p * ht + r;
    let s_inverse = s.inverse(INVERSION_EPS)?;

    let k = self.p * ht * s_inverse;
    let innovation = z - h * self.x;

    let x = self.x + k * innovation;
    let p = ((Matrix::identity() - k * h) * self.p).symmetrize();

    if !x.is_finite() || !p.is_finite() {
      return Err(SingularMatrix {
        determinant: s.determinant(M),
      });
    }

    self.x = x;
    self.p = p;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tracks_constant_acceleration() {
    let mut filter = KalmanFilter::new(NoiseModel::default());

    for tick in 1..=300 {
      let t = tick as f32 * DT;
      filter.step(Some(0.5 * 10.0 * t * t), Some(10.0)).unwrap();
    }

    let [h, v, a] = filter.state();
    assert!((a - 10.0).abs() < 0.5, "a = {a}");
    assert!((v - 30.0).abs() < 1.5, "v = {v}");
    assert!((h - 45.0).abs() < 2.0, "h = {h}");
  }

  #[test]
  fn covariance_stays_symmetric() {
    let mut filter = KalmanFilter::new(NoiseModel::default());

    for tick in 0..50 {
      let altitude = (tick % 3 == 0).then_some(tick as f32);
      filter.step(altitude, Some(0.3)).unwrap();
    }

    let p = filter.covariance();
    for i in 0..3 {
      assert!(p[(i, i)] >= 0.0);
      for j in 0..3 {
        assert_eq!(p[(i, j)], p[(j, i)]);
      }
    }
  }

  #[test]
  fn dead_reckons_without_measurements() {
    let mut filter = KalmanFilter::new(NoiseModel::default());

    for _ in 0..200 {
      filter.step(Some(0.0), Some(5.0)).unwrap();
    }

    let [h, v, a] = filter.state();
    filter.step(None, None).unwrap();
    let [h2, v2, a2] = filter.state();

    assert_eq!(a2, a);
    assert!((v2 - (v + a * DT)).abs() < 1e-4);
    assert!((h2 - (h + v * DT + a * DT * DT / 2.0)).abs() < 1e-4);
  }

  #[test]
  fn singular_update_restores_previous_state() {
    let noise = NoiseModel {
      process: [0.0; 3],
      baro: 0.0,
      accel: 0.0,
      initial: 0.0,
    };
    let mut filter = KalmanFilter::new(noise);
    let before = filter.state();

    assert!(filter.step(Some(10.0), Some(1.0)).is_err());
    assert_eq!(filter.state(), before);
    assert_eq!(filter.covariance(), &Matrix::zeros());
  }
}
