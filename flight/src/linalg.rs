//! Fixed-dimension matrix arithmetic for the state estimator.
//!
//! Every operation takes its operands by value or shared reference and
//! returns a fresh matrix, so an output can never alias one of its inputs.
//! Dimensions are part of the type and nothing here allocates.

use std::{
  error::Error,
  fmt,
  ops::{Add, Index, IndexMut, Mul, Sub},
};

/// A dense, row-major `R × C` matrix of `f32`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Matrix<const R: usize, const C: usize>(pub [[f32; C]; R]);

/// A matrix with a single column.
pub type ColumnVector<const N: usize> = Matrix<N, 1>;

/// Returned when a matrix is too close to singular to be inverted.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SingularMatrix {
  /// The determinant which fell below the tolerance.
  pub determinant: f32,
}

impl fmt::Display for SingularMatrix {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "matrix is singular (determinant = {:e})",
      self.determinant
    )
  }
}

impl Error for SingularMatrix {}

impl<const R: usize, const C: usize> Matrix<R, C> {
  /// A matrix of zeros.
  pub const fn zeros() -> Self {
    Matrix([[0.0; C]; R])
  }

  /// Builds a matrix from its rows.
  pub const fn from_rows(rows: [[f32; C]; R]) -> Self {
    Matrix(rows)
  }

  /// The transpose.
  pub fn transpose(&self) -> Matrix<C, R> {
    let mut result = Matrix::<C, R>::zeros();

    for i in 0..R {
      for j in 0..C {
        result.0[j][i] = self.0[i][j];
      }
    }

    result
  }

  /// Every element multiplied by `factor`.
  pub fn scale(&self, factor: f32) -> Self {
    let mut result = *self;

    for row in result.0.iter_mut() {
      for element in row.iter_mut() {
        *element *= factor;
      }
    }

    result
  }

  /// True if every element is a finite number.
  pub fn is_finite(&self) -> bool {
    self.0.iter().flatten().all(|element| element.is_finite())
  }
}

impl<const N: usize> Matrix<N, N> {
  /// The identity matrix.
  pub fn identity() -> Self {
    let mut result = Self::zeros();

    for i in 0..N {
      result.0[i][i] = 1.0;
    }

    result
  }

  /// Copies into `temp` the `(n - 1) × (n - 1)` minor of the leading
  /// `n × n` block obtained by removing row `p` and column `q`.
  ///
  /// `temp` keeps the full `N × N` shape. Only its leading `n - 1` rows and
  /// columns are meaningful afterwards.
  pub fn cofactor(&self, temp: &mut Self, p: usize, q: usize, n: usize) {
    let (mut i, mut j) = (0, 0);

    for row in 0..n {
      for col in 0..n {
        if row == p || col == q {
          continue;
        }

        temp.0[i][j] = self.0[row][col];
        j += 1;

        if j == n - 1 {
          j = 0;
          i += 1;
        }
      }
    }
  }

  /// Determinant of the leading `n × n` block by cofactor expansion along the
  /// first row.
  pub fn determinant(&self, n: usize) -> f32 {
    match n {
      0 => 1.0,
      1 => self.0[0][0],
      _ => {
        let mut temp = Self::zeros();
        let mut sign = 1.0;
        let mut det = 0.0;

        for f in 0..n {
          self.cofactor(&mut temp, 0, f, n);
          det += sign * self.0[0][f] * temp.determinant(n - 1);
          sign = -sign;
        }

        det
      }
    }
  }

  /// The adjugate: the transpose of the cofactor matrix.
  pub fn adjoint(&self) -> Self {
    let mut adj = Self::zeros();

    if N == 1 {
      adj.0[0][0] = 1.0;
      return adj;
    }

    let mut temp = Self::zeros();

    for i in 0..N {
      for j in 0..N {
        self.cofactor(&mut temp, i, j, N);

        let sign = if (i + j) % 2 == 0 { 1.0 } else { -1.0 };
        adj.0[j][i] = sign * temp.determinant(N - 1);
      }
    }

    adj
  }

  /// The inverse, computed as `adjoint / determinant`.
  ///
  /// Fails when the absolute determinant is below `eps`.
  pub fn inverse(&self, eps: f32) -> Result<Self, SingularMatrix> {
    let determinant = self.determinant(N);

    if !determinant.is_finite() || determinant.abs() < eps {
      return Err(SingularMatrix { determinant });
    }

    Ok(self.adjoint().scale(1.0 / determinant))
  }

  /// Replaces the matrix with `(A + Aᵀ) / 2`.
  pub fn symmetrize(&self) -> Self {
    (*self + self.transpose()).scale(0.5)
  }
}

impl<const R: usize, const C: usize> Default for Matrix<R, C> {
  fn default() -> Self {
    Self::zeros()
  }
}

impl<const R: usize, const C: usize> Index<(usize, usize)> for Matrix<R, C> {
  type Output = f32;

  fn index(&self, (row, col): (usize, usize)) -> &f32 {
    &self.0[row][col]
  }
}

impl<const R: usize, const C: usize> IndexMut<(usize, usize)>
  for Matrix<R, C>
{
  fn index_mut(&mut self, (row, col): (usize, usize)) -> &mut f32 {
    &mut self.0[row][col]
  }
}

impl<const R: usize, const C: usize> Add for Matrix<R, C> {
  type Output = Self;

  fn add(self, rhs: Self) -> Self {
    let mut result = self;

    for i in 0..R {
      for j in 0..C {
        result.0[i][j] += rhs.0[i][j];
      }
    }

    result
  }
}

impl<const R: usize, const C: usize> Sub for Matrix<R, C> {
  type Output = Self;

  fn sub(self, rhs: Self) -> Self {
    let mut result = self;

    for i in 0..R {
      for j in 0..C {
        result.0[i][j] -= rhs.0[i][j];
      }
    }

    result
  }
}

impl<const R: usize, const K: usize, const C: usize> Mul<Matrix<K, C>>
  for Matrix<R, K>
{
  type Output = Matrix<R, C>;

  fn mul(self, rhs: Matrix<K, C>) -> Matrix<R, C> {
    let mut result = Matrix::<R, C>::zeros();

    for i in 0..R {
      for j in 0..C {
        for k in 0..K {
          result.0[i][j] += self.0[i][k] * rhs.0[k][j];
        }
      }
    }

    result
  }
}

impl<const N: usize> ColumnVector<N> {
  /// Builds a column vector from its elements.
  pub fn column(elements: [f32; N]) -> Self {
    let mut result = Self::zeros();

    for (row, element) in result.0.iter_mut().zip(elements) {
      row[0] = element;
    }

    result
  }

  /// Element `i` of the vector.
  pub fn at(&self, i: usize) -> f32 {
    self.0[i][0]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn assert_close<const R: usize, const C: usize>(
    a: &Matrix<R, C>,
    b: &Matrix<R, C>,
  ) {
    for i in 0..R {
      for j in 0..C {
        assert!(
          (a[(i, j)] - b[(i, j)]).abs() < 1e-4,
          "{a:?} differs from {b:?} at ({i}, {j})"
        );
      }
    }
  }

  #[test]
  fn product_with_identity_is_unchanged() {
    let a = Matrix::from_rows([[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
    assert_eq!(a * Matrix::<2, 2>::identity(), a);
    assert_eq!(Matrix::<3, 3>::identity() * a, a);
  }

  #[test]
  fn transpose_of_product() {
    let a = Matrix::from_rows([[1.0, 2.0, 0.5], [3.0, -4.0, 1.0]]);
    let b = Matrix::from_rows([[2.0, 1.0], [0.0, 1.0], [-1.0, 3.0]]);

    assert_close(&(a * b).transpose(), &(b.transpose() * a.transpose()));
  }

  #[test]
  fn determinant_of_three_by_three() {
    let a = Matrix::from_rows([
      [2.0, -3.0, 1.0],
      [2.0, 0.0, -1.0],
      [1.0, 4.0, 5.0],
    ]);
    assert!((a.determinant(3) - 49.0).abs() < 1e-4);
  }

  #[test]
  fn inverse_times_matrix_is_identity() {
    let a = Matrix::from_rows([
      [4.0, 7.0, 2.0],
      [3.0, 6.0, 1.0],
      [2.0, 5.0, 3.0],
    ]);
    let inverse = a.inverse(1e-6).unwrap();

    assert_close(&(a * inverse), &Matrix::identity());
    assert_close(&(inverse * a), &Matrix::identity());
  }

  #[test]
  fn inverse_of_one_by_one() {
    let a = Matrix::from_rows([[4.0]]);
    assert_close(&a.inverse(1e-6).unwrap(), &Matrix::from_rows([[0.25]]));
  }

  #[test]
  fn singular_matrix_is_refused() {
    let a = Matrix::from_rows([[1.0, 2.0], [2.0, 4.0]]);
    let error = a.inverse(1e-6).unwrap_err();

    assert!(error.determinant.abs() < 1e-6);
  }

  #[test]
  fn symmetrize_averages_off_diagonals() {
    let a = Matrix::from_rows([[1.0, 2.0], [4.0, 3.0]]);
    assert_eq!(a.symmetrize(), Matrix::from_rows([[1.0, 3.0], [3.0, 3.0]]));
  }
}
