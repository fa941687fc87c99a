//! Dense kernels over `faer` matrices.
//!
//! Factorizations here report failure through a flag or an `Err` instead of
//! panicking, so log densities can turn a numerically invalid parameter into
//! `-inf` instead of aborting the evaluation.

use faer::linalg::solvers::DenseSolveCore;
use faer::linalg::triangular_solve::{
    solve_lower_triangular_in_place, solve_upper_triangular_in_place,
};
use faer::{Mat, Par, Side};
use ndarray::{Array2, ArrayD, ArrayViewD};
use thiserror::Error;

use crate::distribution::DistError;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinalgError {
    #[error("matrix is not positive definite")]
    NotPositiveDefinite,
    #[error("matrix is singular")]
    Singular,
    #[error("expected a square matrix, got {0}x{1}")]
    NotSquare(usize, usize),
    #[error("eigen decomposition did not converge")]
    NoConvergence,
}

/// A lower Cholesky factor together with a flag that tells whether the
/// factorization succeeded.
///
/// When `ok` is false the factor has `NaN` in its first diagonal entry.
#[derive(Debug, Clone)]
pub struct CholeskyFactor {
    pub factor: Mat<f64>,
    pub ok: bool,
}

impl CholeskyFactor {
    pub fn dim(&self) -> usize {
        self.factor.nrows()
    }

    /// The factor if valid, the identity otherwise.
    ///
    /// Triangular solves against the result are always well defined.
    pub fn solvable(&self) -> Mat<f64> {
        if self.ok {
            self.factor.clone()
        } else {
            Mat::identity(self.dim(), self.dim())
        }
    }

    /// Sum of the logs of the diagonal, half of the log determinant of `L Lᵀ`.
    pub fn half_logdet(&self) -> f64 {
        (0..self.dim()).map(|i| self.factor[(i, i)].ln()).sum()
    }
}

pub fn try_cholesky(a: &Mat<f64>) -> Result<Mat<f64>, LinalgError> {
    if a.ncols() != a.nrows() {
        return Err(LinalgError::NotSquare(a.nrows(), a.ncols()));
    }
    let llt = a
        .llt(Side::Lower)
        .map_err(|_| LinalgError::NotPositiveDefinite)?;
    let l = llt.L().to_owned();
    // Non-finite input can slip through the pivot check.
    if !(0..l.nrows()).all(|i| l[(i, i)] > 0. && l[(i, i)].is_finite()) {
        return Err(LinalgError::NotPositiveDefinite);
    }
    Ok(l)
}

/// Cholesky factorization that never fails.
pub fn cholesky(a: &Mat<f64>) -> CholeskyFactor {
    match try_cholesky(a) {
        Ok(factor) => CholeskyFactor { factor, ok: true },
        Err(_) => {
            let n = a.nrows().min(a.ncols());
            let mut factor = Mat::<f64>::zeros(n, n);
            if n > 0 {
                factor[(0, 0)] = f64::NAN;
            }
            CholeskyFactor { factor, ok: false }
        }
    }
}

pub fn matrix_pos_def(a: &Mat<f64>) -> bool {
    try_cholesky(a).is_ok()
}

pub fn is_symmetric(a: &Mat<f64>) -> bool {
    a.nrows() == a.ncols()
        && (0..a.nrows()).all(|i| (0..i).all(|j| a[(i, j)] == a[(j, i)]))
}

pub(crate) fn mat_to_array(a: &Mat<f64>) -> ArrayD<f64> {
    Array2::from_shape_fn((a.nrows(), a.ncols()), |(i, j)| a[(i, j)]).into_dyn()
}

/// Interprets a two dimensional array as a matrix.
pub(crate) fn array_to_mat(a: &ArrayViewD<'_, f64>) -> Result<Mat<f64>, DistError> {
    if a.ndim() != 2 {
        return Err(DistError::Rank {
            name: "value",
            expected: "two".into(),
            found: a.ndim(),
        });
    }
    let (rows, cols) = (a.shape()[0], a.shape()[1]);
    Ok(Mat::from_fn(rows, cols, |i, j| a[[i, j]]))
}

pub fn transpose(a: &Mat<f64>) -> Mat<f64> {
    Mat::from_fn(a.ncols(), a.nrows(), |i, j| a[(j, i)])
}

pub fn matmul(a: &Mat<f64>, b: &Mat<f64>) -> Mat<f64> {
    assert_eq!(a.ncols(), b.nrows());
    a * b
}

pub fn trace(a: &Mat<f64>) -> f64 {
    (0..a.nrows().min(a.ncols())).map(|i| a[(i, i)]).sum()
}

/// Solves `L X = B` for lower triangular `L`. The upper triangle of `l` is
/// not read.
pub fn solve_lower(l: &Mat<f64>, b: &Mat<f64>) -> Mat<f64> {
    assert_eq!(b.nrows(), l.nrows());
    let mut x = b.clone();
    solve_lower_triangular_in_place(l.as_ref(), x.as_mut(), Par::Seq);
    x
}

/// Solves `U X = B` for upper triangular `U`.
pub fn solve_upper(u: &Mat<f64>, b: &Mat<f64>) -> Mat<f64> {
    assert_eq!(b.nrows(), u.nrows());
    let mut x = b.clone();
    solve_upper_triangular_in_place(u.as_ref(), x.as_mut(), Par::Seq);
    x
}

pub fn det(a: &Mat<f64>) -> f64 {
    a.determinant()
}

/// General matrix inverse via LU with partial pivoting.
pub fn matrix_inverse(a: &Mat<f64>) -> Result<Mat<f64>, LinalgError> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(LinalgError::NotSquare(n, a.ncols()));
    }
    let lu = a.partial_piv_lu();
    let u = lu.U();
    if (0..n).any(|i| u[(i, i)] == 0.) {
        return Err(LinalgError::Singular);
    }
    Ok(lu.inverse())
}

/// Eigen decomposition of a symmetric matrix, reading its lower triangle.
///
/// Eigenvalues are sorted ascending; column `i` of the returned matrix is the
/// eigenvector belonging to eigenvalue `i`.
pub fn symmetric_eigen(a: &Mat<f64>) -> Result<(Vec<f64>, Mat<f64>), LinalgError> {
    if a.ncols() != a.nrows() {
        return Err(LinalgError::NotSquare(a.nrows(), a.ncols()));
    }
    let eig = a
        .self_adjoint_eigen(Side::Lower)
        .map_err(|_| LinalgError::NoConvergence)?;
    let values = eig.S().column_vector().iter().copied().collect();
    Ok((values, eig.U().to_owned()))
}

pub fn eigvalsh(a: &Mat<f64>) -> Result<Vec<f64>, LinalgError> {
    if a.ncols() != a.nrows() {
        return Err(LinalgError::NotSquare(a.nrows(), a.ncols()));
    }
    a.self_adjoint_eigenvalues(Side::Lower)
        .map_err(|_| LinalgError::NoConvergence)
}
