//! Covariance parameterizations and Mahalanobis quadratic forms.

use faer::Mat;
use ndarray::{Array1, ArrayD, ArrayViewD, IxDyn};

use crate::distribution::DistError;
use crate::linalg::{cholesky, matmul, matrix_inverse, solve_lower, transpose, CholeskyFactor};
use crate::math::sum_of_squares;
use crate::shape::{broadcast_all, split_event, Lanes};

/// Covariance arguments of a multivariate distribution.
///
/// Exactly one of `cov`, `tau` and `chol` has to be set.
#[derive(Debug, Clone)]
pub struct CovarianceArgs {
    cov: Option<Mat<f64>>,
    tau: Option<Mat<f64>>,
    chol: Option<Mat<f64>>,
    sigma: Option<Mat<f64>>,
    lower: bool,
}

impl Default for CovarianceArgs {
    fn default() -> Self {
        Self {
            cov: None,
            tau: None,
            chol: None,
            sigma: None,
            lower: true,
        }
    }
}

impl CovarianceArgs {
    pub fn cov(mut self, cov: Mat<f64>) -> Self {
        self.cov = Some(cov);
        self
    }

    pub fn tau(mut self, tau: Mat<f64>) -> Self {
        self.tau = Some(tau);
        self
    }

    pub fn chol(mut self, chol: Mat<f64>) -> Self {
        self.chol = Some(chol);
        self
    }

    /// Older name of `cov`, accepted by the Student-T distribution.
    pub fn sigma(mut self, sigma: Mat<f64>) -> Self {
        self.sigma = Some(sigma);
        self
    }

    /// Whether `chol` is lower (default) or upper triangular.
    pub fn lower(mut self, lower: bool) -> Self {
        self.lower = lower;
        self
    }
}

/// Whether a matrix is a covariance or a precision matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatType {
    #[default]
    Cov,
    Tau,
}

/// Quadratic form, log determinant and validity of the factorization.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadDist {
    pub quaddist: ArrayD<f64>,
    /// Half the log determinant of the covariance.
    pub logdet: f64,
    pub ok: bool,
}

fn check_square(name: &'static str, mat: &Mat<f64>) -> Result<(), DistError> {
    if mat.nrows() != mat.ncols() {
        return Err(DistError::InvalidParameter {
            name,
            reason: format!("must be a square matrix, got {}x{}", mat.nrows(), mat.ncols()),
        });
    }
    Ok(())
}

/// Normalizes the covariance arguments into a covariance matrix.
pub fn quaddist_matrix(args: CovarianceArgs) -> Result<Mat<f64>, DistError> {
    let CovarianceArgs {
        mut cov,
        tau,
        chol,
        sigma,
        lower,
    } = args;

    if let Some(sigma) = sigma {
        if cov.is_some() {
            return Err(DistError::Parameterization(
                "Specify only one of cov and Sigma".into(),
            ));
        }
        cov = Some(sigma);
    }

    match (cov, tau, chol) {
        (Some(cov), None, None) => {
            check_square("cov", &cov)?;
            Ok(cov)
        }
        (None, Some(tau), None) => {
            check_square("tau", &tau)?;
            // A singular precision gives a covariance that fails to factorize,
            // which the log densities map to -inf.
            Ok(matrix_inverse(&tau)
                .unwrap_or_else(|_| Mat::from_fn(tau.nrows(), tau.ncols(), |_, _| f64::NAN)))
        }
        (None, None, Some(chol)) => {
            check_square("chol", &chol)?;
            let chol = if lower { chol } else { transpose(&chol) };
            Ok(matmul(&chol, &transpose(&chol)))
        }
        _ => Err(DistError::Parameterization(
            "Specify exactly one of tau, cov, or chol".into(),
        )),
    }
}

/// Quadratic form of the rows of `delta` under the covariance with factor `chol`.
pub fn quaddist_chol(delta: &Mat<f64>, chol: &CholeskyFactor) -> QuadDist {
    let solved = solve_lower(&chol.solvable(), &transpose(delta));
    let quaddist: Vec<f64> = (0..solved.ncols())
        .map(|j| {
            let col: Vec<f64> = (0..solved.nrows()).map(|i| solved[(i, j)]).collect();
            sum_of_squares(&col)
        })
        .collect();
    QuadDist {
        quaddist: Array1::from_vec(quaddist).into_dyn(),
        logdet: chol.half_logdet(),
        ok: chol.ok,
    }
}

/// Quadratic form of the rows of `delta` under the precision with factor `chol`.
pub fn quaddist_tau(delta: &Mat<f64>, chol: &CholeskyFactor) -> QuadDist {
    let rotated = matmul(delta, &chol.solvable());
    let quaddist: Vec<f64> = (0..rotated.nrows())
        .map(|i| {
            let row: Vec<f64> = (0..rotated.ncols()).map(|j| rotated[(i, j)]).collect();
            sum_of_squares(&row)
        })
        .collect();
    QuadDist {
        quaddist: Array1::from_vec(quaddist).into_dyn(),
        logdet: -chol.half_logdet(),
        ok: chol.ok,
    }
}

/// Quadratic form of `value - mu` for one- or two-dimensional values.
///
/// The result has one entry per row of `value` (after broadcasting against
/// the batch dimensions of `mu`), or is a scalar for a vector value.
pub fn quaddist_parse(
    value: ArrayViewD<'_, f64>,
    mu: ArrayViewD<'_, f64>,
    mat: &Mat<f64>,
    mat_type: MatType,
) -> Result<QuadDist, DistError> {
    if value.ndim() == 0 || value.ndim() > 2 {
        return Err(DistError::Rank {
            name: "value",
            expected: "one or two".into(),
            found: value.ndim(),
        });
    }
    let k = mat.nrows();
    let (value_batch, value_event) = split_event(value.shape(), 1)?;
    let (mu_batch, mu_event) = split_event(mu.shape(), 1)?;
    if value_event != [k] || (mu_event != [k] && mu_event != [1]) {
        return Err(DistError::ShapeMismatch {
            left: value.shape().to_vec(),
            right: vec![k],
        });
    }

    let batch = broadcast_all([value_batch, mu_batch])?;
    let n: usize = batch.iter().product();
    let values = Lanes::new(&value, 1, &batch)?;
    let mus = Lanes::new(&mu, 1, &batch)?;
    let delta = Mat::from_fn(n, k, |i, j| {
        let mu = mus.lane(i);
        values.lane(i)[j] - mu[j.min(mu.len() - 1)]
    });

    let chol = cholesky(mat);
    let dist = match mat_type {
        MatType::Cov => quaddist_chol(&delta, &chol),
        MatType::Tau => quaddist_tau(&delta, &chol),
    };
    let quaddist = dist
        .quaddist
        .into_shape_with_order(IxDyn(&batch))
        .map_err(|_| DistError::ShapeMismatch {
            left: batch.clone(),
            right: vec![n],
        })?;
    Ok(QuadDist { quaddist, ..dist })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::det;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    fn cov() -> Mat<f64> {
        Mat::from_fn(2, 2, |i, j| if i == j { 2. } else { 0.5 })
    }

    #[test]
    fn exactly_one_parameterization() {
        assert!(matches!(
            quaddist_matrix(CovarianceArgs::default()),
            Err(DistError::Parameterization(_))
        ));
        assert!(matches!(
            quaddist_matrix(CovarianceArgs::default().cov(cov()).tau(cov())),
            Err(DistError::Parameterization(_))
        ));
        assert!(matches!(
            quaddist_matrix(CovarianceArgs::default().cov(cov()).sigma(cov())),
            Err(DistError::Parameterization(_))
        ));
        assert!(quaddist_matrix(CovarianceArgs::default().cov(Mat::zeros(2, 3))).is_err());
    }

    #[test]
    fn parameterizations_agree() {
        let c = cov();
        let l = cholesky(&c).factor;
        let from_chol = quaddist_matrix(CovarianceArgs::default().chol(l.clone())).unwrap();
        let from_upper =
            quaddist_matrix(CovarianceArgs::default().chol(transpose(&l)).lower(false)).unwrap();
        let tau = matrix_inverse(&c).unwrap();
        let from_tau = quaddist_matrix(CovarianceArgs::default().tau(tau)).unwrap();
        for i in 0..2 {
            for j in 0..2 {
                assert_abs_diff_eq!(from_chol[(i, j)], c[(i, j)], epsilon = 1e-12);
                assert_abs_diff_eq!(from_upper[(i, j)], c[(i, j)], epsilon = 1e-12);
                assert_abs_diff_eq!(from_tau[(i, j)], c[(i, j)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn parse_covariance_and_precision() {
        let c = cov();
        let value = array![[1., 2.], [0., 0.]].into_dyn();
        let mu = array![0., 1.].into_dyn();
        let res = quaddist_parse(value.view(), mu.view(), &c, MatType::Cov).unwrap();
        assert!(res.ok);
        assert_eq!(res.quaddist.shape(), &[2]);
        assert_abs_diff_eq!(2. * res.logdet, det(&c).ln(), epsilon = 1e-12);

        let inv = matrix_inverse(&c).unwrap();
        let d = [1., 1.];
        let expected: f64 = (0..2)
            .flat_map(|i| (0..2).map(move |j| (i, j)))
            .map(|(i, j)| d[i] * inv[(i, j)] * d[j])
            .sum();
        assert_abs_diff_eq!(res.quaddist[[0]], expected, epsilon = 1e-12);

        let res_tau = quaddist_parse(value.view(), mu.view(), &inv, MatType::Tau).unwrap();
        assert_abs_diff_eq!(res_tau.quaddist[[0]], expected, epsilon = 1e-12);
        assert_abs_diff_eq!(res_tau.logdet, res.logdet, epsilon = 1e-12);
    }

    #[test]
    fn parse_rejects_bad_rank() {
        let c = cov();
        let scalar = ArrayD::from_elem(IxDyn(&[]), 1.);
        let mu = array![0., 0.].into_dyn();
        assert!(quaddist_parse(scalar.view(), mu.view(), &c, MatType::Cov).is_err());
        let cube = ArrayD::zeros(IxDyn(&[1, 1, 2]));
        assert!(quaddist_parse(cube.view(), mu.view(), &c, MatType::Cov).is_err());
    }

    #[test]
    fn vector_value_gives_scalar() {
        let value = array![1., 1.].into_dyn();
        let mu = array![0., 0.].into_dyn();
        let res = quaddist_parse(value.view(), mu.view(), &cov(), MatType::Cov).unwrap();
        assert_eq!(res.quaddist.ndim(), 0);
    }

    #[test]
    fn failed_factorization_is_flagged() {
        let bad = Mat::from_fn(2, 2, |i, j| if i == j { 1. } else { 3. });
        let value = array![1., 1.].into_dyn();
        let mu = array![0., 0.].into_dyn();
        let res = quaddist_parse(value.view(), mu.view(), &bad, MatType::Cov).unwrap();
        assert!(!res.ok);
        assert!(res.quaddist.iter().all(|v| v.is_finite()));
    }
}
