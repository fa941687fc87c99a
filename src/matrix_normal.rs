use std::f64::consts::PI;

use faer::Mat;
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::bound::BoundSettings;
use crate::distribution::{DistError, Distribution};
use crate::linalg::{
    array_to_mat, mat_to_array, matmul, solve_lower, solve_upper, trace, transpose, try_cholesky,
};
use crate::model::VarOptions;
use crate::shape::from_flat;
use crate::univariate::scalar_array;

/// Row and column covariance arguments of `MatrixNormal`.
///
/// Exactly one of `rowcov` and `rowchol`, and exactly one of `colcov` and
/// `colchol` has to be set.
#[derive(Debug, Clone, Default)]
pub struct MatrixNormalArgs {
    pub rowcov: Option<Mat<f64>>,
    pub rowchol: Option<Mat<f64>>,
    pub colcov: Option<Mat<f64>>,
    pub colchol: Option<Mat<f64>>,
}

fn side_factor(
    side: &'static str,
    cov_name: &'static str,
    cov: Option<Mat<f64>>,
    chol: Option<Mat<f64>>,
) -> Result<Mat<f64>, DistError> {
    let factor = match (cov, chol) {
        (Some(cov), None) => {
            try_cholesky(&cov).map_err(|_| DistError::NotPositiveDefinite(cov_name))?
        }
        (None, Some(chol)) => chol,
        _ => {
            return Err(DistError::Parameterization(format!(
                "Specify exactly one of {side}cov, or {side}chol."
            )))
        }
    };
    if factor.nrows() != factor.ncols() {
        return Err(DistError::InvalidParameter {
            name: cov_name,
            reason: format!("must be square, got {}x{}", factor.nrows(), factor.ncols()),
        });
    }
    Ok(factor)
}

/// Matrix valued normal distribution with covariance `kron(rowcov, colcov)`
/// over the row-major flattened value.
#[derive(Debug, Clone)]
pub struct MatrixNormal {
    mu: Mat<f64>,
    rowchol: Mat<f64>,
    colchol: Mat<f64>,
}

impl MatrixNormal {
    /// `mu` has to broadcast against `(m, n)`, the dimensions of the row and
    /// column covariances.
    pub fn new(mu: ArrayD<f64>, args: MatrixNormalArgs) -> Result<Self, DistError> {
        let rowchol = side_factor("row", "rowcov", args.rowcov, args.rowchol)?;
        let colchol = side_factor("col", "colcov", args.colcov, args.colchol)?;
        let shape = [rowchol.nrows(), colchol.nrows()];
        let mu_view = mu
            .broadcast(IxDyn(&shape))
            .ok_or_else(|| DistError::ShapeMismatch {
                left: mu.shape().to_vec(),
                right: shape.to_vec(),
            })?;
        let mu = array_to_mat(&mu_view)?;
        Ok(Self {
            mu,
            rowchol,
            colchol,
        })
    }

    pub fn mu(&self) -> &Mat<f64> {
        &self.mu
    }

    pub fn rowchol(&self) -> &Mat<f64> {
        &self.rowchol
    }

    pub fn colchol(&self) -> &Mat<f64> {
        &self.colchol
    }
}

impl Distribution for MatrixNormal {
    fn name(&self) -> &'static str {
        "MatrixNormal"
    }

    fn ndim_supp(&self) -> usize {
        2
    }

    fn shape(&self) -> Vec<usize> {
        vec![self.mu.nrows(), self.mu.ncols()]
    }

    fn logp(
        &self,
        value: ArrayViewD<'_, f64>,
        _settings: BoundSettings,
    ) -> Result<ArrayD<f64>, DistError> {
        if value.ndim() != 2 {
            return Err(DistError::Rank {
                name: "value",
                expected: "2".into(),
                found: value.ndim(),
            });
        }
        let x = array_to_mat(&value)?;
        let (m, n) = (self.mu.nrows(), self.mu.ncols());
        if x.nrows() != m || x.ncols() != n {
            return Err(DistError::ShapeMismatch {
                left: value.shape().to_vec(),
                right: self.shape(),
            });
        }
        let delta = Mat::from_fn(m, n, |i, j| x[(i, j)] - self.mu[(i, j)]);

        let right = solve_lower(&self.rowchol, &delta);
        let quad = matmul(&transpose(&right), &right);
        let quad = solve_lower(&self.colchol, &quad);
        let quad = solve_upper(&transpose(&self.colchol), &quad);
        let trquaddist = trace(&quad);

        let half_collogdet: f64 = (0..n).map(|i| self.colchol[(i, i)].ln()).sum();
        let half_rowlogdet: f64 = (0..m).map(|i| self.rowchol[(i, i)].ln()).sum();
        let (mf, nf) = (m as f64, n as f64);
        let norm = -0.5 * mf * nf * (2. * PI).ln();
        Ok(scalar_array(
            norm - 0.5 * trquaddist - mf * half_collogdet - nf * half_rowlogdet,
        ))
    }

    fn random<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        size: &[usize],
    ) -> Result<ArrayD<f64>, DistError> {
        let (m, n) = (self.mu.nrows(), self.mu.ncols());
        let colchol_t = transpose(&self.colchol);
        let draws: usize = size.iter().product();
        let mut out = Vec::with_capacity(draws * m * n);
        for _ in 0..draws {
            let z: Mat<f64> = Mat::from_fn(m, n, |_, _| rng.sample(StandardNormal));
            let x = matmul(&self.rowchol, &matmul(&z, &colchol_t));
            for i in 0..m {
                out.extend((0..n).map(|j| self.mu[(i, j)] + x[(i, j)]));
            }
        }
        let mut shape = size.to_vec();
        shape.extend([m, n]);
        from_flat(&shape, out)
    }

    fn initial_value(&self) -> ArrayD<f64> {
        mat_to_array(&self.mu)
    }

    fn validate_options(&self, options: &mut VarOptions) -> Result<(), DistError> {
        if options.size.is_some() {
            return Err(DistError::Unsupported(
                "MatrixNormal doesn't support size argument".into(),
            ));
        }
        if options.shape.take().is_some() {
            log::warn!(
                "The shape argument in MatrixNormal is deprecated and will be ignored. \
                 MatrixNormal automatically derives the shape from row and column matrix \
                 dimensions."
            );
        }
        Ok(())
    }
}
