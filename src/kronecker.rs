use std::f64::consts::PI;

use faer::Mat;
use ndarray::{Array1, ArrayD, ArrayViewD};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::bound::{bound, BoundSettings, Condition};
use crate::distribution::{DistError, Distribution};
use crate::linalg::{matmul, symmetric_eigen, transpose};
use crate::math::{kron_diag, kron_dot, sum_of_squares};
use crate::shape::{flat_values, from_flat};

/// Factor matrices of a Kronecker structured covariance.
///
/// Exactly one of `covs`, `chols` and `evds` has to be set. Eigen
/// decompositions are given as `(eigenvalues, eigenvectors)` pairs with the
/// eigenvectors in the columns.
#[derive(Debug, Clone, Default)]
pub struct KroneckerArgs {
    pub covs: Option<Vec<Mat<f64>>>,
    pub chols: Option<Vec<Mat<f64>>>,
    pub evds: Option<Vec<(Vec<f64>, Mat<f64>)>>,
    /// Standard deviation of white noise added to the diagonal.
    pub sigma: Option<f64>,
}

/// Multivariate normal with covariance `kron(K_1, ..., K_k) + sigma² I`.
///
/// Densities are evaluated in the eigenbasis of the factors, the full
/// covariance is never formed.
#[derive(Debug, Clone)]
pub struct KroneckerNormal {
    mu: Vec<f64>,
    sigma: f64,
    eigvecs: Vec<Mat<f64>>,
    eigvecs_t: Vec<Mat<f64>>,
    eigs: Vec<f64>,
}

impl KroneckerNormal {
    /// `mu` is either a scalar or a vector with one entry per element of the
    /// Kronecker product.
    pub fn new(mu: ArrayD<f64>, args: KroneckerArgs) -> Result<Self, DistError> {
        let covs = match (args.covs, args.chols, args.evds) {
            (Some(covs), None, None) => covs,
            (None, Some(chols), None) => chols
                .iter()
                .map(|chol| matmul(chol, &transpose(chol)))
                .collect(),
            (None, None, Some(evds)) => evds
                .iter()
                .map(|(eig, q)| {
                    if q.nrows() != q.ncols() || eig.len() != q.ncols() {
                        return Err(DistError::ShapeMismatch {
                            left: vec![eig.len()],
                            right: vec![q.nrows(), q.ncols()],
                        });
                    }
                    let scaled = Mat::from_fn(q.nrows(), q.ncols(), |i, j| q[(i, j)] * eig[j]);
                    Ok(matmul(&scaled, &transpose(q)))
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => {
                return Err(DistError::Parameterization(
                    "Specify exactly one of covs, chols, or evds.".into(),
                ))
            }
        };
        if covs.is_empty() {
            return Err(DistError::InvalidParameter {
                name: "covs",
                reason: "needs at least one factor".into(),
            });
        }
        for cov in covs.iter() {
            if cov.nrows() != cov.ncols() {
                return Err(DistError::InvalidParameter {
                    name: "covs",
                    reason: format!("must be square, got {}x{}", cov.nrows(), cov.ncols()),
                });
            }
        }

        let sigma = args.sigma.unwrap_or(0.);
        let (eig_sep, eigvecs): (Vec<Vec<f64>>, Vec<Mat<f64>>) = covs
            .iter()
            .map(symmetric_eigen)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .unzip();
        let eig_refs: Vec<&[f64]> = eig_sep.iter().map(Vec::as_slice).collect();
        let eigs: Vec<f64> = kron_diag(&eig_refs)
            .into_iter()
            .map(|e| e + sigma * sigma)
            .collect();
        let eigvecs_t = eigvecs.iter().map(transpose).collect();

        let n = eigs.len();
        let mu = match mu.ndim() {
            0 => vec![flat_values(&mu.view())[0]; n],
            1 if mu.len() == n => flat_values(&mu.view()),
            1 if mu.len() == 1 => vec![flat_values(&mu.view())[0]; n],
            _ => {
                return Err(DistError::ShapeMismatch {
                    left: mu.shape().to_vec(),
                    right: vec![n],
                })
            }
        };

        Ok(Self {
            mu,
            sigma,
            eigvecs,
            eigvecs_t,
            eigs,
        })
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Eigenvalues of the full covariance, noise included.
    pub fn eigs(&self) -> &[f64] {
        &self.eigs
    }

    fn dim(&self) -> usize {
        self.eigs.len()
    }

    fn row_logp(&self, x: &[f64], logdet: f64) -> f64 {
        let delta: Vec<f64> = x.iter().zip(self.mu.iter()).map(|(x, m)| x - m).collect();
        let qts: Vec<&Mat<f64>> = self.eigvecs_t.iter().collect();
        let sqrt_quad: Vec<f64> = kron_dot(&qts, &delta)
            .iter()
            .zip(self.eigs.iter())
            .map(|(v, e)| v / e.sqrt())
            .collect();
        let quad = sum_of_squares(&sqrt_quad);
        -(quad + logdet + self.dim() as f64 * (2. * PI).ln()) / 2.
    }
}

impl Distribution for KroneckerNormal {
    fn name(&self) -> &'static str {
        "KroneckerNormal"
    }

    fn ndim_supp(&self) -> usize {
        1
    }

    fn shape(&self) -> Vec<usize> {
        vec![self.dim()]
    }

    fn logp(
        &self,
        value: ArrayViewD<'_, f64>,
        settings: BoundSettings,
    ) -> Result<ArrayD<f64>, DistError> {
        let n = self.dim();
        if value.ndim() == 0 || value.ndim() > 2 {
            return Err(DistError::Rank {
                name: "value",
                expected: "1 or 2".into(),
                found: value.ndim(),
            });
        }
        if value.shape()[value.ndim() - 1] != n {
            return Err(DistError::ShapeMismatch {
                left: value.shape().to_vec(),
                right: vec![n],
            });
        }
        let logdet: f64 = self.eigs.iter().map(|e| e.ln()).sum();
        let values = flat_values(&value);
        let out = values
            .chunks_exact(n)
            .map(|row| self.row_logp(row, logdet))
            .collect();
        let logp = from_flat(&value.shape()[..value.ndim() - 1], out)?;
        let conditions = [Condition::Scalar(self.eigs.iter().all(|&e| e > 0.))];
        bound(logp, &conditions, false, settings)
    }

    fn random<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        size: &[usize],
    ) -> Result<ArrayD<f64>, DistError> {
        if self.eigs.iter().any(|&e| e < 0.) {
            return Err(DistError::NotPositiveDefinite("covs"));
        }
        let n = self.dim();
        let qs: Vec<&Mat<f64>> = self.eigvecs.iter().collect();
        let draws: usize = size.iter().product();
        let mut out = Vec::with_capacity(draws * n);
        for _ in 0..draws {
            let scaled: Vec<f64> = self
                .eigs
                .iter()
                .map(|e| e.sqrt() * rng.sample::<f64, _>(StandardNormal))
                .collect();
            let x = kron_dot(&qs, &scaled);
            out.extend(x.iter().zip(self.mu.iter()).map(|(x, m)| x + m));
        }
        let mut shape = size.to_vec();
        shape.push(n);
        from_flat(&shape, out)
    }

    fn initial_value(&self) -> ArrayD<f64> {
        Array1::from_vec(self.mu.clone()).into_dyn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::try_cholesky;
    use crate::mvnormal::MvNormal;
    use crate::quaddist::CovarianceArgs;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;

    fn k1() -> Mat<f64> {
        Mat::from_fn(2, 2, |i, j| match (i, j) {
            (0, 0) => 1.,
            (1, 1) => 2.,
            _ => 0.5,
        })
    }

    fn k2() -> Mat<f64> {
        Mat::from_fn(3, 3, |i, j| match (i, j) {
            (0, 0) | (2, 2) => 1.,
            (1, 1) => 2.,
            (0, 1) | (1, 0) => 0.4,
            (0, 2) | (2, 0) => 0.2,
            _ => 0.3,
        })
    }

    fn dense(sigma: f64) -> Mat<f64> {
        let (a, b) = (k1(), k2());
        Mat::from_fn(6, 6, |i, j| {
            let noise = if i == j { sigma * sigma } else { 0. };
            a[(i / 3, j / 3)] * b[(i % 3, j % 3)] + noise
        })
    }

    #[test]
    fn matches_dense_mvnormal() {
        let mu = array![0.1, -0.2, 0.3, 0., 1., -1.].into_dyn();
        let value = array![[0.5, 0.1, -0.3, 1.2, 0.7, -0.4], [0., 0., 0., 0., 0., 0.]].into_dyn();
        let settings = BoundSettings::default();
        for sigma in [0., 0.3] {
            let expected = MvNormal::new(mu.clone(), CovarianceArgs::default().cov(dense(sigma)))
                .unwrap()
                .logp(value.view(), settings)
                .unwrap();
            let parameterizations = [
                KroneckerArgs {
                    covs: Some(vec![k1(), k2()]),
                    sigma: Some(sigma),
                    ..Default::default()
                },
                KroneckerArgs {
                    chols: Some(vec![try_cholesky(&k1()).unwrap(), try_cholesky(&k2()).unwrap()]),
                    sigma: Some(sigma),
                    ..Default::default()
                },
                KroneckerArgs {
                    evds: Some(vec![
                        symmetric_eigen(&k1()).unwrap(),
                        symmetric_eigen(&k2()).unwrap(),
                    ]),
                    sigma: Some(sigma),
                    ..Default::default()
                },
            ];
            for args in parameterizations {
                let dist = KroneckerNormal::new(mu.clone(), args).unwrap();
                let logp = dist.logp(value.view(), settings).unwrap();
                assert_eq!(logp.shape(), &[2]);
                for (a, b) in logp.iter().zip(expected.iter()) {
                    assert_abs_diff_eq!(a, b, epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn parameterization_is_checked() {
        let args = KroneckerArgs {
            covs: Some(vec![k1()]),
            chols: Some(vec![k1()]),
            ..Default::default()
        };
        assert!(matches!(
            KroneckerNormal::new(array![0.].into_dyn(), args),
            Err(DistError::Parameterization(_))
        ));
        let dist = KroneckerNormal::new(
            array![0.].into_dyn(),
            KroneckerArgs {
                covs: Some(vec![k1()]),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(dist.shape(), vec![2]);
        let cube = ndarray::ArrayD::<f64>::zeros(ndarray::IxDyn(&[1, 1, 2]));
        assert!(dist.logp(cube.view(), BoundSettings::default()).is_err());
    }

    #[test]
    fn mismatched_eigen_decomposition_is_rejected() {
        let args = KroneckerArgs {
            evds: Some(vec![(vec![1., 2.], Mat::identity(3, 3))]),
            ..Default::default()
        };
        let err = KroneckerNormal::new(array![0.].into_dyn(), args).unwrap_err();
        assert!(matches!(
            err,
            DistError::ShapeMismatch { ref left, ref right } if left == &[2] && right == &[3, 3]
        ));
    }

    #[test]
    fn random_draws_have_kronecker_covariance() {
        let dist = KroneckerNormal::new(
            array![0.].into_dyn(),
            KroneckerArgs {
                covs: Some(vec![k1(), k2()]),
                ..Default::default()
            },
        )
        .unwrap();
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(11);
        let n_draws = 4000;
        let draws = dist.random(&mut rng, &[n_draws]).unwrap();
        let cov = dense(0.);
        for (i, j) in [(0, 0), (4, 4), (0, 3), (1, 2)] {
            let emp = draws
                .outer_iter()
                .map(|d| d[[i]] * d[[j]])
                .sum::<f64>()
                / n_draws as f64;
            assert_abs_diff_eq!(emp, cov[(i, j)], epsilon = 0.25);
        }
    }
}
