//! LKJ priors over correlation matrices and Cholesky factored covariances.

use std::f64::consts::{LN_2, PI};

use faer::Mat;
use ndarray::{Array1, ArrayD, ArrayViewD};
use rand::Rng;
use rand_distr::{Beta, Distribution as _, StandardNormal};
use statrs::function::gamma::ln_gamma;

use crate::blocking::Point;
use crate::bound::{bound, BoundSettings, Condition};
use crate::distribution::{sampling_error, DistError, Distribution};
use crate::linalg::{det, mat_to_array, matmul, matrix_pos_def, transpose};
use crate::model::{Model, ModelError, TransformChoice, ValueVar, VarOptions};
use crate::shape::{flat_values, from_flat, split_event};
use crate::transforms::{
    expand_packed_triangular, pack_lower_triangular, packed_diag_indices, packed_len, Transform,
};
use crate::univariate::{scalar_array, Univariate};

/// Log of the integral of `det(C)^(eta - 1)` over `n x n` correlation matrices.
pub fn lkj_log_normalizer(eta: f64, n: usize) -> f64 {
    if eta == 1. {
        uniform_log_normalizer(n)
    } else {
        general_log_normalizer(eta, n)
    }
}

fn uniform_log_normalizer(n: usize) -> f64 {
    let nf = n as f64;
    let mut result: f64 = (1..=(n.saturating_sub(1) / 2))
        .map(|k| ln_gamma(2. * k as f64))
        .sum();
    if n % 2 == 1 {
        result += 0.25 * (nf * nf - 1.) * PI.ln()
            - 0.25 * (nf - 1.).powi(2) * LN_2
            - (nf - 1.) * ln_gamma(((n + 1) / 2) as f64);
    } else {
        result += 0.25 * nf * (nf - 2.) * PI.ln()
            + 0.25 * (3. * nf * nf - 4. * nf) * LN_2
            + nf * ln_gamma(nf / 2.)
            - (nf - 1.) * ln_gamma(nf);
    }
    result
}

fn general_log_normalizer(eta: f64, n: usize) -> f64 {
    let nf = n as f64;
    let tail: f64 = (1..n)
        .map(|k| {
            let k = k as f64;
            0.5 * k * PI.ln() + ln_gamma(eta + 0.5 * (nf - 1. - k))
        })
        .sum();
    tail - (nf - 1.) * ln_gamma(eta + 0.5 * (nf - 1.))
}

/// Upper triangular `P` with unit length columns such that `Pᵀ P` is an LKJ
/// distributed correlation matrix (onion method).
fn onion_factor<R: Rng + ?Sized>(rng: &mut R, n: usize, eta: f64) -> Result<Mat<f64>, DistError> {
    let mut p = Mat::<f64>::identity(n, n);
    if n < 2 {
        return Ok(p);
    }
    let mut beta = eta - 1. + n as f64 / 2.;
    let r12 = 2. * Beta::new(beta, beta).map_err(sampling_error)?.sample(rng) - 1.;
    p[(0, 1)] = r12;
    p[(1, 1)] = (1. - r12 * r12).sqrt();
    for m in 2..n {
        beta -= 0.5;
        let y = Beta::new(m as f64 / 2., beta)
            .map_err(sampling_error)?
            .sample(rng);
        let z: Vec<f64> = (0..m).map(|_| rng.sample(StandardNormal)).collect();
        let norm = z.iter().map(|v| v * v).sum::<f64>().sqrt();
        for (i, zi) in z.iter().enumerate() {
            p[(i, m)] = y.sqrt() * zi / norm;
        }
        p[(m, m)] = (1. - y).sqrt();
    }
    Ok(p)
}

fn check_eta(eta: f64) -> Result<(), DistError> {
    if !(eta > 0.) {
        return Err(DistError::InvalidParameter {
            name: "eta",
            reason: format!("must be positive, got {eta}"),
        });
    }
    Ok(())
}

/// Packed lower Cholesky factor of a covariance matrix whose correlations
/// follow an LKJ law and whose standard deviations follow `sd_dist`.
///
/// Values are vectors of length `n (n + 1) / 2` holding the lower triangle
/// row by row, so the diagonal sits at positions `0, 2, 5, ...`.
#[derive(Debug, Clone)]
pub struct LkjCholeskyCov {
    eta: f64,
    n: usize,
    sd_dist: Vec<Univariate>,
}

impl LkjCholeskyCov {
    /// `sd_dist` holds either one law shared by all standard deviations, or one
    /// law per dimension.
    pub fn new(eta: f64, n: usize, sd_dist: Vec<Univariate>) -> Result<Self, DistError> {
        check_eta(eta)?;
        if n == 0 {
            return Err(DistError::InvalidParameter {
                name: "n",
                reason: "must be at least 1".into(),
            });
        }
        if sd_dist.len() != 1 && sd_dist.len() != n {
            return Err(DistError::InvalidParameter {
                name: "sd_dist",
                reason: format!(
                    "Invalid shape for sd_dist. Expected 1 or {n} elements, got {}",
                    sd_dist.len()
                ),
            });
        }
        Ok(Self { eta, n, sd_dist })
    }

    pub fn eta(&self) -> f64 {
        self.eta
    }

    pub fn n(&self) -> usize {
        self.n
    }

    fn sd_law(&self, i: usize) -> &Univariate {
        if self.sd_dist.len() == 1 {
            &self.sd_dist[0]
        } else {
            &self.sd_dist[i]
        }
    }

    fn lane_logp(&self, x: &[f64]) -> f64 {
        let n = self.n;
        let nf = n as f64;
        let diag = packed_diag_indices(n);

        let mut cumsum = Vec::with_capacity(x.len());
        let mut acc = 0.;
        for v in x {
            acc += v * v;
            cumsum.push(acc);
        }
        let sd: Vec<f64> = (0..n)
            .map(|i| {
                let variance = if i == 0 {
                    x[0] * x[0]
                } else {
                    cumsum[diag[i]] - cumsum[diag[i - 1]]
                };
                variance.sqrt()
            })
            .collect();

        let logp_sd: f64 = sd
            .iter()
            .enumerate()
            .map(|(i, &s)| self.sd_law(i).logp(s))
            .sum();

        let mut logp_lkj = 0.;
        let mut jac = 0.;
        for i in 0..n {
            let log_corr_diag = (x[diag[i]] / sd[i]).ln();
            logp_lkj += (2. * self.eta - 3. + nf - i as f64) * log_corr_diag;
            jac += log_corr_diag - i as f64 * sd[i].ln();
        }

        -lkj_log_normalizer(self.eta, n) + logp_lkj + logp_sd + jac
    }
}

/// Splits a packed Cholesky factor into the factor, the correlation matrix
/// and the standard deviations of the covariance it represents.
pub fn decompose(n: usize, packed: &[f64]) -> Result<(Mat<f64>, Mat<f64>, Vec<f64>), DistError> {
    let chol = expand_packed_triangular(n, packed, true)?;
    let cov = matmul(&chol, &transpose(&chol));
    let stds: Vec<f64> = (0..n).map(|i| cov[(i, i)].sqrt()).collect();
    let corr = Mat::from_fn(n, n, |i, j| cov[(i, j)] / (stds[i] * stds[j]));
    Ok((chol, corr, stds))
}

impl Distribution for LkjCholeskyCov {
    fn name(&self) -> &'static str {
        "LKJCholeskyCov"
    }

    fn ndim_supp(&self) -> usize {
        1
    }

    fn shape(&self) -> Vec<usize> {
        vec![packed_len(self.n)]
    }

    fn logp(
        &self,
        value: ArrayViewD<'_, f64>,
        _settings: BoundSettings,
    ) -> Result<ArrayD<f64>, DistError> {
        let len = packed_len(self.n);
        let (batch, event) = split_event(value.shape(), 1)?;
        if event != [len] {
            return Err(DistError::ShapeMismatch {
                left: value.shape().to_vec(),
                right: vec![len],
            });
        }
        let values = flat_values(&value);
        let out = values
            .chunks_exact(len)
            .map(|lane| self.lane_logp(lane))
            .collect();
        from_flat(batch, out)
    }

    fn random<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        size: &[usize],
    ) -> Result<ArrayD<f64>, DistError> {
        let n = self.n;
        let draws: usize = size.iter().product();
        let mut out = Vec::with_capacity(draws * packed_len(n));
        for _ in 0..draws {
            let corr_chol = transpose(&onion_factor(rng, n, self.eta)?);
            let sd = (0..n)
                .map(|i| self.sd_law(i).random(rng))
                .collect::<Result<Vec<_>, _>>()?;
            let chol = Mat::from_fn(n, n, |i, j| sd[i] * corr_chol[(i, j)]);
            out.extend(pack_lower_triangular(&chol));
        }
        let mut shape = size.to_vec();
        shape.push(packed_len(n));
        from_flat(&shape, out)
    }

    fn initial_value(&self) -> ArrayD<f64> {
        let mut init = Array1::<f64>::zeros(packed_len(self.n));
        for d in packed_diag_indices(self.n) {
            init[d] = 1.;
        }
        init.into_dyn()
    }

    fn default_transform(&self) -> Option<Transform> {
        Some(Transform::CholeskyCovPacked { n: self.n })
    }

    fn validate_options(&self, options: &mut VarOptions) -> Result<(), DistError> {
        match options.transform {
            TransformChoice::Custom(_) => {
                return Err(DistError::InvalidParameter {
                    name: "transform",
                    reason: "Invalid parameter: transform.".into(),
                })
            }
            TransformChoice::Disabled => options.transform = TransformChoice::Default,
            TransformChoice::Default => {}
        }
        if options.shape.is_some() {
            return Err(DistError::InvalidParameter {
                name: "shape",
                reason: "Invalid parameter: shape.".into(),
            });
        }
        if options.size.as_ref().is_some_and(|size| !size.is_empty()) {
            return Err(DistError::Unsupported(
                "LKJCholeskyCov does not support a size argument".into(),
            ));
        }
        Ok(())
    }
}

/// Adds a packed LKJ Cholesky covariance factor named `name` to the model.
///
/// With `compute_corr` and `store_in_trace` the correlation matrix and the
/// standard deviations are tracked as `{name}_corr` and `{name}_stds`.
pub fn lkj_cholesky_cov(
    model: &mut Model,
    name: &str,
    eta: f64,
    n: usize,
    sd_dist: Vec<Univariate>,
    compute_corr: bool,
    store_in_trace: bool,
) -> Result<ValueVar, ModelError> {
    let dist = LkjCholeskyCov::new(eta, n, sd_dist)?;
    let var = model.add_free(name, dist, VarOptions::default())?;
    if compute_corr && store_in_trace {
        let packed_name = name.to_string();
        model.add_deterministic(&format!("{name}_corr"), move |point| {
            let packed = lookup(point, &packed_name)?;
            Ok(mat_to_array(&decompose(n, &packed)?.1))
        })?;
        let packed_name = name.to_string();
        model.add_deterministic(&format!("{name}_stds"), move |point| {
            let packed = lookup(point, &packed_name)?;
            Ok(Array1::from_vec(decompose(n, &packed)?.2).into_dyn())
        })?;
    }
    Ok(var)
}

fn lookup(point: &Point, name: &str) -> Result<Vec<f64>, DistError> {
    point
        .get(name)
        .map(|value| value.iter().copied().collect())
        .ok_or_else(|| DistError::Unsupported(format!("missing variable {name}")))
}

/// Arguments of `LkjCorr`.
///
/// Older code passed the shape parameter as `n` and the dimension as `p`.
/// That combination is still accepted with a warning.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LkjCorrArgs {
    pub eta: Option<f64>,
    pub n: Option<f64>,
    pub p: Option<usize>,
}

/// LKJ law over correlation matrices, parameterized by the strictly upper
/// triangular entries in row-major order.
#[derive(Debug, Clone)]
pub struct LkjCorr {
    eta: f64,
    n: usize,
}

impl LkjCorr {
    pub fn new(args: LkjCorrArgs) -> Result<Self, DistError> {
        let invalid = || DistError::InvalidParameter {
            name: "eta",
            reason: "please use eta as the shape parameter and n as the dimension parameter."
                .into(),
        };
        let (eta, n) = match args {
            LkjCorrArgs {
                eta: None,
                n: Some(eta),
                p: Some(p),
            } => {
                log::warn!(
                    "Parameters to LKJCorr have changed: shape parameter n -> eta dimension \
                     parameter p -> n. Please update your code. Automatically re-assigning \
                     parameters for backwards compatibility."
                );
                (eta, p)
            }
            LkjCorrArgs {
                eta: Some(eta),
                n: Some(n),
                p: None,
            } if n >= 1. && n.fract() == 0. => (eta, n as usize),
            _ => return Err(invalid()),
        };
        check_eta(eta)?;
        Ok(Self { eta, n })
    }

    pub fn eta(&self) -> f64 {
        self.eta
    }

    pub fn n(&self) -> usize {
        self.n
    }

    fn len(&self) -> usize {
        self.n * self.n.saturating_sub(1) / 2
    }

    /// Unit diagonal symmetric matrix with the packed upper triangle mirrored.
    fn corr_matrix(&self, upper: &[f64]) -> Mat<f64> {
        let n = self.n;
        let mut x = Mat::<f64>::identity(n, n);
        let mut idx = 0;
        for i in 0..n {
            for j in (i + 1)..n {
                x[(i, j)] = upper[idx];
                x[(j, i)] = upper[idx];
                idx += 1;
            }
        }
        x
    }
}

impl Distribution for LkjCorr {
    fn name(&self) -> &'static str {
        "LKJCorr"
    }

    fn ndim_supp(&self) -> usize {
        1
    }

    fn shape(&self) -> Vec<usize> {
        vec![self.len()]
    }

    fn logp(
        &self,
        value: ArrayViewD<'_, f64>,
        settings: BoundSettings,
    ) -> Result<ArrayD<f64>, DistError> {
        let len = self.len();
        let (batch, event) = split_event(value.shape(), 1)?;
        if event != [len] {
            return Err(DistError::ShapeMismatch {
                left: value.shape().to_vec(),
                right: vec![len],
            });
        }
        let norm = lkj_log_normalizer(self.eta, self.n);
        let values = flat_values(&value);
        let mut out = Vec::with_capacity(values.len() / len.max(1));
        let lanes: Vec<&[f64]> = if len == 0 {
            vec![&values[..0]; batch.iter().product()]
        } else {
            values.chunks_exact(len).collect()
        };
        for lane in lanes {
            let x = self.corr_matrix(lane);
            let logp = -norm + (self.eta - 1.) * det(&x).ln();
            let conditions = [
                Condition::Scalar(lane.iter().all(|&v| v >= -1.)),
                Condition::Scalar(lane.iter().all(|&v| v <= 1.)),
                Condition::Scalar(matrix_pos_def(&x)),
                Condition::Scalar(self.eta > 0.),
            ];
            let bounded = bound(
                scalar_array(logp),
                &conditions,
                false,
                settings,
            )?;
            out.push(bounded.sum());
        }
        from_flat(batch, out)
    }

    fn random<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        size: &[usize],
    ) -> Result<ArrayD<f64>, DistError> {
        let n = self.n;
        let draws: usize = size.iter().product();
        let mut out = Vec::with_capacity(draws * self.len());
        for _ in 0..draws {
            let p = onion_factor(rng, n, self.eta)?;
            let c = matmul(&transpose(&p), &p);
            for i in 0..n {
                out.extend(((i + 1)..n).map(|j| c[(i, j)]));
            }
        }
        let mut shape = size.to_vec();
        shape.push(self.len());
        from_flat(&shape, out)
    }

    fn initial_value(&self) -> ArrayD<f64> {
        Array1::<f64>::zeros(self.len()).into_dyn()
    }

    fn default_transform(&self) -> Option<Transform> {
        Some(Transform::Interval {
            lower: -1.,
            upper: 1.,
        })
    }
}
