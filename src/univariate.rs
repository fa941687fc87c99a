//! Scalar laws that appear as building blocks of the multivariate
//! distributions: standard deviation priors and Bartlett auxiliaries.

use std::f64::consts::{LN_2, PI};

use ndarray::{Array1, ArrayD, ArrayViewD, IxDyn};
use rand::Rng;
use rand_distr::{Cauchy, ChiSquared, Distribution as _, Exp, Normal};
use statrs::function::erf::{erf, erfc};
use statrs::function::gamma::{gamma_lr, ln_gamma};

use crate::bound::BoundSettings;
use crate::distribution::{sampling_error, DistError, Distribution};
use crate::shape::{flat_values, from_flat, split_event};
use crate::transforms::Transform;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Univariate {
    Normal { mu: f64, sigma: f64 },
    HalfNormal { sigma: f64 },
    HalfCauchy { beta: f64 },
    Exponential { lam: f64 },
    ChiSquared { nu: f64 },
}

impl Univariate {
    pub fn logp(&self, x: f64) -> f64 {
        match *self {
            Univariate::Normal { mu, sigma } => {
                if !(sigma > 0.) {
                    return f64::NEG_INFINITY;
                }
                let z = (x - mu) / sigma;
                -0.5 * z * z - sigma.ln() - LN_SQRT_2PI
            }
            Univariate::HalfNormal { sigma } => {
                if x < 0. || !(sigma > 0.) {
                    return f64::NEG_INFINITY;
                }
                let z = x / sigma;
                LN_2 - 0.5 * z * z - sigma.ln() - LN_SQRT_2PI
            }
            Univariate::HalfCauchy { beta } => {
                if x < 0. || !(beta > 0.) {
                    return f64::NEG_INFINITY;
                }
                LN_2 - PI.ln() - beta.ln() - (x / beta).powi(2).ln_1p()
            }
            Univariate::Exponential { lam } => {
                if x < 0. || !(lam > 0.) {
                    return f64::NEG_INFINITY;
                }
                lam.ln() - lam * x
            }
            Univariate::ChiSquared { nu } => {
                if x < 0. || !(nu > 0.) {
                    return f64::NEG_INFINITY;
                }
                let half = 0.5 * nu;
                (half - 1.) * x.ln() - 0.5 * x - half * LN_2 - ln_gamma(half)
            }
        }
    }

    pub fn logcdf(&self, x: f64) -> f64 {
        match *self {
            Univariate::Normal { mu, sigma } => {
                (0.5 * erfc(-(x - mu) / (sigma * std::f64::consts::SQRT_2))).ln()
            }
            Univariate::HalfNormal { sigma } => {
                if x < 0. {
                    return f64::NEG_INFINITY;
                }
                erf(x / (sigma * std::f64::consts::SQRT_2)).ln()
            }
            Univariate::HalfCauchy { beta } => {
                if x < 0. {
                    return f64::NEG_INFINITY;
                }
                (2. / PI * (x / beta).atan()).ln()
            }
            Univariate::Exponential { lam } => {
                if x < 0. {
                    return f64::NEG_INFINITY;
                }
                (-(-lam * x).exp_m1()).ln()
            }
            Univariate::ChiSquared { nu } => {
                if x <= 0. {
                    return f64::NEG_INFINITY;
                }
                if x.is_infinite() {
                    return 0.;
                }
                gamma_lr(0.5 * nu, 0.5 * x).ln()
            }
        }
    }

    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<f64, DistError> {
        Ok(match *self {
            Univariate::Normal { mu, sigma } => {
                Normal::new(mu, sigma).map_err(sampling_error)?.sample(rng)
            }
            Univariate::HalfNormal { sigma } => Normal::new(0., sigma)
                .map_err(sampling_error)?
                .sample(rng)
                .abs(),
            Univariate::HalfCauchy { beta } => Cauchy::new(0., beta)
                .map_err(sampling_error)?
                .sample(rng)
                .abs(),
            Univariate::Exponential { lam } => Exp::new(lam).map_err(sampling_error)?.sample(rng),
            Univariate::ChiSquared { nu } => {
                ChiSquared::new(nu).map_err(sampling_error)?.sample(rng)
            }
        })
    }

    /// Whether the support is the positive half line.
    pub fn is_positive(&self) -> bool {
        !matches!(self, Univariate::Normal { .. })
    }

    pub fn initial_value(&self) -> f64 {
        match *self {
            Univariate::Normal { mu, .. } => mu,
            Univariate::HalfNormal { sigma } => sigma,
            Univariate::HalfCauchy { beta } => beta,
            Univariate::Exponential { lam } => lam.recip(),
            Univariate::ChiSquared { nu } => nu,
        }
    }
}

/// A vector of independent scalar laws, one per element.
#[derive(Debug, Clone, PartialEq)]
pub struct Independent {
    dists: Vec<Univariate>,
}

impl Independent {
    pub fn new(dists: Vec<Univariate>) -> Result<Self, DistError> {
        if dists.is_empty() {
            return Err(DistError::InvalidParameter {
                name: "dists",
                reason: "needs at least one element".into(),
            });
        }
        Ok(Self { dists })
    }

    pub fn iid(dist: Univariate, n: usize) -> Result<Self, DistError> {
        Self::new(vec![dist; n])
    }

    pub fn dists(&self) -> &[Univariate] {
        &self.dists
    }

    fn reduce_lanes(
        &self,
        value: ArrayViewD<'_, f64>,
        f: impl Fn(&Univariate, f64) -> f64,
    ) -> Result<ArrayD<f64>, DistError> {
        let n = self.dists.len();
        let (batch, event) = split_event(value.shape(), 1)?;
        if event != [n] {
            return Err(DistError::ShapeMismatch {
                left: value.shape().to_vec(),
                right: vec![n],
            });
        }
        let values = flat_values(&value);
        let out = values
            .chunks_exact(n)
            .map(|lane| self.dists.iter().zip(lane).map(|(d, &x)| f(d, x)).sum())
            .collect();
        from_flat(batch, out)
    }
}

impl Distribution for Independent {
    fn name(&self) -> &'static str {
        "Independent"
    }

    fn ndim_supp(&self) -> usize {
        1
    }

    fn shape(&self) -> Vec<usize> {
        vec![self.dists.len()]
    }

    fn logp(
        &self,
        value: ArrayViewD<'_, f64>,
        _settings: BoundSettings,
    ) -> Result<ArrayD<f64>, DistError> {
        self.reduce_lanes(value, |d, x| d.logp(x))
    }

    fn logcdf(
        &self,
        value: ArrayViewD<'_, f64>,
        _settings: BoundSettings,
    ) -> Result<ArrayD<f64>, DistError> {
        self.reduce_lanes(value, |d, x| d.logcdf(x))
    }

    fn random<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        size: &[usize],
    ) -> Result<ArrayD<f64>, DistError> {
        let draws: usize = size.iter().product();
        let mut out = Vec::with_capacity(draws * self.dists.len());
        for _ in 0..draws {
            for dist in self.dists.iter() {
                out.push(dist.random(rng)?);
            }
        }
        let mut shape = size.to_vec();
        shape.push(self.dists.len());
        from_flat(&shape, out)
    }

    fn initial_value(&self) -> ArrayD<f64> {
        Array1::from_iter(self.dists.iter().map(Univariate::initial_value)).into_dyn()
    }

    fn default_transform(&self) -> Option<Transform> {
        self.dists
            .iter()
            .all(Univariate::is_positive)
            .then_some(Transform::Log)
    }
}

/// Scalar value wrapped into a zero dimensional array.
pub(crate) fn scalar_array(value: f64) -> ArrayD<f64> {
    ArrayD::from_elem(IxDyn(&[]), value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn chi_squared_with_two_dof_is_exponential() {
        let chi = Univariate::ChiSquared { nu: 2. };
        let exp = Univariate::Exponential { lam: 0.5 };
        for x in [0.1, 1., 3.5] {
            assert_abs_diff_eq!(chi.logp(x), exp.logp(x), epsilon = 1e-12);
            assert_abs_diff_eq!(chi.logcdf(x), exp.logcdf(x), epsilon = 1e-10);
        }
    }

    #[test]
    fn half_normal_doubles_normal() {
        let half = Univariate::HalfNormal { sigma: 2. };
        let normal = Univariate::Normal { mu: 0., sigma: 2. };
        assert_abs_diff_eq!(half.logp(1.3), normal.logp(1.3) + LN_2, epsilon = 1e-12);
        assert_eq!(half.logp(-1.), f64::NEG_INFINITY);
        assert_abs_diff_eq!(normal.logcdf(0.), 0.5f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn independent_sums_lanes() {
        let dist = Independent::new(vec![
            Univariate::Normal { mu: 0., sigma: 1. },
            Univariate::Exponential { lam: 2. },
        ])
        .unwrap();
        let value = array![[0., 1.], [1., 0.5]].into_dyn();
        let logp = dist.logp(value.view(), BoundSettings::default()).unwrap();
        assert_eq!(logp.shape(), &[2]);
        let expected = -LN_SQRT_2PI + 2f64.ln() - 2.;
        assert_abs_diff_eq!(logp[[0]], expected, epsilon = 1e-12);
        assert!(dist.default_transform().is_none());

        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        let draws = dist.random(&mut rng, &[5]).unwrap();
        assert_eq!(draws.shape(), &[5, 2]);
        assert!(draws.slice(ndarray::s![.., 1]).iter().all(|&v| v >= 0.));
    }
}
