use std::f64::consts::PI;

use faer::Mat;
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use rand::Rng;
use rand_distr::{ChiSquared, Distribution as _, StandardNormal};
use statrs::function::gamma::ln_gamma;

use crate::bound::{bound, BoundSettings, Condition};
use crate::distribution::{sampling_error, DistError, Distribution};
use crate::linalg::{cholesky, CholeskyFactor};
use crate::quaddist::{quaddist_matrix, quaddist_parse, CovarianceArgs, MatType};
use crate::shape::{broadcast_all, flat_values, from_flat, split_event, BroadcastIndex, Lanes};

/// Broadcasts a location parameter to `(batch..., k)`.
fn broadcast_mu(mu: ArrayD<f64>, k: usize) -> Result<ArrayD<f64>, DistError> {
    let mut shape = mu.shape().to_vec();
    match shape.last_mut() {
        Some(last) if *last == k => return Ok(mu),
        Some(last) if *last == 1 => *last = k,
        Some(_) => {
            return Err(DistError::ShapeMismatch {
                left: mu.shape().to_vec(),
                right: vec![k],
            })
        }
        None => shape.push(k),
    }
    let view = mu
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| DistError::ShapeMismatch {
            left: mu.shape().to_vec(),
            right: shape.clone(),
        })?;
    Ok(view.to_owned())
}

/// `L z` for the lower factor `L` and a standard normal vector `z`.
pub(crate) fn correlated_normal<R: Rng + ?Sized>(rng: &mut R, chol: &Mat<f64>) -> Vec<f64> {
    let k = chol.nrows();
    let z: Vec<f64> = (0..k).map(|_| rng.sample(StandardNormal)).collect();
    (0..k)
        .map(|i| (0..=i).map(|j| chol[(i, j)] * z[j]).sum())
        .collect()
}

/// Multivariate normal distribution.
///
/// `mu` may carry leading batch dimensions that share the covariance.
#[derive(Debug, Clone)]
pub struct MvNormal {
    mu: ArrayD<f64>,
    cov: Mat<f64>,
    chol: CholeskyFactor,
}

impl MvNormal {
    pub fn new(mu: ArrayD<f64>, cov: CovarianceArgs) -> Result<Self, DistError> {
        let cov = quaddist_matrix(cov)?;
        let mu = broadcast_mu(mu, cov.nrows())?;
        let chol = cholesky(&cov);
        Ok(Self { mu, cov, chol })
    }

    pub fn mu(&self) -> &ArrayD<f64> {
        &self.mu
    }

    pub fn cov(&self) -> &Mat<f64> {
        &self.cov
    }

    fn dim(&self) -> usize {
        self.cov.nrows()
    }
}

impl Distribution for MvNormal {
    fn name(&self) -> &'static str {
        "MvNormal"
    }

    fn ndim_supp(&self) -> usize {
        1
    }

    fn shape(&self) -> Vec<usize> {
        self.mu.shape().to_vec()
    }

    fn logp(
        &self,
        value: ArrayViewD<'_, f64>,
        settings: BoundSettings,
    ) -> Result<ArrayD<f64>, DistError> {
        let quad = quaddist_parse(value, self.mu.view(), &self.cov, MatType::Cov)?;
        let k = self.dim() as f64;
        let norm = -0.5 * k * (2. * PI).ln();
        let logp = quad.quaddist.mapv(|q| norm - 0.5 * q - quad.logdet);
        bound(logp, &[Condition::Scalar(quad.ok)], true, settings)
    }

    fn random<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        size: &[usize],
    ) -> Result<ArrayD<f64>, DistError> {
        if !self.chol.ok {
            return Err(DistError::NotPositiveDefinite("cov"));
        }
        let k = self.dim();
        let draws: usize = size.iter().product();
        let mut out = Vec::with_capacity(draws * self.mu.len());
        let mu = flat_values(&self.mu.view());
        for _ in 0..draws {
            for mu in mu.chunks_exact(k) {
                let x = correlated_normal(rng, &self.chol.factor);
                out.extend(mu.iter().zip(x).map(|(m, x)| m + x));
            }
        }
        let mut shape = size.to_vec();
        shape.extend(self.shape());
        from_flat(&shape, out)
    }

    fn initial_value(&self) -> ArrayD<f64> {
        self.mu.clone()
    }
}

/// Multivariate Student-T distribution.
#[derive(Debug, Clone)]
pub struct MvStudentT {
    nu: ArrayD<f64>,
    mu: ArrayD<f64>,
    cov: Mat<f64>,
    chol: CholeskyFactor,
    batch: Vec<usize>,
}

impl MvStudentT {
    /// `nu` broadcasts against the batch dimensions of `mu`.
    pub fn new(nu: ArrayD<f64>, mu: ArrayD<f64>, cov: CovarianceArgs) -> Result<Self, DistError> {
        if nu.iter().any(|&v| !(v > 0.)) {
            return Err(DistError::InvalidParameter {
                name: "nu",
                reason: "must be positive".into(),
            });
        }
        let cov = quaddist_matrix(cov)?;
        let mu = broadcast_mu(mu, cov.nrows())?;
        let (mu_batch, _) = split_event(mu.shape(), 1)?;
        let batch = broadcast_all([mu_batch, nu.shape()])?;
        let chol = cholesky(&cov);
        Ok(Self {
            nu,
            mu,
            cov,
            chol,
            batch,
        })
    }

    pub fn nu(&self) -> &ArrayD<f64> {
        &self.nu
    }

    fn dim(&self) -> usize {
        self.cov.nrows()
    }
}

impl Distribution for MvStudentT {
    fn name(&self) -> &'static str {
        "MvStudentT"
    }

    fn ndim_supp(&self) -> usize {
        1
    }

    fn shape(&self) -> Vec<usize> {
        let mut shape = self.batch.clone();
        shape.push(self.dim());
        shape
    }

    fn logp(
        &self,
        value: ArrayViewD<'_, f64>,
        settings: BoundSettings,
    ) -> Result<ArrayD<f64>, DistError> {
        let quad = quaddist_parse(value, self.mu.view(), &self.cov, MatType::Cov)?;
        let out_batch = broadcast_all([quad.quaddist.shape(), self.nu.shape()])?;
        let quad_idx = BroadcastIndex::new(quad.quaddist.shape(), &out_batch)?;
        let nu = Lanes::new(&self.nu.view(), 0, &out_batch)?;
        let quads: Vec<f64> = quad.quaddist.iter().copied().collect();
        let k = self.dim() as f64;

        let n: usize = out_batch.iter().product();
        let logp = (0..n)
            .map(|i| {
                let nu = nu.scalar(i);
                let q = quads[quad_idx.index(i)];
                let norm = ln_gamma((nu + k) / 2.) - ln_gamma(nu / 2.) - 0.5 * k * (nu * PI).ln();
                let inner = -(nu + k) / 2. * (q / nu).ln_1p();
                norm + inner - quad.logdet
            })
            .collect();
        bound(
            from_flat(&out_batch, logp)?,
            &[Condition::Scalar(quad.ok)],
            true,
            settings,
        )
    }

    fn random<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        size: &[usize],
    ) -> Result<ArrayD<f64>, DistError> {
        if !self.chol.ok {
            return Err(DistError::NotPositiveDefinite("cov"));
        }
        let k = self.dim();
        let mut full_batch = size.to_vec();
        full_batch.extend(self.batch.iter().copied());
        let mu = Lanes::new(&self.mu.view(), 1, &full_batch)?;
        let nu = Lanes::new(&self.nu.view(), 0, &full_batch)?;

        let n: usize = full_batch.iter().product();
        let mut out = Vec::with_capacity(n * k);
        for i in 0..n {
            let nu = nu.scalar(i);
            let chi2: f64 = ChiSquared::new(nu).map_err(sampling_error)?.sample(rng);
            let scale = (chi2 / nu).sqrt();
            let x = correlated_normal(rng, &self.chol.factor);
            out.extend(mu.lane(i).iter().zip(x).map(|(m, x)| x / scale + m));
        }
        full_batch.push(k);
        from_flat(&full_batch, out)
    }

    fn initial_value(&self) -> ArrayD<f64> {
        let shape = self.shape();
        self.mu
            .broadcast(IxDyn(&shape))
            .map(|view| view.to_owned())
            .unwrap_or_else(|| self.mu.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::det;
    use crate::univariate::Univariate;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr0, array};
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;

    fn cov() -> Mat<f64> {
        Mat::from_fn(3, 3, |i, j| match (i, j) {
            (i, j) if i == j => 1. + i as f64,
            (0, 1) | (1, 0) => 0.3,
            _ => -0.2,
        })
    }

    #[test]
    fn logp_at_mean() {
        let mu = array![1., -2., 0.5].into_dyn();
        let dist = MvNormal::new(mu.clone(), CovarianceArgs::default().cov(cov())).unwrap();
        let logp = dist.logp(mu.view(), BoundSettings::default()).unwrap();
        let expected = -1.5 * (2. * PI).ln() - 0.5 * det(&cov()).ln();
        assert_eq!(logp.ndim(), 0);
        assert_abs_diff_eq!(logp.sum(), expected, epsilon = 1e-12);
    }

    #[test]
    fn diagonal_covariance_factorizes() {
        let sigmas = [0.5, 1., 2.];
        let cov = Mat::from_fn(3, 3, |i, j| if i == j { sigmas[i] * sigmas[i] } else { 0. });
        let dist = MvNormal::new(array![0., 1., 2.].into_dyn(), CovarianceArgs::default().cov(cov))
            .unwrap();
        let value = array![[0.3, 0.2, 1.], [1., 1., 1.]].into_dyn();
        let logp = dist.logp(value.view(), BoundSettings::default()).unwrap();
        assert_eq!(logp.shape(), &[2]);
        let expected: f64 = (0..3)
            .map(|i| {
                Univariate::Normal {
                    mu: i as f64,
                    sigma: sigmas[i],
                }
                .logp(value[[1, i]])
            })
            .sum();
        assert_abs_diff_eq!(logp[[1]], expected, epsilon = 1e-12);
    }

    #[test]
    fn non_positive_definite_is_neg_inf() {
        let bad = Mat::from_fn(2, 2, |i, j| if i == j { 1. } else { 2. });
        let dist = MvNormal::new(array![0., 0.].into_dyn(), CovarianceArgs::default().cov(bad))
            .unwrap();
        let logp = dist
            .logp(array![0.1, 0.2].into_dyn().view(), BoundSettings::default())
            .unwrap();
        assert_eq!(logp.sum(), f64::NEG_INFINITY);
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        assert!(dist.random(&mut rng, &[]).is_err());
    }

    #[test]
    fn precision_and_cholesky_agree() {
        let c = cov();
        let mu = array![0., 0., 0.].into_dyn();
        let value = array![0.4, -1., 0.2].into_dyn();
        let by_cov = MvNormal::new(mu.clone(), CovarianceArgs::default().cov(c.clone())).unwrap();
        let tau = crate::linalg::matrix_inverse(&c).unwrap();
        let by_tau = MvNormal::new(mu.clone(), CovarianceArgs::default().tau(tau)).unwrap();
        let by_chol =
            MvNormal::new(mu, CovarianceArgs::default().chol(cholesky(&c).factor)).unwrap();
        let a = by_cov.logp_sum(value.view(), BoundSettings::default()).unwrap();
        let b = by_tau.logp_sum(value.view(), BoundSettings::default()).unwrap();
        let d = by_chol.logp_sum(value.view(), BoundSettings::default()).unwrap();
        assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        assert_abs_diff_eq!(a, d, epsilon = 1e-10);
    }

    #[test]
    fn random_moments() {
        let c = cov();
        let dist = MvNormal::new(array![1., 2., 3.].into_dyn(), CovarianceArgs::default().cov(c.clone()))
            .unwrap();
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        let draws = dist.random(&mut rng, &[20000]).unwrap();
        assert_eq!(draws.shape(), &[20000, 3]);
        let mean = draws.mean_axis(ndarray::Axis(0)).unwrap();
        for (i, m) in mean.iter().enumerate() {
            assert_abs_diff_eq!(*m, 1. + i as f64, epsilon = 0.05);
        }
        let centered0: Vec<f64> = draws.index_axis(ndarray::Axis(1), 0).iter().map(|v| v - 1.).collect();
        let centered1: Vec<f64> = draws.index_axis(ndarray::Axis(1), 1).iter().map(|v| v - 2.).collect();
        let cov01 = centered0.iter().zip(&centered1).map(|(a, b)| a * b).sum::<f64>() / 20000.;
        assert_abs_diff_eq!(cov01, c[(0, 1)], epsilon = 0.06);
    }

    #[test]
    fn student_t_univariate_case() {
        let nu = 4.;
        let scale: f64 = 1.5;
        let cov = Mat::from_fn(1, 1, |_, _| scale * scale);
        let dist = MvStudentT::new(arr0(nu).into_dyn(), array![0.5].into_dyn(), CovarianceArgs::default().cov(cov))
            .unwrap();
        let x = 2.;
        let t = (x - 0.5) / scale;
        let expected = ln_gamma((nu + 1.) / 2.)
            - ln_gamma(nu / 2.)
            - 0.5 * (nu * PI).ln()
            - scale.ln()
            - (nu + 1.) / 2. * (t * t / nu).ln_1p();
        let logp = dist
            .logp(array![x].into_dyn().view(), BoundSettings::default())
            .unwrap();
        assert_abs_diff_eq!(logp.sum(), expected, epsilon = 1e-12);
    }

    #[test]
    fn student_t_rejects_bad_nu_and_double_cov() {
        let cov = Mat::<f64>::identity(2, 2);
        assert!(MvStudentT::new(
            arr0(0.).into_dyn(),
            array![0., 0.].into_dyn(),
            CovarianceArgs::default().cov(cov.clone())
        )
        .is_err());
        assert!(MvStudentT::new(
            arr0(3.).into_dyn(),
            array![0., 0.].into_dyn(),
            CovarianceArgs::default().cov(cov.clone()).sigma(cov.clone())
        )
        .is_err());
        assert!(MvStudentT::new(
            arr0(3.).into_dyn(),
            array![0., 0.].into_dyn(),
            CovarianceArgs::default().sigma(cov)
        )
        .is_ok());
    }

    #[test]
    fn student_t_random_broadcasts_nu() {
        let cov = Mat::<f64>::identity(2, 2);
        let dist = MvStudentT::new(
            array![3., 30., 300.].into_dyn(),
            array![0., 10.].into_dyn(),
            CovarianceArgs::default().cov(cov),
        )
        .unwrap();
        assert_eq!(dist.shape(), vec![3, 2]);
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        let draws = dist.random(&mut rng, &[4]).unwrap();
        assert_eq!(draws.shape(), &[4, 3, 2]);
        let logp = dist.logp(dist.initial_value().index_axis(ndarray::Axis(0), 0), BoundSettings::default());
        assert_eq!(logp.unwrap().shape(), &[3]);
    }
}
