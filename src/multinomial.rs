use std::rc::Rc;

use ndarray::{ArrayD, ArrayViewD};
use rand::Rng;
use rand_distr::{Binomial, Distribution as _, Gamma};
use statrs::function::gamma::ln_gamma;

use crate::blocking::Point;
use crate::bound::{bound, BoundSettings, Condition};
use crate::distribution::{sampling_error, DistError, Distribution, MvDist};
use crate::math::{factln, logpow, sigmoid};
use crate::model::{Model, ModelError};
use crate::shape::{broadcast_all, flat_values, from_flat, split_event, Lanes};
use crate::transforms::Transform;

fn require_vector_param(name: &'static str, param: &ArrayD<f64>) -> Result<(), DistError> {
    if param.ndim() == 0 || param.shape().last() == Some(&0) {
        return Err(DistError::Rank {
            name,
            expected: "at least one non-empty".into(),
            found: param.ndim(),
        });
    }
    Ok(())
}

fn category_count(param: &ArrayD<f64>) -> usize {
    param.shape().last().copied().unwrap_or(1)
}

/// Batch shape of a value with `k` categories, broadcast against `params_batch`.
fn value_batch(
    value: &ArrayViewD<'_, f64>,
    k: usize,
    params_batch: &[usize],
) -> Result<Vec<usize>, DistError> {
    let (batch, event) = split_event(value.shape(), 1)?;
    if event != [k] {
        return Err(DistError::ShapeMismatch {
            left: value.shape().to_vec(),
            right: vec![k],
        });
    }
    broadcast_all([batch, params_batch])
}

fn sample_gamma_simplex<R: Rng + ?Sized>(rng: &mut R, a: &[f64]) -> Result<Vec<f64>, DistError> {
    let mut draws = a
        .iter()
        .map(|&a| Ok(Gamma::new(a, 1.).map_err(sampling_error)?.sample(rng)))
        .collect::<Result<Vec<f64>, DistError>>()?;
    let total: f64 = draws.iter().sum();
    draws.iter_mut().for_each(|x| *x /= total);
    Ok(draws)
}

/// Multinomial draw through a sequence of conditional binomials.
pub(crate) fn sample_multinomial<R: Rng + ?Sized>(
    rng: &mut R,
    n: f64,
    p: &[f64],
) -> Result<Vec<f64>, DistError> {
    if !(n >= 0.) || n.fract() != 0. {
        return Err(DistError::InvalidParameter {
            name: "n",
            reason: format!("must be a non-negative integer, got {n}"),
        });
    }
    let mut remaining = n as u64;
    let mut mass = 1f64;
    let mut out = Vec::with_capacity(p.len());
    for (i, &p_i) in p.iter().enumerate() {
        if i + 1 == p.len() {
            out.push(remaining as f64);
            break;
        }
        let prob = if mass > 0. { (p_i / mass).clamp(0., 1.) } else { 0. };
        let x = Binomial::new(remaining, prob)
            .map_err(sampling_error)?
            .sample(rng);
        out.push(x as f64);
        remaining -= x;
        mass -= p_i;
    }
    Ok(out)
}

/// Dirichlet distribution over the probability simplex.
#[derive(Debug, Clone)]
pub struct Dirichlet {
    a: ArrayD<f64>,
}

impl Dirichlet {
    pub fn new(a: ArrayD<f64>) -> Result<Self, DistError> {
        require_vector_param("a", &a)?;
        Ok(Self { a })
    }

    pub fn a(&self) -> &ArrayD<f64> {
        &self.a
    }
}

impl Distribution for Dirichlet {
    fn name(&self) -> &'static str {
        "Dirichlet"
    }

    fn ndim_supp(&self) -> usize {
        1
    }

    fn shape(&self) -> Vec<usize> {
        self.a.shape().to_vec()
    }

    fn logp(
        &self,
        value: ArrayViewD<'_, f64>,
        settings: BoundSettings,
    ) -> Result<ArrayD<f64>, DistError> {
        let k = category_count(&self.a);
        let (a_batch, _) = split_event(self.a.shape(), 1)?;
        let batch = value_batch(&value, k, a_batch)?;
        let values = Lanes::new(&value, 1, &batch)?;
        let a = Lanes::new(&self.a.view(), 1, &batch)?;

        let n: usize = batch.iter().product();
        let logp = (0..n)
            .map(|i| {
                let a = a.lane(i);
                let sum_a: f64 = a.iter().sum();
                let terms: f64 = values
                    .lane(i)
                    .iter()
                    .zip(a)
                    .map(|(&v, &a)| logpow(v, a - 1.) - ln_gamma(a))
                    .sum();
                terms + ln_gamma(sum_a)
            })
            .collect();

        let all_values = flat_values(&value);
        let conditions = [
            Condition::Scalar(all_values.iter().all(|&v| v >= 0.)),
            Condition::Scalar(all_values.iter().all(|&v| v <= 1.)),
            Condition::Scalar(self.a.iter().all(|&a| a > 0.)),
        ];
        bound(from_flat(&batch, logp)?, &conditions, false, settings)
    }

    fn random<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        size: &[usize],
    ) -> Result<ArrayD<f64>, DistError> {
        let k = category_count(&self.a);
        let draws: usize = size.iter().product();
        let a = flat_values(&self.a.view());
        let mut out = Vec::with_capacity(draws * a.len());
        for _ in 0..draws {
            for lane in a.chunks_exact(k) {
                out.extend(sample_gamma_simplex(rng, lane)?);
            }
        }
        let mut shape = size.to_vec();
        shape.extend(self.shape());
        from_flat(&shape, out)
    }

    fn initial_value(&self) -> ArrayD<f64> {
        let k = category_count(&self.a);
        let mut mean = self.a.as_standard_layout().into_owned();
        if let Some(data) = mean.as_slice_mut() {
            for lane in data.chunks_exact_mut(k) {
                let total: f64 = lane.iter().sum();
                lane.iter_mut().for_each(|a| *a /= total);
            }
        }
        mean
    }

    fn default_transform(&self) -> Option<Transform> {
        Some(Transform::StickBreaking)
    }
}

/// Multinomial distribution over counts in `k` categories.
#[derive(Debug, Clone)]
pub struct Multinomial {
    n: ArrayD<f64>,
    p: ArrayD<f64>,
    batch: Vec<usize>,
}

impl Multinomial {
    /// The probabilities are renormalized along their last axis.
    pub fn new(n: ArrayD<f64>, p: ArrayD<f64>) -> Result<Self, DistError> {
        require_vector_param("p", &p)?;
        let k = category_count(&p);
        let mut p = p.as_standard_layout().into_owned();
        if let Some(data) = p.as_slice_mut() {
            for lane in data.chunks_exact_mut(k) {
                let total: f64 = lane.iter().sum();
                lane.iter_mut().for_each(|v| *v /= total);
            }
        }
        let (p_batch, _) = split_event(p.shape(), 1)?;
        let batch = broadcast_all([n.shape(), p_batch])?;
        Ok(Self { n, p, batch })
    }

    pub fn p(&self) -> &ArrayD<f64> {
        &self.p
    }

    pub fn n(&self) -> &ArrayD<f64> {
        &self.n
    }
}

impl Distribution for Multinomial {
    fn name(&self) -> &'static str {
        "Multinomial"
    }

    fn ndim_supp(&self) -> usize {
        1
    }

    fn shape(&self) -> Vec<usize> {
        let mut shape = self.batch.clone();
        shape.push(category_count(&self.p));
        shape
    }

    fn logp(
        &self,
        value: ArrayViewD<'_, f64>,
        settings: BoundSettings,
    ) -> Result<ArrayD<f64>, DistError> {
        let k = category_count(&self.p);
        let batch = value_batch(&value, k, &self.batch)?;
        let values = Lanes::new(&value, 1, &batch)?;
        let p = Lanes::new(&self.p.view(), 1, &batch)?;
        let n = Lanes::new(&self.n.view(), 0, &batch)?;

        let size: usize = batch.iter().product();
        let mut counts_match = true;
        let logp = (0..size)
            .map(|i| {
                let n = n.scalar(i);
                let v = values.lane(i);
                counts_match &= v.iter().sum::<f64>() == n;
                factln(n)
                    + v.iter()
                        .zip(p.lane(i))
                        .map(|(&v, &p)| -factln(v) + logpow(p, v))
                        .sum::<f64>()
            })
            .collect();

        let p_sums_to_one = flat_values(&self.p.view())
            .chunks_exact(k)
            .all(|lane| (lane.iter().sum::<f64>() - 1.).abs() <= 1e-9);
        let conditions = [
            Condition::Scalar(flat_values(&value).iter().all(|&v| v >= 0.)),
            Condition::Scalar(counts_match),
            Condition::Scalar(self.p.iter().all(|&p| (0. ..=1.).contains(&p))),
            Condition::Scalar(p_sums_to_one),
            Condition::Scalar(self.n.iter().all(|&n| n >= 0.)),
        ];
        bound(from_flat(&batch, logp)?, &conditions, false, settings)
    }

    fn random<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        size: &[usize],
    ) -> Result<ArrayD<f64>, DistError> {
        let mut full_batch = size.to_vec();
        full_batch.extend(self.batch.iter().copied());
        let p = Lanes::new(&self.p.view(), 1, &full_batch)?;
        let n = Lanes::new(&self.n.view(), 0, &full_batch)?;

        let draws: usize = full_batch.iter().product();
        let mut out = Vec::with_capacity(draws * category_count(&self.p));
        for i in 0..draws {
            out.extend(sample_multinomial(rng, n.scalar(i), p.lane(i))?);
        }
        full_batch.push(category_count(&self.p));
        from_flat(&full_batch, out)
    }

    fn initial_value(&self) -> ArrayD<f64> {
        let shape = self.batch.clone();
        let k = category_count(&self.p);
        let (Ok(p), Ok(n)) = (
            Lanes::new(&self.p.view(), 1, &shape),
            Lanes::new(&self.n.view(), 0, &shape),
        ) else {
            return ArrayD::zeros(self.shape());
        };
        let count: usize = shape.iter().product();
        let mut out = Vec::with_capacity(count * k);
        for i in 0..count {
            let n = n.scalar(i);
            let p = p.lane(i);
            let mut lane: Vec<f64> = p.iter().map(|p| (n * p).floor()).collect();
            let rest = n - lane.iter().sum::<f64>();
            let largest = (0..k).max_by(|&a, &b| p[a].total_cmp(&p[b])).unwrap_or(0);
            lane[largest] += rest;
            out.extend(lane);
        }
        from_flat(&self.shape(), out).unwrap_or_else(|_| ArrayD::zeros(self.shape()))
    }

    fn is_discrete(&self) -> bool {
        true
    }
}

/// Dirichlet compound multinomial distribution.
#[derive(Debug, Clone)]
pub struct DirichletMultinomial {
    n: ArrayD<f64>,
    a: ArrayD<f64>,
    batch: Vec<usize>,
}

impl DirichletMultinomial {
    pub fn new(n: ArrayD<f64>, a: ArrayD<f64>) -> Result<Self, DistError> {
        require_vector_param("a", &a)?;
        let (a_batch, _) = split_event(a.shape(), 1)?;
        let batch = broadcast_all([n.shape(), a_batch])?;
        Ok(Self { n, a, batch })
    }
}

impl Distribution for DirichletMultinomial {
    fn name(&self) -> &'static str {
        "DirichletMultinomial"
    }

    fn ndim_supp(&self) -> usize {
        1
    }

    fn shape(&self) -> Vec<usize> {
        let mut shape = self.batch.clone();
        shape.push(category_count(&self.a));
        shape
    }

    fn logp(
        &self,
        value: ArrayViewD<'_, f64>,
        settings: BoundSettings,
    ) -> Result<ArrayD<f64>, DistError> {
        let k = category_count(&self.a);
        let batch = value_batch(&value, k, &self.batch)?;
        let values = Lanes::new(&value, 1, &batch)?;
        let a = Lanes::new(&self.a.view(), 1, &batch)?;
        let n = Lanes::new(&self.n.view(), 0, &batch)?;

        let size: usize = batch.iter().product();
        let mut counts_match = true;
        let logp = (0..size)
            .map(|i| {
                let n = n.scalar(i);
                let a = a.lane(i);
                let v = values.lane(i);
                counts_match &= v.iter().sum::<f64>() == n;
                let sum_a: f64 = a.iter().sum();
                let constant = ln_gamma(n + 1.) + ln_gamma(sum_a) - ln_gamma(n + sum_a);
                let series: f64 = v
                    .iter()
                    .zip(a)
                    .map(|(&v, &a)| ln_gamma(v + a) - ln_gamma(v + 1.) - ln_gamma(a))
                    .sum();
                constant + series
            })
            .collect();

        let conditions = [
            Condition::Scalar(flat_values(&value).iter().all(|&v| v >= 0.)),
            Condition::Scalar(self.a.iter().all(|&a| a > 0.)),
            Condition::Scalar(self.n.iter().all(|&n| n >= 0.)),
            Condition::Scalar(counts_match),
        ];
        bound(from_flat(&batch, logp)?, &conditions, false, settings)
    }

    fn random<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        size: &[usize],
    ) -> Result<ArrayD<f64>, DistError> {
        let mut full_batch = size.to_vec();
        full_batch.extend(self.batch.iter().copied());
        let a = Lanes::new(&self.a.view(), 1, &full_batch)?;
        let n = Lanes::new(&self.n.view(), 0, &full_batch)?;

        let draws: usize = full_batch.iter().product();
        let mut out = Vec::with_capacity(draws * category_count(&self.a));
        for i in 0..draws {
            let p = sample_gamma_simplex(rng, a.lane(i))?;
            out.extend(sample_multinomial(rng, n.scalar(i), &p)?);
        }
        full_batch.push(category_count(&self.a));
        from_flat(&full_batch, out)
    }

    fn initial_value(&self) -> ArrayD<f64> {
        let k = category_count(&self.a);
        let mut p = self.a.as_standard_layout().into_owned();
        if let Some(data) = p.as_slice_mut() {
            for lane in data.chunks_exact_mut(k) {
                let total: f64 = lane.iter().sum();
                lane.iter_mut().for_each(|v| *v /= total);
            }
        }
        match Multinomial::new(self.n.clone(), p) {
            Ok(multinomial) => multinomial.initial_value(),
            Err(_) => ArrayD::zeros(self.shape()),
        }
    }

    fn is_discrete(&self) -> bool {
        true
    }
}

/// Category probabilities of an ordered logistic model.
///
/// `p_cum = [0, sigmoid(cutpoints - eta), 1]` and `p = diff(p_cum)`, with
/// `eta` broadcast against the batch dimensions of `cutpoints`.
pub fn ordered_probs(eta: &ArrayD<f64>, cutpoints: &ArrayD<f64>) -> Result<ArrayD<f64>, DistError> {
    require_vector_param("cutpoints", cutpoints)?;
    let (cut_batch, _) = split_event(cutpoints.shape(), 1)?;
    let batch = broadcast_all([eta.shape(), cut_batch])?;
    let eta = Lanes::new(&eta.view(), 0, &batch)?;
    let cuts = Lanes::new(&cutpoints.view(), 1, &batch)?;
    let k = category_count(cutpoints) + 1;

    let size: usize = batch.iter().product();
    let mut out = Vec::with_capacity(size * k);
    for i in 0..size {
        let eta = eta.scalar(i);
        let mut prev = 0.;
        for &c in cuts.lane(i) {
            let cum = sigmoid(c - eta);
            out.push(cum - prev);
            prev = cum;
        }
        out.push(1. - prev);
    }
    let mut shape = batch;
    shape.push(k);
    from_flat(&shape, out)
}

/// Multinomial whose probabilities come from an ordered logistic link.
#[derive(Debug, Clone)]
pub struct OrderedMultinomial {
    eta: ArrayD<f64>,
    cutpoints: ArrayD<f64>,
    inner: Multinomial,
}

impl OrderedMultinomial {
    pub fn new(eta: ArrayD<f64>, cutpoints: ArrayD<f64>, n: ArrayD<f64>) -> Result<Self, DistError> {
        let p = ordered_probs(&eta, &cutpoints)?;
        let inner = Multinomial::new(n, p)?;
        Ok(Self {
            eta,
            cutpoints,
            inner,
        })
    }

    pub fn probs(&self) -> &ArrayD<f64> {
        self.inner.p()
    }

    pub fn eta(&self) -> &ArrayD<f64> {
        &self.eta
    }

    pub fn cutpoints(&self) -> &ArrayD<f64> {
        &self.cutpoints
    }

    /// Registers an observed ordered multinomial whose parameters are computed
    /// from the other model variables, and `{name}_probs` if `compute_p`.
    pub fn register<F>(
        model: &mut Model,
        name: &str,
        params: F,
        observed: ArrayD<f64>,
        compute_p: bool,
    ) -> Result<(), ModelError>
    where
        F: Fn(&Point) -> Result<OrderedMultinomial, DistError> + 'static,
    {
        let params = Rc::new(params);
        let factory = Rc::clone(&params);
        model.add_observed_fn(name, move |point| Ok(MvDist::from(factory(point)?)), observed)?;
        if compute_p {
            model.add_deterministic(&format!("{name}_probs"), move |point| {
                Ok(params(point)?.probs().clone())
            })?;
        }
        Ok(())
    }
}

impl Distribution for OrderedMultinomial {
    fn name(&self) -> &'static str {
        "OrderedMultinomial"
    }

    fn ndim_supp(&self) -> usize {
        1
    }

    fn shape(&self) -> Vec<usize> {
        self.inner.shape()
    }

    fn logp(
        &self,
        value: ArrayViewD<'_, f64>,
        settings: BoundSettings,
    ) -> Result<ArrayD<f64>, DistError> {
        self.inner.logp(value, settings)
    }

    fn random<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        size: &[usize],
    ) -> Result<ArrayD<f64>, DistError> {
        self.inner.random(rng, size)
    }

    fn initial_value(&self) -> ArrayD<f64> {
        self.inner.initial_value()
    }

    fn is_discrete(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr0, array};
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;

    #[test]
    fn dirichlet_centroid() {
        let dist = Dirichlet::new(array![1., 1., 1.].into_dyn()).unwrap();
        let third = 1. / 3.;
        let logp = dist
            .logp(array![third, third, third].into_dyn().view(), BoundSettings::default())
            .unwrap();
        assert_abs_diff_eq!(logp.sum(), 2f64.ln(), epsilon = 1e-12);

        let logp = dist
            .logp(array![-0.1, 0.6, 0.5].into_dyn().view(), BoundSettings::default())
            .unwrap();
        assert_eq!(logp.sum(), f64::NEG_INFINITY);
    }

    #[test]
    fn dirichlet_beta_case() {
        let dist = Dirichlet::new(array![2., 3.].into_dyn()).unwrap();
        let x: f64 = 0.3;
        let expected = x.ln() + 2. * (1. - x).ln() + ln_gamma(5.) - ln_gamma(2.) - ln_gamma(3.);
        let logp = dist
            .logp(array![[x, 1. - x], [0.5, 0.5]].into_dyn().view(), BoundSettings::default())
            .unwrap();
        assert_eq!(logp.shape(), &[2]);
        assert_abs_diff_eq!(logp[[0]], expected, epsilon = 1e-12);
    }

    #[test]
    fn dirichlet_boundary_with_small_concentration() {
        let settings = BoundSettings::default();
        let dist = Dirichlet::new(array![0.5, 1., 1.].into_dyn()).unwrap();
        let logp = dist.logp(array![0., 0.5, 0.5].into_dyn().view(), settings).unwrap();
        assert_eq!(logp.sum(), f64::INFINITY);

        let dist = Dirichlet::new(array![1., 2., 2.].into_dyn()).unwrap();
        let logp = dist.logp(array![0., 0.5, 0.5].into_dyn().view(), settings).unwrap();
        assert!(logp.sum().is_finite());
        let logp = dist.logp(array![0.5, 0., 0.5].into_dyn().view(), settings).unwrap();
        assert_eq!(logp.sum(), f64::NEG_INFINITY);
    }

    #[test]
    fn dirichlet_draws_on_simplex() {
        let dist = Dirichlet::new(array![[0.5, 1., 2.], [3., 3., 3.]].into_dyn()).unwrap();
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        let draws = dist.random(&mut rng, &[10]).unwrap();
        assert_eq!(draws.shape(), &[10, 2, 3]);
        for lane in draws.lanes(ndarray::Axis(2)) {
            assert_abs_diff_eq!(lane.sum(), 1., epsilon = 1e-12);
        }
        assert_eq!(dist.default_transform(), Some(Transform::StickBreaking));
        let init = dist.initial_value();
        assert_abs_diff_eq!(init[[0, 2]], 2. / 3.5, epsilon = 1e-12);
    }

    #[test]
    fn multinomial_support() {
        let dist = Multinomial::new(arr0(6.).into_dyn(), array![0.2, 0.3, 0.5].into_dyn()).unwrap();
        let settings = BoundSettings::default();
        for a in 0..=7i32 {
            for b in 0..=7i32 {
                for c in -1..=7i32 {
                    let value = array![a as f64, b as f64, c as f64].into_dyn();
                    let logp = dist.logp(value.view(), settings).unwrap().sum();
                    let in_support = c >= 0 && a + b + c == 6;
                    assert_eq!(logp.is_finite(), in_support, "{a} {b} {c}");
                }
            }
        }

        let value = array![1., 2., 3.].into_dyn();
        let expected = 720f64.ln() - 2f64.ln() - 6f64.ln()
            + 0.2f64.ln()
            + 2. * 0.3f64.ln()
            + 3. * 0.5f64.ln();
        let logp = dist.logp(value.view(), settings).unwrap().sum();
        assert_abs_diff_eq!(logp, expected, epsilon = 1e-12);
    }

    #[test]
    fn multinomial_negative_probability_is_outside_support() {
        let dist =
            Multinomial::new(arr0(2.).into_dyn(), array![-0.2, 0.6, 0.6].into_dyn()).unwrap();
        let logp = dist
            .logp(array![0., 1., 1.].into_dyn().view(), BoundSettings::default())
            .unwrap();
        assert_eq!(logp.sum(), f64::NEG_INFINITY);
    }

    #[test]
    fn multinomial_normalizes_and_samples() {
        let dist = Multinomial::new(
            array![10., 20.].into_dyn(),
            array![[1., 1., 2.], [2., 2., 4.]].into_dyn(),
        )
        .unwrap();
        assert_abs_diff_eq!(dist.p()[[1, 2]], 0.5, epsilon = 1e-15);
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        let draws = dist.random(&mut rng, &[7]).unwrap();
        assert_eq!(draws.shape(), &[7, 2, 3]);
        for draw in draws.outer_iter() {
            assert_eq!(draw.index_axis(ndarray::Axis(0), 0).sum(), 10.);
            assert_eq!(draw.index_axis(ndarray::Axis(0), 1).sum(), 20.);
        }
        let init = dist.initial_value();
        assert_eq!(init.index_axis(ndarray::Axis(0), 1).sum(), 20.);
        assert!(dist
            .logp(init.view(), BoundSettings::default())
            .unwrap()
            .iter()
            .all(|v| v.is_finite()));
    }

    #[test]
    fn dirichlet_multinomial_uniform_case() {
        let dist =
            DirichletMultinomial::new(arr0(3.).into_dyn(), array![1., 1.].into_dyn()).unwrap();
        for x in 0..=3 {
            let value = array![x as f64, (3 - x) as f64].into_dyn();
            let logp = dist.logp(value.view(), BoundSettings::default()).unwrap();
            assert_abs_diff_eq!(logp.sum(), -(4f64.ln()), epsilon = 1e-12);
        }
        let logp = dist
            .logp(array![1., 1.].into_dyn().view(), BoundSettings::default())
            .unwrap();
        assert_eq!(logp.sum(), f64::NEG_INFINITY);
    }

    #[test]
    fn dirichlet_multinomial_broadcasts_leading_axes() {
        let dist = DirichletMultinomial::new(
            array![2., 4.].into_dyn(),
            array![[1., 2.], [3., 4.]].into_dyn(),
        )
        .unwrap();
        let value = array![[[1., 1.], [2., 2.]], [[0., 2.], [4., 0.]]].into_dyn();
        let logp = dist.logp(value.view(), BoundSettings::default()).unwrap();
        assert_eq!(logp.shape(), &[2, 2]);
        let single = DirichletMultinomial::new(arr0(4.).into_dyn(), array![3., 4.].into_dyn())
            .unwrap()
            .logp(array![4., 0.].into_dyn().view(), BoundSettings::default())
            .unwrap();
        assert_abs_diff_eq!(logp[[1, 1]], single.sum(), epsilon = 1e-12);
    }

    #[test]
    fn ordered_probabilities() {
        let probs = ordered_probs(&arr0(0.5).into_dyn(), &array![-1., 0., 2.].into_dyn()).unwrap();
        assert_eq!(probs.shape(), &[4]);
        assert_abs_diff_eq!(probs.sum(), 1., epsilon = 1e-12);
        assert_abs_diff_eq!(probs[[0]], sigmoid(-1.5), epsilon = 1e-12);
        assert_abs_diff_eq!(probs[[3]], 1. - sigmoid(1.5), epsilon = 1e-12);

        let dist = OrderedMultinomial::new(
            array![0., 1.].into_dyn(),
            array![-1., 1.].into_dyn(),
            arr0(5.).into_dyn(),
        )
        .unwrap();
        assert_eq!(dist.probs().shape(), &[2, 3]);
        let logp = dist
            .logp(array![1., 3., 1.].into_dyn().view(), BoundSettings::default())
            .unwrap();
        assert_eq!(logp.shape(), &[2]);
    }

    #[test]
    fn registered_ordered_multinomial_tracks_probs() {
        use crate::model::VarOptions;
        use crate::univariate::{Independent, Univariate};

        let mut model = Model::default();
        let normal = Univariate::Normal { mu: 0., sigma: 1. };
        model
            .add_free("eta", Independent::iid(normal, 1).unwrap(), VarOptions::default())
            .unwrap();
        let observed = array![1., 2., 1.].into_dyn();
        OrderedMultinomial::register(
            &mut model,
            "y",
            |point| {
                OrderedMultinomial::new(
                    point["eta"].index_axis(ndarray::Axis(0), 0).to_owned(),
                    array![-1., 1.].into_dyn(),
                    arr0(4.).into_dyn(),
                )
            },
            observed.clone(),
            true,
        )
        .unwrap();
        assert_eq!(model.deterministic_names(), vec!["y_probs"]);

        let point = model.initial_point().unwrap();
        let deterministics = model.deterministics(&point).unwrap();
        let probs = &deterministics["y_probs"];
        assert_abs_diff_eq!(probs[[0]], sigmoid(-1.), epsilon = 1e-12);
        assert_abs_diff_eq!(probs[[1]], sigmoid(1.) - sigmoid(-1.), epsilon = 1e-12);

        let multinomial = Multinomial::new(arr0(4.).into_dyn(), probs.clone()).unwrap();
        let expected = normal.logp(0.)
            + multinomial
                .logp(observed.view(), BoundSettings::default())
                .unwrap()
                .sum();
        assert_abs_diff_eq!(model.logp(&point).unwrap(), expected, epsilon = 1e-12);
    }
}
