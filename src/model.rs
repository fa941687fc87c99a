//! Registry of random variables that make up a joint log density.
//!
//! Variables are added in order. Parameters of later variables can be computed
//! from the values of earlier ones through factory closures that receive the
//! constrained point, keyed by random variable names. Free variables with a
//! default transform are sampled in unconstrained space under the name
//! `{name}_{transform}__`.

use std::collections::HashSet;
use std::rc::Rc;

use ndarray::ArrayD;
use rand::Rng;
use thiserror::Error;

use crate::blocking::{Point, PointLogp};
use crate::bound::BoundSettings;
use crate::distribution::{DistError, Distribution, MvDist};
use crate::transforms::Transform;

#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ModelError {
    #[error("Variable name {0} already exists in the model")]
    DuplicateName(String),
    #[error("Point is missing a value for variable {0}")]
    MissingVar(String),
    #[error("Initial value of {name} has shape {found:?}, expected {expected:?}")]
    InitialValue {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("Error in distribution: {0}")]
    Dist(#[from] DistError),
}

/// Settings that apply to every log density evaluation of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelConfig {
    /// Replace the log density by `-inf` outside the support of parameters
    /// and values. Turning this off is only safe when all values are known
    /// to be valid.
    pub check_bounds: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self { check_bounds: true }
    }
}

impl From<ModelConfig> for BoundSettings {
    fn from(config: ModelConfig) -> Self {
        BoundSettings {
            check_bounds: config.check_bounds,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum TransformChoice {
    /// Use the default transform of the distribution, if any.
    #[default]
    Default,
    /// Sample in the constrained space.
    Disabled,
    Custom(Transform),
}

/// Options of a registered variable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VarOptions {
    pub transform: TransformChoice,
    pub shape: Option<Vec<usize>>,
    pub size: Option<Vec<usize>>,
    /// Constrained initial value, the distribution's initial value if unset.
    pub initval: Option<ArrayD<f64>>,
}

/// The variable a sampler sees for one free random variable.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueVar {
    pub name: String,
    pub rv_name: String,
    pub shape: Vec<usize>,
    pub discrete: bool,
    pub transform: Option<Transform>,
}

impl ValueVar {
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }
}

type Factory = Rc<dyn Fn(&Point) -> Result<MvDist, DistError>>;
type PointFn = Rc<dyn Fn(&Point) -> Result<ArrayD<f64>, DistError>>;

#[derive(Clone)]
enum DistSource {
    Fixed(MvDist),
    Computed(Factory),
}

impl DistSource {
    fn resolve(&self, point: &Point) -> Result<MvDist, DistError> {
        match self {
            DistSource::Fixed(dist) => Ok(dist.clone()),
            DistSource::Computed(factory) => factory(point),
        }
    }
}

#[derive(Clone)]
struct FreeVar {
    source: DistSource,
    value: ValueVar,
    initval: ArrayD<f64>,
}

#[derive(Clone)]
struct ObservedVar {
    name: String,
    source: DistSource,
    data: ArrayD<f64>,
}

#[derive(Clone)]
struct Deterministic {
    name: String,
    f: PointFn,
}

#[derive(Clone, Default)]
pub struct Model {
    config: ModelConfig,
    free: Vec<FreeVar>,
    observed: Vec<ObservedVar>,
    deterministics: Vec<Deterministic>,
    names: HashSet<String>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("config", &self.config)
            .field(
                "free",
                &self.free.iter().map(|v| &v.value.rv_name).collect::<Vec<_>>(),
            )
            .field(
                "observed",
                &self.observed.iter().map(|v| &v.name).collect::<Vec<_>>(),
            )
            .field(
                "deterministics",
                &self.deterministics.iter().map(|v| &v.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Model {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> ModelConfig {
        self.config
    }

    fn claim_name(&mut self, name: &str) -> Result<(), ModelError> {
        if !self.names.insert(name.to_string()) {
            return Err(ModelError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    /// Constrained initial values of the free variables registered so far.
    fn initial_constrained(&self) -> Point {
        self.free
            .iter()
            .map(|var| (var.value.rv_name.clone(), var.initval.clone()))
            .collect()
    }

    fn register_free(
        &mut self,
        name: &str,
        dist: MvDist,
        source: DistSource,
        mut options: VarOptions,
    ) -> Result<ValueVar, ModelError> {
        dist.validate_options(&mut options)?;
        let transform = if dist.is_discrete() {
            None
        } else {
            match options.transform {
                TransformChoice::Default => dist.default_transform(),
                TransformChoice::Disabled => None,
                TransformChoice::Custom(transform) => Some(transform),
            }
        };
        let shape = dist.shape();
        let initval = options.initval.unwrap_or_else(|| dist.initial_value());
        if initval.shape() != shape.as_slice() {
            return Err(ModelError::InitialValue {
                name: name.to_string(),
                expected: shape,
                found: initval.shape().to_vec(),
            });
        }

        let (value_name, value_shape) = match &transform {
            Some(transform) => (
                format!("{name}_{}__", transform.name()),
                transform.unconstrained_shape(&shape),
            ),
            None => (name.to_string(), shape),
        };
        if let Some(taken) = [name, value_name.as_str()]
            .into_iter()
            .find(|n| self.names.contains(*n))
        {
            return Err(ModelError::DuplicateName(taken.to_string()));
        }
        self.names.insert(name.to_string());
        self.names.insert(value_name.clone());

        let value = ValueVar {
            name: value_name,
            rv_name: name.to_string(),
            shape: value_shape,
            discrete: dist.is_discrete(),
            transform,
        };
        self.free.push(FreeVar {
            source,
            value: value.clone(),
            initval,
        });
        Ok(value)
    }

    /// Adds a free random variable with fixed parameters.
    pub fn add_free(
        &mut self,
        name: &str,
        dist: impl Into<MvDist>,
        options: VarOptions,
    ) -> Result<ValueVar, ModelError> {
        let dist = dist.into();
        self.register_free(name, dist.clone(), DistSource::Fixed(dist), options)
    }

    /// Adds a free random variable whose distribution depends on the values of
    /// previously registered variables.
    pub fn add_free_fn(
        &mut self,
        name: &str,
        factory: impl Fn(&Point) -> Result<MvDist, DistError> + 'static,
        options: VarOptions,
    ) -> Result<ValueVar, ModelError> {
        let dist = factory(&self.initial_constrained())?;
        self.register_free(name, dist, DistSource::Computed(Rc::new(factory)), options)
    }

    fn register_observed(
        &mut self,
        name: &str,
        dist: MvDist,
        source: DistSource,
        data: ArrayD<f64>,
    ) -> Result<(), ModelError> {
        // Rejects data the distribution cannot evaluate at registration time.
        dist.logp(data.view(), self.config.into())?;
        self.claim_name(name)?;
        self.observed.push(ObservedVar {
            name: name.to_string(),
            source,
            data,
        });
        Ok(())
    }

    pub fn add_observed(
        &mut self,
        name: &str,
        dist: impl Into<MvDist>,
        data: ArrayD<f64>,
    ) -> Result<(), ModelError> {
        let dist = dist.into();
        self.register_observed(name, dist.clone(), DistSource::Fixed(dist), data)
    }

    pub fn add_observed_fn(
        &mut self,
        name: &str,
        factory: impl Fn(&Point) -> Result<MvDist, DistError> + 'static,
        data: ArrayD<f64>,
    ) -> Result<(), ModelError> {
        let dist = factory(&self.initial_constrained())?;
        self.register_observed(name, dist, DistSource::Computed(Rc::new(factory)), data)
    }

    /// Adds a quantity computed from the constrained point.
    pub fn add_deterministic(
        &mut self,
        name: &str,
        f: impl Fn(&Point) -> Result<ArrayD<f64>, DistError> + 'static,
    ) -> Result<(), ModelError> {
        self.claim_name(name)?;
        self.deterministics.push(Deterministic {
            name: name.to_string(),
            f: Rc::new(f),
        });
        Ok(())
    }

    pub fn value_vars(&self) -> Vec<&ValueVar> {
        self.free.iter().map(|var| &var.value).collect()
    }

    pub fn value_var(&self, name: &str) -> Option<&ValueVar> {
        self.free
            .iter()
            .map(|var| &var.value)
            .find(|value| value.name == name)
    }

    pub fn deterministic_names(&self) -> Vec<&str> {
        self.deterministics.iter().map(|d| d.name.as_str()).collect()
    }

    /// Initial values of all value variables.
    pub fn initial_point(&self) -> Result<Point, ModelError> {
        self.free
            .iter()
            .map(|var| -> Result<_, ModelError> {
                let value = match &var.value.transform {
                    Some(transform) => transform.forward(var.initval.view())?,
                    None => var.initval.clone(),
                };
                Ok((var.value.name.clone(), value))
            })
            .collect()
    }

    /// Maps a point of value variables to constrained random variable values.
    pub fn constrain(&self, point: &Point) -> Result<Point, ModelError> {
        self.free
            .iter()
            .map(|var| -> Result<_, ModelError> {
                let value = point
                    .get(&var.value.name)
                    .ok_or_else(|| ModelError::MissingVar(var.value.name.clone()))?;
                let value = match &var.value.transform {
                    Some(transform) => transform.backward(value.view())?,
                    None => value.clone(),
                };
                Ok((var.value.rv_name.clone(), value))
            })
            .collect()
    }

    /// Joint log density at a point of value variables, including the log
    /// Jacobian determinants of all transforms.
    pub fn logp(&self, point: &Point) -> Result<f64, ModelError> {
        let settings: BoundSettings = self.config.into();
        let constrained = self.constrain(point)?;
        let mut logp = 0.;
        for var in self.free.iter() {
            let dist = var.source.resolve(&constrained)?;
            let value = constrained
                .get(&var.value.rv_name)
                .ok_or_else(|| ModelError::MissingVar(var.value.rv_name.clone()))?;
            logp += dist.logp_sum(value.view(), settings)?;
            if let Some(transform) = &var.value.transform {
                let raw = point
                    .get(&var.value.name)
                    .ok_or_else(|| ModelError::MissingVar(var.value.name.clone()))?;
                logp += transform.log_jac_det(raw.view())?;
            }
        }
        for var in self.observed.iter() {
            let dist = var.source.resolve(&constrained)?;
            logp += dist.logp_sum(var.data.view(), settings)?;
        }
        Ok(logp)
    }

    /// Log density function over points of value variables.
    pub fn logp_fn(self: &Rc<Self>) -> PointLogp {
        let model = Rc::clone(self);
        Rc::new(move |point| Ok(model.logp(point)?))
    }

    /// Values of the deterministics at a point of value variables.
    pub fn deterministics(&self, point: &Point) -> Result<Point, ModelError> {
        let constrained = self.constrain(point)?;
        self.deterministics
            .iter()
            .map(|det| -> Result<_, ModelError> {
                Ok((det.name.clone(), (det.f)(&constrained)?))
            })
            .collect()
    }

    /// Draws all free variables and deterministics from the prior, in
    /// registration order. The result is keyed by random variable names.
    pub fn sample_prior<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Point, ModelError> {
        let mut point = Point::new();
        for var in self.free.iter() {
            let dist = var.source.resolve(&point)?;
            let draw = dist.random(rng, &[])?;
            point.insert(var.value.rv_name.clone(), draw);
        }
        for det in self.deterministics.iter() {
            let value = (det.f)(&point)?;
            point.insert(det.name.clone(), value);
        }
        Ok(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multinomial::Dirichlet;
    use crate::mvnormal::MvNormal;
    use crate::quaddist::CovarianceArgs;
    use crate::univariate::{Independent, Univariate};
    use approx::assert_abs_diff_eq;
    use faer::Mat;
    use ndarray::array;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;

    fn model() -> Model {
        let mut model = Model::default();
        model
            .add_free(
                "sd",
                Independent::iid(Univariate::HalfNormal { sigma: 1. }, 2).unwrap(),
                VarOptions::default(),
            )
            .unwrap();
        model
            .add_free(
                "p",
                Dirichlet::new(array![1., 1., 1.].into_dyn()).unwrap(),
                VarOptions::default(),
            )
            .unwrap();
        model
            .add_observed_fn(
                "y",
                |point| {
                    let sd = &point["sd"];
                    let cov = Mat::from_fn(2, 2, |i, j| if i == j { sd[[i]] * sd[[i]] } else { 0. });
                    Ok(MvNormal::new(array![0., 0.].into_dyn(), CovarianceArgs::default().cov(cov))?
                        .into())
                },
                array![[0.5, -0.2], [1., 0.3]].into_dyn(),
            )
            .unwrap();
        model
    }

    #[test]
    fn value_vars_are_transformed() {
        let model = model();
        let names: Vec<&str> = model.value_vars().iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["sd_log__", "p_stickbreaking__"]);
        assert_eq!(model.value_vars()[1].shape, vec![2]);
        assert!(model.value_var("p_stickbreaking__").is_some());
    }

    #[test]
    fn logp_includes_jacobians() {
        let model = model();
        let point = model.initial_point().unwrap();
        let constrained = model.constrain(&point).unwrap();
        let sd = &constrained["sd"];
        assert_abs_diff_eq!(sd[[0]], 1., epsilon = 1e-12);

        let half_normal = Univariate::HalfNormal { sigma: 1. };
        let sd_logp = 2. * half_normal.logp(1.);
        let sd_jac = 0.;
        let p_logp = 2f64.ln();
        let p_jac = Transform::StickBreaking
            .log_jac_det(point["p_stickbreaking__"].view())
            .unwrap();
        let y_logp: f64 = [0.5, -0.2, 1., 0.3]
            .iter()
            .map(|&v| Univariate::Normal { mu: 0., sigma: 1. }.logp(v))
            .sum();
        let expected = sd_logp + sd_jac + p_logp + p_jac + y_logp;
        assert_abs_diff_eq!(model.logp(&point).unwrap(), expected, epsilon = 1e-10);
    }

    #[test]
    fn names_are_unique() {
        let mut model = model();
        let err = model
            .add_deterministic("sd", |point| Ok(point["sd"].clone()))
            .unwrap_err();
        assert_eq!(err, ModelError::DuplicateName("sd".into()));
        let err = model
            .add_free(
                "x",
                Independent::iid(Univariate::Normal { mu: 0., sigma: 1. }, 2).unwrap(),
                VarOptions {
                    initval: Some(array![1., 2., 3.].into_dyn()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ModelError::InitialValue { .. }));
    }

    #[test]
    fn missing_values_are_reported() {
        let model = model();
        let mut point = model.initial_point().unwrap();
        point.remove("sd_log__");
        assert_eq!(
            model.logp(&point).unwrap_err(),
            ModelError::MissingVar("sd_log__".into())
        );
    }

    #[test]
    fn deterministics_and_prior_draws() {
        let mut model = model();
        model
            .add_deterministic("total_sd", |point| {
                Ok(crate::univariate::scalar_array(point["sd"].sum()))
            })
            .unwrap();
        let point = model.initial_point().unwrap();
        let dets = model.deterministics(&point).unwrap();
        assert_abs_diff_eq!(dets["total_sd"][[]], 2., epsilon = 1e-12);

        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(1);
        let prior = model.sample_prior(&mut rng).unwrap();
        assert_eq!(prior["p"].shape(), &[3]);
        assert_abs_diff_eq!(prior["p"].sum(), 1., epsilon = 1e-12);
        assert_abs_diff_eq!(prior["total_sd"][[]], prior["sd"].sum(), epsilon = 1e-12);
    }

    #[test]
    fn disabled_transform_keeps_name() {
        let mut model = Model::new(ModelConfig {
            check_bounds: false,
        });
        let var = model
            .add_free(
                "scale",
                Independent::iid(Univariate::Exponential { lam: 1. }, 1).unwrap(),
                VarOptions {
                    transform: TransformChoice::Disabled,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(var.name, "scale");
        assert_eq!(var.transform, None);
        assert!(!model.config().check_bounds);
    }

    #[test]
    fn hierarchical_free_and_observed_vars() {
        let eye = || CovarianceArgs::default().cov(Mat::identity(2, 2));
        let mut model = Model::default();
        model
            .add_free(
                "mu",
                MvNormal::new(array![0., 0.].into_dyn(), eye()).unwrap(),
                VarOptions::default(),
            )
            .unwrap();
        let x = model
            .add_free_fn(
                "x",
                move |point| Ok(MvNormal::new(point["mu"].clone(), eye())?.into()),
                VarOptions::default(),
            )
            .unwrap();
        assert_eq!(x.name, "x");
        model
            .add_observed(
                "y",
                MvNormal::new(array![0., 0.].into_dyn(), eye()).unwrap(),
                array![1., 1.].into_dyn(),
            )
            .unwrap();

        let ln_2pi = (2. * std::f64::consts::PI).ln();
        let mut point = Point::new();
        point.insert("mu".to_string(), array![0., 0.].into_dyn());
        point.insert("x".to_string(), array![0., 0.].into_dyn());
        assert_abs_diff_eq!(model.logp(&point).unwrap(), -3. * ln_2pi - 1., epsilon = 1e-12);

        point.insert("mu".to_string(), array![1., 0.].into_dyn());
        assert_abs_diff_eq!(model.logp(&point).unwrap(), -3. * ln_2pi - 2., epsilon = 1e-12);
    }
}
