//! Contract for step methods that move a subset of a model's value
//! variables.
//!
//! Step methods see points as maps from names to arrays. The helpers in this
//! module flatten the variables a step method is responsible for into one
//! vector with [`DictToArrayBijection`], call the method's array step and
//! write the result back, leaving all other variables untouched.

use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::Result;
use rand::Rng;
use thiserror::Error;

use crate::blocking::{ArrayFn, DictToArrayBijection, Point, PointLogp, RaveledVars};
use crate::logp_func::{CpuLogpFunc, LogpError, ModelLogpFunc};
use crate::model::{Model, ValueVar};

/// How well a step method can sample a variable. Ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Competence {
    Incompatible = 0,
    Compatible = 1,
    Preferred = 2,
    Ideal = 3,
}

/// Value of a sampler statistic.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleStatValue {
    F64(Vec<f64>),
    U64(Vec<u64>),
    Bool(Vec<bool>),
    ScalarF64(f64),
    ScalarU64(u64),
    ScalarI64(i64),
    ScalarBool(bool),
}

impl From<Vec<f64>> for SampleStatValue {
    fn from(value: Vec<f64>) -> Self {
        SampleStatValue::F64(value)
    }
}
impl From<Vec<u64>> for SampleStatValue {
    fn from(value: Vec<u64>) -> Self {
        SampleStatValue::U64(value)
    }
}
impl From<Vec<bool>> for SampleStatValue {
    fn from(value: Vec<bool>) -> Self {
        SampleStatValue::Bool(value)
    }
}
impl From<f64> for SampleStatValue {
    fn from(value: f64) -> Self {
        SampleStatValue::ScalarF64(value)
    }
}
impl From<u64> for SampleStatValue {
    fn from(value: u64) -> Self {
        SampleStatValue::ScalarU64(value)
    }
}
impl From<i64> for SampleStatValue {
    fn from(value: i64) -> Self {
        SampleStatValue::ScalarI64(value)
    }
}
impl From<bool> for SampleStatValue {
    fn from(value: bool) -> Self {
        SampleStatValue::ScalarBool(value)
    }
}

/// Statistics of one step method for one draw.
pub type StepStats = HashMap<String, SampleStatValue>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StepError {
    #[error("No free random variables to sample.")]
    NoVars,
    #[error("{0} is not a free variable of the model")]
    UnknownVar(String),
    #[error(
        "Population is just {this_chain} + {other_chains:?}. \
         This is too small and the error should have been raised earlier."
    )]
    PopulationTooSmall {
        this_chain: usize,
        other_chains: Vec<usize>,
    },
}

/// A step method that updates a block of value variables.
pub trait BlockedStep {
    /// Names of the value variables this method updates.
    fn vars(&self) -> &[String];

    /// Returns the new point and the statistics of every step method involved,
    /// in order.
    fn step(&mut self, point: &Point) -> Result<(Point, Vec<StepStats>)>;

    /// Ends the tuning phase.
    fn stop_tuning(&mut self) {}
}

/// Step methods that can be assigned to model variables.
pub trait StepMethod: BlockedStep + 'static {
    /// Whether the method updates all its variables jointly by default.
    const DEFAULT_BLOCKED: bool = true;

    fn competence(var: &ValueVar, has_grad: bool) -> Competence;

    fn competences(vars: &[&ValueVar], has_grad: bool) -> Vec<Competence> {
        vars.iter()
            .map(|var| Self::competence(var, has_grad))
            .collect()
    }
}

/// Key of the candidate with the highest competence for `var`.
///
/// Ties go to the earlier candidate. Returns `None` if no candidate is
/// compatible.
pub fn select_by_competence<K: Copy>(
    var: &ValueVar,
    has_grad: bool,
    candidates: &[(K, fn(&ValueVar, bool) -> Competence)],
) -> Option<K> {
    let mut best: Option<(K, Competence)> = None;
    for &(key, competence) in candidates {
        let competence = competence(var, has_grad);
        if competence == Competence::Incompatible {
            continue;
        }
        if best.map_or(true, |(_, current)| competence > current) {
            best = Some((key, competence));
        }
    }
    best.map(|(key, _)| key)
}

/// A log density over points, evaluated on raveled vectors.
pub type RaveledLogp<'a> = ArrayFn<&'a dyn Fn(&Point) -> Result<f64>>;

/// Step methods that work on the raveled values of their variables and
/// evaluate point functions through the bijection.
pub trait ArrayStep {
    fn vars(&self) -> &[String];

    /// Point functions handed to [`ArrayStep::astep`].
    fn fs(&self) -> Vec<PointLogp>;

    /// Whether [`ArrayStep::astep`] also receives the full point.
    fn allvars(&self) -> bool {
        false
    }

    fn astep(
        &mut self,
        apoint: &RaveledVars,
        fs: &[RaveledLogp<'_>],
        point: Option<&Point>,
    ) -> Result<(RaveledVars, Option<StepStats>)>;
}

/// Runs one step of an [`ArrayStep`] on a point.
pub fn array_step<S: ArrayStep + ?Sized>(
    step: &mut S,
    point: &Point,
) -> Result<(Point, Option<StepStats>)> {
    let fs = step.fs();
    let mapped: Vec<RaveledLogp<'_>> = fs
        .iter()
        .map(|f| DictToArrayBijection::mapf(&**f, Some(point.clone())))
        .collect();
    let apoint = DictToArrayBijection::map(point, step.vars())?;
    let full = step.allvars().then_some(point);
    let (apoint_new, stats) = step.astep(&apoint, &mapped, full)?;
    let new_point = DictToArrayBijection::rmap(&apoint_new, Some(point))?;
    Ok((new_point, stats))
}

/// Values of the variables a step method does not update, shared with the
/// functions it evaluates.
#[derive(Debug, Clone, Default)]
pub struct SharedVars(Rc<RefCell<Point>>);

impl SharedVars {
    pub fn set(&self, point: &Point) {
        self.0.borrow_mut().clone_from(point);
    }

    pub fn get(&self) -> Ref<'_, Point> {
        self.0.borrow()
    }

    pub fn snapshot(&self) -> Point {
        self.0.borrow().clone()
    }
}

/// Step methods whose functions read the remaining variables from
/// [`SharedVars`] instead of receiving full points.
pub trait ArrayStepShared {
    fn vars(&self) -> &[String];
    fn shared(&self) -> &SharedVars;
    fn astep(&mut self, q0: &RaveledVars) -> Result<(RaveledVars, Option<StepStats>)>;
}

/// Runs one step of an [`ArrayStepShared`] on a point.
pub fn shared_step<S: ArrayStepShared + ?Sized>(
    step: &mut S,
    point: &Point,
) -> Result<(Point, Option<StepStats>)> {
    step.shared().set(point);
    let q0 = DictToArrayBijection::map(point, step.vars())?;
    let (q, stats) = step.astep(&q0)?;
    let new_point = DictToArrayBijection::rmap(&q, Some(point))?;
    Ok((new_point, stats))
}

/// Read access to the current points of all chains of a population sampler.
///
/// The list is refreshed by the driver between steps and never written by the
/// step method.
#[derive(Debug, Clone, Default)]
pub struct Population {
    population: Option<Rc<RefCell<Vec<Point>>>>,
    this_chain: usize,
    other_chains: Vec<usize>,
}

impl Population {
    pub fn link_population(
        &mut self,
        population: Rc<RefCell<Vec<Point>>>,
        chain_index: usize,
    ) -> Result<(), StepError> {
        let other_chains: Vec<usize> = (0..population.borrow().len())
            .filter(|&chain| chain != chain_index)
            .collect();
        if other_chains.len() <= 1 {
            return Err(StepError::PopulationTooSmall {
                this_chain: chain_index,
                other_chains,
            });
        }
        self.population = Some(population);
        self.this_chain = chain_index;
        self.other_chains = other_chains;
        Ok(())
    }

    pub fn is_linked(&self) -> bool {
        self.population.is_some()
    }

    pub fn this_chain(&self) -> usize {
        self.this_chain
    }

    pub fn other_chains(&self) -> &[usize] {
        &self.other_chains
    }

    pub fn points(&self) -> Option<Ref<'_, Vec<Point>>> {
        self.population.as_ref().map(|population| population.borrow())
    }
}

/// Shared-variable step methods that also look at the other chains.
pub trait PopulationArrayStepShared: ArrayStepShared {
    fn population(&self) -> &Population;
    fn population_mut(&mut self) -> &mut Population;

    fn link_population(
        &mut self,
        population: Rc<RefCell<Vec<Point>>>,
        chain_index: usize,
    ) -> Result<(), StepError> {
        self.population_mut()
            .link_population(population, chain_index)
    }
}

/// Building block for gradient based step methods: the raveled variables
/// together with a joint logp and gradient function over them.
pub struct GradientSharedStep<F: CpuLogpFunc> {
    vars: Vec<String>,
    func: F,
    shared: SharedVars,
    gradient: Vec<f64>,
}

impl<F: CpuLogpFunc> GradientSharedStep<F> {
    pub fn new(vars: Vec<String>, func: F, shared: SharedVars) -> Result<Self, StepError> {
        if vars.is_empty() {
            return Err(StepError::NoVars);
        }
        let gradient = vec![0.; func.dim()];
        Ok(Self {
            vars,
            func,
            shared,
            gradient,
        })
    }

    pub fn vars(&self) -> &[String] {
        &self.vars
    }

    pub fn shared(&self) -> &SharedVars {
        &self.shared
    }

    pub fn dim(&self) -> usize {
        self.gradient.len()
    }

    /// Evaluates logp and gradient at `q`.
    ///
    /// Recoverable errors count as a zero density.
    pub fn logp_dlogp(&mut self, q: &[f64]) -> Result<f64, F::LogpError> {
        match self.func.logp(q, &mut self.gradient) {
            Ok(logp) => Ok(logp),
            Err(err) if err.is_recoverable() => {
                log::debug!("Recoverable logp error: {err}");
                self.gradient.fill(0.);
                Ok(f64::NEG_INFINITY)
            }
            Err(err) => Err(err),
        }
    }

    /// Gradient of the last [`GradientSharedStep::logp_dlogp`] call.
    pub fn gradient(&self) -> &[f64] {
        &self.gradient
    }
}

impl GradientSharedStep<ModelLogpFunc> {
    /// Finite difference gradients of the joint log density of `model`.
    pub fn from_model(model: Rc<Model>, vars: Vec<String>) -> Result<Self> {
        let shared = SharedVars::default();
        let func = ModelLogpFunc::new(model, &vars, shared.clone())?;
        Ok(Self::new(vars, func, shared)?)
    }
}

/// Step methods applied one after the other.
pub struct CompoundStep {
    methods: Vec<Box<dyn BlockedStep>>,
    vars: Vec<String>,
}

impl CompoundStep {
    pub fn new(methods: Vec<Box<dyn BlockedStep>>) -> Self {
        let vars = methods
            .iter()
            .flat_map(|method| method.vars().iter().cloned())
            .collect();
        Self { methods, vars }
    }

    pub fn methods(&self) -> &[Box<dyn BlockedStep>] {
        &self.methods
    }
}

impl BlockedStep for CompoundStep {
    fn vars(&self) -> &[String] {
        &self.vars
    }

    fn step(&mut self, point: &Point) -> Result<(Point, Vec<StepStats>)> {
        let mut point = point.clone();
        let mut stats = Vec::with_capacity(self.methods.len());
        for method in self.methods.iter_mut() {
            let (new_point, method_stats) = method.step(&point)?;
            point = new_point;
            stats.extend(method_stats);
        }
        Ok((point, stats))
    }

    fn stop_tuning(&mut self) {
        for method in self.methods.iter_mut() {
            method.stop_tuning();
        }
    }
}

/// A step method for some of the value variables of a model.
pub enum Step {
    Single(Box<dyn BlockedStep>),
    Compound(CompoundStep),
}

impl Step {
    /// Builds a step method with `factory`.
    ///
    /// `vars` defaults to all value variables of `model`, random variable
    /// names are translated to their value variables. If the method is not
    /// blocked, `factory` is called once per variable and the resulting
    /// methods are combined into a [`CompoundStep`].
    pub fn new<S, F>(
        vars: Option<Vec<String>>,
        model: &Model,
        blocked: Option<bool>,
        mut factory: F,
    ) -> Result<Self>
    where
        S: StepMethod,
        F: FnMut(Vec<String>) -> Result<S>,
    {
        let vars = match vars {
            None => model
                .value_vars()
                .iter()
                .map(|var| var.name.clone())
                .collect(),
            Some(vars) => vars
                .into_iter()
                .map(|name| value_var_name(model, name))
                .collect::<Result<Vec<_>, _>>()?,
        };
        if vars.is_empty() {
            return Err(StepError::NoVars.into());
        }

        let blocked = blocked.unwrap_or(S::DEFAULT_BLOCKED);
        if !blocked && vars.len() > 1 {
            log::debug!(
                "Assigning one {} per variable for {} variables",
                std::any::type_name::<S>(),
                vars.len()
            );
            let methods = vars
                .into_iter()
                .map(|var| -> Result<Box<dyn BlockedStep>> { Ok(Box::new(factory(vec![var])?)) })
                .collect::<Result<Vec<_>>>()?;
            return Ok(Step::Compound(CompoundStep::new(methods)));
        }
        Ok(Step::Single(Box::new(factory(vars)?)))
    }
}

fn value_var_name(model: &Model, name: String) -> Result<String, StepError> {
    if model.value_var(&name).is_some() {
        return Ok(name);
    }
    model
        .value_vars()
        .iter()
        .find(|var| var.rv_name == name)
        .map(|var| var.name.clone())
        .ok_or(StepError::UnknownVar(name))
}

impl BlockedStep for Step {
    fn vars(&self) -> &[String] {
        match self {
            Step::Single(method) => method.vars(),
            Step::Compound(compound) => compound.vars(),
        }
    }

    fn step(&mut self, point: &Point) -> Result<(Point, Vec<StepStats>)> {
        match self {
            Step::Single(method) => method.step(point),
            Step::Compound(compound) => compound.step(point),
        }
    }

    fn stop_tuning(&mut self) {
        match self {
            Step::Single(method) => method.stop_tuning(),
            Step::Compound(compound) => compound.stop_tuning(),
        }
    }
}

/// Metropolis acceptance.
///
/// Accepts `q` with probability `min(1, exp(mr))`. A NaN log ratio always
/// rejects.
pub fn metrop_select<T, R: Rng + ?Sized>(mr: f64, q: T, q0: T, rng: &mut R) -> (T, bool) {
    if !mr.is_nan() && rng.random::<f64>().ln() < mr {
        (q, true)
    } else {
        (q0, false)
    }
}
