use std::fmt::Display;

use ndarray::{ArrayD, ArrayViewD};
use rand::Rng;
use thiserror::Error;

use crate::bound::BoundSettings;
use crate::car::Car;
use crate::kronecker::KroneckerNormal;
use crate::linalg::LinalgError;
use crate::lkj::{LkjCholeskyCov, LkjCorr};
use crate::matrix_normal::MatrixNormal;
use crate::model::VarOptions;
use crate::multinomial::{Dirichlet, DirichletMultinomial, Multinomial, OrderedMultinomial};
use crate::mvnormal::{MvNormal, MvStudentT};
use crate::transforms::Transform;
use crate::univariate::Independent;
use crate::wishart::Wishart;

#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum DistError {
    #[error("Incompatible parameterization. {0}")]
    Parameterization(String),
    #[error("{name} must have {expected} dimensions, got {found}")]
    Rank {
        name: &'static str,
        expected: String,
        found: usize,
    },
    #[error("shapes {left:?} and {right:?} are not compatible")]
    ShapeMismatch { left: Vec<usize>, right: Vec<usize> },
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("{0} is not positive definite")]
    NotPositiveDefinite(&'static str),
    #[error("{0}")]
    Unsupported(String),
    #[error("Could not draw random values: {0}")]
    Sampling(String),
    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] LinalgError),
}

pub(crate) fn sampling_error(err: impl Display) -> DistError {
    DistError::Sampling(err.to_string())
}

/// Shared interface of all distribution components.
///
/// A distribution holds fixed numeric parameters. Its draws have shape
/// `self.shape()`, the last `ndim_supp` dimensions of which form one event;
/// any leading dimensions come from batched parameters. `logp` reduces the
/// event dimensions and returns one value per batch element.
pub trait Distribution {
    fn name(&self) -> &'static str;

    fn ndim_supp(&self) -> usize;

    fn shape(&self) -> Vec<usize>;

    fn logp(
        &self,
        value: ArrayViewD<'_, f64>,
        settings: BoundSettings,
    ) -> Result<ArrayD<f64>, DistError>;

    fn logcdf(
        &self,
        _value: ArrayViewD<'_, f64>,
        _settings: BoundSettings,
    ) -> Result<ArrayD<f64>, DistError> {
        Err(DistError::Unsupported(format!(
            "{} does not define a log CDF",
            self.name()
        )))
    }

    /// Draws values of shape `size ++ self.shape()`.
    fn random<R: Rng + ?Sized>(&self, rng: &mut R, size: &[usize])
        -> Result<ArrayD<f64>, DistError>;

    /// A point in the support, used as starting value in models.
    fn initial_value(&self) -> ArrayD<f64>;

    fn default_transform(&self) -> Option<Transform> {
        None
    }

    fn is_discrete(&self) -> bool {
        false
    }

    /// Checks and normalizes the options a model variable is registered with.
    fn validate_options(&self, options: &mut VarOptions) -> Result<(), DistError> {
        if options.size.as_ref().is_some_and(|size| !size.is_empty()) {
            return Err(DistError::Unsupported(format!(
                "{} does not support a size argument, use batched parameters instead",
                self.name()
            )));
        }
        if let Some(shape) = &options.shape {
            let expected = self.shape();
            if shape != &expected {
                return Err(DistError::ShapeMismatch {
                    left: shape.clone(),
                    right: expected,
                });
            }
        }
        Ok(())
    }

    fn logp_sum(&self, value: ArrayViewD<'_, f64>, settings: BoundSettings) -> Result<f64, DistError> {
        Ok(self.logp(value, settings)?.sum())
    }
}

/// Closed set of the distributions in this crate.
#[derive(Debug, Clone)]
pub enum MvDist {
    MvNormal(MvNormal),
    MvStudentT(MvStudentT),
    Dirichlet(Dirichlet),
    Multinomial(Multinomial),
    DirichletMultinomial(DirichletMultinomial),
    OrderedMultinomial(OrderedMultinomial),
    Wishart(Wishart),
    LkjCholeskyCov(LkjCholeskyCov),
    LkjCorr(LkjCorr),
    MatrixNormal(MatrixNormal),
    KroneckerNormal(KroneckerNormal),
    Car(Car),
    Independent(Independent),
}

macro_rules! dispatch {
    ($self:expr, $dist:ident => $body:expr) => {
        match $self {
            MvDist::MvNormal($dist) => $body,
            MvDist::MvStudentT($dist) => $body,
            MvDist::Dirichlet($dist) => $body,
            MvDist::Multinomial($dist) => $body,
            MvDist::DirichletMultinomial($dist) => $body,
            MvDist::OrderedMultinomial($dist) => $body,
            MvDist::Wishart($dist) => $body,
            MvDist::LkjCholeskyCov($dist) => $body,
            MvDist::LkjCorr($dist) => $body,
            MvDist::MatrixNormal($dist) => $body,
            MvDist::KroneckerNormal($dist) => $body,
            MvDist::Car($dist) => $body,
            MvDist::Independent($dist) => $body,
        }
    };
}

macro_rules! impl_from {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for MvDist {
                fn from(dist: $variant) -> Self {
                    MvDist::$variant(dist)
                }
            }
        )*
    };
}

impl_from!(
    MvNormal,
    MvStudentT,
    Dirichlet,
    Multinomial,
    DirichletMultinomial,
    OrderedMultinomial,
    Wishart,
    LkjCholeskyCov,
    LkjCorr,
    MatrixNormal,
    KroneckerNormal,
    Car,
    Independent
);

impl Distribution for MvDist {
    fn name(&self) -> &'static str {
        dispatch!(self, d => d.name())
    }

    fn ndim_supp(&self) -> usize {
        dispatch!(self, d => d.ndim_supp())
    }

    fn shape(&self) -> Vec<usize> {
        dispatch!(self, d => d.shape())
    }

    fn logp(
        &self,
        value: ArrayViewD<'_, f64>,
        settings: BoundSettings,
    ) -> Result<ArrayD<f64>, DistError> {
        dispatch!(self, d => d.logp(value, settings))
    }

    fn logcdf(
        &self,
        value: ArrayViewD<'_, f64>,
        settings: BoundSettings,
    ) -> Result<ArrayD<f64>, DistError> {
        dispatch!(self, d => d.logcdf(value, settings))
    }

    fn random<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        size: &[usize],
    ) -> Result<ArrayD<f64>, DistError> {
        dispatch!(self, d => d.random(rng, size))
    }

    fn initial_value(&self) -> ArrayD<f64> {
        dispatch!(self, d => d.initial_value())
    }

    fn default_transform(&self) -> Option<Transform> {
        dispatch!(self, d => d.default_transform())
    }

    fn is_discrete(&self) -> bool {
        dispatch!(self, d => d.is_discrete())
    }

    fn validate_options(&self, options: &mut VarOptions) -> Result<(), DistError> {
        dispatch!(self, d => d.validate_options(options))
    }
}
