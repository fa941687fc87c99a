use std::error::Error;
use std::fmt::Debug;
use std::rc::Rc;

use thiserror::Error;

use crate::blocking::{BijectionError, DictToArrayBijection, RaveledVars, VarMapInfo};
use crate::model::{Model, ModelError};
use crate::step::SharedVars;

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: Error {
    /// Unrecoverable errors stop sampling, recoverable errors are seen as
    /// rejected proposals.
    fn is_recoverable(&self) -> bool;
}

/// A log density with gradient over a flat parameter vector.
pub trait CpuLogpFunc {
    type LogpError: Debug + Send + Sync + Error + LogpError + 'static;

    fn dim(&self) -> usize;
    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError>;
}

#[derive(Error, Debug)]
pub enum ModelLogpError {
    #[error("Could not evaluate model: {0}")]
    Model(#[from] ModelError),
    #[error("Could not unflatten position: {0}")]
    Bijection(#[from] BijectionError),
}

impl LogpError for ModelLogpError {
    fn is_recoverable(&self) -> bool {
        false
    }
}

/// Joint log density of a model as a function of some of its value
/// variables, with central finite difference gradients.
///
/// Variables that are not part of the position are read from the shared
/// point, which step methods update before every step.
pub struct ModelLogpFunc {
    model: Rc<Model>,
    layout: RaveledVars,
    shared: SharedVars,
}

impl ModelLogpFunc {
    pub fn new(model: Rc<Model>, vars: &[String], shared: SharedVars) -> Result<Self, ModelError> {
        let mut start = 0;
        let mut point_map_info = Vec::with_capacity(vars.len());
        for name in vars {
            let var = model
                .value_var(name)
                .ok_or_else(|| ModelError::MissingVar(name.clone()))?;
            point_map_info.push(VarMapInfo {
                name: name.clone(),
                shape: var.shape.clone(),
                start,
                size: var.size(),
            });
            start += var.size();
        }
        Ok(Self {
            model,
            layout: RaveledVars {
                data: vec![0.; start],
                point_map_info,
            },
            shared,
        })
    }

    pub fn shared(&self) -> &SharedVars {
        &self.shared
    }

    fn eval(&self, position: &[f64]) -> Result<f64, ModelLogpError> {
        let start = self.shared.snapshot();
        let point =
            DictToArrayBijection::rmap(&self.layout.with_data(position.to_vec()), Some(&start))?;
        Ok(self.model.logp(&point)?)
    }
}

impl CpuLogpFunc for ModelLogpFunc {
    type LogpError = ModelLogpError;

    fn dim(&self) -> usize {
        self.layout.len()
    }

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError> {
        let logp = self.eval(position)?;
        if !logp.is_finite() {
            gradient.fill(0.);
            return Ok(logp);
        }
        let mut x = position.to_vec();
        for (i, grad) in gradient.iter_mut().enumerate() {
            let orig = x[i];
            let h = 1e-6 * orig.abs().max(1.);
            x[i] = orig + h;
            let up = self.eval(&x)?;
            x[i] = orig - h;
            let down = self.eval(&x)?;
            x[i] = orig;
            *grad = (up - down) / (2. * h);
        }
        Ok(logp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VarOptions;
    use crate::mvnormal::MvNormal;
    use crate::quaddist::CovarianceArgs;
    use approx::assert_abs_diff_eq;
    use faer::Mat;
    use ndarray::array;

    #[test]
    fn gradient_of_standard_normal() {
        let mut model = Model::default();
        model
            .add_free(
                "x",
                MvNormal::new(
                    array![0., 0.].into_dyn(),
                    CovarianceArgs::default().cov(Mat::identity(2, 2)),
                )
                .unwrap(),
                VarOptions::default(),
            )
            .unwrap();
        let model = Rc::new(model);
        let shared = SharedVars::default();
        shared.set(&model.initial_point().unwrap());
        let mut func = ModelLogpFunc::new(model, &["x".to_string()], shared).unwrap();
        assert_eq!(func.dim(), 2);
        let mut grad = [0.; 2];
        let logp = func.logp(&[0.5, -1.], &mut grad).unwrap();
        assert_abs_diff_eq!(logp, -(2. * std::f64::consts::PI).ln() - 0.625, epsilon = 1e-12);
        assert_abs_diff_eq!(grad[0], -0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(grad[1], 1., epsilon = 1e-6);
    }

    #[test]
    fn unknown_variables_are_rejected() {
        let model = Rc::new(Model::default());
        let err = ModelLogpFunc::new(model, &["y".to_string()], SharedVars::default());
        assert!(err.is_err());
    }
}
