use ndarray::{ArrayD, IxDyn};

use crate::distribution::DistError;
use crate::shape::broadcast_shapes;

/// Settings for constraint checking in log densities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundSettings {
    /// When false, `bound` returns the log density unchanged.
    pub check_bounds: bool,
}

impl Default for BoundSettings {
    fn default() -> Self {
        Self { check_bounds: true }
    }
}

/// A support condition of a log density.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Scalar(bool),
    Elementwise(ArrayD<bool>),
}

impl Condition {
    pub fn all(&self) -> bool {
        match self {
            Condition::Scalar(val) => *val,
            Condition::Elementwise(mask) => mask.iter().all(|&v| v),
        }
    }

    fn shape(&self) -> &[usize] {
        match self {
            Condition::Scalar(_) => &[],
            Condition::Elementwise(mask) => mask.shape(),
        }
    }
}

impl From<bool> for Condition {
    fn from(val: bool) -> Self {
        Condition::Scalar(val)
    }
}

impl From<ArrayD<bool>> for Condition {
    fn from(val: ArrayD<bool>) -> Self {
        Condition::Elementwise(val)
    }
}

/// Bounds a log density to the region where all `conditions` hold.
///
/// With `broadcast_conditions` every condition is applied elementwise and the
/// result has the broadcast shape of `logp` and the conditions. Otherwise the
/// conditions are reduced to a single truth value first and the whole result is
/// `-inf` as soon as one element is violated.
pub fn bound(
    logp: ArrayD<f64>,
    conditions: &[Condition],
    broadcast_conditions: bool,
    settings: BoundSettings,
) -> Result<ArrayD<f64>, DistError> {
    if !settings.check_bounds {
        return Ok(logp);
    }

    if !broadcast_conditions {
        if conditions.iter().all(Condition::all) {
            return Ok(logp);
        }
        return Ok(ArrayD::from_elem(logp.raw_dim(), f64::NEG_INFINITY));
    }

    let mut out_shape = logp.shape().to_vec();
    for cond in conditions {
        out_shape = broadcast_shapes(&out_shape, cond.shape()).ok_or_else(|| {
            DistError::ShapeMismatch {
                left: out_shape.clone(),
                right: cond.shape().to_vec(),
            }
        })?;
    }

    let mut out = logp
        .broadcast(IxDyn(&out_shape))
        .ok_or_else(|| DistError::ShapeMismatch {
            left: logp.shape().to_vec(),
            right: out_shape.clone(),
        })?
        .to_owned();
    for cond in conditions {
        match cond {
            Condition::Scalar(true) => {}
            Condition::Scalar(false) => out.fill(f64::NEG_INFINITY),
            Condition::Elementwise(mask) => {
                let mask = mask
                    .broadcast(IxDyn(&out_shape))
                    .ok_or_else(|| DistError::ShapeMismatch {
                        left: mask.shape().to_vec(),
                        right: out_shape.clone(),
                    })?;
                out.zip_mut_with(&mask, |val, &ok| {
                    if !ok {
                        *val = f64::NEG_INFINITY;
                    }
                });
            }
        }
    }
    Ok(out)
}

/// Scalar shortcut for densities that evaluate to a single number.
pub fn bound_scalar(logp: f64, conditions: &[bool], settings: BoundSettings) -> f64 {
    if !settings.check_bounds || conditions.iter().all(|&c| c) {
        logp
    } else {
        f64::NEG_INFINITY
    }
}
