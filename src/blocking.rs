//! Flattening of named n-dimensional values into one contiguous vector.

use std::collections::HashMap;
use std::rc::Rc;

use ndarray::{ArrayD, IxDyn};
use thiserror::Error;

/// Values of named variables.
pub type Point = HashMap<String, ArrayD<f64>>;

/// Shared log density function over points.
pub type PointLogp = Rc<dyn Fn(&Point) -> anyhow::Result<f64>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BijectionError {
    #[error("Point has no value for variable {0}")]
    MissingVar(String),
    #[error("Raveled vector has length {found}, variables need {expected}")]
    SizeMismatch { expected: usize, found: usize },
}

/// Location of one variable inside a raveled vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarMapInfo {
    pub name: String,
    pub shape: Vec<usize>,
    pub start: usize,
    pub size: usize,
}

/// A flat vector together with the layout of the variables it holds.
#[derive(Debug, Clone, PartialEq)]
pub struct RaveledVars {
    pub data: Vec<f64>,
    pub point_map_info: Vec<VarMapInfo>,
}

impl RaveledVars {
    /// Same layout with new data.
    pub fn with_data(&self, data: Vec<f64>) -> Self {
        Self {
            data,
            point_map_info: self.point_map_info.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub struct DictToArrayBijection;

impl DictToArrayBijection {
    /// Concatenates the row-major values of `vars` in the given order.
    pub fn map<S: AsRef<str>>(point: &Point, vars: &[S]) -> Result<RaveledVars, BijectionError> {
        let mut data = vec![];
        let mut point_map_info = Vec::with_capacity(vars.len());
        for name in vars {
            let name = name.as_ref();
            let value = point
                .get(name)
                .ok_or_else(|| BijectionError::MissingVar(name.to_string()))?;
            point_map_info.push(VarMapInfo {
                name: name.to_string(),
                shape: value.shape().to_vec(),
                start: data.len(),
                size: value.len(),
            });
            data.extend(value.iter().copied());
        }
        Ok(RaveledVars {
            data,
            point_map_info,
        })
    }

    /// Splits a raveled vector back into its variables.
    ///
    /// Values of `start_point` that are not part of the raveled vector are
    /// copied into the result unchanged.
    pub fn rmap(
        raveled: &RaveledVars,
        start_point: Option<&Point>,
    ) -> Result<Point, BijectionError> {
        let expected: usize = raveled.point_map_info.iter().map(|info| info.size).sum();
        if expected != raveled.data.len() {
            return Err(BijectionError::SizeMismatch {
                expected,
                found: raveled.data.len(),
            });
        }
        let mut point = start_point.cloned().unwrap_or_default();
        for info in raveled.point_map_info.iter() {
            let values = raveled.data[info.start..info.start + info.size].to_vec();
            let value = ArrayD::from_shape_vec(IxDyn(&info.shape), values).map_err(|_| {
                BijectionError::SizeMismatch {
                    expected: info.shape.iter().product(),
                    found: info.size,
                }
            })?;
            point.insert(info.name.clone(), value);
        }
        Ok(point)
    }

    /// Wraps a function of points into a function of raveled vectors.
    pub fn mapf<T, F: Fn(&Point) -> T>(f: F, start_point: Option<Point>) -> ArrayFn<F> {
        ArrayFn { f, start_point }
    }
}

/// A point function evaluated on raveled vectors, see
/// [`DictToArrayBijection::mapf`].
pub struct ArrayFn<F> {
    f: F,
    start_point: Option<Point>,
}

impl<F> ArrayFn<F> {
    pub fn call<T>(&self, raveled: &RaveledVars) -> Result<T, BijectionError>
    where
        F: Fn(&Point) -> T,
    {
        let point = DictToArrayBijection::rmap(raveled, self.start_point.as_ref())?;
        Ok((self.f)(&point))
    }

    pub fn start_point(&self) -> Option<&Point> {
        self.start_point.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr0, array};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn point() -> Point {
        let mut point = Point::new();
        point.insert("a".into(), arr0(1.5).into_dyn());
        point.insert("b".into(), array![1., 2., 3.].into_dyn());
        point.insert("c".into(), array![[1., 2.], [3., 4.], [5., 6.]].into_dyn());
        point
    }

    #[test]
    fn layout_follows_requested_order() {
        let raveled = DictToArrayBijection::map(&point(), &["c", "a"]).unwrap();
        assert_eq!(raveled.data, vec![1., 2., 3., 4., 5., 6., 1.5]);
        assert_eq!(raveled.point_map_info[1].start, 6);
        assert_eq!(raveled.point_map_info[1].shape, Vec::<usize>::new());
        assert_eq!(
            DictToArrayBijection::map(&point(), &["d"]).unwrap_err(),
            BijectionError::MissingVar("d".into())
        );
    }

    #[test]
    fn rmap_keeps_untouched_variables() {
        let start = point();
        let raveled = DictToArrayBijection::map(&start, &["b"]).unwrap();
        let moved = raveled.with_data(vec![7., 8., 9.]);
        let new = DictToArrayBijection::rmap(&moved, Some(&start)).unwrap();
        assert_eq!(new["b"], array![7., 8., 9.].into_dyn());
        assert_eq!(new["c"], start["c"]);
        assert_eq!(new.len(), 3);

        let short = raveled.with_data(vec![1.]);
        assert!(DictToArrayBijection::rmap(&short, None).is_err());
    }

    #[test]
    fn mapped_functions_see_full_points() {
        let start = point();
        let f = DictToArrayBijection::mapf(|p: &Point| p["a"][[]] + p["b"].sum(), Some(start.clone()));
        let raveled = DictToArrayBijection::map(&start, &["b"]).unwrap();
        assert_eq!(f.call(&raveled).unwrap(), 7.5);
        assert_eq!(f.call(&raveled.with_data(vec![0., 0., 0.])).unwrap(), 1.5);
    }

    proptest! {
        #[test]
        fn round_trip_is_exact(
            scalar in any::<f64>(),
            vector in prop::collection::vec(any::<f64>(), 0..6),
            rows in 1usize..4,
            cols in 1usize..4,
            seed in any::<u64>(),
        ) {
            let matrix: Vec<f64> = (0..rows * cols)
                .map(|i| f64::from_bits(seed.wrapping_mul(i as u64 + 1)))
                .collect();
            let mut point = Point::new();
            point.insert("s".into(), arr0(scalar).into_dyn());
            point.insert("v".into(), ndarray::Array1::from_vec(vector).into_dyn());
            point.insert(
                "m".into(),
                ArrayD::from_shape_vec(IxDyn(&[rows, 1, cols]), matrix).unwrap(),
            );
            let raveled = DictToArrayBijection::map(&point, &["m", "s", "v"]).unwrap();
            let back = DictToArrayBijection::rmap(&raveled, None).unwrap();
            for (name, value) in point.iter() {
                let other = &back[name];
                prop_assert_eq!(value.shape(), other.shape());
                let same_bits = value
                    .iter()
                    .zip(other.iter())
                    .all(|(a, b)| a.to_bits() == b.to_bits());
                prop_assert!(same_bits);
            }
        }
    }
}
