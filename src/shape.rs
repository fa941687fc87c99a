use ndarray::{ArrayD, ArrayViewD, IxDyn};

use crate::distribution::DistError;

/// Numpy style broadcasting of two shapes, aligned from the right.
pub(crate) fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let ndim = a.len().max(b.len());
    let mut out = vec![0; ndim];
    for i in 0..ndim {
        let da = if i < ndim - a.len() { 1 } else { a[i - (ndim - a.len())] };
        let db = if i < ndim - b.len() { 1 } else { b[i - (ndim - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

pub(crate) fn broadcast_all<'a>(
    shapes: impl IntoIterator<Item = &'a [usize]>,
) -> Result<Vec<usize>, DistError> {
    shapes.into_iter().try_fold(vec![], |acc, shape| {
        broadcast_shapes(&acc, shape).ok_or_else(|| DistError::ShapeMismatch {
            left: acc.clone(),
            right: shape.to_vec(),
        })
    })
}

/// Maps flat indices of a broadcast output onto flat indices of one operand.
#[derive(Debug, Clone)]
pub(crate) struct BroadcastIndex {
    out_shape: Vec<usize>,
    strides: Vec<usize>,
}

impl BroadcastIndex {
    pub(crate) fn new(shape: &[usize], out_shape: &[usize]) -> Result<Self, DistError> {
        let mismatch = || DistError::ShapeMismatch {
            left: shape.to_vec(),
            right: out_shape.to_vec(),
        };
        if shape.len() > out_shape.len() {
            return Err(mismatch());
        }
        let offset = out_shape.len() - shape.len();
        let mut strides = vec![0; out_shape.len()];
        let mut stride = 1;
        for i in (0..shape.len()).rev() {
            let out_dim = out_shape[offset + i];
            if shape[i] == out_dim {
                strides[offset + i] = stride;
            } else if shape[i] != 1 {
                return Err(mismatch());
            }
            stride *= shape[i];
        }
        Ok(Self {
            out_shape: out_shape.to_vec(),
            strides,
        })
    }

    pub(crate) fn index(&self, flat: usize) -> usize {
        let mut rest = flat;
        let mut idx = 0;
        for (dim, stride) in self.out_shape.iter().zip(self.strides.iter()).rev() {
            idx += (rest % dim) * stride;
            rest /= dim;
        }
        idx
    }
}

/// Splits a shape into its batch part and its trailing `event_ndim` dimensions.
pub(crate) fn split_event<'a>(
    shape: &'a [usize],
    event_ndim: usize,
) -> Result<(&'a [usize], &'a [usize]), DistError> {
    if shape.len() < event_ndim {
        return Err(DistError::Rank {
            name: "value",
            expected: format!("at least {event_ndim}"),
            found: shape.len(),
        });
    }
    Ok(shape.split_at(shape.len() - event_ndim))
}

/// Values in logical row-major order, independent of memory layout.
pub(crate) fn flat_values(a: &ArrayViewD<'_, f64>) -> Vec<f64> {
    a.iter().copied().collect()
}

pub(crate) fn from_flat(shape: &[usize], data: Vec<f64>) -> Result<ArrayD<f64>, DistError> {
    let len = data.len();
    ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| DistError::ShapeMismatch {
        left: shape.to_vec(),
        right: vec![len],
    })
}

/// Batched operand with rows of `event_size` values that broadcast against an
/// output batch shape.
pub(crate) struct Lanes {
    data: Vec<f64>,
    event_size: usize,
    index: BroadcastIndex,
}

impl Lanes {
    pub(crate) fn new(
        array: &ArrayViewD<'_, f64>,
        event_ndim: usize,
        out_batch: &[usize],
    ) -> Result<Self, DistError> {
        let (batch, event) = split_event(array.shape(), event_ndim)?;
        Ok(Self {
            data: flat_values(array),
            event_size: event.iter().product(),
            index: BroadcastIndex::new(batch, out_batch)?,
        })
    }

    pub(crate) fn lane(&self, out_flat: usize) -> &[f64] {
        let start = self.index.index(out_flat) * self.event_size;
        &self.data[start..start + self.event_size]
    }

    pub(crate) fn scalar(&self, out_flat: usize) -> f64 {
        self.lane(out_flat)[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    #[test]
    fn broadcasting_rules() {
        assert_eq!(broadcast_shapes(&[3, 1], &[4]), Some(vec![3, 4]));
        assert_eq!(broadcast_shapes(&[], &[2, 2]), Some(vec![2, 2]));
        assert_eq!(broadcast_shapes(&[3], &[4]), None);
    }

    #[test]
    fn lanes_follow_broadcasting() {
        let mu = array![[1., 2.], [3., 4.]].into_dyn();
        let lanes = Lanes::new(&mu.view(), 1, &[3, 2]).unwrap();
        assert_eq!(lanes.lane(0), &[1., 2.]);
        assert_eq!(lanes.lane(1), &[3., 4.]);
        assert_eq!(lanes.lane(5), &[3., 4.]);

        let scalar = array![5.].into_dyn();
        let lanes = Lanes::new(&scalar.view(), 1, &[2, 2]).unwrap();
        assert_eq!(lanes.lane(3), &[5.]);
        assert!(Lanes::new(&mu.view(), 1, &[3]).is_err());
    }
}
