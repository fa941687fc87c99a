//! Bijections between constrained values and unconstrained space.

use faer::Mat;
use ndarray::{ArrayD, ArrayViewD};

use crate::distribution::DistError;
use crate::math::logaddexp;
use crate::shape::{flat_values, from_flat, split_event};

/// Positions of the diagonal in a row-major packed lower triangle.
pub fn packed_diag_indices(n: usize) -> Vec<usize> {
    (1..=n).scan(0, |acc, i| {
        *acc += i;
        Some(*acc - 1)
    })
    .collect()
}

pub fn packed_len(n: usize) -> usize {
    n * (n + 1) / 2
}

/// Dimension of the matrix that a packed triangle of length `len` describes.
pub fn packed_dim(len: usize) -> Option<usize> {
    let n = (((8 * len + 1) as f64).sqrt() as usize).saturating_sub(1) / 2;
    (packed_len(n) == len).then_some(n)
}

/// Builds a triangular matrix from its packed row-major entries.
pub fn expand_packed_triangular(n: usize, packed: &[f64], lower: bool) -> Result<Mat<f64>, DistError> {
    if packed.len() != packed_len(n) {
        return Err(DistError::ShapeMismatch {
            left: vec![packed.len()],
            right: vec![packed_len(n)],
        });
    }
    let mut out = Mat::<f64>::zeros(n, n);
    let mut idx = 0;
    for i in 0..n {
        if lower {
            for j in 0..=i {
                out[(i, j)] = packed[idx];
                idx += 1;
            }
        } else {
            for j in i..n {
                out[(i, j)] = packed[idx];
                idx += 1;
            }
        }
    }
    Ok(out)
}

pub fn pack_lower_triangular(mat: &Mat<f64>) -> Vec<f64> {
    (0..mat.nrows())
        .flat_map(|i| (0..=i).map(move |j| (i, j)))
        .map(|(i, j)| mat[(i, j)])
        .collect()
}

#[inline]
fn softplus(x: f64) -> f64 {
    if x > 0. {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// Simplex to `K - 1` unconstrained coordinates along the last axis.
    StickBreaking,
    /// Packed Cholesky factor of an `n x n` matrix with log-transformed diagonal.
    CholeskyCovPacked { n: usize },
    Interval { lower: f64, upper: f64 },
    Log,
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Transform::StickBreaking => "stickbreaking",
            Transform::CholeskyCovPacked { .. } => "cholesky-cov-packed",
            Transform::Interval { .. } => "interval",
            Transform::Log => "log",
        }
    }

    pub fn unconstrained_shape(&self, shape: &[usize]) -> Vec<usize> {
        let mut shape = shape.to_vec();
        if let (Transform::StickBreaking, Some(last)) = (self, shape.last_mut()) {
            *last = last.saturating_sub(1);
        }
        shape
    }

    fn lanes<'a>(
        &self,
        shape: &'a [usize],
        constrained: bool,
    ) -> Result<(&'a [usize], usize), DistError> {
        let (batch, event) = split_event(shape, 1)?;
        let len = event[0];
        match self {
            Transform::CholeskyCovPacked { n } if len != packed_len(*n) => {
                Err(DistError::ShapeMismatch {
                    left: shape.to_vec(),
                    right: vec![packed_len(*n)],
                })
            }
            Transform::StickBreaking if constrained && len < 2 => Err(DistError::ShapeMismatch {
                left: shape.to_vec(),
                right: vec![2],
            }),
            _ => Ok((batch, len)),
        }
    }

    /// Maps a constrained value to unconstrained space.
    pub fn forward(&self, x: ArrayViewD<'_, f64>) -> Result<ArrayD<f64>, DistError> {
        let values = flat_values(&x);
        match self {
            Transform::Log => from_flat(x.shape(), values.iter().map(|v| v.ln()).collect()),
            Transform::Interval { lower, upper } => from_flat(
                x.shape(),
                values
                    .iter()
                    .map(|&v| (v - lower).ln() - (upper - v).ln())
                    .collect(),
            ),
            Transform::CholeskyCovPacked { n } => {
                let (_, len) = self.lanes(x.shape(), true)?;
                let diag = packed_diag_indices(*n);
                let mut out = values;
                for lane in out.chunks_exact_mut(len) {
                    for &d in diag.iter() {
                        lane[d] = lane[d].ln();
                    }
                }
                from_flat(x.shape(), out)
            }
            Transform::StickBreaking => {
                let (_, k) = self.lanes(x.shape(), true)?;
                let mut out = Vec::with_capacity(values.len() / k * (k - 1));
                for lane in values.chunks_exact(k) {
                    let logs: Vec<f64> = lane.iter().map(|v| v.ln()).collect();
                    let shift = logs.iter().sum::<f64>() / k as f64;
                    out.extend(logs[..k - 1].iter().map(|l| l - shift));
                }
                from_flat(&self.unconstrained_shape(x.shape()), out)
            }
        }
    }

    /// Maps an unconstrained value back to the support.
    pub fn backward(&self, y: ArrayViewD<'_, f64>) -> Result<ArrayD<f64>, DistError> {
        let values = flat_values(&y);
        match self {
            Transform::Log => from_flat(y.shape(), values.iter().map(|v| v.exp()).collect()),
            Transform::Interval { lower, upper } => from_flat(
                y.shape(),
                values
                    .iter()
                    .map(|&v| (upper - lower) * crate::math::sigmoid(v) + lower)
                    .collect(),
            ),
            Transform::CholeskyCovPacked { n } => {
                let (_, len) = self.lanes(y.shape(), false)?;
                let diag = packed_diag_indices(*n);
                let mut out = values;
                for lane in out.chunks_exact_mut(len) {
                    for &d in diag.iter() {
                        lane[d] = lane[d].exp();
                    }
                }
                from_flat(y.shape(), out)
            }
            Transform::StickBreaking => {
                let (batch, km1) = self.lanes(y.shape(), false)?;
                let k = km1 + 1;
                let mut out = Vec::with_capacity(values.len() / km1.max(1) * k);
                let lanes = if km1 == 0 {
                    vec![&values[..0]; batch.iter().product()]
                } else {
                    values.chunks_exact(km1).collect()
                };
                for lane in lanes {
                    let mut full = lane.to_vec();
                    full.push(-lane.iter().sum::<f64>());
                    let max = full.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    let exps: Vec<f64> = full.iter().map(|v| (v - max).exp()).collect();
                    let total: f64 = exps.iter().sum();
                    out.extend(exps.iter().map(|e| e / total));
                }
                let mut shape = batch.to_vec();
                shape.push(k);
                from_flat(&shape, out)
            }
        }
    }

    /// Log absolute determinant of the Jacobian of `backward`, summed over
    /// all elements of `y`.
    pub fn log_jac_det(&self, y: ArrayViewD<'_, f64>) -> Result<f64, DistError> {
        let values = flat_values(&y);
        match self {
            Transform::Log => Ok(values.iter().sum()),
            Transform::Interval { lower, upper } => {
                let log_width = (upper - lower).ln();
                Ok(values
                    .iter()
                    .map(|&v| log_width - softplus(-v) - softplus(v))
                    .sum())
            }
            Transform::CholeskyCovPacked { n } => {
                let (_, len) = self.lanes(y.shape(), false)?;
                let diag = packed_diag_indices(*n);
                Ok(values
                    .chunks_exact(len)
                    .map(|lane| diag.iter().map(|&d| lane[d]).sum::<f64>())
                    .sum())
            }
            Transform::StickBreaking => {
                let (_, km1) = self.lanes(y.shape(), false)?;
                if km1 == 0 {
                    return Ok(0.);
                }
                let k = (km1 + 1) as f64;
                Ok(values
                    .chunks_exact(km1)
                    .map(|lane| {
                        let sy: f64 = lane.iter().sum();
                        let sr = lane
                            .iter()
                            .map(|v| v + sy)
                            .fold(0f64, logaddexp);
                        k.ln() + k * sy - k * sr
                    })
                    .sum())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    #[test]
    fn packed_diagonal_of_three() {
        assert_eq!(packed_diag_indices(3), vec![0, 2, 5]);
        assert_eq!(packed_dim(6), Some(3));
        assert_eq!(packed_dim(5), None);
    }

    #[test]
    fn packed_round_trip() {
        let packed = [1.5, 0.3, 2., -0.7, 0.1, 0.9];
        let chol = expand_packed_triangular(3, &packed, true).unwrap();
        assert_eq!(chol[(1, 0)], 0.3);
        assert_eq!(chol[(0, 1)], 0.);
        assert_eq!(chol[(2, 2)], 0.9);
        assert_eq!(pack_lower_triangular(&chol), packed.to_vec());

        let upper = expand_packed_triangular(3, &packed, false).unwrap();
        assert_eq!(upper[(0, 2)], 2.);
        assert_eq!(upper[(1, 1)], -0.7);

        let transform = Transform::CholeskyCovPacked { n: 3 };
        let x = ndarray::Array1::from_vec(packed.to_vec()).into_dyn();
        let y = transform.forward(x.view()).unwrap();
        assert_eq!(y[[1]], 0.3);
        assert_abs_diff_eq!(y[[0]], 1.5f64.ln(), epsilon = 1e-15);
        let back = transform.backward(y.view()).unwrap();
        for (a, b) in back.iter().zip(x.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-14);
        }
        let jac = transform.log_jac_det(y.view()).unwrap();
        assert_abs_diff_eq!(jac, (1.5f64 * 2. * 0.9).ln(), epsilon = 1e-14);
    }

    #[test]
    fn stick_breaking_round_trip() {
        let x = array![[0.2, 0.3, 0.5], [0.1, 0.1, 0.8]].into_dyn();
        let transform = Transform::StickBreaking;
        let y = transform.forward(x.view()).unwrap();
        assert_eq!(y.shape(), &[2, 2]);
        let back = transform.backward(y.view()).unwrap();
        for (a, b) in back.iter().zip(x.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-14);
        }
    }

    #[test]
    fn stick_breaking_jacobian_two_categories() {
        // With two categories the first coordinate is sigmoid(2y).
        let y = array![0.4].into_dyn();
        let s = crate::math::sigmoid(0.8);
        let expected = (2. * s * (1. - s)).ln();
        let jac = Transform::StickBreaking.log_jac_det(y.view()).unwrap();
        assert_abs_diff_eq!(jac, expected, epsilon = 1e-12);
    }

    #[test]
    fn interval_matches_numerical_derivative() {
        let transform = Transform::Interval {
            lower: -1.,
            upper: 1.,
        };
        let y = 0.7;
        let h = 1e-6;
        let f = |v: f64| transform.backward(array![v].into_dyn().view()).unwrap()[[0]];
        let numeric = ((f(y + h) - f(y - h)) / (2. * h)).ln();
        let jac = transform.log_jac_det(array![y].into_dyn().view()).unwrap();
        assert_abs_diff_eq!(jac, numeric, epsilon = 1e-6);
        let x = transform.forward(array![f(y)].into_dyn().view()).unwrap();
        assert_abs_diff_eq!(x[[0]], y, epsilon = 1e-12);
    }
}
