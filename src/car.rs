//! Conditional autoregressive Gaussians over an adjacency structure.

use std::collections::VecDeque;

use faer::Mat;
use itertools::Itertools;
use ndarray::{Array1, ArrayD, ArrayViewD};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::bound::{bound, BoundSettings, Condition};
use crate::distribution::{DistError, Distribution};
use crate::linalg::{eigvalsh, LinalgError};
use crate::shape::{flat_values, from_flat};

/// Adjacency matrix in compressed sparse row form.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseAdjacency {
    n: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
}

impl SparseAdjacency {
    /// Keeps the non-zero entries of a square matrix.
    pub fn from_dense(w: &Mat<f64>) -> Result<Self, DistError> {
        let n = w.nrows();
        if w.ncols() != n {
            return Err(LinalgError::NotSquare(n, w.ncols()).into());
        }
        let mut row_ptr = Vec::with_capacity(n + 1);
        let mut col_idx = vec![];
        let mut values = vec![];
        row_ptr.push(0);
        for i in 0..n {
            for j in 0..n {
                let v = w[(i, j)];
                if v != 0. {
                    col_idx.push(j);
                    values.push(v);
                }
            }
            row_ptr.push(col_idx.len());
        }
        Ok(Self {
            n,
            row_ptr,
            col_idx,
            values,
        })
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Column indices and weights of row `i`.
    pub fn row(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.row_ptr[i]..self.row_ptr[i + 1];
        self.col_idx[range.clone()]
            .iter()
            .copied()
            .zip(self.values[range].iter().copied())
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        let range = self.row_ptr[i]..self.row_ptr[i + 1];
        match self.col_idx[range.clone()].binary_search(&j) {
            Ok(pos) => self.values[range.start + pos],
            Err(_) => 0.,
        }
    }

    pub fn col_sums(&self) -> Vec<f64> {
        let mut sums = vec![0.; self.n];
        for (j, v) in self.col_idx.iter().zip(self.values.iter()) {
            sums[*j] += v;
        }
        sums
    }

    pub fn matvec(&self, x: &[f64]) -> Vec<f64> {
        (0..self.n)
            .map(|i| self.row(i).map(|(j, v)| v * x[j]).sum())
            .collect()
    }

    fn is_symmetric(&self) -> bool {
        (0..self.n).all(|i| {
            self.row(i).all(|(j, v)| {
                let t = self.get(j, i);
                (v - t).abs() <= 1e-8 + 1e-5 * t.abs()
            })
        })
    }

    fn neighbors(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.row(i).map(|(j, _)| j).filter(move |&j| j != i)
    }
}

/// Reverse Cuthill-McKee ordering of a symmetric sparsity pattern.
///
/// Returns `perm` such that position `k` of the reordered matrix holds the
/// original row `perm[k]`.
pub fn reverse_cuthill_mckee(adj: &SparseAdjacency) -> Vec<usize> {
    let n = adj.dim();
    let degree: Vec<usize> = (0..n).map(|i| adj.neighbors(i).count()).collect();
    let mut visited = vec![false; n];
    let mut order = Vec::with_capacity(n);
    let mut queue = VecDeque::new();

    while order.len() < n {
        let Some(start) = (0..n).filter(|&i| !visited[i]).min_by_key(|&i| degree[i]) else {
            break;
        };
        visited[start] = true;
        queue.push_back(start);
        while let Some(node) = queue.pop_front() {
            order.push(node);
            let next: Vec<usize> = adj
                .neighbors(node)
                .filter(|&j| !visited[j])
                .sorted_by_key(|&j| degree[j])
                .collect();
            for j in next {
                visited[j] = true;
                queue.push_back(j);
            }
        }
    }
    order.reverse();
    order
}

/// Lower Cholesky factor of a symmetric banded matrix.
#[derive(Debug, Clone)]
pub struct BandedCholesky {
    n: usize,
    bandwidth: usize,
    band: Vec<f64>,
}

impl BandedCholesky {
    /// Factors the matrix whose `(i, j)` entry is `entry(i, j)` and which is
    /// zero further than `bandwidth` off the diagonal.
    pub fn factor(
        n: usize,
        bandwidth: usize,
        entry: impl Fn(usize, usize) -> f64,
    ) -> Result<Self, LinalgError> {
        let mut factor = Self {
            n,
            bandwidth,
            band: vec![0.; n * (bandwidth + 1)],
        };
        for i in 0..n {
            let first = i.saturating_sub(bandwidth);
            for j in first..=i {
                let start = first.max(j.saturating_sub(bandwidth));
                let dot: f64 = (start..j).map(|k| factor.get(i, k) * factor.get(j, k)).sum();
                let s = entry(i, j) - dot;
                let value = if i == j {
                    if !(s > 0.) {
                        return Err(LinalgError::NotPositiveDefinite);
                    }
                    s.sqrt()
                } else {
                    s / factor.get(j, j)
                };
                let idx = factor.index(i, j);
                factor.band[idx] = value;
            }
        }
        Ok(factor)
    }

    fn index(&self, i: usize, j: usize) -> usize {
        i * (self.bandwidth + 1) + (j + self.bandwidth - i)
    }

    /// Entry `(i, j)` of the factor for `j <= i`.
    pub fn get(&self, i: usize, j: usize) -> f64 {
        if i - j > self.bandwidth {
            0.
        } else {
            self.band[self.index(i, j)]
        }
    }

    /// Solves `Lᵀ x = z`.
    pub fn solve_upper(&self, z: &[f64]) -> Vec<f64> {
        let mut x = z.to_vec();
        for i in (0..self.n).rev() {
            let end = (i + self.bandwidth + 1).min(self.n);
            let tail: f64 = ((i + 1)..end).map(|k| self.get(k, i) * x[k]).sum();
            x[i] = (x[i] - tail) / self.get(i, i);
        }
        x
    }
}

/// Conditional autoregression, a normal with precision `tau (D - alpha W)`
/// where `D` holds the column sums of the adjacency matrix `W`.
///
/// The log density omits the constant `-N/2 ln 2π + 1/2 Σ ln D_i`.
#[derive(Debug, Clone)]
pub struct Car {
    mu: Vec<f64>,
    w: SparseAdjacency,
    alpha: f64,
    tau: f64,
    d: Vec<f64>,
    lam: Vec<f64>,
}

impl Car {
    pub fn new(mu: ArrayD<f64>, w: &Mat<f64>, alpha: f64, tau: f64) -> Result<Self, DistError> {
        let w = SparseAdjacency::from_dense(w)?;
        if !w.is_symmetric() {
            return Err(DistError::InvalidParameter {
                name: "W",
                reason: "W must be a symmetric adjacency matrix.".into(),
            });
        }
        let n = w.dim();
        let mu = match (mu.ndim(), mu.len()) {
            (0, _) | (1, 1) => vec![flat_values(&mu.view())[0]; n],
            (1, len) if len == n => flat_values(&mu.view()),
            _ => {
                return Err(DistError::ShapeMismatch {
                    left: mu.shape().to_vec(),
                    right: vec![n],
                })
            }
        };

        let d = w.col_sums();
        let d_inv_sqrt: Vec<f64> = d.iter().map(|v| v.sqrt().recip()).collect();
        let dwd = Mat::from_fn(n, n, |i, j| d_inv_sqrt[i] * w.get(i, j) * d_inv_sqrt[j]);
        let lam = eigvalsh(&dwd)?;

        Ok(Self {
            mu,
            w,
            alpha,
            tau,
            d,
            lam,
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn tau(&self) -> f64 {
        self.tau
    }

    /// Column sums of the adjacency matrix.
    pub fn degrees(&self) -> &[f64] {
        &self.d
    }

    fn dim(&self) -> usize {
        self.w.dim()
    }

    fn precision(&self, i: usize, j: usize) -> f64 {
        let diag = if i == j { self.d[i] } else { 0. };
        self.tau * (diag - self.alpha * self.w.get(i, j))
    }

    fn row_logp(&self, x: &[f64], logdet: f64) -> f64 {
        let n = self.dim() as f64;
        let delta: Vec<f64> = x.iter().zip(self.mu.iter()).map(|(x, m)| x - m).collect();
        let w_delta = self.w.matvec(&delta);
        let logquad: f64 = delta
            .iter()
            .zip(self.d.iter())
            .zip(w_delta.iter())
            .map(|((delta, d), wd)| self.tau * delta * (d * delta - self.alpha * wd))
            .sum();
        0.5 * (n * self.tau.ln() + logdet - logquad)
    }
}

impl Distribution for Car {
    fn name(&self) -> &'static str {
        "CAR"
    }

    fn ndim_supp(&self) -> usize {
        1
    }

    fn shape(&self) -> Vec<usize> {
        vec![self.dim()]
    }

    fn logp(
        &self,
        value: ArrayViewD<'_, f64>,
        settings: BoundSettings,
    ) -> Result<ArrayD<f64>, DistError> {
        let n = self.dim();
        if value.ndim() == 0 || value.ndim() > 2 {
            return Err(DistError::Rank {
                name: "value",
                expected: "1 or 2".into(),
                found: value.ndim(),
            });
        }
        if value.shape()[value.ndim() - 1] != n {
            return Err(DistError::ShapeMismatch {
                left: value.shape().to_vec(),
                right: vec![n],
            });
        }
        let logdet: f64 = self
            .lam
            .iter()
            .map(|lam| (1. - self.alpha * lam).ln())
            .sum();
        let values = flat_values(&value);
        let out = values
            .chunks_exact(n)
            .map(|row| self.row_logp(row, logdet))
            .collect();
        let logp = from_flat(&value.shape()[..value.ndim() - 1], out)?;
        let conditions = [
            Condition::Scalar(self.alpha <= 1.),
            Condition::Scalar(self.alpha >= -1.),
            Condition::Scalar(self.tau > 0.),
        ];
        bound(logp, &conditions, true, settings)
    }

    /// Draws through a banded Cholesky factor of the reordered precision
    /// matrix (Rue, 2001).
    fn random<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        size: &[usize],
    ) -> Result<ArrayD<f64>, DistError> {
        let n = self.dim();
        let perm = reverse_cuthill_mckee(&self.w);
        let mut position = vec![0; n];
        for (k, &i) in perm.iter().enumerate() {
            position[i] = k;
        }
        let bandwidth = (0..n)
            .flat_map(|i| self.w.row(i).map(move |(j, _)| (i, j)))
            .map(|(i, j)| position[i].abs_diff(position[j]))
            .max()
            .unwrap_or(0);
        let chol = BandedCholesky::factor(n, bandwidth, |i, j| self.precision(perm[i], perm[j]))
            .map_err(|_| DistError::NotPositiveDefinite("Q"))?;

        let draws: usize = size.iter().product();
        let mut out = Vec::with_capacity(draws * n);
        for _ in 0..draws {
            let z: Vec<f64> = (0..n).map(|_| rng.sample(StandardNormal)).collect();
            let x = chol.solve_upper(&z);
            let mut sample = vec![0.; n];
            for (k, &i) in perm.iter().enumerate() {
                sample[i] = x[k] + self.mu[i];
            }
            out.extend(sample);
        }
        let mut shape = size.to_vec();
        shape.push(n);
        from_flat(&shape, out)
    }

    fn initial_value(&self) -> ArrayD<f64> {
        Array1::from_vec(self.mu.clone()).into_dyn()
    }
}
