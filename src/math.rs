use faer::Mat;
use itertools::izip;
use multiversion::multiversion;
use statrs::function::gamma::ln_gamma;

#[inline]
pub fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

/// `m * ln(x)`, with `0 * ln(0) = 0`.
#[inline]
pub fn logpow(x: f64, m: f64) -> f64 {
    if x == 0. && m == 0. {
        0.
    } else {
        m * x.ln()
    }
}

/// Log factorial, extended to non-integers through the gamma function.
#[inline]
pub fn factln(n: f64) -> f64 {
    ln_gamma(n + 1.)
}

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0. {
        1. / (1. + (-x).exp())
    } else {
        let e = x.exp();
        e / (1. + e)
    }
}

/// Log of the multivariate gamma function of dimension `p`.
pub fn multigammaln(a: f64, p: usize) -> f64 {
    let p_f = p as f64;
    let head = 0.25 * p_f * (p_f - 1.) * std::f64::consts::PI.ln();
    (1..=p).fold(head, |acc, j| acc + ln_gamma(a + (1. - j as f64) / 2.))
}

/// Diagonal of `kron(diag(d_1), ..., diag(d_k))`.
pub fn kron_diag(diags: &[&[f64]]) -> Vec<f64> {
    diags.iter().fold(vec![1.], |acc, diag| {
        acc.iter()
            .flat_map(|&a| diag.iter().map(move |&d| a * d))
            .collect()
    })
}

/// Computes `kron(mats[0], ..., mats[k-1]) @ v` without building the product matrix.
///
/// `v` is interpreted as a row-major tensor with one axis per factor, and each
/// factor is contracted against its own axis.
pub fn kron_dot(mats: &[&Mat<f64>], v: &[f64]) -> Vec<f64> {
    let mut dims: Vec<usize> = mats.iter().map(|m| m.ncols()).collect();
    assert_eq!(dims.iter().product::<usize>(), v.len());

    let mut current = v.to_vec();
    for (axis, mat) in mats.iter().enumerate() {
        let outer: usize = dims[..axis].iter().product();
        let inner: usize = dims[axis + 1..].iter().product();
        let rows = mat.nrows();
        let cols = dims[axis];
        let mut out = vec![0f64; outer * rows * inner];
        for o in 0..outer {
            let src = &current[o * cols * inner..(o + 1) * cols * inner];
            let dst = &mut out[o * rows * inner..(o + 1) * rows * inner];
            for a in 0..rows {
                let dst_row = &mut dst[a * inner..(a + 1) * inner];
                for b in 0..cols {
                    let weight = mat[(a, b)];
                    if weight != 0. {
                        axpy(&src[b * inner..(b + 1) * inner], dst_row, weight);
                    }
                }
            }
        }
        dims[axis] = rows;
        current = out;
    }
    current
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());

    let head_length = a.len() - a.len() % 4;
    let (x, x_tail) = a.split_at(head_length);
    let (y, y_tail) = b.split_at(head_length);

    let mut acc = [0f64; 4];
    izip!(x.chunks_exact(4), y.chunks_exact(4)).for_each(|(x, y)| {
        for i in 0..4 {
            acc[i] += x[i] * y[i];
        }
    });

    let mut result = acc.iter().sum::<f64>();
    for (val1, val2) in x_tail.iter().zip(y_tail) {
        result += *val1 * *val2;
    }
    result
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(y.len() == x.len());

    izip!(x, y).for_each(|(x, y)| {
        *y += a * x;
    });
}

#[inline]
pub(crate) fn sum_of_squares(x: &[f64]) -> f64 {
    vector_dot(x, x)
}
