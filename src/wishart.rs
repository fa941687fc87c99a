use std::f64::consts::LN_2;

use faer::Mat;
use ndarray::{Array1, ArrayD, ArrayViewD};
use rand::Rng;
use rand_distr::{ChiSquared, Distribution as _, StandardNormal};

use crate::bound::{bound, BoundSettings, Condition};
use crate::distribution::{sampling_error, DistError, Distribution};
use crate::linalg::{
    array_to_mat, det, is_symmetric, mat_to_array, matmul, matrix_inverse,
    matrix_pos_def, solve_lower, trace, transpose, try_cholesky,
};
use crate::math::multigammaln;
use crate::model::{Model, ModelError, VarOptions};
use crate::shape::from_flat;
use crate::univariate::{scalar_array, Independent, Univariate};

/// Wishart distribution over positive definite `p x p` matrices.
///
/// The density has a very narrow region of support, gradient based samplers
/// do not work well with it. `wishart_bartlett` gives an equivalent
/// parameterization in unconstrained variables.
#[derive(Debug, Clone)]
pub struct Wishart {
    nu: f64,
    v: Mat<f64>,
    v_inv: Mat<f64>,
}

impl Wishart {
    pub fn new(nu: f64, v: Mat<f64>) -> Result<Self, DistError> {
        if v.nrows() != v.ncols() {
            return Err(DistError::InvalidParameter {
                name: "V",
                reason: format!("must be a square matrix, got {}x{}", v.nrows(), v.ncols()),
            });
        }
        log::warn!(
            "The Wishart distribution can currently not be used for MCMC sampling. The \
             probability of sampling a symmetric matrix is basically zero. Instead, please \
             use the Cholesky decomposition (e.g. lkj_cholesky_cov or wishart_bartlett)."
        );
        let v_inv = matrix_inverse(&v)
            .unwrap_or_else(|_| Mat::from_fn(v.nrows(), v.ncols(), |_, _| f64::NAN));
        Ok(Self { nu, v, v_inv })
    }

    pub fn nu(&self) -> f64 {
        self.nu
    }

    pub fn scale(&self) -> &Mat<f64> {
        &self.v
    }

    fn dim(&self) -> usize {
        self.v.nrows()
    }
}

impl Distribution for Wishart {
    fn name(&self) -> &'static str {
        "Wishart"
    }

    fn ndim_supp(&self) -> usize {
        2
    }

    fn shape(&self) -> Vec<usize> {
        vec![self.dim(), self.dim()]
    }

    fn logp(
        &self,
        value: ArrayViewD<'_, f64>,
        settings: BoundSettings,
    ) -> Result<ArrayD<f64>, DistError> {
        let x = array_to_mat(&value)?;
        let p = self.dim();
        if x.nrows() != p || x.ncols() != p {
            return Err(DistError::ShapeMismatch {
                left: value.shape().to_vec(),
                right: self.shape(),
            });
        }
        let nu = self.nu;
        let p_f = p as f64;
        let logp = ((nu - p_f - 1.) * det(&x).ln()
            - trace(&matmul(&self.v_inv, &x))
            - nu * p_f * LN_2
            - nu * det(&self.v).ln()
            - 2. * multigammaln(nu / 2., p))
            / 2.;
        let conditions = [
            Condition::Scalar(matrix_pos_def(&x)),
            Condition::Scalar(is_symmetric(&x)),
            Condition::Scalar(nu > p_f - 1.),
        ];
        bound(
            scalar_array(logp),
            &conditions,
            false,
            settings,
        )
    }

    fn random<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        size: &[usize],
    ) -> Result<ArrayD<f64>, DistError> {
        let p = self.dim();
        let chol = try_cholesky(&self.v).map_err(|_| DistError::NotPositiveDefinite("V"))?;
        let draws: usize = size.iter().product();
        let mut out = Vec::with_capacity(draws * p * p);
        for _ in 0..draws {
            let (c, z) = bartlett_draw(rng, self.nu, p)?;
            let x = bartlett_matrix(&chol, &c, &z, false)?;
            for i in 0..p {
                out.extend((0..p).map(|j| x[(i, j)]));
            }
        }
        let mut shape = size.to_vec();
        shape.extend([p, p]);
        from_flat(&shape, out)
    }

    fn initial_value(&self) -> ArrayD<f64> {
        mat_to_array(&Mat::from_fn(self.dim(), self.dim(), |i, j| {
            self.nu * self.v[(i, j)]
        }))
    }
}

fn bartlett_draw<R: Rng + ?Sized>(
    rng: &mut R,
    nu: f64,
    p: usize,
) -> Result<(Vec<f64>, Vec<f64>), DistError> {
    let c = (0..p)
        .map(|i| {
            Ok(ChiSquared::new(nu - i as f64)
                .map_err(sampling_error)?
                .sample(rng))
        })
        .collect::<Result<Vec<f64>, DistError>>()?;
    let z = (0..p * p.saturating_sub(1) / 2)
        .map(|_| rng.sample(StandardNormal))
        .collect();
    Ok((c, z))
}

/// Lower triangular Bartlett factor with `sqrt(c)` on the diagonal and `z`
/// (row-major) below it.
pub fn bartlett_factor(c: &[f64], z: &[f64]) -> Result<Mat<f64>, DistError> {
    let p = c.len();
    if z.len() != p * p.saturating_sub(1) / 2 {
        return Err(DistError::ShapeMismatch {
            left: vec![z.len()],
            right: vec![p * p.saturating_sub(1) / 2],
        });
    }
    let mut a = Mat::<f64>::zeros(p, p);
    let mut idx = 0;
    for i in 0..p {
        for j in 0..i {
            a[(i, j)] = z[idx];
            idx += 1;
        }
        a[(i, i)] = c[i].sqrt();
    }
    Ok(a)
}

/// `L A Aᵀ Lᵀ`, or `L A` when `return_cholesky` is set.
pub fn bartlett_matrix(
    chol: &Mat<f64>,
    c: &[f64],
    z: &[f64],
    return_cholesky: bool,
) -> Result<Mat<f64>, DistError> {
    let la = matmul(chol, &bartlett_factor(c, z)?);
    if return_cholesky {
        Ok(la)
    } else {
        Ok(matmul(&la, &transpose(&la)))
    }
}

/// Inverse of the Bartlett construction: the `(c, z)` that produce `value`.
pub fn bartlett_inverse(chol: &Mat<f64>, value: &Mat<f64>) -> Result<(Vec<f64>, Vec<f64>), DistError> {
    let left = solve_lower(chol, value);
    let inner = transpose(&solve_lower(chol, &transpose(&left)));
    let a = try_cholesky(&inner).map_err(|_| DistError::NotPositiveDefinite("initval"))?;
    let p = a.nrows();
    let c = (0..p).map(|i| a[(i, i)] * a[(i, i)]).collect();
    let z = (0..p)
        .flat_map(|i| (0..i).map(move |j| (i, j)))
        .map(|(i, j)| a[(i, j)])
        .collect();
    Ok((c, z))
}

/// Adds a Wishart distributed matrix to the model through its Bartlett
/// decomposition.
///
/// Two auxiliary variables are registered: `{name}_c`, chi-squared
/// distributed diagonal entries, and `{name}_z`, standard normal
/// off-diagonal entries. The matrix itself is the deterministic `{name}`.
pub fn wishart_bartlett(
    model: &mut Model,
    name: &str,
    s: &Mat<f64>,
    nu: f64,
    is_cholesky: bool,
    return_cholesky: bool,
    initval: Option<&Mat<f64>>,
) -> Result<(), ModelError> {
    let chol = if is_cholesky {
        s.clone()
    } else {
        try_cholesky(s).map_err(|_| DistError::NotPositiveDefinite("S"))?
    };
    let p = chol.nrows();
    if !(nu > p as f64 - 1.) {
        return Err(DistError::InvalidParameter {
            name: "nu",
            reason: format!("must be larger than {} for a {p}x{p} matrix", p as f64 - 1.),
        }
        .into());
    }
    let n_tril = p * p.saturating_sub(1) / 2;

    let (c_init, z_init) = match initval {
        Some(init) => {
            let (c, z) = bartlett_inverse(&chol, init)?;
            (Some(Array1::from_vec(c).into_dyn()), Some(Array1::from_vec(z).into_dyn()))
        }
        None => (None, None),
    };

    let c_name = format!("{name}_c");
    let c_dist = Independent::new(
        (0..p)
            .map(|i| Univariate::ChiSquared { nu: nu - i as f64 })
            .collect(),
    )?;
    model.add_free(
        &c_name,
        c_dist,
        VarOptions {
            initval: c_init,
            ..Default::default()
        },
    )?;
    log::info!("Added new variable {c_name} to model diagonal of Wishart.");

    let z_name = format!("{name}_z");
    if n_tril > 0 {
        let z_dist = Independent::iid(Univariate::Normal { mu: 0., sigma: 1. }, n_tril)?;
        model.add_free(
            &z_name,
            z_dist,
            VarOptions {
                initval: z_init,
                ..Default::default()
            },
        )?;
        log::info!("Added new variable {z_name} to model off-diagonals of Wishart.");
    }

    model.add_deterministic(name, move |point| {
        let c = point
            .get(&c_name)
            .ok_or_else(|| DistError::Unsupported(format!("missing variable {c_name}")))?;
        let z: Vec<f64> = match point.get(&z_name) {
            Some(z) => z.iter().copied().collect(),
            None => vec![],
        };
        let c: Vec<f64> = c.iter().copied().collect();
        Ok(mat_to_array(&bartlett_matrix(&chol, &c, &z, return_cholesky)?))
    })?;
    Ok(())
}
