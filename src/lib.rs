//! Multivariate distributions with log densities, random draws and default
//! transforms, a model registry that combines them into a joint log density,
//! and the building blocks of step methods that sample from it.

pub(crate) mod blocking;
pub(crate) mod bound;
pub(crate) mod car;
pub(crate) mod distribution;
pub(crate) mod kronecker;
pub(crate) mod linalg;
pub(crate) mod lkj;
pub(crate) mod logp_func;
pub(crate) mod math;
pub(crate) mod matrix_normal;
pub(crate) mod model;
pub(crate) mod multinomial;
pub(crate) mod mvnormal;
pub(crate) mod quaddist;
pub(crate) mod shape;
pub(crate) mod step;
pub(crate) mod transforms;
pub(crate) mod univariate;
pub(crate) mod wishart;

pub use blocking::{
    ArrayFn, BijectionError, DictToArrayBijection, Point, PointLogp, RaveledVars, VarMapInfo,
};
pub use bound::{bound, bound_scalar, BoundSettings, Condition};
pub use car::{reverse_cuthill_mckee, BandedCholesky, Car, SparseAdjacency};
pub use distribution::{DistError, Distribution, MvDist};
pub use kronecker::{KroneckerArgs, KroneckerNormal};
pub use linalg::{
    cholesky, det, eigvalsh, is_symmetric, matmul, matrix_inverse, matrix_pos_def, solve_lower,
    solve_upper, symmetric_eigen, transpose, try_cholesky, CholeskyFactor, LinalgError,
};
pub use lkj::{
    decompose, lkj_cholesky_cov, lkj_log_normalizer, LkjCholeskyCov, LkjCorr, LkjCorrArgs,
};
pub use logp_func::{CpuLogpFunc, LogpError, ModelLogpError, ModelLogpFunc};
pub use math::{factln, kron_diag, kron_dot, logaddexp, logpow, multigammaln, sigmoid};
pub use matrix_normal::{MatrixNormal, MatrixNormalArgs};
pub use model::{Model, ModelConfig, ModelError, TransformChoice, ValueVar, VarOptions};
pub use multinomial::{
    ordered_probs, Dirichlet, DirichletMultinomial, Multinomial, OrderedMultinomial,
};
pub use mvnormal::{MvNormal, MvStudentT};
pub use quaddist::{
    quaddist_chol, quaddist_matrix, quaddist_parse, quaddist_tau, CovarianceArgs, MatType,
    QuadDist,
};
pub use step::{
    array_step, metrop_select, select_by_competence, shared_step, ArrayStep, ArrayStepShared,
    BlockedStep, Competence, CompoundStep, GradientSharedStep, Population,
    PopulationArrayStepShared, RaveledLogp, SampleStatValue, SharedVars, Step, StepError,
    StepMethod, StepStats,
};
pub use transforms::{
    expand_packed_triangular, pack_lower_triangular, packed_diag_indices, packed_dim, packed_len,
    Transform,
};
pub use univariate::{Independent, Univariate};
pub use wishart::{bartlett_factor, bartlett_inverse, bartlett_matrix, wishart_bartlett, Wishart};
