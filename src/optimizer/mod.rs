//! Optimization module for bundle adjustment and calibration estimation.
//!
//! - `problem` / `solver`: the nonlinear least-squares contract and the
//!   dense trust-region implementation
//! - `residuals`: projection, inertial and prior cost functions
//! - `snapshot`: lock-free copies of the pose graph and problem assembly
//! - `bundle_adjustment`: sliding-window BA in collect / solve / apply phases

pub mod bundle_adjustment;
pub mod problem;
pub mod residuals;
pub mod robust;
pub mod snapshot;
pub mod solver;

pub use bundle_adjustment::{
    BaProblemData, BaRequest, BaResultData, BundleAdjustmentConfig, BundleAdjustmentInvoker, ConditioningStats,
};
pub use problem::{BlockId, CostFunction, Problem, ResidualId, ResidualKind};
pub use snapshot::{assemble, Assembled, AssemblyOptions, GraphSnapshot, IntrinsicsMode};
pub use solver::{
    marginal_covariance, numerical_rank, DenseSolver, Marginal, NonlinearSolver, SolveSummary, SolverOptions,
    TrustRegionStrategy,
};
