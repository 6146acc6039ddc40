//! Trust-region least-squares solver.
//!
//! The calibration code only depends on the `NonlinearSolver` contract:
//! solve a `Problem` in place within an iteration budget and report a
//! `SolveSummary` with error sums split by residual kind and by
//! conditioning/active partition, plus per-residual lookups.
//!
//! `DenseSolver` is the in-crate implementation: block-local central
//! difference Jacobians accumulated straight into dense normal equations,
//! then either Levenberg-Marquardt or Powell's dogleg on top.
//!
//! ```text
//! (H + λ diag(H)) δ = -g,   H = Σ w JᵀJ,   g = Σ w Jᵀr
//! ```

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::problem::{BlockId, Problem, ResidualId, ResidualKind};

/// Relative step for central differences.
const NUMERIC_STEP: f64 = 1e-6;

/// Below this total cost the problem is considered solved.
const COST_FLOOR: f64 = 1e-24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustRegionStrategy {
    LevenbergMarquardt,
    Dogleg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub max_iterations: usize,
    pub strategy: TrustRegionStrategy,
    /// Stop when `|δ| <= t (|x| + t)`.
    pub param_change_threshold: f64,
    /// Stop when an accepted step reduces the cost by less than this fraction.
    pub error_change_threshold: f64,
    pub gradient_threshold: f64,
    pub initial_lambda: f64,
    pub initial_radius: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            strategy: TrustRegionStrategy::LevenbergMarquardt,
            param_change_threshold: 1e-10,
            error_change_threshold: 1e-3,
            gradient_threshold: 1e-12,
            initial_lambda: 1e-4,
            initial_radius: 1e3,
        }
    }
}

impl SolverOptions {
    pub fn with_iterations(&self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResidualStats {
    /// Sum of squared whitened residual norms.
    pub error: f64,
    pub count: usize,
}

impl ResidualStats {
    fn add(&mut self, error: f64) {
        self.error += error;
        self.count += 1;
    }
}

/// Error sums of one residual kind, split by partition.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PartitionStats {
    pub active: ResidualStats,
    pub conditioning: ResidualStats,
}

#[derive(Debug, Clone, Default)]
pub struct SolveSummary {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    pub converged: bool,
    pub projection: PartitionStats,
    pub inertial: PartitionStats,
    pub prior: PartitionStats,
    residual_errors: Vec<f64>,
}

impl SolveSummary {
    pub fn stats(&self, kind: ResidualKind) -> &PartitionStats {
        match kind {
            ResidualKind::Projection => &self.projection,
            ResidualKind::Inertial => &self.inertial,
            ResidualKind::Prior => &self.prior,
        }
    }

    /// Squared whitened norm of a residual at the solution.
    pub fn residual_error(&self, id: ResidualId) -> Option<f64> {
        self.residual_errors.get(id).copied()
    }
}

pub trait NonlinearSolver: Send + Sync {
    fn solve(&self, problem: &mut Problem, options: &SolverOptions) -> SolveSummary;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DenseSolver;

impl NonlinearSolver for DenseSolver {
    fn solve(&self, problem: &mut Problem, options: &SolverOptions) -> SolveSummary {
        let initial_cost = problem.total_cost();
        let (iterations, converged) = match options.strategy {
            TrustRegionStrategy::LevenbergMarquardt => levenberg_marquardt(problem, options),
            TrustRegionStrategy::Dogleg => dogleg(problem, options),
        };
        summarize(problem, initial_cost, iterations, converged)
    }
}

/// Dense normal equations at the current parameter values.
pub(crate) struct Linearization {
    pub hessian: DMatrix<f64>,
    pub gradient: DVector<f64>,
    pub cost: f64,
}

pub(crate) fn linearize(problem: &Problem, offsets: &[Option<usize>], n: usize) -> Linearization {
    let mut hessian = DMatrix::zeros(n, n);
    let mut gradient = DVector::zeros(n);
    let mut cost = 0.0;

    for residual in &problem.residuals {
        // A block may appear twice (e.g. an observation in its own reference
        // pose); perturb it once through a shared local copy.
        let mut unique: Vec<BlockId> = Vec::with_capacity(residual.blocks.len());
        let mut slots = Vec::with_capacity(residual.blocks.len());
        for &b in &residual.blocks {
            match unique.iter().position(|&u| u == b) {
                Some(k) => slots.push(k),
                None => {
                    unique.push(b);
                    slots.push(unique.len() - 1);
                }
            }
        }
        let mut local: Vec<Vec<f64>> = unique
            .iter()
            .map(|&b| problem.blocks[b].values.clone())
            .collect();
        let eval = |local: &[Vec<f64>]| {
            let views: Vec<&[f64]> = slots.iter().map(|&k| local[k].as_slice()).collect();
            residual.evaluate_with(&views)
        };

        let r0 = eval(&local);
        let s = r0.norm_squared();
        let (rho, weight) = match &residual.loss {
            Some(loss) => (loss.rho(s), loss.weight(s)),
            None => (s, 1.0),
        };
        cost += rho;

        let mut jacobians: Vec<(usize, DMatrix<f64>)> = Vec::new();
        for (k, &b) in unique.iter().enumerate() {
            let Some(offset) = offsets[b] else { continue };
            let size = local[k].len();
            let mut jac = DMatrix::zeros(r0.len(), size);
            for e in 0..size {
                let orig = local[k][e];
                let step = NUMERIC_STEP * orig.abs().max(1.0);
                local[k][e] = orig + step;
                let plus = eval(&local);
                local[k][e] = orig - step;
                let minus = eval(&local);
                local[k][e] = orig;
                jac.set_column(e, &((plus - minus) / (2.0 * step)));
            }
            jacobians.push((offset, jac));
        }

        for (oa, ja) in &jacobians {
            let jt = ja.transpose();
            let jtr = &jt * &r0;
            for a in 0..ja.ncols() {
                gradient[oa + a] += weight * jtr[a];
            }
            for (ob, jb) in &jacobians {
                let block = &jt * jb;
                for a in 0..ja.ncols() {
                    for c in 0..jb.ncols() {
                        hessian[(oa + a, ob + c)] += weight * block[(a, c)];
                    }
                }
            }
        }
    }

    Linearization {
        hessian,
        gradient,
        cost,
    }
}

fn solve_spd(a: DMatrix<f64>, rhs: &DVector<f64>) -> Option<DVector<f64>> {
    if let Some(chol) = a.clone().cholesky() {
        return Some(chol.solve(rhs));
    }
    a.lu().solve(rhs)
}

fn levenberg_marquardt(problem: &mut Problem, options: &SolverOptions) -> (usize, bool) {
    let (offsets, n) = problem.free_layout();
    if n == 0 {
        return (0, true);
    }

    let mut lambda = options.initial_lambda;
    let lambda_up = 10.0;
    let lambda_down = 0.1;
    let min_lambda = 1e-12;
    let max_lambda = 1e12;

    let mut x = problem.free_values(&offsets, n);
    let mut iterations = 0;

    for iter in 0..options.max_iterations {
        iterations = iter + 1;
        let lin = linearize(problem, &offsets, n);
        if lin.cost < COST_FLOOR || lin.gradient.amax() < options.gradient_threshold {
            return (iterations, true);
        }

        // Inner loop: raise damping until a step reduces the cost.
        loop {
            let mut damped = lin.hessian.clone();
            for i in 0..n {
                damped[(i, i)] += lambda * lin.hessian[(i, i)].max(1e-9);
            }
            let Some(delta) = solve_spd(damped, &(-&lin.gradient)) else {
                lambda = (lambda * lambda_up).min(max_lambda);
                if lambda >= max_lambda {
                    return (iterations, false);
                }
                continue;
            };

            let trial = &x + &delta;
            problem.set_free_values(&offsets, &trial);
            let trial_cost = problem.total_cost();

            if trial_cost.is_finite() && trial_cost < lin.cost {
                let small_step = delta.norm()
                    <= options.param_change_threshold * (x.norm() + options.param_change_threshold);
                let small_gain = (lin.cost - trial_cost) / lin.cost < options.error_change_threshold;
                x = trial;
                lambda = (lambda * lambda_down).max(min_lambda);
                trace!(iter, cost = trial_cost, lambda, "lm step accepted");
                if small_step || small_gain {
                    return (iterations, true);
                }
                break;
            }

            problem.set_free_values(&offsets, &x);
            lambda = (lambda * lambda_up).min(max_lambda);
            if lambda >= max_lambda {
                return (iterations, false);
            }
        }
    }
    (iterations, false)
}

fn dogleg(problem: &mut Problem, options: &SolverOptions) -> (usize, bool) {
    let (offsets, n) = problem.free_layout();
    if n == 0 {
        return (0, true);
    }

    let mut radius = options.initial_radius;
    let mut x = problem.free_values(&offsets, n);
    let mut iterations = 0;

    for iter in 0..options.max_iterations {
        iterations = iter + 1;
        let lin = linearize(problem, &offsets, n);
        let g = &lin.gradient;
        if lin.cost < COST_FLOOR || g.amax() < options.gradient_threshold {
            return (iterations, true);
        }

        let mut regularized = lin.hessian.clone();
        for i in 0..n {
            regularized[(i, i)] += 1e-12 * lin.hessian[(i, i)].max(1.0);
        }
        let gauss_newton = solve_spd(regularized, &(-g));
        let g_h_g = (g.transpose() * &lin.hessian * g)[(0, 0)];
        let alpha = if g_h_g > 0.0 { g.norm_squared() / g_h_g } else { 1.0 };
        let steepest = -alpha * g;

        loop {
            let step = match &gauss_newton {
                Some(gn) if gn.norm() <= radius => gn.clone(),
                _ if steepest.norm() >= radius => &steepest * (radius / steepest.norm()),
                Some(gn) => {
                    // Walk from the Cauchy point towards the Gauss-Newton point
                    // until the trust radius is hit.
                    let d = gn - &steepest;
                    let a = d.norm_squared();
                    let b = 2.0 * steepest.dot(&d);
                    let c = steepest.norm_squared() - radius * radius;
                    let beta = (-b + (b * b - 4.0 * a * c).max(0.0).sqrt()) / (2.0 * a);
                    &steepest + d * beta
                }
                None => steepest.clone(),
            };

            // Model reduction of F = cost / 2.
            let predicted = -(g.dot(&step) + 0.5 * (step.transpose() * &lin.hessian * &step)[(0, 0)]);
            let trial = &x + &step;
            problem.set_free_values(&offsets, &trial);
            let trial_cost = problem.total_cost();
            let actual = 0.5 * (lin.cost - trial_cost);
            let ratio = if predicted > 0.0 { actual / predicted } else { -1.0 };

            if trial_cost.is_finite() && ratio > 0.0 {
                if ratio > 0.75 {
                    radius = radius.max(3.0 * step.norm());
                } else if ratio < 0.25 {
                    radius *= 0.5;
                }
                let small_step = step.norm()
                    <= options.param_change_threshold * (x.norm() + options.param_change_threshold);
                let small_gain = (lin.cost - trial_cost) / lin.cost < options.error_change_threshold;
                x = trial;
                trace!(iter, cost = trial_cost, radius, "dogleg step accepted");
                if small_step || small_gain {
                    return (iterations, true);
                }
                break;
            }

            problem.set_free_values(&offsets, &x);
            radius *= 0.5;
            if radius < options.param_change_threshold * (x.norm() + options.param_change_threshold) {
                return (iterations, true);
            }
        }
    }
    (iterations, false)
}

fn summarize(problem: &Problem, initial_cost: f64, iterations: usize, converged: bool) -> SolveSummary {
    let mut summary = SolveSummary {
        initial_cost,
        iterations,
        converged,
        ..Default::default()
    };
    let mut final_cost = 0.0;
    for (id, residual) in problem.residuals.iter().enumerate() {
        let s = problem.evaluate_residual(id).norm_squared();
        final_cost += match &residual.loss {
            Some(loss) => loss.rho(s),
            None => s,
        };
        let partition = match residual.kind {
            ResidualKind::Projection => &mut summary.projection,
            ResidualKind::Inertial => &mut summary.inertial,
            ResidualKind::Prior => &mut summary.prior,
        };
        if residual.conditioning {
            partition.conditioning.add(s);
        } else {
            partition.active.add(s);
        }
        summary.residual_errors.push(s);
    }
    summary.final_cost = final_cost;
    summary
}

/// Marginal covariance of a set of free blocks at the current solution.
#[derive(Debug, Clone)]
pub struct Marginal {
    pub covariance: DMatrix<f64>,
    pub information: DMatrix<f64>,
    /// Numerical rank of the marginal information.
    pub rank: usize,
}

/// Relative singular value tolerance used for rank decisions.
pub const RANK_TOLERANCE: f64 = 1e-9;

pub fn numerical_rank(m: &DMatrix<f64>) -> usize {
    if m.is_empty() {
        return 0;
    }
    let sv = m.clone().svd(false, false).singular_values;
    let max = sv.max();
    if !max.is_finite() || max <= 0.0 {
        return 0;
    }
    sv.iter().filter(|&&s| s > RANK_TOLERANCE * max).count()
}

pub(crate) fn pseudo_inverse(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let max = m.amax();
    m.clone()
        .svd(true, true)
        .pseudo_inverse(RANK_TOLERANCE * max.max(f64::MIN_POSITIVE))
        .ok()
}

/// Schur-complement marginalization of the free blocks in `blocks` out of
/// the full information matrix, followed by inversion.
pub fn marginal_covariance(problem: &Problem, blocks: &[BlockId]) -> Option<Marginal> {
    let (offsets, n) = problem.free_layout();
    let mut keep = Vec::new();
    for &b in blocks {
        let offset = offsets[b]?;
        keep.extend(offset..offset + problem.block(b).len());
    }
    if keep.is_empty() {
        return None;
    }
    let other: Vec<usize> = (0..n).filter(|i| !keep.contains(i)).collect();

    let lin = linearize(problem, &offsets, n);
    let h = &lin.hessian;
    let pick = |rows: &[usize], cols: &[usize]| {
        DMatrix::from_fn(rows.len(), cols.len(), |r, c| h[(rows[r], cols[c])])
    };

    let h_kk = pick(&keep, &keep);
    let information = if other.is_empty() {
        h_kk
    } else {
        let h_ko = pick(&keep, &other);
        let h_oo = pick(&other, &other);
        let h_oo_inv_h_ok = match h_oo.clone().cholesky() {
            Some(chol) => chol.solve(&h_ko.transpose()),
            None => pseudo_inverse(&h_oo)? * h_ko.transpose(),
        };
        h_kk - h_ko * h_oo_inv_h_ok
    };
    let information = 0.5 * (&information + information.transpose());

    let rank = numerical_rank(&information);
    let covariance = if rank == information.nrows() {
        match information.clone().cholesky() {
            Some(chol) => chol.inverse(),
            None => pseudo_inverse(&information)?,
        }
    } else {
        pseudo_inverse(&information)?
    };

    Some(Marginal {
        covariance,
        information,
        rank,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::problem::CostFunction;
    use crate::optimizer::robust::HuberLoss;
    use approx::assert_relative_eq;

    /// r = (a * t_i + b - y_i) / sigma for a line fit.
    struct LinePoint {
        t: f64,
        y: f64,
        sigma: f64,
    }

    impl CostFunction for LinePoint {
        fn dim(&self) -> usize {
            1
        }

        fn evaluate(&self, blocks: &[&[f64]]) -> DVector<f64> {
            let (a, b) = (blocks[0][0], blocks[1][0]);
            DVector::from_element(1, (a * self.t + b - self.y) / self.sigma)
        }
    }

    /// Rosenbrock as a two-residual problem.
    struct Rosenbrock;

    impl CostFunction for Rosenbrock {
        fn dim(&self) -> usize {
            2
        }

        fn evaluate(&self, blocks: &[&[f64]]) -> DVector<f64> {
            let (x, y) = (blocks[0][0], blocks[0][1]);
            DVector::from_vec(vec![1.0 - x, 10.0 * (y - x * x)])
        }
    }

    fn line_problem(points: &[(f64, f64)]) -> (Problem, BlockId, BlockId) {
        let mut p = Problem::new();
        let a = p.add_block(&[0.0], false);
        let b = p.add_block(&[0.0], false);
        for &(t, y) in points {
            p.add_residual(
                ResidualKind::Projection,
                vec![a, b],
                Box::new(LinePoint { t, y, sigma: 0.5 }),
                None,
                t < 0.0,
            );
        }
        (p, a, b)
    }

    #[test]
    fn test_lm_fits_line() {
        let pts: Vec<(f64, f64)> = (-3..=3).map(|i| (i as f64, 2.0 * i as f64 + 1.0)).collect();
        let (mut p, a, b) = line_problem(&pts);
        let summary = DenseSolver.solve(&mut p, &SolverOptions::default());
        assert_relative_eq!(p.block(a)[0], 2.0, epsilon = 1e-6);
        assert_relative_eq!(p.block(b)[0], 1.0, epsilon = 1e-6);
        assert!(summary.final_cost < 1e-10);
        assert!(summary.converged);
    }

    #[test]
    fn test_dogleg_solves_rosenbrock() {
        let mut p = Problem::new();
        let x = p.add_block(&[-1.2, 1.0], false);
        p.add_residual(ResidualKind::Prior, vec![x], Box::new(Rosenbrock), None, false);
        let options = SolverOptions {
            strategy: TrustRegionStrategy::Dogleg,
            error_change_threshold: 0.0,
            ..SolverOptions::default()
        };
        DenseSolver.solve(&mut p, &options);
        assert_relative_eq!(p.block(x)[0], 1.0, epsilon = 1e-5);
        assert_relative_eq!(p.block(x)[1], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_lm_solves_rosenbrock() {
        let mut p = Problem::new();
        let x = p.add_block(&[-1.2, 1.0], false);
        p.add_residual(ResidualKind::Prior, vec![x], Box::new(Rosenbrock), None, false);
        let options = SolverOptions {
            error_change_threshold: 0.0,
            ..SolverOptions::default()
        };
        DenseSolver.solve(&mut p, &options);
        assert_relative_eq!(p.block(x)[0], 1.0, epsilon = 1e-5);
        assert_relative_eq!(p.block(x)[1], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_summary_partitions_conditioning() {
        let pts: Vec<(f64, f64)> = (-2..=2).map(|i| (i as f64, i as f64)).collect();
        let (mut p, _, _) = line_problem(&pts);
        let summary = DenseSolver.solve(&mut p, &SolverOptions::default().with_iterations(0));
        // t = -2, -1 are flagged as conditioning
        assert_eq!(summary.projection.conditioning.count, 2);
        assert_eq!(summary.projection.active.count, 3);
        assert!(summary.residual_error(0).unwrap() > 0.0);
        assert!(summary.residual_error(99).is_none());
    }

    #[test]
    fn test_marginal_covariance_of_line_fit() {
        let pts: Vec<(f64, f64)> = (-3..=3).map(|i| (i as f64, 2.0 * i as f64 + 1.0)).collect();
        let (mut p, a, b) = line_problem(&pts);
        DenseSolver.solve(&mut p, &SolverOptions::default());
        let m = marginal_covariance(&p, &[a]).unwrap();
        // var(a) = sigma^2 / sum(t^2) with centred t; sum = 28
        assert_relative_eq!(m.covariance[(0, 0)], 0.25 / 28.0, epsilon = 1e-8);
        assert_eq!(m.rank, 1);
        let both = marginal_covariance(&p, &[a, b]).unwrap();
        assert_relative_eq!(both.covariance[(1, 1)], 0.25 / 7.0, epsilon = 1e-8);
    }

    #[test]
    fn test_marginal_of_unobservable_block_is_rank_deficient() {
        // Only the sum a + b is observed.
        let pts: Vec<(f64, f64)> = vec![(1.0, 3.0), (1.0, 3.1)];
        let (mut p, a, b) = line_problem(&pts);
        DenseSolver.solve(&mut p, &SolverOptions::default());
        let m = marginal_covariance(&p, &[a, b]).unwrap();
        assert_eq!(m.rank, 1);
    }

    #[test]
    fn test_fixed_block_excluded_from_marginal() {
        let pts: Vec<(f64, f64)> = vec![(1.0, 3.0), (2.0, 5.0)];
        let (mut p, a, b) = line_problem(&pts);
        p.set_fixed(b, true);
        DenseSolver.solve(&mut p, &SolverOptions::default());
        assert!(marginal_covariance(&p, &[b]).is_none());
        assert!(marginal_covariance(&p, &[a]).is_some());
    }

    #[test]
    fn test_huber_downweights_outlier() {
        let mut pts: Vec<(f64, f64)> = (-3..=3).map(|i| (i as f64, i as f64)).collect();
        pts.push((0.5, 40.0));
        let mut p = Problem::new();
        let a = p.add_block(&[0.0], false);
        let b = p.add_block(&[0.0], false);
        for &(t, y) in &pts {
            p.add_residual(
                ResidualKind::Projection,
                vec![a, b],
                Box::new(LinePoint { t, y, sigma: 0.5 }),
                Some(HuberLoss::new(1.0)),
                false,
            );
        }
        DenseSolver.solve(&mut p, &SolverOptions { error_change_threshold: 0.0, ..SolverOptions::default() });
        assert!((p.block(a)[0] - 1.0).abs() < 0.1);
        assert!(p.block(b)[0].abs() < 0.5);
    }
}
