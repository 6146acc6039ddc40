//! Bounded per-sensor store of the most informative calibration windows.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::optimizer::solver::pseudo_inverse;

use super::window::{window_score, CalibrationWindow};

/// How the aggregate estimate of the queue is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AggregationMode {
    /// Precision-weighted fusion of the member windows.
    #[default]
    InformationFusion,
    /// Re-estimate over the union of the member windows' poses.
    JointSolve,
}

/// Outcome of offering a candidate window to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Inserted,
    /// Replaced this many incumbents.
    Replaced(usize),
    Rejected,
}

impl Offer {
    pub fn accepted(self) -> bool {
        !matches!(self, Offer::Rejected)
    }
}

#[derive(Debug, Clone)]
pub struct WindowPriorityQueue {
    capacity: usize,
    /// Relative score improvement a candidate needs over an incumbent.
    margin: f64,
    windows: Vec<CalibrationWindow>,
    needs_update: bool,
    generation: u64,
    distribution: Option<CalibrationWindow>,
}

impl WindowPriorityQueue {
    pub fn new(capacity: usize, margin: f64) -> Self {
        Self {
            capacity: capacity.max(1),
            margin,
            windows: Vec::with_capacity(capacity),
            needs_update: false,
            generation: 0,
            distribution: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn margin(&self) -> f64 {
        self.margin
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.windows.len() >= self.capacity
    }

    pub fn windows(&self) -> &[CalibrationWindow] {
        &self.windows
    }

    /// Membership changed since the last aggregation.
    pub fn needs_update(&self) -> bool {
        self.needs_update
    }

    pub fn mark_updated(&mut self) {
        self.needs_update = false;
    }

    /// Bumped on every membership change and on `clear`.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn beats(&self, candidate: f64, incumbent: f64) -> bool {
        candidate > incumbent * (1.0 + self.margin)
    }

    /// Offers a candidate window.
    ///
    /// A candidate overlapping incumbents competes only with them and, if it
    /// beats the best of them by the margin, replaces all of them. A
    /// non-overlapping candidate fills a free slot or must beat the weakest
    /// incumbent by the margin.
    pub fn offer(&mut self, candidate: &CalibrationWindow) -> Offer {
        if !candidate.is_applicable() || candidate.score <= 0.0 || candidate.num_poses() == 0 {
            return Offer::Rejected;
        }
        if let Some(first) = self.windows.first() {
            if first.dim() != candidate.dim() {
                return Offer::Rejected;
            }
        }

        let overlapping: Vec<usize> = self
            .windows
            .iter()
            .enumerate()
            .filter(|(_, w)| w.overlaps(candidate))
            .map(|(i, _)| i)
            .collect();

        let outcome = if !overlapping.is_empty() {
            let best = overlapping
                .iter()
                .map(|&i| self.windows[i].score)
                .fold(f64::MIN, f64::max);
            if !self.beats(candidate.score, best) {
                return Offer::Rejected;
            }
            for &i in overlapping.iter().rev() {
                self.windows.remove(i);
            }
            self.windows.push(candidate.clone());
            Offer::Replaced(overlapping.len())
        } else if !self.is_full() {
            self.windows.push(candidate.clone());
            Offer::Inserted
        } else {
            let Some((weakest, score)) = self
                .windows
                .iter()
                .enumerate()
                .map(|(i, w)| (i, w.score))
                .min_by(|a, b| a.1.total_cmp(&b.1))
            else {
                return Offer::Rejected;
            };
            if !self.beats(candidate.score, score) {
                return Offer::Rejected;
            }
            self.windows[weakest] = candidate.clone();
            Offer::Replaced(1)
        };

        self.windows.sort_by_key(|w| w.start);
        self.needs_update = true;
        self.generation += 1;
        debug!(
            start = candidate.start,
            end = candidate.end,
            score = candidate.score,
            ?outcome,
            members = self.windows.len(),
            "calibration window queued"
        );
        outcome
    }

    pub fn clear(&mut self) {
        self.windows.clear();
        self.distribution = None;
        self.needs_update = false;
        self.generation += 1;
    }

    /// Records the aggregate the queue currently stands for.
    pub fn set_distribution(&mut self, window: CalibrationWindow) {
        self.distribution = Some(window);
    }

    pub fn distribution(&self) -> Option<&CalibrationWindow> {
        self.distribution.as_ref()
    }

    /// Sorted, deduplicated poses covered by the member windows.
    pub fn union_poses(&self) -> Vec<usize> {
        let mut poses: Vec<usize> = self.windows.iter().flat_map(|w| w.start..w.end).collect();
        poses.sort_unstable();
        poses.dedup();
        poses
    }

    /// Precision-weighted fusion of the member windows:
    ///
    /// ```text
    /// Λ = Σ Σᵢ⁻¹,   μ = Λ⁻¹ Σ Σᵢ⁻¹ μᵢ
    /// ```
    pub fn fuse(&self, weights: &[f64]) -> Option<CalibrationWindow> {
        let first = self.windows.first()?;
        let n = first.dim();
        let mut information = DMatrix::<f64>::zeros(n, n);
        let mut eta = DVector::<f64>::zeros(n);
        for w in &self.windows {
            let precision = match w.covariance.clone().cholesky() {
                Some(chol) => chol.inverse(),
                None => pseudo_inverse(&w.covariance)?,
            };
            eta += &precision * &w.mean;
            information += precision;
        }
        let covariance = match information.clone().cholesky() {
            Some(chol) => chol.inverse(),
            None => pseudo_inverse(&information)?,
        };
        let mean = &covariance * eta;
        if mean.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let start = self.windows.iter().map(|w| w.start).min()?;
        let end = self.windows.iter().map(|w| w.end).max()?;
        let (uncertainty, score) = window_score(&covariance, weights);
        Some(CalibrationWindow {
            start,
            end,
            mean,
            covariance,
            uncertainty,
            score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Isotropic window whose score is exactly `score`.
    fn window(start: usize, end: usize, score: f64, mean: f64) -> CalibrationWindow {
        let variance = 1.0 / score;
        CalibrationWindow::new(
            start,
            end,
            DVector::from_element(2, mean),
            DMatrix::identity(2, 2) * variance,
            &[],
        )
    }

    fn full_camera_queue() -> WindowPriorityQueue {
        let mut q = WindowPriorityQueue::new(3, 0.05);
        q.offer(&window(0, 10, 2.0, 1.0));
        q.offer(&window(10, 20, 1.0, 1.0));
        q.offer(&window(20, 30, 3.0, 1.0));
        assert!(q.is_full());
        q
    }

    #[test]
    fn test_margin_gates_replacement_of_weakest() {
        let mut q = full_camera_queue();
        let generation = q.generation();
        q.mark_updated();
        assert_eq!(q.offer(&window(40, 50, 1.04, 1.0)), Offer::Rejected);
        assert!(!q.needs_update());
        assert_eq!(q.generation(), generation);

        assert_eq!(q.offer(&window(40, 50, 1.06, 1.0)), Offer::Replaced(1));
        assert!(q.needs_update());
        assert_eq!(q.len(), 3);
        assert!(q.windows().iter().all(|w| w.start != 10));
    }

    #[test]
    fn test_overlapping_candidate_competes_with_overlaps_only() {
        let mut q = full_camera_queue();
        // Beats the weakest (1.0) but not the overlapping incumbent (3.0).
        assert_eq!(q.offer(&window(25, 35, 2.5, 1.0)), Offer::Rejected);
        // Spans two incumbents and beats both.
        assert_eq!(q.offer(&window(5, 15, 2.5, 1.0)), Offer::Replaced(2));
        assert_eq!(q.len(), 2);
        assert_eq!(q.union_poses().len(), 20);
    }

    #[test]
    fn test_rank_deficient_candidate_rejected() {
        let mut q = WindowPriorityQueue::new(3, 0.05);
        let mut w = window(0, 10, 1.0, 1.0);
        w.covariance[(1, 1)] = 0.0;
        assert_eq!(q.offer(&w), Offer::Rejected);
        assert!(q.is_empty());
    }

    #[test]
    fn test_repeated_candidate_never_lowers_aggregate() {
        let mut q = WindowPriorityQueue::new(4, 0.2);
        q.offer(&window(0, 10, 1.0, 1.0));
        q.offer(&window(10, 20, 2.0, 1.2));
        let mut previous = q.fuse(&[]).unwrap().score;
        let candidate = window(30, 40, 1.5, 0.9);
        for _ in 0..5 {
            q.offer(&candidate);
            let score = q.fuse(&[]).unwrap().score;
            assert!(score >= previous);
            previous = score;
        }
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_fusion_is_precision_weighted() {
        let mut q = WindowPriorityQueue::new(2, 0.05);
        q.offer(&window(0, 10, 1.0, 0.0));
        q.offer(&window(10, 20, 3.0, 4.0));
        let fused = q.fuse(&[]).unwrap();
        assert_relative_eq!(fused.mean[0], 3.0, epsilon = 1e-12);
        assert_relative_eq!(fused.covariance[(0, 0)], 0.25, epsilon = 1e-12);
        assert_relative_eq!(fused.score, 4.0, epsilon = 1e-9);
        assert_eq!((fused.start, fused.end), (0, 20));
    }

    #[test]
    fn test_clear_resets_membership() {
        let mut q = full_camera_queue();
        q.set_distribution(window(0, 30, 6.0, 1.0));
        let generation = q.generation();
        q.clear();
        assert!(q.is_empty());
        assert!(q.distribution().is_none());
        assert!(!q.needs_update());
        assert!(q.generation() > generation);
    }
}
