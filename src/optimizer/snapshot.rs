//! Lock-free problem assembly.
//!
//! Solves follow the collect / solve / apply pattern: a `GraphSnapshot` is
//! copied out of the pose graph while the graph lock is held, the problem is
//! assembled and solved on the copy with no lock held, and the results are
//! written back under the lock again.

use nalgebra::{DVector, Vector2, Vector3};

use crate::camera::Rig;
use crate::geometry::SE3;
use crate::graph::{PoseGraph, TrackId};
use crate::imu::{ImuBias, ImuBuffer, ImuNoise, ImuSample};

use super::problem::{BlockId, Problem, ResidualId, ResidualKind};
use super::residuals::{InertialCost, ProjectionCost};
use super::robust::HuberLoss;

#[derive(Debug, Clone)]
pub struct PoseState {
    /// Position in the pose graph.
    pub index: usize,
    pub t_wp: SE3,
    pub v_w: Vector3<f64>,
    pub bias: ImuBias,
    pub cam_params: DVector<f64>,
    pub time: f64,
}

#[derive(Debug, Clone)]
pub struct TrackState {
    pub id: TrackId,
    pub ref_pose: usize,
    pub ref_px: Vector2<f64>,
    pub ray: Vector3<f64>,
    pub rho: f64,
    /// Tracked observations in snapshot poses other than the reference:
    /// `(pose index, pixel)`.
    pub observations: Vec<(usize, Vector2<f64>)>,
    /// Still followed by the tracker.
    pub tracked: bool,
}

/// Raw IMU samples between two consecutive graph poses.
#[derive(Debug, Clone)]
pub struct ImuSegment {
    pub from: usize,
    pub to: usize,
    pub samples: Vec<ImuSample>,
}

#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    /// Sorted by pose index; need not be contiguous.
    pub poses: Vec<PoseState>,
    pub tracks: Vec<TrackState>,
    pub imu: Vec<ImuSegment>,
    pub rig: Rig,
}

impl GraphSnapshot {
    /// Copies the given poses (sorted, deduplicated), the usable tracks
    /// anchored in them and, when a buffer is given, the IMU samples between
    /// consecutive graph poses.
    pub fn collect(graph: &PoseGraph, imu: Option<&ImuBuffer>, rig: &Rig, pose_indices: &[usize]) -> Self {
        let mut indices: Vec<usize> = pose_indices
            .iter()
            .copied()
            .filter(|&i| i < graph.num_poses())
            .collect();
        indices.sort_unstable();
        indices.dedup();

        let poses: Vec<PoseState> = indices
            .iter()
            .filter_map(|&i| graph.pose(i).map(|p| (i, p)))
            .map(|(index, p)| PoseState {
                index,
                t_wp: p.t_wp,
                v_w: p.v_w,
                bias: p.bias,
                cam_params: p.cam_params.clone(),
                time: p.time,
            })
            .collect();

        let contains = |i: usize| indices.binary_search(&i).is_ok();

        let mut tracks = Vec::new();
        for &ref_pose in &indices {
            let Some(pose) = graph.pose(ref_pose) else { continue };
            for &id in &pose.tracks {
                let Some(track) = graph.track(id) else { continue };
                if !track.is_usable() {
                    continue;
                }
                let observations: Vec<(usize, Vector2<f64>)> = track
                    .observations
                    .iter()
                    .enumerate()
                    .skip(1)
                    .map(|(k, obs)| (track.ref_pose + k, obs))
                    .filter(|(p, obs)| obs.tracked && contains(*p))
                    .map(|(p, obs)| (p, obs.px))
                    .collect();
                if observations.is_empty() {
                    continue;
                }
                tracks.push(TrackState {
                    id,
                    ref_pose,
                    ref_px: track.ref_keypoint.center_px,
                    ray: track.ref_keypoint.ray,
                    rho: track.ref_keypoint.rho,
                    observations,
                    tracked: track.tracked,
                });
            }
        }

        let mut segments = Vec::new();
        if let Some(buffer) = imu {
            for pair in poses.windows(2) {
                if pair[1].index != pair[0].index + 1 {
                    continue;
                }
                let samples = buffer.range(pair[0].time, pair[1].time);
                if samples.len() >= 2 {
                    segments.push(ImuSegment {
                        from: pair[0].index,
                        to: pair[1].index,
                        samples,
                    });
                }
            }
        }

        Self {
            poses,
            tracks,
            imu: segments,
            rig: rig.clone(),
        }
    }

    /// Slot of a graph pose index in `poses`.
    pub fn slot(&self, index: usize) -> Option<usize> {
        self.poses.binary_search_by_key(&index, |p| p.index).ok()
    }

    pub fn first_index(&self) -> Option<usize> {
        self.poses.first().map(|p| p.index)
    }

    pub fn last_index(&self) -> Option<usize> {
        self.poses.last().map(|p| p.index)
    }
}

/// Which intrinsics the projection residuals use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrinsicsMode {
    /// Fixed, from each observing pose's parameter snapshot.
    PerPose,
    /// Fixed, from the snapshot rig.
    Rig,
    /// Free block seeded from the rig; reference rays are recomputed from
    /// the reference pixel.
    Free,
}

#[derive(Debug, Clone)]
pub struct AssemblyOptions {
    /// Per snapshot slot.
    pub free_poses: Vec<bool>,
    pub use_imu: bool,
    pub free_structure: bool,
    /// Track whose inverse depth stays fixed (scale gauge without IMU).
    pub fixed_track: Option<TrackId>,
    pub intrinsics: IntrinsicsMode,
    pub free_extrinsic_translation: bool,
    pub free_extrinsic_rotation: bool,
    pub huber_px: Option<f64>,
    pub sigma_px: f64,
    pub noise: ImuNoise,
}

#[derive(Debug, Clone, Copy)]
pub struct ProjectionRef {
    pub track: usize,
    pub pose_index: usize,
    pub residual: ResidualId,
}

#[derive(Debug, Clone, Copy)]
pub struct InertialRef {
    pub from: usize,
    pub to: usize,
    pub residual: ResidualId,
}

/// A problem built from a snapshot, with handles back to the snapshot
/// entities.
pub struct Assembled {
    pub problem: Problem,
    pub pose_blocks: Vec<BlockId>,
    /// Empty when IMU residuals are not used.
    pub velocity_blocks: Vec<BlockId>,
    pub bias_blocks: Vec<BlockId>,
    /// Per snapshot track.
    pub rho_blocks: Vec<BlockId>,
    pub extrinsic_translation: BlockId,
    pub extrinsic_rotation: BlockId,
    pub intrinsics: Option<BlockId>,
    pub projections: Vec<ProjectionRef>,
    pub inertial: Vec<InertialRef>,
}

impl Assembled {
    pub fn pose(&self, slot: usize) -> SE3 {
        SE3::from_params(self.problem.block(self.pose_blocks[slot]))
    }

    pub fn velocity(&self, slot: usize) -> Option<Vector3<f64>> {
        self.velocity_blocks.get(slot).map(|&b| {
            let v = self.problem.block(b);
            Vector3::new(v[0], v[1], v[2])
        })
    }

    pub fn bias(&self, slot: usize) -> Option<ImuBias> {
        self.bias_blocks
            .get(slot)
            .map(|&b| ImuBias::from_params(self.problem.block(b)))
    }

    pub fn rho(&self, track: usize) -> f64 {
        self.problem.block(self.rho_blocks[track])[0]
    }

    pub fn extrinsic(&self) -> SE3 {
        let t = self.problem.block(self.extrinsic_translation);
        let r = self.problem.block(self.extrinsic_rotation);
        SE3::exp_decoupled(&[t[0], t[1], t[2], r[0], r[1], r[2]])
    }

    pub fn intrinsics_params(&self) -> Option<DVector<f64>> {
        self.intrinsics
            .map(|b| DVector::from_column_slice(self.problem.block(b)))
    }

    /// Mean pixel error of the projections landing on `pose_index`.
    pub fn mean_pixel_error(&self, pose_index: usize, sigma_px: f64) -> Option<f64> {
        let errors: Vec<f64> = self
            .projections
            .iter()
            .filter(|p| p.pose_index == pose_index)
            .map(|p| self.problem.evaluate_residual(p.residual).norm() * sigma_px)
            .collect();
        if errors.is_empty() {
            return None;
        }
        Some(errors.iter().sum::<f64>() / errors.len() as f64)
    }
}

pub fn assemble(snapshot: &GraphSnapshot, options: &AssemblyOptions) -> Assembled {
    let mut problem = Problem::new();
    let free = |slot: usize| options.free_poses.get(slot).copied().unwrap_or(false);

    let pose_blocks: Vec<BlockId> = snapshot
        .poses
        .iter()
        .enumerate()
        .map(|(slot, p)| problem.add_block(p.t_wp.to_params().as_slice(), !free(slot)))
        .collect();

    let (velocity_blocks, bias_blocks) = if options.use_imu {
        let mut vel = Vec::with_capacity(snapshot.poses.len());
        let mut bias = Vec::with_capacity(snapshot.poses.len());
        for (slot, p) in snapshot.poses.iter().enumerate() {
            vel.push(problem.add_block(p.v_w.as_slice(), !free(slot)));
            bias.push(problem.add_block(&p.bias.to_params(), !free(slot)));
        }
        (vel, bias)
    } else {
        (Vec::new(), Vec::new())
    };

    let ext = snapshot.rig.t_vs.log_decoupled();
    let extrinsic_translation = problem.add_block(&ext.as_slice()[0..3], !options.free_extrinsic_translation);
    let extrinsic_rotation = problem.add_block(&ext.as_slice()[3..6], !options.free_extrinsic_rotation);

    let intrinsics = match options.intrinsics {
        IntrinsicsMode::Free => Some(problem.add_block(snapshot.rig.intrinsics.params.as_slice(), false)),
        _ => None,
    };
    let model = snapshot.rig.intrinsics.model;
    let loss = options.huber_px.map(|w| HuberLoss::new(w / options.sigma_px));

    let mut rho_blocks = Vec::with_capacity(snapshot.tracks.len());
    let mut projections = Vec::new();
    for (t, track) in snapshot.tracks.iter().enumerate() {
        let fixed = !options.free_structure || options.fixed_track == Some(track.id);
        let rho = problem.add_block(&[track.rho], fixed);
        rho_blocks.push(rho);

        let Some(ref_slot) = snapshot.slot(track.ref_pose) else { continue };
        for &(pose_index, px) in &track.observations {
            let Some(obs_slot) = snapshot.slot(pose_index) else { continue };
            let fixed_intrinsics = match options.intrinsics {
                IntrinsicsMode::PerPose => Some(snapshot.poses[obs_slot].cam_params.as_slice().to_vec()),
                IntrinsicsMode::Rig => Some(snapshot.rig.intrinsics.params.as_slice().to_vec()),
                IntrinsicsMode::Free => None,
            };
            let cost = ProjectionCost {
                model,
                intrinsics: fixed_intrinsics,
                ref_px: track.ref_px,
                ray: track.ray,
                recompute_ray: options.intrinsics == IntrinsicsMode::Free,
                observed: px,
                sigma_px: options.sigma_px,
            };
            let mut blocks = vec![
                pose_blocks[ref_slot],
                pose_blocks[obs_slot],
                rho,
                extrinsic_translation,
                extrinsic_rotation,
            ];
            if let Some(k) = intrinsics {
                blocks.push(k);
            }
            let conditioning = !free(ref_slot) || !free(obs_slot);
            let residual = problem.add_residual(ResidualKind::Projection, blocks, Box::new(cost), loss, conditioning);
            projections.push(ProjectionRef {
                track: t,
                pose_index,
                residual,
            });
        }
    }

    let mut inertial = Vec::new();
    if options.use_imu {
        for segment in &snapshot.imu {
            let (Some(i), Some(j)) = (snapshot.slot(segment.from), snapshot.slot(segment.to)) else {
                continue;
            };
            if !free(i) && !free(j) {
                continue;
            }
            let blocks = vec![
                pose_blocks[i],
                velocity_blocks[i],
                bias_blocks[i],
                pose_blocks[j],
                velocity_blocks[j],
                bias_blocks[j],
            ];
            let cost = InertialCost::new(segment.samples.clone(), options.noise);
            let conditioning = !free(i) || !free(j);
            let residual = problem.add_residual(ResidualKind::Inertial, blocks, Box::new(cost), None, conditioning);
            inertial.push(InertialRef {
                from: segment.from,
                to: segment.to,
                residual,
            });
        }
    }

    Assembled {
        problem,
        pose_blocks,
        velocity_blocks,
        bias_blocks,
        rho_blocks,
        extrinsic_translation,
        extrinsic_rotation,
        intrinsics,
        projections,
        inertial,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{Scenario, SimulationConfig};

    fn snapshot(n: usize, with_imu: bool) -> GraphSnapshot {
        let sim = Scenario::new(SimulationConfig::default());
        let (graph, imu) = sim.build_graph(n);
        let indices: Vec<usize> = (0..n).collect();
        GraphSnapshot::collect(&graph, with_imu.then_some(&imu), &sim.true_rig(), &indices)
    }

    fn options(snap: &GraphSnapshot, use_imu: bool) -> AssemblyOptions {
        AssemblyOptions {
            free_poses: (0..snap.poses.len()).map(|s| s > 0).collect(),
            use_imu,
            free_structure: true,
            fixed_track: None,
            intrinsics: IntrinsicsMode::PerPose,
            free_extrinsic_translation: false,
            free_extrinsic_rotation: false,
            huber_px: None,
            sigma_px: 1.0,
            noise: ImuNoise::default(),
        }
    }

    #[test]
    fn test_snapshot_collects_tracks_and_segments() {
        let snap = snapshot(6, true);
        assert_eq!(snap.poses.len(), 6);
        assert_eq!(snap.imu.len(), 5);
        assert!(!snap.tracks.is_empty());
        for track in &snap.tracks {
            assert!(track.observations.iter().all(|(p, _)| *p > track.ref_pose));
        }
        assert_eq!(snap.slot(3), Some(3));
    }

    #[test]
    fn test_non_contiguous_snapshot_skips_imu_gaps() {
        let sim = Scenario::new(SimulationConfig::default());
        let (graph, imu) = sim.build_graph(8);
        let snap = GraphSnapshot::collect(&graph, Some(&imu), &sim.true_rig(), &[0, 1, 2, 5, 6]);
        assert_eq!(snap.imu.len(), 3);
        assert_eq!(snap.slot(5), Some(3));
        assert_eq!(snap.slot(4), None);
    }

    #[test]
    fn test_conditioning_flags_follow_fixed_poses() {
        let snap = snapshot(5, true);
        let assembled = assemble(&snap, &options(&snap, true));
        let first = assembled.inertial.iter().find(|r| r.from == 0).unwrap();
        assert!(assembled.problem.residuals[first.residual].conditioning);
        let later = assembled.inertial.iter().find(|r| r.from == 2).unwrap();
        assert!(!assembled.problem.residuals[later.residual].conditioning);
        assert!(assembled.problem.is_fixed(assembled.pose_blocks[0]));
        assert!(assembled.problem.is_fixed(assembled.extrinsic_rotation));
    }

    #[test]
    fn test_ground_truth_is_near_zero_cost() {
        let snap = snapshot(5, false);
        let assembled = assemble(&snap, &options(&snap, false));
        let n = assembled.problem.num_residuals() as f64;
        // Pixel noise of 0.5 px at sigma 1 px.
        assert!(assembled.problem.total_cost() / n < 2.0);
        assert!(assembled.mean_pixel_error(4, 1.0).unwrap() < 2.0);
    }
}
