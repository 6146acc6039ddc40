//! Deterministic synthetic visual-inertial data.
//!
//! A `Scenario` fixes a landmark field, a rig and a trajectory. The
//! `SimulatedTracker` then plays the tracker's role: it renders noisy
//! observations keyframe by keyframe and hands them over as
//! `KeyframeInput`s, exactly like the real front end would.

pub mod trajectory;

use std::collections::HashMap;

use nalgebra::{UnitQuaternion, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::camera::{CameraIntrinsics, Rig};
use crate::geometry::SE3;
use crate::graph::{KeyframeInput, NewTrack, PoseGraph, TrackId, TrackObservation};
use crate::imu::{ImuBias, ImuBuffer, ImuSample};

pub use trajectory::{BodyState, Trajectory};

/// Landmarks closer than this along the optical axis are not observed.
const MIN_VISIBLE_DEPTH: f64 = 0.5;
const IMAGE_MARGIN_PX: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub seed: u64,
    pub num_landmarks: usize,
    pub keyframe_dt: f64,
    pub imu_rate_hz: f64,
    pub pixel_noise: f64,
    pub gyro_noise: f64,
    pub accel_noise: f64,
    /// Noise on the tracker's pose estimate (meters, radians).
    pub pose_noise: f64,
    /// A track is handed over as lost after this many keyframes and the
    /// landmark re-detected as a new track.
    pub max_track_length: usize,
    pub trajectory: Trajectory,
    pub intrinsics: CameraIntrinsics,
    pub t_vs: SE3,
    /// From this keyframe on, observations are rendered with different
    /// intrinsics.
    pub intrinsics_change: Option<(usize, CameraIntrinsics)>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 7,
            num_landmarks: 120,
            keyframe_dt: 0.25,
            imu_rate_hz: 200.0,
            pixel_noise: 0.5,
            gyro_noise: 0.0,
            accel_noise: 0.0,
            pose_noise: 0.0,
            max_track_length: 8,
            trajectory: Trajectory::default(),
            intrinsics: CameraIntrinsics::pinhole(640, 480, 400.0, 400.0, 320.0, 240.0),
            t_vs: SE3::from_rt(
                UnitQuaternion::from_euler_angles(0.02, -0.01, 0.03),
                Vector3::new(0.05, -0.02, 0.01),
            ),
            intrinsics_change: None,
        }
    }
}

/// Standard normal sample (Box-Muller).
pub fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn gaussian3(rng: &mut StdRng, sigma: f64) -> Vector3<f64> {
    if sigma == 0.0 {
        return Vector3::zeros();
    }
    Vector3::new(gaussian(rng), gaussian(rng), gaussian(rng)) * sigma
}

fn gaussian2(rng: &mut StdRng, sigma: f64) -> Vector2<f64> {
    if sigma == 0.0 {
        return Vector2::zeros();
    }
    Vector2::new(gaussian(rng), gaussian(rng)) * sigma
}

pub struct Scenario {
    config: SimulationConfig,
    landmarks: Vec<Vector3<f64>>,
}

impl Scenario {
    pub fn new(config: SimulationConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let landmarks = (0..config.num_landmarks)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(4.0..8.0),
                    rng.gen_range(-3.0..3.0),
                    rng.gen_range(-2.0..2.0),
                )
            })
            .collect();
        Self { config, landmarks }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn landmarks(&self) -> &[Vector3<f64>] {
        &self.landmarks
    }

    /// The rig observations are rendered with at the start.
    pub fn true_rig(&self) -> Rig {
        Rig::new(self.config.intrinsics.clone(), self.config.t_vs)
    }

    /// The rig in effect at keyframe `k`.
    pub fn true_rig_at(&self, k: usize) -> Rig {
        match &self.config.intrinsics_change {
            Some((from, intrinsics)) if k >= *from => Rig::new(intrinsics.clone(), self.config.t_vs),
            _ => self.true_rig(),
        }
    }

    pub fn keyframe_time(&self, k: usize) -> f64 {
        k as f64 * self.config.keyframe_dt
    }

    pub fn state(&self, t: f64) -> BodyState {
        self.config.trajectory.state(t)
    }

    /// Pixel of landmark `l` seen from body pose `t_wp`, with its depth.
    fn render(&self, rig: &Rig, t_wp: &SE3, l: usize) -> Option<(Vector2<f64>, f64)> {
        let p_cam = rig.camera_pose(t_wp).inverse().transform_point(&self.landmarks[l]);
        if p_cam.z < MIN_VISIBLE_DEPTH {
            return None;
        }
        let px = rig.intrinsics.project(&p_cam)?;
        let m = IMAGE_MARGIN_PX;
        let inside = px.x >= m
            && px.y >= m
            && px.x < rig.intrinsics.width as f64 - m
            && px.y < rig.intrinsics.height as f64 - m;
        inside.then_some((px, p_cam.norm()))
    }

    pub fn tracker(&self) -> SimulatedTracker<'_> {
        SimulatedTracker::new(self)
    }

    /// Graph of the first `n` keyframes built with the true rig, plus the
    /// IMU stream covering them.
    pub fn build_graph(&self, n: usize) -> (PoseGraph, ImuBuffer) {
        let mut graph = PoseGraph::new();
        let mut imu = ImuBuffer::new(1 << 20);
        let mut tracker = self.tracker();
        for k in 0..n {
            let frame = tracker.next_keyframe();
            for sample in &frame.imu {
                imu.add(*sample);
            }
            let rig = self.true_rig_at(k);
            match graph.insert_keyframe(&frame, &rig.intrinsics) {
                Ok((_, ids)) => tracker.register_new_tracks(&ids),
                Err(e) => {
                    warn!(error = %e, keyframe = k, "simulated keyframe rejected");
                    break;
                }
            }
        }
        (graph, imu)
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveTrack {
    id: TrackId,
    length: usize,
}

/// Plays the feature tracker over a `Scenario`.
pub struct SimulatedTracker<'a> {
    scenario: &'a Scenario,
    rng: StdRng,
    next_keyframe: usize,
    next_imu: i64,
    active: HashMap<usize, ActiveTrack>,
    /// Landmarks of the last keyframe's new tracks, awaiting graph ids.
    pending: Vec<usize>,
}

impl<'a> SimulatedTracker<'a> {
    fn new(scenario: &'a Scenario) -> Self {
        let lead = (0.05 * scenario.config.imu_rate_hz).ceil() as i64;
        Self {
            scenario,
            rng: StdRng::seed_from_u64(scenario.config.seed.wrapping_add(1)),
            next_keyframe: 0,
            next_imu: -lead,
            active: HashMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn keyframe_index(&self) -> usize {
        self.next_keyframe
    }

    fn imu_until(&mut self, t: f64) -> Vec<ImuSample> {
        let config = &self.scenario.config;
        let step = 1.0 / config.imu_rate_hz;
        let mut samples = Vec::new();
        // One sample past `t` so the keyframe interval is fully covered.
        while (self.next_imu as f64) * step <= t + 1.5 * step {
            let ts = self.next_imu as f64 * step;
            let s = self.scenario.state(ts);
            let accel = s.specific_force() + gaussian3(&mut self.rng, config.accel_noise);
            let gyro = s.gyro + gaussian3(&mut self.rng, config.gyro_noise);
            samples.push(ImuSample::new(ts, accel, gyro));
            self.next_imu += 1;
        }
        samples
    }

    /// Renders the next keyframe.
    pub fn next_keyframe(&mut self) -> KeyframeInput {
        let k = self.next_keyframe;
        self.next_keyframe += 1;
        let scenario = self.scenario;
        let config = &scenario.config;
        let t = scenario.keyframe_time(k);
        let state = scenario.state(t);
        let rig = scenario.true_rig_at(k);

        let mut observations = Vec::new();
        let mut lost = Vec::new();
        let mut new_tracks = Vec::new();
        self.pending.clear();

        for l in 0..scenario.landmarks.len() {
            let seen = scenario.render(&rig, &state.t_wp, l);
            if let Some(track) = self.active.get_mut(&l) {
                match seen {
                    Some((px, _)) if track.length < config.max_track_length => {
                        track.length += 1;
                        observations.push(TrackObservation {
                            id: track.id,
                            px: px + gaussian2(&mut self.rng, config.pixel_noise),
                            tracked: true,
                        });
                        continue;
                    }
                    _ => {
                        lost.push(track.id);
                        self.active.remove(&l);
                    }
                }
            }
            if let Some((px, depth)) = seen {
                new_tracks.push(NewTrack {
                    center_px: px + gaussian2(&mut self.rng, config.pixel_noise),
                    rho: 1.0 / depth,
                });
                self.pending.push(l);
            }
        }

        let t_wp = if config.pose_noise > 0.0 {
            let dr = gaussian3(&mut self.rng, config.pose_noise);
            let dt = gaussian3(&mut self.rng, config.pose_noise);
            state.t_wp.compose(&SE3::from_rt(UnitQuaternion::from_scaled_axis(dr), dt))
        } else {
            state.t_wp
        };

        let num_successful_tracks = observations.iter().filter(|o| o.tracked).count();
        KeyframeInput {
            time: t,
            t_wp,
            v_w: state.v_w,
            bias: ImuBias::zero(),
            observations,
            lost,
            new_tracks,
            imu: self.imu_until(t),
            num_successful_tracks,
        }
    }

    /// Renders the next keyframe with its pose expressed through `t_vs`,
    /// the way a tracker that believes `t_vs` would report it: the camera
    /// pose is right, the body pose carries the extrinsic error.
    pub fn next_keyframe_through(&mut self, t_vs: &SE3) -> KeyframeInput {
        let true_t_vs = self.scenario.true_rig_at(self.next_keyframe).t_vs;
        let mut frame = self.next_keyframe();
        frame.t_wp = frame.t_wp.compose(&true_t_vs).compose(&t_vs.inverse());
        frame
    }

    /// Binds the ids the graph assigned to the last keyframe's new tracks.
    pub fn register_new_tracks(&mut self, ids: &[TrackId]) {
        for (&l, &id) in self.pending.iter().zip(ids) {
            self.active.insert(l, ActiveTrack { id, length: 1 });
        }
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_same_seed_same_data() {
        let a = Scenario::new(SimulationConfig::default());
        let b = Scenario::new(SimulationConfig::default());
        assert_eq!(a.landmarks(), b.landmarks());
        let (ga, _) = a.build_graph(4);
        let (gb, _) = b.build_graph(4);
        assert_eq!(ga.num_tracks(), gb.num_tracks());
        assert_eq!(ga.tracks()[3].ref_keypoint.center_px, gb.tracks()[3].ref_keypoint.center_px);
        assert_eq!(ga.pose(3).unwrap().t_wp, gb.pose(3).unwrap().t_wp);
    }

    #[test]
    fn test_keyframe_through_wrong_extrinsic_keeps_camera_pose() {
        let sim = Scenario::new(SimulationConfig::default());
        let truth = sim.true_rig();
        let mut exact = sim.tracker();
        let mut through = sim.tracker();

        let a = exact.next_keyframe();
        let b = through.next_keyframe_through(&truth.t_vs);
        assert_relative_eq!(a.t_wp.translation, b.t_wp.translation, epsilon = 1e-12);

        let a = exact.next_keyframe();
        let b = through.next_keyframe_through(&SE3::identity());
        let camera = a.t_wp.compose(&truth.t_vs);
        assert_relative_eq!(b.t_wp.translation, camera.translation, epsilon = 1e-12);
        assert!(b.t_wp.rotation.angle_to(&camera.rotation) < 1e-12);
        assert_eq!(a.observations.len(), b.observations.len());
    }

    #[test]
    fn test_graph_has_usable_structure() {
        let sim = Scenario::new(SimulationConfig::default());
        let (graph, imu) = sim.build_graph(12);
        assert_eq!(graph.num_poses(), 12);
        assert!(graph.tracks().iter().filter(|t| t.is_usable()).count() > 40);
        assert!(graph.tracks().iter().all(|t| t.observations.len() <= 8));
        // IMU covers every keyframe interval.
        for k in 1..12 {
            let samples = imu.range(sim.keyframe_time(k - 1), sim.keyframe_time(k));
            assert!(samples.len() > 40);
        }
    }

    #[test]
    fn test_gaussian_moments() {
        let mut rng = StdRng::seed_from_u64(3);
        let n = 20000;
        let xs: Vec<f64> = (0..n).map(|_| gaussian(&mut rng)).collect();
        let mean = xs.iter().sum::<f64>() / n as f64;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.05);
        assert!((var - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_intrinsics_change_applies_from_keyframe() {
        let changed = CameraIntrinsics::pinhole(640, 480, 360.0, 360.0, 320.0, 240.0);
        let sim = Scenario::new(SimulationConfig {
            intrinsics_change: Some((5, changed)),
            ..Default::default()
        });
        assert_eq!(sim.true_rig_at(4).intrinsics.params[0], 400.0);
        assert_eq!(sim.true_rig_at(5).intrinsics.params[0], 360.0);
    }
}
