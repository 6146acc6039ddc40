use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vi_selfcal::calibration::SensorKind;
use vi_selfcal::camera::CameraIntrinsics;
use vi_selfcal::config::SelfCalConfig;
use vi_selfcal::simulation::{Scenario, SimulationConfig};
use vi_selfcal::system::SelfCalSystem;

const NUM_KEYFRAMES: usize = 120;
/// Keyframe at which the simulated lens is swapped.
const CHANGE_AT: usize = 60;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vi_selfcal=info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!(path = %path, "loading configuration");
            SelfCalConfig::from_yaml_file(&path)?
        }
        None => SelfCalConfig::default(),
    };

    let scenario = Scenario::new(SimulationConfig {
        intrinsics_change: Some((CHANGE_AT, CameraIntrinsics::pinhole(640, 480, 430.0, 428.0, 318.0, 243.0))),
        ..SimulationConfig::default()
    });
    info!(
        keyframes = NUM_KEYFRAMES,
        change_at = CHANGE_AT,
        landmarks = scenario.landmarks().len(),
        "running simulated sequence"
    );

    let mut system = SelfCalSystem::new(config, scenario.true_rig())?;
    let mut tracker = scenario.tracker();

    for k in 0..NUM_KEYFRAMES {
        let frame = tracker.next_keyframe_through(&system.live_rig().t_vs);
        let outcome = system
            .process_keyframe(frame)
            .with_context(|| format!("keyframe {} rejected", k))?;
        tracker.register_new_tracks(&outcome.new_tracks);

        for sensor in &outcome.converged {
            info!(keyframe = k, sensor = %sensor, "batch calibration converged");
        }
        for sensor in &outcome.changes {
            info!(keyframe = k, sensor = %sensor, "calibration change detected");
        }
        if outcome.used_motion_guess {
            warn!(keyframe = k, "tracker pose replaced by the motion model");
        }
        if k % 20 == 0 {
            let rig = system.live_rig();
            info!(
                keyframe = k,
                camera = ?outcome.camera,
                imu = ?outcome.imu,
                intrinsics = ?rig.intrinsics.params.as_slice(),
                error = ?outcome.last_frame_error,
                "progress"
            );
        }
    }

    system.shutdown();

    let rig = system.live_rig();
    let truth = scenario.true_rig_at(NUM_KEYFRAMES - 1);
    info!(
        estimated = ?rig.intrinsics.params.as_slice(),
        truth = ?truth.intrinsics.params.as_slice(),
        "final intrinsics"
    );
    info!(
        translation = ?rig.t_vs.translation.as_slice(),
        truth = ?truth.t_vs.translation.as_slice(),
        "final camera-to-body translation"
    );
    info!(
        camera = ?system.calibration_state(SensorKind::Camera),
        imu = ?system.calibration_state(SensorKind::Imu),
        "final calibration states"
    );

    let metrics = system.metrics();
    info!(
        windows = metrics.windows_analysed,
        changes = metrics.changes_detected,
        batches = metrics.batches_converged,
        rig_updates = metrics.rig_updates,
        "calibration counters"
    );
    info!(
        ba_calls = metrics.bundle_adjustment.calls,
        ba_mean_ms = metrics.bundle_adjustment.mean().as_secs_f64() * 1e3,
        conditioning_calls = metrics.conditioning.calls,
        queue_calls = metrics.queue.calls,
        "timing"
    );
    Ok(())
}
