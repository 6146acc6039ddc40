//! Runtime configuration.
//!
//! Every tunable lives here with its default; a YAML file only needs to name
//! the values it overrides.

use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::calibration::{AggregationMode, EstimatorConfig, TvsInitConfig};
use crate::conditioning::ConditioningConfig;
use crate::imu::ImuNoise;
use crate::optimizer::BundleAdjustmentConfig;

/// Per-sensor calibration settings.
///
/// Fields missing from a YAML `camera:` or `imu:` section fall back to the
/// camera defaults; omit the whole section to get the sensor's own defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub enabled: bool,
    /// Treat the calibration as unknown from the first pose.
    pub unknown_at_start: bool,
    pub detect_changes: bool,
    pub queue_capacity: usize,
    /// Relative score improvement a candidate needs over an incumbent.
    pub acceptance_margin: f64,
    /// Poses per online candidate window.
    pub segment_length: usize,
    pub num_change_needed: u32,
    pub divergence_threshold: f64,
    /// Scoring weights, one per calibration parameter.
    pub weights: Vec<f64>,
    pub aggregation: AggregationMode,
    /// Run queue aggregation on a worker thread.
    pub async_queue: bool,
}

impl SensorConfig {
    pub fn camera() -> Self {
        Self {
            enabled: true,
            unknown_at_start: true,
            detect_changes: true,
            queue_capacity: 5,
            acceptance_margin: 0.05,
            segment_length: 10,
            num_change_needed: 3,
            divergence_threshold: 0.2,
            weights: vec![1.0, 1.0, 1.7, 1.7, 320000.0],
            aggregation: AggregationMode::InformationFusion,
            async_queue: false,
        }
    }

    pub fn imu() -> Self {
        Self {
            enabled: true,
            unknown_at_start: false,
            detect_changes: false,
            queue_capacity: 10,
            acceptance_margin: 0.20,
            segment_length: 30,
            weights: vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
            ..Self::camera()
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self::camera()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfCalConfig {
    pub has_imu: bool,
    pub use_imu: bool,
    /// Write accepted estimates into the live rig.
    pub apply_results: bool,
    /// Estimate only the extrinsic rotation.
    pub imu_rotation_only: bool,
    /// Field of view of the intrinsics seed used when the camera becomes
    /// unknown.
    pub seed_fov_deg: f64,
    pub batch_iterations: usize,
    pub selfcal_iterations: usize,
    /// Batch estimates below this uncertainty count as converged.
    pub batch_convergence_uncertainty: f64,
    /// Inertial residuals join the tracking BA past this many poses.
    pub min_poses_for_imu: usize,
    pub camera: SensorConfig,
    pub imu: SensorConfig,
    pub bundle_adjustment: BundleAdjustmentConfig,
    pub conditioning: ConditioningConfig,
    pub imu_noise: ImuNoise,
    pub tvs_init: TvsInitConfig,
    pub estimator: EstimatorConfig,
}

impl Default for SelfCalConfig {
    fn default() -> Self {
        Self {
            has_imu: true,
            use_imu: true,
            apply_results: true,
            imu_rotation_only: false,
            seed_fov_deg: 90.0,
            batch_iterations: 50,
            selfcal_iterations: 20,
            batch_convergence_uncertainty: 1e7,
            min_poses_for_imu: 15,
            camera: SensorConfig::camera(),
            imu: SensorConfig::imu(),
            bundle_adjustment: BundleAdjustmentConfig::default(),
            conditioning: ConditioningConfig::default(),
            imu_noise: ImuNoise::default(),
            tvs_init: TvsInitConfig::default(),
            estimator: EstimatorConfig::default(),
        }
    }
}

impl SelfCalConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open config {}", path.display()))?;
        let config: Self =
            serde_yaml::from_reader(file).with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, sensor) in [("camera", &self.camera), ("imu", &self.imu)] {
            if sensor.queue_capacity == 0 {
                bail!("{} queue_capacity must be positive", name);
            }
            if sensor.segment_length < 2 {
                bail!("{} segment_length must be at least 2", name);
            }
            if !(sensor.acceptance_margin >= 0.0) {
                bail!("{} acceptance_margin must be non-negative", name);
            }
        }
        if self.camera.acceptance_margin >= self.imu.acceptance_margin {
            warn!(
                camera = self.camera.acceptance_margin,
                imu = self.imu.acceptance_margin,
                "camera acceptance margin is not below the IMU margin"
            );
        }
        if self.conditioning.baseline_poses == 0 {
            bail!("conditioning baseline_poses must be positive");
        }
        if !(self.conditioning.confidence > 0.0 && self.conditioning.confidence < 1.0) {
            bail!("conditioning confidence must lie in (0, 1)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_defaults_match_sensor_roles() {
        let config = SelfCalConfig::default();
        assert_relative_eq!(config.camera.acceptance_margin, 0.05);
        assert_relative_eq!(config.imu.acceptance_margin, 0.20);
        assert!(config.camera.acceptance_margin < config.imu.acceptance_margin);
        assert_eq!(config.camera.queue_capacity, 5);
        assert_eq!(config.imu.queue_capacity, 10);
        assert_eq!(config.camera.segment_length, 10);
        assert_eq!(config.imu.segment_length, 30);
        assert!(config.camera.unknown_at_start);
        assert!(!config.imu.detect_changes);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let config = SelfCalConfig::from_yaml_str(
            r#"
has_imu: false
camera:
  acceptance_margin: 0.1
  aggregation: JointSolve
conditioning:
  increment: 15
"#,
        )
        .unwrap();
        assert!(!config.has_imu);
        assert_relative_eq!(config.camera.acceptance_margin, 0.1);
        assert_eq!(config.camera.aggregation, AggregationMode::JointSolve);
        assert_eq!(config.camera.queue_capacity, 5);
        assert_eq!(config.imu.queue_capacity, 10);
        assert_eq!(config.conditioning.increment, 15);
        assert_eq!(config.conditioning.baseline_poses, 20);
        assert_eq!(config.bundle_adjustment.poses_to_init, 30);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(SelfCalConfig::from_yaml_str("camera:\n  queue_capacity: 0\n").is_err());
        assert!(SelfCalConfig::from_yaml_str("conditioning:\n  confidence: 1.5\n").is_err());
        assert!(SelfCalConfig::from_yaml_str("camera: [1, 2]\n").is_err());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = SelfCalConfig::from_yaml_file("/nonexistent/selfcal.yaml").unwrap_err();
        assert!(format!("{}", err).contains("/nonexistent/selfcal.yaml"));
    }
}
