pub mod calibration;
pub mod camera;
pub mod conditioning;
pub mod config;
pub mod geometry;
pub mod graph;
pub mod imu;
pub mod metrics;
pub mod optimizer;
pub mod simulation;
pub mod stats;
pub mod system;
pub mod tracking;
