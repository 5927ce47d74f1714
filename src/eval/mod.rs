use anyhow::{Result, bail};
use serde::Serialize;

pub mod iou;
pub mod matcher;
pub mod metrics;
pub mod normalize;
pub mod recovery;
pub mod similarity;

pub const DEFAULT_NAME_SIM_THRESHOLD: f64 = 0.8;
pub const DEFAULT_UNIT_SIM_THRESHOLD: f64 = 0.5;
pub const DEFAULT_NUMERIC_TOLERANCE: f64 = 0.01;
pub const DEFAULT_IOU_THRESHOLD: f64 = 0.5;
pub const DEFAULT_MIN_NAME_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoringConfig {
    pub name_sim_threshold: f64,
    pub unit_sim_threshold: f64,
    pub numeric_tolerance: f64,
    pub iou_threshold: f64,
    pub min_name_len: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            name_sim_threshold: DEFAULT_NAME_SIM_THRESHOLD,
            unit_sim_threshold: DEFAULT_UNIT_SIM_THRESHOLD,
            numeric_tolerance: DEFAULT_NUMERIC_TOLERANCE,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            min_name_len: DEFAULT_MIN_NAME_LEN,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("name-sim-threshold", self.name_sim_threshold),
            ("unit-sim-threshold", self.unit_sim_threshold),
            ("iou-threshold", self.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("--{name} must be within [0, 1], got {value}");
            }
        }
        if !self.numeric_tolerance.is_finite() || self.numeric_tolerance < 0.0 {
            bail!(
                "--numeric-tolerance must be a non-negative number, got {}",
                self.numeric_tolerance
            );
        }
        Ok(())
    }
}
