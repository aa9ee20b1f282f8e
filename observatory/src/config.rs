//! Observatory configuration
//!
//! One JSON file for the site and run parameters, one for the filter
//! wheel layout. Loaded once in `main` and passed by reference; no
//! globals. Every field has a default so a partial file (or none at
//! all) still yields a runnable configuration.

use crate::devices::PollPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_latitude() -> f64 {
    38.828
}

fn default_longitude() -> f64 {
    -77.305
}

fn default_data_directory() -> PathBuf {
    PathBuf::from("data")
}

fn default_weather_freq_minutes() -> f64 {
    15.0
}

fn default_slew_timeout_secs() -> f64 {
    60.0
}

fn default_live_timeout_secs() -> f64 {
    10.0
}

fn default_exposure_grace_secs() -> f64 {
    60.0
}

fn default_camera_process() -> String {
    "MaxIm_DL.exe".into()
}

fn default_crash_recovery_wait_secs() -> f64 {
    5.0
}

fn default_true() -> bool {
    true
}

/// Parameters of the initial-focus descent and the maintenance task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusConfig {
    /// Probe exposure length, seconds.
    pub probe_exposure_secs: f64,
    /// First relative move of the descent, focuser steps.
    pub initial_step: u32,
    /// Descent stops once the step shrinks below this.
    pub min_step: u32,
    /// FWHM (pixels) considered good enough to stop early.
    pub target_fwhm: f64,
    /// Drift past baseline + tolerance triggers a maintenance nudge.
    pub tolerance_fwhm: f64,
    /// Seconds between maintenance probes.
    pub maintenance_interval_secs: f64,
    /// Hard cap on descent iterations.
    pub max_iterations: u32,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            probe_exposure_secs: 10.0,
            initial_step: 50,
            min_step: 5,
            target_fwhm: 3.0,
            tolerance_fwhm: 1.0,
            maintenance_interval_secs: 900.0,
            max_iterations: 20,
        }
    }
}

/// Calibration frames taken after the ticket list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub flat_count: u32,
    pub flat_exposure_secs: f64,
    pub dark_count: u32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            flat_count: 10,
            flat_exposure_secs: 5.0,
            dark_count: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservatoryConfig {
    #[serde(default = "default_latitude")]
    pub site_latitude: f64,
    #[serde(default = "default_longitude")]
    pub site_longitude: f64,
    /// Root for image output; each run writes into a per-ticket
    /// subdirectory beneath it.
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,
    /// Conditions endpoint; empty means run against the simulator.
    #[serde(default)]
    pub safety_monitor_url: String,
    #[serde(default = "default_weather_freq_minutes")]
    pub weather_freq_minutes: f64,
    #[serde(default = "default_slew_timeout_secs")]
    pub slew_timeout_secs: f64,
    #[serde(default = "default_live_timeout_secs")]
    pub live_timeout_secs: f64,
    /// Extra slack on top of 2x the exposure when waiting for a frame.
    #[serde(default = "default_exposure_grace_secs")]
    pub exposure_grace_secs: f64,
    #[serde(default)]
    pub poll: PollPolicy,
    /// Camera control process watched for responsiveness.
    #[serde(default = "default_camera_process")]
    pub camera_process: String,
    #[serde(default = "default_crash_recovery_wait_secs")]
    pub crash_recovery_wait_secs: f64,
    /// Pause before the first science frame until an operator confirms.
    #[serde(default)]
    pub confirm_before_imaging: bool,
    /// Stop every actor loop at the end of the run.
    #[serde(default = "default_true")]
    pub stop_threads_on_shutdown: bool,
    #[serde(default)]
    pub focus: FocusConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
}

impl Default for ObservatoryConfig {
    fn default() -> Self {
        Self {
            site_latitude: default_latitude(),
            site_longitude: default_longitude(),
            data_directory: default_data_directory(),
            safety_monitor_url: String::new(),
            weather_freq_minutes: default_weather_freq_minutes(),
            slew_timeout_secs: default_slew_timeout_secs(),
            live_timeout_secs: default_live_timeout_secs(),
            exposure_grace_secs: default_exposure_grace_secs(),
            poll: PollPolicy::default(),
            camera_process: default_camera_process(),
            crash_recovery_wait_secs: default_crash_recovery_wait_secs(),
            confirm_before_imaging: false,
            stop_threads_on_shutdown: true,
            focus: FocusConfig::default(),
            calibration: CalibrationConfig::default(),
        }
    }
}

impl ObservatoryConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("cannot parse config {}", path.display()))
    }

    pub fn weather_cadence(&self) -> Duration {
        Duration::from_secs_f64((self.weather_freq_minutes * 60.0).max(1.0))
    }

    pub fn slew_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.slew_timeout_secs)
    }

    pub fn live_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.live_timeout_secs)
    }

    pub fn crash_recovery_wait(&self) -> Duration {
        Duration::from_secs_f64(self.crash_recovery_wait_secs)
    }

    pub fn exposure_wait(&self, exposure_secs: f64) -> Duration {
        Duration::from_secs_f64(2.0 * exposure_secs + self.exposure_grace_secs)
    }
}

fn default_positions() -> HashMap<String, u32> {
    [("L", 0u32), ("R", 1), ("G", 2), ("B", 3), ("Ha", 4)]
        .into_iter()
        .map(|(name, position)| (name.to_string(), position))
        .collect()
}

/// Filter name to wheel slot mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterWheelConfig {
    #[serde(default = "default_positions")]
    pub positions: HashMap<String, u32>,
}

impl Default for FilterWheelConfig {
    fn default() -> Self {
        Self {
            positions: default_positions(),
        }
    }
}

impl FilterWheelConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read filter config {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("cannot parse filter config {}", path.display()))
    }

    /// Wheel slot for a named filter; unknown names fall back to slot 0
    /// with a warning rather than killing the run.
    pub fn position_for(&self, filter: &str) -> u32 {
        match self.positions.get(filter) {
            Some(&position) => position,
            None => {
                tracing::warn!("filter '{filter}' is not in the wheel config, using slot 0");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: ObservatoryConfig =
            serde_json::from_str(r#"{"site_latitude": 31.96, "slew_timeout_secs": 30.0}"#)
                .unwrap();
        assert_eq!(config.site_latitude, 31.96);
        assert_eq!(config.slew_timeout_secs, 30.0);
        assert_eq!(config.live_timeout_secs, 10.0);
        assert!(config.stop_threads_on_shutdown);
        assert_eq!(config.focus.min_step, 5);
    }

    #[test]
    fn test_exposure_wait_scales_with_exposure() {
        let config = ObservatoryConfig::default();
        assert_eq!(
            config.exposure_wait(120.0),
            Duration::from_secs_f64(300.0)
        );
    }

    #[test]
    fn test_filter_positions_fall_back_to_slot_zero() {
        let wheel = FilterWheelConfig::default();
        assert_eq!(wheel.position_for("R"), 1);
        assert_eq!(wheel.position_for("nonexistent"), 0);
    }
}
