//! Calibration frames
//!
//! After the ticket list finishes, the run takes flat fields under the
//! flat lamp for every filter the night used, then dark frames
//! matching the science exposure lengths. Both go through the same
//! camera queue and numbering scheme as science frames.

use crate::config::{CalibrationConfig, FilterWheelConfig};
use crate::devices::{CameraCommand, CameraRig, LampCommand, LampRig};
use crate::sequence::frame_file_name;
use std::path::Path;
use std::time::Duration;

const DARK_LABEL: &str = "dark";

/// Take the night's flats and darks. Returns the number of frames that
/// actually landed on disk; a failed frame is logged and skipped.
pub async fn take_calibration_frames(
    camera: &CameraRig,
    lamp: &LampRig,
    wheel: &FilterWheelConfig,
    config: &CalibrationConfig,
    filters: &[String],
    dark_exposures: &[f64],
    out_dir: &Path,
) -> u32 {
    let mut taken = 0;

    switch_lamp(lamp, true).await;
    for filter in filters {
        let position = wheel.position_for(filter);
        for index in 1..=config.flat_count {
            let frame = out_dir.join(frame_file_name(
                "Flat",
                config.flat_exposure_secs,
                filter,
                index,
            ));
            if expose(camera, config.flat_exposure_secs, position, &frame).await {
                taken += 1;
            }
        }
        tracing::info!("flats complete for filter {filter}");
    }
    switch_lamp(lamp, false).await;

    let mut exposures: Vec<f64> = Vec::new();
    for &exposure in dark_exposures {
        if !exposures.iter().any(|&e| (e - exposure).abs() < f64::EPSILON) {
            exposures.push(exposure);
        }
    }
    for exposure in exposures {
        for index in 1..=config.dark_count {
            let frame = out_dir.join(frame_file_name("Dark", exposure, DARK_LABEL, index));
            if expose(camera, exposure, 0, &frame).await {
                taken += 1;
            }
        }
        tracing::info!("darks complete for {exposure}s exposures");
    }

    taken
}

async fn switch_lamp(lamp: &LampRig, on: bool) {
    lamp.signals.lamp_done.clear();
    lamp.actor.submit(if on {
        LampCommand::TurnOn
    } else {
        LampCommand::TurnOff
    });
    if !lamp.signals.lamp_done.wait(Duration::from_secs(30)).await {
        tracing::warn!("flat lamp did not acknowledge a switch within 30s");
    }
}

async fn expose(camera: &CameraRig, exposure_secs: f64, position: u32, frame: &Path) -> bool {
    camera.signals.image_done.clear();
    camera.actor.submit(CameraCommand::Expose {
        duration_secs: exposure_secs,
        filter_position: position,
        output: frame.to_path_buf(),
    });
    let bound = Duration::from_secs_f64(2.0 * exposure_secs + 60.0);
    if !camera.signals.image_done.wait(bound).await {
        tracing::error!("calibration frame {} timed out", frame.display());
        return false;
    }
    if !camera.signals.last_exposure_ok() {
        tracing::error!("calibration frame {} failed", frame.display());
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::PollPolicy;
    use nightwatch_drivers::simulator::{SimCamera, SimLamp};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_flats_per_filter_then_darks_per_exposure() {
        let camera = CameraRig::spawn(Box::new(SimCamera::new()), PollPolicy::fast());
        let lamp_sim = SimLamp::new();
        let lamp_controls = lamp_sim.controls();
        let lamp = LampRig::spawn(Box::new(lamp_sim));
        let wheel = FilterWheelConfig::default();
        let config = CalibrationConfig {
            flat_count: 2,
            flat_exposure_secs: 0.01,
            dark_count: 2,
        };
        let dir = tempdir().unwrap();

        let taken = take_calibration_frames(
            &camera,
            &lamp,
            &wheel,
            &config,
            &["R".to_string(), "G".to_string()],
            &[0.01, 0.01, 0.02],
            dir.path(),
        )
        .await;

        // 2 filters x 2 flats + 2 unique exposures x 2 darks
        assert_eq!(taken, 8);
        assert!(dir.path().join("Flat_0.01s_R-0002.fits").exists());
        assert!(dir.path().join("Flat_0.01s_G-0001.fits").exists());
        assert!(dir.path().join("Dark_0.02s_dark-0002.fits").exists());
        assert!(!lamp_controls.is_on());
    }
}
