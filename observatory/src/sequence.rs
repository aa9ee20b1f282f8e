//! Image file naming and sequence numbering
//!
//! Frames are named `{target}_{exposure}s_{filter}-{NNNN}.fits` with a
//! four-digit, 1-based sequence number per (target, exposure, filter)
//! combination. The counter can seed itself from the files already in
//! the output directory, so a run restarted after a crash continues
//! numbering where the previous process stopped instead of
//! overwriting its frames.

use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Exposure length as it appears in a file name: integer seconds when
/// the value is whole, otherwise the shortest decimal form.
pub fn format_exposure(exposure_secs: f64) -> String {
    if exposure_secs.fract() == 0.0 {
        format!("{}", exposure_secs as i64)
    } else {
        format!("{exposure_secs}")
    }
}

/// File name for one frame of a sequence.
pub fn frame_file_name(target: &str, exposure_secs: f64, filter: &str, index: u32) -> String {
    format!(
        "{target}_{}s_{filter}-{index:04}.fits",
        format_exposure(exposure_secs)
    )
}

/// Per-sequence frame numbering with crash recovery.
///
/// Keys are the formatted `{target}_{exposure}s_{filter}` prefix; the
/// value is the next index to hand out.
#[derive(Debug, Default)]
pub struct ImageSequenceCounter {
    next: HashMap<String, u32>,
}

impl ImageSequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(target: &str, exposure_secs: f64, filter: &str) -> String {
        format!("{target}_{}s_{filter}", format_exposure(exposure_secs))
    }

    /// Scan `dir` for frames of this sequence and start numbering after
    /// the highest one found. A missing directory seeds nothing.
    pub fn seed_from_dir(&mut self, dir: &Path, target: &str, exposure_secs: f64, filter: &str) {
        let key = Self::key(target, exposure_secs, filter);
        let pattern = match Regex::new(&format!(r"^{}-(\d{{4}})\.fits$", regex::escape(&key))) {
            Ok(pattern) => pattern,
            Err(e) => {
                tracing::error!("bad sequence pattern for {key}: {e}");
                return;
            }
        };

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        let mut highest = 0u32;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if let Some(captures) = pattern.captures(name) {
                if let Ok(index) = captures[1].parse::<u32>() {
                    highest = highest.max(index);
                }
            }
        }

        if highest > 0 {
            tracing::info!("resuming sequence {key} after frame {highest:04}");
            self.next.insert(key, highest + 1);
        }
    }

    /// Next index for this sequence without consuming it.
    pub fn next_index(&self, target: &str, exposure_secs: f64, filter: &str) -> u32 {
        *self
            .next
            .get(&Self::key(target, exposure_secs, filter))
            .unwrap_or(&1)
    }

    /// Consume the current index and return the frame's path in `dir`.
    pub fn advance(
        &mut self,
        dir: &Path,
        target: &str,
        exposure_secs: f64,
        filter: &str,
    ) -> PathBuf {
        let index = self.next_index(target, exposure_secs, filter);
        self.next
            .insert(Self::key(target, exposure_secs, filter), index + 1);
        dir.join(frame_file_name(target, exposure_secs, filter, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_names_format_whole_exposures_as_integers() {
        assert_eq!(
            frame_file_name("NGC6946", 120.0, "R", 1),
            "NGC6946_120s_R-0001.fits"
        );
        assert_eq!(
            frame_file_name("NGC6946", 2.5, "Ha", 42),
            "NGC6946_2.5s_Ha-0042.fits"
        );
    }

    #[test]
    fn test_counter_resumes_after_existing_frames() {
        let dir = tempfile::tempdir().unwrap();
        for index in 1..=5 {
            let name = frame_file_name("M31", 10.0, "R", index);
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        // Frames of other sequences must not disturb the count
        std::fs::write(dir.path().join("M31_10s_G-0099.fits"), b"").unwrap();
        std::fs::write(dir.path().join("M33_10s_R-0100.fits"), b"").unwrap();

        let mut counter = ImageSequenceCounter::new();
        counter.seed_from_dir(dir.path(), "M31", 10.0, "R");
        assert_eq!(counter.next_index("M31", 10.0, "R"), 6);
        assert_eq!(counter.next_index("M31", 10.0, "B"), 1);

        let path = counter.advance(dir.path(), "M31", 10.0, "R");
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "M31_10s_R-0006.fits"
        );
        assert_eq!(counter.next_index("M31", 10.0, "R"), 7);
    }

    #[test]
    fn test_seeding_an_empty_or_missing_directory_starts_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut counter = ImageSequenceCounter::new();
        counter.seed_from_dir(dir.path(), "M31", 10.0, "R");
        assert_eq!(counter.next_index("M31", 10.0, "R"), 1);

        counter.seed_from_dir(&dir.path().join("missing"), "M31", 10.0, "R");
        assert_eq!(counter.next_index("M31", 10.0, "R"), 1);
    }

    #[test]
    fn test_interleaved_filters_keep_independent_counters() {
        let dir = tempfile::tempdir().unwrap();
        let mut counter = ImageSequenceCounter::new();
        let mut names = Vec::new();
        for _ in 0..2 {
            for filter in ["R", "G", "B"] {
                let path = counter.advance(dir.path(), "M42", 30.0, filter);
                names.push(path.file_name().unwrap().to_str().unwrap().to_string());
            }
        }
        assert_eq!(names[0], "M42_30s_R-0001.fits");
        assert_eq!(names[2], "M42_30s_B-0001.fits");
        assert_eq!(names[3], "M42_30s_R-0002.fits");
        assert_eq!(names[5], "M42_30s_B-0002.fits");
    }
}
