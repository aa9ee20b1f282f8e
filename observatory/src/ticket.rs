//! Observation tickets
//!
//! One ticket is one scheduled observation request: an ordered set of
//! targets, a timing window, and an exposure/filter plan. Tickets are
//! JSON on disk; the historical format wrote `ra`, `dec`, and
//! `filter` as either a scalar or a list, so deserialization accepts
//! both and normalizes to ordered sequences. A loaded ticket is
//! immutable.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One sky position, RA in hours and declination in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub ra_hours: f64,
    pub dec_degrees: f64,
}

/// A scheduled observation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawTicket")]
pub struct ObservationTicket {
    pub name: String,
    /// Ordered targets; a plain single-target ticket has one entry.
    pub targets: Vec<Target>,
    pub start_time: DateTime<FixedOffset>,
    pub end_time: DateTime<FixedOffset>,
    pub exposure_secs: f64,
    pub filters: Vec<String>,
    /// Requested exposure count (per filter unless cycling).
    pub count: u32,
    /// Rotate through the filters on successive exposures instead of
    /// finishing one filter before the next.
    pub cycle_filter: bool,
}

/// Scalar-or-list helper for the historical ticket fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTicket {
    name: String,
    ra: OneOrMany<f64>,
    dec: OneOrMany<f64>,
    start_time: DateTime<FixedOffset>,
    end_time: DateTime<FixedOffset>,
    #[serde(alias = "exp_time")]
    exposure_secs: f64,
    #[serde(alias = "filter")]
    filters: OneOrMany<String>,
    #[serde(alias = "num")]
    count: u32,
    #[serde(default)]
    cycle_filter: bool,
}

impl TryFrom<RawTicket> for ObservationTicket {
    type Error = anyhow::Error;

    fn try_from(raw: RawTicket) -> Result<Self> {
        let ra = raw.ra.into_vec();
        let dec = raw.dec.into_vec();
        if ra.len() != dec.len() {
            bail!(
                "ticket '{}': {} ra value(s) but {} dec value(s)",
                raw.name,
                ra.len(),
                dec.len()
            );
        }
        if ra.is_empty() {
            bail!("ticket '{}' has no targets", raw.name);
        }
        let filters = raw.filters.into_vec();
        if filters.is_empty() {
            bail!("ticket '{}' has no filters", raw.name);
        }
        if raw.end_time <= raw.start_time {
            bail!("ticket '{}' ends before it starts", raw.name);
        }
        if raw.exposure_secs <= 0.0 {
            bail!("ticket '{}' has a non-positive exposure time", raw.name);
        }

        let targets = ra
            .into_iter()
            .zip(dec)
            .map(|(ra_hours, dec_degrees)| Target {
                ra_hours,
                dec_degrees,
            })
            .collect();

        Ok(ObservationTicket {
            name: raw.name,
            targets,
            start_time: raw.start_time,
            end_time: raw.end_time,
            exposure_secs: raw.exposure_secs,
            filters,
            count: raw.count,
            cycle_filter: raw.cycle_filter,
        })
    }
}

impl ObservationTicket {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid observation ticket")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read ticket {}", path.display()))?;
        Self::from_json(&json)
            .with_context(|| format!("cannot parse ticket {}", path.display()))
    }
}

/// Load tickets from the CLI arguments: either N ticket files, or a
/// single directory containing `.json` tickets (sorted path order).
pub fn load_tickets(paths: &[PathBuf]) -> Result<Vec<ObservationTicket>> {
    let mut files = Vec::new();
    if let [single] = paths {
        if single.is_dir() {
            for entry in std::fs::read_dir(single)
                .with_context(|| format!("cannot read ticket directory {}", single.display()))?
            {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    files.push(path);
                }
            }
            files.sort();
        } else {
            files.push(single.clone());
        }
    } else {
        files.extend(paths.iter().cloned());
    }

    if files.is_empty() {
        bail!("no observation tickets found");
    }

    files.iter().map(|path| ObservationTicket::load(path)).collect()
}
