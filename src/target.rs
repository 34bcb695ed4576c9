//! Science target list.
//!
//! One JSON document per line. Times are `YYYY-MM-DD HH:MM:SS` and read as
//! UTC.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("failed to read target list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("target {name}: {detail}")]
    Invalid { name: String, detail: String },
}

fn de_time<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let text = String::deserialize(deserializer)?;
    NaiveDateTime::parse_from_str(text.trim(), TIME_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(serde::de::Error::custom)
}

fn ser_time<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&time.format(TIME_FORMAT))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub name: String,
    /// Hours, J2000.
    pub ra: f64,
    /// Degrees, J2000.
    pub dec: f64,
    #[serde(rename = "starttime", deserialize_with = "de_time", serialize_with = "ser_time")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "endtime", deserialize_with = "de_time", serialize_with = "ser_time")]
    pub end_time: DateTime<Utc>,
    #[serde(alias = "filter")]
    pub filters: Vec<String>,
    #[serde(alias = "exptime")]
    pub exptimes: Vec<f64>,
    #[serde(alias = "num")]
    pub counts: Vec<u32>,
    /// Interleave filters (B,V,R,B,V,R) instead of blocks (B,B,V,V,R,R).
    #[serde(default)]
    pub cycle_filter: bool,
    /// Millimetres.
    #[serde(default)]
    pub defocus: f64,
}

/// One planned exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct Exposure {
    pub filter: String,
    pub seconds: f64,
    /// 1-based repeat number within this filter.
    pub repeat: u32,
    pub of: u32,
}

impl Target {
    pub fn validate(&self) -> Result<(), TargetError> {
        let invalid = |detail: String| TargetError::Invalid {
            name: self.name.clone(),
            detail,
        };
        if self.filters.len() != self.exptimes.len() || self.filters.len() != self.counts.len() {
            return Err(invalid(format!(
                "{} filters, {} exposure times and {} counts",
                self.filters.len(),
                self.exptimes.len(),
                self.counts.len()
            )));
        }
        if let Some(bad) = self.exptimes.iter().find(|t| !t.is_finite() || **t < 0.0) {
            return Err(invalid(format!("invalid exposure time {bad}")));
        }
        Ok(())
    }

    /// Exposures in the order they are taken.
    pub fn exposure_plan(&self) -> Vec<Exposure> {
        let entries: Vec<(&String, f64, u32)> = self
            .filters
            .iter()
            .zip(&self.exptimes)
            .zip(&self.counts)
            .map(|((filter, seconds), count)| (filter, *seconds, *count))
            .collect();

        let exposure = |(filter, seconds, count): (&String, f64, u32), repeat: u32| Exposure {
            filter: filter.clone(),
            seconds,
            repeat,
            of: count,
        };

        if self.cycle_filter {
            let rounds = entries.iter().map(|(_, _, n)| *n).max().unwrap_or(0);
            (1..=rounds)
                .flat_map(|round| {
                    entries
                        .iter()
                        .filter(move |(_, _, n)| round <= *n)
                        .map(move |entry| exposure(*entry, round))
                })
                .collect()
        } else {
            entries
                .iter()
                .flat_map(|entry| (1..=entry.2).map(move |repeat| exposure(*entry, repeat)))
                .collect()
        }
    }

    /// Restrict the window to the night.
    pub fn clamp_to_night(&mut self, sunset: DateTime<Utc>, sunrise: DateTime<Utc>) {
        if self.end_time > sunrise {
            debug!("{}: end time clamped to sunrise {}", self.name, sunrise);
            self.end_time = sunrise;
        }
        if self.start_time < sunset {
            debug!("{}: start time clamped to sunset {}", self.name, sunset);
            self.start_time = sunset;
        }
    }
}

pub fn parse_target_line(line: &str, number: usize) -> Result<Target, TargetError> {
    let target: Target = serde_json::from_str(line).map_err(|source| TargetError::Parse {
        line: number,
        source,
    })?;
    target.validate()?;
    Ok(target)
}

/// Parse a whole target list. Blank lines and `#` comments are ignored; a
/// bad line is logged and skipped.
pub fn parse_targets(text: &str) -> Vec<Target> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .filter_map(|(index, line)| match parse_target_line(line, index + 1) {
            Ok(target) => Some(target),
            Err(e) => {
                warn!("Skipping target: {}", e);
                None
            }
        })
        .collect()
}

pub fn load_targets(path: &Path) -> Result<Vec<Target>, TargetError> {
    let text = std::fs::read_to_string(path).map_err(|source| TargetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let targets = parse_targets(&text);
    info!("Loaded {} targets from {}", targets.len(), path.display());
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = r#"{"name": "KELT-16", "ra": 20.9518, "dec": 31.6605, "starttime": "2024-03-21 03:00:00", "endtime": "2024-03-21 05:30:00", "filter": ["B", "V"], "exptime": [60, 30], "num": [1, 3], "cycleFilter": true, "defocus": 1.5}"#;

    #[test]
    fn parses_short_field_aliases() {
        let target = parse_target_line(LINE, 1).unwrap();
        assert_eq!(target.name, "KELT-16");
        assert_eq!(target.start_time, Utc.with_ymd_and_hms(2024, 3, 21, 3, 0, 0).unwrap());
        assert_eq!(target.filters, vec!["B", "V"]);
        assert_eq!(target.counts, vec![1, 3]);
        assert!(target.cycle_filter);
        assert_eq!(target.defocus, 1.5);
    }

    #[test]
    fn cycled_plan_interleaves_filters() {
        let target = parse_target_line(LINE, 1).unwrap();
        let plan = target.exposure_plan();
        let order: Vec<&str> = plan.iter().map(|e| e.filter.as_str()).collect();
        assert_eq!(order, vec!["B", "V", "V", "V"]);
    }

    #[test]
    fn block_plan_groups_by_filter() {
        let mut target = parse_target_line(LINE, 1).unwrap();
        target.cycle_filter = false;
        target.counts = vec![2, 2];
        let plan = target.exposure_plan();
        let order: Vec<&str> = plan.iter().map(|e| e.filter.as_str()).collect();
        assert_eq!(order, vec!["B", "B", "V", "V"]);
    }

    #[test]
    fn mismatched_lists_are_rejected() {
        let line = LINE.replace(r#""num": [1, 3]"#, r#""num": [1]"#);
        assert!(matches!(
            parse_target_line(&line, 4),
            Err(TargetError::Invalid { .. })
        ));
    }

    #[test]
    fn window_is_clamped_to_the_night() {
        let mut target = parse_target_line(LINE, 1).unwrap();
        let sunset = Utc.with_ymd_and_hms(2024, 3, 21, 3, 30, 0).unwrap();
        let sunrise = Utc.with_ymd_and_hms(2024, 3, 21, 5, 0, 0).unwrap();
        target.clamp_to_night(sunset, sunrise);
        assert_eq!(target.start_time, sunset);
        assert_eq!(target.end_time, sunrise);
    }

    #[test]
    fn bad_lines_are_skipped() {
        let text = format!("{LINE}\n\n# comment\nnot json\n{LINE}\n");
        assert_eq!(parse_targets(&text).len(), 2);
    }
}
