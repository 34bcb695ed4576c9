//! Operator overrides polled on every safety check.
//!
//! The safety engine only sees the [`OverrideStore`] trait; the file-backed
//! store mirrors the operators' workflow of touching marker files and editing
//! the snow-clearance timestamp by hand.

use crate::config::OverrideConfig;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::io;
use std::path::PathBuf;
use tracing::{error, warn};

pub const CLEARANCE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub trait OverrideStore: Send + Sync {
    /// Allow the enclosure open in daylight.
    fn sun_override(&self) -> bool;

    /// Ignore the cloud sensors.
    fn cloud_override(&self) -> bool;

    /// Time an operator last confirmed the enclosure is free of snow and ice.
    fn snow_clearance(&self) -> Option<DateTime<Utc>>;

    /// Leave a clearance request for operators, stamped with `stamp`.
    fn request_snow_clearance(&self, stamp: DateTime<Utc>) -> io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileOverrideStore {
    sun: PathBuf,
    cloud: PathBuf,
    snow: PathBuf,
}

impl FileOverrideStore {
    pub fn new(config: &OverrideConfig) -> Self {
        Self {
            sun: config.sun_override.clone(),
            cloud: config.cloud_override.clone(),
            snow: config.snow_clearance.clone(),
        }
    }
}

impl OverrideStore for FileOverrideStore {
    fn sun_override(&self) -> bool {
        self.sun.exists()
    }

    fn cloud_override(&self) -> bool {
        self.cloud.exists()
    }

    fn snow_clearance(&self) -> Option<DateTime<Utc>> {
        let text = match std::fs::read_to_string(&self.snow) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                error!("Could not read {}: {}", self.snow.display(), e);
                return None;
            }
        };

        let line = text.lines().next().unwrap_or_default().trim();
        match NaiveDateTime::parse_from_str(line, CLEARANCE_FORMAT) {
            Ok(stamp) => Some(Utc.from_utc_datetime(&stamp)),
            Err(_) => {
                warn!("Unrecognized timestamp {:?} in {}", line, self.snow.display());
                None
            }
        }
    }

    fn request_snow_clearance(&self, stamp: DateTime<Utc>) -> io::Result<()> {
        std::fs::write(&self.snow, format!("{}\n", stamp.format(CLEARANCE_FORMAT)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &std::path::Path) -> FileOverrideStore {
        FileOverrideStore::new(&OverrideConfig {
            sun_override: dir.join("sunOverride.txt"),
            cloud_override: dir.join("cloudOverride.txt"),
            snow_clearance: dir.join("manualSnowClearance.txt"),
        })
    }

    #[test]
    fn markers_are_detected_by_presence() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(!store.sun_override());
        assert!(!store.cloud_override());

        std::fs::write(dir.path().join("cloudOverride.txt"), "").unwrap();
        assert!(store.cloud_override());
        assert!(!store.sun_override());
    }

    #[test]
    fn clearance_request_round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert_eq!(store.snow_clearance(), None);

        let stamp = Utc.with_ymd_and_hms(2024, 1, 9, 6, 30, 0).unwrap();
        store.request_snow_clearance(stamp).unwrap();

        assert_eq!(store.snow_clearance(), Some(stamp));
    }

    #[test]
    fn garbage_clearance_file_counts_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("manualSnowClearance.txt"), "yesterday\n").unwrap();
        assert_eq!(store_in(dir.path()).snow_clearance(), None);
    }
}
