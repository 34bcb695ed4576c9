//! Observatory configuration.
//!
//! A single JSON document describes the site, weather feeds, safety limits,
//! enclosure link, calibration plan and imager. Every section falls back to
//! the reference deployment values when omitted, so an empty `{}` is a valid
//! configuration.

use crate::safety::{LimitRange, LimitTable, Parameter, SafetyLimits};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid limits: {0}")]
    Limits(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservatoryConfig {
    pub site: SiteConfig,
    pub weather: WeatherConfig,
    pub limits: SafetyLimits,
    pub overrides: OverrideConfig,
    pub enclosure: EnclosureConfig,
    pub calibration: CalibrationConfig,
    pub imager: ImagerConfig,
    pub scheduler: SchedulerConfig,
}

impl ObservatoryConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the cross-field invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.check_hysteresis().map_err(ConfigError::Limits)?;
        if self.calibration.flat_min_exposure_s > self.calibration.flat_max_exposure_s {
            return Err(ConfigError::Limits(
                "flat_min_exposure_s exceeds flat_max_exposure_s".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub name: String,
    /// Degrees, north positive.
    pub latitude: f64,
    /// Degrees, east positive.
    pub longitude: f64,
    /// Metres.
    pub elevation: f64,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub status_dir: PathBuf,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            name: "Mount_Hopkins".into(),
            latitude: 31.680_407,
            longitude: -110.878_977,
            elevation: 2316.0,
            data_dir: PathBuf::from("data"),
            log_dir: PathBuf::from("logs"),
            status_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSensorConfig {
    pub name: String,
    pub scale: f64,
    pub offset: f64,
}

impl CloudSensorConfig {
    pub fn new(name: &str, scale: f64, offset: f64) -> Self {
        Self {
            name: name.into(),
            scale,
            offset,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub station_url: String,
    pub cloud_url: String,
    pub http_timeout_ms: u64,
    pub retry_delay_ms: u64,
    /// Fallback order: the first sensor that is not down is used.
    pub cloud_sensors: Vec<CloudSensorConfig>,
    pub down_sentinel: f64,
    pub rain_sentinel: f64,
}

impl WeatherConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            station_url: "http://linmax.sao.arizona.edu/weather/weather.cur_cond".into(),
            cloud_url: "http://mearth.sao.arizona.edu/weather/now".into(),
            http_timeout_ms: 5000,
            retry_delay_ms: 1000,
            cloud_sensors: vec![
                CloudSensorConfig::new("MearthCloud", 1.0, 0.0),
                CloudSensorConfig::new("HATCloud", 1.0, 0.0),
                CloudSensorConfig::new("AuroraCloud", 1.0, 0.0),
                CloudSensorConfig::new("MINERVACloud", 1.0, 0.0),
            ],
            down_sentinel: 999.0,
            rain_sentinel: 998.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverrideConfig {
    pub sun_override: PathBuf,
    pub cloud_override: PathBuf,
    pub snow_clearance: PathBuf,
}

impl Default for OverrideConfig {
    fn default() -> Self {
        Self {
            sun_override: PathBuf::from("sunOverride.txt"),
            cloud_override: PathBuf::from("cloudOverride.txt"),
            snow_clearance: PathBuf::from("manualSnowClearance.txt"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnclosureConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Attempts at getting a non-empty reply before a command fails.
    pub empty_response_retries: u32,
    pub heartbeat_interval_s: u64,
    pub open_timeout_s: u64,
    /// How long a commanded shutter may sit still before it must report
    /// OPENING.
    pub open_start_grace_s: u64,
    pub close_timeout_s: u64,
    pub poll_interval_ms: u64,
    pub status_retry_limit: u32,
    /// `None` keeps retrying a failed close forever.
    pub close_retry_limit: Option<u32>,
    /// Re-send the close-failure alert every this many failed attempts.
    pub close_alert_every: u32,
    pub close_retry_delay_s: u64,
    pub reopen_cooldown_s: u64,
    pub status_file: Option<PathBuf>,
}

impl EnclosureConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reopen_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.reopen_cooldown_s).unwrap_or(i64::MAX))
    }
}

impl Default for EnclosureConfig {
    fn default() -> Self {
        Self {
            id: "A1".into(),
            host: "192.168.1.14".into(),
            port: 22004,
            connect_timeout_ms: 1000,
            read_timeout_ms: 500,
            empty_response_retries: 5,
            heartbeat_interval_s: 15,
            open_timeout_s: 180,
            open_start_grace_s: 10,
            close_timeout_s: 500,
            poll_interval_ms: 1000,
            status_retry_limit: 5,
            close_retry_limit: None,
            close_alert_every: 10,
            close_retry_delay_s: 5,
            reopen_cooldown_s: 20 * 60,
            status_file: Some(PathBuf::from("current_A1.log")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub bias_count: u32,
    pub dark_count: u32,
    pub dark_exposure_s: f64,
    /// Filter the camera sits in while taking darks and biases.
    pub dark_filter: String,
    pub flat_filters: Vec<String>,
    pub flat_count: u32,
    pub flat_min_exposure_s: f64,
    pub flat_max_exposure_s: f64,
    pub bias_level: f64,
    pub target_counts: f64,
    pub saturation: f64,
    pub flat_min_sun_alt: f64,
    pub flat_max_sun_alt: f64,
    pub flat_lead_s: u64,
    pub max_twilight_wait_s: u64,
    pub flat_altitude: f64,
    /// Upper bound on frames (accepted or not) per filter.
    pub max_flat_attempts: u32,
    /// Least to most transmissive.
    pub filter_order: Vec<String>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            bias_count: 11,
            dark_count: 11,
            dark_exposure_s: 60.0,
            dark_filter: "V".into(),
            flat_filters: vec!["V".into()],
            flat_count: 11,
            flat_min_exposure_s: 10.0,
            flat_max_exposure_s: 60.0,
            bias_level: 3200.0,
            target_counts: 10_000.0,
            saturation: 15_000.0,
            flat_min_sun_alt: -12.0,
            flat_max_sun_alt: 0.0,
            flat_lead_s: 300,
            max_twilight_wait_s: 7200,
            flat_altitude: 75.0,
            max_flat_attempts: 40,
            filter_order: [
                "H-Beta", "H-Alpha", "Ha", "Y", "U", "up", "zp", "zs", "B", "I", "ip", "V", "rp",
                "R", "gp", "w", "solar", "air",
            ]
            .iter()
            .map(|name| (*name).to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagerConfig {
    pub camera_id: String,
    pub filters: Vec<String>,
    /// Extra time beyond the exposure allowed for readout.
    pub readout_timeout_s: u64,
}

impl Default for ImagerConfig {
    fn default() -> Self {
        Self {
            camera_id: "T3".into(),
            filters: ["B", "V", "R", "I", "ip", "rp", "gp", "zp", "air"]
                .iter()
                .map(|name| (*name).to_string())
                .collect(),
            readout_timeout_s: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub open_retry_delay_s: u64,
    pub weather_watch_interval_s: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            open_retry_delay_s: 60,
            weather_watch_interval_s: 15,
        }
    }
}

/// Reference open/close tables. Close limits are the looser of the two.
pub fn default_limits() -> SafetyLimits {
    use Parameter::{
        Barometer, Cloud, CloudAge, DewPoint, Humidity, RainRate, SunAltitude, Temperature,
        TotalRain, WeatherAge, WindDirection, WindGust, WindSpeed,
    };

    let shared = [
        (TotalRain, LimitRange::new(0.0, 1000.0)),
        (RainRate, LimitRange::new(0.0, 0.0)),
        (Barometer, LimitRange::new(0.0, 2000.0)),
        (DewPoint, LimitRange::new(-100.0, 100.0)),
        (WindDirection, LimitRange::new(0.0, 360.0)),
        (WeatherAge, LimitRange::new(-60.0, 300.0)),
        (CloudAge, LimitRange::new(-60.0, 300.0)),
        (SunAltitude, LimitRange::new(-90.0, 0.0)),
    ];

    let mut open: LimitTable = shared.iter().copied().collect();
    open.insert(WindGust, LimitRange::new(0.0, 35.0));
    open.insert(Humidity, LimitRange::new(0.0, 75.0));
    open.insert(Temperature, LimitRange::new(-20.0, 50.0));
    open.insert(WindSpeed, LimitRange::new(0.0, 30.0));
    open.insert(Cloud, LimitRange::new(-999.0, -35.0));

    let mut close: LimitTable = shared.iter().copied().collect();
    close.insert(WindGust, LimitRange::new(0.0, 40.0));
    close.insert(Humidity, LimitRange::new(0.0, 80.0));
    close.insert(Temperature, LimitRange::new(-30.0, 60.0));
    close.insert(WindSpeed, LimitRange::new(0.0, 35.0));
    close.insert(Cloud, LimitRange::new(-999.0, -30.0));

    SafetyLimits { open, close }
}
