//! Weather acquisition.
//!
//! Two text feeds are combined into one [`WeatherSnapshot`]: the weather
//! station page (a timestamp line followed by `key=value` lines) and the
//! cloud-monitor line (an MJD date followed by one reading per sensor). A
//! snapshot is only produced when every field is present; anything less is
//! an error and the caller retries.

use crate::clock::Clock;
use crate::config::{CloudSensorConfig, WeatherConfig};
use crate::ephemeris::{sun_altitude, Site};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const STATION_DATE_FORMAT: &str = "%Y, %m, %d, %H, %M, %S, %f";

/// Station keys every snapshot needs.
pub const STATION_KEYS: [&str; 9] = [
    "totalRain",
    "wxt510Rain",
    "barometer",
    "windGustSpeed",
    "outsideHumidity",
    "outsideDewPt",
    "outsideTemp",
    "windSpeed",
    "windDirectionDegrees",
];

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("request to {url} failed: {detail}")]
    Http { url: String, detail: String },

    #[error("{feed} feed returned an empty page")]
    Empty { feed: &'static str },

    #[error("{feed} feed is malformed: {detail}")]
    Malformed { feed: &'static str, detail: String },

    #[error("weather page is missing required key {0}")]
    MissingField(String),
}

impl WeatherError {
    fn malformed(feed: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            feed,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudReading {
    pub sensor: String,
    /// Calibrated sky-minus-ambient temperature, or a sentinel.
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub date: DateTime<Utc>,
    pub cloud_date: DateTime<Utc>,
    pub total_rain: f64,
    pub rain_rate: f64,
    pub barometer: f64,
    pub wind_gust: f64,
    pub wind_speed: f64,
    pub wind_direction: f64,
    pub humidity: f64,
    pub dew_point: f64,
    pub temperature: f64,
    pub sun_altitude: f64,
    /// In fallback priority order.
    pub clouds: Vec<CloudReading>,
}

impl WeatherSnapshot {
    pub fn cloud(&self, sensor: &str) -> Option<f64> {
        self.clouds
            .iter()
            .find(|reading| reading.sensor == sensor)
            .map(|reading| reading.value)
    }

    pub fn log_fields(&self) {
        debug!(
            date = %self.date,
            cloud_date = %self.cloud_date,
            total_rain = self.total_rain,
            rain_rate = self.rain_rate,
            barometer = self.barometer,
            wind_gust = self.wind_gust,
            wind_speed = self.wind_speed,
            wind_direction = self.wind_direction,
            humidity = self.humidity,
            dew_point = self.dew_point,
            temperature = self.temperature,
            sun_altitude = self.sun_altitude,
            "weather snapshot"
        );
        for reading in &self.clouds {
            debug!(sensor = %reading.sensor, value = reading.value, "cloud sensor");
        }
    }
}

#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn fetch(&self) -> Result<WeatherSnapshot, WeatherError>;
}

/// Parsed station page.
#[derive(Debug, Clone, PartialEq)]
pub struct StationReading {
    pub date: DateTime<Utc>,
    pub values: HashMap<String, f64>,
}

impl StationReading {
    fn require(&self, key: &str) -> Result<f64, WeatherError> {
        self.values
            .get(key)
            .copied()
            .ok_or_else(|| WeatherError::MissingField(key.to_string()))
    }
}

/// Parsed cloud-monitor line.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudFeed {
    pub date: DateTime<Utc>,
    pub readings: Vec<CloudReading>,
}

pub fn parse_station_page(text: &str) -> Result<StationReading, WeatherError> {
    let mut lines = text.lines();
    let first = lines.next().map(str::trim).unwrap_or_default();
    if first.is_empty() {
        return Err(WeatherError::Empty { feed: "station" });
    }

    let date = NaiveDateTime::parse_from_str(first, STATION_DATE_FORMAT)
        .map_err(|e| WeatherError::malformed("station", format!("bad timestamp {first:?}: {e}")))?;

    let mut values = HashMap::new();
    for line in lines {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value
            .trim()
            .parse::<f64>()
            .map_err(|_| WeatherError::malformed("station", format!("bad value in {line:?}")))?;
        values.insert(key.trim().to_string(), value);
    }

    Ok(StationReading {
        date: Utc.from_utc_datetime(&date),
        values,
    })
}

/// Convert a Modified Julian Date to UTC.
pub fn mjd_to_utc(mjd: f64) -> Option<DateTime<Utc>> {
    let epoch = Utc.with_ymd_and_hms(1858, 11, 17, 0, 0, 0).single()?;
    let millis = (mjd * 86_400_000.0).round();
    if !millis.is_finite() {
        return None;
    }
    Some(epoch + Duration::milliseconds(millis as i64))
}

/// Apply per-sensor calibration. Zero or unparseable readings mean the sensor
/// is down; sentinels pass through unchanged.
pub fn calibrate(raw: Option<f64>, sensor: &CloudSensorConfig, config: &WeatherConfig) -> f64 {
    match raw {
        None => config.down_sentinel,
        Some(value) if value == 0.0 || !value.is_finite() => config.down_sentinel,
        Some(value) if value == config.down_sentinel || value == config.rain_sentinel => value,
        Some(value) => value * sensor.scale + sensor.offset,
    }
}

pub fn parse_cloud_feed(text: &str, config: &WeatherConfig) -> Result<CloudFeed, WeatherError> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let Some(first) = tokens.first() else {
        return Err(WeatherError::Empty { feed: "cloud" });
    };

    let date = first
        .parse::<f64>()
        .ok()
        .and_then(mjd_to_utc)
        .ok_or_else(|| WeatherError::malformed("cloud", format!("bad MJD date {first:?}")))?;

    let expected = config.cloud_sensors.len() + 1;
    if tokens.len() < expected {
        return Err(WeatherError::malformed(
            "cloud",
            format!("expected {expected} fields, got {}", tokens.len()),
        ));
    }

    let readings = config
        .cloud_sensors
        .iter()
        .zip(&tokens[1..])
        .map(|(sensor, token)| CloudReading {
            sensor: sensor.name.clone(),
            value: calibrate(token.parse::<f64>().ok(), sensor, config),
        })
        .collect();

    Ok(CloudFeed { date, readings })
}

/// Combine both feeds and the locally computed sun altitude.
pub fn assemble_snapshot(
    station: &StationReading,
    cloud: CloudFeed,
    sun_altitude: f64,
) -> Result<WeatherSnapshot, WeatherError> {
    Ok(WeatherSnapshot {
        date: station.date,
        cloud_date: cloud.date,
        total_rain: station.require("totalRain")?,
        rain_rate: station.require("wxt510Rain")?,
        barometer: station.require("barometer")?,
        wind_gust: station.require("windGustSpeed")?,
        wind_speed: station.require("windSpeed")?,
        wind_direction: station.require("windDirectionDegrees")?,
        humidity: station.require("outsideHumidity")?,
        dew_point: station.require("outsideDewPt")?,
        temperature: station.require("outsideTemp")?,
        sun_altitude,
        clouds: cloud.readings,
    })
}

/// Fetches the station and cloud pages over HTTP.
pub struct HttpWeatherSource {
    client: reqwest::Client,
    config: WeatherConfig,
    site: Site,
    clock: Arc<dyn Clock>,
}

impl HttpWeatherSource {
    pub fn new(config: WeatherConfig, site: Site, clock: Arc<dyn Clock>) -> Result<Self, WeatherError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| WeatherError::Http {
                url: String::new(),
                detail: e.to_string(),
            })?;
        Ok(Self {
            client,
            config,
            site,
            clock,
        })
    }

    async fn get(&self, url: &str) -> Result<String, WeatherError> {
        debug!("Requesting URL: {}", url);
        let http_error = |e: reqwest::Error| WeatherError::Http {
            url: url.to_string(),
            detail: e.to_string(),
        };
        self.client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(http_error)?
            .text()
            .await
            .map_err(http_error)
    }
}

#[async_trait]
impl WeatherSource for HttpWeatherSource {
    async fn fetch(&self) -> Result<WeatherSnapshot, WeatherError> {
        let station = parse_station_page(&self.get(&self.config.station_url).await?)?;
        let cloud = parse_cloud_feed(&self.get(&self.config.cloud_url).await?, &self.config)?;
        let altitude = sun_altitude(&self.site, self.clock.now());

        let snapshot = assemble_snapshot(&station, cloud, altitude)?;
        snapshot.log_fields();
        Ok(snapshot)
    }
}
