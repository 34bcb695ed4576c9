use crate::clock::{Clock, Observing};
use crate::config::WeatherConfig;
use crate::notify::{Alert, Notifier};
use crate::overrides::OverrideStore;
use crate::weather::{WeatherSnapshot, WeatherSource};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const MAX_REASONS: usize = 24;
const RAIN_LOCKOUT_HOURS: i64 = 1;
const SNOW_MEMORY_HOURS: i64 = 24;
const CLEARANCE_VALID_HOURS: i64 = 24;

/// Every quantity the limit tables can bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Parameter {
    #[serde(rename = "totalRain")]
    TotalRain,
    #[serde(rename = "wxt510Rain")]
    RainRate,
    #[serde(rename = "barometer")]
    Barometer,
    #[serde(rename = "windGustSpeed")]
    WindGust,
    #[serde(rename = "outsideHumidity")]
    Humidity,
    #[serde(rename = "outsideDewPt")]
    DewPoint,
    #[serde(rename = "outsideTemp")]
    Temperature,
    #[serde(rename = "windSpeed")]
    WindSpeed,
    #[serde(rename = "windDirectionDegrees")]
    WindDirection,
    /// Seconds since the station page was stamped.
    #[serde(rename = "weatherAge")]
    WeatherAge,
    /// Seconds since the cloud line was stamped.
    #[serde(rename = "cloudAge")]
    CloudAge,
    #[serde(rename = "sunAltitude")]
    SunAltitude,
    /// Whichever cloud sensor the fallback chain selects.
    #[serde(rename = "relativeSkyTemp")]
    Cloud,
}

impl Parameter {
    pub const ALL: [Parameter; 13] = [
        Parameter::TotalRain,
        Parameter::RainRate,
        Parameter::Barometer,
        Parameter::WindGust,
        Parameter::Humidity,
        Parameter::DewPoint,
        Parameter::Temperature,
        Parameter::WindSpeed,
        Parameter::WindDirection,
        Parameter::WeatherAge,
        Parameter::CloudAge,
        Parameter::SunAltitude,
        Parameter::Cloud,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Parameter::TotalRain => "totalRain",
            Parameter::RainRate => "wxt510Rain",
            Parameter::Barometer => "barometer",
            Parameter::WindGust => "windGustSpeed",
            Parameter::Humidity => "outsideHumidity",
            Parameter::DewPoint => "outsideDewPt",
            Parameter::Temperature => "outsideTemp",
            Parameter::WindSpeed => "windSpeed",
            Parameter::WindDirection => "windDirectionDegrees",
            Parameter::WeatherAge => "weatherAge",
            Parameter::CloudAge => "cloudAge",
            Parameter::SunAltitude => "sunAltitude",
            Parameter::Cloud => "Clouds",
        }
    }

    /// Value of this parameter in `snapshot`. The cloud parameter has no
    /// single field and yields `None`; see the fallback chain.
    pub fn value(self, snapshot: &WeatherSnapshot, now: DateTime<Utc>) -> Option<f64> {
        let age = |stamp: DateTime<Utc>| (now - stamp).num_milliseconds() as f64 / 1000.0;
        match self {
            Parameter::TotalRain => Some(snapshot.total_rain),
            Parameter::RainRate => Some(snapshot.rain_rate),
            Parameter::Barometer => Some(snapshot.barometer),
            Parameter::WindGust => Some(snapshot.wind_gust),
            Parameter::Humidity => Some(snapshot.humidity),
            Parameter::DewPoint => Some(snapshot.dew_point),
            Parameter::Temperature => Some(snapshot.temperature),
            Parameter::WindSpeed => Some(snapshot.wind_speed),
            Parameter::WindDirection => Some(snapshot.wind_direction),
            Parameter::WeatherAge => Some(age(snapshot.date)),
            Parameter::CloudAge => Some(age(snapshot.cloud_date)),
            Parameter::SunAltitude => Some(snapshot.sun_altitude),
            Parameter::Cloud => None,
        }
    }
}

/// Inclusive `[min, max]`, written as a two-element array in config files.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct LimitRange {
    pub min: f64,
    pub max: f64,
}

impl LimitRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// True if `self` admits everything `other` admits.
    pub fn covers(&self, other: &LimitRange) -> bool {
        self.min <= other.min && self.max >= other.max
    }
}

impl From<[f64; 2]> for LimitRange {
    fn from([min, max]: [f64; 2]) -> Self {
        Self { min, max }
    }
}

impl From<LimitRange> for [f64; 2] {
    fn from(range: LimitRange) -> Self {
        [range.min, range.max]
    }
}

impl std::fmt::Display for LimitRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.min, self.max)
    }
}

pub type LimitTable = BTreeMap<Parameter, LimitRange>;

const SUN_OVERRIDE_RANGE: LimitRange = LimitRange::new(-90.0, 90.0);

/// The immutable base tables. Overrides are layered on per evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    pub open: LimitTable,
    pub close: LimitTable,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        crate::config::default_limits()
    }
}

impl SafetyLimits {
    /// Close limits must be at least as permissive as open limits for every
    /// parameter, otherwise the enclosure could cycle at a threshold.
    pub fn check_hysteresis(&self) -> Result<(), String> {
        for (parameter, open) in &self.open {
            match self.close.get(parameter) {
                None => return Err(format!("{} has open limits but no close limits", parameter.name())),
                Some(close) if !close.covers(open) => {
                    return Err(format!(
                        "close limits for {} ({}) are stricter than open limits ({})",
                        parameter.name(),
                        close,
                        open
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// The table to judge against, with the sun override applied. The base
    /// tables are never modified.
    pub fn with_overrides(&self, currently_open: bool, sun_override: bool) -> LimitTable {
        let mut table = if currently_open {
            self.close.clone()
        } else {
            self.open.clone()
        };
        if sun_override {
            table.insert(Parameter::SunAltitude, SUN_OVERRIDE_RANGE);
        }
        table
    }
}

/// Why a verdict came out unsafe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reason {
    OutOfRange {
        parameter: Parameter,
        value: f64,
        range: LimitRange,
    },
    MissingLimit(Parameter),
    RainLockout {
        since: DateTime<Utc>,
    },
    SnowLockout,
    CloudSensorsDown,
    Stopped,
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::OutOfRange {
                parameter,
                value,
                range,
            } => write!(f, "{}={} outside {}", parameter.name(), value, range),
            Reason::MissingLimit(parameter) => write!(f, "no limit for {}", parameter.name()),
            Reason::RainLockout { since } => write!(f, "rain at {since}; waiting an hour"),
            Reason::SnowLockout => f.write_str("snow/ice risk; manual inspection required"),
            Reason::CloudSensorsDown => f.write_str("all cloud sensors down"),
            Reason::Stopped => f.write_str("observing stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub safe: bool,
    pub reasons: Vec<Reason, MAX_REASONS>,
    /// Cloud sensor the fallback chain used, if any.
    pub cloud_sensor: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl Verdict {
    fn new(evaluated_at: DateTime<Utc>) -> Self {
        Self {
            safe: true,
            reasons: Vec::new(),
            cloud_sensor: None,
            evaluated_at,
        }
    }

    fn fail(&mut self, reason: Reason) {
        self.safe = false;
        if self.reasons.is_full() {
            self.reasons.remove(0);
        }
        let _ = self.reasons.push(reason);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetyState {
    pub last_rain_change: Option<DateTime<Utc>>,
    pub last_rain_amount: Option<f64>,
    pub coldest_recent_temp: Option<f64>,
    /// A snow/ice inspection alert is outstanding.
    pub alert_sent: bool,
    /// Day the last snow/ice alert went out.
    pub snow_alert_day: Option<NaiveDate>,
    pub last_verdict: Option<Verdict>,
    pub last_snapshot: Option<WeatherSnapshot>,
    temperature_history: VecDeque<(DateTime<Utc>, f64)>,
}

impl SafetyState {
    fn record_temperature(&mut self, now: DateTime<Utc>, temperature: f64) {
        self.temperature_history.push_back((now, temperature));
        let horizon = now - Duration::hours(SNOW_MEMORY_HOURS);
        while self
            .temperature_history
            .front()
            .is_some_and(|(stamp, _)| *stamp < horizon)
        {
            self.temperature_history.pop_front();
        }
        self.coldest_recent_temp = self
            .temperature_history
            .iter()
            .map(|(_, t)| *t)
            .reduce(f64::min);
    }

    fn rained_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.last_rain_change.is_some_and(|stamp| now - stamp < window)
    }
}

/// Decides whether the enclosure may be (or stay) open.
pub struct SafetyEngine {
    source: Arc<dyn WeatherSource>,
    overrides: Arc<dyn OverrideStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    observing: Observing,
    limits: SafetyLimits,
    config: WeatherConfig,
    site_name: String,
    state: Mutex<SafetyState>,
}

impl SafetyEngine {
    pub fn new(
        source: Arc<dyn WeatherSource>,
        overrides: Arc<dyn OverrideStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        observing: Observing,
        limits: SafetyLimits,
        config: WeatherConfig,
    ) -> Self {
        Self {
            source,
            overrides,
            notifier,
            clock,
            observing,
            limits,
            config,
            site_name: "observatory".into(),
            state: Mutex::new(SafetyState::default()),
        }
    }

    pub fn with_site_name(mut self, name: impl Into<String>) -> Self {
        self.site_name = name.into();
        self
    }

    pub async fn is_safe_to_open(&self, currently_open: bool) -> bool {
        self.evaluate(currently_open).await.safe
    }

    pub async fn state(&self) -> SafetyState {
        self.state.lock().await.clone()
    }

    /// Full evaluation. Holds the engine lock for the whole check so
    /// concurrent callers see a consistent rain/snow history.
    pub async fn evaluate(&self, currently_open: bool) -> Verdict {
        let mut state = self.state.lock().await;

        if currently_open {
            debug!("Enclosure open; using the close limits");
        } else {
            debug!("Enclosure closed; using the open limits");
        }
        let sun_override = self.overrides.sun_override();
        let cloud_override = self.overrides.cloud_override();
        if sun_override {
            info!("Sun override active; daytime operation allowed");
        }
        if cloud_override {
            info!("Cloud override active; ignoring cloud sensors");
        }
        let limits = self.limits.with_overrides(currently_open, sun_override);

        let Some(snapshot) = self.fetch_until_success().await else {
            let mut verdict = Verdict::new(self.clock.now());
            verdict.fail(Reason::Stopped);
            warn!("Observing stopped before weather was available; not OK to open");
            state.last_verdict = Some(verdict.clone());
            return verdict;
        };

        let now = self.clock.now();
        let mut verdict = Verdict::new(now);

        self.check_rain(&mut state, &snapshot, now, &mut verdict);
        self.check_snow(&mut state, &snapshot, now, &mut verdict).await;
        if !cloud_override {
            self.check_clouds(&snapshot, &limits, &mut verdict);
        }
        Self::check_limits(&snapshot, &limits, now, &mut verdict);

        if verdict.safe {
            debug!("OK to open");
        } else {
            debug!("Not OK to open ({} reasons)", verdict.reasons.len());
        }

        state.last_snapshot = Some(snapshot);
        state.last_verdict = Some(verdict.clone());
        verdict
    }

    /// Never returns a partial snapshot; keeps retrying until one arrives or
    /// observing stops.
    async fn fetch_until_success(&self) -> Option<WeatherSnapshot> {
        let mut attempts: u32 = 0;
        loop {
            match self.source.fetch().await {
                Ok(snapshot) => return Some(snapshot),
                Err(e) => {
                    attempts = attempts.saturating_add(1);
                    warn!("Weather unavailable (attempt {}): {}", attempts, e);
                }
            }
            if !self
                .observing
                .wait(self.clock.as_ref(), self.config.retry_delay())
                .await
            {
                return None;
            }
        }
    }

    fn check_rain(
        &self,
        state: &mut SafetyState,
        snapshot: &WeatherSnapshot,
        now: DateTime<Utc>,
        verdict: &mut Verdict,
    ) {
        let primary = self
            .config
            .cloud_sensors
            .first()
            .and_then(|sensor| snapshot.cloud(&sensor.name));
        if primary == Some(self.config.rain_sentinel) {
            info!("Rain sensor reports rain");
            state.last_rain_change = Some(now);
        }

        if let Some(previous) = state.last_rain_amount {
            if snapshot.total_rain > previous {
                info!(
                    "Rain accumulation increased from {} to {}",
                    previous, snapshot.total_rain
                );
                state.last_rain_change = Some(now);
            }
        }
        state.last_rain_amount = Some(snapshot.total_rain);

        if let Some(since) = state.last_rain_change {
            if now - since < Duration::hours(RAIN_LOCKOUT_HOURS) {
                info!("Not OK to open: rained at {}; waiting an hour after rain", since);
                verdict.fail(Reason::RainLockout { since });
            }
        }
    }

    async fn check_snow(
        &self,
        state: &mut SafetyState,
        snapshot: &WeatherSnapshot,
        now: DateTime<Utc>,
        verdict: &mut Verdict,
    ) {
        state.record_temperature(now, snapshot.temperature);

        let freezing = state.coldest_recent_temp.is_some_and(|t| t < 0.0);
        if !(freezing && state.rained_within(now, Duration::hours(SNOW_MEMORY_HOURS))) {
            return;
        }

        let cleared = self
            .overrides
            .snow_clearance()
            .is_some_and(|stamp| now - stamp < Duration::hours(CLEARANCE_VALID_HOURS));

        if cleared {
            debug!("Snow/ice risk, but enclosure manually cleared within a day");
            if state.alert_sent {
                self.notifier
                    .notify(Alert::normal(
                        format!("{}: snow/ice inspection acknowledged", self.site_name),
                        "Manual clearance received; the enclosure may open again.",
                    ))
                    .await;
                state.alert_sent = false;
            }
            return;
        }

        info!(
            "Not OK to open: rain in the last day and temperature dropped to {:?}; manual inspection required",
            state.coldest_recent_temp
        );
        verdict.fail(Reason::SnowLockout);

        let today = now.date_naive();
        if state.snow_alert_day != Some(today) {
            self.notifier
                .notify(Alert::critical(
                    format!("{}: snow/ice inspection required", self.site_name),
                    "It rained within the last day and the temperature dropped below freezing. \
                     Inspect the enclosure, then update the clearance file with the current time.",
                ))
                .await;
            state.alert_sent = true;
            state.snow_alert_day = Some(today);
        }

        if let Err(e) = self
            .overrides
            .request_snow_clearance(now - Duration::days(1))
        {
            error!("Could not write snow clearance request: {}", e);
        }
    }

    fn check_clouds(&self, snapshot: &WeatherSnapshot, limits: &LimitTable, verdict: &mut Verdict) {
        let selected = self.config.cloud_sensors.iter().find_map(|sensor| {
            snapshot
                .cloud(&sensor.name)
                .filter(|value| *value != self.config.down_sentinel)
                .map(|value| (sensor.name.clone(), value))
        });

        let Some((sensor, value)) = selected else {
            info!("Not OK to open: all cloud sensors are down");
            verdict.fail(Reason::CloudSensorsDown);
            return;
        };

        match limits.get(&Parameter::Cloud) {
            None => {
                error!("No limits configured for {}", Parameter::Cloud.name());
                verdict.fail(Reason::MissingLimit(Parameter::Cloud));
            }
            Some(range) if !range.contains(value) => {
                info!(
                    "Not OK to open: {} ({})={}; Limits are {}",
                    Parameter::Cloud.name(),
                    sensor,
                    value,
                    range
                );
                verdict.fail(Reason::OutOfRange {
                    parameter: Parameter::Cloud,
                    value,
                    range: *range,
                });
            }
            Some(_) => {}
        }
        verdict.cloud_sensor = Some(sensor);
    }

    /// Every parameter is checked and logged; there is no short circuit.
    fn check_limits(
        snapshot: &WeatherSnapshot,
        limits: &LimitTable,
        now: DateTime<Utc>,
        verdict: &mut Verdict,
    ) {
        for parameter in Parameter::ALL {
            let Some(value) = parameter.value(snapshot, now) else {
                continue;
            };
            match limits.get(&parameter) {
                None => {
                    error!("No limits configured for {}; failing safe", parameter.name());
                    verdict.fail(Reason::MissingLimit(parameter));
                }
                Some(range) if !range.contains(value) => {
                    info!(
                        "Not OK to open: {}={}; Limits are {}",
                        parameter.name(),
                        value,
                        range
                    );
                    verdict.fail(Reason::OutOfRange {
                        parameter,
                        value,
                        range: *range,
                    });
                }
                Some(_) => {}
            }
        }
    }
}
