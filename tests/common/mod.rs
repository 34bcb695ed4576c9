#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use observatory::clock::{Clock, SimulatedClock};
use observatory::config::EnclosureConfig;
use observatory::enclosure::Enclosure;
use observatory::ephemeris::{sun_altitude, Site};
use observatory::instruments::{Camera, FrameType, InstrumentError, Telescope, TelescopeStatus};
use observatory::notify::{Alert, Notifier};
use observatory::overrides::OverrideStore;
use observatory::protocol::{EnclosureCommand, EnclosureTransport, ProtocolError};
use observatory::weather::{CloudReading, WeatherError, WeatherSnapshot, WeatherSource};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

pub fn simulated_clock(start: DateTime<Utc>) -> (SimulatedClock, Arc<dyn Clock>) {
    let clock = SimulatedClock::new(start);
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    (clock, shared)
}

pub fn mount_hopkins() -> Site {
    Site::new(31.680_407, -110.878_977, 2316.0)
}

/// A snapshot inside every default open limit.
pub fn safe_snapshot(now: DateTime<Utc>) -> WeatherSnapshot {
    WeatherSnapshot {
        date: now,
        cloud_date: now,
        total_rain: 0.0,
        rain_rate: 0.0,
        barometer: 768.0,
        wind_gust: 10.0,
        wind_speed: 5.0,
        wind_direction: 180.0,
        humidity: 20.0,
        dew_point: -10.0,
        temperature: 10.0,
        sun_altitude: -20.0,
        clouds: ["MearthCloud", "HATCloud", "AuroraCloud", "MINERVACloud"]
            .iter()
            .map(|sensor| CloudReading {
                sensor: (*sensor).to_string(),
                value: -40.0,
            })
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Weather

/// Serves a fixed snapshot, re-stamped with the clock's time on every fetch.
/// Optionally fails the next few fetches and tracks the sun from the clock.
pub struct ScriptedWeather {
    clock: Arc<dyn Clock>,
    snapshot: Mutex<WeatherSnapshot>,
    failures: AtomicU32,
    fetches: AtomicU32,
    age: Mutex<chrono::Duration>,
    sun_from: Option<Site>,
}

impl ScriptedWeather {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let snapshot = safe_snapshot(clock.now());
        Self {
            clock,
            snapshot: Mutex::new(snapshot),
            failures: AtomicU32::new(0),
            fetches: AtomicU32::new(0),
            age: Mutex::new(chrono::Duration::zero()),
            sun_from: None,
        }
    }

    /// Report the real sun altitude at `site` instead of the fixed value.
    pub fn tracking_sun(mut self, site: Site) -> Self {
        self.sun_from = Some(site);
        self
    }

    pub fn update(&self, change: impl FnOnce(&mut WeatherSnapshot)) {
        change(&mut self.snapshot.lock().unwrap());
    }

    /// Make the station timestamp lag the clock by `age`.
    pub fn aged(&self, age: chrono::Duration) {
        *self.age.lock().unwrap() = age;
    }

    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WeatherSource for ScriptedWeather {
    async fn fetch(&self) -> Result<WeatherSnapshot, WeatherError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(WeatherError::Empty { feed: "station" });
        }

        let now = self.clock.now();
        let mut snapshot = self.snapshot.lock().unwrap().clone();
        let age = *self.age.lock().unwrap();
        snapshot.date = now - age;
        snapshot.cloud_date = now;
        if let Some(site) = &self.sun_from {
            snapshot.sun_altitude = sun_altitude(site, now);
        }
        Ok(snapshot)
    }
}

// ---------------------------------------------------------------------------
// Overrides and notifications

#[derive(Default)]
pub struct MemoryOverrides {
    pub sun: Mutex<bool>,
    pub cloud: Mutex<bool>,
    pub clearance: Mutex<Option<DateTime<Utc>>>,
    pub requests: Mutex<Vec<DateTime<Utc>>>,
}

impl OverrideStore for MemoryOverrides {
    fn sun_override(&self) -> bool {
        *self.sun.lock().unwrap()
    }

    fn cloud_override(&self) -> bool {
        *self.cloud.lock().unwrap()
    }

    fn snow_clearance(&self) -> Option<DateTime<Utc>> {
        *self.clearance.lock().unwrap()
    }

    fn request_snow_clearance(&self, stamp: DateTime<Utc>) -> std::io::Result<()> {
        self.requests.lock().unwrap().push(stamp);
        *self.clearance.lock().unwrap() = Some(stamp);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.alerts().into_iter().map(|alert| alert.subject).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

// ---------------------------------------------------------------------------
// Enclosure controller

#[derive(Debug)]
pub struct ControllerState {
    pub shutters: [String; 2],
    /// Target state and the number of further STATUS polls before reaching it.
    pub pending: [Option<(String, u32)>; 2],
    pub motion_polls: u32,
    pub manual: bool,
    pub opens_work: bool,
    /// Shutters whose open command is refused.
    pub jammed: [bool; 2],
    /// Opening shutters reverse and end up closed.
    pub opens_fall_back: bool,
    pub closes_work: bool,
    /// Close commands still to be rejected before closes start working.
    pub failing_closes: u32,
    /// Upcoming STATUS replies that come back malformed.
    pub bad_status_replies: u32,
    pub offline: bool,
    pub commands: Vec<EnclosureCommand>,
}

/// In-memory enclosure controller.
#[derive(Clone)]
pub struct FakeController {
    state: Arc<Mutex<ControllerState>>,
}

impl FakeController {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ControllerState {
                shutters: ["CLOSED".into(), "CLOSED".into()],
                pending: [None, None],
                motion_polls: 0,
                manual: false,
                opens_work: true,
                jammed: [false, false],
                opens_fall_back: false,
                closes_work: true,
                failing_closes: 0,
                bad_status_replies: 0,
                offline: false,
                commands: Vec::new(),
            })),
        }
    }

    pub fn open() -> Self {
        let controller = Self::new();
        controller.with(|s| s.shutters = ["OPEN".into(), "OPEN".into()]);
        controller
    }

    pub fn with(&self, change: impl FnOnce(&mut ControllerState)) {
        change(&mut self.state.lock().unwrap());
    }

    pub fn commands(&self) -> Vec<EnclosureCommand> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Commands other than the keep-alive.
    pub fn foreground_commands(&self) -> Vec<EnclosureCommand> {
        self.commands()
            .into_iter()
            .filter(|c| *c != EnclosureCommand::Heartbeat)
            .collect()
    }

    pub fn count(&self, command: EnclosureCommand) -> usize {
        self.commands().iter().filter(|c| **c == command).count()
    }

    pub fn shutters(&self) -> [String; 2] {
        self.state.lock().unwrap().shutters.clone()
    }

    fn start_motion(state: &mut ControllerState, index: usize, moving: &str, target: &str) {
        state.shutters[index] = moving.to_string();
        state.pending[index] = Some((target.to_string(), state.motion_polls));
    }

    fn status_reply(state: &mut ControllerState) -> String {
        for index in 0..2 {
            if let Some((target, remaining)) = state.pending[index].take() {
                if remaining == 0 {
                    state.shutters[index] = target;
                } else {
                    state.pending[index] = Some((target, remaining - 1));
                }
            }
        }
        if state.bad_status_replies > 0 {
            state.bad_status_replies -= 1;
            return "Success=TRUE, Shutter1=CLOSED".into();
        }
        format!(
            "Success=TRUE, Shutter1={}, Shutter2={}, SWVersion=2.3, EnclHumidity=21, \
             EntryDoor1=CLOSED, EntryDoor2=CLOSED, PanelDoor=CLOSED, Heartbeat=7, \
             SystemUpTime=86400, Fault=FALSE, Error=FALSE, PanelExhaustTemp=18.2, EnclTemp=12.1, \
             EnclExhaustTemp=11.9, EnclIntakeTemp=11.5, LightsOn=FALSE, EnclOpMode={}",
            state.shutters[0],
            state.shutters[1],
            if state.manual { "MANUAL" } else { "AUTO" }
        )
    }
}

#[async_trait]
impl EnclosureTransport for FakeController {
    async fn exchange(&self, command: EnclosureCommand) -> Result<String, ProtocolError> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(command);
        if state.offline {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "controller offline",
            )));
        }

        let reply = match command {
            EnclosureCommand::Status => Self::status_reply(&mut state),
            EnclosureCommand::OpenShutter1 | EnclosureCommand::OpenShutter2 => {
                let index = usize::from(command == EnclosureCommand::OpenShutter2);
                if state.jammed[index] {
                    return Ok("Success=FALSE, Error=Shutter jammed".into());
                }
                if state.opens_work && !state.manual {
                    let target = if state.opens_fall_back { "CLOSED" } else { "OPEN" };
                    Self::start_motion(&mut state, index, "OPENING", target);
                }
                "Success=TRUE".into()
            }
            EnclosureCommand::CloseSequential => {
                let refused = state.failing_closes > 0;
                state.failing_closes = state.failing_closes.saturating_sub(1);
                if state.closes_work && !refused && !state.manual {
                    Self::start_motion(&mut state, 1, "CLOSING", "CLOSED");
                    Self::start_motion(&mut state, 0, "CLOSING", "CLOSED");
                    "Success=TRUE".into()
                } else {
                    "Success=FALSE, Error=Motor overcurrent".into()
                }
            }
            _ => "Success=TRUE".into(),
        };
        Ok(reply)
    }
}

pub fn test_enclosure_config() -> EnclosureConfig {
    EnclosureConfig {
        status_file: None,
        ..EnclosureConfig::default()
    }
}

pub fn enclosure_with(
    controller: &FakeController,
    config: EnclosureConfig,
    notifier: Arc<RecordingNotifier>,
    clock: Arc<dyn Clock>,
) -> Arc<Enclosure> {
    Arc::new(Enclosure::new(config, Box::new(controller.clone()), notifier, clock))
}

// ---------------------------------------------------------------------------
// Instruments

type MeanModel = Box<dyn Fn(f64, &str) -> f64 + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct ExposureRecord {
    pub seconds: f64,
    pub frame: FrameType,
    pub filter: String,
}

/// Records exposures; the central mean of a frame comes from `model`.
pub struct FakeCamera {
    model: MeanModel,
    exposures: Mutex<Vec<ExposureRecord>>,
    means: Mutex<HashMap<PathBuf, f64>>,
    discarded: Mutex<Vec<PathBuf>>,
}

impl FakeCamera {
    pub fn new(model: impl Fn(f64, &str) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            model: Box::new(model),
            exposures: Mutex::new(Vec::new()),
            means: Mutex::new(HashMap::new()),
            discarded: Mutex::new(Vec::new()),
        }
    }

    /// `mean = bias + rate * seconds`.
    pub fn linear(bias: f64, rate: f64) -> Self {
        Self::new(move |seconds, _| bias + rate * seconds)
    }

    pub fn exposures(&self) -> Vec<ExposureRecord> {
        self.exposures.lock().unwrap().clone()
    }

    pub fn of_type(&self, frame: FrameType) -> Vec<ExposureRecord> {
        self.exposures().into_iter().filter(|e| e.frame == frame).collect()
    }

    pub fn discarded(&self) -> Vec<PathBuf> {
        self.discarded.lock().unwrap().clone()
    }
}

#[async_trait]
impl Camera for FakeCamera {
    async fn expose(&self, seconds: f64, frame: FrameType, filter: &str) -> Result<(), InstrumentError> {
        self.exposures.lock().unwrap().push(ExposureRecord {
            seconds,
            frame,
            filter: filter.to_string(),
        });
        Ok(())
    }

    async fn image_ready(&self) -> Result<bool, InstrumentError> {
        Ok(true)
    }

    async fn save_image(&self, path: &Path) -> Result<(), InstrumentError> {
        let last = self.exposures.lock().unwrap().last().cloned();
        let Some(last) = last else {
            return Err(InstrumentError::Device {
                device: "camera",
                detail: "nothing exposed".into(),
            });
        };
        let mean = if last.frame.shutter_open() {
            (self.model)(last.seconds, &last.filter)
        } else {
            0.0
        };
        std::fs::write(path, b"")?;
        self.means.lock().unwrap().insert(path.to_path_buf(), mean);
        Ok(())
    }

    async fn central_mean(&self, path: &Path) -> Result<f64, InstrumentError> {
        self.means
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .ok_or_else(|| InstrumentError::Device {
                device: "camera",
                detail: format!("no frame {}", path.display()),
            })
    }

    async fn discard_image(&self, path: &Path) -> Result<(), InstrumentError> {
        self.discarded.lock().unwrap().push(path.to_path_buf());
        std::fs::remove_file(path)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTelescope {
    pub slews: Mutex<Vec<(f64, f64)>>,
    pub acquisitions: Mutex<Vec<(f64, f64)>>,
    pub focus_steps: Mutex<Vec<f64>>,
    pub autofocus_runs: AtomicU32,
}

#[async_trait]
impl Telescope for FakeTelescope {
    async fn slew_alt_az(&self, altitude: f64, azimuth: f64) -> Result<(), InstrumentError> {
        self.slews.lock().unwrap().push((altitude, azimuth));
        Ok(())
    }

    async fn acquire_target(&self, ra: f64, dec: f64) -> Result<(), InstrumentError> {
        self.acquisitions.lock().unwrap().push((ra, dec));
        Ok(())
    }

    async fn focuser_increment(&self, microns: f64) -> Result<(), InstrumentError> {
        self.focus_steps.lock().unwrap().push(microns);
        Ok(())
    }

    async fn auto_focus(&self) -> Result<(), InstrumentError> {
        self.autofocus_runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn in_position(&self) -> Result<bool, InstrumentError> {
        Ok(true)
    }

    async fn status(&self) -> Result<TelescopeStatus, InstrumentError> {
        Ok(TelescopeStatus::default())
    }
}
