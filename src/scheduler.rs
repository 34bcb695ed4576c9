use crate::calibration::{CalibrationError, CalibrationSequencer};
use crate::clock::{to_std, Clock, Observing};
use crate::config::SchedulerConfig;
use crate::enclosure::{Enclosure, EnclosureError};
use crate::ephemeris::{night_name, NightTimes, Site};
use crate::instruments::FrameType;
use crate::safety::SafetyEngine;
use crate::target::Target;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("could not compute sunset/sunrise for {0}")]
    NoNight(DateTime<Utc>),

    #[error(transparent)]
    Enclosure(#[from] EnclosureError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NightStage {
    Init,
    Calibrate,
    WaitForEnclosureOpen,
    EveningFlats,
    WaitForSunset,
    Science,
    MorningFlats,
    Close,
    Done,
}

impl fmt::Display for NightStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// The end time passed before the target finished.
    Expired,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetOutcome {
    Completed { exposures: u32 },
    Skipped,
    Aborted { exposures: u32, reason: AbortReason },
}

impl TargetOutcome {
    pub fn exposures(self) -> u32 {
        match self {
            TargetOutcome::Completed { exposures } | TargetOutcome::Aborted { exposures, .. } => {
                exposures
            }
            TargetOutcome::Skipped => 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NightSummary {
    pub night: String,
    pub sunset: Option<DateTime<Utc>>,
    pub sunrise: Option<DateTime<Utc>>,
    pub calibration_frames: u32,
    pub evening_flats: u32,
    pub morning_flats: u32,
    pub exposures: u32,
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    pub aborted: Vec<String>,
}

impl NightSummary {
    fn record(&mut self, target: &Target, outcome: TargetOutcome) {
        self.exposures += outcome.exposures();
        let bucket = match outcome {
            TargetOutcome::Completed { .. } => &mut self.completed,
            TargetOutcome::Skipped => &mut self.skipped,
            TargetOutcome::Aborted { .. } => &mut self.aborted,
        };
        bucket.push(target.name.clone());
    }
}

/// Runs one night: calibration, enclosure gating, flats and science.
pub struct NightScheduler {
    safety: Arc<SafetyEngine>,
    enclosure: Arc<Enclosure>,
    calibration: CalibrationSequencer,
    clock: Arc<dyn Clock>,
    observing: Observing,
    site: Site,
    config: SchedulerConfig,
    stage: NightStage,
}

impl NightScheduler {
    pub fn new(
        safety: Arc<SafetyEngine>,
        enclosure: Arc<Enclosure>,
        calibration: CalibrationSequencer,
        clock: Arc<dyn Clock>,
        observing: Observing,
        site: Site,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            safety,
            enclosure,
            calibration,
            clock,
            observing,
            site,
            config,
            stage: NightStage::Init,
        }
    }

    pub fn stage(&self) -> NightStage {
        self.stage
    }

    fn enter(&mut self, stage: NightStage) {
        info!("Night stage: {} -> {}", self.stage, stage);
        self.stage = stage;
    }

    fn open_retry_delay(&self) -> Duration {
        Duration::from_secs(self.config.open_retry_delay_s)
    }

    /// Open the enclosure if the weather allows and the reopen cooldown has
    /// passed. Returns whether the enclosure is now open.
    pub async fn try_open(&self) -> bool {
        if self.enclosure.is_open() {
            return true;
        }
        if !self.enclosure.cooldown_elapsed() {
            debug!(
                "Enclosure closed at {}; waiting out the reopen cooldown",
                self.enclosure.last_close_time()
            );
            return false;
        }
        if !self.safety.is_safe_to_open(false).await {
            if self.enclosure.may_be_open() {
                warn!("Not safe to open and enclosure {} may be open; closing", self.enclosure.id());
                if let Err(e) = self.enclosure.close_both().await {
                    error!("Close of enclosure {} failed: {}", self.enclosure.id(), e);
                }
            }
            return false;
        }
        match self.enclosure.open_both(&self.observing).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not open enclosure {}: {}", self.enclosure.id(), e);
                false
            }
        }
    }

    /// Block until the enclosure is open, re-acquiring the target if it had
    /// to be opened.
    async fn wait_for_open(&self, target: &Target) -> Result<(), AbortReason> {
        while !self.enclosure.is_open() {
            if !self.try_open().await {
                info!("Enclosure closed; waiting for conditions to improve");
                if !self
                    .observing
                    .wait(self.clock.as_ref(), self.open_retry_delay())
                    .await
                {
                    return Err(AbortReason::Stopped);
                }
            }

            if self.clock.now() > target.end_time {
                info!("Target {} passed its end time while waiting for the enclosure", target.name);
                return Err(AbortReason::Expired);
            }

            if self.enclosure.is_open() {
                self.acquire(target).await;
            }
        }
        Ok(())
    }

    async fn acquire(&self, target: &Target) {
        if let Err(e) = self
            .calibration
            .telescope()
            .acquire_target(target.ra, target.dec)
            .await
        {
            error!("Failed to acquire {}: {}", target.name, e);
        }
    }

    /// Observe one science target within its time window.
    pub async fn observe_target(&self, target: &Target) -> TargetOutcome {
        let now = self.clock.now();
        if now > target.end_time {
            info!("Target {} past its endtime ({}); skipping", target.name, target.end_time);
            return TargetOutcome::Skipped;
        }

        if now < target.start_time {
            let wait = target.start_time - now;
            info!(
                "Target {} is before its starttime ({}); waiting {} seconds",
                target.name,
                target.start_time,
                wait.num_seconds()
            );
            if !self.observing.wait(self.clock.as_ref(), to_std(wait)).await {
                return TargetOutcome::Aborted {
                    exposures: 0,
                    reason: AbortReason::Stopped,
                };
            }
        }

        self.acquire(target).await;
        if target.defocus != 0.0 {
            info!("Defocusing telescope by {} mm", target.defocus);
            if let Err(e) = self
                .calibration
                .telescope()
                .focuser_increment(target.defocus * 1000.0)
                .await
            {
                error!("Defocus failed: {}", e);
            }
        }

        let mut exposures = 0;
        for exposure in target.exposure_plan() {
            if let Err(reason) = self.wait_for_open(target).await {
                return TargetOutcome::Aborted { exposures, reason };
            }
            if self.clock.now() > target.end_time {
                info!("Target {} reached its end time", target.name);
                return TargetOutcome::Aborted {
                    exposures,
                    reason: AbortReason::Expired,
                };
            }

            info!(
                "Beginning {} of {}: {} second exposure of {} in the {} band",
                exposure.repeat, exposure.of, exposure.seconds, target.name, exposure.filter
            );
            match self
                .calibration
                .imager()
                .take_image(exposure.seconds, &exposure.filter, &target.name, FrameType::Light)
                .await
            {
                Ok(_) => exposures += 1,
                Err(e) => error!("Exposure of {} failed: {}", target.name, e),
            }
        }

        TargetOutcome::Completed { exposures }
    }

    /// Close whenever the close limits are violated, until observing stops.
    /// Closing an enclosure that is already closed costs one status query.
    fn spawn_weather_watch(&self) -> JoinHandle<()> {
        let safety = Arc::clone(&self.safety);
        let enclosure = Arc::clone(&self.enclosure);
        let observing = self.observing.clone();
        let period = Duration::from_secs(self.config.weather_watch_interval_s.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !safety.is_safe_to_open(true).await {
                            debug!("Weather unsafe; making sure enclosure {} is closed", enclosure.id());
                            if let Err(e) = enclosure.close_both().await {
                                error!("Weather close failed: {}", e);
                            }
                        }
                    }
                    () = observing.stopped() => break,
                }
            }
            debug!("Weather watch stopped");
        })
    }

    async fn calibrate(&self, summary: &mut NightSummary) {
        for batch in [self.calibration.biases().await, self.calibration.darks().await] {
            match batch {
                Ok(frames) => summary.calibration_frames += frames.len() as u32,
                Err(e) => error!("Calibration batch failed: {}", e),
            }
        }
    }

    async fn wait_for_initial_open(&self, sunrise: DateTime<Utc>) {
        while !self.try_open().await {
            if self.clock.now() >= sunrise {
                warn!("Enclosure never opened before sunrise");
                return;
            }
            if !self
                .observing
                .wait(self.clock.as_ref(), self.open_retry_delay())
                .await
            {
                return;
            }
        }
        info!("Enclosure {} open", self.enclosure.id());
    }

    /// Run the whole night. The enclosure is always closed before this
    /// returns.
    pub async fn run_night(&mut self, mut targets: Vec<Target>) -> Result<NightSummary, SchedulerError> {
        let now = self.clock.now();
        let times = NightTimes::compute(&self.site, now).ok_or(SchedulerError::NoNight(now))?;
        let mut summary = NightSummary {
            night: night_name(&self.site, now),
            sunset: Some(times.sunset),
            sunrise: Some(times.sunrise),
            ..NightSummary::default()
        };
        info!(
            "Starting night {}: sunset {}, sunrise {}",
            summary.night, times.sunset, times.sunrise
        );

        let heartbeat = self.enclosure.spawn_heartbeat(self.observing.clone());
        let watch = self.spawn_weather_watch();

        self.enter(NightStage::Calibrate);
        self.calibrate(&mut summary).await;

        self.enter(NightStage::WaitForEnclosureOpen);
        self.wait_for_initial_open(times.sunrise).await;

        let flat_filters = self.calibration.config().flat_filters.clone();
        let flat_count = self.calibration.config().flat_count;

        self.enter(NightStage::EveningFlats);
        if self.enclosure.is_open() {
            match self.calibration.twilight_flats(&flat_filters, false, flat_count).await {
                Ok(report) => summary.evening_flats = report.total(),
                Err(e) => error!("Evening flats failed: {}", e),
            }
        }

        self.enter(NightStage::WaitForSunset);
        let until_sunset = times.sunset - self.clock.now();
        if until_sunset > chrono::Duration::zero() {
            info!("Waiting for sunset ({} seconds)", until_sunset.num_seconds());
            self.observing.wait(self.clock.as_ref(), to_std(until_sunset)).await;
        }

        self.enter(NightStage::Science);
        if self.observing.is_active() {
            if let Err(e) = self.calibration.telescope().auto_focus().await {
                error!("Autofocus failed: {}", e);
            }
        }
        for target in &mut targets {
            if !self.observing.is_active() {
                break;
            }
            target.clamp_to_night(times.sunset, times.sunrise);
            let outcome = self.observe_target(target).await;
            info!("Target {}: {:?}", target.name, outcome);
            summary.record(target, outcome);
        }

        self.enter(NightStage::MorningFlats);
        if self.observing.is_active() && self.enclosure.is_open() {
            match self.calibration.twilight_flats(&flat_filters, true, flat_count).await {
                Ok(report) => summary.morning_flats = report.total(),
                Err(e) => error!("Morning flats failed: {}", e),
            }
        }

        self.enter(NightStage::Close);
        let closed = self.enclosure.close_both().await;
        if closed.is_ok() {
            self.calibrate(&mut summary).await;
        }

        self.observing.stop();
        for task in [heartbeat, watch] {
            if let Err(e) = task.await {
                error!("Background task ended abnormally: {}", e);
            }
        }
        self.enter(NightStage::Done);
        info!(
            "Night {} done: {} exposures, {} targets completed",
            summary.night,
            summary.exposures,
            summary.completed.len()
        );

        closed?;
        Ok(summary)
    }
}
