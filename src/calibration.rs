//! Bias, dark and twilight-flat sequences.

use crate::clock::{to_std, Clock, Observing};
use crate::config::CalibrationConfig;
use crate::ephemeris::{next_crossing, night_start, sun_altitude, sun_position, Crossing, Site};
use crate::instruments::{FrameType, Imager, InstrumentError, Telescope};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error(transparent)]
    Instrument(#[from] InstrumentError),

    #[error("observing stopped after {taken} of {requested} frames")]
    Stopped { taken: u32, requested: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationKind {
    Bias,
    Dark,
}

impl CalibrationKind {
    fn frame(self) -> FrameType {
        match self {
            CalibrationKind::Bias => FrameType::Bias,
            CalibrationKind::Dark => FrameType::Dark,
        }
    }
}

/// How a flat frame's central mean was judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatVerdict {
    Accept,
    Saturated,
    Underexposed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlatStep {
    pub verdict: FlatVerdict,
    /// The exposure time is stuck at the limit the sky is pushing it
    /// towards; more frames in this filter cannot succeed.
    pub pinned: bool,
    pub next_exposure: f64,
}

/// Closed-loop exposure control for one filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatState {
    pub exposure: f64,
    pub min_exposure: f64,
    pub max_exposure: f64,
    pub bias_level: f64,
    pub target_counts: f64,
    pub saturation: f64,
    pub morning: bool,
    pub accepted: u32,
    pub attempts: u32,
}

impl FlatState {
    /// Mornings brighten, so they start at the longest exposure; evenings
    /// start at the shortest.
    pub fn new(config: &CalibrationConfig, morning: bool) -> Self {
        Self {
            exposure: if morning {
                config.flat_max_exposure_s
            } else {
                config.flat_min_exposure_s
            },
            min_exposure: config.flat_min_exposure_s,
            max_exposure: config.flat_max_exposure_s,
            bias_level: config.bias_level,
            target_counts: config.target_counts,
            saturation: config.saturation,
            morning,
            accepted: 0,
            attempts: 0,
        }
    }

    pub fn assess(&self, mean: f64) -> FlatVerdict {
        if mean > self.saturation {
            FlatVerdict::Saturated
        } else if mean < 2.0 * self.bias_level {
            FlatVerdict::Underexposed
        } else {
            FlatVerdict::Accept
        }
    }

    /// Exposure that would bring `mean` to the target counts, clamped.
    pub fn scaled_exposure(&self, mean: f64) -> f64 {
        let signal = mean - self.bias_level;
        if signal <= 0.0 {
            return self.max_exposure;
        }
        (self.exposure * (self.target_counts - self.bias_level) / signal)
            .clamp(self.min_exposure, self.max_exposure)
    }

    /// Judge a frame taken at the current exposure and move to the next
    /// exposure time.
    pub fn record(&mut self, mean: f64) -> FlatStep {
        let verdict = self.assess(mean);
        let pinned = match verdict {
            FlatVerdict::Saturated => self.morning && self.exposure <= self.min_exposure,
            FlatVerdict::Underexposed => !self.morning && self.exposure >= self.max_exposure,
            FlatVerdict::Accept => false,
        };

        self.attempts += 1;
        if verdict == FlatVerdict::Accept {
            self.accepted += 1;
        }
        self.exposure = self.scaled_exposure(mean);

        FlatStep {
            verdict,
            pinned,
            next_exposure: self.exposure,
        }
    }
}

/// Outcome of one twilight-flat run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatReport {
    pub skipped: Option<String>,
    /// Accepted frames per filter, in the order the filters were taken.
    pub accepted: Vec<(String, u32)>,
}

impl FlatReport {
    fn skipped(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        info!("{}; skipping flats", reason);
        Self {
            skipped: Some(reason),
            accepted: Vec::new(),
        }
    }

    pub fn total(&self) -> u32 {
        self.accepted.iter().map(|(_, n)| n).sum()
    }
}

pub struct CalibrationSequencer {
    imager: Arc<Imager>,
    telescope: Arc<dyn Telescope>,
    clock: Arc<dyn Clock>,
    observing: Observing,
    site: Site,
    config: CalibrationConfig,
}

impl CalibrationSequencer {
    pub fn new(
        imager: Arc<Imager>,
        telescope: Arc<dyn Telescope>,
        clock: Arc<dyn Clock>,
        observing: Observing,
        site: Site,
        config: CalibrationConfig,
    ) -> Self {
        Self {
            imager,
            telescope,
            clock,
            observing,
            site,
            config,
        }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn imager(&self) -> &Arc<Imager> {
        &self.imager
    }

    pub fn telescope(&self) -> &Arc<dyn Telescope> {
        &self.telescope
    }

    /// `count` sequential bias or dark frames. Biases are always zero
    /// length.
    pub async fn take_calibration_batch(
        &self,
        kind: CalibrationKind,
        exposure_s: f64,
        count: u32,
    ) -> Result<Vec<PathBuf>, CalibrationError> {
        let exposure = match kind {
            CalibrationKind::Bias => 0.0,
            CalibrationKind::Dark => exposure_s,
        };
        let frame = kind.frame();
        let object = frame.object_name().unwrap_or("Dark");

        let mut paths = Vec::with_capacity(count as usize);
        for n in 1..=count {
            if !self.observing.is_active() {
                warn!("Observing stopped during {:?} batch", kind);
                return Err(CalibrationError::Stopped {
                    taken: n - 1,
                    requested: count,
                });
            }
            info!("Taking {} {} of {} (exptime = {})", object, n, count, exposure);
            paths.push(
                self.imager
                    .take_image(exposure, &self.config.dark_filter, object, frame)
                    .await?,
            );
        }
        Ok(paths)
    }

    pub async fn biases(&self) -> Result<Vec<PathBuf>, CalibrationError> {
        self.take_calibration_batch(CalibrationKind::Bias, 0.0, self.config.bias_count)
            .await
    }

    pub async fn darks(&self) -> Result<Vec<PathBuf>, CalibrationError> {
        self.take_calibration_batch(
            CalibrationKind::Dark,
            self.config.dark_exposure_s,
            self.config.dark_count,
        )
        .await
    }

    /// Filters to take flats in, in order.
    pub fn flat_order(&self, filters: &[String], morning: bool) -> Vec<String> {
        let wanted = |name: &String| filters.contains(name) && self.imager.has_filter(name);
        let mut order: Vec<String> = self.config.filter_order.iter().filter(|f| wanted(f)).cloned().collect();
        if morning {
            order.reverse();
        }
        order
    }

    /// Twilight flats with closed-loop exposure control.
    pub async fn twilight_flats(
        &self,
        filters: &[String],
        morning: bool,
        count: u32,
    ) -> Result<FlatReport, CalibrationError> {
        let now = self.clock.now();
        let sun = sun_altitude(&self.site, now);
        let setting = sun_altitude(&self.site, now + Duration::minutes(1)) < sun;
        let (min_alt, max_alt) = (self.config.flat_min_sun_alt, self.config.flat_max_sun_alt);

        let (edge, direction) = if setting {
            if morning {
                return Ok(FlatReport::skipped("Sun setting and morning flats requested"));
            }
            if sun < min_alt {
                return Ok(FlatReport::skipped("Sun setting and already too low"));
            }
            (max_alt, Crossing::Setting)
        } else {
            if !morning {
                return Ok(FlatReport::skipped("Sun rising and evening flats requested"));
            }
            if sun > max_alt {
                return Ok(FlatReport::skipped("Sun rising and already too high"));
            }
            (min_alt, Crossing::Rising)
        };

        let Some(flat_start) = next_crossing(&self.site, night_start(&self.site, now), edge, direction)
        else {
            return Ok(FlatReport::skipped("No twilight found"));
        };

        let until_twilight = flat_start - now - Duration::seconds(self.config.flat_lead_s as i64);
        if until_twilight > Duration::seconds(self.config.max_twilight_wait_s as i64) {
            return Ok(FlatReport::skipped(format!(
                "Twilight too far away ({} seconds)",
                until_twilight.num_seconds()
            )));
        }

        let in_window = sun >= min_alt && sun <= max_alt;
        if until_twilight > Duration::zero() && !in_window {
            info!("Waiting {} seconds until twilight", until_twilight.num_seconds());
            if !self.observing.wait(self.clock.as_ref(), to_std(until_twilight)).await {
                return Ok(FlatReport::skipped("Observing stopped"));
            }
        }

        info!("Beginning twilight flats");
        let mut report = FlatReport::default();
        for filter in self.flat_order(filters, morning) {
            if !self.observing.is_active() {
                break;
            }
            let accepted = self.flats_in_filter(&filter, morning, count).await?;
            report.accepted.push((filter, accepted));
        }
        Ok(report)
    }

    async fn flats_in_filter(&self, filter: &str, morning: bool, count: u32) -> Result<u32, CalibrationError> {
        let mut state = FlatState::new(&self.config, morning);

        while state.accepted < count && state.attempts < self.config.max_flat_attempts {
            if !self.observing.is_active() {
                break;
            }

            // Anti-solar point at fixed altitude is the flattest part of the sky.
            let altitude = self.config.flat_altitude;
            let azimuth = (sun_position(&self.site, self.clock.now()).azimuth + 180.0).rem_euclid(360.0);
            info!(
                "Slewing to the optimally flat part of the sky (alt={:.1}, az={:.1})",
                altitude, azimuth
            );
            if let Err(e) = self.telescope.slew_alt_az(altitude, azimuth).await {
                error!("Slew failed to alt={:.1}, az={:.1}: {}", altitude, azimuth, e);
            } else if !self.telescope.in_position().await.unwrap_or(false) {
                warn!("Telescope not in position at alt={:.1}, az={:.1}", altitude, azimuth);
            }

            let exposure = state.exposure;
            let path = self
                .imager
                .take_image(exposure, filter, "SkyFlat", FrameType::SkyFlat)
                .await?;
            let mean = self.imager.camera().central_mean(&path).await?;
            let step = state.record(mean);

            info!(
                "Flat {} of {} in {}: {}: mean = {:.0} exptime = {:.2} sunalt = {:.2}",
                state.accepted,
                count,
                filter,
                path.display(),
                mean,
                exposure,
                sun_altitude(&self.site, self.clock.now())
            );

            if step.verdict != FlatVerdict::Accept {
                info!("Flat deleted: exptime={:.2} mean={:.0}; {:?}", exposure, mean, step.verdict);
                if let Err(e) = self.imager.camera().discard_image(&path).await {
                    warn!("Could not delete {}: {}", path.display(), e);
                }
                if step.pinned {
                    info!(
                        "Exposure time pinned at {:.2}s and the sky is moving the wrong way; skipping remaining exposures in filter {}",
                        exposure, filter
                    );
                    break;
                }
            }
            info!("Scaling exptime to {:.2}", step.next_exposure);
        }

        Ok(state.accepted)
    }
}
