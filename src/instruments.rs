//! Camera and telescope seams.
//!
//! Vendor drivers live outside this crate; the night logic only talks to
//! these traits.

use crate::clock::Clock;
use crate::config::ImagerConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

const READY_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("requested filter {0} not present")]
    UnknownFilter(String),

    #[error("image not ready {0:?} after exposure")]
    ReadoutTimeout(Duration),

    #[error("slew to {0} failed")]
    SlewFailed(String),

    #[error("{device}: {detail}")]
    Device { device: &'static str, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    Bias,
    Dark,
    SkyFlat,
    Light,
}

impl FrameType {
    /// Whether the camera shutter opens during this frame.
    pub fn shutter_open(self) -> bool {
        matches!(self, FrameType::SkyFlat | FrameType::Light)
    }

    /// Object name used in file names for calibration frames.
    pub fn object_name(self) -> Option<&'static str> {
        match self {
            FrameType::Bias => Some("Bias"),
            FrameType::Dark => Some("Dark"),
            FrameType::SkyFlat => Some("SkyFlat"),
            FrameType::Light => None,
        }
    }
}

#[async_trait]
pub trait Camera: Send + Sync {
    async fn expose(&self, seconds: f64, frame: FrameType, filter: &str) -> Result<(), InstrumentError>;

    async fn image_ready(&self) -> Result<bool, InstrumentError>;

    async fn save_image(&self, path: &Path) -> Result<(), InstrumentError>;

    /// Mean counts over the central region of a saved frame.
    async fn central_mean(&self, path: &Path) -> Result<f64, InstrumentError>;

    async fn discard_image(&self, path: &Path) -> Result<(), InstrumentError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelescopeStatus {
    pub mount: String,
    /// Microns.
    pub focuser: f64,
    /// Degrees.
    pub rotator: f64,
    /// Primary mirror temperature, if the telemetry is available.
    pub temperature: Option<f64>,
    pub m3: String,
}

#[async_trait]
pub trait Telescope: Send + Sync {
    async fn slew_alt_az(&self, altitude: f64, azimuth: f64) -> Result<(), InstrumentError>;

    /// Slew to J2000 coordinates (RA hours, Dec degrees) and start tracking.
    async fn acquire_target(&self, ra: f64, dec: f64) -> Result<(), InstrumentError>;

    async fn focuser_increment(&self, microns: f64) -> Result<(), InstrumentError>;

    async fn auto_focus(&self) -> Result<(), InstrumentError>;

    async fn in_position(&self) -> Result<bool, InstrumentError>;

    async fn status(&self) -> Result<TelescopeStatus, InstrumentError>;
}

/// Camera plus the night's file naming.
pub struct Imager {
    camera: Arc<dyn Camera>,
    clock: Arc<dyn Clock>,
    config: ImagerConfig,
    night: String,
    dir: PathBuf,
    index: AtomicU32,
}

impl Imager {
    /// Frames are written to `data_dir/<night>/`. Numbering continues after
    /// any frames already there.
    pub fn new(
        camera: Arc<dyn Camera>,
        clock: Arc<dyn Clock>,
        config: ImagerConfig,
        data_dir: &Path,
        night: &str,
    ) -> Result<Self, InstrumentError> {
        let dir = data_dir.join(night);
        std::fs::create_dir_all(&dir)?;
        let existing = std::fs::read_dir(&dir)?
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "fits"))
            .count();

        Ok(Self {
            camera,
            clock,
            config,
            night: night.to_string(),
            dir,
            index: AtomicU32::new(u32::try_from(existing).unwrap_or(u32::MAX)),
        })
    }

    pub fn camera(&self) -> &Arc<dyn Camera> {
        &self.camera
    }

    pub fn has_filter(&self, filter: &str) -> bool {
        self.config.filters.iter().any(|f| f == filter)
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    fn next_path(&self, object: &str) -> PathBuf {
        let index = self.index.fetch_add(1, Ordering::Relaxed) + 1;
        self.dir.join(format!(
            "{}.{}.{}.{:04}.fits",
            self.night, self.config.camera_id, object, index
        ))
    }

    /// Expose, wait for readout and save. Returns the saved path.
    pub async fn take_image(
        &self,
        seconds: f64,
        filter: &str,
        object: &str,
        frame: FrameType,
    ) -> Result<PathBuf, InstrumentError> {
        if !self.has_filter(filter) {
            error!("Requested filter ({}) not present", filter);
            return Err(InstrumentError::UnknownFilter(filter.to_string()));
        }

        self.camera.expose(seconds, frame, filter).await?;

        let limit = Duration::from_secs_f64(seconds.max(0.0))
            + Duration::from_secs(self.config.readout_timeout_s);
        let mut waited = Duration::ZERO;
        while !self.camera.image_ready().await? {
            if waited >= limit {
                error!("Image not ready after {:?}", waited);
                return Err(InstrumentError::ReadoutTimeout(waited));
            }
            self.clock.sleep(READY_POLL).await;
            waited += READY_POLL;
        }

        let path = self.next_path(object);
        info!("Saving image: {}", path.display());
        self.camera.save_image(&path).await?;
        Ok(path)
    }
}

/// Stand-in camera for dry runs. Writes a small JSON sidecar instead of a
/// FITS file and reports `bias + rate * seconds` as the frame mean.
#[derive(Debug)]
pub struct SimulatedCamera {
    bias: f64,
    rate: f64,
    last: std::sync::Mutex<Option<(f64, FrameType, String)>>,
}

impl SimulatedCamera {
    pub fn new(bias: f64, rate: f64) -> Self {
        Self {
            bias,
            rate,
            last: std::sync::Mutex::new(None),
        }
    }

    fn last(&self) -> Option<(f64, FrameType, String)> {
        self.last
            .lock()
            .map(|last| last.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn mean_for(&self, seconds: f64, frame: FrameType) -> f64 {
        if frame.shutter_open() {
            self.bias + self.rate * seconds
        } else {
            self.bias
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SimulatedFrame {
    seconds: f64,
    frame: FrameType,
    filter: String,
    mean: f64,
}

#[async_trait]
impl Camera for SimulatedCamera {
    async fn expose(&self, seconds: f64, frame: FrameType, filter: &str) -> Result<(), InstrumentError> {
        if let Ok(mut last) = self.last.lock() {
            *last = Some((seconds, frame, filter.to_string()));
        }
        Ok(())
    }

    async fn image_ready(&self) -> Result<bool, InstrumentError> {
        Ok(self.last().is_some())
    }

    async fn save_image(&self, path: &Path) -> Result<(), InstrumentError> {
        let Some((seconds, frame, filter)) = self.last() else {
            return Err(InstrumentError::Device {
                device: "camera",
                detail: "no exposure to save".into(),
            });
        };
        let record = SimulatedFrame {
            seconds,
            frame,
            filter,
            mean: self.mean_for(seconds, frame),
        };
        let body = serde_json::to_vec(&record).map_err(|e| InstrumentError::Device {
            device: "camera",
            detail: e.to_string(),
        })?;
        tokio::fs::write(path, body).await?;
        Ok(())
    }

    async fn central_mean(&self, path: &Path) -> Result<f64, InstrumentError> {
        let body = tokio::fs::read(path).await?;
        let record: SimulatedFrame = serde_json::from_slice(&body).map_err(|e| InstrumentError::Device {
            device: "camera",
            detail: format!("{}: {e}", path.display()),
        })?;
        Ok(record.mean)
    }

    async fn discard_image(&self, path: &Path) -> Result<(), InstrumentError> {
        tokio::fs::remove_file(path).await?;
        Ok(())
    }
}

/// Stand-in telescope for dry runs. Every slew succeeds instantly.
#[derive(Debug, Default)]
pub struct SimulatedTelescope {
    status: std::sync::Mutex<TelescopeStatus>,
}

impl SimulatedTelescope {
    fn update(&self, change: impl FnOnce(&mut TelescopeStatus)) {
        if let Ok(mut status) = self.status.lock() {
            change(&mut status);
        }
    }
}

#[async_trait]
impl Telescope for SimulatedTelescope {
    async fn slew_alt_az(&self, altitude: f64, azimuth: f64) -> Result<(), InstrumentError> {
        info!("Simulated slew to alt={:.1} az={:.1}", altitude, azimuth);
        self.update(|status| status.mount = format!("alt={altitude:.1} az={azimuth:.1}"));
        Ok(())
    }

    async fn acquire_target(&self, ra: f64, dec: f64) -> Result<(), InstrumentError> {
        info!("Simulated acquire ra={:.4} dec={:.4}", ra, dec);
        self.update(|status| status.mount = format!("ra={ra:.4} dec={dec:.4}"));
        Ok(())
    }

    async fn focuser_increment(&self, microns: f64) -> Result<(), InstrumentError> {
        self.update(|status| status.focuser += microns);
        Ok(())
    }

    async fn auto_focus(&self) -> Result<(), InstrumentError> {
        info!("Simulated autofocus");
        Ok(())
    }

    async fn in_position(&self) -> Result<bool, InstrumentError> {
        Ok(true)
    }

    async fn status(&self) -> Result<TelescopeStatus, InstrumentError> {
        Ok(self
            .status
            .lock()
            .map(|status| status.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use chrono::Utc;

    fn imager(dir: &Path) -> Imager {
        Imager::new(
            Arc::new(SimulatedCamera::new(3200.0, 400.0)),
            Arc::new(SimulatedClock::new(Utc::now())),
            ImagerConfig::default(),
            dir,
            "n20240321",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn frames_are_numbered_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let imager = imager(dir.path());

        let first = imager.take_image(0.0, "V", "Bias", FrameType::Bias).await.unwrap();
        let second = imager.take_image(30.0, "V", "KELT-16", FrameType::Light).await.unwrap();

        assert!(first.ends_with("n20240321/n20240321.T3.Bias.0001.fits"));
        assert!(second.ends_with("n20240321/n20240321.T3.KELT-16.0002.fits"));
    }

    #[tokio::test]
    async fn numbering_continues_after_existing_frames() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("n20240321")).unwrap();
        std::fs::write(dir.path().join("n20240321/n20240321.T3.Dark.0001.fits"), "").unwrap();

        let path = imager(dir.path())
            .take_image(60.0, "V", "Dark", FrameType::Dark)
            .await
            .unwrap();
        assert!(path.ends_with("n20240321.T3.Dark.0002.fits"));
    }

    #[tokio::test]
    async fn unknown_filter_is_refused_before_exposing() {
        let dir = tempfile::tempdir().unwrap();
        let err = imager(dir.path())
            .take_image(10.0, "Halpha", "M42", FrameType::Light)
            .await
            .unwrap_err();
        assert!(matches!(err, InstrumentError::UnknownFilter(ref f) if f == "Halpha"));
    }

    #[tokio::test]
    async fn simulated_flat_mean_follows_exposure() {
        let dir = tempfile::tempdir().unwrap();
        let imager = imager(dir.path());
        let path = imager.take_image(10.0, "V", "SkyFlat", FrameType::SkyFlat).await.unwrap();
        let mean = imager.camera().central_mean(&path).await.unwrap();
        assert_eq!(mean, 7200.0);
    }
}
