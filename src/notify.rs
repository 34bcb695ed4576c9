//! Operator notifications.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertLevel {
    Normal,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub subject: String,
    pub body: String,
    pub level: AlertLevel,
}

impl Alert {
    pub fn normal(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            level: AlertLevel::Normal,
        }
    }

    pub fn critical(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            level: AlertLevel::Critical,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver an alert. Delivery problems are logged, never returned.
    async fn notify(&self, alert: Alert);
}

/// Writes alerts to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, alert: Alert) {
        match alert.level {
            AlertLevel::Critical => error!("ALERT: {} - {}", alert.subject, alert.body),
            AlertLevel::Normal => warn!("ALERT: {} - {}", alert.subject, alert.body),
        }
    }
}

#[derive(Debug, Serialize)]
struct SpooledAlert<'a> {
    queued_at: DateTime<Utc>,
    #[serde(flatten)]
    alert: &'a Alert,
}

/// Drops each alert as a JSON file into a spool directory that an external
/// mailer drains.
#[derive(Debug)]
pub struct SpoolNotifier {
    dir: PathBuf,
    sequence: AtomicU32,
}

impl SpoolNotifier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sequence: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Notifier for SpoolNotifier {
    async fn notify(&self, alert: Alert) {
        TracingNotifier.notify(alert.clone()).await;

        let queued_at = Utc::now();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let path = self
            .dir
            .join(format!("{}-{:04}.json", queued_at.format("%Y%m%dT%H%M%S"), sequence));

        let body = match serde_json::to_vec_pretty(&SpooledAlert {
            queued_at,
            alert: &alert,
        }) {
            Ok(body) => body,
            Err(e) => {
                error!("Could not serialize alert {:?}: {}", alert.subject, e);
                return;
            }
        };

        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            error!("Could not create mail spool {}: {}", self.dir.display(), e);
            return;
        }
        match tokio::fs::write(&path, body).await {
            Ok(()) => info!("Queued alert {}", path.display()),
            Err(e) => error!("Could not queue alert {}: {}", path.display(), e),
        }
    }
}
