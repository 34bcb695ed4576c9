//! Time sources and the night-wide cancellation handle.
//!
//! All scheduling waits in the crate go through a [`Clock`] so that a whole
//! night can be replayed against virtual time, and through [`Observing`] so
//! that every wait ends promptly once observing is stopped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

#[async_trait]
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for `duration` of this clock's time.
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock time backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock for dry runs and tests. Sleeping advances the clock
/// immediately instead of blocking.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl SimulatedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let step = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        if let Ok(mut now) = self.now.lock() {
            *now += step;
        }
    }

    pub fn set(&self, time: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = time;
        }
    }
}

#[async_trait]
impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Process-wide "still observing" flag.
///
/// Cloning shares the flag. Once [`Observing::stop`] is called every clone
/// reports inactive and any pending [`Observing::wait`] returns early.
#[derive(Debug, Clone)]
pub struct Observing {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Observing {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(true);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn is_active(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn stop(&self) {
        self.tx.send_replace(false);
    }

    /// Sleep on `clock` for `duration`. Returns `false` without finishing the
    /// sleep if observing stops first.
    pub async fn wait(&self, clock: &dyn Clock, duration: Duration) -> bool {
        if !self.is_active() {
            return false;
        }

        let mut rx = self.rx.clone();
        tokio::select! {
            biased;
            () = clock.sleep(duration) => self.is_active(),
            _ = rx.wait_for(|active| !*active) => false,
        }
    }

    /// Resolves once observing has stopped.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|active| !*active).await;
    }
}

impl Default for Observing {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a (possibly negative) chrono span into a std duration, clamping
/// at zero.
pub fn to_std(span: chrono::Duration) -> Duration {
    span.to_std().unwrap_or(Duration::ZERO)
}
