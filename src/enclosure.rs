//! Stateful client for one enclosure controller.
//!
//! Every command goes through a single channel lock, so the heartbeat task
//! and foreground operations never interleave frames on the wire.

use crate::clock::{Clock, Observing};
use crate::config::EnclosureConfig;
use crate::notify::{Alert, Notifier};
use crate::protocol::{
    succeeded, EnclosureCommand, EnclosureStatus, EnclosureTransport, ProtocolError, ShutterState,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum EnclosureError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("no valid status after {attempts} attempts: {last}")]
    StatusUnavailable { attempts: u32, last: String },

    #[error("{command} rejected: {response}")]
    Rejected {
        command: EnclosureCommand,
        response: String,
    },

    #[error("shutter {shutter} is {state} after {waited_s}s")]
    ShutterTimeout {
        shutter: u8,
        state: ShutterState,
        waited_s: i64,
    },

    #[error("shutter {shutter} stopped at {state} after {waited_s}s while opening")]
    OpenStalled {
        shutter: u8,
        state: ShutterState,
        waited_s: i64,
    },

    #[error("shutter {0} reports a fault")]
    ShutterFault(u8),

    #[error("enclosure is in manual mode and cannot be commanded")]
    ManualMode,

    #[error("enclosure failed to close after {attempts} attempts")]
    CloseFailed { attempts: u32 },

    #[error("observing stopped")]
    Stopped,
}

/// Mutable per-enclosure state.
#[derive(Debug, Clone)]
pub struct EnclosureState {
    pub shutters: [ShutterState; 2],
    pub last_close_time: DateTime<Utc>,
    /// A close-failure alert is outstanding.
    pub alert_sent: bool,
    /// A manual-mode alert is outstanding.
    pub manual_alert_sent: bool,
    pub is_open: bool,
    pub last_status: Option<EnclosureStatus>,
}

pub struct Enclosure {
    config: EnclosureConfig,
    channel: Mutex<Box<dyn EnclosureTransport>>,
    state: StdMutex<EnclosureState>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl Enclosure {
    pub fn new(
        config: EnclosureConfig,
        transport: Box<dyn EnclosureTransport>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = EnclosureState {
            shutters: [ShutterState::Closed; 2],
            last_close_time: clock.now() - ChronoDuration::days(1),
            alert_sent: false,
            manual_alert_sent: false,
            is_open: false,
            last_status: None,
        };
        Self {
            config,
            channel: Mutex::new(transport),
            state: StdMutex::new(state),
            notifier,
            clock,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    fn state(&self) -> MutexGuard<'_, EnclosureState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> EnclosureState {
        self.state().clone()
    }

    /// True once both shutters were confirmed open and no close has been
    /// issued since.
    pub fn is_open(&self) -> bool {
        self.state().is_open
    }

    /// Whether any shutter could be open: the enclosure was opened here, the
    /// last status showed a shutter not closed, or no status has been read.
    pub fn may_be_open(&self) -> bool {
        let state = self.state();
        state.is_open
            || state.last_status.is_none()
            || state.shutters.iter().any(|s| *s != ShutterState::Closed)
    }

    pub fn last_close_time(&self) -> DateTime<Utc> {
        self.state().last_close_time
    }

    /// Whether the reopen cooldown since the last confirmed close has
    /// elapsed.
    pub fn cooldown_elapsed(&self) -> bool {
        self.clock.now() - self.last_close_time() >= self.config.reopen_cooldown()
    }

    /// Send one command and return the raw reply.
    pub async fn send(&self, command: EnclosureCommand) -> Result<String, EnclosureError> {
        let channel = self.channel.lock().await;
        debug!("Sending {} to enclosure {}", command, self.config.id);
        channel.exchange(command).await.map_err(|e| {
            warn!("Enclosure {}: {} failed: {}", self.config.id, command, e);
            EnclosureError::from(e)
        })
    }

    /// Send a command given as text. Anything outside the whitelist is
    /// rejected without touching the wire.
    pub async fn send_text(&self, text: &str) -> Result<String, EnclosureError> {
        let command = text.parse::<EnclosureCommand>().map_err(|e| {
            error!("Message not recognized: {}", text);
            EnclosureError::from(e)
        })?;
        self.send(command).await
    }

    /// Query and validate the controller status, retrying a bounded number of
    /// times on malformed or failed replies.
    pub async fn status(&self) -> Result<EnclosureStatus, EnclosureError> {
        let limit = self.config.status_retry_limit.max(1);
        let mut last = String::new();

        for attempt in 1..=limit {
            let parsed = self
                .send(EnclosureCommand::Status)
                .await
                .and_then(|reply| EnclosureStatus::parse(&reply).map_err(EnclosureError::from));
            match parsed {
                Ok(status) => {
                    debug!("Status: {:?}", status.fields());
                    self.record_status(&status).await;
                    return Ok(status);
                }
                Err(e) => {
                    warn!(
                        "Enclosure {} status attempt {}/{} failed: {}; trying again",
                        self.config.id, attempt, limit, e
                    );
                    last = e.to_string();
                }
            }
        }

        error!("Enclosure {} status unavailable", self.config.id);
        Err(EnclosureError::StatusUnavailable {
            attempts: limit,
            last,
        })
    }

    async fn record_status(&self, status: &EnclosureStatus) {
        {
            let mut state = self.state();
            state.shutters = [status.shutter(1), status.shutter(2)];
            state.last_status = Some(status.clone());
        }

        let Some(path) = &self.config.status_file else {
            return;
        };
        match serde_json::to_vec(status) {
            Ok(body) => {
                if let Err(e) = tokio::fs::write(path, body).await {
                    warn!("Could not write status file {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("Could not serialize status: {}", e),
        }
    }

    /// Keep-alive. Failures are logged and reported as `false`, never raised.
    pub async fn heartbeat(&self) -> bool {
        match self.send(EnclosureCommand::Heartbeat).await {
            Ok(reply) => {
                debug!("Heartbeat: {}", reply);
                true
            }
            Err(e) => {
                warn!("Enclosure {} missed heartbeat: {}", self.config.id, e);
                false
            }
        }
    }

    /// Run [`Enclosure::heartbeat`] on the configured interval until
    /// observing stops.
    pub fn spawn_heartbeat(self: &Arc<Self>, observing: Observing) -> JoinHandle<()> {
        let enclosure = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(enclosure.config.heartbeat_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        enclosure.heartbeat().await;
                    }
                    () = observing.stopped() => break,
                }
            }
            debug!("Heartbeat for enclosure {} stopped", enclosure.config.id);
        })
    }

    /// Open shutter 1 briefly and stop it, for ventilation.
    pub async fn crack(&self) -> Result<(), EnclosureError> {
        info!("Cracking enclosure {}", self.config.id);
        self.send(EnclosureCommand::OpenShutter1).await?;
        self.send(EnclosureCommand::Stop).await?;
        Ok(())
    }

    /// Lights off, then shutter 1, then shutter 2. The enclosure is marked
    /// open only if both shutters open; a partial open is closed again.
    pub async fn open_both(&self, observing: &Observing) -> Result<(), EnclosureError> {
        info!("Shutting off lights");
        if let Err(e) = self.send(EnclosureCommand::LightsOff).await {
            error!("Could not turn off lights: {}", e);
        }

        for shutter in [1, 2] {
            info!("Opening shutter {}", shutter);
            if let Err(e) = self.open_shutter(shutter, observing).await {
                if self.may_be_open() {
                    warn!("Enclosure {} partly open after failing to open; closing", self.config.id);
                    if let Err(close) = self.close_both().await {
                        error!("Could not close partly open enclosure {}: {}", self.config.id, close);
                    }
                }
                return Err(e);
            }
            info!("Shutter {} open", shutter);
        }

        self.state().is_open = true;
        Ok(())
    }

    pub async fn open_shutter(&self, shutter: u8, observing: &Observing) -> Result<(), EnclosureError> {
        let command = EnclosureCommand::open_shutter(shutter)?;

        let status = self.status().await?;
        if status.shutter(shutter) == ShutterState::Open {
            info!("Shutter {} already open", shutter);
            return Ok(());
        }
        if status.manual_mode() {
            warn!("Enclosure {} in manual; can't open", self.config.id);
            return Err(EnclosureError::ManualMode);
        }

        let start = self.clock.now();
        let reply = self.send(command).await?;
        if !succeeded(&reply) {
            error!("Failed to open shutter {}: {}", shutter, reply);
            return Err(EnclosureError::Rejected {
                command,
                response: reply,
            });
        }

        info!("Waiting for shutter {} to open", shutter);
        let timeout = ChronoDuration::seconds(self.config.open_timeout_s as i64);
        let grace = ChronoDuration::seconds(self.config.open_start_grace_s as i64);
        let mut state = status.shutter(shutter);
        let mut moving = false;
        loop {
            let waited = self.clock.now() - start;
            let fresh = match self.status().await {
                Ok(status) => {
                    state = status.shutter(shutter);
                    true
                }
                Err(e) => {
                    warn!("Status unavailable while opening shutter {}: {}", shutter, e);
                    false
                }
            };

            match state {
                ShutterState::Open => return Ok(()),
                ShutterState::Fault => {
                    error!("Error opening shutter {}: controller reports a fault", shutter);
                    return Err(EnclosureError::ShutterFault(shutter));
                }
                ShutterState::Opening => moving = true,
                ShutterState::Closed | ShutterState::Closing if fresh && (moving || waited >= grace) => {
                    error!("Error opening shutter {}: {} after {}s", shutter, state, waited.num_seconds());
                    return Err(EnclosureError::OpenStalled {
                        shutter,
                        state,
                        waited_s: waited.num_seconds(),
                    });
                }
                ShutterState::Closed | ShutterState::Closing => {}
            }

            if waited >= timeout {
                error!("Error opening shutter {}: still {} after {}s", shutter, state, waited.num_seconds());
                return Err(EnclosureError::ShutterTimeout {
                    shutter,
                    state,
                    waited_s: waited.num_seconds(),
                });
            }

            if !observing.wait(self.clock.as_ref(), self.config.poll_interval()).await {
                return Err(EnclosureError::Stopped);
            }
        }
    }

    /// Close both shutters, retrying until they are confirmed closed.
    ///
    /// Only returns early when the controller is in manual mode or the
    /// configured retry limit (if any) is exhausted. Not cancelled by
    /// stopping observing.
    pub async fn close_both(&self) -> Result<(), EnclosureError> {
        let mut failures: u32 = 0;

        loop {
            match self.close_attempt().await {
                Ok(CloseOutcome::AlreadyClosed) => {
                    debug!("Both shutters already closed");
                    self.resolve_alert("closed").await;
                    self.state().is_open = false;
                    return Ok(());
                }
                Ok(CloseOutcome::Closed) => {
                    info!("Closed both shutters");
                    {
                        let mut state = self.state();
                        state.last_close_time = self.clock.now();
                        state.is_open = false;
                    }
                    self.resolve_alert("closed; crisis averted").await;
                    return Ok(());
                }
                Err(EnclosureError::ManualMode) => {
                    warn!("Enclosure {} in manual; can't close", self.config.id);
                    let first = !std::mem::replace(&mut self.state().manual_alert_sent, true);
                    if first {
                        self.notifier
                            .notify(Alert::critical(
                                format!("Enclosure {} in manual", self.config.id),
                                "Please turn to 'AUTO' for computer control.",
                            ))
                            .await;
                    }
                    return Err(EnclosureError::ManualMode);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    self.state().is_open = true;
                    error!("Enclosure {} failed to close (attempt {}): {}", self.config.id, failures, e);

                    let already_alerted = std::mem::replace(&mut self.state().alert_sent, true);
                    let escalate = self.config.close_alert_every > 0
                        && failures % self.config.close_alert_every == 0;
                    if !already_alerted || escalate {
                        self.notifier
                            .notify(Alert::critical(
                                format!("Enclosure {} failed to close!", self.config.id),
                                format!("{} failed close attempts so far. Last error: {}", failures, e),
                            ))
                            .await;
                    }

                    if self.config.close_retry_limit.is_some_and(|limit| failures >= limit) {
                        return Err(EnclosureError::CloseFailed { attempts: failures });
                    }

                    info!("Trying to close again!");
                    self.clock
                        .sleep(Duration::from_secs(self.config.close_retry_delay_s))
                        .await;
                }
            }
        }
    }

    async fn close_attempt(&self) -> Result<CloseOutcome, EnclosureError> {
        self.state().is_open = false;

        let status = self.status().await?;
        if status.both_closed() {
            return Ok(CloseOutcome::AlreadyClosed);
        }
        if status.manual_mode() {
            return Err(EnclosureError::ManualMode);
        }

        let reply = self.send(EnclosureCommand::CloseSequential).await?;
        if !succeeded(&reply) {
            return Err(EnclosureError::Rejected {
                command: EnclosureCommand::CloseSequential,
                response: reply,
            });
        }
        info!("{}", reply);

        let start = self.clock.now();
        let timeout = ChronoDuration::seconds(self.config.close_timeout_s as i64);
        loop {
            let waited = self.clock.now() - start;
            let states = match self.status().await {
                Ok(status) if status.both_closed() => return Ok(CloseOutcome::Closed),
                Ok(status) => [status.shutter(1), status.shutter(2)],
                Err(e) => {
                    warn!("Status unavailable while closing: {}", e);
                    let cached = self.state().shutters;
                    cached
                }
            };

            if waited >= timeout {
                let (shutter, state) = if states[0] == ShutterState::Closed {
                    (2, states[1])
                } else {
                    (1, states[0])
                };
                return Err(EnclosureError::ShutterTimeout {
                    shutter,
                    state,
                    waited_s: waited.num_seconds(),
                });
            }
            self.clock.sleep(self.config.poll_interval()).await;
        }
    }

    /// Send the matching resolution once for an outstanding close or manual
    /// alert.
    async fn resolve_alert(&self, what: &str) {
        let (close_pending, manual_pending) = {
            let mut state = self.state();
            (
                std::mem::replace(&mut state.alert_sent, false),
                std::mem::replace(&mut state.manual_alert_sent, false),
            )
        };
        if close_pending || manual_pending {
            self.notifier
                .notify(Alert::critical(format!("Enclosure {} {}!", self.config.id, what), ""))
                .await;
        }
    }
}

enum CloseOutcome {
    AlreadyClosed,
    Closed,
}
