//! Resync orchestrator
//!
//! Subscribers register during their initialization and receive a status
//! channel. A resync walks them in registration order, handing
//! [`ResyncStatus::Started`] to one subscriber at a time and waiting until
//! the subscriber takes it and acks before moving on. A subscriber which
//! does either too late is logged and skipped so a hung subsystem cannot
//! stall the others; the event it missed is discarded.

use crate::error::ResyncError;
use crate::event::{ResyncStatus, StatusEvent, StatusReceiver};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

/// Resync configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ResyncConfig {
    /// How long to wait for each subscriber to take the event and again for
    /// its ack, in milliseconds
    pub ack_timeout_ms: u64,
}

impl ResyncConfig {
    /// Parse configuration from TOML
    ///
    /// # Errors
    /// Returns error if the document is not valid configuration
    pub fn from_toml_str(content: &str) -> Result<Self, ResyncError> {
        toml::from_str(content).map_err(|err| ResyncError::Config(err.to_string()))
    }

    /// With ack timeout
    #[inline]
    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Ack timeout
    #[inline]
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5000,
        }
    }
}

/// Outcome of one subscriber's resync
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriberReport {
    /// Subscriber name
    pub name: String,
    /// True if the subscriber acked in time
    pub acked: bool,
    /// Time from handing over the event to the ack or the timeout
    pub duration: Duration,
}

/// Outcome of a resync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    /// Subscribers in the order they were resynced
    pub subscribers: Vec<SubscriberReport>,
    /// Duration of the whole resync
    pub total: Duration,
}

impl ResyncReport {
    /// True if every subscriber acked
    #[must_use]
    pub fn all_acked(&self) -> bool {
        self.subscribers.iter().all(|sub| sub.acked)
    }
}

/// Coordinates resync across registered subsystems
#[derive(Debug)]
pub struct ResyncOrchestrator {
    config: ResyncConfig,
    registrations: Mutex<IndexMap<String, mpsc::Sender<StatusEvent>>>,
    running: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    span: Span,
}

impl ResyncOrchestrator {
    /// Create orchestrator
    #[must_use]
    pub fn new(config: ResyncConfig) -> Self {
        Self {
            config,
            registrations: Mutex::new(IndexMap::new()),
            running: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            span: info_span!(parent: Span::current(), "resync"),
        }
    }

    /// Orchestrator configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ResyncConfig {
        &self.config
    }

    /// Register subscriber, returning its status channel.
    ///
    /// # Errors
    /// Returns error if the name is already registered or the orchestrator
    /// is closed
    pub fn register(&self, name: impl Into<String>) -> Result<StatusReceiver, ResyncError> {
        if self.is_closed() {
            return Err(ResyncError::Closed);
        }
        let name = name.into();
        let mut registrations = self.registrations.lock();
        if registrations.contains_key(&name) {
            return Err(ResyncError::DuplicateRegistration(name));
        }
        let (sender, receiver) = mpsc::channel(1);
        debug!(parent: &self.span, subscriber = %name, "Registered resync subscriber");
        registrations.insert(name, sender);
        Ok(StatusReceiver::new(receiver))
    }

    /// Registered subscribers in registration order
    #[must_use]
    pub fn subscribers(&self) -> Vec<String> {
        self.registrations.lock().keys().cloned().collect()
    }

    /// Resync after initialization of all subscribers
    ///
    /// # Errors
    /// Returns [`ResyncError::Closed`] if the orchestrator gets closed
    pub async fn after_init(&self) -> Result<ResyncReport, ResyncError> {
        info!(parent: &self.span, "Initial resync");
        self.do_resync().await
    }

    /// Resync every subscriber, one at a time in registration order.
    ///
    /// Concurrent calls run one after another.
    ///
    /// # Errors
    /// Returns [`ResyncError::Closed`] if the orchestrator gets closed
    pub async fn do_resync(&self) -> Result<ResyncReport, ResyncError> {
        let _running = tokio::select! {
            () = self.cancel.cancelled() => return Err(ResyncError::Closed),
            guard = self.running.lock() => guard,
        };
        let subscribers: Vec<(String, mpsc::Sender<StatusEvent>)> = self
            .registrations
            .lock()
            .iter()
            .map(|(name, sender)| (name.clone(), sender.clone()))
            .collect();

        async {
            let started = Instant::now();
            let mut report = ResyncReport::default();
            for (name, sender) in subscribers {
                let begin = Instant::now();
                let acked = self.resync_one(&name, &sender).await?;
                let duration = begin.elapsed();
                info!(subscriber = %name, acked, duration = ?duration, "Subscriber resynced");
                report.subscribers.push(SubscriberReport {
                    name,
                    acked,
                    duration,
                });
            }
            report.total = started.elapsed();
            info!(
                subscribers = report.subscribers.len(),
                total = ?report.total,
                "Resync finished"
            );
            Ok::<_, ResyncError>(report)
        }
        .instrument(self.span.clone())
        .await
    }

    async fn resync_one(&self, name: &str, sender: &mpsc::Sender<StatusEvent>) -> Result<bool, ResyncError> {
        let timeout = self.config.ack_timeout();
        let mut event = StatusEvent::new(ResyncStatus::Started);
        let Some(ack) = event.receive_ack() else {
            return Ok(false);
        };

        let taken = event.watch_taken();

        // Dropping `taken` on timeout makes the queued event stale
        let handoff = tokio::time::timeout(timeout, async move {
            if sender.send(event).await.is_err() {
                return false;
            }
            taken.await.is_ok()
        });
        let handed_over = tokio::select! {
            () = self.cancel.cancelled() => return Err(ResyncError::Closed),
            handed_over = handoff => handed_over,
        };
        match handed_over {
            Ok(true) => {}
            Ok(false) => {
                warn!(subscriber = %name, "Resync subscriber is gone");
                return Ok(false);
            }
            Err(_) => {
                warn!(subscriber = %name, timeout = ?timeout, "Resync subscriber did not take the event");
                return Ok(false);
            }
        }

        let acked = tokio::select! {
            () = self.cancel.cancelled() => return Err(ResyncError::Closed),
            acked = tokio::time::timeout(timeout, ack) => acked,
        };
        match acked {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(_)) => {
                warn!(subscriber = %name, "Resync event dropped without ack");
                Ok(false)
            }
            Err(_) => {
                warn!(subscriber = %name, timeout = ?timeout, "Resync ack timed out");
                Ok(false)
            }
        }
    }

    /// True once [`ResyncOrchestrator::close`] was called
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop accepting registrations and interrupt a running resync
    pub fn close(&self) {
        self.cancel.cancel();
        self.registrations.lock().clear();
        info!(parent: &self.span, "Resync orchestrator closed");
    }
}

impl Default for ResyncOrchestrator {
    fn default() -> Self {
        Self::new(ResyncConfig::default())
    }
}
