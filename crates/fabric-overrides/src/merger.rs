//! Override merger — background task feeding override events into the store.
//!
//! One `tokio::select!` loop multiplexes four sources:
//!
//! - a poll tick that reads newly appended lines from the override log
//! - pushed events from an `mpsc` channel
//! - a sweep tick that releases expired reservations
//! - an explicit stop signal
//!
//! Each source's events are handed to the store as one batch, which the
//! store applies in timestamp order under a single publish.

use std::sync::Arc;
use std::time::Duration;

use fabric_core::{MergerConfig, epoch_millis};
use fabric_state::{FabricStore, OverrideEvent, OverrideReport, StateError};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{MergerError, MergerResult};
use crate::log::OverrideLog;

/// Running totals, readable while the merger runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergerStats {
    pub batches: u64,
    pub applied: u64,
    pub unchanged: u64,
    pub rejected: u64,
    pub malformed: u64,
    pub read_timeouts: u64,
    pub expired_released: u64,
}

pub struct OverrideMerger {
    store: FabricStore,
    config: MergerConfig,
    log: Option<OverrideLog>,
    events: mpsc::Receiver<OverrideEvent>,
    stats: Arc<RwLock<MergerStats>>,
}

/// Stop handle for a spawned merger.
pub struct MergerHandle {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    stats: Arc<RwLock<MergerStats>>,
}

impl MergerHandle {
    /// Signal the loop to stop and wait for it to exit.
    pub async fn stop(self) -> MergerResult<()> {
        let _ = self.shutdown_tx.send(true);
        self.handle
            .await
            .map_err(|e| MergerError::Join(e.to_string()))?;
        info!("override merger stopped");
        Ok(())
    }

    pub async fn stats(&self) -> MergerStats {
        self.stats.read().await.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl OverrideMerger {
    /// Create a merger and the sender for pushed events.
    pub fn new(store: FabricStore, config: MergerConfig) -> (Self, mpsc::Sender<OverrideEvent>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let log = config.override_log.clone().map(OverrideLog::new);
        let merger = Self {
            store,
            config,
            log,
            events: rx,
            stats: Arc::new(RwLock::new(MergerStats::default())),
        };
        (merger, tx)
    }

    /// Run the loop on the current tokio runtime.
    pub fn spawn(self) -> MergerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::clone(&self.stats);
        let handle = tokio::spawn(self.run(shutdown_rx));
        MergerHandle {
            handle,
            shutdown_tx,
            stats,
        }
    }

    /// Loop until `shutdown` flips, its sender is dropped, or the store closes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut poll = tokio::time::interval(millis(self.config.poll_interval_ms));
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = tokio::time::interval(millis(self.config.ttl_sweep_interval_ms));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            log = ?self.config.override_log,
            poll_ms = self.config.poll_interval_ms,
            "override merger starting"
        );

        loop {
            let result = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    debug!("override merger shutting down");
                    break;
                }
                Some(first) = self.events.recv() => {
                    let mut batch = vec![first];
                    while let Ok(next) = self.events.try_recv() {
                        batch.push(next);
                    }
                    self.apply(batch).await.map(|_| ())
                }
                _ = poll.tick(), if self.log.is_some() => self.poll_log().await.map(|_| ()),
                _ = sweep.tick() => self.sweep_expired().await.map(|_| ()),
            };

            match result {
                Ok(()) => {}
                Err(MergerError::State(StateError::Closed)) => {
                    info!("fabric store closed, override merger exiting");
                    break;
                }
                Err(e) => error!(error = %e, "override merger step failed"),
            }
        }
    }

    /// Read the log once and apply what was appended.
    pub async fn poll_log(&mut self) -> MergerResult<Option<OverrideReport>> {
        let Some(log) = self.log.as_mut() else {
            return Ok(None);
        };
        let timeout = millis(self.config.read_timeout_ms);
        let batch = match tokio::time::timeout(timeout, log.read_new()).await {
            Ok(batch) => batch?,
            Err(_) => {
                self.stats.write().await.read_timeouts += 1;
                warn!(?timeout, "override log read timed out");
                return Err(MergerError::Timeout(timeout));
            }
        };
        if batch.malformed > 0 {
            self.stats.write().await.malformed += batch.malformed as u64;
        }
        if batch.events.is_empty() {
            return Ok(None);
        }
        self.apply(batch.events).await.map(Some)
    }

    /// Apply a batch of events atomically.
    pub async fn apply(&self, events: Vec<OverrideEvent>) -> MergerResult<OverrideReport> {
        let count = events.len();
        let report = self.store.apply_overrides(events)?;
        for (event_id, reason) in &report.rejected {
            warn!(%event_id, %reason, "override rejected");
        }
        debug!(
            count,
            applied = report.applied.len(),
            version = report.version,
            "override batch merged"
        );

        let mut stats = self.stats.write().await;
        stats.batches += 1;
        stats.applied += report.applied.len() as u64;
        stats.unchanged += report.unchanged.len() as u64;
        stats.rejected += report.rejected.len() as u64;
        Ok(report)
    }

    /// Release reservations whose TTL has passed.
    pub async fn sweep_expired(&self) -> MergerResult<usize> {
        let released = self.store.release_expired(epoch_millis())?;
        if !released.is_empty() {
            self.stats.write().await.expired_released += released.len() as u64;
        }
        Ok(released.len())
    }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}
