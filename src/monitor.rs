//! Per-loop monitor channel bundle.
//!
//! A [`MonitorControl`] is handed to a loop when it starts. It carries the
//! read-only done signal, the loop's tracker into the supervisor's barrier,
//! and up to three optional side channels: statistics out, clear requests in,
//! and error reports out. A loop with no side channels still gets a valid
//! bundle; emitting into an absent channel is a no-op.
//!
//! The orchestrator keeps the matching [`MonitorHandle`].

use crate::config::RuntimeConfig;
use crate::shutdown::{DoneSignal, LoopState, TaskTracker};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A serialized statistics snapshot relayed to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsReport {
    /// Name of the stage or queue that produced the snapshot
    pub source: String,
    /// Opaque JSON payload, schema owned by the producer
    pub payload: String,
    /// True for the last snapshot a loop sends before it returns
    pub terminal: bool,
}

/// An error reported by a loop instead of crashing the process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub source: String,
    pub message: String,
}

/// The loop-side bundle
#[derive(Debug)]
pub struct MonitorControl {
    name: String,
    done: DoneSignal,
    tracker: Option<TaskTracker>,
    stats_tx: Option<Sender<StatsReport>>,
    clear_rx: Option<Receiver<()>>,
    error_tx: Option<Sender<ErrorReport>>,
    lost_errors: Arc<AtomicU64>,
    stats_interval: Duration,
    final_stats_timeout: Duration,
}

impl MonitorControl {
    /// Version of the capability set carried by this bundle
    pub const VERSION: u32 = 1;

    /// A bundle with only the done signal
    pub fn new(name: impl Into<String>, done: DoneSignal) -> Self {
        let defaults = RuntimeConfig::default();
        Self {
            name: name.into(),
            done,
            tracker: None,
            stats_tx: None,
            clear_rx: None,
            error_tx: None,
            lost_errors: Arc::default(),
            stats_interval: defaults.stats_interval(),
            final_stats_timeout: defaults.final_stats_timeout(),
        }
    }

    /// A full bundle and the orchestrator's handle on it
    pub fn channel(
        name: impl Into<String>,
        done: DoneSignal,
        config: &RuntimeConfig,
    ) -> (Self, MonitorHandle) {
        let name = name.into();
        let (stats_tx, stats_rx) = channel::bounded(config.stats_capacity.max(1));
        let (clear_tx, clear_rx) = channel::bounded(1);
        let (error_tx, error_rx) = channel::bounded(config.stats_capacity.max(1));
        let lost_errors = Arc::new(AtomicU64::new(0));

        let control = Self {
            name: name.clone(),
            done,
            tracker: None,
            stats_tx: Some(stats_tx),
            clear_rx: Some(clear_rx),
            error_tx: Some(error_tx),
            lost_errors: Arc::clone(&lost_errors),
            stats_interval: config.stats_interval(),
            final_stats_timeout: config.final_stats_timeout(),
        };
        let handle = MonitorHandle {
            name,
            stats_rx,
            clear_tx,
            error_rx,
            lost_errors,
        };
        (control, handle)
    }

    pub(crate) fn attach(&mut self, tracker: TaskTracker) {
        self.tracker = Some(tracker);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn done(&self) -> &DoneSignal {
        &self.done
    }

    pub fn is_done(&self) -> bool {
        self.done.is_done()
    }

    pub fn stats_interval(&self) -> Duration {
        self.stats_interval
    }

    /// Which optional capabilities are present
    pub fn has_stats(&self) -> bool {
        self.stats_tx.is_some()
    }

    pub fn has_clear(&self) -> bool {
        self.clear_rx.is_some()
    }

    pub fn has_errors(&self) -> bool {
        self.error_tx.is_some()
    }

    /// Current lifecycle state, if supervised
    pub fn state(&self) -> Option<LoopState> {
        self.tracker.as_ref().map(TaskTracker::state)
    }

    fn advance(&self, state: LoopState) {
        if let Some(tracker) = &self.tracker {
            tracker.advance(state);
        }
    }

    pub fn enter_running(&self) {
        self.advance(LoopState::Running);
    }

    pub fn observe_done(&self) {
        self.advance(LoopState::ObservedDone);
    }

    pub fn begin_draining(&self) {
        self.advance(LoopState::Draining);
    }

    /// Push a snapshot without blocking. A full channel drops it.
    pub fn emit<S: Serialize>(&self, snapshot: &S) -> bool {
        let Some(tx) = &self.stats_tx else {
            return false;
        };
        let Some(report) = self.report(snapshot, false) else {
            return false;
        };
        match tx.try_send(report) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::trace!(source = %self.name, "stats channel full, snapshot dropped");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// The one blocking send of a loop's life, bounded by the configured
    /// final statistics timeout.
    pub fn emit_final<S: Serialize>(&self, snapshot: &S) -> bool {
        let Some(tx) = &self.stats_tx else {
            return false;
        };
        let Some(report) = self.report(snapshot, true) else {
            return false;
        };
        match tx.send_timeout(report, self.final_stats_timeout) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(source = %self.name, error = %err, "terminal stats not delivered");
                false
            }
        }
    }

    fn report<S: Serialize>(&self, snapshot: &S, terminal: bool) -> Option<StatsReport> {
        match serde_json::to_string(snapshot) {
            Ok(payload) => Some(StatsReport {
                source: self.name.clone(),
                payload,
                terminal,
            }),
            Err(err) => {
                tracing::warn!(source = %self.name, error = %err, "failed to serialize stats");
                None
            }
        }
    }

    /// Consume any pending clear requests. Several requests made between
    /// two checks collapse into one.
    pub fn take_clear_request(&self) -> bool {
        match &self.clear_rx {
            Some(rx) => rx.try_iter().count() > 0,
            None => false,
        }
    }

    /// Clear-request receiver, for use in `crossbeam::select!`
    pub fn clear_receiver(&self) -> Option<&Receiver<()>> {
        self.clear_rx.as_ref()
    }

    /// Report a non-fatal error without blocking. Logged even when no
    /// error channel exists. A report that finds the channel full is
    /// counted on the handle's [`lost_errors`](MonitorHandle::lost_errors).
    pub fn report_error(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        tracing::warn!(source = %self.name, %message, "loop reported error");
        let Some(tx) = &self.error_tx else {
            return false;
        };
        match tx.try_send(ErrorReport {
            source: self.name.clone(),
            message,
        }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.lost_errors.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// The orchestrator side of a [`MonitorControl`]
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    name: String,
    stats_rx: Receiver<StatsReport>,
    clear_tx: Sender<()>,
    error_rx: Receiver<ErrorReport>,
    lost_errors: Arc<AtomicU64>,
}

impl MonitorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the loop to reset its statistics. Never blocks; a request that
    /// is already pending absorbs this one.
    pub fn request_clear(&self) {
        let _ = self.clear_tx.try_send(());
    }

    /// Drain every snapshot pushed so far
    pub fn drain_stats(&self) -> Vec<StatsReport> {
        self.stats_rx.try_iter().collect()
    }

    /// Drain and keep only the newest snapshot
    pub fn latest_stats(&self) -> Option<StatsReport> {
        self.stats_rx.try_iter().last()
    }

    /// Wait up to `timeout` for the next snapshot
    pub fn recv_stats_timeout(&self, timeout: Duration) -> Option<StatsReport> {
        let deadline = Instant::now() + timeout;
        self.stats_rx.recv_deadline(deadline).ok()
    }

    /// Drain every error reported so far
    pub fn drain_errors(&self) -> Vec<ErrorReport> {
        self.error_rx.try_iter().collect()
    }

    /// Error reports dropped because the error channel was full
    pub fn lost_errors(&self) -> u64 {
        self.lost_errors.load(Ordering::Relaxed)
    }

    pub fn stats_receiver(&self) -> &Receiver<StatsReport> {
        &self.stats_rx
    }
}
