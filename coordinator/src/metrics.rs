//! Metrics collection for coordinator monitoring.
//!
//! Counters are owned by the coordinator and shared with the termination
//! driver and recovery manager, so callback counts are observable per
//! coordinator instance rather than process-wide.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lra_common::CallbackKind;
use serde::Serialize;

/// Coordinator metrics.
pub struct Metrics {
    /// Total LRAs started.
    pub lras_started: AtomicU64,
    /// LRAs closed by a client.
    pub lras_closed: AtomicU64,
    /// LRAs cancelled by a client.
    pub lras_cancelled: AtomicU64,
    /// LRAs cancelled because a deadline or participant time limit elapsed.
    pub lras_timed_out: AtomicU64,
    /// LRAs currently active.
    pub lras_active: AtomicU64,
    /// Finished LRAs removed after their retention window.
    pub lras_purged: AtomicU64,
    /// Participants enlisted.
    pub participants_enlisted: AtomicU64,
    /// Participants that left before termination.
    pub participants_left: AtomicU64,
    /// Complete callbacks sent.
    pub complete_calls: AtomicU64,
    /// Compensate callbacks sent.
    pub compensate_calls: AtomicU64,
    /// Status polls sent.
    pub status_calls: AtomicU64,
    /// Forget callbacks sent.
    pub forget_calls: AtomicU64,
    /// Callbacks that failed or timed out.
    pub callback_failures: AtomicU64,
    /// Recovery scans run.
    pub recovery_passes: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            lras_started: AtomicU64::new(0),
            lras_closed: AtomicU64::new(0),
            lras_cancelled: AtomicU64::new(0),
            lras_timed_out: AtomicU64::new(0),
            lras_active: AtomicU64::new(0),
            lras_purged: AtomicU64::new(0),
            participants_enlisted: AtomicU64::new(0),
            participants_left: AtomicU64::new(0),
            complete_calls: AtomicU64::new(0),
            compensate_calls: AtomicU64::new(0),
            status_calls: AtomicU64::new(0),
            forget_calls: AtomicU64::new(0),
            callback_failures: AtomicU64::new(0),
            recovery_passes: AtomicU64::new(0),
        }
    }

    /// Record a new LRA.
    pub fn lra_started(&self) {
        self.lras_started.fetch_add(1, Ordering::Relaxed);
        self.lras_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an active LRA reloaded from the store.
    pub fn lra_restored(&self) {
        self.lras_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a client close.
    pub fn lra_closed(&self) {
        self.lras_closed.fetch_add(1, Ordering::Relaxed);
        self.lras_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a client cancel.
    pub fn lra_cancelled(&self) {
        self.lras_cancelled.fetch_add(1, Ordering::Relaxed);
        self.lras_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a cancel of a nested LRA that had already closed.
    pub fn closed_lra_cancelled(&self) {
        self.lras_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a deadline cancellation.
    pub fn lra_timed_out(&self) {
        self.lras_timed_out.fetch_add(1, Ordering::Relaxed);
        self.lras_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a purge.
    pub fn lra_purged(&self) {
        self.lras_purged.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an enlistment.
    pub fn participant_enlisted(&self) {
        self.participants_enlisted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a participant leaving.
    pub fn participant_left(&self) {
        self.participants_left.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a callback about to be sent.
    pub fn callback_sent(&self, kind: CallbackKind) {
        let counter = match kind {
            CallbackKind::Complete => &self.complete_calls,
            CallbackKind::Compensate => &self.compensate_calls,
            CallbackKind::Status => &self.status_calls,
            CallbackKind::Forget => &self.forget_calls,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed callback.
    pub fn callback_failed(&self) {
        self.callback_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a recovery scan.
    pub fn recovery_pass(&self) {
        self.recovery_passes.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            lras_started: self.lras_started.load(Ordering::Relaxed),
            lras_closed: self.lras_closed.load(Ordering::Relaxed),
            lras_cancelled: self.lras_cancelled.load(Ordering::Relaxed),
            lras_timed_out: self.lras_timed_out.load(Ordering::Relaxed),
            lras_active: self.lras_active.load(Ordering::Relaxed),
            lras_purged: self.lras_purged.load(Ordering::Relaxed),
            participants_enlisted: self.participants_enlisted.load(Ordering::Relaxed),
            participants_left: self.participants_left.load(Ordering::Relaxed),
            complete_calls: self.complete_calls.load(Ordering::Relaxed),
            compensate_calls: self.compensate_calls.load(Ordering::Relaxed),
            status_calls: self.status_calls.load(Ordering::Relaxed),
            forget_calls: self.forget_calls.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
            recovery_passes: self.recovery_passes.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            r#"# HELP lra_started_total Total number of LRAs started
# TYPE lra_started_total counter
lra_started_total {}

# HELP lra_closed_total LRAs closed by clients
# TYPE lra_closed_total counter
lra_closed_total {}

# HELP lra_cancelled_total LRAs cancelled by clients
# TYPE lra_cancelled_total counter
lra_cancelled_total {}

# HELP lra_timed_out_total LRAs cancelled by an elapsed time limit
# TYPE lra_timed_out_total counter
lra_timed_out_total {}

# HELP lra_active Current active LRAs
# TYPE lra_active gauge
lra_active {}

# HELP lra_purged_total Finished LRAs purged after retention
# TYPE lra_purged_total counter
lra_purged_total {}

# HELP lra_participants_enlisted_total Participants enlisted
# TYPE lra_participants_enlisted_total counter
lra_participants_enlisted_total {}

# HELP lra_participants_left_total Participants that left
# TYPE lra_participants_left_total counter
lra_participants_left_total {}

# HELP lra_complete_calls_total Complete callbacks sent
# TYPE lra_complete_calls_total counter
lra_complete_calls_total {}

# HELP lra_compensate_calls_total Compensate callbacks sent
# TYPE lra_compensate_calls_total counter
lra_compensate_calls_total {}

# HELP lra_status_calls_total Status polls sent
# TYPE lra_status_calls_total counter
lra_status_calls_total {}

# HELP lra_forget_calls_total Forget callbacks sent
# TYPE lra_forget_calls_total counter
lra_forget_calls_total {}

# HELP lra_callback_failures_total Failed participant callbacks
# TYPE lra_callback_failures_total counter
lra_callback_failures_total {}

# HELP lra_recovery_passes_total Recovery scans run
# TYPE lra_recovery_passes_total counter
lra_recovery_passes_total {}
"#,
            snapshot.lras_started,
            snapshot.lras_closed,
            snapshot.lras_cancelled,
            snapshot.lras_timed_out,
            snapshot.lras_active,
            snapshot.lras_purged,
            snapshot.participants_enlisted,
            snapshot.participants_left,
            snapshot.complete_calls,
            snapshot.compensate_calls,
            snapshot.status_calls,
            snapshot.forget_calls,
            snapshot.callback_failures,
            snapshot.recovery_passes,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub lras_started: u64,
    pub lras_closed: u64,
    pub lras_cancelled: u64,
    pub lras_timed_out: u64,
    pub lras_active: u64,
    pub lras_purged: u64,
    pub participants_enlisted: u64,
    pub participants_left: u64,
    pub complete_calls: u64,
    pub compensate_calls: u64,
    pub status_calls: u64,
    pub forget_calls: u64,
    pub callback_failures: u64,
    pub recovery_passes: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;
