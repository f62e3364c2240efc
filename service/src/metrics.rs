//! Transfer and account counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Service metrics.
#[derive(Default)]
pub struct ServiceMetrics {
    /// Transfers received.
    pub transfers_attempted: AtomicU64,
    /// Transfers committed.
    pub transfers_committed: AtomicU64,
    /// Transfers that reached the engine and failed there.
    pub transfers_failed: AtomicU64,
    /// Transfers refused before reaching the engine.
    pub transfers_rejected: AtomicU64,
    /// Transfers that ran out of time.
    pub transfers_timed_out: AtomicU64,
    /// Transfers in flight.
    pub transfers_active: AtomicU64,
    /// Minor units moved by committed transfers.
    pub volume_committed: AtomicU64,
    pub users_created: AtomicU64,
    pub accounts_created: AtomicU64,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a transfer and mark it in flight until the guard drops.
    #[must_use = "the transfer stops counting as active when the guard drops"]
    pub fn transfer_attempted(&self) -> ActiveTransfer<'_> {
        self.transfers_attempted.fetch_add(1, Ordering::Relaxed);
        self.transfers_active.fetch_add(1, Ordering::Relaxed);
        ActiveTransfer { metrics: self }
    }

    pub fn transfer_committed(&self, amount: i64) {
        self.transfers_committed.fetch_add(1, Ordering::Relaxed);
        self.volume_committed
            .fetch_add(amount.unsigned_abs(), Ordering::Relaxed);
    }

    pub fn transfer_failed(&self) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_rejected(&self) {
        self.transfers_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// A timed out transfer also counts as failed.
    pub fn transfer_timed_out(&self) {
        self.transfers_timed_out.fetch_add(1, Ordering::Relaxed);
        self.transfer_failed();
    }

    pub fn user_created(&self) {
        self.users_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn account_created(&self) {
        self.accounts_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transfers_attempted: self.transfers_attempted.load(Ordering::Relaxed),
            transfers_committed: self.transfers_committed.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            transfers_rejected: self.transfers_rejected.load(Ordering::Relaxed),
            transfers_timed_out: self.transfers_timed_out.load(Ordering::Relaxed),
            transfers_active: self.transfers_active.load(Ordering::Relaxed),
            volume_committed: self.volume_committed.load(Ordering::Relaxed),
            users_created: self.users_created.load(Ordering::Relaxed),
            accounts_created: self.accounts_created.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let series = [
            ("bank_transfers_attempted", "counter", snapshot.transfers_attempted),
            ("bank_transfers_committed", "counter", snapshot.transfers_committed),
            ("bank_transfers_failed", "counter", snapshot.transfers_failed),
            ("bank_transfers_rejected", "counter", snapshot.transfers_rejected),
            ("bank_transfers_timed_out", "counter", snapshot.transfers_timed_out),
            ("bank_transfers_active", "gauge", snapshot.transfers_active),
            ("bank_volume_committed", "counter", snapshot.volume_committed),
            ("bank_users_created", "counter", snapshot.users_created),
            ("bank_accounts_created", "counter", snapshot.accounts_created),
        ];

        let mut out = String::new();
        for (name, kind, value) in series {
            out.push_str(&format!("# TYPE {name} {kind}\n{name} {value}\n"));
        }
        out
    }
}

/// Keeps one transfer in the active gauge. Released on drop, so a cancelled
/// transfer leaves the gauge too.
pub struct ActiveTransfer<'a> {
    metrics: &'a ServiceMetrics,
}

impl Drop for ActiveTransfer<'_> {
    fn drop(&mut self) {
        self.metrics.transfers_active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub transfers_attempted: u64,
    pub transfers_committed: u64,
    pub transfers_failed: u64,
    pub transfers_rejected: u64,
    pub transfers_timed_out: u64,
    pub transfers_active: u64,
    pub volume_committed: u64,
    pub users_created: u64,
    pub accounts_created: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<ServiceMetrics>;
