use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the submitter and all workers.
///
/// Every batch ends up in exactly one of `batches_acked` or
/// `batches_dropped`; rejected submissions never enter the queue.
#[derive(Debug, Default)]
pub struct ExportStats {
    batches_submitted: AtomicU64,
    batches_rejected: AtomicU64,
    batches_acked: AtomicU64,
    batches_dropped: AtomicU64,
    records_sent: AtomicU64,
    /// Records for converted batches, data points for batches dropped before
    /// conversion.
    records_dropped: AtomicU64,
    send_failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub batches_submitted: u64,
    pub batches_rejected: u64,
    pub batches_acked: u64,
    pub batches_dropped: u64,
    pub records_sent: u64,
    pub records_dropped: u64,
    pub send_failures: u64,
    pub last_error: Option<String>,
}

impl ExportStats {
    pub(crate) fn record_submitted(&self) {
        self.batches_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.batches_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acked(&self, records: usize) {
        self.batches_acked.fetch_add(1, Ordering::Relaxed);
        self.records_sent
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_send_failure(&self, error: &dyn std::fmt::Display) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
        self.set_last_error(error);
    }

    pub(crate) fn record_dropped(&self, records: usize, error: &dyn std::fmt::Display) {
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
        self.records_dropped
            .fetch_add(records as u64, Ordering::Relaxed);
        self.set_last_error(error);
    }

    fn set_last_error(&self, error: &dyn std::fmt::Display) {
        *self.last_error.lock().unwrap() = Some(error.to_string());
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches_submitted: self.batches_submitted.load(Ordering::Relaxed),
            batches_rejected: self.batches_rejected.load(Ordering::Relaxed),
            batches_acked: self.batches_acked.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            records_sent: self.records_sent.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            last_error: self.last_error.lock().unwrap().clone(),
        }
    }
}
