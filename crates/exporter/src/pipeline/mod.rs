//! Bounded queue, worker pool and per-batch retry discipline.
//!
//! `submit` hands a batch to the queue; one of `num_consumers` workers picks it
//! up, converts and encodes it once, and sends it until it is acked or dropped.
//! Every submitted batch ends in exactly one of those two outcomes, both
//! recorded in [`ExportStats`].

mod stats;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{Compression, Config, OverflowPolicy, QueueConfig, RetryConfig};
use crate::convert::ConversionError;
use crate::delivery::{Deliver, DeliveryError};
use crate::model::MetricBatch;

pub use stats::{ExportStats, StatsSnapshot};

use worker::WorkerContext;

/// The subset of [`Config`] the pipeline cares about.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    /// Per-attempt deadline for `Deliver::send`.
    pub timeout: Duration,
    pub compression: Compression,
}

impl From<&Config> for PipelineConfig {
    fn from(config: &Config) -> Self {
        Self {
            queue: config.queue.clone(),
            retry: config.retry.clone(),
            timeout: config.export_timeout,
            compression: config.compression,
        }
    }
}

/// Why `submit` refused a batch. The batch is not queued in any of these cases.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("export queue is full")]
    QueueFull,

    #[error("pipeline is shut down")]
    Closed,

    #[error("submission cancelled while waiting for queue capacity")]
    Cancelled,
}

/// Why a queued batch was given up on.
#[derive(Debug, Error)]
pub enum DropError {
    #[error("encoding failed: {0}")]
    Conversion(#[from] ConversionError),

    #[error("giving up after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: DeliveryError },

    #[error("cancelled by caller after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    #[error("pipeline shut down after {attempts} attempt(s)")]
    ShuttingDown { attempts: u32 },
}

struct QueuedBatch {
    id: u64,
    batch: MetricBatch,
    cancel: CancellationToken,
}

impl std::fmt::Debug for QueuedBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedBatch").field("id", &self.id).finish()
    }
}

pub struct Pipeline {
    tx: mpsc::Sender<QueuedBatch>,
    queue: Arc<Mutex<mpsc::Receiver<QueuedBatch>>>,
    stats: Arc<ExportStats>,
    tracker: TaskTracker,
    closing: CancellationToken,
    abort: CancellationToken,
    overflow: OverflowPolicy,
    next_id: AtomicU64,
}

impl Pipeline {
    /// Spawn the worker pool. Must be called from within a tokio runtime.
    pub fn start<D: Deliver>(sender: Arc<D>, config: PipelineConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue.queue_size.max(1));
        let queue = Arc::new(Mutex::new(rx));
        let stats = Arc::new(ExportStats::default());
        let closing = CancellationToken::new();
        let abort = CancellationToken::new();

        let ctx = Arc::new(WorkerContext {
            sender,
            queue: Arc::clone(&queue),
            stats: Arc::clone(&stats),
            closing: closing.clone(),
            abort: abort.clone(),
            retry: config.retry,
            timeout: config.timeout,
            compression: config.compression,
        });

        let tracker = TaskTracker::new();
        let workers = config.queue.num_consumers.max(1);
        for _ in 0..workers {
            tracker.spawn(worker::run(Arc::clone(&ctx)));
        }
        debug!(
            workers,
            queue_size = config.queue.queue_size,
            "export pipeline started"
        );

        Self {
            tx,
            queue,
            stats,
            tracker,
            closing,
            abort,
            overflow: config.queue.overflow,
            next_id: AtomicU64::new(1),
        }
    }

    /// Queue a batch for export. Returns once the batch is queued, not once
    /// it is delivered. Cancelling `cancel` later drops the batch wherever it
    /// is in its lifecycle.
    pub async fn submit(
        &self,
        batch: MetricBatch,
        cancel: &CancellationToken,
    ) -> Result<(), SubmitError> {
        if self.closing.is_cancelled() {
            return Err(SubmitError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let item = QueuedBatch {
            id,
            batch,
            cancel: cancel.clone(),
        };

        let result = match self.overflow {
            OverflowPolicy::Reject => self.tx.try_send(item).map_err(|e| match e {
                TrySendError::Full(_) => SubmitError::QueueFull,
                TrySendError::Closed(_) => SubmitError::Closed,
            }),
            OverflowPolicy::Block => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(SubmitError::Cancelled),
                    _ = self.closing.cancelled() => Err(SubmitError::Closed),
                    sent = self.tx.send(item) => sent.map_err(|_| SubmitError::Closed),
                }
            }
        };

        match &result {
            Ok(()) => {
                self.stats.record_submitted();
                debug!(batch = id, "batch queued");
            }
            Err(SubmitError::QueueFull) => {
                self.stats.record_rejected();
                warn!(batch = id, "export queue is full, rejecting batch");
            }
            Err(e) => {
                self.stats.record_rejected();
                debug!(batch = id, error = %e, "batch not queued");
            }
        }
        result
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop accepting batches, drain the queue for up to `drain_timeout`, then
    /// abort whatever is still in flight and discard what is still queued.
    pub async fn shutdown(&self, drain_timeout: Duration) -> StatsSnapshot {
        self.closing.cancel();
        self.tracker.close();

        if tokio::time::timeout(drain_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(?drain_timeout, "drain timeout reached, aborting in-flight exports");
            self.abort.cancel();
            self.tracker.wait().await;
        }

        let mut queue = self.queue.lock().await;
        queue.close();
        let mut discarded = 0;
        while let Ok(item) = queue.try_recv() {
            discarded += 1;
            self.stats.record_dropped(
                item.batch.data_point_count(),
                &DropError::ShuttingDown { attempts: 0 },
            );
        }
        if discarded > 0 {
            warn!(discarded, "discarded queued batches at shutdown");
        }

        let snapshot = self.stats.snapshot();
        info!(
            acked = snapshot.batches_acked,
            dropped = snapshot.batches_dropped,
            "export pipeline stopped"
        );
        snapshot
    }
}
