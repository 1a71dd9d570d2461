use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::stats::ExportStats;
use super::{DropError, QueuedBatch};
use crate::backoff::ExponentialBackoff;
use crate::config::{Compression, RetryConfig};
use crate::convert::convert;
use crate::delivery::{Deliver, DeliveryError};
use crate::model::MetricBatch;
use crate::record::EncodedPayload;

/// Everything a worker needs; shared by all workers of a pipeline.
pub(super) struct WorkerContext<D> {
    pub sender: Arc<D>,
    pub queue: Arc<Mutex<mpsc::Receiver<QueuedBatch>>>,
    pub stats: Arc<ExportStats>,
    /// Set when shutdown starts: finish what is queued, then exit.
    pub closing: CancellationToken,
    /// Set when the drain deadline passes: stop immediately.
    pub abort: CancellationToken,
    pub retry: RetryConfig,
    pub timeout: Duration,
    pub compression: Compression,
}

/// Lifecycle of one batch inside a worker.
///
/// ```text
/// Converting ─► Sending ─► Acked
///     │            │ ▲
///     │            ▼ │
///     │         Retrying
///     │            │
///     └────────────┴─────► Dropped
/// ```
#[derive(Debug)]
enum BatchState {
    Converting(MetricBatch),
    Sending {
        payload: EncodedPayload,
        attempt: u32,
    },
    Retrying {
        payload: EncodedPayload,
        attempt: u32,
        delay: Duration,
    },
    Acked {
        records: usize,
        attempts: u32,
    },
    Dropped {
        records: usize,
        error: DropError,
    },
}

impl BatchState {
    fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Acked { .. } | BatchState::Dropped { .. })
    }
}

/// Pull batches until the queue is closed and empty, or the pipeline aborts.
pub(super) async fn run<D: Deliver>(ctx: Arc<WorkerContext<D>>) {
    while let Some(item) = next_batch(&ctx).await {
        BatchRun::new(&ctx, item.id, item.cancel)
            .drive(BatchState::Converting(item.batch))
            .await;
    }
}

async fn next_batch<D>(ctx: &WorkerContext<D>) -> Option<QueuedBatch> {
    let mut queue = ctx.queue.lock().await;
    tokio::select! {
        biased;
        _ = ctx.abort.cancelled() => None,
        item = queue.recv() => item,
        // Once closing, drain without waiting for new arrivals.
        _ = ctx.closing.cancelled() => queue.try_recv().ok(),
    }
}

struct BatchRun<'a, D> {
    ctx: &'a WorkerContext<D>,
    id: u64,
    cancel: CancellationToken,
    backoff: Option<ExponentialBackoff>,
}

impl<'a, D: Deliver> BatchRun<'a, D> {
    fn new(ctx: &'a WorkerContext<D>, id: u64, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            id,
            cancel,
            backoff: None,
        }
    }

    async fn drive(mut self, mut state: BatchState) {
        while !state.is_terminal() {
            state = self.step(state).await;
        }
        self.finish(state);
    }

    async fn step(&mut self, state: BatchState) -> BatchState {
        match state {
            BatchState::Converting(batch) => self.convert(batch),
            BatchState::Sending { payload, attempt } => self.send(payload, attempt).await,
            BatchState::Retrying {
                payload,
                attempt,
                delay,
            } => self.wait(payload, attempt, delay).await,
            terminal => terminal,
        }
    }

    fn convert(&mut self, batch: MetricBatch) -> BatchState {
        let (payload, warnings) = convert(&batch);
        if !warnings.is_empty() {
            debug!(batch = self.id, warnings = warnings.len(), "conversion reported warnings");
        }
        if payload.is_empty() {
            debug!(batch = self.id, "nothing to export");
            return BatchState::Acked {
                records: 0,
                attempts: 0,
            };
        }

        match payload.encode(self.ctx.compression) {
            Ok(payload) => {
                self.backoff = Some(ExponentialBackoff::new(&self.ctx.retry));
                BatchState::Sending {
                    payload,
                    attempt: 1,
                }
            }
            Err(e) => BatchState::Dropped {
                records: payload.len(),
                error: e.into(),
            },
        }
    }

    async fn send(&mut self, payload: EncodedPayload, attempt: u32) -> BatchState {
        let timeout = self.ctx.timeout;
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return self.interrupted(&payload, DropError::Cancelled { attempts: attempt - 1 });
            }
            _ = self.ctx.abort.cancelled() => {
                return self.interrupted(&payload, DropError::ShuttingDown { attempts: attempt - 1 });
            }
            result = tokio::time::timeout(timeout, self.ctx.sender.send(&payload)) => {
                result.unwrap_or(Err(DeliveryError::Timeout(timeout)))
            }
        };

        let error = match result {
            Ok(()) => {
                return BatchState::Acked {
                    records: payload.record_count,
                    attempts: attempt,
                };
            }
            Err(error) => error,
        };

        warn!(batch = self.id, attempt, error = %error, "export attempt failed");
        self.ctx.stats.record_send_failure(&error);

        match self.next_delay(&error) {
            Some(delay) => BatchState::Retrying {
                payload,
                attempt,
                delay,
            },
            None => BatchState::Dropped {
                records: payload.record_count,
                error: DropError::RetriesExhausted {
                    attempts: attempt,
                    last: error,
                },
            },
        }
    }

    fn next_delay(&mut self, error: &DeliveryError) -> Option<Duration> {
        if !self.ctx.retry.enabled {
            return None;
        }
        let backoff = self
            .backoff
            .get_or_insert_with(|| ExponentialBackoff::new(&self.ctx.retry));
        match error.retry_after() {
            Some(delay) => backoff.next_backoff_with(delay),
            None => backoff.next_backoff(),
        }
    }

    async fn wait(&mut self, payload: EncodedPayload, attempt: u32, delay: Duration) -> BatchState {
        debug!(batch = self.id, attempt, ?delay, "retrying after backoff");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.interrupted(&payload, DropError::Cancelled { attempts: attempt })
            }
            _ = self.ctx.abort.cancelled() => {
                self.interrupted(&payload, DropError::ShuttingDown { attempts: attempt })
            }
            _ = tokio::time::sleep(delay) => BatchState::Sending {
                payload,
                attempt: attempt + 1,
            },
        }
    }

    fn interrupted(&self, payload: &EncodedPayload, error: DropError) -> BatchState {
        BatchState::Dropped {
            records: payload.record_count,
            error,
        }
    }

    fn finish(self, state: BatchState) {
        match state {
            BatchState::Acked { records, attempts } => {
                self.ctx.stats.record_acked(records);
                debug!(batch = self.id, records, attempts, "successfully sent metrics");
            }
            BatchState::Dropped { records, error } => {
                self.ctx.stats.record_dropped(records, &error);
                error!(batch = self.id, records, error = %error, "dropping batch");
            }
            other => unreachable!("finish called on non-terminal state {other:?}"),
        }
    }
}
