use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::sqlite_store::SqliteStore;
use crate::types::{FinalizationRequest, ReservationRequest};

/// Queue depth. Sized for burst traffic; overflow is dropped, not blocked
/// on, so kill-switch latency stays bounded and the syncer repairs drift.
pub const DEFAULT_QUEUE_DEPTH: usize = 10_000;
pub const DEFAULT_WORKERS: usize = 10;

const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF: Duration = Duration::from_millis(100);

/// A durable write taken off the hot path.
#[derive(Clone, Debug)]
pub enum WriteOp {
    Preflight {
        request: ReservationRequest,
        now_ms: i64,
    },
    Finalization {
        request: FinalizationRequest,
        consumed_grains: i64,
        /// Minted once at enqueue time so worker retries stay idempotent.
        transaction_id: String,
        now_ms: i64,
    },
}

impl WriteOp {
    fn kind(&self) -> &'static str {
        match self {
            WriteOp::Preflight { .. } => "preflight",
            WriteOp::Finalization { .. } => "finalization",
        }
    }
}

/// Bounded queue feeding a fixed worker pool. Dropping the sender closes
/// the queue; `close` then waits for the workers to drain what is left.
pub struct WritePipeline {
    tx: mpsc::Sender<WriteOp>,
    workers: Vec<JoinHandle<()>>,
}

impl WritePipeline {
    pub fn start(store: SqliteStore, queue_depth: usize, worker_count: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..worker_count.max(1))
            .map(|worker_id| {
                let store = store.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    tracing::debug!(worker_id, "write worker started");
                    loop {
                        let op = {
                            let mut guard = rx.lock().await;
                            guard.recv().await
                        };
                        let Some(op) = op else {
                            break;
                        };
                        apply_with_retries(&store, op, worker_id).await;
                    }
                    tracing::debug!(worker_id, "write worker stopped");
                })
            })
            .collect();

        Self { tx, workers }
    }

    /// Never blocks the caller. A full queue drops the op with a warning;
    /// eventual consistency is restored by the sync service.
    pub fn enqueue(&self, op: WriteOp) {
        let kind = op.kind();
        match self.tx.try_send(op) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(kind, "write queue full, dropping durable write");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(kind, "write queue closed, dropping durable write");
            }
        }
    }

    /// Closes the queue and waits for the workers to drain it.
    pub async fn close(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn apply_with_retries(store: &SqliteStore, op: WriteOp, worker_id: usize) {
    let mut backoff = BASE_BACKOFF;
    for attempt in 1..=MAX_ATTEMPTS {
        match apply(store, &op).await {
            Ok(()) => return,
            Err(err) if attempt < MAX_ATTEMPTS => {
                tracing::warn!(
                    worker_id,
                    attempt,
                    kind = op.kind(),
                    error = %err,
                    "durable write failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(err) => {
                tracing::error!(
                    worker_id,
                    kind = op.kind(),
                    error = %err,
                    "durable write failed after all retries"
                );
            }
        }
    }
}

async fn apply(store: &SqliteStore, op: &WriteOp) -> Result<(), crate::sqlite_store::SqliteStoreError> {
    match op {
        WriteOp::Preflight { request, now_ms } => {
            store
                .insert_preflight(
                    &request.request_id,
                    &request.customer_id,
                    &request.tenant_id,
                    request.model.as_deref(),
                    request.provider.as_deref(),
                    request.estimated_grains,
                    request.reserved_grains,
                    *now_ms,
                )
                .await
        }
        WriteOp::Finalization {
            request,
            consumed_grains,
            transaction_id,
            now_ms,
        } => {
            store
                .apply_finalization(
                    &request.request_id,
                    &request.customer_id,
                    transaction_id,
                    request.status,
                    request.actual_cost_grains,
                    *consumed_grains,
                    request.prompt_tokens,
                    request.completion_tokens,
                    &request.model,
                    request.kill_reason.as_deref(),
                    *now_ms,
                )
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BufferStrategy, CustomerRecord, RequestStatus};

    fn customer(customer_id: &str, balance: i64) -> CustomerRecord {
        CustomerRecord {
            customer_id: customer_id.to_string(),
            tenant_id: "tenant-1".to_string(),
            balance_grains: balance,
            lifetime_spent_grains: 0,
            buffer_strategy: BufferStrategy::Conservative,
            created_at_ms: 1_000,
            updated_at_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn pipeline_drains_queued_ops_on_close() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("granary.sqlite"));
        store.init().await.expect("init");
        store
            .insert_customer(customer("cus_1", 100_000))
            .await
            .expect("customer");

        // One worker so the preflight lands before the finalization.
        let pipeline = WritePipeline::start(store.clone(), 16, 1);
        pipeline.enqueue(WriteOp::Preflight {
            request: ReservationRequest {
                customer_id: "cus_1".to_string(),
                request_id: "req_1".to_string(),
                reserved_grains: 60_000,
                estimated_grains: 50_000,
                tenant_id: "tenant-1".to_string(),
                ..Default::default()
            },
            now_ms: 2_000,
        });
        pipeline.enqueue(WriteOp::Finalization {
            request: FinalizationRequest {
                customer_id: "cus_1".to_string(),
                request_id: "req_1".to_string(),
                status: RequestStatus::Completed,
                actual_cost_grains: 55_000,
                prompt_tokens: 1_200,
                completion_tokens: 3_400,
                model: "helix-1".to_string(),
                kill_reason: None,
            },
            consumed_grains: 60_000,
            transaction_id: "tx_1".to_string(),
            now_ms: 3_000,
        });
        pipeline.close().await;

        let row = store.request("req_1").await.expect("request").expect("row");
        assert_eq!(row.status, RequestStatus::Completed);
        assert_eq!(
            store.customer_balance("cus_1").await.expect("balance"),
            45_000
        );
    }

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("granary.sqlite"));
        store.init().await.expect("init");

        // Queue depth 1 and zero consumers started yet: floods must return
        // immediately even though most writes are discarded.
        let pipeline = WritePipeline::start(store.clone(), 1, 1);
        for i in 0..64 {
            pipeline.enqueue(WriteOp::Preflight {
                request: ReservationRequest {
                    customer_id: "cus_1".to_string(),
                    request_id: format!("req_{i}"),
                    reserved_grains: 1,
                    estimated_grains: 1,
                    tenant_id: "tenant-1".to_string(),
                    ..Default::default()
                },
                now_ms: 0,
            });
        }
        pipeline.close().await;
    }
}
