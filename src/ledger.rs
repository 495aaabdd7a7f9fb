use std::sync::Arc;

use crate::error::{LedgerError, Result};
use crate::hot_store::HotStore;
use crate::pricing::PricingCache;
use crate::sqlite_store::SqliteStore;
use crate::types::{
    BalanceSnapshot, Clock, DeductionOutcome, DeductionRequest, FinalizationOutcome,
    FinalizationRequest, ModelPricing, ReservationOutcome, ReservationRequest, SystemClock,
    CODE_ALREADY_FINALIZED,
};
use crate::writer::{WriteOp, WritePipeline, DEFAULT_QUEUE_DEPTH, DEFAULT_WORKERS};

/// The reservation ledger: the atomic balance engine behind every AI
/// request. Each public operation performs exactly one round trip to the
/// hot store; durable writes ride the async pipeline and never touch the
/// request path.
///
/// All methods are safe for unbounded concurrent use. Per-customer
/// ordering comes from the hot store's serialized script execution, not
/// from any lock held here.
pub struct Ledger {
    hot: Arc<dyn HotStore>,
    durable: SqliteStore,
    pricing: PricingCache,
    pipeline: WritePipeline,
    clock: Arc<dyn Clock>,
}

impl Ledger {
    /// Wires the ledger over already-constructed stores: verifies hot-store
    /// connectivity, warms the pricing cache (non-fatal if the catalog is
    /// unreadable), and starts the write workers.
    pub async fn open(hot: Arc<dyn HotStore>, durable: SqliteStore) -> Result<Self> {
        Self::open_with_clock(hot, durable, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(
        hot: Arc<dyn HotStore>,
        durable: SqliteStore,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        hot.ping().await?;

        let pricing = PricingCache::new();
        match durable.pricing_rows().await {
            Ok(rows) => {
                let count = pricing.load(rows);
                tracing::info!(count, "pricing cache loaded");
            }
            Err(err) => {
                tracing::warn!(error = %err, "pricing cache load failed, will load on demand");
            }
        }

        let pipeline = WritePipeline::start(durable.clone(), DEFAULT_QUEUE_DEPTH, DEFAULT_WORKERS);

        Ok(Self {
            hot,
            durable,
            pricing,
            pipeline,
            clock,
        })
    }

    pub fn hot_store(&self) -> Arc<dyn HotStore> {
        self.hot.clone()
    }

    pub fn durable_store(&self) -> SqliteStore {
        self.durable.clone()
    }

    /// Atomic pre-flight check and reservation. The first call of every
    /// request: admits it only if `balance - reserved` covers the asked-for
    /// reservation, so concurrent requests can never collectively overspend.
    pub async fn check_and_reserve(
        &self,
        request: ReservationRequest,
    ) -> Result<ReservationOutcome> {
        if request.customer_id.is_empty() {
            return Err(LedgerError::InvalidArgument("customer_id is required".into()));
        }
        if request.request_id.is_empty() {
            return Err(LedgerError::InvalidArgument("request_id is required".into()));
        }
        if request.reserved_grains <= 0 {
            return Err(LedgerError::InvalidArgument(
                "reserved_grains must be positive".into(),
            ));
        }
        if request.estimated_grains < 0 {
            return Err(LedgerError::InvalidArgument(
                "estimated_grains cannot be negative".into(),
            ));
        }

        let metadata_json =
            serde_json::to_string(&request.metadata).unwrap_or_else(|_| "{}".to_string());
        let now = self.clock.now_epoch_seconds();

        let reply = self
            .hot
            .check_and_reserve(
                &request.customer_id,
                &request.request_id,
                request.reserved_grains,
                request.estimated_grains,
                &metadata_json,
                now,
            )
            .await
            .map_err(|err| {
                tracing::error!(
                    customer_id = %request.customer_id,
                    request_id = %request.request_id,
                    error = %err,
                    "check_and_reserve script failed"
                );
                err
            })?;

        if reply.ok {
            tracing::info!(
                customer_id = %request.customer_id,
                request_id = %request.request_id,
                reserved_grains = request.reserved_grains,
                remaining_available = reply.amount,
                "reservation approved"
            );
            self.pipeline.enqueue(WriteOp::Preflight {
                now_ms: self.clock.now_epoch_millis(),
                request: request.clone(),
            });
        } else {
            tracing::info!(
                customer_id = %request.customer_id,
                request_id = %request.request_id,
                reserved_grains = request.reserved_grains,
                reason = %reply.code,
                current_balance = reply.amount,
                "reservation rejected"
            );
        }

        Ok(ReservationOutcome {
            approved: reply.ok,
            remaining_available: reply.amount,
            rejection_reason: reply.code,
            reserved_grains: request.reserved_grains,
        })
    }

    /// Streaming-time debit. A failed outcome is the kill switch: the
    /// caller must terminate the provider stream immediately.
    pub async fn deduct(&self, request: DeductionRequest) -> Result<DeductionOutcome> {
        if request.customer_id.is_empty() {
            return Err(LedgerError::InvalidArgument("customer_id is required".into()));
        }
        if request.request_id.is_empty() {
            return Err(LedgerError::InvalidArgument("request_id is required".into()));
        }
        if request.grain_amount <= 0 {
            return Err(LedgerError::InvalidArgument(
                "grain_amount must be positive".into(),
            ));
        }

        let reply = self
            .hot
            .deduct(
                &request.customer_id,
                &request.request_id,
                request.grain_amount,
                request.tokens_consumed,
                self.clock.now_epoch_seconds(),
            )
            .await
            .map_err(|err| {
                tracing::error!(
                    customer_id = %request.customer_id,
                    request_id = %request.request_id,
                    error = %err,
                    "deduct script failed"
                );
                err
            })?;

        if reply.ok {
            tracing::debug!(
                customer_id = %request.customer_id,
                request_id = %request.request_id,
                grain_amount = request.grain_amount,
                remaining_balance = reply.amount,
                "deduction applied"
            );
        } else {
            tracing::warn!(
                customer_id = %request.customer_id,
                request_id = %request.request_id,
                error_code = %reply.code,
                remaining_balance = reply.amount,
                "deduction failed, kill switch triggered"
            );
        }

        Ok(DeductionOutcome {
            success: reply.ok,
            remaining_balance: reply.amount,
            error_code: reply.code,
        })
    }

    /// Terminal reconciliation with the provider's authoritative cost.
    /// Idempotent: replays return success with zero refund and queue no
    /// durable write, so upstream retries after timeouts are safe.
    pub async fn finalize(&self, request: FinalizationRequest) -> Result<FinalizationOutcome> {
        if request.customer_id.is_empty() {
            return Err(LedgerError::InvalidArgument("customer_id is required".into()));
        }
        if request.request_id.is_empty() {
            return Err(LedgerError::InvalidArgument("request_id is required".into()));
        }
        if !request.status.is_terminal() {
            return Err(LedgerError::InvalidArgument(format!(
                "status {} is not terminal",
                request.status
            )));
        }
        if request.actual_cost_grains < 0 {
            return Err(LedgerError::InvalidArgument(
                "actual_cost_grains cannot be negative".into(),
            ));
        }

        let reply = self
            .hot
            .finalize(
                &request.customer_id,
                &request.request_id,
                request.actual_cost_grains,
                request.status.as_str(),
                self.clock.now_epoch_seconds(),
            )
            .await
            .map_err(|err| {
                tracing::error!(
                    customer_id = %request.customer_id,
                    request_id = %request.request_id,
                    error = %err,
                    "finalize script failed"
                );
                err
            })?;

        tracing::info!(
            customer_id = %request.customer_id,
            request_id = %request.request_id,
            status = %request.status,
            actual_cost = request.actual_cost_grains,
            refunded = reply.refunded,
            final_balance = reply.balance,
            "finalization completed"
        );

        if reply.ok && reply.code.is_empty() {
            self.pipeline.enqueue(WriteOp::Finalization {
                consumed_grains: reply.consumed,
                transaction_id: uuid::Uuid::new_v4().to_string(),
                now_ms: self.clock.now_epoch_millis(),
                request: request.clone(),
            });
        } else if reply.code == CODE_ALREADY_FINALIZED {
            tracing::debug!(
                request_id = %request.request_id,
                "finalization replayed, no state change"
            );
        }

        Ok(FinalizationOutcome {
            success: reply.ok,
            refunded_grains: reply.refunded,
            final_balance: reply.balance,
            error_code: if reply.ok { String::new() } else { reply.code },
        })
    }

    /// Read-only balance view; a single pipelined hot-store round trip.
    pub async fn balance(&self, customer_id: &str) -> Result<BalanceSnapshot> {
        if customer_id.is_empty() {
            return Err(LedgerError::InvalidArgument("customer_id is required".into()));
        }
        let (balance, reserved) = self.hot.balances(customer_id).await?;
        Ok(BalanceSnapshot {
            balance,
            reserved,
            available: balance - reserved,
        })
    }

    /// Pricing lookup: cache first, then the durable catalog; an unknown
    /// model is a hard error.
    pub async fn model_pricing(&self, model: &str, provider: &str) -> Result<ModelPricing> {
        if model.is_empty() || provider.is_empty() {
            return Err(LedgerError::InvalidArgument(
                "model and provider are required".into(),
            ));
        }
        if let Some(pricing) = self.pricing.get(model, provider) {
            return Ok(pricing);
        }

        let Some(pricing) = self.durable.pricing(model, provider).await? else {
            return Err(LedgerError::PricingNotFound {
                model: model.to_string(),
                provider: provider.to_string(),
            });
        };
        self.pricing.insert(pricing.clone());
        Ok(pricing)
    }

    /// Closes the write queue and drains the workers. Call during graceful
    /// shutdown; pending durable writes complete before this returns.
    pub async fn close(self) {
        tracing::info!("shutting down ledger");
        self.pipeline.close().await;
        tracing::info!("ledger shutdown complete");
    }
}
