use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::hot_store::HotStore;
use crate::sqlite_store::SqliteStore;
use crate::types::{Clock, SystemClock};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(300);
/// Incremental sync looks this far back for updated customers.
const DRIFT_WINDOW_SECS: i64 = 3600;
const BOOTSTRAP_BATCH: usize = 1000;

/// Keeps the hot projection in lockstep with the durable store of record.
/// The durable side always wins: any disagreement is repaired by
/// overwriting the hot balance. The `reserved` counters are in-flight state
/// owned by the ledger and are only written at bootstrap.
pub struct Syncer {
    hot: Arc<dyn HotStore>,
    durable: SqliteStore,
    clock: Arc<dyn Clock>,
}

impl Syncer {
    pub fn new(hot: Arc<dyn HotStore>, durable: SqliteStore) -> Self {
        Self {
            hot,
            durable,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Full bootstrap: every customer's balance is loaded into the hot
    /// store in pipelined batches and its reserved counter reset to zero.
    /// Must complete before the process accepts requests; with an empty hot
    /// store every balance check would reject.
    pub async fn initialize_hot_store(&self) -> Result<usize> {
        let rows = self.durable.customer_balances().await?;
        let total = rows.len();
        for batch in rows.chunks(BOOTSTRAP_BATCH) {
            self.hot.bulk_set_balances(batch, true).await?;
        }
        tracing::info!(customer_count = total, "hot store initialized from durable store");
        Ok(total)
    }

    /// Loads `apikey:{sha256}` -> tenant mappings for active users.
    pub async fn sync_api_keys(&self) -> Result<usize> {
        let entries = self.durable.active_api_key_hashes().await?;
        let count = entries.len();
        self.hot.set_api_keys(&entries).await?;
        tracing::info!(key_count = count, "api keys synced to hot store");
        Ok(count)
    }

    /// Incremental drift correction: overwrites hot balances for customers
    /// whose durable row changed within the window. Catches payment
    /// webhooks, support adjustments, and admin corrections.
    pub async fn sync_recently_updated(&self) -> Result<usize> {
        let since_ms = self.clock.now_epoch_millis() - DRIFT_WINDOW_SECS * 1000;
        let rows = self.durable.customers_updated_since(since_ms).await?;
        let count = rows.len();
        if count > 0 {
            for batch in rows.chunks(BOOTSTRAP_BATCH) {
                self.hot.bulk_set_balances(batch, false).await?;
            }
        }
        tracing::debug!(synced_customers = count, "incremental sync complete");
        Ok(count)
    }

    /// On-demand repair for one customer, used when an integrity flag
    /// appears on a request.
    pub async fn sync_customer(&self, customer_id: &str) -> Result<()> {
        let balance = self.durable.customer_balance(customer_id).await?;
        self.hot.set_balance(customer_id, balance).await?;
        tracing::info!(customer_id, balance, "customer balance synced");
        Ok(())
    }

    /// Samples customers uniformly, compares hot and durable balances,
    /// repairs every mismatch, and returns the discrepancy count.
    pub async fn verify_integrity(&self, sample_size: usize) -> Result<usize> {
        let sample = self.durable.sample_customers(sample_size).await?;
        let mut discrepancies = 0usize;

        for (customer_id, durable_balance) in sample {
            let hot_balance = self.hot.get_balance(&customer_id).await?;
            match hot_balance {
                None => {
                    tracing::warn!(customer_id = %customer_id, "customer missing in hot store");
                    discrepancies += 1;
                }
                Some(hot_balance) if hot_balance != durable_balance => {
                    tracing::warn!(
                        customer_id = %customer_id,
                        hot_balance,
                        durable_balance,
                        difference = hot_balance - durable_balance,
                        "balance mismatch detected"
                    );
                    discrepancies += 1;
                }
                Some(_) => continue,
            }
            if let Err(err) = self.sync_customer(&customer_id).await {
                tracing::error!(customer_id = %customer_id, error = %err, "repair failed");
            }
        }

        Ok(discrepancies)
    }

    /// Spawns the background drift-correction loop. A zero interval falls
    /// back to the default.
    pub fn start_periodic(self: Arc<Self>, interval: Duration) -> PeriodicSync {
        let interval = if interval.is_zero() {
            DEFAULT_SYNC_INTERVAL
        } else {
            interval
        };
        tracing::info!(interval_secs = interval.as_secs(), "starting periodic sync");

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick; the bootstrap already ran.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.sync_recently_updated().await {
                            tracing::error!(error = %err, "periodic sync failed");
                        }
                    }
                    _ = stop_rx.changed() => {
                        tracing::info!("periodic sync stopped");
                        break;
                    }
                }
            }
        });

        PeriodicSync {
            stop: stop_tx,
            handle,
        }
    }
}

/// Handle to the background sync task; dropping it leaves the task
/// running, `stop` shuts it down and waits.
pub struct PeriodicSync {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicSync {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}
