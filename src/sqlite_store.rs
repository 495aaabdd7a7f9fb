use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::OptionalExtension;
use thiserror::Error;

use crate::types::{
    BufferStrategy, CustomerRecord, IntegrityReport, ModelPricing, RequestRow, RequestStatus,
    TransactionKind, TransactionRecord,
};

/// Durable store of record: authoritative customer balances, an append-only
/// transaction journal, request history, model pricing, and platform users.
/// The hot store is a rebuildable projection of this database; on any
/// disagreement this side wins.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("customer not found: {customer_id}")]
    CustomerNotFound { customer_id: String },
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    pub async fn insert_customer(&self, record: CustomerRecord) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO customers (
                     customer_id, tenant_id, current_balance_grains,
                     lifetime_spent_grains, buffer_strategy, created_at_ms, updated_at_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    record.customer_id,
                    record.tenant_id,
                    record.balance_grains,
                    record.lifetime_spent_grains,
                    record.buffer_strategy.as_str(),
                    record.created_at_ms,
                    record.updated_at_ms,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<CustomerRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let customer_id = customer_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<CustomerRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let record = conn
                .query_row(
                    "SELECT customer_id, tenant_id, current_balance_grains,
                            lifetime_spent_grains, buffer_strategy, created_at_ms, updated_at_ms
                     FROM customers WHERE customer_id = ?1",
                    rusqlite::params![customer_id],
                    customer_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await?
    }

    pub async fn customer_balance(&self, customer_id: &str) -> Result<i64, SqliteStoreError> {
        let path = self.path.clone();
        let customer_id = customer_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<i64, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.query_row(
                "SELECT current_balance_grains FROM customers WHERE customer_id = ?1",
                rusqlite::params![customer_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(SqliteStoreError::CustomerNotFound { customer_id })
        })
        .await?
    }

    /// Full `(customer_id, balance)` scan for the bootstrap.
    pub async fn customer_balances(&self) -> Result<Vec<(String, i64)>, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<(String, i64)>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT customer_id, current_balance_grains FROM customers ORDER BY customer_id",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await?
    }

    /// Customers whose balance changed recently; the incremental sync set.
    pub async fn customers_updated_since(
        &self,
        since_epoch_ms: i64,
    ) -> Result<Vec<(String, i64)>, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<(String, i64)>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT customer_id, current_balance_grains FROM customers
                 WHERE updated_at_ms > ?1",
            )?;
            let rows =
                stmt.query_map(rusqlite::params![since_epoch_ms], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await?
    }

    /// Uniform random sample for the integrity check.
    pub async fn sample_customers(
        &self,
        sample_size: usize,
    ) -> Result<Vec<(String, i64)>, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<(String, i64)>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT customer_id, current_balance_grains FROM customers
                 ORDER BY RANDOM() LIMIT ?1",
            )?;
            let rows = stmt.query_map(rusqlite::params![sample_size as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await?
    }

    /// Credits (or debits, for admin corrections) a customer outside the
    /// request flow: one journal row plus the balance move, atomically.
    pub async fn apply_adjustment(
        &self,
        record: TransactionRecord,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO transactions (
                     transaction_id, customer_id, amount_grains, transaction_type,
                     reference_id, description, created_at_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    record.transaction_id,
                    record.customer_id,
                    record.amount_grains,
                    record.kind.as_str(),
                    record.reference_id,
                    record.description,
                    record.created_at_ms,
                ],
            )?;
            tx.execute(
                "UPDATE customers SET
                     current_balance_grains = current_balance_grains + ?2,
                     updated_at_ms = ?3
                 WHERE customer_id = ?1",
                rusqlite::params![record.customer_id, record.amount_grains, record.created_at_ms],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    /// Request row inserted when a reservation is approved. `INSERT OR
    /// IGNORE` keeps pipeline retries idempotent.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_preflight(
        &self,
        request_id: &str,
        customer_id: &str,
        tenant_id: &str,
        model: Option<&str>,
        provider: Option<&str>,
        estimated_cost_grains: i64,
        reserved_grains: i64,
        created_at_ms: i64,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let request_id = request_id.to_string();
        let customer_id = customer_id.to_string();
        let tenant_id = tenant_id.to_string();
        let model = model.map(str::to_string);
        let provider = provider.map(str::to_string);
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT OR IGNORE INTO requests (
                     request_id, customer_id, tenant_id, model, provider,
                     estimated_cost_grains, reserved_grains, streamed_grains,
                     status, created_at_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 'preflight_approved', ?8)",
                rusqlite::params![
                    request_id,
                    customer_id,
                    tenant_id,
                    model,
                    provider,
                    estimated_cost_grains,
                    reserved_grains,
                    created_at_ms,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Terminal reconciliation, durably: settle the request row, append the
    /// negative usage transaction, and apply the debit to the customer row —
    /// all in one database transaction. The transaction id is minted by the
    /// caller once per finalization so retries cannot double-insert.
    ///
    /// The request write is an upsert: the preflight row may be late or may
    /// have been dropped by the queue's overflow policy, and the settled
    /// request must survive either way. An inserted row carries placeholder
    /// preflight fields; an existing row keeps its own.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_finalization(
        &self,
        request_id: &str,
        customer_id: &str,
        transaction_id: &str,
        status: RequestStatus,
        actual_cost_grains: i64,
        consumed_grains: i64,
        prompt_tokens: u32,
        completion_tokens: u32,
        model: &str,
        kill_reason: Option<&str>,
        now_ms: i64,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let request_id = request_id.to_string();
        let customer_id = customer_id.to_string();
        let transaction_id = transaction_id.to_string();
        let model = model.to_string();
        let kill_reason = kill_reason.map(str::to_string);
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            let total_tokens = i64::from(prompt_tokens) + i64::from(completion_tokens);
            tx.execute(
                "INSERT INTO requests (
                     request_id, customer_id, tenant_id, model, provider,
                     estimated_cost_grains, reserved_grains, streamed_grains,
                     provider_reported_cost_grains, actual_cost_grains,
                     reconciliation_delta_grains, prompt_tokens, completion_tokens,
                     total_tokens, status, kill_reason, created_at_ms,
                     completed_at_ms, reconciled_at_ms
                 ) VALUES (?1, ?2, '', ?3, NULL, 0, 0, ?4, ?5, ?5, ?4 - ?5,
                           ?6, ?7, ?8, ?9, ?10, ?11, ?11, ?11)
                 ON CONFLICT(request_id) DO UPDATE SET
                     provider_reported_cost_grains = excluded.provider_reported_cost_grains,
                     actual_cost_grains = excluded.actual_cost_grains,
                     streamed_grains = excluded.streamed_grains,
                     reconciliation_delta_grains = excluded.reconciliation_delta_grains,
                     prompt_tokens = excluded.prompt_tokens,
                     completion_tokens = excluded.completion_tokens,
                     total_tokens = excluded.total_tokens,
                     status = excluded.status,
                     kill_reason = excluded.kill_reason,
                     completed_at_ms = excluded.completed_at_ms,
                     reconciled_at_ms = excluded.reconciled_at_ms",
                rusqlite::params![
                    request_id,
                    customer_id,
                    model,
                    consumed_grains,
                    actual_cost_grains,
                    prompt_tokens,
                    completion_tokens,
                    total_tokens,
                    status.as_str(),
                    kill_reason,
                    now_ms,
                ],
            )?;

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO transactions (
                     transaction_id, customer_id, amount_grains, transaction_type,
                     reference_id, description, created_at_ms
                 ) VALUES (?1, ?2, ?3, 'ai_usage', ?4, ?5, ?6)",
                rusqlite::params![
                    transaction_id,
                    customer_id,
                    -actual_cost_grains,
                    request_id,
                    format!("AI usage: {model} ({total_tokens} tokens)"),
                    now_ms,
                ],
            )?;

            // Only the first application moves the balance; a retried op
            // whose journal row already landed must not debit twice.
            if inserted > 0 {
                tx.execute(
                    "UPDATE customers SET
                         current_balance_grains = MAX(0, current_balance_grains - ?2),
                         lifetime_spent_grains = lifetime_spent_grains + ?2,
                         updated_at_ms = ?3
                     WHERE customer_id = ?1",
                    rusqlite::params![customer_id, actual_cost_grains, now_ms],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await?
    }

    pub async fn request(
        &self,
        request_id: &str,
    ) -> Result<Option<RequestRow>, SqliteStoreError> {
        let path = self.path.clone();
        let request_id = request_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<RequestRow>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let row = conn
                .query_row(
                    "SELECT request_id, customer_id, tenant_id, model, provider,
                            estimated_cost_grains, reserved_grains, streamed_grains,
                            provider_reported_cost_grains, actual_cost_grains,
                            reconciliation_delta_grains, prompt_tokens, completion_tokens,
                            total_tokens, status, kill_reason, integrity_issue,
                            created_at_ms, completed_at_ms, reconciled_at_ms
                     FROM requests WHERE request_id = ?1",
                    rusqlite::params![request_id],
                    request_from_row,
                )
                .optional()?;
            Ok(row)
        })
        .await?
    }

    pub async fn transactions_for_customer(
        &self,
        customer_id: &str,
    ) -> Result<Vec<TransactionRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let customer_id = customer_id.to_string();
        tokio::task::spawn_blocking(
            move || -> Result<Vec<TransactionRecord>, SqliteStoreError> {
                let conn = open_connection(path)?;
                init_schema(&conn)?;
                let mut stmt = conn.prepare(
                    "SELECT transaction_id, customer_id, amount_grains, transaction_type,
                            reference_id, description, created_at_ms
                     FROM transactions WHERE customer_id = ?1 ORDER BY created_at_ms, transaction_id",
                )?;
                let rows = stmt.query_map(rusqlite::params![customer_id], transaction_from_row)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
            },
        )
        .await?
    }

    /// Current pricing rows (`effective_until IS NULL`); the startup cache
    /// load. Historical rows are never read.
    pub async fn pricing_rows(&self) -> Result<Vec<ModelPricing>, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ModelPricing>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT model_name, provider, input_cost_per_million_tokens,
                        output_cost_per_million_tokens
                 FROM model_pricing WHERE effective_until_ms IS NULL",
            )?;
            let rows = stmt.query_map([], pricing_from_row)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await?
    }

    pub async fn pricing(
        &self,
        model: &str,
        provider: &str,
    ) -> Result<Option<ModelPricing>, SqliteStoreError> {
        let path = self.path.clone();
        let model = model.to_string();
        let provider = provider.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<ModelPricing>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let row = conn
                .query_row(
                    "SELECT model_name, provider, input_cost_per_million_tokens,
                            output_cost_per_million_tokens
                     FROM model_pricing
                     WHERE model_name = ?1 AND provider = ?2 AND effective_until_ms IS NULL",
                    rusqlite::params![model, provider],
                    pricing_from_row,
                )
                .optional()?;
            Ok(row)
        })
        .await?
    }

    pub async fn upsert_pricing(
        &self,
        pricing: ModelPricing,
        effective_from_ms: i64,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;
            // Retire the current row, then insert the new current one.
            tx.execute(
                "UPDATE model_pricing SET effective_until_ms = ?3
                 WHERE model_name = ?1 AND provider = ?2 AND effective_until_ms IS NULL",
                rusqlite::params![pricing.model, pricing.provider, effective_from_ms],
            )?;
            tx.execute(
                "INSERT INTO model_pricing (
                     model_name, provider, input_cost_per_million_tokens,
                     output_cost_per_million_tokens, effective_from_ms, effective_until_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
                rusqlite::params![
                    pricing.model,
                    pricing.provider,
                    pricing.input_cost_per_million_tokens,
                    pricing.output_cost_per_million_tokens,
                    effective_from_ms,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    pub async fn insert_platform_user(
        &self,
        user_id: &str,
        api_key_hash: &str,
        subscription_status: &str,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let api_key_hash = api_key_hash.to_string();
        let subscription_status = subscription_status.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO platform_users (user_id, api_key_hash, subscription_status)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![user_id, api_key_hash, subscription_status],
            )?;
            Ok(())
        })
        .await?
    }

    /// `(api_key_hash, user_id)` pairs for active users; the hot store's
    /// authentication projection.
    pub async fn active_api_key_hashes(&self) -> Result<Vec<(String, String)>, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<(String, String)>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT api_key_hash, user_id FROM platform_users
                 WHERE subscription_status = 'active'",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await?
    }

    /// Compares the authoritative balance against the transaction sum.
    pub async fn verify_balance_integrity(
        &self,
        customer_id: &str,
    ) -> Result<IntegrityReport, SqliteStoreError> {
        let path = self.path.clone();
        let customer_id = customer_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<IntegrityReport, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let balance: i64 = conn
                .query_row(
                    "SELECT current_balance_grains FROM customers WHERE customer_id = ?1",
                    rusqlite::params![customer_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| SqliteStoreError::CustomerNotFound {
                    customer_id: customer_id.clone(),
                })?;
            let tx_sum: i64 = conn.query_row(
                "SELECT COALESCE(SUM(amount_grains), 0) FROM transactions WHERE customer_id = ?1",
                rusqlite::params![customer_id],
                |row| row.get(0),
            )?;
            let delta = balance - tx_sum;
            Ok(IntegrityReport {
                customer_id,
                balance_grains: balance,
                transaction_sum_grains: tx_sum,
                delta_grains: delta,
                ok: delta == 0,
            })
        })
        .await?
    }
}

fn customer_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CustomerRecord> {
    let strategy: String = row.get(4)?;
    Ok(CustomerRecord {
        customer_id: row.get(0)?,
        tenant_id: row.get(1)?,
        balance_grains: row.get(2)?,
        lifetime_spent_grains: row.get(3)?,
        buffer_strategy: BufferStrategy::parse(&strategy).unwrap_or_default(),
        created_at_ms: row.get(5)?,
        updated_at_ms: row.get(6)?,
    })
}

fn transaction_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransactionRecord> {
    let kind: String = row.get(3)?;
    Ok(TransactionRecord {
        transaction_id: row.get(0)?,
        customer_id: row.get(1)?,
        amount_grains: row.get(2)?,
        kind: TransactionKind::parse(&kind).unwrap_or(TransactionKind::AdminAdjustment),
        reference_id: row.get(4)?,
        description: row.get(5)?,
        created_at_ms: row.get(6)?,
    })
}

fn pricing_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModelPricing> {
    Ok(ModelPricing {
        model: row.get(0)?,
        provider: row.get(1)?,
        input_cost_per_million_tokens: row.get(2)?,
        output_cost_per_million_tokens: row.get(3)?,
    })
}

fn request_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestRow> {
    let status: String = row.get(14)?;
    Ok(RequestRow {
        request_id: row.get(0)?,
        customer_id: row.get(1)?,
        tenant_id: row.get(2)?,
        model: row.get(3)?,
        provider: row.get(4)?,
        estimated_cost_grains: row.get(5)?,
        reserved_grains: row.get(6)?,
        streamed_grains: row.get(7)?,
        provider_reported_cost_grains: row.get(8)?,
        actual_cost_grains: row.get(9)?,
        reconciliation_delta_grains: row.get(10)?,
        prompt_tokens: row.get(11)?,
        completion_tokens: row.get(12)?,
        total_tokens: row.get(13)?,
        status: RequestStatus::parse(&status).unwrap_or(RequestStatus::Failed),
        kill_reason: row.get(15)?,
        integrity_issue: row.get(16)?,
        created_at_ms: row.get(17)?,
        completed_at_ms: row.get(18)?,
        reconciled_at_ms: row.get(19)?,
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS customers (
            customer_id TEXT PRIMARY KEY NOT NULL,
            tenant_id TEXT NOT NULL,
            current_balance_grains INTEGER NOT NULL DEFAULT 0
                CHECK (current_balance_grains >= 0),
            lifetime_spent_grains INTEGER NOT NULL DEFAULT 0,
            buffer_strategy TEXT NOT NULL DEFAULT 'conservative',
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_customers_updated_at
            ON customers(updated_at_ms);

        CREATE TABLE IF NOT EXISTS transactions (
            transaction_id TEXT PRIMARY KEY NOT NULL,
            customer_id TEXT NOT NULL REFERENCES customers(customer_id),
            amount_grains INTEGER NOT NULL,
            transaction_type TEXT NOT NULL,
            reference_id TEXT,
            description TEXT,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_transactions_customer_id
            ON transactions(customer_id);

        CREATE TABLE IF NOT EXISTS requests (
            request_id TEXT PRIMARY KEY NOT NULL,
            customer_id TEXT NOT NULL REFERENCES customers(customer_id),
            tenant_id TEXT NOT NULL,
            model TEXT,
            provider TEXT,
            estimated_cost_grains INTEGER NOT NULL,
            reserved_grains INTEGER NOT NULL,
            streamed_grains INTEGER NOT NULL DEFAULT 0,
            provider_reported_cost_grains INTEGER,
            actual_cost_grains INTEGER,
            reconciliation_delta_grains INTEGER,
            prompt_tokens INTEGER,
            completion_tokens INTEGER,
            total_tokens INTEGER,
            status TEXT NOT NULL,
            kill_reason TEXT,
            integrity_issue TEXT,
            created_at_ms INTEGER NOT NULL,
            completed_at_ms INTEGER,
            reconciled_at_ms INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_requests_customer_id
            ON requests(customer_id);

        CREATE TABLE IF NOT EXISTS model_pricing (
            model_name TEXT NOT NULL,
            provider TEXT NOT NULL,
            input_cost_per_million_tokens INTEGER NOT NULL,
            output_cost_per_million_tokens INTEGER NOT NULL,
            effective_from_ms INTEGER NOT NULL,
            effective_until_ms INTEGER,
            PRIMARY KEY (model_name, provider, effective_from_ms)
        );

        CREATE TABLE IF NOT EXISTS platform_users (
            user_id TEXT PRIMARY KEY NOT NULL,
            api_key_hash TEXT NOT NULL,
            subscription_status TEXT NOT NULL DEFAULT 'active'
        );
        CREATE INDEX IF NOT EXISTS idx_platform_users_api_key_hash
            ON platform_users(api_key_hash);",
    )
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("granary.sqlite"));
        (dir, store)
    }

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
    async fn finalization_is_one_atomic_unit() {
        let (_dir, store) = temp_store();
        store.init().await.expect("init");
        store
            .insert_customer(customer("cus_1", 100_000))
            .await
            .expect("customer");
        store
            .insert_preflight("req_1", "cus_1", "tenant-1", Some("helix-1"), Some("acme"), 50_000, 60_000, 2_000)
            .await
            .expect("preflight");

        store
            .apply_finalization(
                "req_1",
                "cus_1",
                "tx_1",
                RequestStatus::Completed,
                55_000,
                60_000,
                1_200,
                3_400,
                "helix-1",
                None,
                3_000,
            )
            .await
            .expect("finalize");

        let row = store.request("req_1").await.expect("request").expect("row");
        assert_eq!(row.status, RequestStatus::Completed);
        assert_eq!(row.actual_cost_grains, Some(55_000));
        assert_eq!(row.streamed_grains, 60_000);
        assert_eq!(row.reconciliation_delta_grains, Some(5_000));
        assert_eq!(row.total_tokens, Some(4_600));

        let txs = store
            .transactions_for_customer("cus_1")
            .await
            .expect("transactions");
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].amount_grains, -55_000);
        assert_eq!(txs[0].kind, TransactionKind::AiUsage);
        assert_eq!(txs[0].reference_id.as_deref(), Some("req_1"));

        assert_eq!(
            store.customer_balance("cus_1").await.expect("balance"),
            45_000
        );
    }

    #[tokio::test]
    async fn finalization_retry_does_not_double_debit() {
        let (_dir, store) = temp_store();
        store.init().await.expect("init");
        store
            .insert_customer(customer("cus_1", 100_000))
            .await
            .expect("customer");
        store
            .insert_preflight("req_1", "cus_1", "tenant-1", None, None, 50_000, 60_000, 2_000)
            .await
            .expect("preflight");

        for _ in 0..3 {
            store
                .apply_finalization(
                    "req_1",
                    "cus_1",
                    "tx_1",
                    RequestStatus::Completed,
                    55_000,
                    60_000,
                    1_200,
                    3_400,
                    "helix-1",
                    None,
                    3_000,
                )
                .await
                .expect("finalize");
        }

        let txs = store
            .transactions_for_customer("cus_1")
            .await
            .expect("transactions");
        assert_eq!(txs.len(), 1);
        assert_eq!(
            store.customer_balance("cus_1").await.expect("balance"),
            45_000
        );
    }

    #[tokio::test]
    async fn finalization_survives_a_lost_preflight() {
        let (_dir, store) = temp_store();
        store.init().await.expect("init");
        store
            .insert_customer(customer("cus_1", 100_000))
            .await
            .expect("customer");

        // The preflight write was dropped by queue overflow; the settled
        // request must still land.
        store
            .apply_finalization(
                "req_1",
                "cus_1",
                "tx_1",
                RequestStatus::Completed,
                55_000,
                60_000,
                1_200,
                3_400,
                "helix-1",
                None,
                3_000,
            )
            .await
            .expect("finalize");

        let row = store.request("req_1").await.expect("request").expect("row");
        assert_eq!(row.status, RequestStatus::Completed);
        assert_eq!(row.actual_cost_grains, Some(55_000));
        assert_eq!(row.streamed_grains, 60_000);
        assert_eq!(row.model.as_deref(), Some("helix-1"));
        assert_eq!(
            store.customer_balance("cus_1").await.expect("balance"),
            45_000
        );

        // A preflight arriving after the fact must not reopen the row.
        store
            .insert_preflight("req_1", "cus_1", "tenant-1", None, None, 50_000, 60_000, 2_000)
            .await
            .expect("preflight");
        let row = store.request("req_1").await.expect("request").expect("row");
        assert_eq!(row.status, RequestStatus::Completed);
        assert_eq!(row.actual_cost_grains, Some(55_000));
    }

    #[tokio::test]
    async fn integrity_query_reports_drift() {
        let (_dir, store) = temp_store();
        store.init().await.expect("init");
        store
            .insert_customer(customer("cus_1", 0))
            .await
            .expect("customer");
        store
            .apply_adjustment(TransactionRecord {
                transaction_id: "tx_credit".to_string(),
                customer_id: "cus_1".to_string(),
                amount_grains: 75_000,
                kind: TransactionKind::StripePayment,
                reference_id: Some("pi_123".to_string()),
                description: Some("top-up".to_string()),
                created_at_ms: 2_000,
            })
            .await
            .expect("credit");

        let report = store
            .verify_balance_integrity("cus_1")
            .await
            .expect("integrity");
        assert!(report.ok);
        assert_eq!(report.balance_grains, 75_000);
        assert_eq!(report.transaction_sum_grains, 75_000);
        assert_eq!(report.delta_grains, 0);

        // A balance seeded without a journal row shows as drift.
        store
            .insert_customer(customer("cus_2", 10_000))
            .await
            .expect("customer");
        let report = store
            .verify_balance_integrity("cus_2")
            .await
            .expect("integrity");
        assert!(!report.ok);
        assert_eq!(report.delta_grains, 10_000);
    }

    #[tokio::test]
    async fn pricing_reads_only_current_rows() {
        let (_dir, store) = temp_store();
        store.init().await.expect("init");

        let old = ModelPricing {
            model: "helix-1".to_string(),
            provider: "acme".to_string(),
            input_cost_per_million_tokens: 2_000_000,
            output_cost_per_million_tokens: 10_000_000,
        };
        let current = ModelPricing {
            input_cost_per_million_tokens: 3_000_000,
            output_cost_per_million_tokens: 15_000_000,
            ..old.clone()
        };
        store.upsert_pricing(old, 1_000).await.expect("old");
        store.upsert_pricing(current.clone(), 2_000).await.expect("current");

        let found = store
            .pricing("helix-1", "acme")
            .await
            .expect("pricing")
            .expect("row");
        assert_eq!(found, current);
        assert_eq!(store.pricing_rows().await.expect("rows").len(), 1);
        assert_eq!(
            store.pricing("helix-1", "other").await.expect("pricing"),
            None
        );
    }

    #[tokio::test]
    async fn api_key_scan_only_returns_active_users() {
        let (_dir, store) = temp_store();
        store.init().await.expect("init");
        store
            .insert_platform_user("user-1", "hash-1", "active")
            .await
            .expect("user");
        store
            .insert_platform_user("user-2", "hash-2", "cancelled")
            .await
            .expect("user");

        let hashes = store.active_api_key_hashes().await.expect("hashes");
        assert_eq!(hashes, vec![("hash-1".to_string(), "user-1".to_string())]);
    }
}
