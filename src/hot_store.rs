use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::RequestSnapshot;

/// Tracking-record TTL while a request is in flight.
pub const IN_FLIGHT_TTL_SECS: i64 = 3600;
/// Tracking-record TTL once finalized; keeps REQUEST_EXISTS deduplication
/// effective across the retry window.
pub const FINALIZED_TTL_SECS: i64 = 86_400;

pub fn balance_key(customer_id: &str) -> String {
    format!("customer:balance:{customer_id}")
}

pub fn reserved_key(customer_id: &str) -> String {
    format!("customer:reserved:{customer_id}")
}

pub fn request_key(request_id: &str) -> String {
    format!("request:{request_id}")
}

pub fn api_key_key(key_hash: &str) -> String {
    format!("apikey:{key_hash}")
}

#[derive(Debug, Error)]
pub enum HotStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("unexpected script reply: {0}")]
    ScriptReply(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reply of the reserve and deduct scripts. `amount` is the remaining
/// available pool (reserve) or the remaining balance (deduct) on success,
/// and the current balance alongside a rejection `code` otherwise.
#[derive(Clone, Debug)]
pub struct ScriptReply {
    pub ok: bool,
    pub amount: i64,
    pub code: String,
}

/// Reply of the finalize script. `code` is empty on the first terminal
/// transition, `ALREADY_FINALIZED` on a replay, `REQUEST_NOT_FOUND` when
/// no tracking record exists.
#[derive(Clone, Debug)]
pub struct FinalizeReply {
    pub ok: bool,
    pub refunded: i64,
    pub balance: i64,
    pub consumed: i64,
    pub code: String,
}

/// The hot half of the ledger: a key-value store executing the three
/// scripts atomically, plus the typed reads and bulk loads the syncer and
/// the read path need. Script execution is serialized per store, which is
/// the only ordering guarantee the ledger relies on.
#[async_trait]
pub trait HotStore: Send + Sync {
    async fn check_and_reserve(
        &self,
        customer_id: &str,
        request_id: &str,
        reserved_grains: i64,
        estimated_grains: i64,
        metadata_json: &str,
        now_epoch: i64,
    ) -> Result<ScriptReply, HotStoreError>;

    async fn deduct(
        &self,
        customer_id: &str,
        request_id: &str,
        grain_amount: i64,
        tokens_consumed: u32,
        now_epoch: i64,
    ) -> Result<ScriptReply, HotStoreError>;

    async fn finalize(
        &self,
        customer_id: &str,
        request_id: &str,
        actual_cost_grains: i64,
        terminal_status: &str,
        now_epoch: i64,
    ) -> Result<FinalizeReply, HotStoreError>;

    /// Balance and reserved counters in a single round trip.
    async fn balances(&self, customer_id: &str) -> Result<(i64, i64), HotStoreError>;

    async fn get_balance(&self, customer_id: &str) -> Result<Option<i64>, HotStoreError>;

    async fn get_reserved(&self, customer_id: &str) -> Result<Option<i64>, HotStoreError>;

    /// Overwrites one customer's balance; `reserved` is left alone.
    async fn set_balance(&self, customer_id: &str, balance: i64) -> Result<(), HotStoreError>;

    /// Pipelined bulk load used by the bootstrap. When `init_reserved` is
    /// set, each customer's reserved counter is reset to zero; drift
    /// correction never sets it.
    async fn bulk_set_balances(
        &self,
        entries: &[(String, i64)],
        init_reserved: bool,
    ) -> Result<(), HotStoreError>;

    async fn set_api_keys(&self, entries: &[(String, String)]) -> Result<(), HotStoreError>;

    async fn tenant_for_api_key(&self, key_hash: &str)
        -> Result<Option<String>, HotStoreError>;

    async fn request_snapshot(
        &self,
        request_id: &str,
    ) -> Result<Option<RequestSnapshot>, HotStoreError>;

    async fn ping(&self) -> Result<(), HotStoreError>;
}

pub(crate) fn snapshot_from_fields(fields: HashMap<String, String>) -> RequestSnapshot {
    let int = |name: &str| -> i64 {
        fields
            .get(name)
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0)
    };
    let opt_int = |name: &str| -> Option<i64> {
        fields.get(name).and_then(|raw| raw.parse::<i64>().ok())
    };

    RequestSnapshot {
        customer_id: fields.get("customer_id").cloned().unwrap_or_default(),
        reserved_grains: int("reserved_grains"),
        estimated_grains: int("estimated_grains"),
        consumed_grains: int("consumed_grains"),
        tokens_consumed: int("tokens_consumed"),
        status: fields.get("status").cloned().unwrap_or_default(),
        created_at: int("created_at"),
        last_deduction_at: opt_int("last_deduction_at"),
        finalized_at: opt_int("finalized_at"),
        actual_cost_grains: opt_int("actual_cost_grains"),
        refunded_grains: opt_int("refunded_grains"),
        integrity_issue: fields.get("integrity_issue").cloned(),
        metadata: fields
            .get("metadata")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default(),
    }
}
