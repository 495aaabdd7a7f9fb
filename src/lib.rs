//! granary — an atomic reservation ledger for real-time AI spend limits.
//!
//! Before invoking an upstream AI provider, a caller reserves an estimated
//! cost for an end customer; streams grain deductions while the response is
//! read; and finalizes with the provider's authoritative cost once the
//! stream ends. Balances are integer grains, so arithmetic is exact.
//!
//! The hot path runs entirely against a key-value store executing three
//! atomic scripts ([`scripts`]); a durable relational store of record
//! catches up through a bounded async write pipeline and is reconciled by
//! the [`sync::Syncer`].

pub mod config;
mod error;
pub mod hot_store;
pub mod memory_store;
pub mod pricing;
pub mod redis_store;
pub mod scripts;
pub mod sqlite_store;
pub mod sync;
pub mod types;
pub mod writer;

mod ledger;

pub use config::LedgerConfig;
pub use error::{LedgerError, Result};
pub use hot_store::{FinalizeReply, HotStore, HotStoreError, ScriptReply};
pub use ledger::Ledger;
pub use memory_store::MemoryStore;
pub use redis_store::{RedisStore, DEFAULT_POOL_SIZE};
pub use sqlite_store::{SqliteStore, SqliteStoreError};
pub use sync::{PeriodicSync, Syncer, DEFAULT_SYNC_INTERVAL};
pub use types::{
    api_key_hash, BalanceSnapshot, BufferStrategy, Clock, CustomerRecord, DeductionOutcome,
    DeductionRequest, FinalizationOutcome, FinalizationRequest, IntegrityReport, ModelPricing,
    RequestRow, RequestSnapshot, RequestStatus, ReservationOutcome, ReservationRequest,
    SystemClock, TransactionKind, TransactionRecord,
};
