use thiserror::Error;

use crate::hot_store::HotStoreError;
use crate::sqlite_store::SqliteStoreError;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("hot store error: {0}")]
    HotStore(#[from] HotStoreError),
    #[error("durable store error: {0}")]
    Durable(#[from] SqliteStoreError),
    #[error("no current pricing for model {model} (provider {provider})")]
    PricingNotFound { model: String, provider: String },
}

pub type Result<T> = std::result::Result<T, LedgerError>;
