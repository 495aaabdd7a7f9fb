use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 1 unit of external currency (one dollar by convention) in grains.
pub const GRAINS_PER_UNIT: i64 = 1_000_000;

pub const CODE_INSUFFICIENT_BALANCE: &str = "INSUFFICIENT_BALANCE";
pub const CODE_REQUEST_EXISTS: &str = "REQUEST_EXISTS";
pub const CODE_REQUEST_NOT_FOUND: &str = "REQUEST_NOT_FOUND";
pub const CODE_BALANCE_NEGATIVE: &str = "BALANCE_NEGATIVE";
/// Internal finalize-replay marker; never surfaced in an outcome.
pub const CODE_ALREADY_FINALIZED: &str = "ALREADY_FINALIZED";

pub const ISSUE_UNDERCHARGE_SHORTFALL: &str = "undercharge_shortfall";
pub const ISSUE_RESERVATION_UNDERFLOW: &str = "reservation_underflow";

/// Request lifecycle. `preflight_approved` -> `streaming` -> terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    PreflightApproved,
    Streaming,
    Completed,
    Killed,
    Failed,
    Timeout,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::PreflightApproved => "preflight_approved",
            RequestStatus::Streaming => "streaming",
            RequestStatus::Completed => "completed",
            RequestStatus::Killed => "killed",
            RequestStatus::Failed => "failed",
            RequestStatus::Timeout => "timeout",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "preflight_approved" => Some(RequestStatus::PreflightApproved),
            "streaming" => Some(RequestStatus::Streaming),
            "completed" => Some(RequestStatus::Completed),
            "killed" => Some(RequestStatus::Killed),
            "failed" => Some(RequestStatus::Failed),
            "timeout" => Some(RequestStatus::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed
                | RequestStatus::Killed
                | RequestStatus::Failed
                | RequestStatus::Timeout
        )
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger-entry kind. Positive amounts credit the customer, negative debit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    StripePayment,
    AiUsage,
    ReconciliationAdjustment,
    Refund,
    AdminAdjustment,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::StripePayment => "stripe_payment",
            TransactionKind::AiUsage => "ai_usage",
            TransactionKind::ReconciliationAdjustment => "reconciliation_adjustment",
            TransactionKind::Refund => "refund",
            TransactionKind::AdminAdjustment => "admin_adjustment",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "stripe_payment" => Some(TransactionKind::StripePayment),
            "ai_usage" => Some(TransactionKind::AiUsage),
            "reconciliation_adjustment" => Some(TransactionKind::ReconciliationAdjustment),
            "refund" => Some(TransactionKind::Refund),
            "admin_adjustment" => Some(TransactionKind::AdminAdjustment),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reservation sizing applied by the caller before `check_and_reserve`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferStrategy {
    #[default]
    Conservative,
    Aggressive,
}

impl BufferStrategy {
    pub fn multiplier(self) -> f64 {
        match self {
            BufferStrategy::Conservative => 1.2,
            BufferStrategy::Aggressive => 1.0,
        }
    }

    /// Grains to reserve for an estimated cost: `ceil(estimated * multiplier)`.
    pub fn reservation_for(self, estimated_grains: i64) -> i64 {
        if estimated_grains <= 0 {
            return 0;
        }
        (estimated_grains as f64 * self.multiplier()).ceil() as i64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BufferStrategy::Conservative => "conservative",
            BufferStrategy::Aggressive => "aggressive",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "conservative" => Some(BufferStrategy::Conservative),
            "aggressive" => Some(BufferStrategy::Aggressive),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub customer_id: String,
    pub request_id: String,
    pub reserved_grains: i64,
    pub estimated_grains: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReservationOutcome {
    pub approved: bool,
    /// Spendable pool after the reservation; current balance on rejection.
    pub remaining_available: i64,
    pub rejection_reason: String,
    pub reserved_grains: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeductionRequest {
    pub customer_id: String,
    pub request_id: String,
    pub grain_amount: i64,
    pub tokens_consumed: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeductionOutcome {
    /// `false` is the kill switch: the caller must stop streaming now.
    pub success: bool,
    pub remaining_balance: i64,
    pub error_code: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinalizationRequest {
    pub customer_id: String,
    pub request_id: String,
    pub status: RequestStatus,
    pub actual_cost_grains: i64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinalizationOutcome {
    pub success: bool,
    /// Positive: grains returned to the balance. Negative: extra charge taken.
    pub refunded_grains: i64,
    pub final_balance: i64,
    pub error_code: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub balance: i64,
    pub reserved: i64,
    pub available: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model: String,
    pub provider: String,
    pub input_cost_per_million_tokens: i64,
    pub output_cost_per_million_tokens: i64,
}

impl ModelPricing {
    /// Grain cost for authoritative token counts, rounded down per side.
    pub fn cost_grains(&self, prompt_tokens: u32, completion_tokens: u32) -> i64 {
        let input = i64::from(prompt_tokens).saturating_mul(self.input_cost_per_million_tokens)
            / 1_000_000;
        let output = i64::from(completion_tokens)
            .saturating_mul(self.output_cost_per_million_tokens)
            / 1_000_000;
        input.saturating_add(output)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub customer_id: String,
    pub tenant_id: String,
    pub balance_grains: i64,
    pub lifetime_spent_grains: i64,
    pub buffer_strategy: BufferStrategy,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub customer_id: String,
    pub amount_grains: i64,
    pub kind: TransactionKind,
    pub reference_id: Option<String>,
    pub description: Option<String>,
    pub created_at_ms: i64,
}

/// Durable request row, written behind the hot path by the async pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestRow {
    pub request_id: String,
    pub customer_id: String,
    pub tenant_id: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub estimated_cost_grains: i64,
    pub reserved_grains: i64,
    pub streamed_grains: i64,
    pub provider_reported_cost_grains: Option<i64>,
    pub actual_cost_grains: Option<i64>,
    pub reconciliation_delta_grains: Option<i64>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub status: RequestStatus,
    pub kill_reason: Option<String>,
    pub integrity_issue: Option<String>,
    pub created_at_ms: i64,
    pub completed_at_ms: Option<i64>,
    pub reconciled_at_ms: Option<i64>,
}

/// Hot-store request hash, read back for operational inspection.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub customer_id: String,
    pub reserved_grains: i64,
    pub estimated_grains: i64,
    pub consumed_grains: i64,
    pub tokens_consumed: i64,
    pub status: String,
    pub created_at: i64,
    pub last_deduction_at: Option<i64>,
    pub finalized_at: Option<i64>,
    pub actual_cost_grains: Option<i64>,
    pub refunded_grains: Option<i64>,
    pub integrity_issue: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Result of the durable store's balance-vs-transactions check.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub customer_id: String,
    pub balance_grains: i64,
    pub transaction_sum_grains: i64,
    pub delta_grains: i64,
    pub ok: bool,
}

/// Time source. Production uses [`SystemClock`]; tests drive a manual clock.
pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> i64;

    fn now_epoch_millis(&self) -> i64 {
        self.now_epoch_seconds() * 1000
    }
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> i64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        now.as_secs() as i64
    }

    fn now_epoch_millis(&self) -> i64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        now.as_millis() as i64
    }
}

/// SHA-256 hex digest of a raw API key, the hot store's lookup key.
pub fn api_key_hash(raw_key: &str) -> String {
    use sha2::Digest as _;

    let mut hasher = sha2::Sha256::new();
    hasher.update(raw_key.as_bytes());
    hex_lower(&hasher.finalize())
}

fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_and_terminal_set() {
        for status in [
            RequestStatus::PreflightApproved,
            RequestStatus::Streaming,
            RequestStatus::Completed,
            RequestStatus::Killed,
            RequestStatus::Failed,
            RequestStatus::Timeout,
        ] {
            assert_eq!(RequestStatus::parse(status.as_str()), Some(status));
        }
        assert!(!RequestStatus::PreflightApproved.is_terminal());
        assert!(!RequestStatus::Streaming.is_terminal());
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Killed.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
        assert!(RequestStatus::Timeout.is_terminal());
        assert_eq!(RequestStatus::parse("exploded"), None);
    }

    #[test]
    fn buffer_strategy_rounds_up() {
        assert_eq!(
            BufferStrategy::Conservative.reservation_for(50_000),
            60_000
        );
        assert_eq!(BufferStrategy::Conservative.reservation_for(1), 2);
        assert_eq!(BufferStrategy::Aggressive.reservation_for(50_000), 50_000);
        assert_eq!(BufferStrategy::Conservative.reservation_for(0), 0);
        assert_eq!(BufferStrategy::Conservative.reservation_for(-5), 0);
    }

    #[test]
    fn pricing_cost_uses_per_million_rates() {
        let pricing = ModelPricing {
            model: "helix-1".to_string(),
            provider: "acme".to_string(),
            input_cost_per_million_tokens: 3_000_000,
            output_cost_per_million_tokens: 15_000_000,
        };
        // 1000 input tokens at 3 grains/token, 200 output at 15 grains/token.
        assert_eq!(pricing.cost_grains(1_000, 200), 3_000 + 3_000);
    }

    #[test]
    fn api_key_hash_is_stable_sha256_hex() {
        let hash = api_key_hash("sk-test-123");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, api_key_hash("sk-test-123"));
        assert_ne!(hash, api_key_hash("sk-test-124"));
    }
}
