use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::hot_store::{
    FinalizeReply, HotStore, HotStoreError, ScriptReply, FINALIZED_TTL_SECS, IN_FLIGHT_TTL_SECS,
};
use crate::types::{
    Clock, RequestSnapshot, SystemClock, CODE_ALREADY_FINALIZED, CODE_BALANCE_NEGATIVE,
    CODE_INSUFFICIENT_BALANCE, CODE_REQUEST_EXISTS, CODE_REQUEST_NOT_FOUND,
    ISSUE_RESERVATION_UNDERFLOW, ISSUE_UNDERCHARGE_SHORTFALL,
};

/// In-process [`HotStore`] mirroring the script semantics exactly. One
/// mutex guards the whole state: holding it across an operation is the same
/// serialization the script runtime provides on the networked store. Used
/// by the test harness and by single-process deployments that do not want
/// an external cache.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    clock: Option<Arc<dyn Clock>>,
}

#[derive(Default)]
struct State {
    balances: HashMap<String, i64>,
    reserved: HashMap<String, i64>,
    requests: HashMap<String, RequestEntry>,
    api_keys: HashMap<String, String>,
}

#[derive(Clone, Debug)]
struct RequestEntry {
    customer_id: String,
    reserved_grains: i64,
    estimated_grains: i64,
    consumed_grains: i64,
    tokens_consumed: i64,
    status: String,
    created_at: i64,
    last_deduction_at: Option<i64>,
    finalized_at: Option<i64>,
    actual_cost_grains: Option<i64>,
    refunded_grains: Option<i64>,
    integrity_issue: Option<String>,
    metadata_json: String,
    expires_at: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the expiry clock, letting tests drive record TTLs.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    fn now(&self) -> i64 {
        match &self.clock {
            Some(clock) => clock.now_epoch_seconds(),
            None => SystemClock.now_epoch_seconds(),
        }
    }

    fn purge_if_expired(state: &mut State, request_id: &str, now: i64) {
        if let Some(entry) = state.requests.get(request_id) {
            if entry.expires_at <= now {
                state.requests.remove(request_id);
            }
        }
    }
}

#[async_trait]
impl HotStore for MemoryStore {
    async fn check_and_reserve(
        &self,
        customer_id: &str,
        request_id: &str,
        reserved_grains: i64,
        estimated_grains: i64,
        metadata_json: &str,
        now_epoch: i64,
    ) -> Result<ScriptReply, HotStoreError> {
        let mut state = self.state.lock();
        Self::purge_if_expired(&mut state, request_id, self.now());

        let balance = state.balances.get(customer_id).copied().unwrap_or(0);
        let reserved = state.reserved.get(customer_id).copied().unwrap_or(0);

        if state.requests.contains_key(request_id) {
            return Ok(ScriptReply {
                ok: false,
                amount: balance,
                code: CODE_REQUEST_EXISTS.to_string(),
            });
        }
        let available = balance - reserved;
        if available < reserved_grains {
            return Ok(ScriptReply {
                ok: false,
                amount: balance,
                code: CODE_INSUFFICIENT_BALANCE.to_string(),
            });
        }

        *state.reserved.entry(customer_id.to_string()).or_insert(0) += reserved_grains;
        state.requests.insert(
            request_id.to_string(),
            RequestEntry {
                customer_id: customer_id.to_string(),
                reserved_grains,
                estimated_grains,
                consumed_grains: 0,
                tokens_consumed: 0,
                status: "preflight_approved".to_string(),
                created_at: now_epoch,
                last_deduction_at: None,
                finalized_at: None,
                actual_cost_grains: None,
                refunded_grains: None,
                integrity_issue: None,
                metadata_json: metadata_json.to_string(),
                expires_at: now_epoch + IN_FLIGHT_TTL_SECS,
            },
        );

        Ok(ScriptReply {
            ok: true,
            amount: available - reserved_grains,
            code: String::new(),
        })
    }

    async fn deduct(
        &self,
        customer_id: &str,
        request_id: &str,
        grain_amount: i64,
        tokens_consumed: u32,
        now_epoch: i64,
    ) -> Result<ScriptReply, HotStoreError> {
        let now = self.now();
        let mut guard = self.state.lock();
        Self::purge_if_expired(&mut guard, request_id, now);
        let state = &mut *guard;

        let balance = state.balances.get(customer_id).copied().unwrap_or(0);
        let Some(entry) = state.requests.get_mut(request_id) else {
            return Ok(ScriptReply {
                ok: false,
                amount: balance,
                code: CODE_REQUEST_NOT_FOUND.to_string(),
            });
        };
        if balance < grain_amount {
            return Ok(ScriptReply {
                ok: false,
                amount: balance,
                code: CODE_INSUFFICIENT_BALANCE.to_string(),
            });
        }
        if balance - grain_amount < 0 {
            return Ok(ScriptReply {
                ok: false,
                amount: balance,
                code: CODE_BALANCE_NEGATIVE.to_string(),
            });
        }

        state
            .balances
            .insert(customer_id.to_string(), balance - grain_amount);
        entry.consumed_grains += grain_amount;
        entry.tokens_consumed += i64::from(tokens_consumed);
        entry.status = "streaming".to_string();
        entry.last_deduction_at = Some(now_epoch);

        Ok(ScriptReply {
            ok: true,
            amount: balance - grain_amount,
            code: String::new(),
        })
    }

    async fn finalize(
        &self,
        customer_id: &str,
        request_id: &str,
        actual_cost_grains: i64,
        terminal_status: &str,
        now_epoch: i64,
    ) -> Result<FinalizeReply, HotStoreError> {
        let now = self.now();
        let mut guard = self.state.lock();
        Self::purge_if_expired(&mut guard, request_id, now);
        let state = &mut *guard;

        let Some(entry) = state.requests.get_mut(request_id) else {
            return Ok(FinalizeReply {
                ok: false,
                refunded: 0,
                balance: 0,
                consumed: 0,
                code: CODE_REQUEST_NOT_FOUND.to_string(),
            });
        };

        if matches!(
            entry.status.as_str(),
            "completed" | "killed" | "failed" | "timeout"
        ) {
            let balance = state.balances.get(customer_id).copied().unwrap_or(0);
            return Ok(FinalizeReply {
                ok: true,
                refunded: 0,
                balance,
                consumed: entry.consumed_grains,
                code: CODE_ALREADY_FINALIZED.to_string(),
            });
        }

        let reserved = entry.reserved_grains;
        let consumed = entry.consumed_grains;
        let mut balance = state.balances.get(customer_id).copied().unwrap_or(0);
        let mut refund = 0i64;
        let mut integrity_issue = entry.integrity_issue.clone();

        if consumed > actual_cost_grains {
            refund = consumed - actual_cost_grains;
            balance += refund;
        } else if actual_cost_grains > consumed {
            let extra = actual_cost_grains - consumed;
            if balance >= extra {
                balance -= extra;
                refund = -extra;
            } else {
                refund = -balance;
                balance = 0;
                integrity_issue = Some(ISSUE_UNDERCHARGE_SHORTFALL.to_string());
            }
        }
        state.balances.insert(customer_id.to_string(), balance);

        let held = state.reserved.get(customer_id).copied().unwrap_or(0);
        if held >= reserved {
            state
                .reserved
                .insert(customer_id.to_string(), held - reserved);
        } else {
            state.reserved.insert(customer_id.to_string(), 0);
            integrity_issue = Some(ISSUE_RESERVATION_UNDERFLOW.to_string());
        }

        entry.status = terminal_status.to_string();
        entry.actual_cost_grains = Some(actual_cost_grains);
        entry.refunded_grains = Some(refund);
        entry.finalized_at = Some(now_epoch);
        entry.integrity_issue = integrity_issue;
        entry.expires_at = now_epoch + FINALIZED_TTL_SECS;

        Ok(FinalizeReply {
            ok: true,
            refunded: refund,
            balance,
            consumed,
            code: String::new(),
        })
    }

    async fn balances(&self, customer_id: &str) -> Result<(i64, i64), HotStoreError> {
        let state = self.state.lock();
        Ok((
            state.balances.get(customer_id).copied().unwrap_or(0),
            state.reserved.get(customer_id).copied().unwrap_or(0),
        ))
    }

    async fn get_balance(&self, customer_id: &str) -> Result<Option<i64>, HotStoreError> {
        Ok(self.state.lock().balances.get(customer_id).copied())
    }

    async fn get_reserved(&self, customer_id: &str) -> Result<Option<i64>, HotStoreError> {
        Ok(self.state.lock().reserved.get(customer_id).copied())
    }

    async fn set_balance(&self, customer_id: &str, balance: i64) -> Result<(), HotStoreError> {
        self.state
            .lock()
            .balances
            .insert(customer_id.to_string(), balance);
        Ok(())
    }

    async fn bulk_set_balances(
        &self,
        entries: &[(String, i64)],
        init_reserved: bool,
    ) -> Result<(), HotStoreError> {
        let mut state = self.state.lock();
        for (customer_id, balance) in entries {
            state.balances.insert(customer_id.clone(), *balance);
            if init_reserved {
                state.reserved.insert(customer_id.clone(), 0);
            }
        }
        Ok(())
    }

    async fn set_api_keys(&self, entries: &[(String, String)]) -> Result<(), HotStoreError> {
        let mut state = self.state.lock();
        for (key_hash, tenant_id) in entries {
            state.api_keys.insert(key_hash.clone(), tenant_id.clone());
        }
        Ok(())
    }

    async fn tenant_for_api_key(
        &self,
        key_hash: &str,
    ) -> Result<Option<String>, HotStoreError> {
        Ok(self.state.lock().api_keys.get(key_hash).cloned())
    }

    async fn request_snapshot(
        &self,
        request_id: &str,
    ) -> Result<Option<RequestSnapshot>, HotStoreError> {
        let mut state = self.state.lock();
        Self::purge_if_expired(&mut state, request_id, self.now());
        Ok(state.requests.get(request_id).map(|entry| RequestSnapshot {
            customer_id: entry.customer_id.clone(),
            reserved_grains: entry.reserved_grains,
            estimated_grains: entry.estimated_grains,
            consumed_grains: entry.consumed_grains,
            tokens_consumed: entry.tokens_consumed,
            status: entry.status.clone(),
            created_at: entry.created_at,
            last_deduction_at: entry.last_deduction_at,
            finalized_at: entry.finalized_at,
            actual_cost_grains: entry.actual_cost_grains,
            refunded_grains: entry.refunded_grains,
            integrity_issue: entry.integrity_issue.clone(),
            metadata: serde_json::from_str(&entry.metadata_json).unwrap_or_default(),
        }))
    }

    async fn ping(&self) -> Result<(), HotStoreError> {
        Ok(())
    }
}
