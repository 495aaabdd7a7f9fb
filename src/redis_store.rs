use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::hot_store::{
    api_key_key, balance_key, request_key, reserved_key, snapshot_from_fields, FinalizeReply,
    HotStore, HotStoreError, ScriptReply, FINALIZED_TTL_SECS, IN_FLIGHT_TTL_SECS,
};
use crate::scripts;
use crate::types::RequestSnapshot;

/// Connect timeout. An unavailable hot store must surface as a fast error
/// to the caller, never a stall on the request path.
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(10);
/// Per-command response timeout.
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(20);
/// Connection pool sized for the hot-path concurrency target.
pub const DEFAULT_POOL_SIZE: usize = 100;

/// Redis-backed [`HotStore`]. The three scripts are compiled once at
/// construction; `redis::Script` invokes them by SHA digest and re-loads
/// the source transparently when the server replies NOSCRIPT. Operations
/// draw from a pool of multiplexed connections, handed out round-robin.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    pool: std::sync::Arc<ConnectionPool>,
    pool_size: usize,
    connection_timeout: Duration,
    response_timeout: Duration,
    check_and_reserve: redis::Script,
    deduct_grains: redis::Script,
    finalize_request: redis::Script,
}

#[derive(Default)]
struct ConnectionPool {
    connections: tokio::sync::OnceCell<Vec<redis::aio::MultiplexedConnection>>,
    cursor: std::sync::atomic::AtomicUsize,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("pool_size", &self.pool_size)
            .field("connection_timeout", &self.connection_timeout)
            .field("response_timeout", &self.response_timeout)
            .finish()
    }
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, HotStoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            pool: std::sync::Arc::new(ConnectionPool::default()),
            pool_size: DEFAULT_POOL_SIZE,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            check_and_reserve: redis::Script::new(scripts::CHECK_AND_RESERVE),
            deduct_grains: redis::Script::new(scripts::DEDUCT_GRAINS),
            finalize_request: redis::Script::new(scripts::FINALIZE_REQUEST),
        })
    }

    pub fn with_timeouts(mut self, connection: Duration, response: Duration) -> Self {
        self.connection_timeout = connection;
        self.response_timeout = response;
        self
    }

    /// Overrides the pool size. Must be called before the first operation;
    /// the pool is built lazily on first use.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    /// Round-robin over the pool. Each handle is a multiplexed connection,
    /// so concurrent callers interleave freely within one handle as well.
    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        let connections = self
            .pool
            .connections
            .get_or_try_init(|| async {
                let mut connections = Vec::with_capacity(self.pool_size);
                for _ in 0..self.pool_size {
                    connections.push(
                        self.client
                            .get_multiplexed_async_connection_with_timeouts(
                                self.response_timeout,
                                self.connection_timeout,
                            )
                            .await?,
                    );
                }
                Ok::<_, redis::RedisError>(connections)
            })
            .await?;
        let index = self
            .pool
            .cursor
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            % connections.len();
        Ok(connections[index].clone())
    }
}

#[async_trait]
impl HotStore for RedisStore {
    async fn check_and_reserve(
        &self,
        customer_id: &str,
        request_id: &str,
        reserved_grains: i64,
        estimated_grains: i64,
        metadata_json: &str,
        now_epoch: i64,
    ) -> Result<ScriptReply, HotStoreError> {
        let mut conn = self.connection().await?;
        let (flag, amount, code): (i64, i64, String) = self
            .check_and_reserve
            .key(balance_key(customer_id))
            .key(reserved_key(customer_id))
            .key(request_key(request_id))
            .arg(reserved_grains)
            .arg(estimated_grains)
            .arg(now_epoch)
            .arg(metadata_json)
            .arg(customer_id)
            .arg(IN_FLIGHT_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;
        Ok(ScriptReply {
            ok: flag == 1,
            amount,
            code,
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
        let mut conn = self.connection().await?;
        let (flag, amount, code): (i64, i64, String) = self
            .deduct_grains
            .key(balance_key(customer_id))
            .key(request_key(request_id))
            .arg(grain_amount)
            .arg(tokens_consumed)
            .arg(now_epoch)
            .invoke_async(&mut conn)
            .await?;
        Ok(ScriptReply {
            ok: flag == 1,
            amount,
            code,
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
        let mut conn = self.connection().await?;
        let (flag, refunded, balance, consumed, code): (i64, i64, i64, i64, String) = self
            .finalize_request
            .key(balance_key(customer_id))
            .key(reserved_key(customer_id))
            .key(request_key(request_id))
            .arg(actual_cost_grains)
            .arg(terminal_status)
            .arg(now_epoch)
            .arg(FINALIZED_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;
        Ok(FinalizeReply {
            ok: flag == 1,
            refunded,
            balance,
            consumed,
            code,
        })
    }

    async fn balances(&self, customer_id: &str) -> Result<(i64, i64), HotStoreError> {
        let mut conn = self.connection().await?;
        let (balance, reserved): (Option<i64>, Option<i64>) = redis::pipe()
            .get(balance_key(customer_id))
            .get(reserved_key(customer_id))
            .query_async(&mut conn)
            .await?;
        Ok((balance.unwrap_or(0), reserved.unwrap_or(0)))
    }

    async fn get_balance(&self, customer_id: &str) -> Result<Option<i64>, HotStoreError> {
        let mut conn = self.connection().await?;
        Ok(conn.get(balance_key(customer_id)).await?)
    }

    async fn get_reserved(&self, customer_id: &str) -> Result<Option<i64>, HotStoreError> {
        let mut conn = self.connection().await?;
        Ok(conn.get(reserved_key(customer_id)).await?)
    }

    async fn set_balance(&self, customer_id: &str, balance: i64) -> Result<(), HotStoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.set(balance_key(customer_id), balance).await?;
        Ok(())
    }

    async fn bulk_set_balances(
        &self,
        entries: &[(String, i64)],
        init_reserved: bool,
    ) -> Result<(), HotStoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        for (customer_id, balance) in entries {
            pipe.set(balance_key(customer_id), *balance);
            if init_reserved {
                pipe.set(reserved_key(customer_id), 0);
            }
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_api_keys(&self, entries: &[(String, String)]) -> Result<(), HotStoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        for (key_hash, tenant_id) in entries {
            pipe.set(api_key_key(key_hash), tenant_id);
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn tenant_for_api_key(
        &self,
        key_hash: &str,
    ) -> Result<Option<String>, HotStoreError> {
        let mut conn = self.connection().await?;
        Ok(conn.get(api_key_key(key_hash)).await?)
    }

    async fn request_snapshot(
        &self,
        request_id: &str,
    ) -> Result<Option<RequestSnapshot>, HotStoreError> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = conn.hgetall(request_key(request_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(snapshot_from_fields(fields)))
    }

    async fn ping(&self) -> Result<(), HotStoreError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

// Exercised against a live server only when GRANARY_REDIS_URL (or
// REDIS_URL) is set; silently skipped otherwise.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        CODE_INSUFFICIENT_BALANCE, CODE_REQUEST_EXISTS, ISSUE_UNDERCHARGE_SHORTFALL,
    };

    fn env_nonempty(key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    fn test_store() -> Option<RedisStore> {
        let url = env_nonempty("GRANARY_REDIS_URL").or_else(|| env_nonempty("REDIS_URL"))?;
        // Generous timeouts and a small pool: CI redis is not a
        // production hot store.
        RedisStore::new(url).ok().map(|store| {
            store
                .with_timeouts(Duration::from_secs(1), Duration::from_secs(1))
                .with_pool_size(2)
        })
    }

    fn unique(prefix: &str) -> String {
        format!("{prefix}-{}", uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn scripts_run_end_to_end_against_redis() {
        let Some(store) = test_store() else {
            return;
        };
        store.ping().await.expect("ping");

        let customer = unique("cus");
        let request = unique("req");
        store.set_balance(&customer, 100_000).await.expect("seed");

        let reply = store
            .check_and_reserve(&customer, &request, 60_000, 50_000, r#"{"model":"helix-1"}"#, 1)
            .await
            .expect("reserve");
        assert!(reply.ok, "unexpected rejection: {}", reply.code);
        assert_eq!(reply.amount, 40_000);

        let dup = store
            .check_and_reserve(&customer, &request, 1_000, 1_000, "{}", 2)
            .await
            .expect("reserve");
        assert!(!dup.ok);
        assert_eq!(dup.code, CODE_REQUEST_EXISTS);

        let deduct = store
            .deduct(&customer, &request, 20_000, 500, 3)
            .await
            .expect("deduct");
        assert!(deduct.ok);
        assert_eq!(deduct.amount, 80_000);

        let snapshot = store
            .request_snapshot(&request)
            .await
            .expect("snapshot")
            .expect("record present");
        assert_eq!(snapshot.status, "streaming");
        assert_eq!(snapshot.consumed_grains, 20_000);
        assert_eq!(snapshot.metadata.get("model").map(String::as_str), Some("helix-1"));

        let finalized = store
            .finalize(&customer, &request, 15_000, "completed", 4)
            .await
            .expect("finalize");
        assert!(finalized.ok);
        assert_eq!(finalized.refunded, 5_000);
        assert_eq!(finalized.balance, 85_000);
        assert_eq!(finalized.consumed, 20_000);

        let replay = store
            .finalize(&customer, &request, 999_999, "failed", 5)
            .await
            .expect("finalize replay");
        assert!(replay.ok);
        assert_eq!(replay.refunded, 0);
        assert_eq!(replay.balance, 85_000);

        let (balance, reserved) = store.balances(&customer).await.expect("balances");
        assert_eq!(balance, 85_000);
        assert_eq!(reserved, 0);
    }

    #[tokio::test]
    async fn undercharge_shortfall_clamps_and_flags() {
        let Some(store) = test_store() else {
            return;
        };

        let customer = unique("cus");
        let request = unique("req");
        store.set_balance(&customer, 5_000).await.expect("seed");

        let reply = store
            .check_and_reserve(&customer, &request, 5_000, 5_000, "{}", 1)
            .await
            .expect("reserve");
        assert!(reply.ok);

        let deduct = store
            .deduct(&customer, &request, 5_000, 100, 2)
            .await
            .expect("deduct");
        assert!(deduct.ok);
        assert_eq!(deduct.amount, 0);

        let over = store
            .deduct(&customer, &request, 1, 1, 3)
            .await
            .expect("deduct");
        assert!(!over.ok);
        assert_eq!(over.code, CODE_INSUFFICIENT_BALANCE);

        let finalized = store
            .finalize(&customer, &request, 6_000, "completed", 4)
            .await
            .expect("finalize");
        assert!(finalized.ok);
        assert_eq!(finalized.balance, 0);

        let snapshot = store
            .request_snapshot(&request)
            .await
            .expect("snapshot")
            .expect("record present");
        assert_eq!(
            snapshot.integrity_issue.as_deref(),
            Some(ISSUE_UNDERCHARGE_SHORTFALL)
        );
    }
}
