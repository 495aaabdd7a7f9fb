//! Full-loop test: durable store seeded through the journal, hot store
//! bootstrapped by the syncer, traffic driven through the ledger, then
//! convergence and integrity verified on both sides.

use std::sync::Arc;

use granary::{
    BufferStrategy, Clock, CustomerRecord, DeductionRequest, FinalizationRequest, HotStore,
    Ledger, MemoryStore, RequestStatus, ReservationRequest, SqliteStore, Syncer, TransactionKind,
    TransactionRecord,
};

async fn seed_customer(durable: &SqliteStore, customer_id: &str, credit: i64) {
    durable
        .insert_customer(CustomerRecord {
            customer_id: customer_id.to_string(),
            tenant_id: "tenant-1".to_string(),
            balance_grains: 0,
            lifetime_spent_grains: 0,
            buffer_strategy: BufferStrategy::Conservative,
            created_at_ms: 1_000,
            updated_at_ms: 1_000,
        })
        .await
        .expect("customer");
    durable
        .apply_adjustment(TransactionRecord {
            transaction_id: format!("tx-credit-{customer_id}"),
            customer_id: customer_id.to_string(),
            amount_grains: credit,
            kind: TransactionKind::StripePayment,
            reference_id: Some("pi_seed".to_string()),
            description: Some("initial top-up".to_string()),
            created_at_ms: 1_500,
        })
        .await
        .expect("credit");
}

#[tokio::test]
async fn bootstrap_traffic_and_integrity_converge() {
    let dir = tempfile::tempdir().expect("tempdir");
    let durable = SqliteStore::new(dir.path().join("granary.sqlite"));
    durable.init().await.expect("init");

    seed_customer(&durable, "cus_1", 100_000_000).await;
    seed_customer(&durable, "cus_2", 250_000).await;
    durable
        .insert_platform_user("tenant-1", "keyhash-1", "active")
        .await
        .expect("user");

    // Bootstrap: the hot projection converges with the store of record.
    let hot = Arc::new(MemoryStore::new());
    let syncer = Syncer::new(hot.clone(), durable.clone());
    assert_eq!(syncer.initialize_hot_store().await.expect("bootstrap"), 2);
    assert_eq!(syncer.sync_api_keys().await.expect("api keys"), 1);
    for (customer_id, expected) in [("cus_1", 100_000_000), ("cus_2", 250_000)] {
        assert_eq!(
            hot.get_balance(customer_id).await.expect("balance"),
            Some(expected)
        );
    }
    assert_eq!(
        hot.tenant_for_api_key("keyhash-1").await.expect("lookup"),
        Some("tenant-1".to_string())
    );

    // Drive one full request through the ledger.
    let ledger = Ledger::open(hot.clone(), durable.clone())
        .await
        .expect("ledger");
    let outcome = ledger
        .check_and_reserve(ReservationRequest {
            customer_id: "cus_1".to_string(),
            request_id: "req_1".to_string(),
            reserved_grains: 60_000,
            estimated_grains: 50_000,
            tenant_id: "tenant-1".to_string(),
            model: Some("helix-1".to_string()),
            provider: Some("acme".to_string()),
            ..Default::default()
        })
        .await
        .expect("reserve");
    assert!(outcome.approved);
    ledger
        .deduct(DeductionRequest {
            customer_id: "cus_1".to_string(),
            request_id: "req_1".to_string(),
            grain_amount: 60_000,
            tokens_consumed: 4_600,
        })
        .await
        .expect("deduct");
    ledger
        .finalize(FinalizationRequest {
            customer_id: "cus_1".to_string(),
            request_id: "req_1".to_string(),
            status: RequestStatus::Completed,
            actual_cost_grains: 55_000,
            prompt_tokens: 1_200,
            completion_tokens: 3_400,
            model: "helix-1".to_string(),
            kill_reason: None,
        })
        .await
        .expect("finalize");
    ledger.close().await;

    // Both sides independently arrive at the same balance, so the sampled
    // integrity check finds nothing to repair.
    assert_eq!(
        hot.get_balance("cus_1").await.expect("balance"),
        Some(100_000_000 - 55_000)
    );
    assert_eq!(
        durable.customer_balance("cus_1").await.expect("balance"),
        100_000_000 - 55_000
    );
    assert_eq!(syncer.verify_integrity(10).await.expect("verify"), 0);

    // Balance still equals the transaction sum after the usage debit.
    let report = durable
        .verify_balance_integrity("cus_1")
        .await
        .expect("integrity");
    assert!(report.ok, "drift: {report:?}");
    assert_eq!(report.transaction_sum_grains, 100_000_000 - 55_000);

    let row = durable
        .request("req_1")
        .await
        .expect("request")
        .expect("row");
    assert_eq!(row.status, RequestStatus::Completed);
    assert_eq!(row.tenant_id, "tenant-1");
    assert_eq!(row.model.as_deref(), Some("helix-1"));

    // An out-of-band support credit drifts the hot store; the incremental
    // sync repairs it without touching in-flight reservations.
    durable
        .apply_adjustment(TransactionRecord {
            transaction_id: "tx-support".to_string(),
            customer_id: "cus_2".to_string(),
            amount_grains: 750_000,
            kind: TransactionKind::AdminAdjustment,
            reference_id: None,
            description: Some("support credit".to_string()),
            created_at_ms: granary::SystemClock.now_epoch_millis(),
        })
        .await
        .expect("credit");
    assert!(syncer.sync_recently_updated().await.expect("sync") >= 1);
    assert_eq!(
        hot.get_balance("cus_2").await.expect("balance"),
        Some(1_000_000)
    );
}
