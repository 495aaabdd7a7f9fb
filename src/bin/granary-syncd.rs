use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use granary::{LedgerConfig, RedisStore, SqliteStore, Syncer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = LedgerConfig::from_env();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(
        environment = %config.environment,
        database = %config.database_path.display(),
        "starting granary-syncd"
    );

    let durable = SqliteStore::new(&config.database_path);
    durable.init().await?;

    let hot = Arc::new(RedisStore::new(&config.redis_url)?.with_pool_size(config.redis_pool_size));
    let syncer = Arc::new(Syncer::new(hot, durable));

    let customers = syncer.initialize_hot_store().await?;
    let api_keys = syncer.sync_api_keys().await?;
    tracing::info!(customers, api_keys, "hot store bootstrapped");

    let periodic = syncer.clone().start_periodic(config.sync_interval);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    periodic.stop().await;
    Ok(())
}
