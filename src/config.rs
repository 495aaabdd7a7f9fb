use std::path::PathBuf;
use std::time::Duration;

/// Process configuration resolved from the environment. Every knob has a
/// documented default; empty values are treated as unset.
#[derive(Clone, Debug)]
pub struct LedgerConfig {
    /// `GRANARY_REDIS_ADDR` (default `127.0.0.1:6379`), combined with the
    /// optional `GRANARY_REDIS_PASSWORD` into a redis URL.
    pub redis_url: String,
    /// `GRANARY_REDIS_POOL_SIZE` (default 100).
    pub redis_pool_size: usize,
    /// `GRANARY_DB_PATH` (default `granary.db`).
    pub database_path: PathBuf,
    /// `GRANARY_LOG_LEVEL` (default `info`).
    pub log_level: String,
    /// `GRANARY_ENV` (default `development`).
    pub environment: String,
    /// `GRANARY_SYNC_INTERVAL_SECS` (default 300).
    pub sync_interval: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            redis_url: compose_redis_url("127.0.0.1:6379", None),
            redis_pool_size: 100,
            database_path: PathBuf::from("granary.db"),
            log_level: "info".to_string(),
            environment: "development".to_string(),
            sync_interval: Duration::from_secs(300),
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let addr =
            env_nonempty("GRANARY_REDIS_ADDR").unwrap_or_else(|| "127.0.0.1:6379".to_string());
        let password = env_nonempty("GRANARY_REDIS_PASSWORD");

        Self {
            redis_url: compose_redis_url(&addr, password.as_deref()),
            redis_pool_size: env_nonempty("GRANARY_REDIS_POOL_SIZE")
                .and_then(|raw| raw.parse::<usize>().ok())
                .filter(|size| *size > 0)
                .unwrap_or(defaults.redis_pool_size),
            database_path: env_nonempty("GRANARY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            log_level: env_nonempty("GRANARY_LOG_LEVEL").unwrap_or(defaults.log_level),
            environment: env_nonempty("GRANARY_ENV").unwrap_or(defaults.environment),
            sync_interval: env_nonempty("GRANARY_SYNC_INTERVAL_SECS")
                .and_then(|raw| raw.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.sync_interval),
        }
    }
}

/// Builds a redis URL from a bare `host:port` address or passes a full URL
/// through, injecting the password as URL userinfo when present.
pub fn compose_redis_url(addr: &str, password: Option<&str>) -> String {
    let stripped = addr
        .strip_prefix("redis://")
        .or_else(|| addr.strip_prefix("rediss://"));
    let (scheme, host) = match stripped {
        Some(rest) if addr.starts_with("rediss://") => ("rediss", rest),
        Some(rest) => ("redis", rest),
        None => ("redis", addr),
    };
    match password {
        Some(password) if !host.contains('@') => format!("{scheme}://:{password}@{host}"),
        _ => format!("{scheme}://{host}"),
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
