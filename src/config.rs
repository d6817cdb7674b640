//! Bootstrap configuration (§C9), read from the environment rather than a
//! file: the relay has one deployment-wide set of knobs, not per-tenant
//! configuration (that lives in the `domains`/`configs` tables, C6).

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub database_url: String,
    pub sync_interval: Duration,
    pub log_verbosity: u64,
    pub location_fallback_path: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env::var("RELAY_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url: env::var("RELAY_DATABASE_URL")
                .unwrap_or_else(|_| "mysql://root@127.0.0.1:3306/overlay_relay".to_string()),
            sync_interval: Duration::from_secs(
                env::var("RELAY_SYNC_INTERVAL_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(30),
            ),
            log_verbosity: env::var("RELAY_LOG_VERBOSITY").ok().and_then(|v| v.parse().ok()).unwrap_or(2),
            location_fallback_path: env::var("RELAY_LOCATION_FALLBACK_PATH").ok(),
        }
    }
}
