//! Process configuration, read once at startup.

use std::net::SocketAddr;
use std::time::Duration;

/// Gateway configuration from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Persistent mode wires Postgres + Redis + the real provider; dev mode
    /// wires the in-memory twins and the fake provider.
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub blob_dir: String,
    pub blob_base_url: String,
    pub worker_concurrency: usize,
    pub global_rpm: u32,
    pub global_concurrency: u32,
    pub max_attempts: u32,
    pub endpoint_fallback: bool,
    pub provider_timeout: Duration,
    /// Dev-mode only: seed a tenant authenticating with this key.
    pub dev_api_key: Option<String>,
    /// Dev-mode only: seed one fake-provider credential.
    pub gemini_api_key: Option<String>,
    /// Optional base-URL overrides for the endpoint registry.
    pub gemini_primary_url: Option<String>,
    pub gemini_proxy_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = env_or("BIND_ADDR", "0.0.0.0:8080").parse()?;
        Ok(Self {
            bind_addr,
            use_persistent_stores: env_or("USE_PERSISTENT_STORES", "false")
                .parse()
                .unwrap_or(false),
            database_url: std::env::var("DATABASE_URL").ok(),
            redis_url: env_or("REDIS_URL", "redis://localhost:6379"),
            blob_dir: env_or("BLOB_DIR", "./data/blobs"),
            blob_base_url: env_or("BLOB_BASE_URL", "http://localhost:8080/blobs"),
            worker_concurrency: env_or("WORKER_CONCURRENCY", "50").parse().unwrap_or(50),
            global_rpm: env_or("GLOBAL_RPM", "600").parse().unwrap_or(600),
            global_concurrency: env_or("GLOBAL_CONCURRENCY", "100").parse().unwrap_or(100),
            max_attempts: env_or("JOB_MAX_ATTEMPTS", "4").parse().unwrap_or(4),
            endpoint_fallback: env_or("ENDPOINT_FALLBACK", "true").parse().unwrap_or(true),
            provider_timeout: Duration::from_secs(
                env_or("PROVIDER_TIMEOUT_SECS", "120").parse().unwrap_or(120),
            ),
            dev_api_key: std::env::var("PIXGATE_DEV_API_KEY").ok(),
            gemini_api_key: std::env::var("GEMINI_API_KEY").ok(),
            gemini_primary_url: std::env::var("GEMINI_PRIMARY_URL").ok(),
            gemini_proxy_url: std::env::var("GEMINI_PROXY_URL").ok(),
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}
