use std::time::Duration;

use axum::http::Method;

use crate::cache::{DEFAULT_KEY_PREFIX, DEFAULT_TTL};
use crate::fingerprint::DEFAULT_INCLUDE_HEADERS;
use crate::store::memory::DEFAULT_MAX_ENTRIES;
use crate::store::tiered::DEFAULT_LOCAL_TTL;

pub const DEFAULT_HEADER_NAME: &str = "Idempotency-Key";
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// Which record store backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
    Tiered,
}

impl StoreBackend {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "local" => Some(Self::Memory),
            "redis" | "distributed" => Some(Self::Redis),
            "tiered" | "hybrid" => Some(Self::Tiered),
            _ => None,
        }
    }
}

/// Title and detail returned to the client for one rejection kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub title: String,
    pub detail: String,
}

impl ErrorMessage {
    pub fn new(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCatalog {
    pub missing_header: ErrorMessage,
    pub reuse: ErrorMessage,
    pub retried: ErrorMessage,
}

impl Default for ErrorCatalog {
    fn default() -> Self {
        Self {
            missing_header: ErrorMessage::new(
                "Idempotency-Key is missing",
                "This operation is idempotent and it requires correct usage of Idempotency Key",
            ),
            reuse: ErrorMessage::new(
                "Idempotency-Key is already used",
                "This operation is idempotent and it requires correct usage of Idempotency Key. \
                 Idempotency Key MUST not be reused across different payloads of this operation.",
            ),
            retried: ErrorMessage::new(
                "A request is outstanding for this Idempotency-Key",
                "A request with the same Idempotency-Key for the same operation is being processed or is outstanding.",
            ),
        }
    }
}

/// Settings the decision engine and HTTP adapter read.
#[derive(Debug, Clone)]
pub struct IdempotencyOptions {
    pub header_name: String,
    pub ttl: Duration,
    pub include_headers: Vec<String>,
    pub methods: Vec<Method>,
    pub max_body_bytes: usize,
    pub key_prefix: String,
    pub lock_timeout: Duration,
    pub errors: ErrorCatalog,
}

impl Default for IdempotencyOptions {
    fn default() -> Self {
        Self {
            header_name: DEFAULT_HEADER_NAME.to_string(),
            ttl: DEFAULT_TTL,
            include_headers: DEFAULT_INCLUDE_HEADERS.iter().map(|h| h.to_string()).collect(),
            methods: vec![Method::POST, Method::PATCH],
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            errors: ErrorCatalog::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub store: StoreBackend,
    pub redis_url: String,
    pub memory_max_entries: usize,
    /// Local-tier lifetime for the tiered store.
    pub local_ttl: Duration,
    /// Interval of the expired-record sweep for in-process stores.
    pub sweep_interval: Duration,
    pub idempotency: IdempotencyOptions,
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let store = match std::env::var("IDEMPOTENCY_STORE") {
        Ok(raw) => StoreBackend::parse(&raw).ok_or_else(|| {
            anyhow::anyhow!("IDEMPOTENCY_STORE must be one of memory, redis, tiered (got '{}')", raw)
        })?,
        Err(_) => StoreBackend::Memory,
    };

    let defaults = IdempotencyOptions::default();
    let idempotency = IdempotencyOptions {
        header_name: std::env::var("IDEMPOTENCY_HEADER")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or(defaults.header_name),
        ttl: env_u64("IDEMPOTENCY_TTL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.ttl),
        include_headers: std::env::var("IDEMPOTENCY_INCLUDE_HEADERS")
            .map(|v| parse_list(&v))
            .unwrap_or(defaults.include_headers),
        methods: std::env::var("IDEMPOTENCY_METHODS")
            .ok()
            .map(|v| parse_methods(&v))
            .filter(|m| !m.is_empty())
            .unwrap_or(defaults.methods),
        max_body_bytes: env_u64("IDEMPOTENCY_MAX_BODY_BYTES")
            .map(|v| v as usize)
            .unwrap_or(defaults.max_body_bytes),
        key_prefix: std::env::var("IDEMPOTENCY_KEY_PREFIX").unwrap_or(defaults.key_prefix),
        lock_timeout: env_u64("IDEMPOTENCY_LOCK_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.lock_timeout),
        errors: defaults.errors,
    };

    Ok(Config {
        port: std::env::var("IDEMPOTENCY_PORT")
            .unwrap_or_else(|_| "8080".into())
            .parse()
            .unwrap_or(8080),
        store,
        redis_url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
        memory_max_entries: env_u64("IDEMPOTENCY_MEMORY_MAX_ENTRIES")
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_ENTRIES),
        local_ttl: env_u64("IDEMPOTENCY_LOCAL_TTL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_LOCAL_TTL),
        sweep_interval: Duration::from_secs(env_u64("IDEMPOTENCY_SWEEP_SECS").unwrap_or(60).max(1)),
        idempotency,
    })
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Comma-separated list, trimmed, empties dropped.
fn parse_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_methods(s: &str) -> Vec<Method> {
    parse_list(s)
        .iter()
        .filter_map(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()).ok())
        .collect()
}
