//! Environment-loaded configuration (SPEC_FULL §1a ambient stack).
//!
//! Mirrors the teacher's `main.rs` style of `env::var(...).unwrap_or_else`
//! defaults, just gathered into one struct so the rest of the crate is not
//! reading the environment ad hoc.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub stream_quota_bytes: u64,
    pub max_append_bytes: usize,
    pub max_read_chunk_bytes: usize,
    pub long_poll_timeout: Duration,
    pub long_poll_stagger: Duration,
    pub segment_max_messages: u64,
    pub segment_max_bytes: u64,
    pub coalesce_sentinel_ttl: Duration,
    pub coalesce_linger: Duration,
    pub cursor_bucket: Duration,
    pub producer_expiry: Duration,
    pub cors_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            bind_addr: env_string("BIND_ADDR", "0.0.0.0:8080"),
            data_dir: PathBuf::from(env_string("DATA_DIR", "./data")),
            stream_quota_bytes: env_u64("STREAM_QUOTA_BYTES", 10 * 1024 * 1024 * 1024),
            max_append_bytes: env_u64("MAX_APPEND_BYTES", 8 * 1024 * 1024) as usize,
            max_read_chunk_bytes: env_u64("MAX_READ_CHUNK_BYTES", 256 * 1024) as usize,
            long_poll_timeout: Duration::from_millis(env_u64("LONG_POLL_TIMEOUT_MS", 4000)),
            long_poll_stagger: Duration::from_millis(env_u64("LONG_POLL_STAGGER_MS", 100)),
            segment_max_messages: env_u64("SEGMENT_MAX_MESSAGES", 1000),
            segment_max_bytes: env_u64("SEGMENT_MAX_BYTES", 8 * 1024 * 1024),
            coalesce_sentinel_ttl: Duration::from_millis(env_u64("COALESCE_SENTINEL_TTL_MS", 30_000)),
            coalesce_linger: Duration::from_millis(env_u64("COALESCE_LINGER_MS", 200)),
            cursor_bucket: Duration::from_secs(env_u64("CURSOR_BUCKET_SECS", 20)),
            producer_expiry: Duration::from_secs(env_u64("PRODUCER_EXPIRY_SECS", 7 * 24 * 3600)),
            cors_origins: env_string("CORS_ORIGINS", "")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    /// Hot-log writes are rejected once usage crosses this fraction of quota.
    pub fn storage_reject_threshold(&self) -> u64 {
        (self.stream_quota_bytes as f64 * 0.9) as u64
    }

    /// The subset of config the stream engine needs, so callers building an
    /// `engine::CreateRequest`/`AppendRequest` don't hand-assemble it.
    pub fn engine_limits(&self) -> crate::engine::Limits {
        crate::engine::Limits {
            max_append_bytes: self.max_append_bytes,
            quota_reject_bytes: self.storage_reject_threshold(),
            producer_expiry_secs: self.producer_expiry.as_secs() as i64,
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
