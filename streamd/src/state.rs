//! Shared application state (spec §1): the handles every edge request
//! needs, plus the lazily-spawned registry of per-stream sequencer actors.

use crate::auth::AuthHook;
use crate::blob::BlobStore;
use crate::config::Config;
use crate::edge::cache::{CachedResponse, ResponseCache};
use crate::edge::coalescer::Coalescer;
use crate::error::AppResult;
use crate::metrics::MetricsSink;
use crate::registry::ProjectRegistry;
use crate::sequencer::{SequencerHandle, StreamKey};
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Arc<dyn ProjectRegistry>,
    pub auth: Arc<dyn AuthHook>,
    pub blob: Arc<dyn BlobStore>,
    pub cache: Arc<ResponseCache>,
    pub coalescer: Arc<Coalescer<CachedResponse>>,
    pub metrics: Arc<dyn MetricsSink>,
    sequencers: Arc<DashMap<StreamKey, SequencerHandle>>,
}

impl AppState {
    pub fn new(
        config: Config,
        registry: Arc<dyn ProjectRegistry>,
        auth: Arc<dyn AuthHook>,
        blob: Arc<dyn BlobStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let coalesce_linger = config.coalesce_linger;
        AppState {
            config,
            registry,
            auth,
            blob,
            cache: Arc::new(ResponseCache::new(100_000)),
            coalescer: Arc::new(Coalescer::new(coalesce_linger)),
            metrics,
            sequencers: Arc::new(DashMap::new()),
        }
    }

    /// Returns the running sequencer for `(project_id, stream_id)`, spawning
    /// one lazily on first access. Concurrent first-accessors race to spawn;
    /// only the winner's actor stays registered in `sequencers`, and the
    /// loser's handle (and its already-spawned but commandless actor task)
    /// is simply dropped.
    pub async fn get_or_spawn(&self, project_id: &str, stream_id: &str) -> AppResult<SequencerHandle> {
        let key = StreamKey { project_id: project_id.to_owned(), stream_id: stream_id.to_owned() };
        if let Some(existing) = self.sequencers.get(&key) {
            return Ok(existing.value().clone());
        }

        let handle = SequencerHandle::spawn(
            key.clone(),
            self.config.data_dir.clone(),
            self.config.clone(),
            Arc::clone(&self.blob),
            Arc::clone(&self.cache) as Arc<dyn crate::sequencer::PreCacheSink>,
            Arc::clone(&self.metrics),
        )?;

        match self.sequencers.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(existing) => Ok(existing.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    pub fn remove_sequencer(&self, project_id: &str, stream_id: &str) {
        let key = StreamKey { project_id: project_id.to_owned(), stream_id: stream_id.to_owned() };
        self.sequencers.remove(&key);
    }
}

/// Default-configured `AppState` for local development and tests: an
/// in-memory project registry, no-auth hook, and filesystem blob store
/// rooted under `config.data_dir`.
pub fn default_state(config: Config) -> AppState {
    let blob_root = config.data_dir.join("segments");
    AppState::new(
        config,
        Arc::new(crate::registry::PermissiveRegistry),
        Arc::new(crate::auth::NullAuth),
        Arc::new(crate::blob::FsBlobStore::new(blob_root)),
        Arc::new(crate::metrics::TracingMetrics),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> Config {
        let dir = tempfile::tempdir().unwrap();
        Config {
            bind_addr: "127.0.0.1:0".to_owned(),
            data_dir: dir.into_path(),
            stream_quota_bytes: 1024 * 1024,
            max_append_bytes: 1024,
            max_read_chunk_bytes: 1024,
            long_poll_timeout: Duration::from_millis(100),
            long_poll_stagger: Duration::from_millis(10),
            segment_max_messages: 10,
            segment_max_bytes: 1024,
            coalesce_sentinel_ttl: Duration::from_millis(100),
            coalesce_linger: Duration::from_millis(10),
            cursor_bucket: Duration::from_secs(1),
            producer_expiry: Duration::from_secs(60),
            cors_origins: vec![],
        }
    }

    #[tokio::test]
    async fn get_or_spawn_returns_the_same_handle_on_repeat_calls() {
        let state = default_state(test_config());
        state.get_or_spawn("proj", "stream-1").await.unwrap();
        state.get_or_spawn("proj", "stream-1").await.unwrap();
        assert_eq!(state.sequencers.len(), 1);
    }

    #[tokio::test]
    async fn remove_sequencer_drops_the_registry_entry() {
        let state = default_state(test_config());
        state.get_or_spawn("proj", "stream-1").await.unwrap();
        state.remove_sequencer("proj", "stream-1");
        assert_eq!(state.sequencers.len(), 0);
    }
}
