//! Edge response cache (spec §4.8): a content-addressed key-value cache
//! keyed by the full request URL, backed by `moka`'s async cache so
//! entries carry their own size-aware eviction without a hand-rolled LRU.

use crate::sequencer::PreCacheSink;
use async_trait::async_trait;
use moka::future::Cache;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub body: Vec<u8>,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub etag: String,
}

impl CachedResponse {
    pub fn new(body: Vec<u8>, content_type: String, headers: Vec<(String, String)>) -> Self {
        let etag = compute_etag(&body);
        CachedResponse { body, content_type, headers, etag }
    }
}

fn compute_etag(body: &[u8]) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    body.hash(&mut hasher);
    format!("\"{:016x}\"", hasher.finish())
}

/// Inputs to the cacheability decision (spec §4.8): `GET`, not event
/// stream, no debug header, status 200, no `no-store`, and either not at
/// tail or long-polling.
#[derive(Debug, Clone, Copy)]
pub struct Cacheability {
    pub is_get: bool,
    pub is_event_stream: bool,
    pub has_debug_header: bool,
    pub status_is_200: bool,
    pub no_store: bool,
    pub up_to_date: bool,
    pub is_long_poll: bool,
}

impl Cacheability {
    pub fn cacheable(&self) -> bool {
        self.is_get
            && !self.is_event_stream
            && !self.has_debug_header
            && self.status_is_200
            && !self.no_store
            && (!self.up_to_date || self.is_long_poll)
    }
}

pub struct ResponseCache {
    entries: Cache<String, Arc<CachedResponse>>,
    sentinels: Cache<String, ()>,
}

impl ResponseCache {
    pub fn new(max_capacity: u64) -> Self {
        ResponseCache {
            entries: Cache::builder().max_capacity(max_capacity).build(),
            sentinels: Cache::builder().time_to_live(Duration::from_secs(30)).build(),
        }
    }

    pub async fn get(&self, url: &str) -> Option<Arc<CachedResponse>> {
        self.entries.get(url).await
    }

    pub async fn put(&self, url: String, response: CachedResponse) {
        self.entries.insert(url, Arc::new(response)).await;
    }

    pub async fn invalidate(&self, url: &str) {
        self.entries.invalidate(url).await;
    }

    /// Reader-key guard (spec §4.8): a stream with a `readerKey` must never
    /// be cached under a URL that omits `?rk=`.
    pub fn guarded_by_reader_key(reader_key: Option<&str>, request_has_rk: bool) -> bool {
        reader_key.is_some() && !request_has_rk
    }

    /// True if a sentinel was already present (the caller lost the race);
    /// false if this call planted the sentinel and is now the fetch winner.
    pub async fn try_claim_sentinel(&self, url: &str) -> bool {
        let key = sentinel_key(url);
        if self.sentinels.get(&key).await.is_some() {
            return true;
        }
        self.sentinels.insert(key, ()).await;
        false
    }

    pub async fn sentinel_present(&self, url: &str) -> bool {
        self.sentinels.get(&sentinel_key(url)).await.is_some()
    }
}

fn sentinel_key(url: &str) -> String {
    format!("{url}?__sentinel=1")
}

#[async_trait]
impl PreCacheSink for ResponseCache {
    async fn store(&self, url: &str, body: Vec<u8>, content_type: String, headers: Vec<(String, String)>) {
        self.put(url.to_owned(), CachedResponse::new(body, content_type, headers)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let cache = ResponseCache::new(100);
        cache.put("u1".into(), CachedResponse::new(b"hi".to_vec(), "text/plain".into(), vec![])).await;
        let got = cache.get("u1").await.expect("entry present");
        assert_eq!(got.body, b"hi");
        assert!(got.etag.starts_with('"') && got.etag.ends_with('"'));
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = ResponseCache::new(100);
        cache.put("u1".into(), CachedResponse::new(b"hi".to_vec(), "text/plain".into(), vec![])).await;
        cache.invalidate("u1").await;
        assert!(cache.get("u1").await.is_none());
    }

    #[tokio::test]
    async fn sentinel_claim_is_exclusive() {
        let cache = ResponseCache::new(100);
        assert!(!cache.try_claim_sentinel("u1").await, "first claim should win");
        assert!(cache.try_claim_sentinel("u1").await, "second claim should see it occupied");
    }

    #[test]
    fn plain_get_at_tail_is_not_cacheable() {
        let c = Cacheability {
            is_get: true,
            is_event_stream: false,
            has_debug_header: false,
            status_is_200: true,
            no_store: false,
            up_to_date: true,
            is_long_poll: false,
        };
        assert!(!c.cacheable());
    }

    #[test]
    fn long_poll_at_tail_is_cacheable() {
        let c = Cacheability {
            is_get: true,
            is_event_stream: false,
            has_debug_header: false,
            status_is_200: true,
            no_store: false,
            up_to_date: true,
            is_long_poll: true,
        };
        assert!(c.cacheable());
    }

    #[test]
    fn reader_key_guard_blocks_unkeyed_urls() {
        assert!(ResponseCache::guarded_by_reader_key(Some("rk1"), false));
        assert!(!ResponseCache::guarded_by_reader_key(Some("rk1"), true));
        assert!(!ResponseCache::guarded_by_reader_key(None, false));
    }
}
