//! In-process request coalescer (spec §4.9, point 1): a `url → Future`
//! map so concurrent requests for the same URL share one fetch.
//!
//! Modeled per spec §9's re-architecting note as `map<string, Future<Result>>`
//! — here a `DashMap` of `futures_util::future::Shared` futures. The
//! winner's future resolves for every waiter; a resolved entry lingers 200
//! ms so near-simultaneous late arrivals still find it before the edge
//! cache write lands, and non-cacheable entries are dropped immediately.

use crate::error::AppError;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const MAX_ENTRIES: usize = 100_000;

type SharedFetch<T> = Shared<BoxFuture<'static, Result<Arc<T>, AppError>>>;

pub struct Coalescer<T: Send + Sync + 'static> {
    inflight: Arc<DashMap<String, SharedFetch<T>>>,
    linger: Duration,
}

impl<T: Send + Sync + 'static> Coalescer<T> {
    pub fn new(linger: Duration) -> Self {
        Coalescer { inflight: Arc::new(DashMap::new()), linger }
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    /// Runs `fetch` once per distinct `url` among concurrent callers; every
    /// caller gets the same result. `cacheable` is evaluated against the
    /// resolved value to decide whether the entry lingers or is dropped
    /// immediately once the fetch completes.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        url: String,
        cacheable: impl FnOnce(&T) -> bool + Send + 'static,
        fetch: F,
    ) -> Result<Arc<T>, AppError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, AppError>> + Send + 'static,
    {
        if let Some(existing) = self.inflight.get(&url) {
            let fut = existing.value().clone();
            drop(existing);
            return fut.await;
        }

        if self.inflight.len() >= MAX_ENTRIES {
            // At capacity: run uncoalesced rather than reject the request.
            return fetch().await.map(Arc::new);
        }

        let boxed: BoxFuture<'static, Result<Arc<T>, AppError>> =
            async move { fetch().await.map(Arc::new) }.boxed();
        let shared = boxed.shared();

        match self.inflight.entry(url.clone()) {
            MapEntry::Occupied(existing) => {
                let fut = existing.get().clone();
                drop(existing);
                return fut.await;
            }
            MapEntry::Vacant(slot) => {
                slot.insert(shared.clone());
            }
        }

        let result = shared.await;
        let cacheable = result.as_ref().map(|r| cacheable(r)).unwrap_or(false);
        self.finish(url, cacheable);
        result
    }

    fn finish(&self, url: String, cacheable: bool) {
        if !cacheable {
            self.inflight.remove(&url);
            return;
        }
        let linger = self.linger;
        let map = Arc::clone(&self.inflight);
        tokio::spawn(async move {
            sleep(linger).await;
            map.remove(&url);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let coalescer = Arc::new(Coalescer::<i32>::new(Duration::from_millis(50)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = coalescer.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                c.get_or_fetch(
                    "u1".to_owned(),
                    |_| true,
                    move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok::<_, AppError>(42)
                        }
                    },
                )
                .await
            }));
        }
        for h in handles {
            assert_eq!(*h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_cacheable_result_is_evicted_immediately() {
        let coalescer = Coalescer::<i32>::new(Duration::from_millis(500));
        coalescer
            .get_or_fetch("u1".to_owned(), |_| false, || async { Ok::<_, AppError>(7) })
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(coalescer.len(), 0);
    }
}
