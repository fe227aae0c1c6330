//! Cached HTTP fetcher for small prompt/phoneme template assets.
//!
//! Entries live for 15 minutes. From 12 minutes on the cached body is still
//! served but a background refresh is kicked off, so hot templates never pay
//! the fetch latency. Cold misses are single-flight: concurrent callers for
//! the same URL coalesce into one upstream request.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};

pub const TEMPLATE_TTL: Duration = Duration::from_secs(15 * 60);
pub const TEMPLATE_EARLY_REFRESH: Duration = Duration::from_secs(12 * 60);
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Seam over the actual HTTP GET, so tests can count upstream traffic.
#[async_trait]
pub trait TemplateFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct HttpTemplateFetcher {
    client: reqwest::Client,
}

impl HttpTemplateFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("jawabu-server/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CoreError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TemplateFetcher for HttpTemplateFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::UpstreamUnavailable(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(CoreError::UpstreamUnavailable(format!(
                "{url}: HTTP {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| CoreError::UpstreamUnavailable(format!("{url}: {e}")))?;
        Ok(body.to_vec())
    }
}

struct Entry {
    body: Arc<Vec<u8>>,
    fetched_at: Instant,
}

pub struct TemplateCache {
    fetcher: Arc<dyn TemplateFetcher>,
    entries: RwLock<HashMap<String, Entry>>,
    // Per-URL gate so a cold miss performs one upstream request.
    flights: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    refreshing: SyncMutex<HashSet<String>>,
    ttl: Duration,
    early_refresh: Duration,
}

impl TemplateCache {
    pub fn new(fetcher: Arc<dyn TemplateFetcher>) -> Self {
        Self::with_policy(fetcher, TEMPLATE_TTL, TEMPLATE_EARLY_REFRESH)
    }

    pub fn with_policy(fetcher: Arc<dyn TemplateFetcher>, ttl: Duration, early: Duration) -> Self {
        Self {
            fetcher,
            entries: RwLock::new(HashMap::new()),
            flights: AsyncMutex::new(HashMap::new()),
            refreshing: SyncMutex::new(HashSet::new()),
            ttl,
            early_refresh: early,
        }
    }

    /// Fetch a template body, honouring the cache policy.
    pub async fn fetch(self: &Arc<Self>, url: &str) -> Result<Arc<Vec<u8>>> {
        let now = Instant::now();
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(url) {
                let age = now.duration_since(entry.fetched_at);
                if age < self.early_refresh {
                    return Ok(entry.body.clone());
                }
                if age < self.ttl {
                    self.spawn_refresh(url);
                    return Ok(entry.body.clone());
                }
            }
        }
        self.fetch_slow(url).await
    }

    /// UTF-8 convenience wrapper; templates are trimmed of edge whitespace.
    pub async fn fetch_text(self: &Arc<Self>, url: &str) -> Result<String> {
        let body = self.fetch(url).await?;
        Ok(String::from_utf8_lossy(&body).trim().to_string())
    }

    async fn fetch_slow(self: &Arc<Self>, url: &str) -> Result<Arc<Vec<u8>>> {
        let flight = {
            let mut flights = self.flights.lock().await;
            flights
                .entry(url.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let _guard = flight.lock().await;

        // Another caller may have landed the body while we queued.
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(url) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.body.clone());
                }
            }
        }

        match self.fetcher.fetch(url).await {
            Ok(body) => {
                let body = Arc::new(body);
                self.insert(url, body.clone());
                info!(url, size = body.len(), "Fetched template");
                Ok(body)
            }
            Err(err) => {
                let stale = self.entries.read().get(url).map(|e| e.body.clone());
                match stale {
                    Some(body) => {
                        warn!(url, error = %err, "Template fetch failed, serving stale body");
                        Ok(body)
                    }
                    None => Err(err),
                }
            }
        }
    }

    fn spawn_refresh(self: &Arc<Self>, url: &str) {
        {
            let mut refreshing = self.refreshing.lock();
            if !refreshing.insert(url.to_string()) {
                return;
            }
        }
        let cache = Arc::clone(self);
        let url = url.to_string();
        tokio::spawn(async move {
            debug!(url, "Early-refreshing template");
            match cache.fetcher.fetch(&url).await {
                Ok(body) => cache.insert(&url, Arc::new(body)),
                Err(err) => warn!(url, error = %err, "Template early refresh failed"),
            }
            cache.refreshing.lock().remove(&url);
        });
    }

    fn insert(&self, url: &str, body: Arc<Vec<u8>>) {
        self.entries.write().insert(
            url.to_string(),
            Entry {
                body,
                fetched_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: AtomicUsize,
        fail_after: Option<usize>,
    }

    impl CountingFetcher {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_after: None,
            }
        }

        fn failing_after(n: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_after: Some(n),
            }
        }

        fn count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TemplateFetcher for CountingFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            // Simulated network latency so concurrent callers overlap.
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some(limit) = self.fail_after {
                if call > limit {
                    return Err(CoreError::UpstreamUnavailable(url.to_string()));
                }
            }
            Ok(format!("{url}#{call}").into_bytes())
        }
    }

    fn cache_with(fetcher: Arc<CountingFetcher>) -> Arc<TemplateCache> {
        Arc::new(TemplateCache::new(fetcher))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_cold_fetches_coalesce_into_one_request() {
        let fetcher = Arc::new(CountingFetcher::new());
        let cache = cache_with(fetcher.clone());

        let a = cache.clone();
        let b = cache.clone();
        let (ra, rb) = tokio::join!(
            async move { a.fetch("https://x/p.txt").await.unwrap() },
            async move { b.fetch("https://x/p.txt").await.unwrap() },
        );

        assert_eq!(fetcher.count(), 1);
        assert_eq!(ra, rb);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_entry_is_served_without_upstream_traffic() {
        let fetcher = Arc::new(CountingFetcher::new());
        let cache = cache_with(fetcher.clone());

        let first = cache.fetch("https://x/p.txt").await.unwrap();
        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        let second = cache.fetch("https://x/p.txt").await.unwrap();

        assert_eq!(fetcher.count(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn early_window_serves_stale_and_refreshes_in_background() {
        let fetcher = Arc::new(CountingFetcher::new());
        let cache = cache_with(fetcher.clone());

        let first = cache.fetch("https://x/p.txt").await.unwrap();
        tokio::time::advance(Duration::from_secs(13 * 60)).await;

        let second = cache.fetch("https://x/p.txt").await.unwrap();
        assert_eq!(second, first, "early window must serve the cached body");

        // Let the background refresh land.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.count(), 2);

        let third = cache.fetch("https://x/p.txt").await.unwrap();
        assert_ne!(third, first);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_refetched_synchronously() {
        let fetcher = Arc::new(CountingFetcher::new());
        let cache = cache_with(fetcher.clone());

        let first = cache.fetch("https://x/p.txt").await.unwrap();
        tokio::time::advance(Duration::from_secs(16 * 60)).await;
        let second = cache.fetch("https://x/p.txt").await.unwrap();

        assert_eq!(fetcher.count(), 2);
        assert_ne!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_body_survives_upstream_failure() {
        let fetcher = Arc::new(CountingFetcher::failing_after(1));
        let cache = cache_with(fetcher.clone());

        let first = cache.fetch("https://x/p.txt").await.unwrap();
        tokio::time::advance(Duration::from_secs(16 * 60)).await;
        let second = cache.fetch("https://x/p.txt").await.unwrap();

        assert_eq!(second, first);
    }

    #[tokio::test(start_paused = true)]
    async fn cold_miss_with_failing_upstream_errors() {
        let fetcher = Arc::new(CountingFetcher::failing_after(0));
        let cache = cache_with(fetcher);

        let err = cache.fetch("https://x/p.txt").await.unwrap_err();
        assert!(matches!(err, CoreError::UpstreamUnavailable(_)));
    }
}
