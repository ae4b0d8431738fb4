//! URL-keyed segment cache with differential sync.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::MonitorError;
use crate::http::Fetcher;
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Read access to the segment cache, handed to inspectors after each sync.
pub trait SegmentStore: Send + Sync {
    fn exists(&self, url: &Url) -> bool;
    fn load(&self, url: &Url) -> Option<Bytes>;
}

struct SegmentEntry {
    data: Bytes,
    pending_delete: bool,
}

/// The mutable cache owned by a monitor's poll loop.
///
/// `sync` follows a two-phase mark/sweep: every entry is first marked
/// pending-delete, entries named by the incoming URL list are unmarked or
/// fetched, and only after every fetch has succeeded are the new entries
/// inserted and the still-marked ones evicted. Any fetch failure leaves the
/// cache exactly as it was. `sync` is called from the single poll task;
/// reads interleave only after it returns.
pub(crate) struct SegmentCache {
    fetcher: Arc<dyn Fetcher>,
    backoff: RetryPolicy,
    timeout: Duration,
    max_concurrency: usize,
    entries: HashMap<Url, SegmentEntry>,
}

impl SegmentCache {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        timeout: Duration,
        backoff: RetryPolicy,
        max_concurrency: usize,
    ) -> Self {
        Self {
            fetcher,
            backoff,
            timeout,
            max_concurrency,
            entries: HashMap::new(),
        }
    }

    pub async fn sync(
        &mut self,
        token: &CancellationToken,
        urls: &[Url],
    ) -> Result<(), MonitorError> {
        for entry in self.entries.values_mut() {
            entry.pending_delete = true;
        }

        let mut seen: HashSet<&Url> = HashSet::with_capacity(urls.len());
        let mut missing: Vec<Url> = Vec::new();
        for url in urls {
            if !seen.insert(url) {
                continue;
            }
            match self.entries.get_mut(url) {
                Some(entry) => entry.pending_delete = false,
                None => missing.push(url.clone()),
            }
        }

        let max_concurrency = self.max_concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let mut tasks: JoinSet<Result<(Url, Bytes), MonitorError>> = JoinSet::new();
        for url in missing {
            let fetcher = Arc::clone(&self.fetcher);
            let semaphore = Arc::clone(&semaphore);
            let token = token.clone();
            let backoff = self.backoff.clone();
            let timeout = self.timeout;
            tasks.spawn(async move {
                // The permit is held across the whole retry loop; acquisition
                // itself honours cancellation so a sync on a cancelled
                // context fails instead of parking forever.
                let _permit = tokio::select! {
                    _ = token.cancelled() => return Err(MonitorError::Cancelled),
                    permit = semaphore.acquire_owned() => {
                        permit.map_err(|_| MonitorError::internal("segment semaphore closed"))?
                    }
                };
                let body = retry_with_backoff(&backoff, &token, |_| {
                    let fetcher = Arc::clone(&fetcher);
                    let token = token.clone();
                    let url = url.clone();
                    async move {
                        // Per-attempt deadline, not a budget across retries.
                        match tokio::time::timeout(timeout, fetcher.get(&token, &url)).await {
                            Ok(Ok(fetched)) => Ok(fetched.body),
                            Ok(Err(err)) => Err(err),
                            Err(_) => Err(MonitorError::timeout(format!("segment download: {url}"))),
                        }
                    }
                })
                .await
                .map_err(|err| MonitorError::segment_fetch(&url, err))?;
                Ok((url, body))
            });
        }

        let mut fetched: Vec<(Url, Bytes)> = Vec::new();
        let mut first_error: Option<MonitorError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join_error) if join_error.is_panic() => {
                    Err(MonitorError::from_panic(join_error.into_panic()))
                }
                Err(_) => Err(MonitorError::Cancelled),
            };
            match result {
                Ok(pair) => fetched.push(pair),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        for (url, data) in fetched {
            debug!(url = %url, "segment cached");
            self.entries.insert(
                url,
                SegmentEntry {
                    data,
                    pending_delete: false,
                },
            );
        }
        self.entries.retain(|_, entry| !entry.pending_delete);
        Ok(())
    }

    #[cfg(test)]
    fn urls(&self) -> HashSet<Url> {
        self.entries.keys().cloned().collect()
    }
}

impl SegmentStore for SegmentCache {
    fn exists(&self, url: &Url) -> bool {
        self.entries.contains_key(url)
    }

    fn load(&self, url: &Url) -> Option<Bytes> {
        self.entries.get(url).map(|entry| entry.data.clone())
    }
}
