//! Memoisation of redirect resolutions so stable CDN-edge redirects are paid
//! only once.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::MonitorError;
use crate::http::{Fetched, Fetcher};

/// [`Fetcher`] decorator that substitutes a previously observed final URL
/// for the requested one.
///
/// An entry is rewritten whenever the observed resolution changes, and
/// dropped once the URL stops redirecting.
pub(crate) struct RedirectCache {
    inner: Arc<dyn Fetcher>,
    resolved: RwLock<HashMap<Url, Url>>,
}

impl RedirectCache {
    pub fn new(inner: Arc<dyn Fetcher>) -> Self {
        Self {
            inner,
            resolved: RwLock::new(HashMap::new()),
        }
    }

    fn lookup(&self, url: &Url) -> Option<Url> {
        self.resolved.read().unwrap().get(url).cloned()
    }

    fn record(&self, via: &Url, final_url: &Url) {
        let mut resolved = self.resolved.write().unwrap();
        if final_url == via {
            resolved.remove(via);
        } else {
            resolved.insert(via.clone(), final_url.clone());
        }
    }
}

#[async_trait]
impl Fetcher for RedirectCache {
    async fn get(&self, token: &CancellationToken, url: &Url) -> Result<Fetched, MonitorError> {
        let target = self.lookup(url).unwrap_or_else(|| url.clone());
        let fetched = self.inner.get(token, &target).await?;
        self.record(url, &fetched.final_url);
        Ok(fetched)
    }
}
