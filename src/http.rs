//! Single-request HTTP layer: header injection, download events, and
//! permanent/transient classification.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, TRANSFER_ENCODING};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::MonitorError;
use crate::handler::OnDownloadHandler;

/// Metadata of one fetched HTTP resource.
#[derive(Debug, Clone)]
pub struct FileMeta {
    /// Final URL after redirects.
    pub url: Url,
    /// URL the request was originally issued for.
    pub via: Url,
    pub request_header: HeaderMap,
    pub response_header: HeaderMap,
    /// e.g. "200 OK"
    pub status: String,
    /// e.g. 200
    pub status_code: u16,
    /// e.g. "HTTP/1.1"
    pub proto: String,
    pub content_length: Option<u64>,
    pub transfer_encoding: Vec<String>,
    /// Reserved. The client performs no transparent decompression, so this
    /// is always false.
    pub uncompressed: bool,
    pub request_timestamp: DateTime<Utc>,
    pub download_time: Duration,
}

/// A fetched HTTP resource: response metadata plus the body bytes.
///
/// Created on every response reaching the client, including non-2xx ones,
/// and handed to the configured download handler. Immutable after creation.
#[derive(Debug, Clone)]
pub struct File {
    pub meta: FileMeta,
    pub body: Bytes,
}

/// Successful fetch result: the body and the URL it finally resolved to.
#[derive(Debug, Clone)]
pub(crate) struct Fetched {
    pub body: Bytes,
    pub final_url: Url,
}

/// The seam between the download pipeline and the network.
///
/// Implementations classify failures via [`MonitorError::is_retryable`];
/// that classification is the only contract the retry wrappers rely on.
#[async_trait]
pub(crate) trait Fetcher: Send + Sync {
    async fn get(&self, token: &CancellationToken, url: &Url) -> Result<Fetched, MonitorError>;
}

/// [`Fetcher`] backed by a caller-supplied `reqwest::Client`.
///
/// Redirects follow the client's policy (reqwest's default caps at 10 hops);
/// the response observed here is the final hop, with `via` preserving the
/// originally requested URL.
pub(crate) struct HttpFetcher {
    client: reqwest::Client,
    header: HeaderMap,
    on_download: Option<OnDownloadHandler>,
}

impl HttpFetcher {
    pub fn new(
        client: reqwest::Client,
        header: HeaderMap,
        on_download: Option<OnDownloadHandler>,
    ) -> Self {
        Self {
            client,
            header,
            on_download,
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get(&self, token: &CancellationToken, url: &Url) -> Result<Fetched, MonitorError> {
        let request_timestamp = Utc::now();
        let started = Instant::now();

        let mut request = self.client.get(url.clone());
        if !self.header.is_empty() {
            request = request.headers(self.header.clone());
        }

        let response = tokio::select! {
            _ = token.cancelled() => return Err(MonitorError::Cancelled),
            result = request.send() => result?,
        };

        let final_url = response.url().clone();
        let status = response.status();
        let response_header = response.headers().clone();
        let proto = format!("{:?}", response.version());
        let content_length = response.content_length();
        let transfer_encoding = response_header
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|v| v.trim().to_string())
            .collect();

        let body = tokio::select! {
            _ = token.cancelled() => return Err(MonitorError::Cancelled),
            result = response.bytes() => result?,
        };
        let download_time = started.elapsed();

        if let Some(handler) = &self.on_download {
            handler(&File {
                meta: FileMeta {
                    url: final_url.clone(),
                    via: url.clone(),
                    request_header: self.header.clone(),
                    response_header,
                    status: status.to_string(),
                    status_code: status.as_u16(),
                    proto,
                    content_length,
                    transfer_encoding,
                    uncompressed: false,
                    request_timestamp,
                    download_time,
                },
                body: body.clone(),
            });
        }

        if !status.is_success() {
            return Err(MonitorError::HttpStatus {
                status,
                url: final_url.to_string(),
            });
        }
        Ok(Fetched { body, final_url })
    }
}
