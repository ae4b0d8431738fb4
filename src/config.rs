//! Per-monitor configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use url::Url;

use crate::filter::SegmentFilter;
use crate::handler::{OnDownloadHandler, OnReportHandler, OnTerminateHandler};
use crate::inspector::{DashInspector, HlsInspector};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Hls,
    Dash,
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::Hls => f.write_str("HLS"),
            StreamType::Dash => f.write_str("DASH"),
        }
    }
}

/// HLS-specific knobs: the inspectors run on every poll.
#[derive(Default)]
pub struct HlsConfig {
    pub inspectors: Vec<Box<dyn HlsInspector>>,
}

/// DASH-specific knobs: the inspectors run on every poll.
#[derive(Default)]
pub struct DashConfig {
    pub inspectors: Vec<Box<dyn DashInspector>>,
}

/// Everything one monitor needs. Construct with [`Config::new`] and adjust
/// fields as needed; the config is consumed by [`crate::Monitor::spawn`].
pub struct Config {
    pub url: Url,
    pub stream_type: StreamType,

    /// Polling interval when the manifest suggests nothing (or suggestions
    /// are not prioritised).
    pub default_interval: Duration,
    /// Derive the interval from `EXT-X-TARGETDURATION` /
    /// `MPD@minimumUpdatePeriod` instead of `default_interval`.
    pub prioritize_suggested_interval: bool,

    /// Client used for every request. Redirect policy, proxies, TLS and
    /// connection pooling are configured here by the caller.
    pub http_client: reqwest::Client,
    /// Fixed header set injected into every request.
    pub request_header: HeaderMap,
    /// Disable memoisation of manifest redirect resolutions.
    pub no_redirect_cache: bool,

    /// Deadline for one manifest download, including the HLS variant
    /// fan-out.
    pub manifest_timeout: Duration,
    pub manifest_backoff: RetryPolicy,

    /// Deadline per segment download attempt (not across retries).
    pub segment_timeout: Duration,
    pub segment_backoff: RetryPolicy,
    /// Concurrent segment downloads per sync. Zero behaves as one.
    pub segment_max_concurrency: usize,
    pub segment_filter: Option<Arc<dyn SegmentFilter>>,

    /// Exit the polling loop after the first poll of a VOD stream.
    pub terminate_if_vod: bool,

    pub hls: HlsConfig,
    pub dash: DashConfig,

    /// Called once per HTTP response, including non-2xx ones. Must be
    /// thread-safe.
    pub on_download: Option<OnDownloadHandler>,
    pub on_report: Option<OnReportHandler>,
    pub on_terminate: Option<OnTerminateHandler>,
}

impl Config {
    pub fn new(url: Url, stream_type: StreamType) -> Self {
        Self {
            url,
            stream_type,
            default_interval: Duration::from_secs(5),
            prioritize_suggested_interval: false,
            http_client: reqwest::Client::new(),
            request_header: HeaderMap::new(),
            no_redirect_cache: false,
            manifest_timeout: Duration::from_secs(1),
            manifest_backoff: RetryPolicy::default(),
            segment_timeout: Duration::from_secs(3),
            segment_backoff: RetryPolicy::default(),
            segment_max_concurrency: 4,
            segment_filter: None,
            terminate_if_vod: false,
            hls: HlsConfig::default(),
            dash: DashConfig::default(),
            on_download: None,
            on_report: None,
            on_terminate: None,
        }
    }
}
