//! The per-stream polling engine.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use crate::config::{Config, StreamType};
use crate::dash::{DashManifestDownloader, Manifest};
use crate::error::MonitorError;
use crate::filter::FilterResult;
use crate::hls::{HlsPlaylistDownloader, Playlists};
use crate::http::{Fetcher, HttpFetcher};
use crate::redirect::RedirectCache;
use crate::report::{Report, Reports, Severity, Values};
use crate::segment::{SegmentCache, SegmentStore};

/// Handle to a running monitor.
///
/// The polling task runs until [`Monitor::terminate`] is called or, with
/// `terminate_if_vod`, until the stream turns out to be VOD. Either way the
/// configured `on_terminate` handler fires when the loop exits.
pub struct Monitor {
    token: CancellationToken,
}

impl Monitor {
    /// Start polling. Must be called within a tokio runtime.
    pub fn spawn(config: Config) -> Monitor {
        let token = CancellationToken::new();
        let task = MonitorTask::new(config, token.clone());
        tokio::spawn(task.run());
        Monitor { token }
    }

    /// Request termination. Propagates into in-flight downloads; the loop
    /// exits once the current poll finishes.
    pub fn terminate(&self) {
        self.token.cancel();
    }
}

enum Downloader {
    Hls(HlsPlaylistDownloader),
    Dash(DashManifestDownloader),
}

enum Polled {
    Hls(Playlists),
    Dash(Manifest),
}

struct MonitorTask {
    config: Config,
    downloader: Downloader,
    store: SegmentCache,
    token: CancellationToken,
}

impl MonitorTask {
    fn new(config: Config, token: CancellationToken) -> Self {
        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(
            config.http_client.clone(),
            config.request_header.clone(),
            config.on_download.clone(),
        ));
        let manifest_fetcher: Arc<dyn Fetcher> = if config.no_redirect_cache {
            Arc::clone(&fetcher)
        } else {
            Arc::new(RedirectCache::new(Arc::clone(&fetcher)))
        };
        let downloader = match config.stream_type {
            StreamType::Hls => Downloader::Hls(HlsPlaylistDownloader::new(
                manifest_fetcher,
                config.manifest_timeout,
            )),
            StreamType::Dash => Downloader::Dash(DashManifestDownloader::new(
                manifest_fetcher,
                config.manifest_timeout,
            )),
        };
        let store = SegmentCache::new(
            fetcher,
            config.segment_timeout,
            config.segment_backoff.clone(),
            config.segment_max_concurrency,
        );
        Self {
            config,
            downloader,
            store,
            token,
        }
    }

    async fn run(mut self) {
        debug!(url = %self.config.url, stream_type = %self.config.stream_type, "monitor started");
        loop {
            // Recover barrier: a panicking poll surfaces as an Error report
            // and the loop keeps going at the default interval.
            let (cont, wait) = match AssertUnwindSafe(self.poll()).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let err = MonitorError::from_panic(payload);
                    self.report_error("panic in polling loop", &err);
                    (true, self.config.default_interval)
                }
            };
            if !cont {
                break;
            }
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!(url = %self.config.url, "monitor terminated");
        if let Some(on_terminate) = &self.config.on_terminate {
            on_terminate();
        }
    }

    async fn poll(&mut self) -> (bool, Duration) {
        let polled = match self.download_manifest().await {
            Ok(polled) => polled,
            Err(err) => {
                self.report_error("failed to download manifest", &err);
                return (true, self.config.default_interval);
            }
        };

        if let Err(err) = self.sync_segments(&polled).await {
            self.report_error("failed to download segment", &err);
            return (true, self.config.default_interval);
        }

        let reports = self.run_inspectors(&polled).await;
        self.deliver(&Reports::from(reports));

        match &polled {
            Polled::Hls(playlists) => self.hls_wait(playlists),
            Polled::Dash(manifest) => self.dash_wait(manifest),
        }
    }

    /// Manifest download under the manifest backoff policy. Transient
    /// failures log a warning and retry until the policy's budget runs out.
    async fn download_manifest(&mut self) -> Result<Polled, MonitorError> {
        let policy = self.config.manifest_backoff.clone();
        let started = std::time::Instant::now();
        let mut attempt = 0u32;
        loop {
            let result = match &mut self.downloader {
                Downloader::Hls(downloader) => downloader
                    .download(&self.token, &self.config.url)
                    .await
                    .map(Polled::Hls),
                Downloader::Dash(downloader) => downloader
                    .download(&self.token, &self.config.url)
                    .await
                    .map(Polled::Dash),
            };
            match result {
                Ok(polled) => return Ok(polled),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    let delay = policy.delay_for_attempt(attempt);
                    if !policy.within_budget(started, delay) {
                        return Err(err);
                    }
                    warn!(url = %self.config.url, error = %err, "failed to download manifest");
                    tokio::select! {
                        _ = self.token.cancelled() => return Err(MonitorError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn sync_segments(&mut self, polled: &Polled) -> Result<(), MonitorError> {
        let urls: Vec<Url> = match polled {
            Polled::Hls(playlists) => playlists
                .segments()?
                .into_iter()
                .filter(|segment| match &self.config.segment_filter {
                    Some(filter) => filter.check_hls(segment) == FilterResult::Pass,
                    None => true,
                })
                .map(|segment| segment.url)
                .collect(),
            Polled::Dash(manifest) => manifest
                .segments()?
                .into_iter()
                .filter(|segment| match &self.config.segment_filter {
                    Some(filter) => filter.check_dash(segment) == FilterResult::Pass,
                    None => true,
                })
                .map(|segment| segment.url)
                .collect(),
        };
        self.store.sync(&self.token, &urls).await
    }

    /// Dispatch the configured inspectors concurrently and collect their
    /// reports. Completion order is unobservable: the batch is name-sorted
    /// before delivery.
    async fn run_inspectors(&mut self, polled: &Polled) -> Vec<Report> {
        let store: &dyn SegmentStore = &self.store;
        let outcomes = match polled {
            Polled::Hls(playlists) => {
                let futures: Vec<_> = self
                    .config
                    .hls
                    .inspectors
                    .iter_mut()
                    .map(|inspector| inspector.inspect(playlists, store))
                    .collect();
                futures::future::join_all(futures).await
            }
            Polled::Dash(manifest) => {
                let futures: Vec<_> = self
                    .config
                    .dash
                    .inspectors
                    .iter_mut()
                    .map(|inspector| inspector.inspect(manifest, store))
                    .collect();
                futures::future::join_all(futures).await
            }
        };
        outcomes.into_iter().flatten().collect()
    }

    fn hls_wait(&self, playlists: &Playlists) -> (bool, Duration) {
        if playlists.is_vod() {
            if self.config.terminate_if_vod {
                return (false, Duration::ZERO);
            }
            return (true, self.config.default_interval);
        }
        if !self.config.prioritize_suggested_interval {
            return (true, self.config.default_interval);
        }
        let suggested = Duration::from_secs(playlists.max_target_duration()) / 2;
        if suggested.is_zero() {
            (true, self.config.default_interval)
        } else if suggested < Duration::from_secs(1) {
            (true, Duration::from_secs(1))
        } else {
            (true, suggested)
        }
    }

    fn dash_wait(&self, manifest: &Manifest) -> (bool, Duration) {
        if !manifest.is_dynamic() {
            if self.config.terminate_if_vod {
                return (false, Duration::ZERO);
            }
            return (true, self.config.default_interval);
        }
        if !self.config.prioritize_suggested_interval {
            return (true, self.config.default_interval);
        }
        match manifest.minimum_update_period() {
            Ok(None) => (true, self.config.default_interval),
            Ok(Some(period)) if period < Duration::from_secs(1) => (true, Duration::from_secs(1)),
            Ok(Some(period)) => (true, period),
            Err(err) => {
                error!(url = %manifest.url, error = %err, "failed to parse minimumUpdatePeriod");
                (true, self.config.default_interval)
            }
        }
    }

    /// Every error surfaces as an Error report named "Monitor" plus a log
    /// line; nothing escapes the polling loop.
    fn report_error(&self, message: &str, err: &MonitorError) {
        error!(url = %self.config.url, error = %err, "{message}");
        let report = Report::new("Monitor", Severity::Error, message)
            .with_values(Values::new().with("error", err.to_string()));
        self.deliver(&Reports::from(vec![report]));
    }

    fn deliver(&self, reports: &Reports) {
        if let Some(on_report) = &self.config.on_report {
            on_report(reports);
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::Utc;

    use super::*;
    use crate::hls::{MediaPlaylist, SINGLE_MEDIA_KEY};

    fn task(stream_type: StreamType) -> MonitorTask {
        let url = match stream_type {
            StreamType::Hls => "http://origin.test/live.m3u8",
            StreamType::Dash => "http://origin.test/live.mpd",
        };
        let mut config = Config::new(Url::parse(url).unwrap(), stream_type);
        config.prioritize_suggested_interval = true;
        MonitorTask::new(config, CancellationToken::new())
    }

    fn live_playlists(target_duration: u64) -> Playlists {
        let text = format!(
            "#EXTM3U\n#EXT-X-TARGETDURATION:{target_duration}\n#EXTINF:4.0,\nseg0.ts\n",
        );
        let playlist = match m3u8_rs::parse_playlist_res(text.as_bytes()).unwrap() {
            m3u8_rs::Playlist::MediaPlaylist(p) => p,
            _ => unreachable!(),
        };
        let mut playlists = Playlists::default();
        playlists.media.insert(
            SINGLE_MEDIA_KEY.to_string(),
            MediaPlaylist {
                url: Url::parse("http://origin.test/live.m3u8").unwrap(),
                raw: Bytes::from(text.into_bytes()),
                time: Utc::now(),
                playlist,
                variant: None,
                alternative: None,
            },
        );
        playlists
    }

    fn dash_manifest(xml: &str) -> Manifest {
        Manifest {
            url: Url::parse("http://origin.test/live.mpd").unwrap(),
            raw: Bytes::copy_from_slice(xml.as_bytes()),
            time: Utc::now(),
            mpd: quick_xml::de::from_str(xml).unwrap(),
        }
    }

    #[tokio::test]
    async fn hls_live_interval_is_half_target_duration() {
        let task = task(StreamType::Hls);
        let (cont, wait) = task.hls_wait(&live_playlists(8));
        assert!(cont);
        assert_eq!(wait, Duration::from_secs(4));
    }

    #[tokio::test]
    async fn hls_live_interval_is_clamped_to_one_second() {
        let task = task(StreamType::Hls);
        let (cont, wait) = task.hls_wait(&live_playlists(1));
        assert!(cont);
        assert_eq!(wait, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn hls_zero_target_duration_falls_back_to_default() {
        let task = task(StreamType::Hls);
        let (cont, wait) = task.hls_wait(&live_playlists(0));
        assert!(cont);
        assert_eq!(wait, task.config.default_interval);
    }

    #[tokio::test]
    async fn hls_interval_ignores_suggestion_unless_prioritized() {
        let mut task = task(StreamType::Hls);
        task.config.prioritize_suggested_interval = false;
        let (_, wait) = task.hls_wait(&live_playlists(8));
        assert_eq!(wait, task.config.default_interval);
    }

    #[tokio::test]
    async fn hls_vod_terminates_when_configured() {
        let mut task = task(StreamType::Hls);
        task.config.terminate_if_vod = true;
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg0.ts\n#EXT-X-ENDLIST\n";
        let playlist = match m3u8_rs::parse_playlist_res(text.as_bytes()).unwrap() {
            m3u8_rs::Playlist::MediaPlaylist(p) => p,
            _ => unreachable!(),
        };
        let mut playlists = Playlists::default();
        playlists.media.insert(
            SINGLE_MEDIA_KEY.to_string(),
            MediaPlaylist {
                url: Url::parse("http://origin.test/vod.m3u8").unwrap(),
                raw: Bytes::from_static(text.as_bytes()),
                time: Utc::now(),
                playlist,
                variant: None,
                alternative: None,
            },
        );
        let (cont, _) = task.hls_wait(&playlists);
        assert!(!cont);
    }

    #[tokio::test]
    async fn dash_dynamic_interval_follows_minimum_update_period() {
        let task = task(StreamType::Dash);
        let manifest = dash_manifest(r#"<MPD type="dynamic" minimumUpdatePeriod="PT6S"></MPD>"#);
        let (cont, wait) = task.dash_wait(&manifest);
        assert!(cont);
        assert_eq!(wait, Duration::from_secs(6));
    }

    #[tokio::test]
    async fn dash_sub_second_update_period_is_clamped() {
        let task = task(StreamType::Dash);
        let manifest =
            dash_manifest(r#"<MPD type="dynamic" minimumUpdatePeriod="PT0.2S"></MPD>"#);
        let (_, wait) = task.dash_wait(&manifest);
        assert_eq!(wait, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn dash_static_uses_default_or_terminates() {
        let mut task = task(StreamType::Dash);
        let manifest = dash_manifest(r#"<MPD type="static"></MPD>"#);
        let (cont, wait) = task.dash_wait(&manifest);
        assert!(cont);
        assert_eq!(wait, task.config.default_interval);

        task.config.terminate_if_vod = true;
        let (cont, _) = task.dash_wait(&manifest);
        assert!(!cont);
    }

    #[tokio::test]
    async fn dash_unparseable_update_period_falls_back_to_default() {
        let task = task(StreamType::Dash);
        let manifest =
            dash_manifest(r#"<MPD type="dynamic" minimumUpdatePeriod="bogus"></MPD>"#);
        let (cont, wait) = task.dash_wait(&manifest);
        assert!(cont);
        assert_eq!(wait, task.config.default_interval);
    }
}
