//! HLS playlist model and the two-stage master/media downloader.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use m3u8_rs::Playlist;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::MonitorError;
use crate::http::Fetcher;

/// Fetched master playlist together with its resolved URL and fetch time.
#[derive(Debug, Clone)]
pub struct MasterPlaylist {
    pub url: Url,
    pub raw: Bytes,
    pub time: DateTime<Utc>,
    pub playlist: m3u8_rs::MasterPlaylist,
}

impl Deref for MasterPlaylist {
    type Target = m3u8_rs::MasterPlaylist;

    fn deref(&self) -> &Self::Target {
        &self.playlist
    }
}

/// Fetched media playlist with its structural context in the master.
///
/// `variant` is set for playlists reached through an `EXT-X-STREAM-INF`
/// entry, `alternative` for those reached through `EXT-X-MEDIA`. Both are
/// absent for a stream served as a bare media playlist.
#[derive(Debug, Clone)]
pub struct MediaPlaylist {
    pub url: Url,
    pub raw: Bytes,
    pub time: DateTime<Utc>,
    pub playlist: m3u8_rs::MediaPlaylist,
    pub variant: Option<m3u8_rs::VariantStream>,
    pub alternative: Option<m3u8_rs::AlternativeMedia>,
}

impl Deref for MediaPlaylist {
    type Target = m3u8_rs::MediaPlaylist;

    fn deref(&self) -> &Self::Target {
        &self.playlist
    }
}

impl MediaPlaylist {
    /// Absolute URLs of every segment, resolved against the playlist URL.
    pub fn segment_urls(&self) -> Result<Vec<Url>, MonitorError> {
        self.playlist
            .segments
            .iter()
            .map(|segment| {
                self.url
                    .join(&segment.uri)
                    .map_err(|e| MonitorError::invalid_url(&segment.uri, e.to_string()))
            })
            .collect()
    }
}

/// One poll's view of an HLS stream: the cached master (if any) plus the
/// media playlists fetched this poll, keyed by the URI they were referenced
/// with (`"_"` for a bare media playlist).
#[derive(Debug, Clone, Default)]
pub struct Playlists {
    pub master: Option<Arc<MasterPlaylist>>,
    pub media: HashMap<String, MediaPlaylist>,
}

/// Media-playlist key used when the monitored URL is itself a media
/// playlist.
pub const SINGLE_MEDIA_KEY: &str = "_";

/// A segment reference flattened out of the playlists.
///
/// Carries the scalar context fields filters and inspectors read; it does
/// not borrow from the playlists and is dropped with the poll that produced
/// it.
#[derive(Debug, Clone)]
pub struct HlsSegment {
    pub url: Url,
    /// Bandwidth of the variant the segment belongs to, if any.
    pub bandwidth: Option<u64>,
    /// `GROUP-ID` of the alternative rendition, if any.
    pub group_id: Option<String>,
}

impl Playlists {
    pub fn segments(&self) -> Result<Vec<HlsSegment>, MonitorError> {
        let mut segments = Vec::new();
        for playlist in self.media.values() {
            for url in playlist.segment_urls()? {
                segments.push(HlsSegment {
                    url,
                    bandwidth: playlist.variant.as_ref().map(|v| v.bandwidth),
                    group_id: playlist.alternative.as_ref().map(|a| a.group_id.clone()),
                });
            }
        }
        Ok(segments)
    }

    /// True when every media playlist carries `EXT-X-ENDLIST`.
    pub fn is_vod(&self) -> bool {
        self.media.values().all(|p| p.playlist.end_list)
    }

    /// Largest `EXT-X-TARGETDURATION` across the media playlists, in
    /// seconds.
    pub fn max_target_duration(&self) -> u64 {
        self.media
            .values()
            .map(|p| p.playlist.target_duration)
            .max()
            .unwrap_or(0)
    }
}

/// Downloads the playlist tree for one stream.
///
/// The first response decides the shape: a media playlist is returned as-is
/// under [`SINGLE_MEDIA_KEY`]; a master playlist is cached on the downloader
/// and every subsequent call fans out parallel fetches for each variant and
/// each distinct alternative rendition.
pub(crate) struct HlsPlaylistDownloader {
    fetcher: Arc<dyn Fetcher>,
    timeout: Duration,
    master: Option<Arc<MasterPlaylist>>,
}

impl HlsPlaylistDownloader {
    pub fn new(fetcher: Arc<dyn Fetcher>, timeout: Duration) -> Self {
        Self {
            fetcher,
            timeout,
            master: None,
        }
    }

    pub async fn download(
        &mut self,
        token: &CancellationToken,
        url: &Url,
    ) -> Result<Playlists, MonitorError> {
        match tokio::time::timeout(self.timeout, self.download_inner(token, url)).await {
            Ok(result) => result,
            Err(_) => Err(MonitorError::timeout(format!("playlist download: {url}"))),
        }
    }

    async fn download_inner(
        &mut self,
        token: &CancellationToken,
        url: &Url,
    ) -> Result<Playlists, MonitorError> {
        if self.master.is_none() {
            let fetched = self
                .fetcher
                .get(token, url)
                .await
                .map_err(|e| MonitorError::manifest_fetch(url, e))?;
            match m3u8_rs::parse_playlist_res(&fetched.body) {
                Ok(Playlist::MediaPlaylist(media)) => {
                    let mut playlists = Playlists::default();
                    playlists.media.insert(
                        SINGLE_MEDIA_KEY.to_string(),
                        MediaPlaylist {
                            url: fetched.final_url,
                            raw: fetched.body,
                            time: Utc::now(),
                            playlist: media,
                            variant: None,
                            alternative: None,
                        },
                    );
                    return Ok(playlists);
                }
                Ok(Playlist::MasterPlaylist(master)) => {
                    self.master = Some(Arc::new(MasterPlaylist {
                        url: fetched.final_url,
                        raw: fetched.body,
                        time: Utc::now(),
                        playlist: master,
                    }));
                }
                Err(e) => return Err(MonitorError::decode(url, e)),
            }
        }

        let master = self
            .master
            .clone()
            .ok_or_else(|| MonitorError::internal("master playlist missing after first download"))?;

        // Variant URIs first, then alternative URIs, de-duplicated. All are
        // resolved against the master playlist's resolved URL.
        let mut jobs: Vec<(
            String,
            Url,
            Option<m3u8_rs::VariantStream>,
            Option<m3u8_rs::AlternativeMedia>,
        )> = Vec::new();
        let mut keys: HashSet<String> = HashSet::new();
        for variant in &master.playlist.variants {
            if !keys.insert(variant.uri.clone()) {
                continue;
            }
            let absolute = master
                .url
                .join(&variant.uri)
                .map_err(|e| MonitorError::invalid_url(&variant.uri, e.to_string()))?;
            jobs.push((variant.uri.clone(), absolute, Some(variant.clone()), None));
        }
        for alternative in &master.playlist.alternatives {
            let Some(uri) = &alternative.uri else {
                continue;
            };
            if !keys.insert(uri.clone()) {
                continue;
            }
            let absolute = master
                .url
                .join(uri)
                .map_err(|e| MonitorError::invalid_url(uri, e.to_string()))?;
            jobs.push((uri.clone(), absolute, None, Some(alternative.clone())));
        }

        let mut tasks: JoinSet<Result<(String, MediaPlaylist), MonitorError>> = JoinSet::new();
        for (key, absolute, variant, alternative) in jobs {
            let fetcher = Arc::clone(&self.fetcher);
            let token = token.clone();
            tasks.spawn(async move {
                let media =
                    download_media_playlist(fetcher, &token, &absolute, variant, alternative)
                        .await?;
                Ok((key, media))
            });
        }

        let mut media = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join_error) if join_error.is_panic() => {
                    Err(MonitorError::from_panic(join_error.into_panic()))
                }
                Err(_) => Err(MonitorError::Cancelled),
            };
            match result {
                Ok((key, playlist)) => {
                    media.insert(key, playlist);
                }
                Err(err) => {
                    // A failed sibling makes the whole poll useless; stop
                    // the rest promptly.
                    tasks.abort_all();
                    return Err(err);
                }
            }
        }
        Ok(Playlists {
            master: Some(master),
            media,
        })
    }
}

async fn download_media_playlist(
    fetcher: Arc<dyn Fetcher>,
    token: &CancellationToken,
    url: &Url,
    variant: Option<m3u8_rs::VariantStream>,
    alternative: Option<m3u8_rs::AlternativeMedia>,
) -> Result<MediaPlaylist, MonitorError> {
    let fetched = fetcher
        .get(token, url)
        .await
        .map_err(|e| MonitorError::manifest_fetch(url, e))?;
    match m3u8_rs::parse_playlist_res(&fetched.body) {
        Ok(Playlist::MediaPlaylist(media)) => Ok(MediaPlaylist {
            url: fetched.final_url,
            raw: fetched.body,
            time: Utc::now(),
            playlist: media,
            variant,
            alternative,
        }),
        Ok(Playlist::MasterPlaylist(_)) => Err(MonitorError::decode(
            url,
            "expected media playlist, got master playlist",
        )),
        Err(e) => Err(MonitorError::decode(url, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testutil::MockFetcher;

    const MASTER: &str = "#EXTM3U\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"english\",URI=\"audio/en.m3u8\"\n\
#EXT-X-STREAM-INF:BANDWIDTH=1000000,AUDIO=\"aud\"\n\
low/index.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=3000000,AUDIO=\"aud\"\n\
high/index.m3u8\n";

    const MEDIA_LIVE: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:6\n\
#EXT-X-MEDIA-SEQUENCE:10\n\
#EXTINF:6.0,\n\
seg10.ts\n\
#EXTINF:6.0,\n\
seg11.ts\n";

    const MEDIA_VOD: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:4\n\
#EXTINF:4.0,\n\
seg0.ts\n\
#EXT-X-ENDLIST\n";

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn bare_media_playlist_is_keyed_with_placeholder() {
        let mock = MockFetcher::new().body("http://origin.test/live.m3u8", MEDIA_LIVE);
        let mut downloader =
            HlsPlaylistDownloader::new(Arc::new(mock), Duration::from_secs(1));
        let url = Url::parse("http://origin.test/live.m3u8").unwrap();

        let playlists = downloader.download(&token(), &url).await.unwrap();
        assert!(playlists.master.is_none());
        assert_eq!(playlists.media.len(), 1);
        let media = &playlists.media[SINGLE_MEDIA_KEY];
        assert_eq!(media.playlist.segments.len(), 2);
        assert_eq!(media.playlist.media_sequence, 10);
        assert!(!playlists.is_vod());
        assert_eq!(playlists.max_target_duration(), 6);
    }

    #[tokio::test]
    async fn master_fans_out_to_variants_and_alternatives() {
        let mock = MockFetcher::new()
            .body("http://origin.test/master.m3u8", MASTER)
            .body("http://origin.test/low/index.m3u8", MEDIA_LIVE)
            .body("http://origin.test/high/index.m3u8", MEDIA_LIVE)
            .body("http://origin.test/audio/en.m3u8", MEDIA_LIVE);
        let mock = Arc::new(mock);
        let mut downloader = HlsPlaylistDownloader::new(
            Arc::clone(&mock) as Arc<dyn Fetcher>,
            Duration::from_secs(1),
        );
        let url = Url::parse("http://origin.test/master.m3u8").unwrap();

        let playlists = downloader.download(&token(), &url).await.unwrap();
        assert!(playlists.master.is_some());
        assert_eq!(playlists.media.len(), 3);
        assert_eq!(
            playlists.media["low/index.m3u8"].variant.as_ref().unwrap().bandwidth,
            1_000_000,
        );
        assert_eq!(
            playlists.media["audio/en.m3u8"]
                .alternative
                .as_ref()
                .unwrap()
                .group_id,
            "aud",
        );

        // Second poll reuses the cached master: no refetch of master.m3u8.
        downloader.download(&token(), &url).await.unwrap();
        assert_eq!(mock.call_count("http://origin.test/master.m3u8"), 1);
        assert_eq!(mock.call_count("http://origin.test/low/index.m3u8"), 2);
    }

    #[tokio::test]
    async fn failed_variant_fetch_fails_the_download() {
        let mock = MockFetcher::new()
            .body("http://origin.test/master.m3u8", MASTER)
            .body("http://origin.test/low/index.m3u8", MEDIA_LIVE)
            .status("http://origin.test/high/index.m3u8", 404)
            .body("http://origin.test/audio/en.m3u8", MEDIA_LIVE);
        let mut downloader =
            HlsPlaylistDownloader::new(Arc::new(mock), Duration::from_secs(1));
        let url = Url::parse("http://origin.test/master.m3u8").unwrap();

        let err = downloader.download(&token(), &url).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn undecodable_playlist_is_permanent() {
        let mock = MockFetcher::new().body("http://origin.test/garbage.m3u8", "not a playlist");
        let mut downloader =
            HlsPlaylistDownloader::new(Arc::new(mock), Duration::from_secs(1));
        let url = Url::parse("http://origin.test/garbage.m3u8").unwrap();

        let err = downloader.download(&token(), &url).await.unwrap_err();
        assert!(matches!(err, MonitorError::Decode { .. }));
    }

    #[test]
    fn segments_resolve_against_playlist_url() {
        let playlist = match m3u8_rs::parse_playlist_res(MEDIA_VOD.as_bytes()).unwrap() {
            Playlist::MediaPlaylist(p) => p,
            _ => unreachable!(),
        };
        let media = MediaPlaylist {
            url: Url::parse("http://origin.test/vod/index.m3u8").unwrap(),
            raw: Bytes::from_static(MEDIA_VOD.as_bytes()),
            time: Utc::now(),
            playlist,
            variant: None,
            alternative: None,
        };
        let mut playlists = Playlists::default();
        playlists.media.insert(SINGLE_MEDIA_KEY.to_string(), media);

        let segments = playlists.segments().unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].url.as_str(), "http://origin.test/vod/seg0.ts");
        assert!(playlists.is_vod());
    }
}
