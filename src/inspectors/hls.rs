//! Stock inspectors for HLS streams.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::hls::Playlists;
use crate::inspector::HlsInspector;
use crate::report::{Report, Severity, Values};
use crate::segment::SegmentStore;

use super::speedometer::{Speedometer, TimePoint};

#[derive(Debug, Clone)]
pub struct SpeedInspectorConfig {
    /// Sliding window over which drift is measured.
    pub interval: Duration,
    /// Absolute drift that raises a warning. Zero disables.
    pub warn: Duration,
    /// Absolute drift that raises an error. Zero disables.
    pub error: Duration,
}

impl Default for SpeedInspectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            warn: Duration::from_secs(15),
            error: Duration::from_secs(30),
        }
    }
}

/// Measures the gap between wall-clock time and accumulated segment
/// duration, per media playlist, and reports the worst one.
pub struct SpeedInspector {
    config: SpeedInspectorConfig,
    meters: HashMap<String, Speedometer>,
}

impl SpeedInspector {
    pub fn new() -> Self {
        Self::with_config(SpeedInspectorConfig::default())
    }

    pub fn with_config(config: SpeedInspectorConfig) -> Self {
        Self {
            config,
            meters: HashMap::new(),
        }
    }
}

impl Default for SpeedInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HlsInspector for SpeedInspector {
    async fn inspect(
        &mut self,
        playlists: &Playlists,
        _segments: &dyn SegmentStore,
    ) -> Option<Report> {
        if playlists.is_vod() {
            return Some(Report::new(
                "SpeedInspector",
                Severity::Info,
                "skip VOD playlist",
            ));
        }

        let mut max_gap = 0f64;
        let mut max_gap_url: Option<String> = None;
        for media in playlists.media.values() {
            if media.playlist.end_list {
                continue;
            }
            if media.playlist.segments.is_empty() {
                return Some(
                    Report::new("SpeedInspector", Severity::Error, "no segments")
                        .with_values(Values::new().with("url", media.url.as_str())),
                );
            }
            let real_time = media.time.timestamp_micros() as f64 / 1e6;
            let latest_sequence =
                media.playlist.media_sequence + media.playlist.segments.len() as u64 - 1;

            let meter = self
                .meters
                .entry(media.url.to_string())
                .or_insert_with(|| Speedometer::new(self.config.interval.as_secs_f64()));

            let Some(last) = meter.latest_time_point().copied() else {
                meter.add_time_point(TimePoint {
                    real_time,
                    video_time: 0.0,
                    segment_id: Some(latest_sequence),
                });
                continue;
            };
            // Video time advances by the duration of every segment newer
            // than the sequence recorded last poll.
            let last_sequence = last.segment_id.unwrap_or(latest_sequence);
            let advanced: f64 = media
                .playlist
                .segments
                .iter()
                .enumerate()
                .filter(|(i, _)| media.playlist.media_sequence + *i as u64 > last_sequence)
                .map(|(_, segment)| segment.duration as f64)
                .sum();
            meter.add_time_point(TimePoint {
                real_time,
                video_time: last.video_time + advanced,
                segment_id: Some(latest_sequence),
            });
            if !meter.satisfied() {
                continue;
            }
            let gap = meter.gap();
            if gap.abs() > max_gap.abs() {
                max_gap = gap;
                max_gap_url = Some(media.url.to_string());
            }
        }

        let mut values = Values::new().with("gap", max_gap);
        if let Some(url) = max_gap_url {
            values.insert("url", url);
        }
        if !self.config.error.is_zero() && max_gap.abs() >= self.config.error.as_secs_f64() {
            return Some(
                Report::new(
                    "SpeedInspector",
                    Severity::Error,
                    "large gap between real time and video time",
                )
                .with_values(values),
            );
        }
        if !self.config.warn.is_zero() && max_gap.abs() >= self.config.warn.as_secs_f64() {
            return Some(
                Report::new(
                    "SpeedInspector",
                    Severity::Warn,
                    "large gap between real time and video time",
                )
                .with_values(values),
            );
        }
        Some(Report::new("SpeedInspector", Severity::Info, "good").with_values(values))
    }
}

#[derive(Debug, Clone)]
pub struct VariantsSyncInspectorConfig {
    /// Per-sequence duration spread that raises a warning. Zero disables.
    pub warn_segment_duration_diff: Duration,
    /// Per-sequence duration spread that raises an error. Zero disables.
    pub error_segment_duration_diff: Duration,
    /// Latest-sequence spread that raises a warning. Zero disables.
    pub warn_sequence_diff: u64,
    /// Latest-sequence spread that raises an error. Zero disables.
    pub error_sequence_diff: u64,
}

impl Default for VariantsSyncInspectorConfig {
    fn default() -> Self {
        Self {
            warn_segment_duration_diff: Duration::from_millis(500),
            error_segment_duration_diff: Duration::from_millis(1000),
            warn_sequence_diff: 2,
            error_sequence_diff: 4,
        }
    }
}

/// Checks that variant streams stay in step: segments sharing a sequence
/// number have matching durations, and the playlists' latest sequence
/// numbers do not drift apart within a rendition group.
pub struct VariantsSyncInspector {
    config: VariantsSyncInspectorConfig,
}

impl VariantsSyncInspector {
    pub fn new() -> Self {
        Self::with_config(VariantsSyncInspectorConfig::default())
    }

    pub fn with_config(config: VariantsSyncInspectorConfig) -> Self {
        Self { config }
    }
}

impl Default for VariantsSyncInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HlsInspector for VariantsSyncInspector {
    async fn inspect(
        &mut self,
        playlists: &Playlists,
        _segments: &dyn SegmentStore,
    ) -> Option<Report> {
        #[derive(Default)]
        struct DurationSpread {
            max: f64,
            min: f64,
        }
        #[derive(Default)]
        struct SequenceSpread {
            max: u64,
            min: u64,
        }

        let mut by_sequence: HashMap<(String, u64), DurationSpread> = HashMap::new();
        let mut by_group: HashMap<String, SequenceSpread> = HashMap::new();
        for media in playlists.media.values() {
            if media.playlist.segments.is_empty() {
                return Some(Report::new(
                    "VariantsSyncInspector",
                    Severity::Info,
                    "no segments",
                ));
            }
            let group_id = media
                .alternative
                .as_ref()
                .map(|a| a.group_id.clone())
                .unwrap_or_default();
            for (i, segment) in media.playlist.segments.iter().enumerate() {
                let sequence = media.playlist.media_sequence + i as u64;
                let spread = by_sequence.entry((group_id.clone(), sequence)).or_default();
                let duration = segment.duration as f64;
                if spread.max == 0.0 || duration > spread.max {
                    spread.max = duration;
                }
                if spread.min == 0.0 || duration < spread.min {
                    spread.min = duration;
                }
            }
            let latest =
                media.playlist.media_sequence + media.playlist.segments.len() as u64 - 1;
            let spread = by_group.entry(group_id).or_default();
            if spread.max == 0 || latest > spread.max {
                spread.max = latest;
            }
            if spread.min == 0 || latest < spread.min {
                spread.min = latest;
            }
        }

        let mut max_duration_diff = 0f64;
        for spread in by_sequence.values() {
            let diff = spread.max - spread.min;
            if diff > max_duration_diff {
                max_duration_diff = diff;
            }
        }
        let mut max_sequence_diff = 0u64;
        for spread in by_group.values() {
            let diff = spread.max - spread.min;
            if diff > max_sequence_diff {
                max_sequence_diff = diff;
            }
        }

        let values = Values::new()
            .with("durDiff", max_duration_diff)
            .with("seqDiff", max_sequence_diff);
        let config = &self.config;
        if !config.error_segment_duration_diff.is_zero()
            && max_duration_diff >= config.error_segment_duration_diff.as_secs_f64()
        {
            return Some(
                Report::new(
                    "VariantsSyncInspector",
                    Severity::Error,
                    "large duration difference",
                )
                .with_values(values),
            );
        }
        if config.error_sequence_diff != 0 && max_sequence_diff >= config.error_sequence_diff {
            return Some(
                Report::new(
                    "VariantsSyncInspector",
                    Severity::Error,
                    "large sequence difference",
                )
                .with_values(values),
            );
        }
        if !config.warn_segment_duration_diff.is_zero()
            && max_duration_diff >= config.warn_segment_duration_diff.as_secs_f64()
        {
            return Some(
                Report::new(
                    "VariantsSyncInspector",
                    Severity::Warn,
                    "large duration difference",
                )
                .with_values(values),
            );
        }
        if config.warn_sequence_diff != 0 && max_sequence_diff >= config.warn_sequence_diff {
            return Some(
                Report::new(
                    "VariantsSyncInspector",
                    Severity::Warn,
                    "large sequence difference",
                )
                .with_values(values),
            );
        }
        Some(Report::new("VariantsSyncInspector", Severity::Info, "good").with_values(values))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlaylistTypeCondition {
    #[default]
    Any,
    MustBeOmitted,
    MustBeEvent,
    MustBeVod,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EndlistCondition {
    #[default]
    Any,
    MustExist,
    MustNotExist,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlaylistTypeInspectorConfig {
    pub playlist_type: PlaylistTypeCondition,
    pub endlist: EndlistCondition,
}

/// Asserts `EXT-X-PLAYLIST-TYPE` and `EXT-X-ENDLIST` presence conditions
/// across all media playlists.
pub struct PlaylistTypeInspector {
    config: PlaylistTypeInspectorConfig,
}

impl PlaylistTypeInspector {
    pub fn new(config: PlaylistTypeInspectorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl HlsInspector for PlaylistTypeInspector {
    async fn inspect(
        &mut self,
        playlists: &Playlists,
        _segments: &dyn SegmentStore,
    ) -> Option<Report> {
        use m3u8_rs::MediaPlaylistType;

        let mut no_type = false;
        let mut event = false;
        let mut vod = false;
        let mut endlist = false;
        let mut no_endlist = false;
        for media in playlists.media.values() {
            match media.playlist.playlist_type {
                None => no_type = true,
                Some(MediaPlaylistType::Event) => event = true,
                Some(MediaPlaylistType::Vod) => vod = true,
                Some(MediaPlaylistType::Other(_)) => no_type = true,
            }
            if media.playlist.end_list {
                endlist = true;
            } else {
                no_endlist = true;
            }
        }

        let mut values = Values::new();
        values.insert(
            "playlistType",
            if (no_type && event) || (no_type && vod) || (event && vod) {
                "mixed"
            } else if no_type {
                "not exists"
            } else if event {
                "EVENT"
            } else if vod {
                "VOD"
            } else {
                "n/a"
            },
        );
        values.insert(
            "endlist",
            if endlist && no_endlist {
                "mixed"
            } else if endlist {
                "exists"
            } else if no_endlist {
                "not exists"
            } else {
                "n/a"
            },
        );

        let violated = match self.config.playlist_type {
            PlaylistTypeCondition::Any => None,
            PlaylistTypeCondition::MustBeOmitted if !no_type || event || vod => {
                Some("PLAYLIST-TYPE must be omitted")
            }
            PlaylistTypeCondition::MustBeEvent if no_type || !event || vod => {
                Some("PLAYLIST-TYPE must be EVENT")
            }
            PlaylistTypeCondition::MustBeVod if no_type || event || !vod => {
                Some("PLAYLIST-TYPE must be VOD")
            }
            _ => None,
        };
        if let Some(message) = violated {
            return Some(
                Report::new("PlaylistTypeInspector", Severity::Error, message)
                    .with_values(values),
            );
        }
        let violated = match self.config.endlist {
            EndlistCondition::Any => None,
            EndlistCondition::MustExist if !endlist || no_endlist => Some("ENDLIST must exist"),
            EndlistCondition::MustNotExist if endlist || !no_endlist => {
                Some("ENDLIST must not exist")
            }
            _ => None,
        };
        if let Some(message) = violated {
            return Some(
                Report::new("PlaylistTypeInspector", Severity::Error, message)
                    .with_values(values),
            );
        }
        Some(Report::new("PlaylistTypeInspector", Severity::Info, "good").with_values(values))
    }
}
