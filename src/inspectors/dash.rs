//! Stock inspectors for MPEG-DASH streams.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::dash::{AdaptationSet, Manifest, Representation};
use crate::inspector::DashInspector;
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

/// Measures the gap between wall-clock time and the manifest's leading
/// media time.
pub struct SpeedInspector {
    config: SpeedInspectorConfig,
    meter: Speedometer,
}

impl SpeedInspector {
    pub fn new() -> Self {
        Self::with_config(SpeedInspectorConfig::default())
    }

    pub fn with_config(config: SpeedInspectorConfig) -> Self {
        let meter = Speedometer::new(config.interval.as_secs_f64());
        Self { config, meter }
    }
}

impl Default for SpeedInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DashInspector for SpeedInspector {
    async fn inspect(
        &mut self,
        manifest: &Manifest,
        _segments: &dyn SegmentStore,
    ) -> Option<Report> {
        if !manifest.is_dynamic() {
            return Some(Report::new(
                "SpeedInspector",
                Severity::Info,
                "skip static manifest",
            ));
        }

        let mut video_time = 0f64;
        let walk = manifest.each_segment(|segment| {
            if segment.initialization {
                return;
            }
            let period_start = segment
                .period_start
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            let offset = segment.presentation_time_offset.unwrap_or(0);
            let timescale = segment.timescale.unwrap_or(1).max(1) as f64;
            let end = segment.time as i64 - offset as i64 + segment.duration as i64;
            let end_seconds = period_start + end as f64 / timescale;
            if end_seconds > video_time {
                video_time = end_seconds;
            }
        });
        if let Err(err) = walk {
            return Some(
                Report::new("SpeedInspector", Severity::Error, "unexpected error")
                    .with_values(Values::new().with("error", err.to_string())),
            );
        }

        self.meter.add_time_point(TimePoint {
            real_time: manifest.time.timestamp_micros() as f64 / 1e6,
            video_time,
            segment_id: None,
        });
        if !self.meter.satisfied() {
            return Some(Report::new(
                "SpeedInspector",
                Severity::Info,
                "wait for accumulating history",
            ));
        }

        let gap = self.meter.gap();
        let values = Values::new()
            .with("gap", gap)
            .with("realTime", self.meter.real_time_elapsed())
            .with("videoTime", self.meter.video_time_elapsed());
        if !self.config.error.is_zero() && gap.abs() >= self.config.error.as_secs_f64() {
            return Some(
                Report::new(
                    "SpeedInspector",
                    Severity::Error,
                    "large gap between real time and video time",
                )
                .with_values(values),
            );
        }
        if !self.config.warn.is_zero() && gap.abs() >= self.config.warn.as_secs_f64() {
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

/// Asserts that `MPD@type` equals the expected value; an absent attribute
/// counts as "static".
pub struct MpdTypeInspector {
    expected: String,
}

impl MpdTypeInspector {
    pub fn new(expected: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
        }
    }
}

#[async_trait]
impl DashInspector for MpdTypeInspector {
    async fn inspect(
        &mut self,
        manifest: &Manifest,
        _segments: &dyn SegmentStore,
    ) -> Option<Report> {
        let mpd_type = manifest.mpd.mpd_type.as_deref().unwrap_or("static");
        let values = Values::new().with("type", mpd_type);
        if mpd_type != self.expected {
            return Some(
                Report::new(
                    "MPDTypeInspector",
                    Severity::Error,
                    format!("invalid Type [{mpd_type}]"),
                )
                .with_values(values),
            );
        }
        Some(Report::new("MPDTypeInspector", Severity::Info, "good").with_values(values))
    }
}

#[derive(Debug, Clone, Default)]
pub struct AdaptationSetInspectorConfig {
    /// mimeTypes that must appear in every period.
    pub mandatory_mime_types: Vec<String>,
    /// mimeTypes accepted in addition to the mandatory ones.
    pub valid_mime_types: Vec<String>,
}

/// Checks adaptation-set mimeType attributes across all periods.
pub struct AdaptationSetInspector {
    config: AdaptationSetInspectorConfig,
}

impl AdaptationSetInspector {
    pub fn new(config: AdaptationSetInspectorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DashInspector for AdaptationSetInspector {
    async fn inspect(
        &mut self,
        manifest: &Manifest,
        _segments: &dyn SegmentStore,
    ) -> Option<Report> {
        let mut no_mime_type = false;
        let mut mime_types: HashSet<&str> = HashSet::new();
        for period in &manifest.mpd.periods {
            for adaptation_set in &period.adaptation_sets {
                match adaptation_set.mime_type.as_deref() {
                    Some(mime_type) => {
                        mime_types.insert(mime_type);
                    }
                    None => no_mime_type = true,
                }
            }
        }
        let mut sorted: Vec<&str> = mime_types.iter().copied().collect();
        sorted.sort_unstable();
        let values = Values::new().with("mimeType", serde_json::json!(sorted));

        if no_mime_type {
            return Some(
                Report::new(
                    "AdaptationSetInspector",
                    Severity::Error,
                    "mimeType attribute is omitted",
                )
                .with_values(values),
            );
        }
        for mime_type in &mime_types {
            if !self.config.mandatory_mime_types.iter().any(|m| m == mime_type)
                && !self.config.valid_mime_types.iter().any(|m| m == mime_type)
            {
                return Some(
                    Report::new(
                        "AdaptationSetInspector",
                        Severity::Error,
                        format!("invalid mimeType [{mime_type}]"),
                    )
                    .with_values(values),
                );
            }
        }
        for period in &manifest.mpd.periods {
            let in_period: HashSet<&str> = period
                .adaptation_sets
                .iter()
                .filter_map(|a| a.mime_type.as_deref())
                .collect();
            for mandatory in &self.config.mandatory_mime_types {
                if !in_period.contains(mandatory.as_str()) {
                    return Some(
                        Report::new(
                            "AdaptationSetInspector",
                            Severity::Error,
                            format!("mimeType [{mandatory}] is mandatory"),
                        )
                        .with_values(values),
                    );
                }
            }
        }
        Some(Report::new("AdaptationSetInspector", Severity::Info, "good").with_values(values))
    }
}

/// Picture aspect ratio, e.g. 16:9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AspectRatio {
    pub x: u64,
    pub y: u64,
}

impl AspectRatio {
    /// Parse "16:9" style notation.
    pub fn parse(text: &str) -> Result<AspectRatio, String> {
        let Some((x, y)) = text.split_once(':') else {
            return Err(format!("invalid aspect ratio format: {text}"));
        };
        let x = x
            .parse()
            .map_err(|_| format!("invalid aspect ratio format: {text}"))?;
        let y = y
            .parse()
            .map_err(|_| format!("invalid aspect ratio format: {text}"))?;
        Ok(AspectRatio { x, y })
    }

    fn ratio(&self) -> f64 {
        self.x as f64 / self.y as f64
    }

    fn matches_any(&self, set: &[AspectRatio]) -> bool {
        set.iter().any(|r| (self.ratio() - r.ratio()).abs() < 0.01)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RepresentationInspectorConfig {
    pub warn_max_height: u64,
    pub error_max_height: u64,
    pub warn_min_height: u64,
    pub error_min_height: u64,
    pub valid_pars: Vec<AspectRatio>,
    pub allow_height_omission: bool,
    pub allow_width_omission: bool,
    pub warn_max_video_bandwidth: u64,
    pub error_max_video_bandwidth: u64,
    pub warn_min_video_bandwidth: u64,
    pub error_min_video_bandwidth: u64,
    pub warn_max_audio_bandwidth: u64,
    pub error_max_audio_bandwidth: u64,
    pub warn_min_audio_bandwidth: u64,
    pub error_min_audio_bandwidth: u64,
}

/// Range checks on representation resolution, PAR and bandwidth. Zero
/// thresholds are disabled.
pub struct RepresentationInspector {
    config: RepresentationInspectorConfig,
}

impl RepresentationInspector {
    pub fn new(config: RepresentationInspectorConfig) -> Self {
        Self { config }
    }
}

struct Resolution {
    height: Option<u64>,
    width: Option<u64>,
    sar: AspectRatio,
}

fn resolution_of(
    adaptation_set: &AdaptationSet,
    representation: &Representation,
) -> Result<Resolution, String> {
    let sar_text = representation
        .sar
        .as_deref()
        .or(adaptation_set.sar.as_deref());
    let sar = match sar_text {
        Some(text) => AspectRatio::parse(text)?,
        None => AspectRatio { x: 1, y: 1 },
    };
    Ok(Resolution {
        height: representation.height.or(adaptation_set.height),
        width: representation.width.or(adaptation_set.width),
        sar,
    })
}

#[async_trait]
impl DashInspector for RepresentationInspector {
    async fn inspect(
        &mut self,
        manifest: &Manifest,
        _segments: &dyn SegmentStore,
    ) -> Option<Report> {
        let fail = |message: String, values: Values| {
            Some(
                Report::new("RepresentationInspector", Severity::Error, message)
                    .with_values(values),
            )
        };

        let mut resolutions: Vec<Resolution> = Vec::new();
        let mut max_video_bandwidth = 0u64;
        let mut min_video_bandwidth = u64::MAX;
        let mut max_audio_bandwidth = 0u64;
        let mut min_audio_bandwidth = u64::MAX;
        for period in &manifest.mpd.periods {
            for adaptation_set in &period.adaptation_sets {
                let Some(mime_type) = adaptation_set.mime_type.as_deref() else {
                    return fail("mimeType attribute is omitted".to_string(), Values::new());
                };
                if adaptation_set.representations.is_empty() {
                    return fail("no representation tag".to_string(), Values::new());
                }
                for representation in &adaptation_set.representations {
                    let Some(bandwidth) = representation.bandwidth else {
                        return fail("bandwidth attribute is omitted".to_string(), Values::new());
                    };
                    match mime_type {
                        "video/mp4" => {
                            match resolution_of(adaptation_set, representation) {
                                Ok(resolution) => resolutions.push(resolution),
                                Err(reason) => return fail(reason, Values::new()),
                            }
                            max_video_bandwidth = max_video_bandwidth.max(bandwidth);
                            min_video_bandwidth = min_video_bandwidth.min(bandwidth);
                        }
                        "audio/mp4" => {
                            max_audio_bandwidth = max_audio_bandwidth.max(bandwidth);
                            min_audio_bandwidth = min_audio_bandwidth.min(bandwidth);
                        }
                        _ => {}
                    }
                }
            }
        }

        let values = Values::new()
            .with("maxVideoBandwidth", max_video_bandwidth)
            .with("minVideoBandwidth", min_video_bandwidth)
            .with("maxAudioBandwidth", max_audio_bandwidth)
            .with("minAudioBandwidth", min_audio_bandwidth);
        let config = &self.config;

        for resolution in &resolutions {
            match resolution.height {
                None => {
                    if !config.allow_height_omission {
                        return fail("height attribute is omitted".to_string(), values);
                    }
                }
                Some(height) => {
                    if config.error_max_height != 0 && height > config.error_max_height {
                        return fail("too large height".to_string(), values);
                    }
                    if config.warn_max_height != 0 && height > config.warn_max_height {
                        return Some(
                            Report::new(
                                "RepresentationInspector",
                                Severity::Warn,
                                "too large height",
                            )
                            .with_values(values),
                        );
                    }
                    if config.error_min_height != 0 && height < config.error_min_height {
                        return fail("too small height".to_string(), values);
                    }
                    if config.warn_min_height != 0 && height < config.warn_min_height {
                        return Some(
                            Report::new(
                                "RepresentationInspector",
                                Severity::Warn,
                                "too small height",
                            )
                            .with_values(values),
                        );
                    }
                }
            }
            if resolution.width.is_none() && !config.allow_width_omission {
                return fail("width attribute is omitted".to_string(), values);
            }
            if let (Some(width), Some(height)) = (resolution.width, resolution.height) {
                if !config.valid_pars.is_empty() {
                    let par = AspectRatio {
                        x: resolution.sar.x * width,
                        y: resolution.sar.y * height,
                    };
                    if !par.matches_any(&config.valid_pars) {
                        return fail(
                            format!(
                                "invalid PAR: width={width} height={height} sar=[{}:{}]",
                                resolution.sar.x, resolution.sar.y,
                            ),
                            values,
                        );
                    }
                }
            }
        }

        let band_checks = [
            (
                config.error_max_video_bandwidth,
                max_video_bandwidth > config.error_max_video_bandwidth,
                Severity::Error,
                "high video bandwidth",
            ),
            (
                config.warn_max_video_bandwidth,
                max_video_bandwidth > config.warn_max_video_bandwidth,
                Severity::Warn,
                "high video bandwidth",
            ),
            (
                config.error_min_video_bandwidth,
                min_video_bandwidth < config.error_min_video_bandwidth,
                Severity::Error,
                "low video bandwidth",
            ),
            (
                config.warn_min_video_bandwidth,
                min_video_bandwidth < config.warn_min_video_bandwidth,
                Severity::Warn,
                "low video bandwidth",
            ),
            (
                config.error_max_audio_bandwidth,
                max_audio_bandwidth > config.error_max_audio_bandwidth,
                Severity::Error,
                "high audio bandwidth",
            ),
            (
                config.warn_max_audio_bandwidth,
                max_audio_bandwidth > config.warn_max_audio_bandwidth,
                Severity::Warn,
                "high audio bandwidth",
            ),
            (
                config.error_min_audio_bandwidth,
                min_audio_bandwidth < config.error_min_audio_bandwidth,
                Severity::Error,
                "low audio bandwidth",
            ),
            (
                config.warn_min_audio_bandwidth,
                min_audio_bandwidth < config.warn_min_audio_bandwidth,
                Severity::Warn,
                "low audio bandwidth",
            ),
        ];
        for (threshold, violated, severity, message) in band_checks {
            if threshold != 0 && violated {
                return Some(
                    Report::new("RepresentationInspector", severity, message)
                        .with_values(values),
                );
            }
        }

        Some(Report::new("RepresentationInspector", Severity::Info, "good").with_values(values))
    }
}

#[derive(Debug, Clone)]
pub struct PresentationDelayInspectorConfig {
    /// Extra slack before warning. Applied additively to both window edges.
    pub warn: Duration,
    /// Extra slack before erroring.
    pub error: Duration,
}

impl Default for PresentationDelayInspectorConfig {
    fn default() -> Self {
        Self {
            warn: Duration::from_secs(2),
            error: Duration::ZERO,
        }
    }
}

/// Checks that the manifest's presentation window, shifted by
/// `suggestedPresentationDelay`, brackets the wall clock. The wall clock is
/// taken from a direct `UTCTiming` element, else `MPD@publishTime`, else
/// the local clock.
pub struct PresentationDelayInspector {
    config: PresentationDelayInspectorConfig,
}

impl PresentationDelayInspector {
    pub fn new() -> Self {
        Self::with_config(PresentationDelayInspectorConfig::default())
    }

    pub fn with_config(config: PresentationDelayInspectorConfig) -> Self {
        Self { config }
    }
}

impl Default for PresentationDelayInspector {
    fn default() -> Self {
        Self::new()
    }
}

const UTC_TIMING_DIRECT: &str = "urn:mpeg:dash:utc:direct:2014";

#[async_trait]
impl DashInspector for PresentationDelayInspector {
    async fn inspect(
        &mut self,
        manifest: &Manifest,
        _segments: &dyn SegmentStore,
    ) -> Option<Report> {
        let fail = |message: &str, reason: String| {
            Some(
                Report::new("PresentationDelayInspector", Severity::Error, message)
                    .with_values(Values::new().with("error", reason)),
            )
        };

        if !manifest.is_dynamic() {
            return Some(Report::new(
                "PresentationDelayInspector",
                Severity::Info,
                "skip static manifest",
            ));
        }

        let direct_timing = manifest
            .mpd
            .utc_timing
            .as_ref()
            .filter(|t| t.scheme_id_uri.as_deref() == Some(UTC_TIMING_DIRECT))
            .and_then(|t| t.value.as_deref());
        let wall_clock: DateTime<Utc> = if let Some(value) = direct_timing {
            match DateTime::parse_from_rfc3339(value) {
                Ok(parsed) => parsed.with_timezone(&Utc),
                Err(err) => return fail("invalid UTCTiming@value", err.to_string()),
            }
        } else if let Some(publish_time) = manifest.mpd.publish_time.as_deref() {
            match DateTime::parse_from_rfc3339(publish_time) {
                Ok(parsed) => parsed.with_timezone(&Utc),
                Err(err) => return fail("invalid MPD@publishTime", err.to_string()),
            }
        } else {
            Utc::now()
        };

        let suggested_delay = match manifest.suggested_presentation_delay() {
            Ok(delay) => delay.unwrap_or_default(),
            Err(err) => {
                return fail("invalid MPD@suggestedPresentationDelay", err.to_string());
            }
        };

        let availability_start: DateTime<Utc> =
            match manifest.mpd.availability_start_time.as_deref() {
                Some(value) => match DateTime::parse_from_rfc3339(value) {
                    Ok(parsed) => parsed.with_timezone(&Utc),
                    Err(err) => return fail("invalid MPD@availabilityStartTime", err.to_string()),
                },
                None => DateTime::<Utc>::UNIX_EPOCH,
            };

        let mut earliest: Option<DateTime<Utc>> = None;
        let mut latest: Option<DateTime<Utc>> = None;
        let walk = manifest.each_segment(|segment| {
            if segment.initialization {
                return;
            }
            let period_start = segment
                .period_start
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            let offset = segment.presentation_time_offset.unwrap_or(0);
            let timescale = segment.timescale.unwrap_or(1).max(1) as f64;
            let start_ticks = segment.time as i64 - offset as i64;
            let start_seconds = period_start + start_ticks as f64 / timescale;
            let start = availability_start
                + chrono::Duration::nanoseconds((start_seconds * 1e9) as i64);
            if earliest.map(|e| start < e).unwrap_or(true) {
                earliest = Some(start);
            }
            let end_seconds =
                period_start + (start_ticks + segment.duration as i64) as f64 / timescale;
            let end = availability_start
                + chrono::Duration::nanoseconds((end_seconds * 1e9) as i64);
            if latest.map(|l| end > l).unwrap_or(true) {
                latest = Some(end);
            }
        });
        if let Err(err) = walk {
            return fail("unexpected error", err.to_string());
        }
        let (Some(earliest), Some(latest)) = (earliest, latest) else {
            return Some(Report::new(
                "PresentationDelayInspector",
                Severity::Info,
                "no media segments",
            ));
        };

        let suggested =
            chrono::Duration::from_std(suggested_delay).unwrap_or_else(|_| chrono::Duration::zero());
        let warn =
            chrono::Duration::from_std(self.config.warn).unwrap_or_else(|_| chrono::Duration::zero());
        let error =
            chrono::Duration::from_std(self.config.error).unwrap_or_else(|_| chrono::Duration::zero());
        let values = Values::new()
            .with("earliestVideoTime", earliest.to_rfc3339())
            .with("latestVideoTime", latest.to_rfc3339())
            .with("wallClock", wall_clock.to_rfc3339())
            .with("suggestedPresentationDelay", suggested_delay.as_secs_f64());

        let earliest_render = earliest + suggested;
        let latest_render = latest + suggested;
        if earliest_render + error > wall_clock {
            return Some(
                Report::new(
                    "PresentationDelayInspector",
                    Severity::Error,
                    "earliest segment is out of suggested time range",
                )
                .with_values(values),
            );
        }
        if earliest_render + warn > wall_clock {
            return Some(
                Report::new(
                    "PresentationDelayInspector",
                    Severity::Warn,
                    "earliest segment is out of suggested time range",
                )
                .with_values(values),
            );
        }
        if latest_render - error < wall_clock {
            return Some(
                Report::new(
                    "PresentationDelayInspector",
                    Severity::Error,
                    "latest segment is out of suggested time range",
                )
                .with_values(values),
            );
        }
        if latest_render - warn < wall_clock {
            return Some(
                Report::new(
                    "PresentationDelayInspector",
                    Severity::Warn,
                    "latest segment is out of suggested time range",
                )
                .with_values(values),
            );
        }
        Some(Report::new("PresentationDelayInspector", Severity::Info, "good").with_values(values))
    }
}
