//! MPEG-DASH manifest model, `SegmentTemplate` resolution and the
//! location-aware manifest downloader.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::MonitorError;
use crate::http::Fetcher;

/// Parsed MPD tree, restricted to the subset the monitoring engine reads.
/// Unknown elements and attributes are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Mpd {
    #[serde(rename = "@type")]
    pub mpd_type: Option<String>,
    #[serde(rename = "@availabilityStartTime")]
    pub availability_start_time: Option<String>,
    #[serde(rename = "@publishTime")]
    pub publish_time: Option<String>,
    #[serde(rename = "@minimumUpdatePeriod")]
    pub minimum_update_period: Option<String>,
    #[serde(rename = "@suggestedPresentationDelay")]
    pub suggested_presentation_delay: Option<String>,
    #[serde(rename = "Location")]
    pub location: Option<String>,
    #[serde(rename = "BaseURL")]
    pub base_url: Option<String>,
    #[serde(rename = "UTCTiming")]
    pub utc_timing: Option<UtcTiming>,
    #[serde(rename = "Period", default)]
    pub periods: Vec<Period>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UtcTiming {
    #[serde(rename = "@schemeIdUri")]
    pub scheme_id_uri: Option<String>,
    #[serde(rename = "@value")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Period {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@start")]
    pub start: Option<String>,
    #[serde(rename = "AdaptationSet", default)]
    pub adaptation_sets: Vec<AdaptationSet>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdaptationSet {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@contentType")]
    pub content_type: Option<String>,
    #[serde(rename = "@mimeType")]
    pub mime_type: Option<String>,
    #[serde(rename = "@width")]
    pub width: Option<u64>,
    #[serde(rename = "@height")]
    pub height: Option<u64>,
    #[serde(rename = "@sar")]
    pub sar: Option<String>,
    #[serde(rename = "SegmentTemplate")]
    pub segment_template: Option<SegmentTemplate>,
    #[serde(rename = "Representation", default)]
    pub representations: Vec<Representation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Representation {
    #[serde(rename = "@id")]
    pub id: Option<String>,
    #[serde(rename = "@bandwidth")]
    pub bandwidth: Option<u64>,
    #[serde(rename = "@width")]
    pub width: Option<u64>,
    #[serde(rename = "@height")]
    pub height: Option<u64>,
    #[serde(rename = "@sar")]
    pub sar: Option<String>,
    #[serde(rename = "@mimeType")]
    pub mime_type: Option<String>,
    #[serde(rename = "@codecs")]
    pub codecs: Option<String>,
    #[serde(rename = "SegmentTemplate")]
    pub segment_template: Option<SegmentTemplate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SegmentTemplate {
    #[serde(rename = "@initialization")]
    pub initialization: Option<String>,
    #[serde(rename = "@media")]
    pub media: Option<String>,
    #[serde(rename = "@startNumber")]
    pub start_number: Option<u64>,
    #[serde(rename = "@timescale")]
    pub timescale: Option<u64>,
    #[serde(rename = "@presentationTimeOffset")]
    pub presentation_time_offset: Option<u64>,
    #[serde(rename = "@duration")]
    pub duration: Option<u64>,
    #[serde(rename = "SegmentTimeline")]
    pub segment_timeline: Option<SegmentTimeline>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SegmentTimeline {
    #[serde(rename = "S", default)]
    pub segments: Vec<S>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct S {
    #[serde(rename = "@t")]
    pub t: Option<u64>,
    #[serde(rename = "@d")]
    pub d: u64,
    #[serde(rename = "@r")]
    pub r: Option<i64>,
}

/// Values substituted into a `SegmentTemplate` format string.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateParams<'a> {
    pub representation_id: &'a str,
    pub number: u64,
    pub bandwidth: u64,
    pub time: u64,
}

/// Expand the dollar-delimited `SegmentTemplate` substitution language.
///
/// Recognised tokens are `$RepresentationID$`, `$Number$`, `$Bandwidth$`,
/// `$Time$` and the literal `$$`. Unrecognised dollar-delimited tokens are
/// emitted verbatim, delimiters included.
pub fn resolve_template(format: &str, params: &TemplateParams<'_>) -> String {
    let parts: Vec<&str> = format.split('$').collect();
    let mut out = String::with_capacity(format.len());
    for (i, part) in parts.iter().enumerate() {
        if i % 2 == 0 {
            out.push_str(part);
        } else if part.is_empty() {
            out.push('$');
        } else if *part == "RepresentationID" {
            out.push_str(params.representation_id);
        } else if *part == "Number" {
            out.push_str(&params.number.to_string());
        } else if *part == "Bandwidth" {
            out.push_str(&params.bandwidth.to_string());
        } else if *part == "Time" {
            out.push_str(&params.time.to_string());
        } else {
            // Unrecognised token: emit it verbatim. The closing delimiter
            // exists only when the input did not end mid-token.
            out.push('$');
            out.push_str(part);
            if i != parts.len() - 1 {
                out.push('$');
            }
        }
    }
    out
}

fn parse_xs_duration(value: &str) -> Result<Duration, MonitorError> {
    let parsed = iso8601_duration::Duration::parse(value)
        .map_err(|_| MonitorError::decode(value, "invalid xs:duration"))?;
    parsed
        .to_std()
        .ok_or_else(|| MonitorError::decode(value, "xs:duration with calendar components"))
}

/// A segment reference expanded from a `SegmentTemplate` timeline.
///
/// Carries the scalar context fields filters and inspectors read, so it does
/// not borrow from the manifest and is dropped with the poll that produced
/// it. For init segments `time` and `duration` are zero.
#[derive(Debug, Clone)]
pub struct DashSegment {
    pub url: Url,
    pub initialization: bool,
    pub time: u64,
    pub duration: u64,
    pub representation_id: Option<String>,
    pub bandwidth: Option<u64>,
    /// Parsed `Period@start`, when present and parseable.
    pub period_start: Option<Duration>,
    pub timescale: Option<u64>,
    pub presentation_time_offset: Option<u64>,
}

/// Fetched manifest together with its resolved URL and fetch time.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub url: Url,
    pub raw: Bytes,
    pub time: DateTime<Utc>,
    pub mpd: Mpd,
}

impl Deref for Manifest {
    type Target = Mpd;

    fn deref(&self) -> &Self::Target {
        &self.mpd
    }
}

impl Manifest {
    /// Base URL for segment resolution: an embedded `BaseURL` resolved
    /// against the fetch URL, or the fetch URL itself.
    pub fn base_url(&self) -> Result<Url, MonitorError> {
        match self.mpd.base_url.as_deref() {
            Some(base) if !base.is_empty() => self
                .url
                .join(base)
                .map_err(|e| MonitorError::invalid_url(base, e.to_string())),
            _ => Ok(self.url.clone()),
        }
    }

    /// `true` when `MPD@type` is "dynamic". An absent type means static.
    pub fn is_dynamic(&self) -> bool {
        self.mpd.mpd_type.as_deref() == Some("dynamic")
    }

    /// Parsed `MPD@minimumUpdatePeriod`. `Ok(None)` when absent.
    pub fn minimum_update_period(&self) -> Result<Option<Duration>, MonitorError> {
        self.mpd
            .minimum_update_period
            .as_deref()
            .map(parse_xs_duration)
            .transpose()
    }

    /// Parsed `MPD@suggestedPresentationDelay`. `Ok(None)` when absent.
    pub fn suggested_presentation_delay(&self) -> Result<Option<Duration>, MonitorError> {
        self.mpd
            .suggested_presentation_delay
            .as_deref()
            .map(parse_xs_duration)
            .transpose()
    }

    /// Walk every segment the manifest describes, init segments first within
    /// each representation.
    pub fn each_segment(
        &self,
        mut handle: impl FnMut(&DashSegment),
    ) -> Result<(), MonitorError> {
        let base_url = self.base_url()?;
        for period in &self.mpd.periods {
            let period_start = period
                .start
                .as_deref()
                .and_then(|s| parse_xs_duration(s).ok());
            for adaptation_set in &period.adaptation_sets {
                for representation in &adaptation_set.representations {
                    let template = adaptation_set
                        .segment_template
                        .as_ref()
                        .or(representation.segment_template.as_ref());
                    let Some(template) = template else {
                        continue;
                    };
                    visit_timeline_segments(
                        &base_url,
                        template,
                        period_start,
                        representation,
                        &mut handle,
                    )?;
                }
            }
        }
        Ok(())
    }

    pub fn segments(&self) -> Result<Vec<DashSegment>, MonitorError> {
        let mut segments = Vec::new();
        self.each_segment(|segment| segments.push(segment.clone()))?;
        Ok(segments)
    }
}

fn visit_timeline_segments(
    base_url: &Url,
    template: &SegmentTemplate,
    period_start: Option<Duration>,
    representation: &Representation,
    handle: &mut impl FnMut(&DashSegment),
) -> Result<(), MonitorError> {
    let representation_id = representation.id.as_deref().unwrap_or("");
    let bandwidth = representation.bandwidth.unwrap_or(0);
    let mut number = template.start_number.unwrap_or(0);

    if let Some(initialization) = &template.initialization {
        let path = resolve_template(
            initialization,
            &TemplateParams {
                representation_id,
                bandwidth,
                ..Default::default()
            },
        );
        let url = base_url
            .join(&path)
            .map_err(|e| MonitorError::invalid_url(&path, e.to_string()))?;
        handle(&DashSegment {
            url,
            initialization: true,
            time: 0,
            duration: 0,
            representation_id: representation.id.clone(),
            bandwidth: representation.bandwidth,
            period_start,
            timescale: template.timescale,
            presentation_time_offset: template.presentation_time_offset,
        });
    }

    let (Some(timeline), Some(media)) = (&template.segment_timeline, &template.media) else {
        return Ok(());
    };
    let mut time = 0u64;
    for s in &timeline.segments {
        let repeat = s.r.map(|r| r + 1).unwrap_or(1);
        if let Some(t) = s.t {
            time = t;
        }
        for _ in 0..repeat {
            let path = resolve_template(
                media,
                &TemplateParams {
                    representation_id,
                    number,
                    bandwidth,
                    time,
                },
            );
            let url = base_url
                .join(&path)
                .map_err(|e| MonitorError::invalid_url(&path, e.to_string()))?;
            handle(&DashSegment {
                url,
                initialization: false,
                time,
                duration: s.d,
                representation_id: representation.id.clone(),
                bandwidth: representation.bandwidth,
                period_start,
                timescale: template.timescale,
                presentation_time_offset: template.presentation_time_offset,
            });
            time += s.d;
            number += 1;
        }
    }
    Ok(())
}

/// Downloads and decodes the MPD for one stream, following a
/// server-supplied `MPD@Location` on subsequent polls.
pub(crate) struct DashManifestDownloader {
    fetcher: Arc<dyn Fetcher>,
    timeout: Duration,
    location: Option<Url>,
}

impl DashManifestDownloader {
    pub fn new(fetcher: Arc<dyn Fetcher>, timeout: Duration) -> Self {
        Self {
            fetcher,
            timeout,
            location: None,
        }
    }

    pub async fn download(
        &mut self,
        token: &CancellationToken,
        url: &Url,
    ) -> Result<Manifest, MonitorError> {
        let target = self.location.clone().unwrap_or_else(|| url.clone());
        let fetched = match tokio::time::timeout(self.timeout, self.fetcher.get(token, &target))
            .await
        {
            Ok(Ok(fetched)) => fetched,
            Ok(Err(err)) => return Err(MonitorError::manifest_fetch(&target, err)),
            Err(_) => return Err(MonitorError::timeout(format!("manifest download: {target}"))),
        };

        let text = std::str::from_utf8(&fetched.body)
            .map_err(|e| MonitorError::decode(&target, e))?;
        let mpd: Mpd =
            quick_xml::de::from_str(text).map_err(|e| MonitorError::decode(&target, e))?;

        if let Some(location) = mpd.location.as_deref() {
            if !location.is_empty() {
                self.location = Some(
                    fetched
                        .final_url
                        .join(location)
                        .map_err(|e| MonitorError::invalid_url(location, e.to_string()))?,
                );
            }
        }
        Ok(Manifest {
            url: fetched.final_url,
            raw: fetched.body,
            time: Utc::now(),
            mpd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testutil::MockFetcher;

    const TIMELINE_MPD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic" minimumUpdatePeriod="PT5S">
  <BaseURL>./bar/</BaseURL>
  <Period id="1" start="PT0S">
    <AdaptationSet mimeType="video/mp4">
      <SegmentTemplate timescale="90000" initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/$Time$.mp4">
        <SegmentTimeline>
          <S t="1000000" d="90000"/>
          <S d="80000" r="2"/>
          <S d="70000" r="1"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="r0" bandwidth="2000000" width="1920" height="1080"/>
      <Representation id="r1" bandwidth="500000" width="640" height="360"/>
    </AdaptationSet>
  </Period>
</MPD>
"#;

    fn manifest(xml: &str, url: &str) -> Manifest {
        Manifest {
            url: Url::parse(url).unwrap(),
            raw: Bytes::copy_from_slice(xml.as_bytes()),
            time: Utc::now(),
            mpd: quick_xml::de::from_str(xml).unwrap(),
        }
    }

    #[test]
    fn resolve_template_substitutes_each_token_once() {
        let out = resolve_template(
            "$RepresentationID$/$Number$-$Bandwidth$-$Time$.m4s",
            &TemplateParams {
                representation_id: "video1",
                number: 42,
                bandwidth: 1500000,
                time: 987654,
            },
        );
        assert_eq!(out, "video1/42-1500000-987654.m4s");
    }

    #[test]
    fn resolve_template_unescapes_double_dollar() {
        let out = resolve_template("cost$$#$Number$", &TemplateParams {
            number: 7,
            ..Default::default()
        });
        assert_eq!(out, "cost$#7");
    }

    #[test]
    fn resolve_template_passes_unknown_tokens_through() {
        let out = resolve_template("$Unknown$/x", &TemplateParams::default());
        assert_eq!(out, "$Unknown$/x");
        let out = resolve_template("x/$Trailing$", &TemplateParams::default());
        assert_eq!(out, "x/$Trailing$");
        // An input that ends mid-token has no closing delimiter to emit.
        assert_eq!(
            resolve_template("a$Tail", &TemplateParams::default()),
            "a$Tail",
        );
    }

    #[test]
    fn timeline_expands_repeats_into_absolute_urls() {
        let manifest = manifest(TIMELINE_MPD, "http://origin.test/foo/manifest.mpd");
        let segments = manifest.segments().unwrap();

        // Two representations x (init + 6 media segments), resolved against
        // the embedded BaseURL.
        assert_eq!(segments.len(), 14);
        assert_eq!(
            segments[0].url.as_str(),
            "http://origin.test/foo/bar/r0/init.mp4",
        );
        assert!(segments[0].initialization);

        let times: Vec<u64> = segments[1..7].iter().map(|s| s.time).collect();
        assert_eq!(times, vec![1000000, 1090000, 1170000, 1250000, 1330000, 1400000]);
        assert_eq!(
            segments[1].url.as_str(),
            "http://origin.test/foo/bar/r0/1000000.mp4",
        );
        let r1_times: Vec<u64> = segments[8..14].iter().map(|s| s.time).collect();
        assert_eq!(r1_times, vec![1000000, 1090000, 1170000, 1250000, 1330000, 1400000]);

        assert_eq!(segments[1].bandwidth, Some(2000000));
        assert_eq!(segments[1].timescale, Some(90000));
        assert_eq!(segments[1].duration, 90000);
    }

    #[test]
    fn base_url_element_overrides_fetch_url() {
        let xml = r#"<MPD type="static"><BaseURL>./bar/</BaseURL></MPD>"#;
        let manifest = manifest(xml, "http://origin.test/foo/manifest.mpd");
        assert_eq!(
            manifest.base_url().unwrap().as_str(),
            "http://origin.test/foo/bar/",
        );
    }

    #[test]
    fn minimum_update_period_parses_xs_duration() {
        let manifest = manifest(TIMELINE_MPD, "http://origin.test/manifest.mpd");
        assert!(manifest.is_dynamic());
        assert_eq!(
            manifest.minimum_update_period().unwrap(),
            Some(Duration::from_secs(5)),
        );
    }

    #[test]
    fn static_mpd_is_not_dynamic() {
        let manifest1 = manifest(r#"<MPD type="static"></MPD>"#, "http://origin.test/a.mpd");
        assert!(!manifest1.is_dynamic());
        let manifest2 = manifest(r#"<MPD></MPD>"#, "http://origin.test/a.mpd");
        assert!(!manifest2.is_dynamic());
    }

    #[tokio::test]
    async fn downloader_follows_mpd_location_on_next_poll() {
        let relocated = TIMELINE_MPD.replace(
            "minimumUpdatePeriod=\"PT5S\">",
            "minimumUpdatePeriod=\"PT5S\">\n  <Location>http://moved.test/manifest.mpd</Location>",
        );
        let mock = Arc::new(
            MockFetcher::new()
                .body("http://origin.test/manifest.mpd", &relocated)
                .body("http://moved.test/manifest.mpd", TIMELINE_MPD),
        );
        let mut downloader = DashManifestDownloader::new(
            Arc::clone(&mock) as Arc<dyn Fetcher>,
            Duration::from_secs(1),
        );
        let token = CancellationToken::new();
        let url = Url::parse("http://origin.test/manifest.mpd").unwrap();

        let first = downloader.download(&token, &url).await.unwrap();
        assert_eq!(first.url.as_str(), "http://origin.test/manifest.mpd");

        let second = downloader.download(&token, &url).await.unwrap();
        assert_eq!(second.url.as_str(), "http://moved.test/manifest.mpd");
        assert_eq!(mock.call_count("http://origin.test/manifest.mpd"), 1);
        assert_eq!(mock.call_count("http://moved.test/manifest.mpd"), 1);
    }

    #[tokio::test]
    async fn undecodable_manifest_is_permanent() {
        let mock = MockFetcher::new().body("http://origin.test/bad.mpd", "<MPD><unclosed>");
        let mut downloader =
            DashManifestDownloader::new(Arc::new(mock), Duration::from_secs(1));
        let token = CancellationToken::new();
        let url = Url::parse("http://origin.test/bad.mpd").unwrap();

        let err = downloader.download(&token, &url).await.unwrap_err();
        assert!(matches!(err, MonitorError::Decode { .. }));
        assert!(!err.is_retryable());
    }
}
