//! Segment filters: decide per segment whether the monitor downloads it.

use std::sync::Arc;

use crate::dash::DashSegment;
use crate::hls::HlsSegment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    Pass,
    Reject,
}

/// Pluggable per-segment predicate consulted before the segment store sync.
pub trait SegmentFilter: Send + Sync {
    fn check_hls(&self, segment: &HlsSegment) -> FilterResult;
    fn check_dash(&self, segment: &DashSegment) -> FilterResult;
}

/// Passes only when every member passes.
pub fn and(filters: Vec<Arc<dyn SegmentFilter>>) -> Arc<dyn SegmentFilter> {
    Arc::new(And { filters })
}

struct And {
    filters: Vec<Arc<dyn SegmentFilter>>,
}

impl SegmentFilter for And {
    fn check_hls(&self, segment: &HlsSegment) -> FilterResult {
        for filter in &self.filters {
            if filter.check_hls(segment) == FilterResult::Reject {
                return FilterResult::Reject;
            }
        }
        FilterResult::Pass
    }

    fn check_dash(&self, segment: &DashSegment) -> FilterResult {
        for filter in &self.filters {
            if filter.check_dash(segment) == FilterResult::Reject {
                return FilterResult::Reject;
            }
        }
        FilterResult::Pass
    }
}

/// Passes when any member passes. Rejects everything when empty.
pub fn or(filters: Vec<Arc<dyn SegmentFilter>>) -> Arc<dyn SegmentFilter> {
    Arc::new(Or { filters })
}

struct Or {
    filters: Vec<Arc<dyn SegmentFilter>>,
}

impl SegmentFilter for Or {
    fn check_hls(&self, segment: &HlsSegment) -> FilterResult {
        for filter in &self.filters {
            if filter.check_hls(segment) == FilterResult::Pass {
                return FilterResult::Pass;
            }
        }
        FilterResult::Reject
    }

    fn check_dash(&self, segment: &DashSegment) -> FilterResult {
        for filter in &self.filters {
            if filter.check_dash(segment) == FilterResult::Pass {
                return FilterResult::Pass;
            }
        }
        FilterResult::Reject
    }
}

/// Rejects every segment; disables segment download entirely.
pub fn reject_all() -> Arc<dyn SegmentFilter> {
    Arc::new(RejectAll)
}

struct RejectAll;

impl SegmentFilter for RejectAll {
    fn check_hls(&self, _segment: &HlsSegment) -> FilterResult {
        FilterResult::Reject
    }

    fn check_dash(&self, _segment: &DashSegment) -> FilterResult {
        FilterResult::Reject
    }
}

/// Passes segments whose variant/representation bandwidth is at most
/// `bandwidth`. Segments without a bandwidth are rejected.
pub fn max_bandwidth(bandwidth: u64) -> Arc<dyn SegmentFilter> {
    Arc::new(MaxBandwidth { bandwidth })
}

struct MaxBandwidth {
    bandwidth: u64,
}

impl SegmentFilter for MaxBandwidth {
    fn check_hls(&self, segment: &HlsSegment) -> FilterResult {
        match segment.bandwidth {
            Some(b) if b <= self.bandwidth => FilterResult::Pass,
            _ => FilterResult::Reject,
        }
    }

    fn check_dash(&self, segment: &DashSegment) -> FilterResult {
        match segment.bandwidth {
            Some(b) if b <= self.bandwidth => FilterResult::Pass,
            _ => FilterResult::Reject,
        }
    }
}

/// Passes segments whose variant/representation bandwidth is at least
/// `bandwidth`. Segments without a bandwidth are rejected.
pub fn min_bandwidth(bandwidth: u64) -> Arc<dyn SegmentFilter> {
    Arc::new(MinBandwidth { bandwidth })
}

struct MinBandwidth {
    bandwidth: u64,
}

impl SegmentFilter for MinBandwidth {
    fn check_hls(&self, segment: &HlsSegment) -> FilterResult {
        match segment.bandwidth {
            Some(b) if b >= self.bandwidth => FilterResult::Pass,
            _ => FilterResult::Reject,
        }
    }

    fn check_dash(&self, segment: &DashSegment) -> FilterResult {
        match segment.bandwidth {
            Some(b) if b >= self.bandwidth => FilterResult::Pass,
            _ => FilterResult::Reject,
        }
    }
}

/// Deterministic URL-hash sampling: passes roughly `rate` of all segments,
/// and always the same ones for a given URL.
pub fn hash_sampling(rate: f64) -> Arc<dyn SegmentFilter> {
    Arc::new(HashSampling { rate })
}

struct HashSampling {
    rate: f64,
}

impl HashSampling {
    fn check(&self, url: &url::Url) -> FilterResult {
        let hash = crc32fast::hash(url.as_str().as_bytes());
        if (hash as f64) / (u32::MAX as f64) < self.rate {
            FilterResult::Pass
        } else {
            FilterResult::Reject
        }
    }
}

impl SegmentFilter for HashSampling {
    fn check_hls(&self, segment: &HlsSegment) -> FilterResult {
        self.check(&segment.url)
    }

    fn check_dash(&self, segment: &DashSegment) -> FilterResult {
        self.check(&segment.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn hls_segment(bandwidth: Option<u64>) -> HlsSegment {
        HlsSegment {
            url: Url::parse("http://cdn.test/v/seg1.ts").unwrap(),
            bandwidth,
            group_id: None,
        }
    }

    #[test]
    fn bandwidth_filters_band_pass() {
        let low = hls_segment(Some(500_000));
        let high = hls_segment(Some(5_000_000));
        let unknown = hls_segment(None);

        let max = max_bandwidth(1_000_000);
        assert_eq!(max.check_hls(&low), FilterResult::Pass);
        assert_eq!(max.check_hls(&high), FilterResult::Reject);
        assert_eq!(max.check_hls(&unknown), FilterResult::Reject);

        let min = min_bandwidth(1_000_000);
        assert_eq!(min.check_hls(&low), FilterResult::Reject);
        assert_eq!(min.check_hls(&high), FilterResult::Pass);
    }

    #[test]
    fn and_rejects_if_any_member_rejects() {
        let filter = and(vec![max_bandwidth(10_000_000), min_bandwidth(1_000_000)]);
        assert_eq!(filter.check_hls(&hls_segment(Some(2_000_000))), FilterResult::Pass);
        assert_eq!(filter.check_hls(&hls_segment(Some(500_000))), FilterResult::Reject);
        // Empty AND passes everything.
        assert_eq!(and(vec![]).check_hls(&hls_segment(None)), FilterResult::Pass);
    }

    #[test]
    fn or_passes_if_any_member_passes() {
        let filter = or(vec![max_bandwidth(600_000), min_bandwidth(4_000_000)]);
        assert_eq!(filter.check_hls(&hls_segment(Some(500_000))), FilterResult::Pass);
        assert_eq!(filter.check_hls(&hls_segment(Some(5_000_000))), FilterResult::Pass);
        assert_eq!(filter.check_hls(&hls_segment(Some(2_000_000))), FilterResult::Reject);
    }

    #[test]
    fn reject_all_rejects() {
        assert_eq!(
            reject_all().check_hls(&hls_segment(Some(1))),
            FilterResult::Reject,
        );
    }

    #[test]
    fn hash_sampling_is_deterministic_and_monotone() {
        let segment = hls_segment(None);
        let zero = hash_sampling(0.0);
        let all = hash_sampling(1.1);
        assert_eq!(zero.check_hls(&segment), FilterResult::Reject);
        assert_eq!(all.check_hls(&segment), FilterResult::Pass);

        let half = hash_sampling(0.5);
        assert_eq!(half.check_hls(&segment), half.check_hls(&segment));
    }
}
