//! Sliding-window comparison of wall-clock and media timelines.

/// One observation: wall-clock seconds, accumulated media seconds, and an
/// opaque segment identifier (the latest sequence number for HLS).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimePoint {
    pub real_time: f64,
    pub video_time: f64,
    pub segment_id: Option<u64>,
}

/// Measures `video_time_elapsed - real_time_elapsed` over a sliding
/// interval.
///
/// When a point is added, observations older than the window are trimmed,
/// but the newest such point is kept as the anchor so the elapsed baseline
/// always spans at least the full window.
#[derive(Debug)]
pub struct Speedometer {
    time_points: Vec<TimePoint>,
    interval: f64,
}

impl Speedometer {
    /// `interval` is the window length in seconds.
    pub fn new(interval: f64) -> Self {
        Self {
            time_points: Vec::with_capacity(8),
            interval,
        }
    }

    pub fn latest_time_point(&self) -> Option<&TimePoint> {
        self.time_points.last()
    }

    pub fn add_time_point(&mut self, time_point: TimePoint) {
        let window_start = time_point.real_time - self.interval;
        self.time_points.push(time_point);
        for i in 1..self.time_points.len() {
            if self.time_points[i].real_time > window_start {
                self.time_points.drain(..i - 1);
                break;
            }
        }
    }

    /// True once two points exist, i.e. elapsed values are meaningful.
    pub fn satisfied(&self) -> bool {
        self.time_points.len() >= 2
    }

    /// Positive when the media timeline runs ahead of the wall clock.
    pub fn gap(&self) -> f64 {
        self.video_time_elapsed() - self.real_time_elapsed()
    }

    pub fn real_time_elapsed(&self) -> f64 {
        match (self.time_points.first(), self.time_points.last()) {
            (Some(oldest), Some(latest)) if self.satisfied() => {
                latest.real_time - oldest.real_time
            }
            _ => 0.0,
        }
    }

    pub fn video_time_elapsed(&self) -> f64 {
        match (self.time_points.first(), self.time_points.last()) {
            (Some(oldest), Some(latest)) if self.satisfied() => {
                latest.video_time - oldest.video_time
            }
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(real_time: f64, video_time: f64) -> TimePoint {
        TimePoint {
            real_time,
            video_time,
            segment_id: None,
        }
    }

    #[test]
    fn empty_meter_is_unsatisfied() {
        let meter = Speedometer::new(60.0);
        assert!(meter.latest_time_point().is_none());
        assert!(!meter.satisfied());
        assert_eq!(meter.gap(), 0.0);
    }

    #[test]
    fn elapsed_values_span_oldest_to_latest() {
        let mut meter = Speedometer::new(60.0);
        meter.add_time_point(point(100.0, 0.0));
        assert!(!meter.satisfied());
        meter.add_time_point(point(110.0, 12.0));
        assert!(meter.satisfied());
        assert_eq!(meter.real_time_elapsed(), 10.0);
        assert_eq!(meter.video_time_elapsed(), 12.0);
        assert_eq!(meter.gap(), 2.0);
        assert_eq!(meter.latest_time_point().unwrap().real_time, 110.0);
    }

    #[test]
    fn window_keeps_one_anchor_outside() {
        let mut meter = Speedometer::new(10.0);
        meter.add_time_point(point(0.0, 0.0));
        meter.add_time_point(point(4.0, 4.0));
        meter.add_time_point(point(8.0, 8.0));
        // 8.0 is the first point inside (5, 15]; its predecessor 4.0 stays
        // as the anchor while 0.0 is dropped.
        meter.add_time_point(point(15.0, 15.0));
        assert_eq!(meter.real_time_elapsed(), 11.0);

        meter.add_time_point(point(30.0, 30.0));
        // Everything except 15.0 is now older than 20.0; 15.0 is kept as
        // the anchor.
        assert_eq!(meter.real_time_elapsed(), 15.0);
    }

    #[test]
    fn gap_reflects_slow_media_timeline() {
        let mut meter = Speedometer::new(600.0);
        meter.add_time_point(point(0.0, 0.0));
        meter.add_time_point(point(30.0, 12.0));
        assert_eq!(meter.gap(), -18.0);
    }
}
