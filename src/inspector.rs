//! The contract between the monitor and user-supplied inspectors.

use async_trait::async_trait;

use crate::dash::Manifest;
use crate::hls::Playlists;
use crate::report::Report;
use crate::segment::SegmentStore;

/// Evaluates one poll of an HLS stream.
///
/// Inspectors may keep state across polls (`&mut self`); the monitor invokes
/// each inspector at most once per poll, never concurrently with itself.
/// Return `None` for "nothing to report". Inspectors should bound their own
/// work: in-flight calls are not cancelled.
#[async_trait]
pub trait HlsInspector: Send {
    async fn inspect(&mut self, playlists: &Playlists, segments: &dyn SegmentStore)
    -> Option<Report>;
}

/// Evaluates one poll of a DASH stream. Same contract as [`HlsInspector`].
#[async_trait]
pub trait DashInspector: Send {
    async fn inspect(&mut self, manifest: &Manifest, segments: &dyn SegmentStore)
    -> Option<Report>;
}
