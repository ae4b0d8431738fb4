//! Client-side monitoring engine for HLS and MPEG-DASH streams.
//!
//! A [`Monitor`] polls one stream the way a player would: it fetches the
//! manifest, mirrors the advertised media segments into an in-memory
//! [`SegmentStore`], runs a configurable battery of inspectors over the
//! result, and hands each poll's severity-graded [`Reports`] to the caller.
//! A [`Manager`] multiplexes many monitors by identifier.
//!
//! ```no_run
//! use std::sync::Arc;
//! use url::Url;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut config = strobe::Config::new(
//!     Url::parse("https://example.com/live/master.m3u8").unwrap(),
//!     strobe::StreamType::Hls,
//! );
//! config.prioritize_suggested_interval = true;
//! config.hls.inspectors = vec![
//!     Box::new(strobe::inspectors::hls::SpeedInspector::new()),
//!     Box::new(strobe::inspectors::hls::VariantsSyncInspector::new()),
//! ];
//! config.on_report = Some(Arc::new(|reports| {
//!     for report in reports {
//!         println!("{}: {}: {}", report.severity, report.name, report.message);
//!     }
//! }));
//! let monitor = strobe::Monitor::spawn(config);
//! # monitor.terminate();
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod dash;
pub mod error;
pub mod filter;
pub mod handler;
pub mod hls;
mod http;
pub mod inspector;
pub mod inspectors;
pub mod manager;
pub mod monitor;
mod redirect;
pub mod report;
pub mod retry;
pub mod segment;

pub use config::{Config, DashConfig, HlsConfig, StreamType};
pub use error::MonitorError;
pub use handler::{
    OnDownloadHandler, OnReportHandler, OnTerminateHandler, merge_on_download_handlers,
    merge_on_report_handlers,
};
pub use http::{File, FileMeta};
pub use inspector::{DashInspector, HlsInspector};
pub use manager::{Manager, ManagerConfig};
pub use monitor::Monitor;
pub use report::{Report, Reports, Severity, Values, best_severity, worst_severity};
pub use retry::RetryPolicy;
pub use segment::SegmentStore;
