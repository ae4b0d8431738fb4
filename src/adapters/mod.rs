//! Report-handler adapters: alarm debouncing and log sinks.

mod alarm;
mod report_log;

pub use alarm::{AlarmConfig, alarm};
pub use report_log::{ReportLogConfig, report_logger, report_tracer};
