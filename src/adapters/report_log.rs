//! Report sinks: a writer-backed logger and a `tracing` forwarder.

use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tracing::{error, info, warn};

use crate::handler::OnReportHandler;
use crate::report::{Reports, Severity};

#[derive(Debug, Clone, Copy)]
pub struct ReportLogConfig {
    /// Prepend a per-poll summary line (text mode only).
    pub summary: bool,
    /// Emit one JSON object per poll instead of text lines.
    pub json: bool,
    /// Reports below this severity are not written.
    pub severity: Severity,
}

impl Default for ReportLogConfig {
    fn default() -> Self {
        Self {
            summary: true,
            json: false,
            severity: Severity::Info,
        }
    }
}

/// Serialise each poll's reports to `writer`.
///
/// In JSON mode the whole batch is written as one object when its worst
/// severity reaches the floor; in text mode an optional summary line is
/// followed by one line per report at or above the floor, errors first.
pub fn report_logger<W: Write + Send + 'static>(
    config: ReportLogConfig,
    writer: W,
) -> OnReportHandler {
    let writer = Mutex::new(writer);
    Arc::new(move |reports| {
        let mut writer = writer.lock().unwrap();
        let result = if config.json {
            write_json(&config, &mut *writer, reports)
        } else {
            write_text(&config, &mut *writer, reports)
        };
        if let Err(err) = result {
            error!(error = %err, "failed to write report log");
        }
    })
}

fn write_text(
    config: &ReportLogConfig,
    writer: &mut dyn Write,
    reports: &Reports,
) -> std::io::Result<()> {
    if config.summary {
        let worst = reports.worst_severity();
        if config.severity <= worst {
            writeln!(
                writer,
                "{worst}: Summary info={} warn={} error={}",
                reports.infos().count(),
                reports.warns().count(),
                reports.errors().count(),
            )?;
        }
    }
    for report in reports.errors() {
        writeln!(writer, "ERROR: {}: {}: {}", report.name, report.message, report.values)?;
    }
    if config.severity <= Severity::Warn {
        for report in reports.warns() {
            writeln!(writer, "WARNING: {}: {}: {}", report.name, report.message, report.values)?;
        }
    }
    if config.severity <= Severity::Info {
        for report in reports.infos() {
            writeln!(writer, "INFO: {}: {}: {}", report.name, report.message, report.values)?;
        }
    }
    Ok(())
}

fn write_json(
    config: &ReportLogConfig,
    writer: &mut dyn Write,
    reports: &Reports,
) -> std::io::Result<()> {
    let worst = reports.worst_severity();
    if config.severity > worst {
        return Ok(());
    }
    let record = json!({
        "reports": reports,
        "severity": worst,
        "time": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    });
    writeln!(writer, "{record}")
}

/// Forward each report to `tracing` at its mapped level.
pub fn report_tracer(floor: Severity) -> OnReportHandler {
    Arc::new(move |reports| {
        for report in reports {
            if report.severity < floor {
                continue;
            }
            match report.severity {
                Severity::Info => {
                    info!(name = %report.name, values = %report.values, "{}", report.message);
                }
                Severity::Warn => {
                    warn!(name = %report.name, values = %report.values, "{}", report.message);
                }
                Severity::Error => {
                    error!(name = %report.name, values = %report.values, "{}", report.message);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{Report, Values};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn sample() -> Reports {
        Reports::from(vec![
            Report::new("GapProbe", Severity::Warn, "drifting")
                .with_values(Values::new().with("gap", 12.5)),
            Report::new("Monitor", Severity::Error, "failed to download segment"),
            Report::new("TypeProbe", Severity::Info, "good"),
        ])
    }

    #[test]
    fn text_mode_writes_summary_and_lines_by_severity() {
        let buf = SharedBuf::default();
        let handler = report_logger(ReportLogConfig::default(), buf.clone());
        handler(&sample());
        let out = buf.contents();
        assert!(out.starts_with("ERROR: Summary info=1 warn=1 error=1\n"));
        assert!(out.contains("ERROR: Monitor: failed to download segment: \n"));
        assert!(out.contains("WARNING: GapProbe: drifting: gap=[12.5]\n"));
        assert!(out.contains("INFO: TypeProbe: good: \n"));
    }

    #[test]
    fn severity_floor_suppresses_lower_reports() {
        let buf = SharedBuf::default();
        let handler = report_logger(
            ReportLogConfig {
                summary: false,
                json: false,
                severity: Severity::Error,
            },
            buf.clone(),
        );
        handler(&sample());
        let out = buf.contents();
        assert!(out.contains("ERROR: Monitor"));
        assert!(!out.contains("WARNING"));
        assert!(!out.contains("INFO"));
    }

    #[test]
    fn json_mode_writes_one_object_per_poll() {
        let buf = SharedBuf::default();
        let handler = report_logger(
            ReportLogConfig {
                summary: false,
                json: true,
                severity: Severity::Info,
            },
            buf.clone(),
        );
        handler(&sample());
        let out = buf.contents();
        let parsed: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(parsed["severity"], "ERROR");
        assert_eq!(parsed["reports"].as_array().unwrap().len(), 3);
        assert!(parsed["time"].as_str().is_some());
    }
}
