//! Callback types for download, report and termination events.

use std::sync::Arc;

use crate::http::File;
use crate::report::Reports;

/// Called once per HTTP request reaching a response, including non-2xx ones.
/// Must be thread-safe and must not block the poll loop for long.
pub type OnDownloadHandler = Arc<dyn Fn(&File) + Send + Sync>;

/// Called once per poll with the name-sorted report batch.
pub type OnReportHandler = Arc<dyn Fn(&Reports) + Send + Sync>;

/// Called once when a monitor's polling loop exits.
pub type OnTerminateHandler = Arc<dyn Fn() + Send + Sync>;

/// Compose several download handlers into one, invoked in order.
pub fn merge_on_download_handlers(handlers: Vec<OnDownloadHandler>) -> OnDownloadHandler {
    Arc::new(move |file| {
        for handler in &handlers {
            handler(file);
        }
    })
}

/// Compose several report handlers into one, invoked in order.
pub fn merge_on_report_handlers(handlers: Vec<OnReportHandler>) -> OnReportHandler {
    Arc::new(move |reports| {
        for handler in &handlers {
            handler(reports);
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::report::{Report, Severity};

    #[test]
    fn merged_report_handlers_run_in_order() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&order);
        let second = Arc::clone(&order);
        let handler = merge_on_report_handlers(vec![
            Arc::new(move |_| first.lock().unwrap().push("first")),
            Arc::new(move |_| second.lock().unwrap().push("second")),
        ]);
        handler(&Reports::from(vec![Report::new("A", Severity::Info, "ok")]));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }
}
