//! Windowed severity filter converting report streams into alarm/recover
//! edges.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::handler::OnReportHandler;
use crate::report::Severity;

pub struct AlarmConfig {
    pub on_alarm: OnReportHandler,
    pub on_recover: OnReportHandler,
    /// Number of recent polls considered.
    pub window: usize,
    /// Fire `on_alarm` once the window holds at least this many
    /// Error-severity polls.
    pub alarm_if_error_ge: usize,
    /// Fire `on_recover` (while alarmed) once the window holds at least this
    /// many Info-severity polls.
    pub recover_if_info_ge: usize,
}

struct AlarmState {
    history: VecDeque<Severity>,
    alarmed: bool,
}

/// Wrap alarm/recover callbacks into a report handler with hysteresis:
/// edges fire on state transitions only, so a persistently bad (or good)
/// stream does not flap.
///
/// The returned handler assumes serial invocation, which the monitor
/// guarantees for a single stream; feeding it from several monitors
/// requires external ordering.
pub fn alarm(config: AlarmConfig) -> OnReportHandler {
    let state = Mutex::new(AlarmState {
        history: VecDeque::with_capacity(config.window + 1),
        alarmed: false,
    });
    Arc::new(move |reports| {
        let mut state = state.lock().unwrap();
        state.history.push_back(reports.worst_severity());
        if state.history.len() > config.window {
            state.history.pop_front();
        }
        let errors = state
            .history
            .iter()
            .filter(|s| **s == Severity::Error)
            .count();
        let infos = state
            .history
            .iter()
            .filter(|s| **s == Severity::Info)
            .count();

        if errors >= config.alarm_if_error_ge {
            if !state.alarmed {
                state.alarmed = true;
                drop(state);
                (config.on_alarm)(reports);
            }
        } else if infos >= config.recover_if_info_ge && state.alarmed {
            state.alarmed = false;
            drop(state);
            (config.on_recover)(reports);
        }
    })
}
