//! Severity-graded reports produced by inspectors and surfaced per poll.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Report severity. Totally ordered: `Info < Warn < Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Severity {
    #[default]
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARNING",
            Severity::Error => "ERROR",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INFO" => Ok(Severity::Info),
            "WARNING" => Ok(Severity::Warn),
            "ERROR" => Ok(Severity::Error),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

impl Serialize for Severity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

/// Worst (highest) of the given severities. `Info` when empty.
pub fn worst_severity(severities: impl IntoIterator<Item = Severity>) -> Severity {
    severities
        .into_iter()
        .fold(Severity::Info, |worst, s| worst.max(s))
}

/// Best (lowest) of the given severities. `Error` when empty.
pub fn best_severity(severities: impl IntoIterator<Item = Severity>) -> Severity {
    severities
        .into_iter()
        .fold(Severity::Error, |best, s| best.min(s))
}

/// Structured key/value payload attached to a report.
///
/// Keys are kept sorted so the textual rendering and JSON output are stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Values(BTreeMap<String, serde_json::Value>);

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }
}

impl fmt::Display for Values {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }
            write!(f, "{key}=[{value}]")?;
        }
        Ok(())
    }
}

/// A single named finding from one inspector (or the monitor itself).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub name: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub values: Values,
}

impl Report {
    pub fn new(name: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            severity,
            message: message.into(),
            values: Values::new(),
        }
    }

    pub fn with_values(mut self, values: Values) -> Self {
        self.values = values;
        self
    }
}

/// Reports produced by one poll, name-sorted before delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reports(Vec<Report>);

impl Reports {
    pub fn worst_severity(&self) -> Severity {
        worst_severity(self.0.iter().map(|r| r.severity))
    }

    pub fn infos(&self) -> impl Iterator<Item = &Report> {
        self.0.iter().filter(|r| r.severity == Severity::Info)
    }

    pub fn warns(&self) -> impl Iterator<Item = &Report> {
        self.0.iter().filter(|r| r.severity == Severity::Warn)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Report> {
        self.0.iter().filter(|r| r.severity == Severity::Error)
    }
}

impl From<Vec<Report>> for Reports {
    fn from(mut reports: Vec<Report>) -> Self {
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        Reports(reports)
    }
}

impl Deref for Reports {
    type Target = [Report];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'a> IntoIterator for &'a Reports {
    type Item = &'a Report;
    type IntoIter = std::slice::Iter<'a, Report>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_is_totally_ordered() {
        assert!(Severity::Info < Severity::Warn);
        assert!(Severity::Warn < Severity::Error);
    }

    #[test]
    fn worst_severity_is_max() {
        use Severity::*;
        assert_eq!(worst_severity([]), Info);
        assert_eq!(worst_severity([Info, Warn, Info]), Warn);
        assert_eq!(worst_severity([Warn, Error, Info]), Error);
        // commutative
        assert_eq!(worst_severity([Error, Info, Warn]), worst_severity([Info, Warn, Error]));
        // associative: folding in any grouping yields the max
        assert_eq!(
            worst_severity([worst_severity([Info, Error]), Warn]),
            worst_severity([Info, worst_severity([Error, Warn])]),
        );
    }

    #[test]
    fn best_severity_is_min() {
        use Severity::*;
        assert_eq!(best_severity([]), Error);
        assert_eq!(best_severity([Error, Warn]), Warn);
        assert_eq!(best_severity([Error, Info, Warn]), Info);
    }

    #[test]
    fn severity_round_trips_through_text() {
        for s in [Severity::Info, Severity::Warn, Severity::Error] {
            assert_eq!(s.as_str().parse::<Severity>().unwrap(), s);
        }
        assert!("NOTICE".parse::<Severity>().is_err());
    }

    #[test]
    fn severity_serializes_as_text() {
        assert_eq!(serde_json::to_string(&Severity::Warn).unwrap(), "\"WARNING\"");
        let s: Severity = serde_json::from_str("\"ERROR\"").unwrap();
        assert_eq!(s, Severity::Error);
    }

    #[test]
    fn values_display_is_key_sorted() {
        let values = Values::new().with("b", 2).with("a", "x");
        assert_eq!(values.to_string(), "a=[\"x\"] b=[2]");
    }

    #[test]
    fn reports_sort_by_name() {
        let reports = Reports::from(vec![
            Report::new("Zeta", Severity::Info, "ok"),
            Report::new("Alpha", Severity::Error, "bad"),
        ]);
        assert_eq!(reports[0].name, "Alpha");
        assert_eq!(reports[1].name, "Zeta");
        assert_eq!(reports.worst_severity(), Severity::Error);
        assert_eq!(reports.errors().count(), 1);
        assert_eq!(reports.infos().count(), 1);
        assert_eq!(reports.warns().count(), 0);
    }
}
