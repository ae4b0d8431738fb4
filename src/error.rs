use std::any::Any;

use reqwest::StatusCode;

/// Crate-wide error type.
///
/// The permanent/transient split encoded by [`MonitorError::is_retryable`] is
/// the sole contract between the HTTP layer and the retry wrappers: client
/// errors, decode failures and cancellation abort immediately, everything
/// else backs off and retries.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("unexpected status code {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("failed to decode {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("failed to download manifest: {url}: {source}")]
    ManifestFetch {
        url: String,
        #[source]
        source: Box<MonitorError>,
    },

    #[error("failed to download segment: {url}: {source}")]
    SegmentFetch {
        url: String,
        #[source]
        source: Box<MonitorError>,
    },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("panic: {reason}")]
    Panic { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl MonitorError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn decode(url: impl ToString, reason: impl ToString) -> Self {
        Self::Decode {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn manifest_fetch(url: impl ToString, source: MonitorError) -> Self {
        Self::ManifestFetch {
            url: url.to_string(),
            source: Box::new(source),
        }
    }

    pub fn segment_fetch(url: impl ToString, source: MonitorError) -> Self {
        Self::SegmentFetch {
            url: url.to_string(),
            source: Box::new(source),
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Timeout {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Converts a recovered panic payload into an error carrying the payload
    /// message.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let reason = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        Self::Panic { reason }
    }

    /// Whether the retry wrappers may attempt the operation again.
    ///
    /// 2xx never reaches here; 4xx is permanent; 5xx and anything the
    /// transport reports (connect failures, timeouts, resets) is transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::InvalidUrl { .. } | Self::Decode { .. } | Self::Panic { .. } => false,
            Self::HttpStatus { status, .. } => !status.is_client_error(),
            Self::ManifestFetch { source, .. } | Self::SegmentFetch { source, .. } => {
                source.is_retryable()
            }
            Self::Network { .. } | Self::Timeout { .. } | Self::Internal { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_permanent() {
        let err = MonitorError::HttpStatus {
            status: StatusCode::NOT_FOUND,
            url: "http://example.com/x".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_errors_are_transient() {
        let err = MonitorError::HttpStatus {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            url: "http://example.com/x".to_string(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn wrappers_delegate_classification() {
        let inner = MonitorError::HttpStatus {
            status: StatusCode::FORBIDDEN,
            url: "http://example.com/seg.ts".to_string(),
        };
        let err = MonitorError::segment_fetch("http://example.com/seg.ts", inner);
        assert!(!err.is_retryable());

        let inner = MonitorError::timeout("segment download");
        let err = MonitorError::segment_fetch("http://example.com/seg.ts", inner);
        assert!(err.is_retryable());
    }

    #[test]
    fn cancellation_is_permanent() {
        assert!(!MonitorError::Cancelled.is_retryable());
    }

    #[test]
    fn panic_payload_is_preserved() {
        let err = MonitorError::from_panic(Box::new("boom"));
        assert_eq!(err.to_string(), "panic: boom");
        assert!(!err.is_retryable());
    }
}
