//! Error taxonomy for the pipeline.
//!
//! Two layers:
//! - `CollectError` is the closed set of failures a collector call can
//!   produce (transport, retry exhaustion, open circuit, parse).
//! - `AppError` is what the engines (matcher, deviation, metrics) and the
//!   storage layer surface to their callers.

/// Errors raised by collector HTTP/parse paths.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// Non-2xx response or transport failure.
    #[error("HTTP error for {url}: {message}")]
    Http {
        status: Option<u16>,
        url: String,
        message: String,
    },

    /// All retry attempts failed; carries the last underlying error.
    #[error("all {attempts} attempts failed: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<CollectError>,
    },

    /// The circuit breaker for this source is open; the call was not made.
    #[error("circuit open for {source_name}")]
    CircuitOpen { source_name: &'static str },

    /// Upstream payload could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),
}

impl CollectError {
    /// Status code of the underlying HTTP failure, if any (unwraps
    /// `RetryExhausted` chains).
    pub fn status(&self) -> Option<u16> {
        match self {
            CollectError::Http { status, .. } => *status,
            CollectError::RetryExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_error_status_direct() {
        let err = CollectError::Http {
            status: Some(404),
            url: "http://example.org".into(),
            message: "not found".into(),
        };
        assert_eq!(err.status(), Some(404));
    }

    #[test]
    fn test_collect_error_status_through_retry() {
        let inner = CollectError::Http {
            status: Some(503),
            url: "http://example.org".into(),
            message: "unavailable".into(),
        };
        let err = CollectError::RetryExhausted {
            attempts: 4,
            last: Box::new(inner),
        };
        assert_eq!(err.status(), Some(503));
    }

    #[test]
    fn test_circuit_open_has_no_status() {
        let err = CollectError::CircuitOpen { source_name: "AROME" };
        assert_eq!(err.status(), None);
    }

    #[test]
    fn test_retry_exhausted_message_mentions_attempts() {
        let inner = CollectError::Parse("bad json".into());
        let err = CollectError::RetryExhausted {
            attempts: 4,
            last: Box::new(inner),
        };
        let msg = err.to_string();
        assert!(msg.contains("4 attempts"), "unexpected message: {msg}");
        assert!(msg.contains("bad json"), "unexpected message: {msg}");
    }
}
