//! Error taxonomy shared across the engine.
//!
//! Every failure carries a Temporary/Permanent classification so retry
//! loops can decide without string matching. Reportable failures are
//! additionally captured as [`ErrorReport`] records for the persisted
//! error log and the on-disk debug bundles.

mod report;
mod sink;

pub use report::{ErrorReport, Stage, MAX_SNIPPET_BYTES};
pub use sink::ErrorSink;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScrapeError>;

#[derive(Debug, Error)]
pub enum ScrapeError {
    /// Bad input from a caller; never persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An HTTP fetch that exhausted its retry budget (or was not worth
    /// retrying). `temporary` records how the last attempt was classified.
    #[error("fetch failed: {message}")]
    Fetch {
        message: String,
        status: Option<u16>,
        temporary: bool,
    },

    /// Downloaded content contradicts the expected media kind.
    #[error("asset integrity: {0}")]
    Integrity(String),

    /// Backing store I/O failed; the in-memory cache stays authoritative.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// Cancellation unwinding. Never logged as an error.
    #[error("cancelled")]
    Cancelled,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("schedule error: {0}")]
    Schedule(String),
}

impl ScrapeError {
    /// Whether the enclosing retry loop should try again.
    pub fn is_temporary(&self) -> bool {
        match self {
            ScrapeError::Fetch { temporary, .. } => *temporary,
            ScrapeError::Persistence(_) => true,
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ScrapeError::Fetch { status, .. } => *status,
            _ => None,
        }
    }

    pub fn fetch_temporary(message: impl Into<String>, status: Option<u16>) -> Self {
        ScrapeError::Fetch {
            message: message.into(),
            status,
            temporary: true,
        }
    }

    pub fn fetch_permanent(message: impl Into<String>, status: Option<u16>) -> Self {
        ScrapeError::Fetch {
            message: message.into(),
            status,
            temporary: false,
        }
    }
}

impl From<fjall::Error> for ScrapeError {
    fn from(value: fjall::Error) -> Self {
        ScrapeError::Persistence(value.to_string())
    }
}

impl From<std::io::Error> for ScrapeError {
    fn from(value: std::io::Error) -> Self {
        ScrapeError::Persistence(value.to_string())
    }
}

impl From<serde_json::Error> for ScrapeError {
    fn from(value: serde_json::Error) -> Self {
        ScrapeError::Persistence(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_classification() {
        assert!(ScrapeError::fetch_temporary("503", Some(503)).is_temporary());
        assert!(!ScrapeError::fetch_permanent("404", Some(404)).is_temporary());
        assert!(!ScrapeError::Validation("x".into()).is_temporary());
        assert!(!ScrapeError::Cancelled.is_temporary());
        assert!(ScrapeError::Persistence("disk".into()).is_temporary());
    }

    #[test]
    fn status_passthrough() {
        assert_eq!(
            ScrapeError::fetch_permanent("not found", Some(404)).status(),
            Some(404)
        );
        assert_eq!(ScrapeError::Cancelled.status(), None);
    }
}
