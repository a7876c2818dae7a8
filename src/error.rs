//! Custom error types for the acquisition pipeline.
//!
//! This module defines `DaqError`, the single error type of the library. It is built with
//! `thiserror` and classifies failures by how the acquisition state machine reacts to them:
//!
//! - **`Validation`**: a request was malformed (sampling interval out of range, unusable
//!   export path, bad manual frame field). The requested transition is blocked and nothing
//!   changes.
//! - **`Transport`**: the bus could not be opened, written or read. While configuring this
//!   aborts back to idle; while acquiring it force-stops the session but keeps every sample
//!   already collected.
//! - **`Parse`**: a frame did not match the expected layout. These are absorbed per frame
//!   by the decoder and never stop an acquisition.
//! - **`Io`** / **`Export`**: writing the CSV export failed. Export runs after stopping, so
//!   these are reported in the stop report and never affect acquisition state.
//! - **`Config`**: the configuration could not be loaded or failed validation.
//! - **`FeatureNotEnabled`**: the requested backend or storage format was compiled out.
//! - **`ServiceStopped`**: a request was sent to an acquisition service that has exited.
//!
//! No variant is fatal to the process; each one is scoped to the current session.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised by the acquisition pipeline.
#[derive(Error, Debug)]
pub enum DaqError {
    /// A request was rejected before any state change.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The bus transport failed to open, send or receive.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame or text line did not match the expected layout.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Writing the tabular export failed.
    #[error("Export error: {0}")]
    Export(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Functionality excluded at compile time.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// The acquisition service task is no longer running.
    #[error("Acquisition service has shut down")]
    ServiceStopped,
}

impl DaqError {
    /// Short name of the error class, used as a structured logging field.
    pub fn class(&self) -> &'static str {
        match self {
            DaqError::Validation(_) => "validation",
            DaqError::Transport(_) => "transport",
            DaqError::Parse(_) => "parse",
            DaqError::Io(_) | DaqError::Export(_) => "io",
            DaqError::Config(_) => "config",
            DaqError::FeatureNotEnabled(_) => "feature",
            DaqError::ServiceStopped => "service",
        }
    }

    /// Whether the error blocks a transition without touching controller state.
    pub fn is_validation(&self) -> bool {
        matches!(self, DaqError::Validation(_))
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(err.to_string())
    }
}

#[cfg(feature = "storage_csv")]
impl From<csv::Error> for DaqError {
    fn from(err: csv::Error) -> Self {
        DaqError::Export(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert_eq!(DaqError::Validation("x".into()).class(), "validation");
        assert_eq!(DaqError::Transport("x".into()).class(), "transport");
        assert_eq!(DaqError::Export("x".into()).class(), "io");
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(DaqError::from(io).class(), "io");
    }

    #[test]
    fn display_carries_context() {
        let err = DaqError::Validation("interval 0 outside 1..=2000".into());
        assert_eq!(
            err.to_string(),
            "Validation error: interval 0 outside 1..=2000"
        );
        assert!(err.is_validation());
        assert!(!DaqError::Transport("down".into()).is_validation());
    }

    #[test]
    fn feature_error_names_the_flag() {
        let err = DaqError::FeatureNotEnabled("storage_csv".into());
        assert!(err.to_string().contains("--features storage_csv"));
    }
}
