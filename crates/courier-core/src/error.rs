//! Error types for the Courier message bus.

use courier_protocol::CursorError;
use thiserror::Error;

/// Message bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// Invalid topic key.
    #[error("Invalid topic key: {0}")]
    InvalidTopic(&'static str),

    /// The identity already follows one of the requested topics.
    #[error("Already subscribed: {0}")]
    AlreadySubscribed(String),

    /// A cursor token could not be decoded.
    #[error("Invalid cursor: {0}")]
    Cursor(#[from] CursorError),

    /// A delivery handler reported a failure.
    #[error("Handler failed: {0}")]
    Handler(String),

    /// A delivery handler panicked.
    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),

    /// The bus was created outside of a tokio runtime.
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    /// The bus has been shut down.
    #[error("Message bus is shut down")]
    ShutDown,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BusError {
    /// Build a handler failure from any displayable error.
    #[must_use]
    pub fn handler(err: impl std::fmt::Display) -> Self {
        BusError::Handler(err.to_string())
    }

    /// Whether this error came out of a delivery handler.
    #[must_use]
    pub fn is_handler_fault(&self) -> bool {
        matches!(self, BusError::Handler(_) | BusError::HandlerPanicked(_))
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// Path that was read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`crate::BusConfig`].
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        /// Path that was parsed.
        path: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range.
    #[error("Invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Errors reported by a [`crate::counters::CounterSink`].
#[derive(Debug, Error)]
#[error("Counter {counter} update failed: {reason}")]
pub struct CounterError {
    /// Name of the counter.
    pub counter: &'static str,
    /// Failure description.
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_fault_classification() {
        assert!(BusError::handler("boom").is_handler_fault());
        assert!(BusError::HandlerPanicked("boom".into()).is_handler_fault());
        assert!(!BusError::ShutDown.is_handler_fault());
        assert!(!BusError::InvalidTopic("empty").is_handler_fault());
    }

    #[test]
    fn test_cursor_error_conversion() {
        let err: BusError = CursorError::DanglingEscape.into();
        assert!(matches!(err, BusError::Cursor(CursorError::DanglingEscape)));
        assert_eq!(
            err.to_string(),
            "Invalid cursor: Cursor ends with a dangling escape"
        );
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Invalid {
            field: "max_workers",
            reason: "must be at least 1",
        };
        assert_eq!(
            err.to_string(),
            "Invalid config value for max_workers: must be at least 1"
        );
    }
}
