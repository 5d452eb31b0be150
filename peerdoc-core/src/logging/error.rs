//! Error types for the logging subsystem

use thiserror::Error;

/// Errors that can occur while installing the tracing subscriber
#[derive(Debug, Clone, Error)]
pub enum LoggingError {
    /// A global subscriber was already installed or the filter was rejected
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// The requested level or directive is not understood
    #[error("Invalid logging configuration: {0}")]
    InvalidConfiguration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_error_display() {
        let err = LoggingError::InitializationFailed("already set".to_string());
        assert_eq!(err.to_string(), "Failed to initialize logging: already set");

        let err = LoggingError::InvalidConfiguration("level 'loud'".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid logging configuration: level 'loud'"
        );
    }
}
