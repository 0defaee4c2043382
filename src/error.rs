//! Error types for the rating service
//!
//! This module defines all error types using anyhow for consistent error handling
//! throughout the application, plus the classification used to decide whether a
//! failed match is rejected, retried, or escalated.

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Custom error types for specific rating pipeline scenarios
#[derive(Debug, thiserror::Error)]
pub enum RatingServiceError {
    #[error("Malformed match result: {reason}")]
    MalformedMessage { reason: String },

    #[error("Invalid rating input: {reason}")]
    InvalidRatingInput { reason: String },

    #[error("Rating store failure: {message}")]
    StoreFailure { message: String },

    #[error("Rating for player {player_id} on {leaderboard} changed concurrently")]
    StaleRating {
        player_id: String,
        leaderboard: String,
    },

    #[error("AMQP connection failed: {message}")]
    AmqpConnectionFailed { message: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Service not ready: {message}")]
    ServiceNotReady { message: String },

    #[error("Retry budget exhausted for match {match_id} after {attempts} attempts: {message}")]
    RetryBudgetExhausted {
        match_id: String,
        attempts: u32,
        message: String,
    },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

/// How the pipeline reacts to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Structurally invalid input; acknowledged as rejected, never retried
    Malformed,
    /// Store or broker hiccup; retried with backoff
    Transient,
    /// Propagated to process supervision; consumption stops
    Fatal,
}

impl RatingServiceError {
    /// Classify this error according to the pipeline's error taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            RatingServiceError::MalformedMessage { .. }
            | RatingServiceError::InvalidRatingInput { .. } => ErrorClass::Malformed,
            RatingServiceError::StoreFailure { .. }
            | RatingServiceError::StaleRating { .. }
            | RatingServiceError::ServiceNotReady { .. } => ErrorClass::Transient,
            RatingServiceError::AmqpConnectionFailed { .. }
            | RatingServiceError::ConfigurationError { .. }
            | RatingServiceError::RetryBudgetExhausted { .. }
            | RatingServiceError::InternalError { .. } => ErrorClass::Fatal,
        }
    }

    /// Wrap any store-side error as a retryable store failure
    pub fn store<E: std::fmt::Display>(error: E) -> Self {
        RatingServiceError::StoreFailure {
            message: error.to_string(),
        }
    }
}

/// Classify an arbitrary error.
///
/// Errors that are not a [`RatingServiceError`] (raw driver errors, I/O) are
/// assumed transient: retrying a match whose failure we cannot explain is safe
/// because commits are idempotent per match.
pub fn classify(error: &anyhow::Error) -> ErrorClass {
    error
        .downcast_ref::<RatingServiceError>()
        .map(RatingServiceError::class)
        .unwrap_or(ErrorClass::Transient)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let malformed: anyhow::Error = RatingServiceError::MalformedMessage {
            reason: "no teams".to_string(),
        }
        .into();
        assert_eq!(classify(&malformed), ErrorClass::Malformed);

        let invalid: anyhow::Error = RatingServiceError::InvalidRatingInput {
            reason: "empty team".to_string(),
        }
        .into();
        assert_eq!(classify(&invalid), ErrorClass::Malformed);

        let stale: anyhow::Error = RatingServiceError::StaleRating {
            player_id: "p1".to_string(),
            leaderboard: "global".to_string(),
        }
        .into();
        assert_eq!(classify(&stale), ErrorClass::Transient);

        let exhausted: anyhow::Error = RatingServiceError::RetryBudgetExhausted {
            match_id: "m1".to_string(),
            attempts: 3,
            message: "database is locked".to_string(),
        }
        .into();
        assert_eq!(classify(&exhausted), ErrorClass::Fatal);
    }

    #[test]
    fn test_foreign_errors_are_transient() {
        let io = anyhow::anyhow!("connection reset by peer");
        assert_eq!(classify(&io), ErrorClass::Transient);
    }

    #[test]
    fn test_context_preserves_classification() {
        let err = anyhow::Error::from(RatingServiceError::MalformedMessage {
            reason: "duplicate player".to_string(),
        })
        .context("while validating match m-17");
        assert_eq!(classify(&err), ErrorClass::Malformed);
    }
}
