//! Error types for PostGuard
//!
//! Each pipeline stage has its own error family so that the consumer can
//! decide per message whether a failure is terminal (acknowledge) or
//! transient (reject for requeue). [`Error`] wraps all of them for code that
//! only needs to propagate.

/// Result type alias using PostGuard's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to construct a scoring resource from an artifact reference
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// The artifact reference does not resolve to anything
    #[error("artifact not found: {0}")]
    NotFound(String),

    /// The artifact resolved but the resource could not be initialized
    #[error("invalid artifact: {0}")]
    Invalid(String),
}

impl LoadError {
    /// Create a new not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new invalid-artifact error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Failure to score a piece of text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScoreError {
    /// No resource has been loaded (or it has been released)
    #[error("scoring resource not loaded")]
    NotLoaded,

    /// The active resource failed on this input
    #[error("inference failed: {0}")]
    InferenceFailure(String),
}

impl ScoreError {
    /// Create a new inference failure
    pub fn inference(msg: impl Into<String>) -> Self {
        Self::InferenceFailure(msg.into())
    }

    /// Whether the condition is expected to clear on its own
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotLoaded)
    }
}

/// Malformed inbound message
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Payload bytes are not valid UTF-8
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Payload is not the expected JSON shape
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// `post_id` is absent or empty
    #[error("message has no post_id")]
    MissingIdentifier,
}

/// Transport failure while republishing a flagged message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// The broker could not be reached or refused the message
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The outbound record could not be encoded
    #[error("failed to encode outbound message: {0}")]
    Encode(String),
}

impl PublishError {
    /// Create a new broker-unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

/// Core error type for PostGuard operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Resource construction errors
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Scoring errors
    #[error(transparent)]
    Score(#[from] ScoreError),

    /// Inbound message errors
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Outbound publish errors
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Queue transport errors other than publish
    #[error("queue error: {0}")]
    Queue(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Network/IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new queue error
    pub fn queue(msg: impl Into<String>) -> Self {
        Self::Queue(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ScoreError::NotLoaded.is_transient());
        assert!(!ScoreError::inference("nan").is_transient());
    }

    #[test]
    fn test_wrapping_keeps_message() {
        let err: Error = LoadError::not_found("models/v9").into();
        assert_eq!(err.to_string(), "artifact not found: models/v9");
    }
}
