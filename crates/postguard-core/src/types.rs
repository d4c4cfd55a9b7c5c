//! Message types flowing through the scoring pipeline

use crate::error::{DecodeError, PublishError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A content-creation event consumed from the input queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Identifier of the post (never empty)
    pub post_id: String,

    /// Post text; empty content is valid and scores as zero-signal
    pub content: String,
}

/// Wire shape of the inbound payload; unknown fields are ignored
#[derive(Debug, Deserialize)]
struct RawInbound {
    #[serde(default)]
    post_id: Option<serde_json::Value>,

    #[serde(default)]
    content: Option<String>,
}

impl InboundMessage {
    /// Create a new inbound message
    pub fn new(post_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            post_id: post_id.into(),
            content: content.into(),
        }
    }

    /// Decode a raw delivery payload.
    ///
    /// `post_id` may be a JSON string or an integer (producers that key posts
    /// by numeric primary key send the latter); it is normalized to a string.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(payload)?;
        let raw: RawInbound = serde_json::from_str(text)?;

        let post_id = match raw.post_id {
            Some(serde_json::Value::String(id)) if !id.is_empty() => id,
            Some(serde_json::Value::Number(id)) => id.to_string(),
            _ => return Err(DecodeError::MissingIdentifier),
        };

        Ok(Self {
            post_id,
            content: raw.content.unwrap_or_default(),
        })
    }
}

/// Outcome of scoring one message against the configured threshold
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreResult {
    /// Identifier of the scored post
    pub post_id: String,

    /// Probability of the flag class, in `[0.0, 1.0]`
    pub score: f32,

    /// `score > threshold`
    pub flagged: bool,
}

impl ScoreResult {
    /// Build a result; the comparison is strict so a score equal to the
    /// threshold is not flagged.
    pub fn new(post_id: impl Into<String>, score: f32, threshold: f32) -> Self {
        Self {
            post_id: post_id.into(),
            score,
            flagged: score > threshold,
        }
    }
}

/// A flagged post republished for moderation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub post_id: String,
    pub content: String,
    pub score: f32,
}

impl OutboundMessage {
    /// Build the outbound record for a flagged message
    pub fn from_scored(message: InboundMessage, result: &ScoreResult) -> Self {
        Self {
            post_id: message.post_id,
            content: message.content,
            score: result.score,
        }
    }

    /// Encode as UTF-8 JSON
    pub fn encode(&self) -> Result<Bytes, PublishError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| PublishError::Encode(e.to_string()))
    }
}
