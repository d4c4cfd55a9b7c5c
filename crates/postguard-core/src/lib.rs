//! PostGuard Core
//!
//! Core types and error handling shared across PostGuard components.
//!
//! This crate provides:
//! - Inbound/outbound message types and their wire encoding
//! - The per-stage error taxonomy (load, score, decode, publish)
//! - The crate-wide `Error`/`Result` pair

pub mod error;
pub mod types;

pub use error::{DecodeError, Error, LoadError, PublishError, Result, ScoreError};
pub use types::{InboundMessage, OutboundMessage, ScoreResult};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{DecodeError, Error, LoadError, PublishError, Result, ScoreError};
    pub use crate::types::{InboundMessage, OutboundMessage, ScoreResult};
}
