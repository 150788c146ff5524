//! Error types for pointmesh-protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while parsing identifiers, cards or wire frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame could not be encoded or decoded as JSON.
    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),

    /// The text does not name a card in the deck.
    #[error("unknown vote value: {0:?}")]
    UnknownVote(String),

    /// The text does not name a supported reaction.
    #[error("unknown reaction: {0:?}")]
    UnknownReaction(String),

    /// Session ids are exactly nine decimal digits.
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),
}
