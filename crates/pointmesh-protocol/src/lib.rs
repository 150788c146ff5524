//! Pointmesh Protocol - wire format and data model
//!
//! Shared vocabulary of a pointmesh planning-poker session:
//!
//! - **Identity**: [`SessionId`] (nine digits) and [`PeerId`]. The session
//!   creator listens as `host-{sessionId}`, everyone else under a random id.
//! - **Round data**: [`Player`], [`VoteValue`], [`ReactionValue`].
//! - **Wire**: the [`Message`] envelope, JSON tagged by `type`.
//! - **Scoring**: [`consensus::analyze`] and [`consensus::average`] over
//!   revealed cards.

pub mod consensus;
pub mod error;
pub mod message;
pub mod types;

pub use consensus::{analyze, average, format_average, Consensus};
pub use error::{ProtocolError, Result};
pub use message::{Message, VoteEntry};
pub use types::{
    PeerId, Player, PlayerProfile, ReactionValue, SessionId, VoteValue, BOOTSTRAP_PREFIX,
    SESSION_ID_LEN,
};
