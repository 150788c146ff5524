//! Peer-to-peer message envelope.
//!
//! Every frame is a JSON object tagged by `type`:
//!
//! ```text
//! {"type":"vote","vote":"5"}
//! {"type":"peer_list","peers":["a1b2...","c3d4..."]}
//! {"type":"show_votes","allVotes":{"host-123456789":{"name":"Ada","vote":"8"}}}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{PeerId, Player, ReactionValue, VoteValue};

/// One row of a `show_votes` snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteEntry {
    pub name: String,
    pub vote: VoteValue,
}

/// A message exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// The sender's own player record.
    PlayerData { player: Player },
    /// Ask the receiver to answer with its `player_data`.
    RequestPlayerData,
    /// Every other peer the sender is connected to.
    PeerList { peers: Vec<PeerId> },
    /// The sender cast a vote.
    Vote { vote: VoteValue },
    /// Start a new round.
    ClearVotes,
    /// Reveal, with a snapshot of every vote the sender knows about.
    ShowVotes {
        #[serde(rename = "allVotes")]
        all_votes: BTreeMap<PeerId, VoteEntry>,
    },
    /// The sender's reaction changed; `null` clears it.
    Reaction {
        reaction: Option<ReactionValue>,
        timestamp: u64,
    },
    /// The sender observed `peer_id` closing.
    PlayerDisconnected {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
}

impl Message {
    /// Wire name of the message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::PlayerData { .. } => "player_data",
            Message::RequestPlayerData => "request_player_data",
            Message::PeerList { .. } => "peer_list",
            Message::Vote { .. } => "vote",
            Message::ClearVotes => "clear_votes",
            Message::ShowVotes { .. } => "show_votes",
            Message::Reaction { .. } => "reaction",
            Message::PlayerDisconnected { .. } => "player_disconnected",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(frame: &str) -> Result<Self> {
        Ok(serde_json::from_str(frame)?)
    }
}
