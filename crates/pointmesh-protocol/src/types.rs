//! Identifiers, cards, reactions and the player record.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Prefix of the bootstrap peer's connection identity.
pub const BOOTSTRAP_PREFIX: &str = "host-";

/// Number of decimal digits in a session id.
pub const SESSION_ID_LEN: usize = 9;

/// Transport-level connection identity.
///
/// Opaque for joiners; derived from the session id for the bootstrap peer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random opaque id for a joining peer (16 hex characters).
    pub fn random() -> Self {
        let bytes: [u8; 8] = rand::thread_rng().gen();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id is some session's bootstrap identity.
    pub fn is_bootstrap(&self) -> bool {
        self.0.starts_with(BOOTSTRAP_PREFIX)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A nine-digit decimal session identifier chosen by the session creator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Pick a fresh random id. The leading digit is never zero.
    pub fn generate() -> Self {
        let n: u32 = rand::thread_rng().gen_range(100_000_000..1_000_000_000);
        Self(n.to_string())
    }

    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() == SESSION_ID_LEN && s.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(s.to_string()))
        } else {
            Err(ProtocolError::InvalidSessionId(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The deterministic identity the session creator listens under.
    pub fn bootstrap_peer(&self) -> PeerId {
        PeerId(format!("{BOOTSTRAP_PREFIX}{}", self.0))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionId {
    type Error = ProtocolError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// A card from the estimation deck, in deck order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VoteValue {
    #[serde(rename = "0")]
    Zero,
    #[serde(rename = "½")]
    Half,
    #[serde(rename = "1")]
    One,
    #[serde(rename = "2")]
    Two,
    #[serde(rename = "3")]
    Three,
    #[serde(rename = "5")]
    Five,
    #[serde(rename = "8")]
    Eight,
    #[serde(rename = "13")]
    Thirteen,
    #[serde(rename = "20")]
    Twenty,
    #[serde(rename = "40")]
    Forty,
    #[serde(rename = "100")]
    Hundred,
    #[serde(rename = "?")]
    Unknown,
}

impl VoteValue {
    /// The full deck in display order.
    pub const DECK: [VoteValue; 12] = [
        VoteValue::Zero,
        VoteValue::Half,
        VoteValue::One,
        VoteValue::Two,
        VoteValue::Three,
        VoteValue::Five,
        VoteValue::Eight,
        VoteValue::Thirteen,
        VoteValue::Twenty,
        VoteValue::Forty,
        VoteValue::Hundred,
        VoteValue::Unknown,
    ];

    /// Card face as shown to players.
    pub const fn label(self) -> &'static str {
        match self {
            VoteValue::Zero => "0",
            VoteValue::Half => "½",
            VoteValue::One => "1",
            VoteValue::Two => "2",
            VoteValue::Three => "3",
            VoteValue::Five => "5",
            VoteValue::Eight => "8",
            VoteValue::Thirteen => "13",
            VoteValue::Twenty => "20",
            VoteValue::Forty => "40",
            VoteValue::Hundred => "100",
            VoteValue::Unknown => "?",
        }
    }

    /// Numeric value of the card; `?` has none.
    pub const fn as_f64(self) -> Option<f64> {
        match self {
            VoteValue::Zero => Some(0.0),
            VoteValue::Half => Some(0.5),
            VoteValue::One => Some(1.0),
            VoteValue::Two => Some(2.0),
            VoteValue::Three => Some(3.0),
            VoteValue::Five => Some(5.0),
            VoteValue::Eight => Some(8.0),
            VoteValue::Thirteen => Some(13.0),
            VoteValue::Twenty => Some(20.0),
            VoteValue::Forty => Some(40.0),
            VoteValue::Hundred => Some(100.0),
            VoteValue::Unknown => None,
        }
    }
}

impl fmt::Display for VoteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for VoteValue {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        // Older clients typed the half card out.
        if s == "0.5" || s == "1/2" {
            return Ok(VoteValue::Half);
        }
        VoteValue::DECK
            .into_iter()
            .find(|v| v.label() == s)
            .ok_or_else(|| ProtocolError::UnknownVote(s.to_string()))
    }
}

/// A transient emoji reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReactionValue {
    #[serde(rename = "👍")]
    ThumbsUp,
    #[serde(rename = "👎")]
    ThumbsDown,
    #[serde(rename = "😂")]
    Laugh,
    #[serde(rename = "🤔")]
    Thinking,
    #[serde(rename = "☕")]
    Coffee,
    #[serde(rename = "🎉")]
    Party,
    #[serde(rename = "🔥")]
    Fire,
    #[serde(rename = "❤️")]
    Heart,
}

impl ReactionValue {
    pub const ALL: [ReactionValue; 8] = [
        ReactionValue::ThumbsUp,
        ReactionValue::ThumbsDown,
        ReactionValue::Laugh,
        ReactionValue::Thinking,
        ReactionValue::Coffee,
        ReactionValue::Party,
        ReactionValue::Fire,
        ReactionValue::Heart,
    ];

    pub const fn emoji(self) -> &'static str {
        match self {
            ReactionValue::ThumbsUp => "👍",
            ReactionValue::ThumbsDown => "👎",
            ReactionValue::Laugh => "😂",
            ReactionValue::Thinking => "🤔",
            ReactionValue::Coffee => "☕",
            ReactionValue::Party => "🎉",
            ReactionValue::Fire => "🔥",
            ReactionValue::Heart => "❤️",
        }
    }
}

impl fmt::Display for ReactionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.emoji())
    }
}

impl FromStr for ReactionValue {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        ReactionValue::ALL
            .into_iter()
            .find(|r| r.emoji() == s.trim())
            .ok_or_else(|| ProtocolError::UnknownReaction(s.to_string()))
    }
}

/// Profile data entered by the local user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerProfile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl PlayerProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }
}

/// One participant in the round. `id` is the owning peer's connection id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: PeerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub vote: Option<VoteValue>,
    #[serde(default)]
    pub reaction: Option<ReactionValue>,
    /// Origin time (unix millis) of `reaction`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction_timestamp: Option<u64>,
    #[serde(default)]
    pub is_local: bool,
}

impl Player {
    pub fn new(id: PeerId, profile: &PlayerProfile, is_local: bool) -> Self {
        Self {
            id,
            name: profile.name.clone(),
            avatar_url: profile.avatar_url.clone(),
            vote: None,
            reaction: None,
            reaction_timestamp: None,
            is_local,
        }
    }

    pub fn has_voted(&self) -> bool {
        self.vote.is_some()
    }

    /// Overwrite the profile fields, leaving round state alone.
    pub fn apply_profile(&mut self, profile: &PlayerProfile) {
        self.name = profile.name.clone();
        self.avatar_url = profile.avatar_url.clone();
    }
}
