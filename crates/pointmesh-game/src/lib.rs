//! Pointmesh Game - replicated planning-poker round
//!
//! [`GameState`] is a sans-IO state machine. Callers feed it local actions
//! and remote [`pointmesh_protocol::Message`]s together with the current
//! unix time in milliseconds, then drain [`GameOutput`]s: roster updates
//! for the UI and messages to put on the wire.
//!
//! Two timers live here, both driven through [`GameState::poll_timers`]:
//! the auto-reveal debounce and per-player reaction expiry
//! ([`reactions::ReactionTimers`]).

pub mod reactions;
pub mod state;

pub use reactions::{remaining_ttl, ReactionTimers};
pub use state::{GameConfig, GameOutput, GameState};
