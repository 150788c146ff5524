//! Replicated round state.
//!
//! Every peer keeps a mirror of the whole roster and applies the same
//! message history to it. There is no authoritative peer and no causal
//! ordering; the last message received wins per field. `show_votes` carries
//! a full snapshot so a stale mirror heals at reveal time.

use std::collections::BTreeMap;

use pointmesh_protocol::{
    analyze, average, Consensus, Message, PeerId, Player, PlayerProfile, ReactionValue, VoteEntry,
    VoteValue,
};
use tracing::{debug, info, trace, warn};

use crate::reactions::{remaining_ttl, ReactionTimers};

/// Timing constants of the round, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameConfig {
    /// Delay between the last missing vote arriving and the automatic reveal.
    pub reveal_debounce_ms: u64,
    /// Lifetime of a reaction from its origin timestamp.
    pub reaction_ttl_ms: u64,
    /// Lower bound for a remote reaction's remaining lifetime.
    pub min_reaction_remaining_ms: u64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            reveal_debounce_ms: 500,
            reaction_ttl_ms: 5000,
            min_reaction_remaining_ms: 100,
        }
    }
}

/// Something the caller must deliver: to collaborators or to peers.
#[derive(Debug, Clone, PartialEq)]
pub enum GameOutput {
    /// The roster changed. Local player first, then by peer id.
    PlayersUpdated(Vec<Player>),
    /// Votes were revealed.
    VotingComplete,
    /// The local player's reaction expired.
    ReactionExpired,
    /// Send to every peer.
    Broadcast(Message),
    /// Send to one peer.
    SendToPlayer { peer: PeerId, message: Message },
}

/// Round state owned by one peer.
#[derive(Debug)]
pub struct GameState {
    config: GameConfig,
    local_id: Option<PeerId>,
    players: BTreeMap<PeerId, Player>,
    revealed: bool,
    reactions: ReactionTimers,
    reveal_at: Option<u64>,
    outputs: Vec<GameOutput>,
}

impl Default for GameState {
    fn default() -> Self {
        Self::new(GameConfig::default())
    }
}

impl GameState {
    pub fn new(config: GameConfig) -> Self {
        Self {
            config,
            local_id: None,
            players: BTreeMap::new(),
            revealed: false,
            reactions: ReactionTimers::new(),
            reveal_at: None,
            outputs: Vec::new(),
        }
    }

    // --- Queries ---

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    pub fn local_player(&self) -> Option<&Player> {
        self.local_id.as_ref().and_then(|id| self.players.get(id))
    }

    pub fn player(&self, id: &PeerId) -> Option<&Player> {
        self.players.get(id)
    }

    /// Roster with the local player first, the rest ordered by peer id.
    pub fn players(&self) -> Vec<Player> {
        let local = self.local_player().cloned();
        local
            .into_iter()
            .chain(self.players.values().filter(|p| !p.is_local).cloned())
            .collect()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn is_revealed(&self) -> bool {
        self.revealed
    }

    /// Every cast vote, in roster order.
    pub fn votes(&self) -> Vec<VoteValue> {
        self.players().iter().filter_map(|p| p.vote).collect()
    }

    pub fn consensus(&self) -> Consensus {
        analyze(&self.votes())
    }

    pub fn average(&self) -> Option<f64> {
        average(&self.votes())
    }

    /// Whether an automatic reveal is pending.
    pub fn reveal_pending(&self) -> bool {
        self.reveal_at.is_some()
    }

    /// Earliest timer deadline (unix millis), if any.
    pub fn next_deadline(&self) -> Option<u64> {
        match (self.reactions.next_deadline(), self.reveal_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn reaction_deadline(&self, peer: &PeerId) -> Option<u64> {
        self.reactions.deadline(peer)
    }

    /// Take the queued outputs.
    pub fn drain_outputs(&mut self) -> Vec<GameOutput> {
        std::mem::take(&mut self.outputs)
    }

    // --- Local operations ---

    /// Create or refresh the local player and announce it.
    ///
    /// Idempotent per peer id: a second call updates the existing entry.
    /// Returns true if a new entry was created.
    pub fn set_local_identity(&mut self, peer_id: PeerId, profile: &PlayerProfile) -> bool {
        if let Some(old) = self.local_id.take() {
            if old != peer_id {
                // Carry the round state over to the new id.
                if let Some(mut player) = self.players.remove(&old) {
                    info!("Local identity moved from {} to {}", old, peer_id);
                    player.id = peer_id.clone();
                    if let Some(deadline) = self.reactions.deadline(&old) {
                        self.reactions.cancel(&old);
                        self.reactions.schedule(&peer_id, deadline);
                    }
                    self.players.insert(peer_id.clone(), player);
                }
            }
        }

        let created = match self.players.get_mut(&peer_id) {
            Some(player) => {
                player.apply_profile(profile);
                player.is_local = true;
                debug!("Refreshed local player {}", peer_id);
                false
            }
            None => {
                self.players
                    .insert(peer_id.clone(), Player::new(peer_id.clone(), profile, true));
                info!("Local player {} ({}) created", peer_id, profile.name);
                true
            }
        };
        self.local_id = Some(peer_id);

        self.announce();
        self.players_updated();
        created
    }

    /// Introduce ourselves to a newly connected peer and ask it to do the same.
    pub fn on_peer_connected(&mut self, peer: &PeerId) {
        if self.is_local(peer) {
            return;
        }
        if let Some(player) = self.wire_local_player() {
            self.outputs.push(GameOutput::SendToPlayer {
                peer: peer.clone(),
                message: Message::PlayerData { player },
            });
        }
        self.outputs.push(GameOutput::SendToPlayer {
            peer: peer.clone(),
            message: Message::RequestPlayerData,
        });
    }

    /// A directly connected peer went away: drop its player, tell everyone
    /// else, and see whether the remaining players complete the round.
    pub fn on_peer_disconnected(&mut self, peer: &PeerId, now: u64) {
        if self.is_local(peer) {
            return;
        }
        self.remove_player(peer, now);
        self.outputs.push(GameOutput::Broadcast(Message::PlayerDisconnected {
            peer_id: peer.clone(),
        }));
    }

    /// Cast the local vote. Returns false without a local identity.
    pub fn cast_vote(&mut self, vote: VoteValue, now: u64) -> bool {
        let Some(player) = self.local_player_mut() else {
            warn!("cast_vote before local identity is known");
            return false;
        };
        player.vote = Some(vote);
        debug!("Voted {}", vote);

        self.outputs.push(GameOutput::Broadcast(Message::Vote { vote }));
        self.players_updated();
        self.check_all_voted(now);
        true
    }

    /// Start a new round everywhere.
    pub fn clear_votes(&mut self) {
        self.reset_round();
        self.outputs.push(GameOutput::Broadcast(Message::ClearVotes));
        self.players_updated();
    }

    /// Reveal, broadcasting a snapshot of every known vote.
    pub fn show_votes(&mut self) {
        let all_votes: BTreeMap<PeerId, VoteEntry> = self
            .players
            .values()
            .filter_map(|p| {
                p.vote.map(|vote| {
                    (
                        p.id.clone(),
                        VoteEntry {
                            name: p.name.clone(),
                            vote,
                        },
                    )
                })
            })
            .collect();
        info!("Revealing {} votes", all_votes.len());

        self.outputs.push(GameOutput::Broadcast(Message::ShowVotes { all_votes }));
        self.mark_revealed();
    }

    /// Set the local reaction, or clear it when the same one is picked again.
    /// Returns the resulting reaction.
    pub fn set_reaction(&mut self, reaction: ReactionValue, now: u64) -> Option<ReactionValue> {
        let current = self.local_player().and_then(|p| p.reaction);
        if current == Some(reaction) {
            self.clear_reaction(now);
            return None;
        }

        let ttl = self.config.reaction_ttl_ms;
        let Some(player) = self.local_player_mut() else {
            warn!("set_reaction before local identity is known");
            return None;
        };
        player.reaction = Some(reaction);
        player.reaction_timestamp = Some(now);
        let id = player.id.clone();
        self.reactions.schedule(&id, now.saturating_add(ttl));

        self.outputs.push(GameOutput::Broadcast(Message::Reaction {
            reaction: Some(reaction),
            timestamp: now,
        }));
        self.players_updated();
        Some(reaction)
    }

    /// Clear the local reaction if one is showing.
    pub fn clear_reaction(&mut self, now: u64) -> bool {
        let Some(player) = self.local_player_mut() else {
            return false;
        };
        if player.reaction.is_none() {
            return false;
        }
        player.reaction = None;
        player.reaction_timestamp = None;
        let id = player.id.clone();
        self.reactions.cancel(&id);

        self.outputs.push(GameOutput::Broadcast(Message::Reaction {
            reaction: None,
            timestamp: now,
        }));
        self.players_updated();
        true
    }

    /// Reapply a cached round without announcing it, e.g. after a reload.
    /// An already expired reaction is dropped.
    pub fn restore_local_round(
        &mut self,
        vote: Option<VoteValue>,
        reaction: Option<(ReactionValue, u64)>,
        revealed: bool,
        now: u64,
    ) {
        let ttl = self.config.reaction_ttl_ms;
        // A cached timestamp from the future counts from now.
        let live = reaction
            .map(|(value, origin)| (value, origin.min(now)))
            .filter(|(_, origin)| origin.saturating_add(ttl) > now);
        let Some(player) = self.local_player_mut() else {
            warn!("restore_local_round before local identity is known");
            return;
        };
        player.vote = vote;
        player.reaction = live.map(|(value, _)| value);
        player.reaction_timestamp = live.map(|(_, origin)| origin);
        let id = player.id.clone();
        match live {
            Some((_, origin)) => {
                self.reactions.schedule(&id, origin.saturating_add(ttl));
            }
            None => {
                self.reactions.cancel(&id);
            }
        }
        self.revealed = revealed;
        debug!(revealed, "Restored local round");
        self.players_updated();
    }

    /// Re-send our player record to every peer and ask for theirs.
    pub fn resync(&mut self) {
        self.announce();
        self.outputs
            .push(GameOutput::Broadcast(Message::RequestPlayerData));
    }

    // --- Remote messages ---

    /// Apply a message received from `from`.
    pub fn handle_remote_message(&mut self, from: &PeerId, message: Message, now: u64) {
        if self.is_local(from) {
            warn!("Ignoring {} that claims to come from ourselves", message.kind());
            return;
        }
        trace!("{} from {}", message.kind(), from);

        match message {
            Message::PlayerData { player } => self.apply_player_data(from, player, now),
            Message::RequestPlayerData => {
                if let Some(player) = self.wire_local_player() {
                    self.outputs.push(GameOutput::SendToPlayer {
                        peer: from.clone(),
                        message: Message::PlayerData { player },
                    });
                }
            }
            Message::Vote { vote } => {
                let Some(player) = self.players.get_mut(from) else {
                    debug!("Vote from unknown peer {}, requesting player data", from);
                    self.request_player_data(from);
                    return;
                };
                player.vote = Some(vote);
                self.players_updated();
                self.check_all_voted(now);
            }
            Message::ClearVotes => {
                debug!("{} cleared the round", from);
                self.reset_round();
                self.players_updated();
            }
            Message::ShowVotes { all_votes } => {
                for (id, entry) in all_votes {
                    if self.is_local(&id) {
                        continue;
                    }
                    match self.players.get_mut(&id) {
                        Some(player) => player.vote = Some(entry.vote),
                        None => debug!("show_votes names unknown peer {}", id),
                    }
                }
                self.mark_revealed();
            }
            Message::Reaction {
                reaction,
                timestamp,
            } => {
                if !self.players.contains_key(from) {
                    debug!("Reaction from unknown peer {}, requesting player data", from);
                    self.request_player_data(from);
                    return;
                }
                self.apply_remote_reaction(from, reaction, Some(timestamp), now);
                self.players_updated();
            }
            Message::PlayerDisconnected { peer_id } => {
                if self.is_local(&peer_id) {
                    warn!("{} reported us as disconnected, ignoring", from);
                    return;
                }
                self.remove_player(&peer_id, now);
            }
            Message::PeerList { .. } => {
                trace!("peer_list is handled by the mesh layer");
            }
        }
    }

    // --- Timers ---

    /// Fire every timer due at `now`.
    pub fn poll_timers(&mut self, now: u64) {
        for peer in self.reactions.take_due(now) {
            self.expire_reaction(&peer, now);
        }

        if let Some(at) = self.reveal_at {
            if at <= now {
                self.reveal_at = None;
                if !self.revealed && self.all_voted() {
                    info!("Everyone has voted, revealing");
                    self.show_votes();
                }
            }
        }
    }

    // --- Internals ---

    fn is_local(&self, peer: &PeerId) -> bool {
        self.local_id.as_ref() == Some(peer)
    }

    fn local_player_mut(&mut self) -> Option<&mut Player> {
        let id = self.local_id.as_ref()?;
        self.players.get_mut(id)
    }

    /// The local player as other peers should see it.
    fn wire_local_player(&self) -> Option<Player> {
        let mut player = self.local_player()?.clone();
        player.is_local = false;
        Some(player)
    }

    fn announce(&mut self) {
        if let Some(player) = self.wire_local_player() {
            self.outputs
                .push(GameOutput::Broadcast(Message::PlayerData { player }));
        }
    }

    fn request_player_data(&mut self, peer: &PeerId) {
        self.outputs.push(GameOutput::SendToPlayer {
            peer: peer.clone(),
            message: Message::RequestPlayerData,
        });
    }

    fn players_updated(&mut self) {
        let players = self.players();
        self.outputs.push(GameOutput::PlayersUpdated(players));
    }

    fn all_voted(&self) -> bool {
        !self.players.is_empty() && self.players.values().all(Player::has_voted)
    }

    fn check_all_voted(&mut self, now: u64) {
        if self.revealed || self.reveal_at.is_some() {
            return;
        }
        if self.all_voted() {
            let at = now + self.config.reveal_debounce_ms;
            debug!("All {} players voted, reveal at {}", self.players.len(), at);
            self.reveal_at = Some(at);
        }
    }

    fn reset_round(&mut self) {
        self.revealed = false;
        self.reveal_at = None;
        for player in self.players.values_mut() {
            player.vote = None;
        }
    }

    fn mark_revealed(&mut self) {
        let newly = !self.revealed;
        self.revealed = true;
        self.reveal_at = None;
        self.players_updated();
        if newly {
            self.outputs.push(GameOutput::VotingComplete);
        }
    }

    fn apply_player_data(&mut self, from: &PeerId, mut incoming: Player, now: u64) {
        if self.is_local(&incoming.id) {
            warn!("{} sent player_data for our own id, ignoring", from);
            return;
        }
        if incoming.id != *from {
            warn!("player_data from {} names {}, keying by sender", from, incoming.id);
            incoming.id = from.clone();
        }
        incoming.is_local = false;

        let reaction = incoming.reaction;
        let origin = incoming.reaction_timestamp;
        match self.players.get_mut(from) {
            Some(existing) => {
                existing.name = incoming.name;
                existing.avatar_url = incoming.avatar_url;
                existing.vote = incoming.vote;
            }
            None => {
                info!("Player {} ({}) joined", from, incoming.name);
                self.players.insert(from.clone(), incoming);
            }
        }
        self.apply_remote_reaction(from, reaction, origin, now);

        self.players_updated();
        self.check_all_voted(now);
    }

    fn apply_remote_reaction(
        &mut self,
        peer: &PeerId,
        reaction: Option<ReactionValue>,
        origin: Option<u64>,
        now: u64,
    ) {
        let Some(player) = self.players.get_mut(peer) else {
            return;
        };
        player.reaction = reaction;
        match reaction {
            Some(_) => {
                let origin = origin.unwrap_or(now);
                player.reaction_timestamp = Some(origin);
                let remaining = remaining_ttl(
                    self.config.reaction_ttl_ms,
                    self.config.min_reaction_remaining_ms,
                    origin,
                    now,
                );
                self.reactions.schedule(peer, now + remaining);
            }
            None => {
                player.reaction_timestamp = None;
                self.reactions.cancel(peer);
            }
        }
    }

    fn expire_reaction(&mut self, peer: &PeerId, now: u64) {
        let local = self.is_local(peer);
        let Some(player) = self.players.get_mut(peer) else {
            return;
        };
        player.reaction = None;
        player.reaction_timestamp = None;
        debug!("Reaction of {} expired", peer);

        if local {
            self.outputs.push(GameOutput::Broadcast(Message::Reaction {
                reaction: None,
                timestamp: now,
            }));
            self.outputs.push(GameOutput::ReactionExpired);
        }
        self.players_updated();
    }

    fn remove_player(&mut self, peer: &PeerId, now: u64) {
        self.reactions.cancel(peer);
        if self.players.remove(peer).is_some() {
            info!("Player {} left ({} remain)", peer, self.players.len());
            self.players_updated();
            self.check_all_voted(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id)
    }

    fn local(name: &str) -> GameState {
        let mut game = GameState::default();
        game.set_local_identity(peer("me"), &PlayerProfile::new(name));
        game.drain_outputs();
        game
    }

    fn remote_player(id: &str, name: &str) -> Player {
        Player::new(peer(id), &PlayerProfile::new(name), false)
    }

    fn join(game: &mut GameState, id: &str, name: &str, now: u64) {
        game.handle_remote_message(
            &peer(id),
            Message::PlayerData {
                player: remote_player(id, name),
            },
            now,
        );
    }

    fn broadcasts(outputs: &[GameOutput]) -> Vec<&Message> {
        outputs
            .iter()
            .filter_map(|o| match o {
                GameOutput::Broadcast(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn voting_completes(outputs: &[GameOutput]) -> usize {
        outputs
            .iter()
            .filter(|o| matches!(o, GameOutput::VotingComplete))
            .count()
    }

    #[test]
    fn local_identity_is_idempotent() {
        let mut game = GameState::default();
        assert!(game.set_local_identity(peer("me"), &PlayerProfile::new("Alice")));
        assert!(!game.set_local_identity(peer("me"), &PlayerProfile::new("Alice B")));

        assert_eq!(game.player_count(), 1);
        let me = game.local_player().unwrap();
        assert!(me.is_local);
        assert_eq!(me.name, "Alice B");

        let outputs = game.drain_outputs();
        let announced = broadcasts(&outputs)
            .into_iter()
            .filter(|m| matches!(m, Message::PlayerData { .. }))
            .count();
        assert_eq!(announced, 2);
    }

    #[test]
    fn local_identity_change_keeps_round_state() {
        let mut game = local("Alice");
        game.cast_vote(VoteValue::Five, T0);
        game.set_local_identity(peer("host-123456789"), &PlayerProfile::new("Alice"));

        assert_eq!(game.player_count(), 1);
        let me = game.local_player().unwrap();
        assert_eq!(me.id, peer("host-123456789"));
        assert_eq!(me.vote, Some(VoteValue::Five));
    }

    #[test]
    fn announced_player_is_not_marked_local() {
        let mut game = local("Alice");
        game.on_peer_connected(&peer("bob"));
        let outputs = game.drain_outputs();

        let sent: Vec<_> = outputs
            .iter()
            .filter_map(|o| match o {
                GameOutput::SendToPlayer { peer: p, message } if *p == peer("bob") => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(sent.len(), 2);
        match sent[0] {
            Message::PlayerData { player } => {
                assert_eq!(player.id, peer("me"));
                assert!(!player.is_local);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sent[1], &Message::RequestPlayerData);
    }

    #[test]
    fn remote_player_data_is_keyed_by_sender() {
        let mut game = local("Alice");
        let mut spoofed = remote_player("someone-else", "Bob");
        spoofed.is_local = true;
        game.handle_remote_message(&peer("bob"), Message::PlayerData { player: spoofed }, T0);

        let bob = game.player(&peer("bob")).unwrap();
        assert_eq!(bob.name, "Bob");
        assert!(!bob.is_local);
        assert!(game.player(&peer("someone-else")).is_none());
    }

    #[test]
    fn players_lists_local_first() {
        let mut game = GameState::default();
        game.set_local_identity(peer("zed"), &PlayerProfile::new("Zed"));
        join(&mut game, "alice", "Alice", T0);
        join(&mut game, "bob", "Bob", T0);

        let ids: Vec<_> = game.players().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![peer("zed"), peer("alice"), peer("bob")]);
    }

    #[test]
    fn auto_reveal_after_debounce() {
        let mut game = local("Alice");
        join(&mut game, "bob", "Bob", T0);

        game.cast_vote(VoteValue::Five, T0);
        assert!(!game.reveal_pending());

        game.handle_remote_message(&peer("bob"), Message::Vote { vote: VoteValue::Eight }, T0 + 10);
        assert!(game.reveal_pending());
        assert_eq!(game.next_deadline(), Some(T0 + 510));
        game.drain_outputs();

        game.poll_timers(T0 + 509);
        assert!(!game.is_revealed());

        game.poll_timers(T0 + 510);
        assert!(game.is_revealed());
        let outputs = game.drain_outputs();
        assert_eq!(voting_completes(&outputs), 1);
        match broadcasts(&outputs).as_slice() {
            [Message::ShowVotes { all_votes }] => {
                assert_eq!(all_votes.len(), 2);
                assert_eq!(all_votes[&peer("bob")].vote, VoteValue::Eight);
                assert_eq!(all_votes[&peer("me")].name, "Alice");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn pending_reveal_is_dropped_if_a_voter_joins() {
        let mut game = local("Alice");
        game.cast_vote(VoteValue::Three, T0);
        assert!(game.reveal_pending());

        join(&mut game, "bob", "Bob", T0 + 100);
        game.poll_timers(T0 + 500);

        assert!(!game.is_revealed());
        assert!(!game.reveal_pending());
    }

    #[test]
    fn manual_reveal_emits_voting_complete_once() {
        let mut game = local("Alice");
        join(&mut game, "bob", "Bob", T0);
        game.show_votes();
        game.show_votes();
        game.handle_remote_message(
            &peer("bob"),
            Message::ShowVotes {
                all_votes: BTreeMap::new(),
            },
            T0,
        );

        let outputs = game.drain_outputs();
        assert_eq!(voting_completes(&outputs), 1);
        assert!(game.is_revealed());
    }

    #[test]
    fn remote_show_votes_updates_known_players_only() {
        let mut game = local("Alice");
        game.cast_vote(VoteValue::Two, T0);
        join(&mut game, "bob", "Bob", T0);

        let mut all_votes = BTreeMap::new();
        all_votes.insert(
            peer("bob"),
            VoteEntry {
                name: "Bob".into(),
                vote: VoteValue::Thirteen,
            },
        );
        all_votes.insert(
            peer("me"),
            VoteEntry {
                name: "Alice".into(),
                vote: VoteValue::Hundred,
            },
        );
        all_votes.insert(
            peer("ghost"),
            VoteEntry {
                name: "Ghost".into(),
                vote: VoteValue::One,
            },
        );
        game.handle_remote_message(&peer("bob"), Message::ShowVotes { all_votes }, T0);

        assert!(game.is_revealed());
        assert_eq!(game.player(&peer("bob")).unwrap().vote, Some(VoteValue::Thirteen));
        assert_eq!(game.local_player().unwrap().vote, Some(VoteValue::Two));
        assert!(game.player(&peer("ghost")).is_none());
    }

    #[test]
    fn clear_votes_resets_the_round() {
        let mut game = local("Alice");
        join(&mut game, "bob", "Bob", T0);
        game.cast_vote(VoteValue::Five, T0);
        game.handle_remote_message(&peer("bob"), Message::Vote { vote: VoteValue::Five }, T0);
        game.poll_timers(T0 + 500);
        assert!(game.is_revealed());
        game.drain_outputs();

        game.clear_votes();
        assert!(!game.is_revealed());
        assert!(!game.reveal_pending());
        assert!(game.players().iter().all(|p| p.vote.is_none()));
        let outputs = game.drain_outputs();
        assert_eq!(broadcasts(&outputs), vec![&Message::ClearVotes]);
    }

    #[test]
    fn remote_clear_votes_does_not_echo() {
        let mut game = local("Alice");
        join(&mut game, "bob", "Bob", T0);
        game.cast_vote(VoteValue::One, T0);
        game.drain_outputs();

        game.handle_remote_message(&peer("bob"), Message::ClearVotes, T0);
        assert!(game.local_player().unwrap().vote.is_none());
        assert!(broadcasts(&game.drain_outputs()).is_empty());
    }

    #[test]
    fn vote_from_unknown_peer_requests_player_data() {
        let mut game = local("Alice");
        game.handle_remote_message(&peer("stranger"), Message::Vote { vote: VoteValue::One }, T0);

        assert!(game.player(&peer("stranger")).is_none());
        let outputs = game.drain_outputs();
        assert_eq!(
            outputs,
            vec![GameOutput::SendToPlayer {
                peer: peer("stranger"),
                message: Message::RequestPlayerData,
            }]
        );
    }

    #[test]
    fn request_player_data_is_answered_directly() {
        let mut game = local("Alice");
        game.handle_remote_message(&peer("bob"), Message::RequestPlayerData, T0);
        let outputs = game.drain_outputs();
        assert!(matches!(
            outputs.as_slice(),
            [GameOutput::SendToPlayer { peer: p, message: Message::PlayerData { .. } }] if *p == peer("bob")
        ));
    }

    #[test]
    fn messages_claiming_the_local_id_are_ignored() {
        let mut game = local("Alice");
        game.handle_remote_message(&peer("me"), Message::ClearVotes, T0);
        game.handle_remote_message(
            &peer("bob"),
            Message::PlayerDisconnected { peer_id: peer("me") },
            T0,
        );
        assert!(game.local_player().is_some());
        assert!(game.drain_outputs().is_empty());
    }

    #[test]
    fn local_reaction_toggles_and_expires() {
        let mut game = local("Alice");
        assert_eq!(game.set_reaction(ReactionValue::Fire, T0), Some(ReactionValue::Fire));
        assert_eq!(game.reaction_deadline(&peer("me")), Some(T0 + 5000));
        game.drain_outputs();

        game.poll_timers(T0 + 4999);
        assert!(game.local_player().unwrap().reaction.is_some());

        game.poll_timers(T0 + 5000);
        assert!(game.local_player().unwrap().reaction.is_none());
        let outputs = game.drain_outputs();
        assert!(outputs.contains(&GameOutput::ReactionExpired));
        assert_eq!(
            broadcasts(&outputs),
            vec![&Message::Reaction {
                reaction: None,
                timestamp: T0 + 5000,
            }]
        );

        game.set_reaction(ReactionValue::Coffee, T0 + 6000);
        assert_eq!(game.set_reaction(ReactionValue::Coffee, T0 + 6100), None);
        assert!(game.reaction_deadline(&peer("me")).is_none());
    }

    #[test]
    fn late_remote_reaction_keeps_remaining_ttl() {
        let mut game = local("Alice");
        join(&mut game, "bob", "Bob", T0);

        game.handle_remote_message(
            &peer("bob"),
            Message::Reaction {
                reaction: Some(ReactionValue::Party),
                timestamp: T0,
            },
            T0 + 3000,
        );
        assert_eq!(game.reaction_deadline(&peer("bob")), Some(T0 + 5000));
        game.drain_outputs();

        game.poll_timers(T0 + 5000);
        assert!(game.player(&peer("bob")).unwrap().reaction.is_none());
        let outputs = game.drain_outputs();
        assert!(!outputs.contains(&GameOutput::ReactionExpired));
        assert!(broadcasts(&outputs).is_empty());
    }

    #[test]
    fn stale_remote_reaction_gets_minimum_lifetime() {
        let mut game = local("Alice");
        join(&mut game, "bob", "Bob", T0);
        game.handle_remote_message(
            &peer("bob"),
            Message::Reaction {
                reaction: Some(ReactionValue::Heart),
                timestamp: T0,
            },
            T0 + 60_000,
        );
        assert_eq!(game.reaction_deadline(&peer("bob")), Some(T0 + 60_100));
    }

    #[test]
    fn player_data_carries_reaction_expiry() {
        let mut game = local("Alice");
        let mut bob = remote_player("bob", "Bob");
        bob.reaction = Some(ReactionValue::Thinking);
        bob.reaction_timestamp = Some(T0);
        game.handle_remote_message(&peer("bob"), Message::PlayerData { player: bob }, T0 + 1000);
        assert_eq!(game.reaction_deadline(&peer("bob")), Some(T0 + 5000));
    }

    #[test]
    fn disconnect_can_complete_the_round() {
        let mut game = local("Alice");
        join(&mut game, "bob", "Bob", T0);
        join(&mut game, "carol", "Carol", T0);
        game.cast_vote(VoteValue::Five, T0);
        game.handle_remote_message(&peer("bob"), Message::Vote { vote: VoteValue::Three }, T0);
        assert!(!game.reveal_pending());
        game.drain_outputs();

        game.on_peer_disconnected(&peer("carol"), T0 + 100);
        assert!(game.player(&peer("carol")).is_none());
        assert!(game.reveal_pending());
        let outputs = game.drain_outputs();
        assert!(broadcasts(&outputs).contains(&&Message::PlayerDisconnected {
            peer_id: peer("carol")
        }));

        game.poll_timers(T0 + 600);
        assert!(game.is_revealed());
    }

    #[test]
    fn relayed_disconnect_is_not_rebroadcast() {
        let mut game = local("Alice");
        join(&mut game, "bob", "Bob", T0);
        game.drain_outputs();

        game.handle_remote_message(
            &peer("carol"),
            Message::PlayerDisconnected { peer_id: peer("bob") },
            T0,
        );
        assert!(game.player(&peer("bob")).is_none());
        assert!(broadcasts(&game.drain_outputs()).is_empty());
    }

    #[test]
    fn restore_drops_expired_reaction() {
        let mut game = local("Alice");
        game.restore_local_round(
            Some(VoteValue::Eight),
            Some((ReactionValue::ThumbsUp, T0)),
            true,
            T0 + 6000,
        );
        let me = game.local_player().unwrap();
        assert_eq!(me.vote, Some(VoteValue::Eight));
        assert!(me.reaction.is_none());
        assert!(game.is_revealed());
        assert!(broadcasts(&game.drain_outputs()).is_empty());

        game.restore_local_round(None, Some((ReactionValue::ThumbsUp, T0)), false, T0 + 1000);
        assert_eq!(game.reaction_deadline(&peer("me")), Some(T0 + 5000));
    }

    #[test]
    fn restore_clamps_a_corrupt_reaction_timestamp() {
        let mut game = local("Alice");
        game.restore_local_round(None, Some((ReactionValue::Fire, u64::MAX)), false, T0);

        let me = game.local_player().unwrap();
        assert_eq!(me.reaction, Some(ReactionValue::Fire));
        assert_eq!(me.reaction_timestamp, Some(T0));
        assert_eq!(game.reaction_deadline(&peer("me")), Some(T0 + 5000));

        game.poll_timers(T0 + 5000);
        assert!(game.local_player().unwrap().reaction.is_none());
    }

    #[test]
    fn consensus_reflects_votes() {
        let mut game = local("Alice");
        join(&mut game, "bob", "Bob", T0);
        game.cast_vote(VoteValue::Five, T0);
        game.handle_remote_message(&peer("bob"), Message::Vote { vote: VoteValue::Five }, T0);

        assert_eq!(game.consensus(), Consensus::Perfect);
        assert_eq!(game.average(), Some(5.0));
    }
}
