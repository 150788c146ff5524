//! The session actor.
//!
//! One task owns the transport, the mesh coordinator and the game state.
//! Handles talk to it over a command channel; everything it has to say goes
//! out as [`SessionEvent`]s and through the shared [`RoundView`].

use std::sync::Arc;

use pointmesh_game::{GameOutput, GameState};
use pointmesh_mesh::{LinkState, MeshAction, MeshCoordinator};
use pointmesh_protocol::{
    Message, PeerId, Player, PlayerProfile, ReactionValue, SessionId, VoteValue,
};
use pointmesh_transport::{Transport, TransportEvent, TransportEvents};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::error::RuntimeFault;
use crate::session::{RoundView, SessionEvent};
use crate::store::{Snapshot, SnapshotStore};

/// Requests from a [`crate::SessionHandle`].
#[derive(Debug)]
pub(crate) enum Command {
    CastVote(VoteValue),
    ClearVotes,
    ShowVotes,
    SetReaction(ReactionValue),
    ClearReaction,
    AddPeer(PeerId),
    RemovePeer(PeerId),
    Leave(oneshot::Sender<()>),
}

/// Identity and cached state the actor starts from.
pub(crate) struct Start {
    pub session_id: SessionId,
    pub local_id: PeerId,
    pub profile: PlayerProfile,
    pub is_bootstrap: bool,
    pub restore: Option<Snapshot>,
    /// Transport events consumed while joining, replayed first.
    pub pending: Vec<TransportEvent>,
}

#[derive(Debug, Clone, Copy)]
struct Reconnect {
    attempt: u32,
    at: Instant,
}

pub(crate) struct Runtime<T: Transport> {
    transport: T,
    mesh: MeshCoordinator,
    game: GameState,
    config: SessionConfig,
    store: Arc<dyn SnapshotStore>,
    session_id: SessionId,
    profile: PlayerProfile,
    is_bootstrap: bool,
    clock: Clock,
    online: bool,
    reconnect: Option<Reconnect>,
    events: mpsc::UnboundedSender<SessionEvent>,
    round: watch::Sender<RoundView>,
}

impl<T: Transport> Runtime<T> {
    pub(crate) fn new(
        transport: T,
        start: &Start,
        config: SessionConfig,
        store: Arc<dyn SnapshotStore>,
        events: mpsc::UnboundedSender<SessionEvent>,
        round: watch::Sender<RoundView>,
    ) -> Self {
        Self {
            transport,
            mesh: MeshCoordinator::new(start.local_id.clone()),
            game: GameState::new(config.game_config()),
            config,
            store,
            session_id: start.session_id.clone(),
            profile: start.profile.clone(),
            is_bootstrap: start.is_bootstrap,
            clock: Clock::new(),
            online: true,
            reconnect: None,
            events,
            round,
        }
    }

    pub(crate) async fn run(
        mut self,
        start: Start,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: TransportEvents,
    ) {
        self.begin(start);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            let wakeup = self.next_wakeup();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Leave(done)) => {
                        self.leave();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All session handles dropped, closing");
                        self.transport.close();
                        break;
                    }
                },
                event = inbound.recv() => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => {
                        warn!("Transport event stream ended");
                        break;
                    }
                },
                _ = sleep_until(wakeup) => self.on_timer(),
                _ = heartbeat.tick() => self.heartbeat(),
            }
            self.flush();
        }

        info!(session = %self.session_id, "Session stopped");
    }

    fn begin(&mut self, start: Start) {
        let now = self.clock.now_ms();
        self.game.set_local_identity(start.local_id.clone(), &self.profile);

        if let Some(snapshot) = start.restore {
            let reaction = snapshot.reaction.zip(snapshot.reaction_timestamp);
            self.game
                .restore_local_round(snapshot.vote, reaction, snapshot.revealed, now);
            if !self.is_bootstrap {
                self.start_reconnect(true);
            }
        }
        self.flush();

        for event in start.pending {
            self.handle_transport_event(event);
            self.flush();
        }
        self.save_snapshot();
    }

    // --- Inputs ---

    fn handle_command(&mut self, command: Command) {
        let now = self.clock.now_ms();
        trace!("Command {:?}", command);
        match command {
            Command::CastVote(vote) => {
                self.game.cast_vote(vote, now);
            }
            Command::ClearVotes => self.game.clear_votes(),
            Command::ShowVotes => self.game.show_votes(),
            Command::SetReaction(reaction) => {
                self.game.set_reaction(reaction, now);
            }
            Command::ClearReaction => {
                self.game.clear_reaction(now);
            }
            Command::AddPeer(peer) => {
                self.mesh.request_connect(&peer);
                return;
            }
            Command::RemovePeer(peer) => {
                self.transport.disconnect(&peer);
                return;
            }
            Command::Leave(_) => return,
        }
        self.save_snapshot();
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        let now = self.clock.now_ms();
        match event {
            TransportEvent::Ready(id) => debug!("Endpoint ready as {}", id),
            TransportEvent::PeerConnected { peer, direction } => {
                if self.mesh.on_connected(&peer, direction) {
                    info!(peer = %peer, ?direction, "Peer connected");
                    if self.is_bootstrap_peer(&peer) && self.reconnect.take().is_some() {
                        info!("Bootstrap peer back, cancelling pending attempts");
                    }
                    self.game.on_peer_connected(&peer);
                }
            }
            TransportEvent::PeerDisconnected(peer) => {
                if self.mesh.on_disconnected(&peer) {
                    info!(peer = %peer, "Peer disconnected");
                    self.game.on_peer_disconnected(&peer, now);
                    // A reloading bootstrap peer only comes back if joiners dial it.
                    if !self.is_bootstrap
                        && (self.is_bootstrap_peer(&peer) || self.mesh.open_count() == 0)
                    {
                        self.start_reconnect(false);
                    }
                }
            }
            TransportEvent::Data { peer, message } => self.handle_message(peer, message, now),
            TransportEvent::LinkFailed { peer, error } => {
                self.mesh.on_link_failed(&peer, &error);
            }
        }
    }

    fn handle_message(&mut self, from: PeerId, message: Message, now: u64) {
        match message {
            Message::PeerList { peers } => {
                self.mesh.on_peer_list(&from, &peers);
            }
            Message::PlayerDisconnected { peer_id } if self.mesh.is_connected(&peer_id) => {
                debug!(
                    "{} reports {} gone but our link is open, ignoring",
                    from, peer_id
                );
            }
            message => {
                let resets_round =
                    matches!(message, Message::ClearVotes | Message::ShowVotes { .. });
                self.game.handle_remote_message(&from, message, now);
                if resets_round {
                    self.save_snapshot();
                }
            }
        }
    }

    // --- Timers ---

    fn next_wakeup(&self) -> Option<Instant> {
        let game = self.game.next_deadline().map(|ms| self.clock.instant_at(ms));
        let reconnect = self.reconnect.map(|r| r.at);
        match (game, reconnect) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn on_timer(&mut self) {
        let now = self.clock.now_ms();
        let revealed = self.game.is_revealed();
        let reaction = self.game.local_player().and_then(|p| p.reaction);
        self.game.poll_timers(now);
        if revealed != self.game.is_revealed()
            || reaction != self.game.local_player().and_then(|p| p.reaction)
        {
            self.save_snapshot();
        }

        if let Some(reconnect) = self.reconnect {
            if reconnect.at <= Instant::now() {
                self.reconnect_attempt(reconnect.attempt);
            }
        }
    }

    fn heartbeat(&mut self) {
        let up = self.transport.probe();
        if up == self.online {
            return;
        }
        self.online = up;

        if up {
            info!("Transport reachable again, resynchronising");
            self.emit(SessionEvent::Connectivity { online: true });
            self.game.resync();
            if !self.is_bootstrap && !self.bootstrap_linked() && self.reconnect.is_none() {
                self.start_reconnect(true);
            }
        } else {
            warn!("Heartbeat probe failed, entering offline mode");
            self.emit(SessionEvent::Connectivity { online: false });
            self.emit(SessionEvent::Fault(RuntimeFault::TransientNetwork {
                reason: "heartbeat probe failed".to_string(),
            }));
        }
    }

    // --- Reconnection ---

    fn start_reconnect(&mut self, immediate: bool) {
        if self.reconnect.is_some() {
            return;
        }
        let delay = if immediate {
            std::time::Duration::ZERO
        } else {
            self.config.reconnect_delay(0)
        };
        debug!("Reconnecting to bootstrap peer in {:?}", delay);
        self.reconnect = Some(Reconnect {
            attempt: 0,
            at: Instant::now() + delay,
        });
    }

    fn is_bootstrap_peer(&self, peer: &PeerId) -> bool {
        *peer == self.session_id.bootstrap_peer()
    }

    fn bootstrap_linked(&self) -> bool {
        self.mesh.is_connected(&self.session_id.bootstrap_peer())
    }

    fn reconnect_attempt(&mut self, attempt: u32) {
        if self.bootstrap_linked() {
            self.reconnect = None;
            return;
        }
        let max = self.config.reconnect_max_attempts;
        if attempt >= max {
            self.reconnect = None;
            if self.mesh.open_count() > 0 {
                info!(
                    "Bootstrap peer gone after {} attempts, staying with the mesh",
                    attempt
                );
                return;
            }
            warn!("Giving up on bootstrap peer after {} attempts", attempt);
            self.emit(SessionEvent::Fault(RuntimeFault::ReconnectionExhausted {
                attempts: attempt,
            }));
            return;
        }

        let host = self.session_id.bootstrap_peer();
        info!(attempt = attempt + 1, max, "Reconnecting to {}", host);
        if self.mesh.state_of(&host) != Some(LinkState::Connecting) {
            self.mesh.request_connect(&host);
        }
        self.reconnect = Some(Reconnect {
            attempt: attempt + 1,
            at: Instant::now() + self.config.reconnect_delay(attempt),
        });
    }

    // --- Outputs ---

    fn flush(&mut self) {
        for action in self.mesh.drain_actions() {
            match action {
                MeshAction::Connect(peer) => {
                    debug!("Connecting to {}", peer);
                    self.transport.connect(&peer);
                }
                MeshAction::Send { peer, message } => self.send(&peer, &message),
            }
        }

        let mut roster = None;
        let mut notices = Vec::new();
        for output in self.game.drain_outputs() {
            match output {
                GameOutput::PlayersUpdated(players) => roster = Some(players),
                GameOutput::VotingComplete => notices.push(SessionEvent::VotingComplete),
                GameOutput::ReactionExpired => notices.push(SessionEvent::ReactionExpired),
                GameOutput::Broadcast(message) => self.broadcast(&message),
                GameOutput::SendToPlayer { peer, message } => self.send(&peer, &message),
            }
        }

        self.publish_round(roster.clone());
        if let Some(players) = roster {
            self.emit(SessionEvent::PlayersUpdated(players));
        }
        for notice in notices {
            self.emit(notice);
        }
    }

    fn send(&self, peer: &PeerId, message: &Message) {
        if !self.online {
            trace!("Offline, not sending {} to {}", message.kind(), peer);
            return;
        }
        if !self.transport.send(peer, message) {
            debug!("Dropped {} to {}", message.kind(), peer);
        }
    }

    fn broadcast(&self, message: &Message) {
        if !self.online {
            trace!("Offline, not broadcasting {}", message.kind());
            return;
        }
        let reached = self.transport.broadcast(message);
        trace!("{} reached {} peers", message.kind(), reached);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Refresh the shared view, waking watchers only on change.
    fn publish_round(&self, players: Option<Vec<Player>>) {
        let revealed = self.game.is_revealed();
        let online = self.online;
        let connected = self.mesh.connected_peers();
        self.round.send_if_modified(|view| {
            let mut changed = false;
            if let Some(players) = players {
                changed |= view.players != players;
                view.players = players;
            }
            changed |= view.revealed != revealed
                || view.online != online
                || view.connected != connected;
            view.revealed = revealed;
            view.online = online;
            view.connected = connected;
            changed
        });
    }

    fn save_snapshot(&self) {
        let Some(me) = self.game.local_player() else {
            return;
        };
        let snapshot = Snapshot {
            session_id: self.session_id.clone(),
            peer_id: me.id.clone(),
            is_bootstrap: self.is_bootstrap,
            profile: self.profile.clone(),
            vote: me.vote,
            reaction: me.reaction,
            reaction_timestamp: me.reaction_timestamp,
            revealed: self.game.is_revealed(),
        };
        if let Err(e) = self.store.save(&snapshot) {
            warn!("Failed to save session snapshot: {}", e);
        }
    }

    fn leave(&mut self) {
        info!(session = %self.session_id, "Leaving session");
        self.transport.close();
        self.reconnect = None;
        if let Err(e) = self.store.clear() {
            warn!("Failed to clear session snapshot: {}", e);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
