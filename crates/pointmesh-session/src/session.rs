//! Session entry points and the collaborator-facing handle.

use std::sync::Arc;
use std::time::Duration;

use pointmesh_protocol::{
    analyze, average, Consensus, PeerId, Player, PlayerProfile, ReactionValue, SessionId,
    VoteValue,
};
use pointmesh_transport::{ConnectError, Transport, TransportEvent, TransportEvents};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::error::{Result, RuntimeFault, SessionError};
use crate::runtime::{Command, Runtime, Start};
use crate::store::{FileStore, MemoryStore, SnapshotStore};

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The roster changed. Local player first.
    PlayersUpdated(Vec<Player>),
    /// Votes were revealed.
    VotingComplete,
    /// The local player's reaction expired and should be deselected.
    ReactionExpired,
    /// The transport went offline or came back.
    Connectivity { online: bool },
    /// A runtime problem that did not stop the session.
    Fault(RuntimeFault),
}

/// Receiving half of a session's event stream.
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Latest state of the round as seen by this peer.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundView {
    pub players: Vec<Player>,
    pub revealed: bool,
    pub online: bool,
    /// Peers with an open direct link.
    pub connected: Vec<PeerId>,
}

impl Default for RoundView {
    fn default() -> Self {
        Self {
            players: Vec::new(),
            revealed: false,
            online: true,
            connected: Vec::new(),
        }
    }
}

impl RoundView {
    pub fn votes(&self) -> Vec<VoteValue> {
        self.players.iter().filter_map(|p| p.vote).collect()
    }

    pub fn consensus(&self) -> Consensus {
        analyze(&self.votes())
    }

    pub fn average(&self) -> Option<f64> {
        average(&self.votes())
    }

    pub fn player(&self, id: &PeerId) -> Option<&Player> {
        self.players.iter().find(|p| p.id == *id)
    }

    pub fn all_voted(&self) -> bool {
        !self.players.is_empty() && self.players.iter().all(Player::has_voted)
    }
}

/// Starts, joins or resumes a session over a transport.
///
/// ```no_run
/// # async fn demo() -> pointmesh_session::Result<()> {
/// use pointmesh_protocol::{PlayerProfile, VoteValue};
/// use pointmesh_session::{Session, SessionConfig};
/// use pointmesh_transport::Switchboard;
///
/// let board = Switchboard::new();
/// let (host, _events) = Session::new(board.transport(), SessionConfig::default())
///     .create(PlayerProfile::new("Alice"))
///     .await?;
/// let (guest, _events) = Session::new(board.transport(), SessionConfig::default())
///     .join(host.session_id(), PlayerProfile::new("Bob"))
///     .await?;
/// guest.cast_vote(VoteValue::Five)?;
/// # Ok(())
/// # }
/// ```
pub struct Session<T: Transport> {
    transport: T,
    config: SessionConfig,
    store: Arc<dyn SnapshotStore>,
}

impl<T: Transport> Session<T> {
    /// Snapshots go to `config.snapshot_path` when set, otherwise memory.
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let store: Arc<dyn SnapshotStore> = match &config.snapshot_path {
            Some(path) => Arc::new(FileStore::new(path)),
            None => Arc::new(MemoryStore::new()),
        };
        Self {
            transport,
            config,
            store,
        }
    }

    pub fn with_store<S: SnapshotStore + 'static>(mut self, store: S) -> Self {
        self.store = Arc::new(store);
        self
    }

    /// Start a new session under a fresh id, as its bootstrap peer.
    pub async fn create(self, profile: PlayerProfile) -> Result<(SessionHandle, SessionEvents)> {
        self.create_with_id(SessionId::generate(), profile).await
    }

    /// Start a session under a chosen id, as its bootstrap peer.
    pub async fn create_with_id(
        mut self,
        session_id: SessionId,
        profile: PlayerProfile,
    ) -> Result<(SessionHandle, SessionEvents)> {
        let local_id = session_id.bootstrap_peer();
        let inbound = self
            .transport
            .listen(local_id.clone(), self.config.listen_timeout)
            .await?;
        info!(session = %session_id, "Created session");

        let start = Start {
            session_id,
            local_id,
            profile,
            is_bootstrap: true,
            restore: None,
            pending: Vec::new(),
        };
        Ok(self.spawn(start, inbound))
    }

    /// Join an existing session through its bootstrap peer.
    ///
    /// Fails with [`ConnectError::BootstrapUnreachable`] if the bootstrap
    /// peer cannot be reached within the listen timeout.
    pub async fn join(
        mut self,
        session_id: &SessionId,
        profile: PlayerProfile,
    ) -> Result<(SessionHandle, SessionEvents)> {
        let local_id = PeerId::random();
        let mut inbound = self
            .transport
            .listen(local_id.clone(), self.config.listen_timeout)
            .await?;

        let host = session_id.bootstrap_peer();
        self.transport.connect(&host);
        let pending =
            match await_link(&mut inbound, &host, self.config.listen_timeout).await {
                Ok(pending) => pending,
                Err(e) => {
                    self.transport.close();
                    return Err(e.into());
                }
            };
        info!(session = %session_id, peer = %local_id, "Joined session");

        let start = Start {
            session_id: session_id.clone(),
            local_id,
            profile,
            is_bootstrap: false,
            restore: None,
            pending,
        };
        Ok(self.spawn(start, inbound))
    }

    /// Re-attach to the session cached in the snapshot store.
    ///
    /// The local player and its round state come back immediately; a joiner
    /// then reconnects to the bootstrap peer in the background.
    pub async fn resume(mut self) -> Result<(SessionHandle, SessionEvents)> {
        let snapshot = self.store.load()?.ok_or(SessionError::NoCachedSession)?;
        let inbound = self
            .transport
            .listen(snapshot.peer_id.clone(), self.config.listen_timeout)
            .await?;
        info!(
            session = %snapshot.session_id,
            peer = %snapshot.peer_id,
            "Resuming cached session"
        );

        let start = Start {
            session_id: snapshot.session_id.clone(),
            local_id: snapshot.peer_id.clone(),
            profile: snapshot.profile.clone(),
            is_bootstrap: snapshot.is_bootstrap,
            restore: Some(snapshot),
            pending: Vec::new(),
        };
        Ok(self.spawn(start, inbound))
    }

    fn spawn(self, start: Start, inbound: TransportEvents) -> (SessionHandle, SessionEvents) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (round_tx, round_rx) = watch::channel(RoundView::default());

        let handle = SessionHandle {
            session_id: start.session_id.clone(),
            local_id: start.local_id.clone(),
            commands: command_tx,
            round: round_rx,
        };
        let runtime = Runtime::new(
            self.transport,
            &start,
            self.config,
            self.store,
            event_tx,
            round_tx,
        );
        tokio::spawn(runtime.run(start, command_rx, inbound));
        (handle, event_rx)
    }
}

/// Wait for the outcome of a connect to `peer`, keeping every event seen on
/// the way so the runtime can replay them.
async fn await_link(
    inbound: &mut TransportEvents,
    peer: &PeerId,
    timeout: Duration,
) -> std::result::Result<Vec<TransportEvent>, ConnectError> {
    let mut seen = Vec::new();
    let outcome = tokio::time::timeout(timeout, async {
        while let Some(event) = inbound.recv().await {
            if let TransportEvent::LinkFailed { peer: p, error } = &event {
                if p == peer {
                    warn!("Bootstrap peer {} unreachable: {}", peer, error);
                    return Err(ConnectError::BootstrapUnreachable(peer.clone()));
                }
            }
            let linked = matches!(
                &event,
                TransportEvent::PeerConnected { peer: p, .. } if p == peer
            );
            seen.push(event);
            if linked {
                return Ok(());
            }
        }
        Err(ConnectError::Closed)
    })
    .await;

    match outcome {
        Ok(Ok(())) => Ok(seen),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            warn!("No answer from bootstrap peer {} after {:?}", peer, timeout);
            Err(ConnectError::BootstrapUnreachable(peer.clone()))
        }
    }
}

/// Input surface of a running session. Cheap to clone; the session stops
/// when the last handle is dropped or [`SessionHandle::leave`] is called.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    local_id: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    round: watch::Receiver<RoundView>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn is_bootstrap(&self) -> bool {
        self.local_id.is_bootstrap()
    }

    pub fn cast_vote(&self, vote: VoteValue) -> Result<()> {
        self.send(Command::CastVote(vote))
    }

    pub fn clear_votes(&self) -> Result<()> {
        self.send(Command::ClearVotes)
    }

    pub fn show_votes(&self) -> Result<()> {
        self.send(Command::ShowVotes)
    }

    /// Picking the active reaction again clears it.
    pub fn set_reaction(&self, reaction: ReactionValue) -> Result<()> {
        self.send(Command::SetReaction(reaction))
    }

    pub fn clear_reaction(&self) -> Result<()> {
        self.send(Command::ClearReaction)
    }

    /// Open a direct link to `peer` outside of the bootstrap flow.
    pub fn add_peer(&self, peer: PeerId) -> Result<()> {
        self.send(Command::AddPeer(peer))
    }

    /// Close the direct link to `peer`.
    pub fn remove_peer(&self, peer: PeerId) -> Result<()> {
        self.send(Command::RemovePeer(peer))
    }

    /// Close every link and forget the cached session.
    pub async fn leave(self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(Command::Leave(done_tx))?;
        done_rx.await.map_err(|_| SessionError::Closed)
    }

    /// Current roster, local player first.
    pub fn players(&self) -> Vec<Player> {
        self.round.borrow().players.clone()
    }

    pub fn round(&self) -> RoundView {
        self.round.borrow().clone()
    }

    pub fn is_revealed(&self) -> bool {
        self.round.borrow().revealed
    }

    pub fn is_online(&self) -> bool {
        self.round.borrow().online
    }

    /// Wait until the round satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> Result<RoundView>
    where
        F: FnMut(&RoundView) -> bool,
    {
        let mut round = self.round.clone();
        let view = round
            .wait_for(predicate)
            .await
            .map_err(|_| SessionError::Closed)?;
        Ok(view.clone())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }
}
