//! Mesh coordinator - grows a full mesh out of a star.
//!
//! # Bootstrap
//!
//! ```text
//!   joiner ──connect──▶ host-{session}          (star edge)
//!   joiner ◀─peer_list── host-{session}          [every other open peer]
//!   joiner ──connect──▶ each listed peer         (mesh edges)
//! ```
//!
//! Every peer answers every *inbound* link with a `peer_list`, so whichever
//! peer a newcomer reaches first hands it the rest of the roster. One round
//! trip after the bootstrap link, the newcomer holds a direct link to every
//! participant.
//!
//! The coordinator performs no IO. Callers feed it transport events and
//! drain [`MeshAction`]s to execute.

use std::collections::HashMap;

use pointmesh_protocol::{Message, PeerId};
use pointmesh_transport::{Direction, PeerLinkError};
use tracing::{debug, info, warn};

/// State of one recorded connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Outbound attempt in flight.
    Connecting,
    /// Link is open.
    Open(Direction),
}

/// Work the caller must perform on the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshAction {
    /// Open an outbound link.
    Connect(PeerId),
    /// Send one message to one peer.
    Send { peer: PeerId, message: Message },
}

/// Connection bookkeeping for one peer of the mesh.
#[derive(Debug)]
pub struct MeshCoordinator {
    local_id: PeerId,
    links: HashMap<PeerId, LinkState>,
    actions: Vec<MeshAction>,
}

impl MeshCoordinator {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            links: HashMap::new(),
            actions: Vec::new(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Queue an outbound connection unless `peer` is ourselves or already
    /// recorded. Returns whether an attempt was queued.
    pub fn request_connect(&mut self, peer: &PeerId) -> bool {
        if *peer == self.local_id {
            debug!("Skipping connection to self");
            return false;
        }
        if self.links.contains_key(peer) {
            debug!("Already holding a connection to {}", peer);
            return false;
        }
        self.links.insert(peer.clone(), LinkState::Connecting);
        self.actions.push(MeshAction::Connect(peer.clone()));
        true
    }

    /// A link opened. Returns true the first time `peer` becomes open.
    ///
    /// Inbound links are answered with a `peer_list` naming every other open
    /// peer.
    pub fn on_connected(&mut self, peer: &PeerId, direction: Direction) -> bool {
        if *peer == self.local_id {
            warn!("Ignoring connection event for our own id {}", peer);
            return false;
        }

        let previous = self.links.insert(peer.clone(), LinkState::Open(direction));
        if matches!(previous, Some(LinkState::Open(_))) {
            debug!("Duplicate open for {}", peer);
            return false;
        }
        info!(?direction, "Peer {} connected ({} open)", peer, self.open_count());

        if direction == Direction::Inbound {
            let peers = self.others(peer);
            debug!("Sending peer_list of {} to {}", peers.len(), peer);
            self.actions.push(MeshAction::Send {
                peer: peer.clone(),
                message: Message::PeerList { peers },
            });
        }
        true
    }

    /// Connect to every listed peer we do not already hold. Returns the
    /// number of new attempts.
    pub fn on_peer_list(&mut self, from: &PeerId, peers: &[PeerId]) -> usize {
        let attempts = peers.iter().filter(|p| self.request_connect(p)).count();
        debug!(
            "peer_list from {}: {} listed, {} new",
            from,
            peers.len(),
            attempts
        );
        attempts
    }

    /// A link closed. Returns true if it was open; the caller then owes the
    /// remaining peers a `player_disconnected` notice.
    pub fn on_disconnected(&mut self, peer: &PeerId) -> bool {
        match self.links.remove(peer) {
            Some(LinkState::Open(_)) => {
                info!("Peer {} disconnected ({} open)", peer, self.open_count());
                true
            }
            Some(LinkState::Connecting) => {
                debug!("Pending connection to {} closed before opening", peer);
                false
            }
            None => false,
        }
    }

    /// An outbound attempt failed. The peer is dropped; mesh formation
    /// carries on without it.
    pub fn on_link_failed(&mut self, peer: &PeerId, error: &PeerLinkError) {
        if self.links.get(peer) == Some(&LinkState::Connecting) {
            self.links.remove(peer);
        }
        warn!("Mesh link to {} failed, skipping: {}", peer, error);
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        matches!(self.links.get(peer), Some(LinkState::Open(_)))
    }

    pub fn state_of(&self, peer: &PeerId) -> Option<LinkState> {
        self.links.get(peer).copied()
    }

    /// Open peers, sorted.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(_, state)| matches!(state, LinkState::Open(_)))
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn open_count(&self) -> usize {
        self.links
            .values()
            .filter(|state| matches!(state, LinkState::Open(_)))
            .count()
    }

    /// No links recorded, open or pending.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Forget every link, e.g. when the transport is torn down.
    pub fn reset(&mut self) {
        self.links.clear();
        self.actions.clear();
    }

    /// Take the queued actions.
    pub fn drain_actions(&mut self) -> Vec<MeshAction> {
        std::mem::take(&mut self.actions)
    }

    fn others(&self, exclude: &PeerId) -> Vec<PeerId> {
        self.connected_peers()
            .into_iter()
            .filter(|p| p != exclude)
            .collect()
    }
}
