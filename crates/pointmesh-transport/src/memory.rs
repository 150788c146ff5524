//! In-process transport.
//!
//! A [`Switchboard`] is the shared rendezvous: endpoints register under a
//! peer id and links are recorded once per unordered pair of ids. Frames are
//! encoded to JSON on send and decoded on delivery, so a link behaves like a
//! reliable, ordered data channel.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use pointmesh_protocol::{Message, PeerId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::error::{ConnectError, PeerLinkError};
use crate::{Direction, Transport, TransportEvent, TransportEvents};

type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Unordered pair of peer ids.
type LinkKey = (PeerId, PeerId);

fn link_key(a: &PeerId, b: &PeerId) -> LinkKey {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[derive(Default)]
struct BoardState {
    endpoints: HashMap<PeerId, EventSender>,
    links: HashSet<LinkKey>,
    blocked: HashSet<LinkKey>,
}

struct Inner {
    available: watch::Sender<bool>,
    state: Mutex<BoardState>,
}

/// Shared rendezvous for [`MemoryTransport`] endpoints.
#[derive(Clone)]
pub struct Switchboard {
    inner: Arc<Inner>,
}

impl Default for Switchboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Switchboard {
    pub fn new() -> Self {
        let (available, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                available,
                state: Mutex::new(BoardState::default()),
            }),
        }
    }

    /// Create a transport attached to this switchboard.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport::new(self.clone())
    }

    /// Take the switchboard on or offline. While offline, listens stall and
    /// probes fail; links that are already open keep working.
    pub fn set_available(&self, available: bool) {
        self.inner.available.send_replace(available);
        info!(available, "Switchboard availability changed");
    }

    pub fn is_available(&self) -> bool {
        *self.inner.available.borrow()
    }

    /// Refuse future links between `a` and `b`.
    pub fn block(&self, a: &PeerId, b: &PeerId) {
        self.lock().blocked.insert(link_key(a, b));
    }

    pub fn unblock(&self, a: &PeerId, b: &PeerId) {
        self.lock().blocked.remove(&link_key(a, b));
    }

    pub fn is_registered(&self, id: &PeerId) -> bool {
        self.lock().endpoints.contains_key(id)
    }

    /// Ids linked to `id`, sorted.
    pub fn peers_of(&self, id: &PeerId) -> Vec<PeerId> {
        let board = self.lock();
        let mut peers: Vec<PeerId> = board
            .links
            .iter()
            .filter_map(|(a, b)| {
                if a == id {
                    Some(b.clone())
                } else if b == id {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect();
        peers.sort();
        peers
    }

    /// Total number of open links.
    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One endpoint on a [`Switchboard`].
pub struct MemoryTransport {
    board: Switchboard,
    local: Option<PeerId>,
}

impl MemoryTransport {
    pub fn new(board: Switchboard) -> Self {
        Self { board, local: None }
    }

    fn emit_local(&self, board: &BoardState, event: TransportEvent) {
        if let Some(tx) = self.local.as_ref().and_then(|id| board.endpoints.get(id)) {
            let _ = tx.send(event);
        }
    }

    fn encode(message: &Message) -> Option<String> {
        match message.to_json() {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("Dropping unencodable {} message: {}", message.kind(), e);
                None
            }
        }
    }

    /// Record a new link, returning the remote's event sender.
    /// `Ok(None)` means the pair is already linked.
    fn open_link(
        &self,
        board: &mut BoardState,
        local: &PeerId,
        remote: &PeerId,
    ) -> Result<Option<EventSender>, PeerLinkError> {
        if remote == local {
            return Err(PeerLinkError::SelfConnection);
        }
        if !self.board.is_available() {
            return Err(PeerLinkError::Unavailable(remote.clone()));
        }
        let key = link_key(local, remote);
        if board.links.contains(&key) {
            return Ok(None);
        }
        if board.blocked.contains(&key) {
            return Err(PeerLinkError::Refused(remote.clone()));
        }
        let remote_tx = board
            .endpoints
            .get(remote)
            .cloned()
            .ok_or_else(|| PeerLinkError::Unavailable(remote.clone()))?;
        board.links.insert(key);
        Ok(Some(remote_tx))
    }
}

/// Decode a frame at the receiving end and queue it.
fn deliver(tx: &EventSender, from: &PeerId, frame: &str) -> bool {
    match Message::from_json(frame) {
        Ok(message) => tx
            .send(TransportEvent::Data {
                peer: from.clone(),
                message,
            })
            .is_ok(),
        Err(e) => {
            warn!("Malformed frame from {}: {}", from, e);
            false
        }
    }
}

impl Transport for MemoryTransport {
    async fn listen(
        &mut self,
        local_id: PeerId,
        timeout: Duration,
    ) -> Result<TransportEvents, ConnectError> {
        if let Some(previous) = self.local.clone() {
            debug!("Re-listening as {}, releasing {}", local_id, previous);
            self.close();
        }
        let mut available = self.board.inner.available.subscribe();
        let ready = async move { available.wait_for(|up| *up).await.is_ok() };
        match tokio::time::timeout(timeout, ready).await {
            Err(_) => {
                warn!("Endpoint {} not ready after {:?}", local_id, timeout);
                return Err(ConnectError::Timeout(timeout));
            }
            Ok(false) => return Err(ConnectError::Closed),
            Ok(true) => {}
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut board = self.board.lock();
            if board.endpoints.contains_key(&local_id) {
                return Err(ConnectError::IdTaken(local_id));
            }
            let _ = tx.send(TransportEvent::Ready(local_id.clone()));
            board.endpoints.insert(local_id.clone(), tx);
        }

        info!("Endpoint listening as {}", local_id);
        self.local = Some(local_id);
        Ok(rx)
    }

    fn local_id(&self) -> Option<&PeerId> {
        self.local.as_ref()
    }

    fn connect(&mut self, remote_id: &PeerId) {
        let Some(local) = self.local.clone() else {
            warn!("connect({}) before listen", remote_id);
            return;
        };

        let mut board = self.board.lock();
        match self.open_link(&mut board, &local, remote_id) {
            Ok(Some(remote_tx)) => {
                self.emit_local(
                    &board,
                    TransportEvent::PeerConnected {
                        peer: remote_id.clone(),
                        direction: Direction::Outbound,
                    },
                );
                let _ = remote_tx.send(TransportEvent::PeerConnected {
                    peer: local.clone(),
                    direction: Direction::Inbound,
                });
                debug!("Link {} -> {} open", local, remote_id);
            }
            Ok(None) => debug!("Already linked to {}", remote_id),
            Err(error) => {
                debug!("Link {} -> {} failed: {}", local, remote_id, error);
                self.emit_local(
                    &board,
                    TransportEvent::LinkFailed {
                        peer: remote_id.clone(),
                        error,
                    },
                );
            }
        }
    }

    fn send(&self, peer_id: &PeerId, message: &Message) -> bool {
        let Some(local) = self.local.as_ref() else {
            return false;
        };
        if peer_id == local {
            return false;
        }
        let Some(frame) = Self::encode(message) else {
            return false;
        };

        let board = self.board.lock();
        if !board.links.contains(&link_key(local, peer_id)) {
            trace!("No open link to {}, dropping {}", peer_id, message.kind());
            return false;
        }
        match board.endpoints.get(peer_id) {
            Some(tx) => deliver(tx, local, &frame),
            None => false,
        }
    }

    fn broadcast(&self, message: &Message) -> usize {
        let Some(local) = self.local.as_ref() else {
            return 0;
        };
        let Some(frame) = Self::encode(message) else {
            return 0;
        };

        let board = self.board.lock();
        let mut reached = 0;
        for (a, b) in &board.links {
            let remote = if a == local {
                b
            } else if b == local {
                a
            } else {
                continue;
            };
            if let Some(tx) = board.endpoints.get(remote) {
                if deliver(tx, local, &frame) {
                    reached += 1;
                }
            }
        }
        trace!("Broadcast {} to {} peers", message.kind(), reached);
        reached
    }

    fn disconnect(&mut self, peer_id: &PeerId) {
        let Some(local) = self.local.clone() else {
            return;
        };
        let mut board = self.board.lock();
        if !board.links.remove(&link_key(&local, peer_id)) {
            return;
        }
        if let Some(tx) = board.endpoints.get(peer_id) {
            let _ = tx.send(TransportEvent::PeerDisconnected(local.clone()));
        }
        self.emit_local(&board, TransportEvent::PeerDisconnected(peer_id.clone()));
        info!("Disconnected from {}", peer_id);
    }

    fn close(&mut self) {
        let Some(local) = self.local.take() else {
            return;
        };
        let mut board = self.board.lock();
        let mine: Vec<LinkKey> = board
            .links
            .iter()
            .filter(|(a, b)| *a == local || *b == local)
            .cloned()
            .collect();
        for key in mine {
            board.links.remove(&key);
            let remote = if key.0 == local { &key.1 } else { &key.0 };
            if let Some(tx) = board.endpoints.get(remote) {
                let _ = tx.send(TransportEvent::PeerDisconnected(local.clone()));
            }
        }
        board.endpoints.remove(&local);
        info!("Endpoint {} closed", local);
    }

    fn is_open(&self, peer_id: &PeerId) -> bool {
        match self.local.as_ref() {
            Some(local) => self.board.lock().links.contains(&link_key(local, peer_id)),
            None => false,
        }
    }

    fn open_peers(&self) -> Vec<PeerId> {
        match self.local.as_ref() {
            Some(local) => self.board.peers_of(local),
            None => Vec::new(),
        }
    }

    fn probe(&self) -> bool {
        self.board.is_available()
            && self
                .local
                .as_ref()
                .is_some_and(|id| self.board.is_registered(id))
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}
