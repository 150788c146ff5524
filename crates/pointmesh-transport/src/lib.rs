//! Pointmesh Transport - peer connection adapter
//!
//! Presents one reliable, in-order channel per remote peer behind the
//! [`Transport`] trait:
//!
//! - [`Transport::listen`] opens the local endpoint under an id and returns
//!   the event stream. Fails with [`ConnectError::Timeout`] if the endpoint
//!   never becomes ready.
//! - [`Transport::connect`] opens an outbound link; the outcome arrives as a
//!   [`TransportEvent`].
//! - [`Transport::send`] / [`Transport::broadcast`] are fire-and-forget and
//!   drop frames for links that are not open.
//!
//! Two implementations:
//!
//! - [`TcpTransport`] links peers over TCP. A [`Rendezvous`] server plays the
//!   signalling broker, mapping peer ids to socket addresses.
//! - [`Switchboard`] and [`MemoryTransport`] do the same in-process, for
//!   tests and the simulator.

use std::future::Future;
use std::time::Duration;

use pointmesh_protocol::{Message, PeerId};
use tokio::sync::mpsc;

mod codec;
pub mod error;
pub mod memory;
pub mod rendezvous;
pub mod tcp;

pub use error::{ConnectError, PeerLinkError};
pub use memory::{MemoryTransport, Switchboard};
pub use rendezvous::{Rendezvous, RendezvousHandle};
pub use tcp::{TcpConfig, TcpTransport};

/// Default time allowed for the local endpoint to become ready.
pub const DEFAULT_LISTEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Which side opened a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The remote peer connected to us.
    Inbound,
    /// We connected to the remote peer.
    Outbound,
}

/// Connection lifecycle and inbound data, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The local endpoint is ready under this id.
    Ready(PeerId),
    /// A link to `peer` opened.
    PeerConnected { peer: PeerId, direction: Direction },
    /// The link to `peer` closed.
    PeerDisconnected(PeerId),
    /// A message arrived from `peer`.
    Data { peer: PeerId, message: Message },
    /// An outbound connection attempt failed.
    LinkFailed { peer: PeerId, error: PeerLinkError },
}

/// Receiving half of a transport's event stream.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// A peer-to-peer connection primitive.
///
/// Implementations must never surface a link whose remote id equals the
/// local id.
pub trait Transport: Send + 'static {
    /// Open the local endpoint under `local_id`.
    fn listen(
        &mut self,
        local_id: PeerId,
        timeout: Duration,
    ) -> impl Future<Output = Result<TransportEvents, ConnectError>> + Send;

    /// Id the endpoint is listening under, once `listen` succeeded.
    fn local_id(&self) -> Option<&PeerId>;

    /// Start an outbound link. Already-open links are left alone.
    fn connect(&mut self, remote_id: &PeerId);

    /// Send to one peer. Returns false if the frame was dropped.
    fn send(&self, peer_id: &PeerId, message: &Message) -> bool;

    /// Send to every open link. Returns the number of peers reached.
    fn broadcast(&self, message: &Message) -> usize;

    /// Close the link to one peer.
    fn disconnect(&mut self, peer_id: &PeerId);

    /// Close every link and release the local id.
    fn close(&mut self);

    /// Whether the link to `peer_id` is currently open.
    fn is_open(&self, peer_id: &PeerId) -> bool;

    /// Remote ids with an open link.
    fn open_peers(&self) -> Vec<PeerId>;

    /// Liveness check used by the heartbeat.
    fn probe(&self) -> bool;
}
