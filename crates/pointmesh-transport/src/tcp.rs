//! Networked transport over TCP.
//!
//! Each endpoint binds a listener, registers its id with a [`Rendezvous`]
//! and resolves remote ids there before dialing. A link is one TCP stream
//! carrying newline-delimited JSON: the dialer sends a hello naming itself,
//! the acceptor answers with its own hello, then both sides exchange
//! [`Message`] frames until either end closes.
//!
//! [`Rendezvous`]: crate::rendezvous::Rendezvous

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use pointmesh_protocol::{Message, PeerId};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::codec::{read_frame, write_line};
use crate::error::{ConnectError, PeerLinkError};
use crate::rendezvous::{self, Registration};
use crate::{Direction, Transport, TransportEvent, TransportEvents};

type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Pause between attempts to reach the rendezvous.
const RETRY_DELAY: Duration = Duration::from_millis(250);

/// Settings for a [`TcpTransport`].
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Where the rendezvous server listens.
    pub rendezvous: SocketAddr,
    /// Local address for the peer listener. Port 0 picks a free port.
    pub bind: SocketAddr,
    /// Time allowed for dialing and the hello exchange.
    pub handshake_timeout: Duration,
}

impl TcpConfig {
    pub fn new(rendezvous: SocketAddr) -> Self {
        Self {
            rendezvous,
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            handshake_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// First frame on every link.
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    peer: PeerId,
}

struct Link {
    id: u64,
    frames: mpsc::UnboundedSender<String>,
    reader: AbortHandle,
}

impl Drop for Link {
    fn drop(&mut self) {
        // The writer drains and shuts down once `frames` is dropped.
        self.reader.abort();
    }
}

#[derive(Default)]
struct LinkTable {
    links: HashMap<PeerId, Link>,
    dialing: HashSet<PeerId>,
    next_id: u64,
    closed: bool,
}

/// State shared between the transport and its socket tasks.
struct Shared {
    local: PeerId,
    events: EventSender,
    table: Mutex<LinkTable>,
    registered: AtomicBool,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, LinkTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Record an established stream as the link to `peer` and start its
    /// reader and writer. Returns false if a link to `peer` already exists.
    fn open(
        self: &Arc<Self>,
        peer: PeerId,
        direction: Direction,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        greeting: Option<String>,
    ) -> bool {
        let mut table = self.table();
        if table.closed || table.links.contains_key(&peer) {
            debug!("Already linked to {}, dropping new stream", peer);
            return false;
        }

        let (frames, queued) = mpsc::unbounded_channel();
        if let Some(hello) = greeting {
            let _ = frames.send(hello);
        }
        table.next_id += 1;
        let id = table.next_id;

        tokio::spawn(write_loop(peer.clone(), writer, queued));
        self.emit(TransportEvent::PeerConnected {
            peer: peer.clone(),
            direction,
        });
        let reader = tokio::spawn(read_loop(Arc::clone(self), peer.clone(), id, reader));
        table.links.insert(
            peer.clone(),
            Link {
                id,
                frames,
                reader: reader.abort_handle(),
            },
        );
        info!(?direction, "Link {} <-> {} open", self.local, peer);
        true
    }

    /// Forget the link to `peer` if it is still the one numbered `id`.
    fn lost(&self, peer: &PeerId, id: u64) {
        let mut table = self.table();
        if table.links.get(peer).is_some_and(|l| l.id == id) {
            table.links.remove(peer);
            drop(table);
            info!("Link to {} closed", peer);
            self.emit(TransportEvent::PeerDisconnected(peer.clone()));
        }
    }
}

async fn write_loop(
    peer: PeerId,
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<String>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_line(&mut writer, &frame).await {
            debug!("Write to {} failed: {}", peer, e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    shared: Arc<Shared>,
    peer: PeerId,
    id: u64,
    mut reader: BufReader<OwnedReadHalf>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let frame = line.trim();
                if frame.is_empty() {
                    continue;
                }
                match Message::from_json(frame) {
                    Ok(message) => shared.emit(TransportEvent::Data {
                        peer: peer.clone(),
                        message,
                    }),
                    Err(e) => warn!("Malformed frame from {}: {}", peer, e),
                }
            }
            Err(e) => {
                debug!("Read from {} failed: {}", peer, e);
                break;
            }
        }
    }
    shared.lost(&peer, id);
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, handshake: Duration) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                trace!("Incoming connection from {}", addr);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = accept_link(stream, &shared, handshake).await {
                        debug!("Rejected connection from {}: {}", addr, e);
                    }
                });
            }
            Err(e) => warn!("Accept error: {}", e),
        }
    }
}

async fn accept_link(
    stream: TcpStream,
    shared: &Arc<Shared>,
    handshake: Duration,
) -> std::io::Result<()> {
    let (read, writer) = stream.into_split();
    let mut reader = BufReader::new(read);
    let hello = tokio::time::timeout(handshake, read_frame::<_, Hello>(&mut reader))
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??
        .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;

    if hello.peer == shared.local {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "connection claims our own id",
        ));
    }
    let greeting = encode_hello(&shared.local)?;
    if !shared.open(hello.peer, Direction::Inbound, reader, writer, Some(greeting)) {
        return Err(std::io::Error::from(std::io::ErrorKind::AlreadyExists));
    }
    Ok(())
}

fn encode_hello(local: &PeerId) -> std::io::Result<String> {
    serde_json::to_string(&Hello {
        peer: local.clone(),
    })
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

async fn dial(shared: Arc<Shared>, rendezvous: SocketAddr, remote: PeerId, handshake: Duration) {
    let outcome = tokio::time::timeout(handshake, dial_link(&shared.local, rendezvous, &remote))
        .await
        .unwrap_or(Err(PeerLinkError::Unavailable(remote.clone())));
    shared.table().dialing.remove(&remote);

    match outcome {
        Ok((reader, writer)) => {
            shared.open(remote, Direction::Outbound, reader, writer, None);
        }
        Err(error) => {
            debug!("Link {} -> {} failed: {}", shared.local, remote, error);
            shared.emit(TransportEvent::LinkFailed {
                peer: remote,
                error,
            });
        }
    }
}

async fn dial_link(
    local: &PeerId,
    rendezvous: SocketAddr,
    remote: &PeerId,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf), PeerLinkError> {
    let unavailable = || PeerLinkError::Unavailable(remote.clone());
    let refused = || PeerLinkError::Refused(remote.clone());

    let addr = match rendezvous::lookup(rendezvous, remote).await {
        Ok(Some(addr)) => addr,
        Ok(None) => return Err(unavailable()),
        Err(e) => {
            debug!("Lookup of {} failed: {}", remote, e);
            return Err(unavailable());
        }
    };
    let stream = TcpStream::connect(addr).await.map_err(|e| {
        debug!("Dial {} at {} failed: {}", remote, addr, e);
        unavailable()
    })?;

    let (read, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read);
    let hello = encode_hello(local).map_err(|_| refused())?;
    write_line(&mut writer, &hello).await.map_err(|_| refused())?;
    match read_frame::<_, Hello>(&mut reader).await {
        Ok(Some(answer)) if answer.peer == *remote => Ok((reader, writer)),
        Ok(Some(answer)) => {
            warn!("{} at {} answered as {}", remote, addr, answer.peer);
            Err(refused())
        }
        Ok(None) | Err(_) => Err(refused()),
    }
}

/// Keep `registration` alive, re-registering after the rendezvous drops it.
async fn hold_registration(
    shared: Arc<Shared>,
    rendezvous: SocketAddr,
    mut registration: Registration,
) {
    let advertised = registration.advertised();
    loop {
        registration.closed().await;
        shared.registered.store(false, Ordering::Relaxed);
        warn!("Lost rendezvous registration for {}", shared.local);

        registration = loop {
            tokio::time::sleep(RETRY_DELAY).await;
            match rendezvous::register(rendezvous, &shared.local, advertised).await {
                Ok(Some(registration)) => break registration,
                Ok(None) => {
                    warn!("{} was claimed by someone else", shared.local);
                    return;
                }
                Err(e) => trace!("Rendezvous still unreachable: {}", e),
            }
        };
        shared.registered.store(true, Ordering::Relaxed);
        info!("Registered {} again", shared.local);
    }
}

/// An endpoint on a real network. See the module docs for the wire format.
pub struct TcpTransport {
    config: TcpConfig,
    shared: Option<Arc<Shared>>,
    advertised: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            shared: None,
            advertised: None,
            tasks: Vec::new(),
        }
    }

    /// Address the peer listener is registered under.
    pub fn advertised_addr(&self) -> Option<SocketAddr> {
        self.advertised
    }

    /// Bind and register once. `Ok(None)` means the id is taken.
    async fn open_endpoint(
        config: &TcpConfig,
        local_id: &PeerId,
    ) -> std::io::Result<Option<(TcpListener, Registration)>> {
        let listener = TcpListener::bind(config.bind).await?;
        let listen_addr = listener.local_addr()?;
        Ok(rendezvous::register(config.rendezvous, local_id, listen_addr)
            .await?
            .map(|registration| (listener, registration)))
    }
}

impl Transport for TcpTransport {
    async fn listen(
        &mut self,
        local_id: PeerId,
        timeout: Duration,
    ) -> Result<TransportEvents, ConnectError> {
        if self.shared.is_some() {
            debug!("Re-listening as {}, closing previous endpoint", local_id);
            self.close();
        }

        let config = self.config.clone();
        let attempt = async {
            loop {
                match Self::open_endpoint(&config, &local_id).await {
                    Ok(Some(endpoint)) => return Ok(endpoint),
                    Ok(None) => return Err(ConnectError::IdTaken(local_id.clone())),
                    Err(e) => {
                        debug!("Rendezvous not reachable yet: {}", e);
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        };
        let (listener, registration) = match tokio::time::timeout(timeout, attempt).await {
            Ok(endpoint) => endpoint?,
            Err(_) => {
                warn!("Endpoint {} not ready after {:?}", local_id, timeout);
                return Err(ConnectError::Timeout(timeout));
            }
        };

        let (events, rx) = mpsc::unbounded_channel();
        let _ = events.send(TransportEvent::Ready(local_id.clone()));
        let shared = Arc::new(Shared {
            local: local_id.clone(),
            events,
            table: Mutex::new(LinkTable::default()),
            registered: AtomicBool::new(true),
        });

        info!(
            "Endpoint listening as {} on {}",
            local_id,
            registration.advertised()
        );
        self.advertised = Some(registration.advertised());
        self.tasks.push(tokio::spawn(accept_loop(
            listener,
            Arc::clone(&shared),
            self.config.handshake_timeout,
        )));
        self.tasks.push(tokio::spawn(hold_registration(
            Arc::clone(&shared),
            self.config.rendezvous,
            registration,
        )));
        self.shared = Some(shared);
        Ok(rx)
    }

    fn local_id(&self) -> Option<&PeerId> {
        self.shared.as_ref().map(|s| &s.local)
    }

    fn connect(&mut self, remote_id: &PeerId) {
        let Some(shared) = self.shared.as_ref() else {
            warn!("connect({}) before listen", remote_id);
            return;
        };
        if *remote_id == shared.local {
            shared.emit(TransportEvent::LinkFailed {
                peer: remote_id.clone(),
                error: PeerLinkError::SelfConnection,
            });
            return;
        }
        {
            let mut table = shared.table();
            if table.links.contains_key(remote_id) {
                debug!("Already linked to {}", remote_id);
                return;
            }
            if !table.dialing.insert(remote_id.clone()) {
                debug!("Already dialing {}", remote_id);
                return;
            }
        }
        tokio::spawn(dial(
            Arc::clone(shared),
            self.config.rendezvous,
            remote_id.clone(),
            self.config.handshake_timeout,
        ));
    }

    fn send(&self, peer_id: &PeerId, message: &Message) -> bool {
        let Some(shared) = self.shared.as_ref() else {
            return false;
        };
        if *peer_id == shared.local {
            return false;
        }
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping unencodable {} message: {}", message.kind(), e);
                return false;
            }
        };
        match shared.table().links.get(peer_id) {
            Some(link) => link.frames.send(frame).is_ok(),
            None => {
                trace!("No open link to {}, dropping {}", peer_id, message.kind());
                false
            }
        }
    }

    fn broadcast(&self, message: &Message) -> usize {
        let Some(shared) = self.shared.as_ref() else {
            return 0;
        };
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping unencodable {} message: {}", message.kind(), e);
                return 0;
            }
        };
        let table = shared.table();
        let reached = table
            .links
            .values()
            .filter(|link| link.frames.send(frame.clone()).is_ok())
            .count();
        trace!("Broadcast {} to {} peers", message.kind(), reached);
        reached
    }

    fn disconnect(&mut self, peer_id: &PeerId) {
        let Some(shared) = self.shared.as_ref() else {
            return;
        };
        if shared.table().links.remove(peer_id).is_none() {
            return;
        }
        shared.emit(TransportEvent::PeerDisconnected(peer_id.clone()));
        info!("Disconnected from {}", peer_id);
    }

    fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.advertised = None;
        let Some(shared) = self.shared.take() else {
            return;
        };
        let mut table = shared.table();
        table.closed = true;
        table.links.clear();
        table.dialing.clear();
        info!("Endpoint {} closed", shared.local);
    }

    fn is_open(&self, peer_id: &PeerId) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|s| s.table().links.contains_key(peer_id))
    }

    fn open_peers(&self) -> Vec<PeerId> {
        let Some(shared) = self.shared.as_ref() else {
            return Vec::new();
        };
        let mut peers: Vec<PeerId> = shared.table().links.keys().cloned().collect();
        peers.sort();
        peers
    }

    fn probe(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|s| s.registered.load(Ordering::Relaxed))
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::{Rendezvous, RendezvousHandle};
    use pointmesh_protocol::VoteValue;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn rendezvous() -> RendezvousHandle {
        Rendezvous::bind("127.0.0.1:0").await.unwrap().spawn().unwrap()
    }

    fn config(rendezvous: &RendezvousHandle) -> TcpConfig {
        TcpConfig::new(rendezvous.addr()).with_bind(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    async fn listening(
        rendezvous: &RendezvousHandle,
        id: &str,
    ) -> (TcpTransport, TransportEvents) {
        let mut transport = TcpTransport::new(config(rendezvous));
        let mut events = transport.listen(PeerId::from(id), TIMEOUT).await.unwrap();
        assert_eq!(next(&mut events).await, TransportEvent::Ready(PeerId::from(id)));
        (transport, events)
    }

    async fn next(events: &mut TransportEvents) -> TransportEvent {
        tokio::time::timeout(TIMEOUT, events.recv())
            .await
            .expect("no transport event")
            .expect("event stream closed")
    }

    async fn linked(
        rendezvous: &RendezvousHandle,
    ) -> (TcpTransport, TransportEvents, TcpTransport, TransportEvents) {
        let (mut a, mut a_events) = listening(rendezvous, "a").await;
        let (b, mut b_events) = listening(rendezvous, "b").await;
        a.connect(&PeerId::from("b"));
        assert_eq!(
            next(&mut a_events).await,
            TransportEvent::PeerConnected { peer: PeerId::from("b"), direction: Direction::Outbound }
        );
        assert_eq!(
            next(&mut b_events).await,
            TransportEvent::PeerConnected { peer: PeerId::from("a"), direction: Direction::Inbound }
        );
        (a, a_events, b, b_events)
    }

    #[tokio::test]
    async fn listen_registers_and_rejects_a_taken_id() {
        let rendezvous = rendezvous().await;
        let (transport, _events) = listening(&rendezvous, "host-123456789").await;
        assert_eq!(transport.local_id(), Some(&PeerId::from("host-123456789")));
        assert!(transport.probe());
        assert_eq!(
            rendezvous::lookup(rendezvous.addr(), &PeerId::from("host-123456789"))
                .await
                .unwrap(),
            transport.advertised_addr()
        );

        let mut second = TcpTransport::new(config(&rendezvous));
        let err = second
            .listen(PeerId::from("host-123456789"), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err, ConnectError::IdTaken(PeerId::from("host-123456789")));
    }

    #[tokio::test]
    async fn listen_times_out_without_a_rendezvous() {
        let parked = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let nowhere = parked.local_addr().unwrap();
        drop(parked);

        let mut transport = TcpTransport::new(
            TcpConfig::new(nowhere).with_bind(SocketAddr::from(([127, 0, 0, 1], 0))),
        );
        let wait = Duration::from_millis(600);
        let err = transport.listen(PeerId::from("a"), wait).await.unwrap_err();
        assert_eq!(err, ConnectError::Timeout(wait));
        assert!(transport.local_id().is_none());
    }

    #[tokio::test]
    async fn frames_flow_both_ways_in_order() {
        let rendezvous = rendezvous().await;
        let (a, mut a_events, b, mut b_events) = linked(&rendezvous).await;
        assert!(a.is_open(&PeerId::from("b")));
        assert_eq!(b.open_peers(), vec![PeerId::from("a")]);

        let vote = Message::Vote { vote: VoteValue::Eight };
        assert!(a.send(&PeerId::from("b"), &vote));
        assert_eq!(a.broadcast(&Message::ClearVotes), 1);
        assert_eq!(
            next(&mut b_events).await,
            TransportEvent::Data { peer: PeerId::from("a"), message: vote }
        );
        assert_eq!(
            next(&mut b_events).await,
            TransportEvent::Data { peer: PeerId::from("a"), message: Message::ClearVotes }
        );

        assert!(b.send(&PeerId::from("a"), &Message::RequestPlayerData));
        assert_eq!(
            next(&mut a_events).await,
            TransportEvent::Data { peer: PeerId::from("b"), message: Message::RequestPlayerData }
        );
    }

    #[tokio::test]
    async fn own_id_and_unknown_ids_fail_the_link() {
        let rendezvous = rendezvous().await;
        let (mut a, mut events) = listening(&rendezvous, "a").await;

        assert!(!a.send(&PeerId::from("a"), &Message::ClearVotes));
        a.connect(&PeerId::from("a"));
        assert_eq!(
            next(&mut events).await,
            TransportEvent::LinkFailed { peer: PeerId::from("a"), error: PeerLinkError::SelfConnection }
        );

        a.connect(&PeerId::from("nobody"));
        assert_eq!(
            next(&mut events).await,
            TransportEvent::LinkFailed {
                peer: PeerId::from("nobody"),
                error: PeerLinkError::Unavailable(PeerId::from("nobody")),
            }
        );
        assert!(a.open_peers().is_empty());
    }

    #[tokio::test]
    async fn second_connect_reuses_the_link() {
        let rendezvous = rendezvous().await;
        let (mut a, mut a_events, _b, _b_events) = linked(&rendezvous).await;
        a.connect(&PeerId::from("b"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(a_events.try_recv().is_err());
        assert_eq!(a.open_peers(), vec![PeerId::from("b")]);
    }

    #[tokio::test]
    async fn disconnect_notifies_both_ends() {
        let rendezvous = rendezvous().await;
        let (mut a, mut a_events, b, mut b_events) = linked(&rendezvous).await;

        a.disconnect(&PeerId::from("b"));
        assert_eq!(next(&mut a_events).await, TransportEvent::PeerDisconnected(PeerId::from("b")));
        assert_eq!(next(&mut b_events).await, TransportEvent::PeerDisconnected(PeerId::from("a")));
        assert!(!a.is_open(&PeerId::from("b")));
        assert!(!b.is_open(&PeerId::from("a")));
    }

    #[tokio::test]
    async fn closing_frees_the_id_and_drops_links() {
        let rendezvous = rendezvous().await;
        let (a, _a_events, _b, mut b_events) = linked(&rendezvous).await;

        drop(a);
        assert_eq!(next(&mut b_events).await, TransportEvent::PeerDisconnected(PeerId::from("a")));

        tokio::time::timeout(TIMEOUT, async {
            while rendezvous::lookup(rendezvous.addr(), &PeerId::from("a"))
                .await
                .unwrap()
                .is_some()
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("id was not released");
        let (_again, _events) = listening(&rendezvous, "a").await;
    }

    #[tokio::test]
    async fn liveness_follows_the_rendezvous() {
        let rendezvous = rendezvous().await;
        let (a, _events) = listening(&rendezvous, "a").await;
        assert!(a.probe());

        rendezvous.shutdown();
        tokio::time::timeout(TIMEOUT, async {
            while a.probe() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("endpoint still reports the rendezvous alive");
    }
}
