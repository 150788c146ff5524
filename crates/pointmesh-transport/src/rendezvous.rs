//! Name service for [`crate::TcpTransport`].
//!
//! Peers register `peer id -> socket address` and look each other up before
//! dialing. A registration lives as long as the TCP connection that made it,
//! so a crashed or reloaded peer frees its id as soon as its socket closes.
//!
//! One JSON line per request:
//!
//! ```text
//! -> {"type":"register","peer":"host-123456789","addr":"10.0.0.5:40121"}
//! <- {"type":"registered"}            (connection then held open)
//! -> {"type":"lookup","peer":"host-123456789"}
//! <- {"type":"found","addr":"10.0.0.5:40121"}
//! ```

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use pointmesh_protocol::PeerId;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::codec::{read_frame, write_frame};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Request {
    Register { peer: PeerId, addr: SocketAddr },
    Lookup { peer: PeerId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Response {
    Registered,
    Taken,
    Found { addr: SocketAddr },
    NotFound,
}

struct Entry {
    addr: SocketAddr,
    token: u64,
}

#[derive(Clone, Default)]
struct Directory {
    entries: Arc<Mutex<HashMap<PeerId, Entry>>>,
}

impl Directory {
    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claim(&self, peer: &PeerId, addr: SocketAddr, token: u64) -> bool {
        let mut entries = self.lock();
        if entries.contains_key(peer) {
            return false;
        }
        entries.insert(peer.clone(), Entry { addr, token });
        true
    }

    /// Remove `peer` only if it is still held by the registration `token`.
    fn release(&self, peer: &PeerId, token: u64) {
        let mut entries = self.lock();
        if entries.get(peer).is_some_and(|e| e.token == token) {
            entries.remove(peer);
        }
    }

    fn resolve(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.lock().get(peer).map(|e| e.addr)
    }
}

/// The rendezvous server.
pub struct Rendezvous {
    listener: TcpListener,
    directory: Directory,
}

impl Rendezvous {
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            directory: Directory::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the task is dropped or aborted.
    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Rendezvous listening on {}", addr),
            Err(e) => warn!("Rendezvous address unknown: {}", e),
        }

        let mut connections = JoinSet::new();
        let mut next_token = 0u64;
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        next_token += 1;
                        let directory = self.directory.clone();
                        let token = next_token;
                        connections.spawn(async move {
                            if let Err(e) = serve(stream, directory, token).await {
                                debug!("Rendezvous client {} error: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => warn!("Rendezvous accept error: {}", e),
                },
                Some(_) = connections.join_next() => {}
            }
        }
    }

    /// Run on a background task. Dropping the handle stops the server and
    /// releases every registration.
    pub fn spawn(self) -> io::Result<RendezvousHandle> {
        let addr = self.local_addr()?;
        Ok(RendezvousHandle {
            addr,
            task: tokio::spawn(self.run()),
        })
    }
}

pub struct RendezvousHandle {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RendezvousHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for RendezvousHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, directory: Directory, token: u64) -> io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let Some(request) = read_frame::<_, Request>(&mut reader).await? else {
        return Ok(());
    };

    match request {
        Request::Lookup { peer } => {
            let reply = match directory.resolve(&peer) {
                Some(addr) => Response::Found { addr },
                None => Response::NotFound,
            };
            write_frame(&mut write, &reply).await
        }
        Request::Register { peer, addr } => {
            if !directory.claim(&peer, addr, token) {
                debug!("Refusing duplicate registration of {}", peer);
                return write_frame(&mut write, &Response::Taken).await;
            }
            info!("Registered {} at {}", peer, addr);

            let held = async {
                write_frame(&mut write, &Response::Registered).await?;
                let mut sink = String::new();
                while reader.read_line(&mut sink).await? > 0 {
                    sink.clear();
                }
                Ok::<_, io::Error>(())
            }
            .await;

            directory.release(&peer, token);
            info!("Released {}", peer);
            held
        }
    }
}

fn unexpected(reply: Option<Response>) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected rendezvous reply {:?}", reply),
    )
}

/// A live registration. The id stays claimed until this is dropped or the
/// rendezvous goes away.
pub struct Registration {
    reader: BufReader<OwnedReadHalf>,
    _writer: OwnedWriteHalf,
    advertised: SocketAddr,
}

impl Registration {
    /// Address other peers are told to dial.
    pub fn advertised(&self) -> SocketAddr {
        self.advertised
    }

    /// Resolves once the rendezvous connection is gone.
    pub async fn closed(&mut self) {
        let mut sink = String::new();
        loop {
            sink.clear();
            match self.reader.read_line(&mut sink).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }
}

/// Claim `peer` at the rendezvous. `Ok(None)` means the id is taken.
///
/// An unspecified listen address is advertised with the local IP used to
/// reach the rendezvous.
pub async fn register(
    rendezvous: SocketAddr,
    peer: &PeerId,
    listen_addr: SocketAddr,
) -> io::Result<Option<Registration>> {
    let stream = TcpStream::connect(rendezvous).await?;
    let mut advertised = listen_addr;
    if advertised.ip().is_unspecified() {
        advertised.set_ip(stream.local_addr()?.ip());
    }

    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let request = Request::Register {
        peer: peer.clone(),
        addr: advertised,
    };
    write_frame(&mut write, &request).await?;
    match read_frame(&mut reader).await? {
        Some(Response::Registered) => Ok(Some(Registration {
            reader,
            _writer: write,
            advertised,
        })),
        Some(Response::Taken) => Ok(None),
        other => Err(unexpected(other)),
    }
}

/// Resolve `peer` to the address it registered.
pub async fn lookup(rendezvous: SocketAddr, peer: &PeerId) -> io::Result<Option<SocketAddr>> {
    let stream = TcpStream::connect(rendezvous).await?;
    let (read, mut write) = stream.into_split();
    write_frame(&mut write, &Request::Lookup { peer: peer.clone() }).await?;

    let mut reader = BufReader::new(read);
    match read_frame(&mut reader).await? {
        Some(Response::Found { addr }) => Ok(Some(addr)),
        Some(Response::NotFound) => Ok(None),
        other => Err(unexpected(other)),
    }
}
