//! Pointmesh Session - one peer's view of a planning-poker round
//!
//! Ties the pieces together inside a single tokio task:
//!
//! - **Transport**: any [`pointmesh_transport::Transport`]. Real peers use
//!   [`pointmesh_transport::TcpTransport`]; tests and the simulator use the
//!   in-process [`pointmesh_transport::Switchboard`].
//! - **Mesh**: [`pointmesh_mesh::MeshCoordinator`] turns the bootstrap star
//!   into a full mesh.
//! - **Game**: [`pointmesh_game::GameState`] replicates votes, reveal and
//!   reactions.
//! - **Recovery**: a [`store::Snapshot`] of the local player's round, saved
//!   after each local change and reapplied by [`Session::resume`].
//!
//! The task also runs a heartbeat. A failed transport probe switches the
//! session offline (local actions keep working, nothing is sent) until a
//! probe succeeds and the roster is resynchronised. A joiner that loses every
//! link, or its link to the bootstrap peer, redials the bootstrap peer with
//! exponential backoff.

mod clock;
pub mod config;
pub mod error;
mod runtime;
pub mod session;
pub mod store;

pub use config::SessionConfig;
pub use error::{Result, RuntimeFault, SessionError, StoreError};
pub use session::{RoundView, Session, SessionEvent, SessionEvents, SessionHandle};
pub use store::{FileStore, MemoryStore, Snapshot, SnapshotStore};
