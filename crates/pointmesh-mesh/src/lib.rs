//! Pointmesh Mesh - full-mesh formation from a single bootstrap peer
//!
//! New peers connect only to the session's bootstrap identity
//! (`host-{sessionId}`). Whoever accepts a link replies with a `peer_list`,
//! and the newcomer connects to every listed peer it does not yet hold. The
//! result is a complete graph regardless of who created the session.
//!
//! See [`MeshCoordinator`] for the bookkeeping rules.

pub mod coordinator;

pub use coordinator::{LinkState, MeshAction, MeshCoordinator};
