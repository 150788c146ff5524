//! Sessions over loopback TCP with a rendezvous server.

use std::net::SocketAddr;
use std::time::Duration;

use pointmesh_protocol::{PlayerProfile, SessionId, VoteValue};
use pointmesh_session::{Session, SessionConfig, SessionError, SessionHandle};
use pointmesh_transport::{ConnectError, Rendezvous, RendezvousHandle, TcpConfig, TcpTransport};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

async fn rendezvous() -> RendezvousHandle {
    Rendezvous::bind("127.0.0.1:0")
        .await
        .expect("bind rendezvous")
        .spawn()
        .expect("spawn rendezvous")
}

fn transport(rendezvous: &RendezvousHandle) -> TcpTransport {
    TcpTransport::new(
        TcpConfig::new(rendezvous.addr()).with_bind(SocketAddr::from(([127, 0, 0, 1], 0))),
    )
}

async fn roster_size(handle: &SessionHandle, n: usize) {
    timeout(WAIT, handle.wait_for(|round| round.players.len() == n))
        .await
        .expect("roster did not converge")
        .expect("session closed");
}

#[tokio::test]
async fn three_peers_vote_and_reveal_over_tcp() {
    let rendezvous = rendezvous().await;
    let (alice, _a) = Session::new(transport(&rendezvous), SessionConfig::default())
        .create(PlayerProfile::new("Alice"))
        .await
        .unwrap();
    let sid = alice.session_id().clone();
    let (bob, _b) = Session::new(transport(&rendezvous), SessionConfig::default())
        .join(&sid, PlayerProfile::new("Bob"))
        .await
        .unwrap();
    let (carol, _c) = Session::new(transport(&rendezvous), SessionConfig::default())
        .join(&sid, PlayerProfile::new("Carol"))
        .await
        .unwrap();

    for handle in [&alice, &bob, &carol] {
        roster_size(handle, 3).await;
    }
    // Carol learned Bob from the bootstrap peer's peer list and dialed him.
    timeout(WAIT, carol.wait_for(|round| round.connected.len() == 2))
        .await
        .unwrap()
        .unwrap();

    alice.cast_vote(VoteValue::Five).unwrap();
    bob.cast_vote(VoteValue::Five).unwrap();
    carol.cast_vote(VoteValue::Eight).unwrap();

    for handle in [&alice, &bob, &carol] {
        let round = timeout(WAIT, handle.wait_for(|round| round.revealed))
            .await
            .unwrap()
            .unwrap();
        let mut votes = round.votes();
        votes.sort();
        assert_eq!(votes, vec![VoteValue::Five, VoteValue::Five, VoteValue::Eight]);
    }

    carol.leave().await.unwrap();
    roster_size(&alice, 2).await;
    roster_size(&bob, 2).await;
}

#[tokio::test]
async fn joining_an_unknown_session_fails_over_tcp() {
    let rendezvous = rendezvous().await;
    let sid = SessionId::parse("987654321").unwrap();
    let config = SessionConfig::default().with_listen_timeout(Duration::from_secs(2));
    let result = Session::new(transport(&rendezvous), config)
        .join(&sid, PlayerProfile::new("Bob"))
        .await;

    match result {
        Err(SessionError::Connect(ConnectError::BootstrapUnreachable(peer))) => {
            assert_eq!(peer, sid.bootstrap_peer());
        }
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }
}
