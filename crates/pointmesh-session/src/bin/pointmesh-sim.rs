//! Pointmesh simulator
//!
//! Runs one bootstrap session plus joiners on an in-process switchboard,
//! lets everyone vote a random card and reports the revealed result.
//!
//! Usage: `pointmesh-sim [players]` (default 4).

use std::time::Duration;

use pointmesh_protocol::{format_average, PlayerProfile, VoteValue};
use pointmesh_session::{Session, SessionConfig, SessionHandle};
use pointmesh_transport::Switchboard;
use rand::seq::SliceRandom;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const NAMES: [&str; 8] = [
    "Ada", "Brian", "Cleo", "Dmitri", "Esme", "Farid", "Greta", "Hiro",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pointmesh=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let players: usize = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 4,
    };
    if players == 0 {
        return Err("need at least one player".into());
    }

    let board = Switchboard::new();
    let config = SessionConfig::from_env();

    let (host, _host_events) = Session::new(board.transport(), config.clone())
        .create(PlayerProfile::new(NAMES[0]))
        .await?;
    tracing::info!("Session {} created", host.session_id());

    let mut handles: Vec<SessionHandle> = vec![host.clone()];
    for i in 1..players {
        let name = match i / NAMES.len() {
            0 => NAMES[i].to_string(),
            round => format!("{} {}", NAMES[i % NAMES.len()], round + 1),
        };
        let (guest, _events) = Session::new(board.transport(), config.clone())
            .join(host.session_id(), PlayerProfile::new(name))
            .await?;
        handles.push(guest);
    }

    let everyone = players;
    host.wait_for(|round| round.players.len() == everyone).await?;
    tracing::info!("Mesh formed: {} players, {} links", players, board.link_count());

    let mut rng = rand::thread_rng();
    for handle in &handles {
        if let Some(card) = VoteValue::DECK.choose(&mut rng) {
            handle.cast_vote(*card)?;
        }
    }

    let round = tokio::time::timeout(
        Duration::from_secs(5),
        host.wait_for(|round| round.revealed),
    )
    .await??;

    for player in &round.players {
        let vote = player.vote.map(|v| v.label()).unwrap_or("-");
        tracing::info!("{:>10}: {}", player.name, vote);
    }
    let consensus = round.consensus();
    tracing::info!(
        class = consensus.class(),
        average = format_average(&round.votes()).as_deref().unwrap_or("n/a"),
        "{}",
        consensus.message()
    );

    for handle in handles {
        handle.leave().await?;
    }
    Ok(())
}
