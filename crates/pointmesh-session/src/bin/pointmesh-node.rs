//! Pointmesh node
//!
//! Runs one peer over TCP, or the rendezvous server peers meet through.
//!
//! Usage:
//!   pointmesh-node rendezvous [listen-addr]              (default 0.0.0.0:7400)
//!   pointmesh-node create <rendezvous-addr> <name>
//!   pointmesh-node join <rendezvous-addr> <session-id> <name>
//!
//! A peer reads commands from stdin: `vote <card>`, `show`, `clear`,
//! `react <emoji>`, `unreact`, `players`, `quit`.

use std::net::SocketAddr;

use pointmesh_protocol::{format_average, PlayerProfile, SessionId};
use pointmesh_session::{
    RoundView, Session, SessionConfig, SessionEvent, SessionEvents, SessionHandle,
};
use pointmesh_transport::{Rendezvous, TcpConfig, TcpTransport};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: pointmesh-node rendezvous [addr] | create <rendezvous> <name> | join <rendezvous> <session-id> <name>";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pointmesh=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let config = SessionConfig::from_env();

    let (handle, events) = match args.as_slice() {
        ["rendezvous"] => return serve("0.0.0.0:7400").await,
        ["rendezvous", addr] => return serve(addr).await,
        ["create", rendezvous, name] => {
            Session::new(transport(rendezvous)?, config)
                .create(PlayerProfile::new(*name))
                .await?
        }
        ["join", rendezvous, session, name] => {
            let session = SessionId::parse(session)?;
            Session::new(transport(rendezvous)?, config)
                .join(&session, PlayerProfile::new(*name))
                .await?
        }
        _ => return Err(USAGE.into()),
    };

    tracing::info!(
        "In session {} as {}. Commands: vote <card>, show, clear, react <emoji>, unreact, players, quit",
        handle.session_id(),
        handle.local_id()
    );
    tokio::spawn(report(events, handle.clone()));
    commands(handle).await
}

fn transport(rendezvous: &str) -> Result<TcpTransport, Box<dyn std::error::Error>> {
    let addr: SocketAddr = rendezvous.parse()?;
    Ok(TcpTransport::new(TcpConfig::new(addr)))
}

async fn serve(addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let rendezvous = Rendezvous::bind(addr).await?;
    rendezvous.run().await;
    Ok(())
}

async fn commands(handle: SessionHandle) -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        let outcome = match (words.next(), words.next()) {
            (Some("vote"), Some(card)) => match card.parse() {
                Ok(vote) => handle.cast_vote(vote),
                Err(e) => {
                    tracing::warn!("{}", e);
                    continue;
                }
            },
            (Some("react"), Some(emoji)) => match emoji.parse() {
                Ok(reaction) => handle.set_reaction(reaction),
                Err(e) => {
                    tracing::warn!("{}", e);
                    continue;
                }
            },
            (Some("show"), None) => handle.show_votes(),
            (Some("clear"), None) => handle.clear_votes(),
            (Some("unreact"), None) => handle.clear_reaction(),
            (Some("players"), None) => {
                print_round(&handle.round());
                Ok(())
            }
            (Some("quit"), None) => break,
            (None, _) => continue,
            _ => {
                tracing::warn!("Unknown command: {}", line.trim());
                continue;
            }
        };
        outcome?;
    }
    handle.leave().await?;
    Ok(())
}

async fn report(mut events: SessionEvents, handle: SessionHandle) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::PlayersUpdated(players) => {
                tracing::info!("{} players in the round", players.len());
            }
            SessionEvent::VotingComplete => print_round(&handle.round()),
            SessionEvent::ReactionExpired => tracing::info!("Your reaction expired"),
            SessionEvent::Connectivity { online } => tracing::info!(online, "Connectivity changed"),
            SessionEvent::Fault(fault) => tracing::warn!("{}", fault),
        }
    }
}

fn print_round(round: &RoundView) {
    for player in &round.players {
        let vote = match (round.revealed || player.is_local, player.vote) {
            (true, Some(vote)) => vote.label(),
            (false, Some(_)) => "voted",
            (_, None) => "-",
        };
        let reaction = player.reaction.map(|r| r.emoji()).unwrap_or("");
        tracing::info!("{:>12}: {} {}", player.name, vote, reaction);
    }
    if round.revealed {
        let consensus = round.consensus();
        tracing::info!(
            class = consensus.class(),
            average = format_average(&round.votes()).as_deref().unwrap_or("n/a"),
            "{}",
            consensus.message()
        );
    }
}
