//! A stand-in dedicated server that answers `getinfo` and `getstatus`, for
//! trying the daemon and the client without a real game server

use clap::Parser;
use log::info;
use rand::Rng;
use server::responder::{QueryResponder, ServerSnapshot};
use shared::PlayerScore;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to answer probes on
    #[arg(short, long, default_value = "127.0.0.1:28960")]
    bind: SocketAddr,

    /// Hostname reported to probes (colour codes allowed)
    #[arg(short = 'n', long, default_value = "^2Fake ^7Server")]
    hostname: String,

    #[arg(short, long, default_value = "mp_crash")]
    map: String,

    /// Human players on the server
    #[arg(short, long, default_value = "0")]
    players: usize,

    #[arg(long, default_value = "0")]
    bots: u32,

    #[arg(long, default_value = "18")]
    max_clients: u32,

    /// Seconds between random score changes, 0 to keep scores fixed
    #[arg(long, default_value = "0")]
    churn_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let snapshot = ServerSnapshot {
        hostname: args.hostname.clone(),
        map: args.map.clone(),
        max_clients: args.max_clients,
        bots: args.bots,
        ..ServerSnapshot::default()
    }
    .with_players(args.players, 0);

    let responder = QueryResponder::bind(args.bind, snapshot).await?;
    info!(
        "Fake game server `{}` answering on {}",
        args.hostname,
        responder.local_addr()
    );

    if args.churn_secs > 0 {
        let mut interval = tokio::time::interval(Duration::from_secs(args.churn_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => churn(&responder),
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    info!("Answered {} probes", responder.probes_received());
    responder.shutdown().await;
    Ok(())
}

/// Moves every player's score and ping a little, like a running match
fn churn(responder: &QueryResponder) {
    let mut rng = rand::thread_rng();
    let mut snapshot = responder.snapshot();
    snapshot.players = snapshot
        .players
        .into_iter()
        .map(|player| PlayerScore {
            score: (player.score + rng.gen_range(-5..=25)).max(0),
            ping: rng.gen_range(20..=120),
            name: player.name,
        })
        .collect();
    responder.set_snapshot(snapshot);
}
