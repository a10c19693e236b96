use clap::Parser;
use log::info;
use server::config::{MatchmakingConfig, QueueConfig, ServerConfig};
use server::network::Server;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Matchmaking daemon for dedicated game servers", long_about = None)]
struct Args {
    /// Address player clients connect to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Control port player clients connect to
    #[arg(short, long, default_value = "27950")]
    port: u16,

    /// Local address game server probes are sent from
    #[arg(short, long, default_value = "0.0.0.0:0")]
    query_bind: SocketAddr,

    /// Game server to offer (host:port), may be repeated
    #[arg(short, long = "server")]
    servers: Vec<String>,

    /// Seconds between matchmaking passes
    #[arg(short, long, default_value = "3")]
    tick_secs: u64,

    /// Seconds of silence before a player session is dropped
    #[arg(long, default_value = "15")]
    session_timeout: u64,

    /// Maximum connected players
    #[arg(short, long, default_value = "1024")]
    max_sessions: usize,

    /// Join attempts per player before giving up
    #[arg(long, default_value = "3")]
    max_join_attempts: u32,

    /// Seconds a player has to acknowledge one join attempt
    #[arg(long, default_value = "30")]
    join_timeout: u64,

    /// Players one game server's queue may hold
    #[arg(long, default_value = "50")]
    max_queue_len: usize,

    /// Forget game servers whose queue stayed idle
    #[arg(long)]
    prune_idle_servers: bool,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let control_address = format!("{}:{}", self.host, self.port).parse()?;

        Ok(ServerConfig {
            control_address,
            query_address: self.query_bind,
            session_timeout: Duration::from_secs(self.session_timeout),
            max_sessions: self.max_sessions,
            servers: self.servers,
            queue: QueueConfig {
                max_join_attempts: self.max_join_attempts,
                join_timeout: Duration::from_secs(self.join_timeout),
                max_queue_len: self.max_queue_len,
                prune_idle_servers: self.prune_idle_servers,
                ..QueueConfig::default()
            },
            matchmaking: MatchmakingConfig {
                tick_interval: Duration::from_secs(self.tick_secs.max(1)),
                ..MatchmakingConfig::default()
            },
            ..ServerConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = Args::parse().into_config()?;

    info!("Starting matchmaking daemon...");
    info!("Offering {} configured game servers", config.servers.len());

    let mut server = Server::new(config).await?;
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            shutdown.cancel();
        }
    });

    server.run().await?;

    Ok(())
}
