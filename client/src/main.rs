use clap::{Parser, Subcommand};
use client::browser::Browser;
use client::display;
use client::network::{AckPolicy, Client, Outcome};
use log::info;
use rand::Rng;
use server::query::ServerAddress;
use shared::SearchCriteria;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local address probes are sent from
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Milliseconds to wait for game servers to answer
    #[arg(short, long, default_value = "2000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe game servers and list what they report
    Browse {
        /// Game servers (host:port)
        #[arg(required = true)]
        servers: Vec<String>,
    },

    /// Enter matchmaking and follow the search until joined
    Queue {
        /// Matchmaker address to connect to
        #[arg(short = 'm', long, default_value = "127.0.0.1:27950")]
        matchmaker: String,

        /// Game servers you want to play on (host:port)
        #[arg(required = true)]
        servers: Vec<String>,

        /// Player ID, random when omitted
        #[arg(long)]
        player_id: Option<u64>,

        #[arg(short, long, default_value = "player")]
        name: String,

        /// Players wanted on the server, counting your group
        #[arg(long, default_value = "1")]
        min_players: u32,

        /// Highest acceptable ping, 0 for no limit
        #[arg(long, default_value = "0")]
        max_ping: i32,

        /// Highest acceptable server score, -1 for no limit
        #[arg(long, default_value = "-1", allow_hyphen_values = true)]
        max_score: i64,

        /// Most players already on the server, -1 for no limit
        #[arg(long, default_value = "-1", allow_hyphen_values = true)]
        max_players: i32,

        /// How to answer join instructions
        #[arg(long, value_enum, default_value = "joined")]
        ack: AckPolicy,
    },
}

fn parse_servers(servers: &[String]) -> Result<Vec<ServerAddress>, Box<dyn std::error::Error>> {
    servers
        .iter()
        .map(|s| ServerAddress::parse(s).ok_or_else(|| format!("invalid server `{}`", s).into()))
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let timeout = Duration::from_millis(args.timeout_ms);
    let browser = Browser::new(args.bind).await?;

    match args.command {
        Command::Browse { servers } => {
            let servers = parse_servers(&servers)?;
            let rows = browser.browse(&servers, timeout).await;

            let answered = rows.iter().filter(|row| row.info.is_some()).count();
            for row in &rows {
                match &row.info {
                    Some(info) => println!("{}", display::server_row(info, row.status.as_ref())),
                    None => println!("{:<22} no response", row.server.to_string()),
                }
            }
            println!("{} of {} servers answered", answered, rows.len());
        }

        Command::Queue {
            matchmaker,
            servers,
            player_id,
            name,
            min_players,
            max_ping,
            max_score,
            max_players,
            ack,
        } => {
            let servers = parse_servers(&servers)?;
            let preferred = browser.measure(&servers, timeout).await;
            if preferred.is_empty() {
                return Err("none of the servers answered".into());
            }
            for server in &preferred {
                info!("{} answered in {}ms", server.address, server.ping);
            }

            let player_id = player_id.unwrap_or_else(|| rand::thread_rng().gen());
            let criteria = SearchCriteria {
                min_players,
                max_ping,
                max_score,
                max_players,
            };

            let mut client = Client::new(&matchmaker, player_id, &name, ack).await?;
            match client.run(criteria, preferred).await? {
                Outcome::Joined(server) => println!("Joined {}", server),
                Outcome::Dequeued(reason) => {
                    println!("Dequeued: {}", display::dequeue_reason(reason))
                }
                Outcome::Interrupted => println!("Search interrupted"),
            }
        }
    }

    browser.shutdown().await;
    Ok(())
}
