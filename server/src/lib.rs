//! # Matchmaking Server Library
//!
//! This library provides the matchmaking daemon that sits between players and
//! a fleet of dedicated game servers. It probes the game servers over their
//! out-of-band UDP query protocol, groups waiting players into matches and
//! paces each server's joins so it is not flooded with connecting players.
//!
//! ## Core Responsibilities
//!
//! ### Game Server Queries
//! Game servers answer `getinfo` and `getstatus` datagrams prefixed with four
//! `0xFF` bytes. The query layer sends those probes, correlates the replies
//! back to the request that caused them and measures ping on the way:
//! - Single requests with timeout and cancellation
//! - Bulk probes of hundreds of servers, paced to one send per millisecond
//! - Exactly one result per probed server, even when it never answers
//!
//! ### Matchmaking
//! Players enter matchmaking with their criteria (minimum players, maximum
//! ping, score and population) and the servers they measured. Every tick the
//! engine refreshes those servers, ranks them by quality and commits the
//! largest viable groups, best match first. Players who stay unmatched get a
//! list of possible matches and what holds each one back.
//!
//! ### Join Admission
//! Matched players enter the admission queue of their server. The queue
//! hands out join instructions while the server has slots, waits for the
//! player's acknowledgment, retries failed attempts and finally dequeues the
//! player with a reason the client can show.
//!
//! ## Architecture Design
//!
//! ### Single Dispatch Context
//! Each datagram transport owns one receive task and one dispatch task.
//! Handlers registered for a command all run on the dispatch task, one
//! datagram after another, so handler state never sees concurrent callers.
//!
//! ### Event-Driven Control Plane
//! Player clients talk bincode over a separate UDP socket. A receiver task
//! decodes packets, a sender task writes events back, and the main loop owns
//! all session mutation, mirroring admission queue changes into each
//! player's state.
//!
//! ## Module Organization
//!
//! ### Transport (`transport`, `correlator`)
//! Out-of-band datagram framing, the command handler registry and the index
//! of requests waiting for a response.
//!
//! ### Queries (`query`, `resolver`, `responder`)
//! The game server query service, hostname resolution with positive and
//! negative caching, and an in-process game server that answers probes.
//!
//! ### State (`registry`, `server_list`, `sessions`)
//! The cache of known game servers with their latest info and status, the
//! configured server list, and the connected player sessions.
//!
//! ### Matchmaking (`matchmaking`, `admission`, `notify`)
//! Quality scoring, group selection, per-server join queues and the channel
//! events reach players through.
//!
//! ### Daemon (`network`, `config`, `error`)
//! The control-plane server loop, configuration defaults and error types.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         servers: vec!["127.0.0.1:28960".to_string()],
//!         ..ServerConfig::default()
//!     };
//!
//!     // Binds the control socket and the query socket
//!     let mut server = Server::new(config).await?;
//!
//!     // Runs until the shutdown token is cancelled:
//!     // - Accepts players and their matchmaking requests
//!     // - Ticks the matchmaker every few seconds
//!     // - Drives admission queues and pushes events to players
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod config;
pub mod correlator;
pub mod error;
pub mod matchmaking;
pub mod network;
pub mod notify;
pub mod query;
pub mod registry;
pub mod resolver;
pub mod responder;
pub mod server_list;
pub mod sessions;
pub mod transport;

pub use error::{Error, Result};
