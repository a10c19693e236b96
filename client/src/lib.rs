//! # Matchmaking Client Library
//!
//! This library provides the player-side tools for the matchmaking daemon.
//! It can browse game servers directly over their query protocol and take a
//! player through a full matchmaking session: measuring pings, searching,
//! following queue updates and answering join instructions.
//!
//! ## Architecture Overview
//!
//! ### Direct Server Queries
//! The browser reuses the daemon's query service, so the pings a player
//! reports when entering matchmaking are measured exactly the way the daemon
//! measures them. Every listed server produces a row, answered or not.
//!
//! ### Control Session
//! The control client speaks bincode packets over UDP to the daemon. It
//! sends a heartbeat every couple of seconds to keep its session alive and
//! to measure the round trip to the matchmaker.
//!
//! ### Join Handshake
//! A real game client would connect to the server it is told to join and
//! report back. This client stands in for it with a configurable
//! acknowledgment policy, which makes every admission path reachable from
//! the command line.
//!
//! ## Module Organization
//!
//! ### Browser Module (`browser`)
//! - Bulk info and status probes of listed servers
//! - Ping measurement for matchmaking preferences
//!
//! ### Network Module (`network`)
//! - Hello/Welcome handshake with the daemon
//! - Entering and leaving matchmaking
//! - Heartbeats and join acknowledgments
//!
//! ### Display Module (`display`)
//! - Server browser rows with colour codes stripped
//! - Human-readable matchmaking events and hint reasons
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::browser::Browser;
//! use client::network::{AckPolicy, Client};
//! use server::query::ServerAddress;
//! use shared::SearchCriteria;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Measure pings to the servers we would like to play on
//!     let browser = Browser::new("0.0.0.0:0".parse()?).await?;
//!     let servers = vec![ServerAddress::new("127.0.0.1", 28960)];
//!     let preferred = browser.measure(&servers, Duration::from_secs(2)).await;
//!
//!     // Search until we join or get dequeued
//!     let mut client = Client::new("127.0.0.1:27950", 1, "player", AckPolicy::Joined).await?;
//!     let outcome = client.run(SearchCriteria::default(), preferred).await?;
//!     println!("{:?}", outcome);
//!
//!     Ok(())
//! }
//! ```

pub mod browser;
pub mod display;
pub mod network;
