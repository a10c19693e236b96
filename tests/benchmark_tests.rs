//! Performance benchmarks for critical matchmaking paths

use assert_approx_eq::assert_approx_eq;
use server::matchmaking::{best_prefix, evaluate, server_quality, MMPlayer, ServerView};
use shared::{CommandMessage, GameServerInfo, GameServerStatus, PreferredServer, SearchCriteria};
use std::net::SocketAddr;
use std::time::Instant;

fn addr(index: usize) -> SocketAddr {
    SocketAddr::from(([10, 0, (index / 250) as u8, (index % 250) as u8 + 1], 28960))
}

/// Benchmarks the prefix search over a large sorted threshold list
#[test]
fn benchmark_best_prefix() {
    let thresholds: Vec<u32> = (0..64).map(|i| i / 4).collect();

    let iterations = 100_000;
    let start = Instant::now();

    for i in 0..iterations {
        let _ = best_prefix(&thresholds, (i % 8) as u32, 18);
    }

    let duration = start.elapsed();
    println!(
        "Best prefix: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 500ms for 100k iterations
    assert!(duration.as_millis() < 500);
}

/// Benchmarks the base quality function
#[test]
fn benchmark_server_quality() {
    let iterations = 1_000_000;
    let start = Instant::now();

    let mut total = 0.0;
    for i in 0..iterations {
        total += server_quality((i % 18) as u32, Some((i % 5000) as i64));
    }

    let duration = start.elapsed();
    println!(
        "Server quality: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(total > 0.0);
    assert_approx_eq!(server_quality(0, None), 5000.0);
    assert!(duration.as_millis() < 500);
}

/// Stress test of a full selection pass with a busy pool
#[test]
fn stress_test_evaluate() {
    let now = Instant::now();
    let servers: Vec<ServerView> = (0..50)
        .map(|i| ServerView {
            address: addr(i),
            hostname: format!("server {}", i),
            real_players: (i % 12) as u32,
            free_slots: 18 - (i % 12) as u32,
            reserved_slots: 0,
            total_score: Some((i * 150) as i64),
        })
        .collect();

    let players: Vec<MMPlayer> = (0..500)
        .map(|id| {
            let preferred: Vec<PreferredServer> = (0..10)
                .map(|k| PreferredServer {
                    address: addr((id + k * 5) % 50),
                    ping: ((id * 7 + k * 13) % 200) as u32,
                })
                .collect();
            let mut player = MMPlayer::new(
                id as u64,
                SearchCriteria {
                    min_players: (id % 6) as u32,
                    max_ping: 150,
                    ..SearchCriteria::default()
                },
                &preferred,
                now,
            );
            player.attempts = (id % 3) as u32;
            player
        })
        .collect();

    let start = Instant::now();
    let evaluation = evaluate(&players, servers, now);
    let duration = start.elapsed();

    let matched: usize = evaluation.matches.iter().map(|m| m.players.len()).sum();
    println!(
        "Evaluate: 500 players on 50 servers in {:?}, {} matches, {} players matched",
        duration,
        evaluation.matches.len(),
        matched
    );

    assert!(matched <= players.len());
    // Generous bound for debug builds
    assert!(duration.as_secs() < 5);
}

/// Benchmarks out-of-band framing of probe commands
#[test]
fn benchmark_command_framing() {
    let message = CommandMessage::new("getstatus", "", ' ').unwrap();

    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let datagram = message.encode();
        let decoded = CommandMessage::decode(&datagram).unwrap();
        assert_eq!(decoded.command(), "getstatus");
    }

    let duration = start.elapsed();
    println!(
        "Command framing: {} round trips in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 1000);
}

/// Benchmarks parsing of info and full status responses
#[test]
fn benchmark_response_parsing() {
    let endpoint = addr(0);
    let info_body = "\\hostname\\^1Bench ^7Server\\mapname\\mp_crash\\gametype\\war\\clients\\16\\bots\\2\\sv_maxclients\\18\\pswrd\\0\\dedicated\\1\\sv_running\\1";
    let mut status_body = "\\sv_hostname\\Bench\\mapname\\mp_crash\\g_gametype\\war\n".to_string();
    for i in 0..16 {
        status_body.push_str(&format!("{} {} \"^{}player{}\"\n", i * 10, 40 + i, i % 8, i));
    }

    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let info = GameServerInfo::parse(endpoint, info_body, 40).unwrap();
        let status = GameServerStatus::parse(endpoint, &status_body);
        assert_eq!(info.real_players(), 14);
        assert_eq!(status.players.len(), 16);
    }

    let duration = start.elapsed();
    println!(
        "Response parsing: {} info+status pairs in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds for 1k pairs
    assert!(duration.as_secs() < 2);
}
