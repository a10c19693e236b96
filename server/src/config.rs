//! Runtime configuration for the query layer, admission queues and matchmaker
//!
//! Every knob has a default matching the behaviour the game community
//! expects; the daemon overrides a subset from the command line.

use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RESOLVE_CONCURRENCY: usize = 40;
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_millis(1);

/// Settings for probing game servers
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// How long a single probe waits for its response once sent
    pub request_timeout: Duration,
    /// Upper bound on parallel endpoint resolutions in a bulk probe
    pub resolve_concurrency: usize,
    /// Minimum gap between two consecutive probe sends
    pub send_interval: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            resolve_concurrency: DEFAULT_RESOLVE_CONCURRENCY,
            send_interval: DEFAULT_SEND_INTERVAL,
        }
    }
}

/// Cache lifetimes for hostname resolution
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub ttl: Duration,
    pub negative_ttl: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            negative_ttl: Duration::from_secs(120),
        }
    }
}

/// Per-server join admission limits
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Background processing for an empty queue stops after this long
    pub idle_timeout: Duration,
    /// Total time a player may spend joining across all attempts
    pub total_join_time: Duration,
    /// Time a player has to acknowledge a single join instruction
    pub join_timeout: Duration,
    /// Reset the attempt counter when a failed join saw the server full
    pub reset_attempts_when_full: bool,
    pub max_join_attempts: u32,
    pub max_queue_len: usize,
    /// How often queue deadlines are checked
    pub process_interval: Duration,
    /// Drop registry entries whose queues went idle
    pub prune_idle_servers: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(180),
            total_join_time: Duration::from_secs(50),
            join_timeout: Duration::from_secs(30),
            reset_attempts_when_full: true,
            max_join_attempts: 3,
            max_queue_len: 50,
            process_interval: Duration::from_secs(1),
            prune_idle_servers: false,
        }
    }
}

/// Matchmaking tick settings
#[derive(Debug, Clone)]
pub struct MatchmakingConfig {
    pub tick_interval: Duration,
    /// Timeout of the info/status refresh performed every tick
    pub probe_timeout: Duration,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// Everything the daemon needs to start
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Control socket player clients talk to
    pub control_address: SocketAddr,
    /// Socket used to probe game servers
    pub query_address: SocketAddr,
    /// Sessions silent for longer than this are dropped
    pub session_timeout: Duration,
    pub max_sessions: usize,
    /// Game servers announced to the registry on startup
    pub servers: Vec<String>,
    pub query: QueryConfig,
    pub resolver: ResolverConfig,
    pub queue: QueueConfig,
    pub matchmaking: MatchmakingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_address: SocketAddr::from(([127, 0, 0, 1], 27950)),
            query_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            session_timeout: Duration::from_secs(15),
            max_sessions: 1024,
            servers: Vec::new(),
            query: QueryConfig::default(),
            resolver: ResolverConfig::default(),
            queue: QueueConfig::default(),
            matchmaking: MatchmakingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(180));
        assert_eq!(config.total_join_time, Duration::from_secs(50));
        assert_eq!(config.join_timeout, Duration::from_secs(30));
        assert!(config.reset_attempts_when_full);
        assert_eq!(config.max_join_attempts, 3);
        assert_eq!(config.max_queue_len, 50);
    }

    #[test]
    fn test_query_defaults() {
        let config = QueryConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.resolve_concurrency, 40);
        assert_eq!(config.send_interval, Duration::from_millis(1));
    }

    #[test]
    fn test_negative_cache_is_short() {
        let config = ResolverConfig::default();
        assert!(config.negative_ttl < config.ttl);
        assert_eq!(config.negative_ttl, Duration::from_secs(120));
    }
}
