//! Server browser: probes game servers directly over their query protocol

use server::config::QueryConfig;
use server::query::{QueryService, ServerAddress};
use server::resolver::DnsResolver;
use server::transport::Transport;
use shared::{GameServerInfo, GameServerStatus, PreferredServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What the browser learned about one listed server
#[derive(Debug, Clone)]
pub struct ServerRow {
    pub server: ServerAddress,
    pub info: Option<GameServerInfo>,
    pub status: Option<GameServerStatus>,
}

pub struct Browser {
    transport: Arc<Transport>,
    query: Arc<QueryService>,
}

impl Browser {
    pub async fn new(bind: SocketAddr) -> server::Result<Self> {
        let transport = Transport::bind(bind).await?;
        let query = QueryService::new(
            Arc::clone(&transport),
            Arc::new(DnsResolver::default()),
            QueryConfig::default(),
        );
        Ok(Self { transport, query })
    }

    /// Info and status of every server, in input order
    pub async fn browse(&self, servers: &[ServerAddress], timeout: Duration) -> Vec<ServerRow> {
        let cancel = CancellationToken::new();
        let (infos, statuses) = tokio::join!(
            self.query
                .probe_all::<GameServerInfo>(servers.to_vec(), timeout, cancel.clone()),
            self.query
                .probe_all::<GameServerStatus>(servers.to_vec(), timeout, cancel.clone()),
        );

        infos
            .into_iter()
            .zip(statuses)
            .map(|(info, status)| ServerRow {
                server: info.server,
                info: info.result,
                status: status.result,
            })
            .collect()
    }

    /// Pings of the servers that answered, as sent when entering matchmaking
    pub async fn measure(
        &self,
        servers: &[ServerAddress],
        timeout: Duration,
    ) -> Vec<PreferredServer> {
        self.query
            .probe_all::<GameServerInfo>(servers.to_vec(), timeout, CancellationToken::new())
            .await
            .into_iter()
            .filter_map(|probe| {
                let info = probe.result?;
                Some(PreferredServer {
                    address: info.address,
                    ping: info.ping,
                })
            })
            .collect()
    }

    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use server::responder::{QueryResponder, ServerSnapshot};

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_browse_reports_every_server() {
        let live = QueryResponder::bind(local(), ServerSnapshot::default().with_players(3, 100))
            .await
            .unwrap();
        let silent = QueryResponder::bind(local(), ServerSnapshot::default())
            .await
            .unwrap();
        silent.set_silent(true);

        let browser = tokio_test::assert_ok!(Browser::new(local()).await);
        let servers = vec![
            ServerAddress::from(live.local_addr()),
            ServerAddress::from(silent.local_addr()),
        ];
        let rows = browser.browse(&servers, Duration::from_millis(500)).await;

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].info.as_ref().map(|i| i.clients), Some(3));
        assert_eq!(rows[0].status.as_ref().map(|s| s.total_score), Some(300));
        assert!(rows[1].info.is_none());
        assert!(rows[1].status.is_none());

        let measured = browser.measure(&servers, Duration::from_millis(500)).await;
        assert_eq!(measured.len(), 1);
        assert_eq!(measured[0].address, live.local_addr());
        browser.shutdown().await;
    }
}
