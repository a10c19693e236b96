use shared::ProtocolError;
use std::io;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures of the query and control layers
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("could not resolve {host}:{port}")]
    Resolve { host: String, port: u16 },
    #[error("failed to send to {0}")]
    Send(std::net::SocketAddr),
    #[error("request timed out")]
    Timeout,
    #[error("request canceled")]
    Canceled,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("packet encoding failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("transport is shut down")]
    Shutdown,
}
