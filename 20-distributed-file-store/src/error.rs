use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed control message: {0}")]
    Codec(#[from] bincode::Error),
    #[error("key '{0}' not found locally or on any peer")]
    NotFound(String),
    #[error("timed out after {timeout:?} waiting for key '{key}' from peers")]
    FetchTimeout { key: String, timeout: Duration },
    #[error("no connected peer at {0}")]
    PeerNotFound(SocketAddr),
    #[error("file server was already started")]
    AlreadyStarted,
    #[error("stream from {peer} was not drained within {timeout:?}")]
    StreamTimeout { peer: SocketAddr, timeout: Duration },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
