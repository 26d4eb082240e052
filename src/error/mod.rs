//! Error handling module for the proxy server

use thiserror::Error;
use tokio::time::error::Elapsed;

/// Custom error type for the proxy server
#[derive(Error, Debug)]
pub enum Error {
    /// Client input that could not be parsed into a proxyable request.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// DNS, connect or send failure towards the origin.
    #[error("Upstream {target} unreachable: {reason}")]
    UpstreamUnreachable { target: String, reason: String },

    /// Zero-length read: the peer finished its side of the stream.
    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout error: {0}")]
    Timeout(#[from] Elapsed),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn upstream(target: impl Into<String>, reason: impl ToString) -> Self {
        Error::UpstreamUnreachable {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error is the ordinary end of a stream rather than a failure.
    pub fn is_peer_closed(&self) -> bool {
        match self {
            Error::PeerClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result type for the proxy server
pub type Result<T> = std::result::Result<T, Error>;

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Config(err.to_string())
    }
}
