use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Default port for origin servers when the Host header names none
pub const DEFAULT_HTTP_PORT: u16 = 80;

// Origin resolved from a client request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ProxyTarget {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
        }
    }

    /// Cache key: `host:port:path`, compared as an exact string
    pub fn cache_key(&self) -> String {
        format!("{}:{}:{}", self.host, self.port, self.path)
    }

    /// `host:port` form used for connecting and logging
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.host, self.port, self.path)
    }
}

// A stored origin response
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// Raw response bytes, status line and headers included
    pub data: Bytes,
    pub timestamp: DateTime<Utc>,
    /// Informational only, never used for revalidation
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    CacheHit,
    Forwarded,
    Tunneled,
    BadRequest,
    BadGateway,
    ClientClosed,
}

// Complete request record for transaction logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub client: SocketAddr,
    pub method: String,
    pub target: Option<String>,
    pub outcome: Outcome,
    pub bytes_to_client: u64,
    pub cached: bool,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}
