//! Logging utility functions for proxy operations

use crate::models::{Outcome, TransactionRecord};
use crate::utils::time::{elapsed_ms, now};
use crate::{log_debug, log_proxy_transaction};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn};

/// Log a newly accepted client connection
pub fn log_accepted(worker: usize, client: &SocketAddr) {
    log_debug!("[worker {}] 📥 New client connected from {}", worker, client);
}

/// Log a cache hit served without contacting the origin
pub fn log_cache_hit(worker: usize, key: &str, bytes: usize) {
    info!("[worker {}] 🎯 Serving from cache: {} ({} bytes)", worker, key, bytes);
}

/// Log a request forwarded to its origin
pub fn log_forwarding(worker: usize, target: &str) {
    info!("[worker {}] 🔄 Forwarding request to: {}", worker, target);
}

/// Log successful CONNECT tunnel establishment
pub fn log_connect_success(host: &str, port: u16, connect_time: u64) {
    info!("🔐 Tunnel established to {}:{} ({}ms)", host, port, connect_time);
}

/// Log failed CONNECT attempt
pub fn log_connect_failure(host: &str, port: u16, connect_time: u64, error: &str) {
    warn!("❌ CONNECT failed to {}:{} ({}ms): {}", host, port, connect_time, error);
}

/// Log the end of a CONNECT tunnel
pub fn log_tunnel_closed(authority: &str, to_origin: u64, to_client: u64) {
    log_debug!(
        "🔒 Tunnel to {} closed ({} bytes up, {} bytes down)",
        authority,
        to_origin,
        to_client
    );
}

/// Build and log a transaction record at DEBUG level
pub fn log_request_outcome(
    client: SocketAddr,
    method: Option<String>,
    target: Option<String>,
    outcome: Outcome,
    bytes_to_client: u64,
    started: Instant,
) {
    let record = TransactionRecord {
        client,
        method: method.unwrap_or_else(|| "-".to_string()),
        target,
        outcome,
        bytes_to_client,
        cached: outcome == Outcome::CacheHit,
        timestamp: now(),
        duration_ms: elapsed_ms(started),
    };
    log_proxy_transaction!(&record);
}
