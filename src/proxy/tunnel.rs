//! Bidirectional byte relay for CONNECT tunnels

use crate::config::ProxyConfig;
use crate::proxy::io::{self, ReadOutcome};
use crate::proxy::server::StopFlag;
use crate::utils::log_tunnel_closed;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelSummary {
    pub to_origin: u64,
    pub to_client: u64,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Upstream,
    Downstream,
}

/// Owns both ends of an established tunnel until either side closes
pub struct Tunnel {
    client: Arc<TcpStream>,
    origin: TcpStream,
    authority: String,
    buffer_size: usize,
    poll_interval: Duration,
    write_timeout: Duration,
    stop: StopFlag,
    early_data: Bytes,
}

impl Tunnel {
    /// `early_data` holds client bytes that arrived behind the CONNECT header
    pub fn new(
        client: Arc<TcpStream>,
        origin: TcpStream,
        authority: String,
        config: &ProxyConfig,
        stop: StopFlag,
        early_data: Bytes,
    ) -> Self {
        Self {
            client,
            origin,
            authority,
            buffer_size: config.tunnel.buffer_size,
            poll_interval: config.tunnel.poll_interval(),
            write_timeout: config.upstream.io_timeout(),
            stop,
            early_data,
        }
    }

    /// Relay until either side closes, a write stalls, or the server stops
    pub async fn run(self) -> TunnelSummary {
        let mut summary = TunnelSummary::default();

        if !self.early_data.is_empty() {
            match io::write_all_timeout(&self.origin, &self.early_data, self.write_timeout).await {
                Ok(()) => summary.to_origin += self.early_data.len() as u64,
                Err(e) => {
                    debug!("Tunnel to {} failed on early data: {}", self.authority, e);
                    return self.finish(summary);
                }
            }
        }

        let mut buf = vec![0u8; self.buffer_size];
        loop {
            if self.stop.is_stopped() {
                debug!("Tunnel to {} interrupted by shutdown", self.authority);
                break;
            }

            let ready = tokio::select! {
                r = self.client.readable() => r.map(|_| Direction::Upstream),
                r = self.origin.readable() => r.map(|_| Direction::Downstream),
                _ = tokio::time::sleep(self.poll_interval) => continue,
            };
            let Ok(direction) = ready else {
                break;
            };

            let (from, to): (&TcpStream, &TcpStream) = match direction {
                Direction::Upstream => (&*self.client, &self.origin),
                Direction::Downstream => (&self.origin, &*self.client),
            };

            let n = match io::try_read_available(from, &mut buf) {
                ReadOutcome::NotReady => continue,
                ReadOutcome::Closed => break,
                ReadOutcome::Data(n) => n,
            };

            if let Err(e) = io::write_all_timeout(to, &buf[..n], self.write_timeout).await {
                debug!("Tunnel to {} write failed: {}", self.authority, e);
                break;
            }

            match direction {
                Direction::Upstream => summary.to_origin += n as u64,
                Direction::Downstream => summary.to_client += n as u64,
            }
        }

        self.finish(summary)
    }

    fn finish(self, summary: TunnelSummary) -> TunnelSummary {
        io::close(&self.client);
        io::close(&self.origin);
        log_tunnel_closed(&self.authority, summary.to_origin, summary.to_client);
        summary
    }
}
