//! Proxy server lifecycle: listener setup, worker pool, orderly shutdown

use crate::cache::ResponseCache;
use crate::config::ProxyConfig;
use crate::proxy::stats::StatsSnapshot;
use crate::proxy::worker::{ProxyState, Worker};
use anyhow::{Context, Result};
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Largest backlog we ask for; the kernel clamps it to its own maximum
const MAX_BACKLOG: i32 = i32::MAX;

/// Cooperative stop signal observed by workers and tunnels between iterations
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Create the listening socket with SO_REUSEADDR set
fn create_listener_socket(addr: SocketAddr) -> Result<Socket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(MAX_BACKLOG)?;

    Ok(socket)
}

/// A bound, not yet running proxy
pub struct ProxyServer {
    listener: TcpListener,
    config: ProxyConfig,
}

impl ProxyServer {
    /// Bind the configured listen address. Must run inside a Tokio runtime.
    pub fn bind(config: ProxyConfig) -> Result<Self> {
        let socket = create_listener_socket(config.listen_addr)
            .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
        let listener = TcpListener::from_std(socket.into())
            .context("Failed to register listener with the runtime")?;

        info!("🌐 Proxy listening on {}", listener.local_addr()?);
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start `worker_threads` workers sharing the listener, cache and connection table
    pub fn spawn(self) -> ServerHandle {
        let workers = self.config.worker_threads.max(1);
        let stop = StopFlag::new();
        let state = Arc::new(ProxyState::new(self.listener, self.config, stop.clone()));

        info!("🚀 Starting {} workers ({})", workers, state.cache.cache_info());
        let handles = (0..workers)
            .map(|id| tokio::spawn(Worker::new(id, Arc::clone(&state)).run()))
            .collect();

        ServerHandle { state, stop, workers: handles }
    }
}

/// Running proxy. Dropping it without `shutdown` leaves the workers running.
pub struct ServerHandle {
    state: Arc<ProxyState>,
    stop: StopFlag,
    workers: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.state.listener.local_addr()
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.state.cache
    }

    /// Connections currently registered with the workers
    pub fn open_connections(&self) -> usize {
        self.state.table.len()
    }

    /// Stop the workers, wait for every worker and tunnel, then close what is left
    pub async fn shutdown(self) -> StatsSnapshot {
        info!("🛑 Shutting down proxy");
        self.stop.stop();

        for (id, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                error!("Worker {} ended abnormally: {}", id, e);
            }
        }

        let tunnels = std::mem::take(
            &mut *self.state.tunnels.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for tunnel in tunnels {
            if let Err(e) = tunnel.await {
                error!("Tunnel task ended abnormally: {}", e);
            }
        }

        let closed = self.state.table.close_all();
        let stats = self.state.stats.snapshot();
        info!("✅ Proxy stopped ({} connections closed)", closed);
        match serde_json::to_string(&stats) {
            Ok(json) => info!("📊 Final stats: {}", json),
            Err(e) => error!("Failed to serialize stats: {}", e),
        }
        stats
    }
}
