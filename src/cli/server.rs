//! Server CLI: argument parsing and the interactive run loop

use crate::config::settings::ProxyConfig;
use crate::proxy::server::ProxyServer;
use anyhow::Result;
use clap::Parser;
use std::io::BufRead;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(name = "caching-forward-proxy")]
#[command(about = "A multi-worker HTTP forward proxy with a response cache and CONNECT tunnels")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct ServerArgs {
    /// Number of worker threads (at least 1)
    #[arg(value_name = "WORKERS", value_parser = clap::value_parser!(u32).range(1..))]
    pub workers: u32,

    /// YAML configuration file (defaults to ./config.yml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Proxy listening address
    #[arg(long)]
    pub listen_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl ServerArgs {
    /// Load the configuration and apply CLI arguments on top of it
    pub fn to_config(&self) -> Result<ProxyConfig> {
        let mut config = ProxyConfig::load_config(self.config.as_deref())?;

        config.worker_threads = self.workers as usize;
        if let Some(addr) = self.listen_addr {
            config.listen_addr = addr;
        }
        if self.verbose {
            config.log_level = "debug".to_string();
        } else if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

/// Run the proxy until a line arrives on stdin or Ctrl-C, then shut down gracefully
pub async fn start_server(config: ProxyConfig) -> Result<()> {
    info!("📋 Server Configuration:");
    info!("   Listen address: {}", config.listen_addr);
    info!("   Workers: {}", config.worker_threads);
    info!(
        "   Cache: {} (ttl {}s, {} entries)",
        if config.cache.enabled { "enabled" } else { "disabled" },
        config.cache.ttl_secs,
        config.cache.max_entries
    );
    info!("   Upstream timeouts: connect {}s, io {}s", config.upstream.connect_timeout_secs, config.upstream.io_timeout_secs);

    let server = ProxyServer::bind(config)?;
    let handle = server.spawn();
    info!("Press Enter to stop the proxy");

    let mut stdin_line = wait_for_stdin_line();
    tokio::select! {
        Ok(()) = &mut stdin_line => info!("Stop requested from stdin"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl-C"),
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        },
    }

    handle.shutdown().await;
    Ok(())
}

/// Resolves once a line is read from stdin. Never resolves `Ok` on EOF or a read error.
fn wait_for_stdin_line() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    let spawned = std::thread::Builder::new()
        .name("stdin-watch".to_string())
        .spawn(move || {
            let mut line = String::new();
            match std::io::stdin().lock().read_line(&mut line) {
                Ok(n) if n > 0 => {
                    let _ = tx.send(());
                }
                Ok(_) => debug!("stdin closed; use Ctrl-C to stop"),
                Err(e) => debug!("stdin unreadable ({}); use Ctrl-C to stop", e),
            }
        });
    if let Err(e) = spawned {
        warn!("Failed to watch stdin: {}", e);
    }
    rx
}
