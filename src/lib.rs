//! Caching Forward Proxy - a multi-worker HTTP forward proxy with a response cache
//!
//! Plain `GET` requests are forwarded to their origin and successful responses
//! are cached for repeat requests; `CONNECT` requests become byte tunnels.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod proxy;
pub mod utils;

// Re-export commonly used items
pub use cache::ResponseCache;
pub use config::settings::ProxyConfig;
pub use error::{Error, Result};
pub use logging::{init_logger_with_config, log_debug, log_error, log_info, log_trace, log_warning};
pub use models::{CachedResponse, Outcome, ProxyTarget, TransactionRecord};
pub use proxy::{ProxyServer, ServerHandle, StopFlag};

/// Runtime construction for the worker pool
pub mod runtime {
    use anyhow::{Context, Result};
    use tokio::runtime::{Builder, Runtime};

    /// Multi-threaded runtime with one OS thread per proxy worker
    pub fn create_runtime(worker_threads: usize) -> Result<Runtime> {
        tracing::info!("🧵 Initializing multi-threaded runtime with {} worker threads", worker_threads);
        Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("proxy-worker")
            .enable_all()
            .build()
            .context("Failed to create multi-threaded runtime")
    }
}
