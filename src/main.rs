//! Main entry point for the Caching Forward Proxy

use caching_forward_proxy::{
    cli::{start_server, ServerArgs},
    init_logger_with_config, log_error, log_info,
    runtime::create_runtime,
};
use clap::Parser;

fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();

    let config = match args.to_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    init_logger_with_config(&config.logging, &config.log_level);
    log_info!("🚀 Starting Caching Forward Proxy");
    log_info!("📋 Version: {}", env!("CARGO_PKG_VERSION"));

    let runtime = create_runtime(config.worker_threads)?;
    if let Err(e) = runtime.block_on(start_server(config)) {
        log_error!("Server error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
