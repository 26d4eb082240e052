use crate::config::LoggingConfig;
use crate::models::TransactionRecord;
use anyhow::Result;
use log::{debug, error, info, trace, warn, LevelFilter};
use std::path::Path;
use std::sync::{Once, OnceLock};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Keeps the non-blocking file writer flushing until process exit
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the global logger from the logging configuration.
/// Only the first call has an effect.
pub fn init_logger_with_config(config: &LoggingConfig, level: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

        let console = fmt::layer()
            .with_target(false)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_level(true)
            .with_ansi(true);

        let file = config.file_path.as_deref().and_then(|path| {
            let path = Path::new(path);
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path.file_name()?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let _ = FILE_GUARD.set(guard);
            Some(fmt::layer().with_writer(writer).with_ansi(false).with_thread_ids(true))
        });

        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(file)
            .try_init();
        if let Err(e) = installed {
            eprintln!("Warning: Failed to install tracing subscriber: {:?}", e);
        }

        // Bridge `log` records into tracing; fails when the subscriber already installed it
        let _ = LogTracer::init();

        log::set_max_level(level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info));
    });
}


/// Log a proxy transaction as JSON (bridged to tracing via tracing-log)
pub fn log_transaction(record: &TransactionRecord) -> Result<()> {
    let log_message = serde_json::to_string(record)?;
    debug!("TRANSACTION {}", log_message);
    Ok(())
}

/// Log an error message
pub fn log_error(message: &str) {
    error!("{}", message);
}

/// Log an info message
pub fn log_info(message: &str) {
    info!("{}", message);
}

/// Log a warning message
pub fn log_warning(message: &str) {
    warn!("{}", message);
}

/// Log a debug message
pub fn log_debug(message: &str) {
    debug!("{}", message);
}

/// Log a trace message
pub fn log_trace(message: &str) {
    trace!("{}", message);
}

/// Convenience macro for logging proxy transactions
#[macro_export]
macro_rules! log_proxy_transaction {
    ($record:expr) => {
        if let Err(e) = $crate::logging::log_transaction($record) {
            $crate::logging::log_warning(&format!("Failed to log transaction: {}", e));
        }
    };
}

/// Convenience macro for logging errors
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_error(&format!($($arg)*));
    };
}

/// Convenience macro for logging info messages
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_info(&format!($($arg)*));
    };
}

/// Convenience macro for logging warning messages
#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::logging::log_warning(&format!($($arg)*));
    };
}

/// Convenience macro for logging debug messages
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::log_debug(&format!($($arg)*));
    };
}

/// Convenience macro for logging trace messages
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::logging::log_trace(&format!($($arg)*));
    };
}
