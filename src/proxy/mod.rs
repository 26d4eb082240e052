//! Proxy engine: connection table, worker loop, tunnels and server lifecycle

pub mod connection;
pub mod io;
pub mod server;
pub mod stats;
pub mod tunnel;
pub(crate) mod worker;

#[cfg(test)]
mod tests;

pub use connection::{Connection, ConnectionState, ConnectionTable, SocketHandle, SocketRole};
pub use server::{ProxyServer, ServerHandle, StopFlag};
pub use stats::{ProxyStats, StatsSnapshot};
pub use tunnel::{Tunnel, TunnelSummary};
