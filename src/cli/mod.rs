//! Command-line interface for running the proxy

pub mod server;

pub use server::*;
