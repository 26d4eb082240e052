//! Utility functions for the proxy server

pub mod http;
pub mod logging;
pub mod time;

pub use http::*;
pub use logging::*;
pub use time::*;
