//! Socket operations shared by the worker loop and the tunnel relay.
//!
//! All helpers take `&TcpStream` so that a socket can be driven through an
//! `Arc` while other workers still hold it in a stale readiness snapshot.
//! Acting on a socket that was already shut down surfaces as an ordinary
//! read/write failure, never a panic.

use crate::error::{Error, Result};
use socket2::SockRef;
use std::io::{self, ErrorKind};
use std::net::Shutdown;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Result of one non-blocking read attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    /// Zero-length read, or a read error treated as end of stream
    Closed,
    NotReady,
}

/// Read whatever is available without waiting
pub fn try_read_available(stream: &TcpStream, buf: &mut [u8]) -> ReadOutcome {
    match stream.try_read(buf) {
        Ok(0) => ReadOutcome::Closed,
        Ok(n) => ReadOutcome::Data(n),
        Err(ref e) if e.kind() == ErrorKind::WouldBlock => ReadOutcome::NotReady,
        Err(ref e) if e.kind() == ErrorKind::Interrupted => ReadOutcome::NotReady,
        Err(e) => {
            let err = Error::from(e);
            if err.is_peer_closed() {
                debug!("Read ended by peer: {}", err);
            } else {
                warn!("Read failed, treating as closed: {}", err);
            }
            ReadOutcome::Closed
        }
    }
}

/// Write the whole buffer through a shared stream
pub async fn write_all(stream: &TcpStream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        stream.writable().await?;
        match stream.try_write(buf) {
            Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
            Ok(n) => buf = &buf[n..],
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// `write_all` bounded by a send timeout
pub async fn write_all_timeout(stream: &TcpStream, buf: &[u8], limit: Duration) -> Result<()> {
    timeout(limit, write_all(stream, buf)).await??;
    Ok(())
}

/// Resolve and connect to an origin, bounded by `connect_timeout`
pub async fn connect_origin(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream> {
    let target = format!("{}:{}", host, port);
    let stream = match timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(Error::upstream(target, e)),
        Err(_) => return Err(Error::upstream(target, "connect timed out")),
    };

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on {}: {}", target, e);
    }

    Ok(stream)
}

/// Shut a socket down in both directions. A no-op on an already closed socket.
pub fn close(stream: &TcpStream) {
    if let Err(e) = SockRef::from(stream).shutdown(Shutdown::Both) {
        if e.kind() != ErrorKind::NotConnected {
            debug!("Shutdown failed: {}", e);
        }
    }
}
