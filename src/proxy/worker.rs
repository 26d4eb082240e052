//! Worker loop.
//!
//! Every worker repeats the same iteration against the shared listener,
//! connection table and cache: snapshot the registered sockets, wait until
//! the listener or any of them is readable (bounded by the poll interval),
//! accept, dispatch every ready socket, then release what was closed.

use crate::cache::ResponseCache;
use crate::config::ProxyConfig;
use crate::error::Error;
use crate::models::Outcome;
use crate::proxy::connection::{
    Connection, ConnectionState, ConnectionTable, RegisteredSocket, SocketHandle, SocketRole,
};
use crate::proxy::io::{self, ReadOutcome};
use crate::proxy::server::StopFlag;
use crate::proxy::stats::ProxyStats;
use crate::proxy::tunnel::Tunnel;
use crate::utils::{
    build_error_response, connection_established_response, elapsed_ms, extract_header_value,
    find_header_end, force_connection_close, is_ok_status_line, log_accepted, log_cache_hit,
    log_connect_failure, log_connect_success, log_forwarding, log_request_outcome,
    parse_connect_request, parse_request, request_method, strip_proxy_headers,
};
use bytes::BytesMut;
use futures::stream::{FuturesUnordered, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// State shared by every worker of one server
pub(crate) struct ProxyState {
    pub listener: TcpListener,
    pub table: ConnectionTable,
    pub cache: ResponseCache,
    pub config: ProxyConfig,
    pub stats: ProxyStats,
    pub stop: StopFlag,
    pub tunnels: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyState {
    pub fn new(listener: TcpListener, config: ProxyConfig, stop: StopFlag) -> Self {
        Self {
            listener,
            table: ConnectionTable::new(),
            cache: ResponseCache::from_config(&config.cache),
            config,
            stats: ProxyStats::default(),
            stop,
            tunnels: Mutex::new(Vec::new()),
        }
    }

    fn io_timeout(&self) -> Duration {
        self.config.upstream.io_timeout()
    }
}

enum Wake {
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
    Readable,
    Timeout,
}

/// What one dispatch decided for the connection it serviced
enum Step {
    Keep,
    Close(Outcome),
    /// Handed over to a tunnel task; no longer in the table
    Detached,
}

pub(crate) struct Worker {
    id: usize,
    state: Arc<ProxyState>,
    read_buf: Vec<u8>,
}

impl Worker {
    pub fn new(id: usize, state: Arc<ProxyState>) -> Self {
        let read_buf = vec![0u8; state.config.worker.read_buffer_size];
        Self { id, state, read_buf }
    }

    pub async fn run(mut self) {
        debug!("[worker {}] started", self.id);

        while !self.state.stop.is_stopped() {
            let sockets = self.state.table.get_sockets();

            match self.wait_ready(&sockets).await {
                Wake::Accepted(Ok((stream, addr))) => self.accept(stream, addr),
                Wake::Accepted(Err(e)) => {
                    warn!("[worker {}] accept failed: {}", self.id, e);
                    // back off so a descriptor shortage does not spin the loop
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Wake::Readable | Wake::Timeout => {}
            }

            let mut closing = Vec::new();
            for socket in &sockets {
                self.dispatch(socket.handle, &mut closing).await;
            }
            self.reap_stalled(&mut closing);
            self.release(closing);
        }

        debug!("[worker {}] stopped", self.id);
    }

    async fn wait_ready(&self, sockets: &[RegisteredSocket]) -> Wake {
        let mut readable: FuturesUnordered<_> =
            sockets.iter().map(|socket| socket.stream.readable()).collect();

        tokio::select! {
            accepted = self.state.listener.accept() => Wake::Accepted(accepted),
            Some(_) = readable.next() => Wake::Readable,
            _ = tokio::time::sleep(self.state.config.worker.poll_interval()) => Wake::Timeout,
        }
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("[worker {}] failed to set TCP_NODELAY for {}: {}", self.id, addr, e);
        }
        log_accepted(self.id, &addr);
        self.state.stats.record_accept();
        self.state.table.register(stream, addr);
    }

    async fn dispatch(&mut self, handle: SocketHandle, closing: &mut Vec<(Connection, Outcome)>) {
        // Gone, or serviced by another worker right now
        let Some(mut conn) = self.state.table.checkout(handle) else {
            return;
        };

        let step = match handle.role {
            SocketRole::Client => self.on_client_readable(&mut conn).await,
            SocketRole::Peer => self.on_peer_readable(&mut conn).await,
        };

        match step {
            Step::Keep => {
                self.state.table.checkin(conn);
            }
            Step::Close(outcome) => {
                conn.close();
                closing.push((conn, outcome));
            }
            Step::Detached => {}
        }
    }

    async fn on_client_readable(&mut self, conn: &mut Connection) -> Step {
        let n = match io::try_read_available(&conn.client, &mut self.read_buf) {
            ReadOutcome::NotReady => return Step::Keep,
            ReadOutcome::Closed if conn.peer.is_none() => {
                if conn.buffer.is_empty() {
                    warn!("[worker {}] {} before sending anything: {}", self.id, conn.client_addr, Error::PeerClosed);
                } else {
                    debug!("[worker {}] {} disconnected mid-request", self.id, conn.client_addr);
                }
                return Step::Close(Outcome::ClientClosed);
            }
            ReadOutcome::Closed => {
                // Half-close after the request: keep relaying the response
                conn.client_eof = true;
                return Step::Keep;
            }
            ReadOutcome::Data(n) => n,
        };

        if conn.peer.is_some() {
            // One request per origin connection: later client bytes are never forwarded
            debug!(
                "[worker {}] discarding {} bytes from {} sent after the request",
                self.id, n, conn.client_addr
            );
            return Step::Keep;
        }

        conn.buffer.extend_from_slice(&self.read_buf[..n]);
        if conn.state() == ConnectionState::Accepted {
            conn.advance(ConnectionState::ReadingRequest);
        }
        if conn.method.is_none() {
            conn.method = request_method(&conn.buffer);
        }

        self.on_request_bytes(conn).await
    }

    async fn on_request_bytes(&self, conn: &mut Connection) -> Step {
        let headers_complete = find_header_end(&conn.buffer).is_some();
        if !headers_complete && conn.buffer.len() > self.state.config.worker.max_request_header_bytes {
            let e = Error::MalformedRequest("Request headers too large".to_string());
            return self.reject(conn, &e).await;
        }

        if let Some(connect) = parse_connect_request(&conn.buffer) {
            return match connect {
                Err(e) => self.reject(conn, &e).await,
                // Header lines still in flight must not leak into the tunnel
                Ok(_) if !headers_complete => Step::Keep,
                Ok((host, port)) => self.open_tunnel(conn, host, port).await,
            };
        }

        if !headers_complete {
            return Step::Keep;
        }

        let target = match parse_request(&conn.buffer) {
            Ok(target) => target,
            Err(e) => return self.reject(conn, &e).await,
        };
        let key = target.cache_key();
        conn.target = Some(target.clone());

        let cache_enabled = self.state.config.cache.enabled;
        if cache_enabled {
            if let Some(hit) = self.state.cache.get(&key) {
                self.state.stats.record_cache_hit();
                log_cache_hit(self.id, &key, hit.data.len());
                conn.advance(ConnectionState::CacheHitServed);
                match io::write_all_timeout(&conn.client, &hit.data, self.state.io_timeout()).await {
                    Ok(()) => {
                        conn.bytes_to_client += hit.data.len() as u64;
                        self.state.stats.record_bytes(hit.data.len() as u64);
                    }
                    Err(e) => debug!("[worker {}] cached response not delivered: {}", self.id, e),
                }
                return Step::Close(Outcome::CacheHit);
            }
            self.state.stats.record_cache_miss();
        }

        conn.advance(ConnectionState::Forwarding);
        let upstream = &self.state.config.upstream;
        let peer = match io::connect_origin(&target.host, target.port, upstream.connect_timeout()).await {
            Ok(peer) => peer,
            Err(e) => return self.bad_gateway(conn, &e).await,
        };

        let mut request = strip_proxy_headers(&conn.buffer);
        if upstream.force_connection_close {
            request = force_connection_close(&request);
        }
        if let Err(e) = io::write_all_timeout(&peer, &request, upstream.io_timeout()).await {
            io::close(&peer);
            return self.bad_gateway(conn, &Error::upstream(target.authority(), e)).await;
        }

        log_forwarding(self.id, &target.to_string());
        conn.attach_peer(peer);
        conn.advance(ConnectionState::ReadingResponse);
        conn.buffer.clear();
        conn.cacheable = cache_enabled;
        conn.last_activity = Instant::now();
        Step::Keep
    }

    async fn on_peer_readable(&mut self, conn: &mut Connection) -> Step {
        let Some(peer) = conn.peer.clone() else {
            return Step::Keep;
        };

        let n = match io::try_read_available(&peer, &mut self.read_buf) {
            ReadOutcome::NotReady => return Step::Keep,
            ReadOutcome::Closed => {
                self.finish_response(conn);
                return Step::Close(Outcome::Forwarded);
            }
            ReadOutcome::Data(n) => n,
        };

        let chunk = &self.read_buf[..n];
        if let Err(e) = io::write_all_timeout(&conn.client, chunk, self.state.io_timeout()).await {
            debug!("[worker {}] client {} gone mid-response: {}", self.id, conn.client_addr, e);
            return Step::Close(Outcome::ClientClosed);
        }

        conn.bytes_to_client += n as u64;
        conn.last_activity = Instant::now();
        self.state.stats.record_bytes(n as u64);
        self.retain_for_cache(conn, chunk);
        Step::Keep
    }

    /// Keep a copy of the streamed response while it can still become a cache entry
    fn retain_for_cache(&self, conn: &mut Connection, chunk: &[u8]) {
        if !conn.cacheable {
            return;
        }

        if conn.buffer.len() + chunk.len() > self.state.config.cache.max_entry_bytes {
            debug!("[worker {}] response too large to cache, relaying only", self.id);
            conn.cacheable = false;
            conn.buffer = BytesMut::new();
            return;
        }

        conn.buffer.extend_from_slice(chunk);
        // Once the status line is in, only a 200 is worth retaining
        if conn.buffer.contains(&b'\n') && !is_ok_status_line(&conn.buffer) {
            conn.cacheable = false;
            conn.buffer = BytesMut::new();
        }
    }

    /// End of the origin's response: commit a complete `200` response to the cache
    fn finish_response(&self, conn: &mut Connection) {
        if conn.bytes_to_client == 0 {
            warn!(
                "[worker {}] origin {} sent nothing: {}",
                self.id,
                conn.target.as_ref().map(|t| t.authority()).unwrap_or_default(),
                Error::PeerClosed
            );
        }

        let Some(target) = conn.target.as_ref() else {
            return;
        };
        if !conn.cacheable || !is_ok_status_line(&conn.buffer) {
            return;
        }

        let data = std::mem::take(&mut conn.buffer).freeze();
        let head_len = find_header_end(&data).unwrap_or(data.len());
        let head = String::from_utf8_lossy(&data[..head_len]);
        let etag = extract_header_value(&head, "ETag");
        let last_modified = extract_header_value(&head, "Last-Modified");

        self.state.cache.put(&target.cache_key(), data, etag, last_modified);
        conn.cacheable = false;
    }

    async fn open_tunnel(&self, conn: &mut Connection, host: String, port: u16) -> Step {
        let started = Instant::now();
        let upstream = &self.state.config.upstream;

        let origin = match io::connect_origin(&host, port, upstream.connect_timeout()).await {
            Ok(origin) => origin,
            Err(e) => {
                log_connect_failure(&host, port, elapsed_ms(started), &e.to_string());
                return self.bad_gateway(conn, &e).await;
            }
        };

        let reply = connection_established_response();
        if let Err(e) = io::write_all_timeout(&conn.client, &reply, upstream.io_timeout()).await {
            debug!("[worker {}] client left before tunnel start: {}", self.id, e);
            io::close(&origin);
            return Step::Close(Outcome::ClientClosed);
        }
        log_connect_success(&host, port, elapsed_ms(started));

        conn.advance(ConnectionState::Tunneling);
        let early_data = match find_header_end(&conn.buffer) {
            Some(end) => conn.buffer.split_off(end).freeze(),
            None => Default::default(),
        };

        // The tunnel owns both sockets from here on
        self.state.table.detach(conn.id);
        self.state.stats.record_tunnel();

        let authority = format!("{}:{}", host, port);
        let tunnel = Tunnel::new(
            Arc::clone(&conn.client),
            origin,
            authority.clone(),
            &self.state.config,
            self.state.stop.clone(),
            early_data,
        );

        let state = Arc::clone(&self.state);
        let client_addr = conn.client_addr;
        let accepted_at = conn.accepted_at;
        let handle = tokio::spawn(async move {
            let summary = tunnel.run().await;
            state.stats.record_bytes(summary.to_origin + summary.to_client);
            if state.config.logging.json_transactions {
                log_request_outcome(
                    client_addr,
                    Some("CONNECT".to_string()),
                    Some(authority),
                    Outcome::Tunneled,
                    summary.to_client,
                    accepted_at,
                );
            }
        });

        let mut tunnels = self.state.tunnels.lock().unwrap_or_else(PoisonError::into_inner);
        tunnels.retain(|task| !task.is_finished());
        tunnels.push(handle);

        Step::Detached
    }

    async fn reject(&self, conn: &mut Connection, error: &Error) -> Step {
        info!("[worker {}] 400 for {}: {}", self.id, conn.client_addr, error);
        self.state.stats.record_bad_request();
        self.respond_error(conn, 400, "Bad Request").await;
        Step::Close(Outcome::BadRequest)
    }

    async fn bad_gateway(&self, conn: &mut Connection, error: &Error) -> Step {
        warn!("[worker {}] 502 for {}: {}", self.id, conn.client_addr, error);
        self.state.stats.record_upstream_failure();
        self.respond_error(conn, 502, "Bad Gateway").await;
        Step::Close(Outcome::BadGateway)
    }

    async fn respond_error(&self, conn: &mut Connection, status: u16, reason: &str) {
        let response = build_error_response(status, reason);
        match io::write_all_timeout(&conn.client, &response, self.state.io_timeout()).await {
            Ok(()) => conn.bytes_to_client += response.len() as u64,
            Err(e) => debug!("[worker {}] {} response not delivered: {}", self.id, status, e),
        }
    }

    /// Origins silent past the receive timeout end their response as if they had closed
    fn reap_stalled(&self, closing: &mut Vec<(Connection, Outcome)>) {
        for handle in self.state.table.stalled_responses(self.state.io_timeout()) {
            let Some(mut conn) = self.state.table.checkout(handle) else {
                continue;
            };
            debug!("[worker {}] origin idle past timeout for connection {}", self.id, conn.id);
            self.finish_response(&mut conn);
            conn.close();
            closing.push((conn, Outcome::Forwarded));
        }
    }

    /// Drop connections closed during this iteration from the table
    fn release(&self, closing: Vec<(Connection, Outcome)>) {
        for (conn, outcome) in closing {
            self.state.table.remove(conn.id);
            if self.state.config.logging.json_transactions {
                log_request_outcome(
                    conn.client_addr,
                    conn.method,
                    conn.target.map(|t| t.to_string()),
                    outcome,
                    conn.bytes_to_client,
                    conn.accepted_at,
                );
            }
        }
    }
}
