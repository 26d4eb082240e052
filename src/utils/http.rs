//! HTTP utility functions operating on raw request/response bytes

use crate::error::{Error, Result};
use crate::models::{ProxyTarget, DEFAULT_HTTP_PORT};

/// End of the header block
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Headers that only concern the proxy hop or the client's own cache
pub const PROXY_ONLY_HEADERS: [&str; 3] = ["proxy-connection", "if-modified-since", "if-none-match"];

/// Default port for CONNECT targets that name none
const DEFAULT_TUNNEL_PORT: u16 = 443;

/// Offset just past the `\r\n\r\n` terminator, if the header block is complete
pub fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// First line of the buffer without its line ending, if it is complete
fn request_line(buffer: &[u8]) -> Option<&str> {
    let end = buffer.iter().position(|&b| b == b'\n')?;
    std::str::from_utf8(&buffer[..end]).ok().map(|line| line.trim_end_matches('\r'))
}

/// Method token of the request line, if one has been received
pub fn request_method(buffer: &[u8]) -> Option<String> {
    request_line(buffer)?.split_whitespace().next().map(str::to_string)
}

/// Header name of a raw header line, without surrounding whitespace
fn header_name(line: &[u8]) -> Option<&[u8]> {
    let colon = line.iter().position(|&b| b == b':')?;
    Some(line[..colon].trim_ascii())
}

fn is_header(line: &[u8], name: &str) -> bool {
    header_name(line).map_or(false, |n| n.eq_ignore_ascii_case(name.as_bytes()))
}

/// Case-insensitive single header lookup. Returns the first match, trimmed.
pub fn extract_header_value(headers: &str, name: &str) -> Option<String> {
    headers
        .split("\r\n")
        .skip(1)
        .take_while(|line| !line.is_empty())
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
}

/// Split a `Host` header value into host and port
fn split_host_port(value: &str) -> Result<(String, u16)> {
    let value = value.trim();
    let (host, port) = if let Some(rest) = value.strip_prefix('[') {
        // Bracketed IPv6 literal
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| Error::MalformedRequest(format!("Invalid host: {}", value)))?;
        (host, after.strip_prefix(':'))
    } else {
        match value.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (value, None),
        }
    };

    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(Error::MalformedRequest(format!("Invalid host: {}", value)));
    }

    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| Error::MalformedRequest(format!("Invalid port in host: {}", value)))?,
        None => DEFAULT_HTTP_PORT,
    };

    Ok((host.to_string(), port))
}

/// Remainder of an absolute-form `http://` or `https://` target after its scheme
fn strip_http_scheme(target: &str) -> Option<&str> {
    ["http://", "https://"].iter().find_map(|scheme| {
        target
            .get(..scheme.len())
            .filter(|prefix| prefix.eq_ignore_ascii_case(scheme))
            .map(|_| &target[scheme.len()..])
    })
}

/// Path of a GET request target. Absolute-form targets have scheme and authority skipped.
fn target_path(target: &str) -> String {
    let Some(after_scheme) = strip_http_scheme(target) else {
        return if target.is_empty() { "/".to_string() } else { target.to_string() };
    };

    match after_scheme.find('/') {
        Some(slash) => after_scheme[slash..].to_string(),
        None => "/".to_string(),
    }
}

/// Parse host, port and path from a buffered GET request.
///
/// Requires a `Host:` header (case-insensitive) and a `GET <path> HTTP/x` request line.
/// The path defaults to `/` and the port to 80.
pub fn parse_request(buffer: &[u8]) -> Result<ProxyTarget> {
    let head_len = find_header_end(buffer).unwrap_or(buffer.len());
    let head = String::from_utf8_lossy(&buffer[..head_len]);

    let host_value = extract_header_value(&head, "host")
        .ok_or_else(|| Error::MalformedRequest("Missing Host header".to_string()))?;
    let (host, port) = split_host_port(&host_value)?;

    let line = head.split("\r\n").next().unwrap_or_default();
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    if !method.eq_ignore_ascii_case("GET") {
        return Err(Error::MalformedRequest(format!("Unsupported request line: {}", line)));
    }

    let (target, version) = match (parts.next(), parts.next()) {
        (Some(target), Some(version)) => (target, version),
        // `GET HTTP/1.1`: no target given
        (Some(version), None) => ("", version),
        _ => return Err(Error::MalformedRequest(format!("Incomplete request line: {}", line))),
    };

    let is_http = version.get(..4).map_or(false, |v| v.eq_ignore_ascii_case("HTTP"));
    let is_path = target.is_empty() || target.starts_with('/') || strip_http_scheme(target).is_some();
    if !is_http || !is_path || parts.next().is_some() {
        return Err(Error::MalformedRequest(format!("Invalid request line: {}", line)));
    }

    Ok(ProxyTarget::new(host, port, target_path(target)))
}

/// Parse host and port from a CONNECT target (`host:port`, port defaults to 443)
pub fn parse_connect_target(target: &str) -> Result<(String, u16)> {
    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) if !host.ends_with(':') || host.starts_with('[') => (host, Some(port)),
        _ => (target, None),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if host.is_empty() {
        return Err(Error::MalformedRequest(format!("Invalid CONNECT target format: {}", target)));
    }

    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| Error::MalformedRequest(format!("Invalid CONNECT port: {}", target)))?,
        None => DEFAULT_TUNNEL_PORT,
    };

    Ok((host.to_string(), port))
}

/// Detect a `CONNECT host:port` request line.
///
/// Returns `None` while the buffer is not (yet) a complete CONNECT line.
pub fn parse_connect_request(buffer: &[u8]) -> Option<Result<(String, u16)>> {
    let line = request_line(buffer)?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.eq_ignore_ascii_case("CONNECT") {
        return None;
    }

    Some(match parts.next() {
        Some(target) => parse_connect_target(target),
        None => Err(Error::MalformedRequest("CONNECT without target".to_string())),
    })
}

/// Copy the request keeping only header lines accepted by `keep`.
/// The request line and everything after the header block are kept as-is.
fn retain_header_lines(request: &[u8], keep: impl Fn(&[u8]) -> bool) -> Vec<u8> {
    let head_len = find_header_end(request).unwrap_or(request.len());
    let (head, body) = request.split_at(head_len);

    let mut out = Vec::with_capacity(request.len());
    for (i, line) in head.split_inclusive(|&b| b == b'\n').enumerate() {
        if i == 0 || keep(line) {
            out.extend_from_slice(line);
        }
    }
    out.extend_from_slice(body);
    out
}

/// Remove `Proxy-Connection`, `If-Modified-Since` and `If-None-Match` header lines
pub fn strip_proxy_headers(request: &[u8]) -> Vec<u8> {
    retain_header_lines(request, |line| {
        !PROXY_ONLY_HEADERS.iter().any(|name| is_header(line, name))
    })
}

/// Replace any `Connection` header with `Connection: close`
pub fn force_connection_close(request: &[u8]) -> Vec<u8> {
    let mut out = retain_header_lines(request, |line| !is_header(line, "connection"));
    if let Some(end) = find_header_end(&out) {
        let at = end - 2;
        out.splice(at..at, b"Connection: close\r\n".iter().copied());
    }
    out
}

/// Whether a response starts with a `200` status line
pub fn is_ok_status_line(response: &[u8]) -> bool {
    let Some(line) = request_line(response) else {
        return false;
    };
    let mut parts = line.split_whitespace();
    matches!(
        (parts.next(), parts.next()),
        (Some(version), Some("200")) if version.starts_with("HTTP/")
    )
}

/// Build a plain-text error response whose body is the reason phrase
pub fn build_error_response(status: u16, reason: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reason}",
        reason.len()
    )
    .into_bytes()
}

/// Reply sent to the client once a CONNECT tunnel reached its origin
pub fn connection_established_response() -> Vec<u8> {
    format!(
        "HTTP/1.1 200 Connection established\r\nProxy-Agent: {}/{}\r\n\r\n",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
    .into_bytes()
}
