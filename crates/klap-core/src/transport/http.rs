//! HTTP exchange for KLAP devices.
//!
//! # Note on HTTP Implementation
//!
//! This implementation uses raw TCP sockets instead of HTTP client libraries because
//! TP-Link devices have a non-compliant HTTP server that rejects requests with lowercase
//! headers. Modern HTTP libraries (reqwest, hyper, ureq) forcibly lowercase all headers
//! following HTTP/2 conventions, but TP-Link devices only support HTTP/1.1 with
//! title-case headers (e.g., "Content-Type" not "content-type").
//!
//! Each request opens a new connection. The `TP_SESSIONID` cookie handed out by
//! the device is replayed on later requests until [`Exchange::reset_session`]
//! drops it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::{
    error::Error,
    transport::{ClientConfig, Exchange},
};

/// Session cookie name used by KLAP.
const SESSION_COOKIE_NAME: &str = "TP_SESSIONID";

/// Path prefix of every KLAP endpoint.
const APP_PATH: &str = "/app";

/// Raw HTTP/1.1 [`Exchange`] with a per-session cookie.
pub struct HttpExchange {
    host: String,
    port: u16,
    timeout: Duration,
    session_cookie: Option<String>,
}

/// Status, body and session cookie of one HTTP response.
struct HttpResponse {
    status: u16,
    body: Vec<u8>,
    session_cookie: Option<String>,
}

impl HttpExchange {
    /// Creates an exchange for `host:port`.
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            session_cookie: None,
        }
    }

    /// Creates an exchange from a client configuration.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.host.clone(), config.port, config.timeout)
    }

    /// Returns the device host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the device port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns `true` if a session cookie is held.
    pub fn has_session_cookie(&self) -> bool {
        self.session_cookie.is_some()
    }

    /// Sends a raw HTTP POST request and returns the response.
    async fn http_post(&self, path: &str, body: &[u8]) -> Result<HttpResponse, Error> {
        // Build the HTTP request with title-case headers
        let mut request = format!(
            "POST {} HTTP/1.1\r\n\
             Host: {}:{}\r\n\
             Content-Type: application/octet-stream\r\n\
             Content-Length: {}\r\n\
             Accept: */*\r\n\
             Connection: close\r\n",
            path,
            self.host,
            self.port,
            body.len()
        );

        if let Some(cookie_value) = &self.session_cookie {
            request.push_str(&format!(
                "Cookie: {}={}\r\n",
                SESSION_COOKIE_NAME, cookie_value
            ));
        }

        request.push_str("\r\n");

        let addr = format!("{}:{}", self.host, self.port);
        let mut stream = timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout("Connection timed out".into()))?
            .map_err(|e| Error::ConnectionFailed(format!("Connection failed: {}", e)))?;

        let mut full_request = request.into_bytes();
        full_request.extend_from_slice(body);

        timeout(self.timeout, stream.write_all(&full_request))
            .await
            .map_err(|_| Error::Timeout("Write timed out".into()))?
            .map_err(|e| Error::ConnectionFailed(format!("Write failed: {}", e)))?;

        let mut response = Vec::with_capacity(1024);
        let mut buf = [0u8; 4096];

        let header_end = loop {
            if let Some(end) = find_header_end(&response) {
                break end;
            }
            let n = read_chunk(&mut stream, &mut buf, self.timeout).await?;
            if n == 0 {
                return Err(Error::Protocol(
                    "Invalid HTTP response: connection closed before end of headers".into(),
                ));
            }
            response.extend_from_slice(&buf[..n]);
        };

        let headers = String::from_utf8_lossy(&response[..header_end]).into_owned();
        let body_start = header_end + 4; // After \r\n\r\n
        let content_length = parse_content_length(&headers);

        match content_length {
            Some(expected_len) => {
                while response.len() - body_start < expected_len {
                    let n = read_chunk(&mut stream, &mut buf, self.timeout).await?;
                    if n == 0 {
                        return Err(Error::Protocol(format!(
                            "Response body truncated: {} of {} bytes",
                            response.len() - body_start,
                            expected_len
                        )));
                    }
                    response.extend_from_slice(&buf[..n]);
                }
            }
            None => loop {
                let n = read_chunk(&mut stream, &mut buf, self.timeout).await?;
                if n == 0 {
                    break;
                }
                response.extend_from_slice(&buf[..n]);
            },
        }

        let mut body = response.split_off(body_start);
        if let Some(expected_len) = content_length {
            body.truncate(expected_len);
        }

        let status = parse_status_code(&headers)
            .ok_or_else(|| Error::Protocol("Invalid HTTP response: no status code".into()))?;

        Ok(HttpResponse {
            status,
            body,
            session_cookie: parse_session_cookie(&headers),
        })
    }
}

#[async_trait]
impl Exchange for HttpExchange {
    async fn post(&mut self, endpoint: &str, body: &[u8]) -> Result<Vec<u8>, Error> {
        let path = format!("{}/{}", APP_PATH, endpoint);
        debug!(
            host = %self.host,
            port = self.port,
            path = %path,
            bytes = body.len(),
            "POST"
        );

        let response = self.http_post(&path, body).await?;

        if let Some(cookie) = response.session_cookie {
            self.session_cookie = Some(cookie);
        }

        if response.status >= 400 {
            debug!(
                status = response.status,
                body = %String::from_utf8_lossy(&response.body),
                "request rejected"
            );
            return Err(Error::HttpStatus(response.status));
        }

        debug!(
            status = response.status,
            bytes = response.body.len(),
            "received response"
        );
        Ok(response.body)
    }

    fn reset_session(&mut self) {
        self.session_cookie = None;
    }
}

// Implement Debug manually to avoid exposing the session cookie
impl std::fmt::Debug for HttpExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpExchange")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("session_cookie", &"[REDACTED]")
            .finish()
    }
}

async fn read_chunk(
    stream: &mut TcpStream,
    buf: &mut [u8],
    io_timeout: Duration,
) -> Result<usize, Error> {
    timeout(io_timeout, stream.read(buf))
        .await
        .map_err(|_| Error::Timeout("Read timed out".into()))?
        .map_err(|e| Error::ConnectionFailed(format!("Read failed: {}", e)))
}

/// Find the position of "\r\n\r\n" in the response (end of headers).
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse the HTTP status code from the response headers.
fn parse_status_code(headers: &str) -> Option<u16> {
    // First line should be "HTTP/1.1 200 OK" or similar
    let first_line = headers.lines().next()?;
    first_line.split_whitespace().nth(1)?.parse().ok()
}

/// Parse the Content-Length header value.
fn parse_content_length(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Parse the session cookie from Set-Cookie header.
fn parse_session_cookie(headers: &str) -> Option<String> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("set-cookie") {
            return None;
        }
        // "TP_SESSIONID=value;TIMEOUT=86400" format
        let (cookie_name, cookie_value) = value.trim().split(';').next()?.split_once('=')?;
        (cookie_name == SESSION_COOKIE_NAME).then(|| cookie_value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;

    /// Serves one canned response per connection and returns the raw requests.
    async fn stub_device(responses: Vec<Vec<u8>>) -> (u16, JoinHandle<Vec<Vec<u8>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for response in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    let n = stream.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                    if let Some(end) = find_header_end(&request) {
                        let headers = String::from_utf8_lossy(&request[..end]).into_owned();
                        let len = parse_content_length(&headers).unwrap_or(0);
                        if request.len() >= end + 4 + len {
                            break;
                        }
                    }
                }
                stream.write_all(&response).await.unwrap();
                stream.shutdown().await.unwrap();
                requests.push(request);
            }
            requests
        });

        (port, handle)
    }

    fn response(status_line: &str, extra_headers: &str, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}\r\n",
            status_line,
            body.len(),
            extra_headers
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\n\r\nbody"), Some(15));
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\n"), None);
    }

    #[test]
    fn test_parse_status_code() {
        assert_eq!(parse_status_code("HTTP/1.1 200 OK\r\nServer: x"), Some(200));
        assert_eq!(parse_status_code("HTTP/1.1 403 Forbidden"), Some(403));
        assert_eq!(parse_status_code("garbage"), None);
        assert_eq!(parse_status_code(""), None);
    }

    #[test]
    fn test_parse_content_length() {
        let headers = "HTTP/1.1 200 OK\r\ncontent-length: 48\r\nServer: x";
        assert_eq!(parse_content_length(headers), Some(48));
        assert_eq!(parse_content_length("HTTP/1.1 200 OK"), None);
    }

    #[test]
    fn test_parse_session_cookie() {
        let headers = "HTTP/1.1 200 OK\r\nSet-Cookie: TP_SESSIONID=ABC123;TIMEOUT=86400";
        assert_eq!(parse_session_cookie(headers), Some("ABC123".to_string()));

        let other = "HTTP/1.1 200 OK\r\nSet-Cookie: OTHER=1";
        assert_eq!(parse_session_cookie(other), None);
    }

    #[tokio::test]
    async fn test_post_sends_title_case_request_and_keeps_cookie() {
        let (port, device) = stub_device(vec![
            response(
                "200 OK",
                "Set-Cookie: TP_SESSIONID=S1;TIMEOUT=86400\r\n",
                &[0xAB; 48],
            ),
            response("200 OK", "", b""),
        ])
        .await;

        let mut exchange = HttpExchange::new("127.0.0.1", port, Duration::from_secs(5));
        let body = exchange.post("handshake1", &[0x01; 16]).await.unwrap();
        assert_eq!(body, vec![0xAB; 48]);
        assert!(exchange.has_session_cookie());

        let body = exchange.post("handshake2", &[0x02; 32]).await.unwrap();
        assert!(body.is_empty());

        let requests = device.await.unwrap();
        let first = String::from_utf8_lossy(&requests[0]).into_owned();
        assert!(first.starts_with("POST /app/handshake1 HTTP/1.1\r\n"));
        assert!(first.contains("Content-Type: application/octet-stream\r\n"));
        assert!(first.contains("Content-Length: 16\r\n"));
        assert!(!first.contains("Cookie:"));
        assert!(requests[0].ends_with(&[0x01; 16]));

        let second = String::from_utf8_lossy(&requests[1]).into_owned();
        assert!(second.starts_with("POST /app/handshake2 HTTP/1.1\r\n"));
        assert!(second.contains("Cookie: TP_SESSIONID=S1\r\n"));
    }

    #[tokio::test]
    async fn test_reset_session_drops_cookie() {
        let (port, device) = stub_device(vec![
            response("200 OK", "Set-Cookie: TP_SESSIONID=OLD\r\n", b"ok"),
            response("200 OK", "", b"ok"),
        ])
        .await;

        let mut exchange = HttpExchange::new("127.0.0.1", port, Duration::from_secs(5));
        exchange.post("handshake1", b"x").await.unwrap();
        exchange.reset_session();
        assert!(!exchange.has_session_cookie());
        exchange.post("handshake1", b"y").await.unwrap();

        let requests = device.await.unwrap();
        assert!(!String::from_utf8_lossy(&requests[1]).contains("Cookie:"));
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let (port, device) = stub_device(vec![response("403 Forbidden", "", b"denied")]).await;

        let mut exchange = HttpExchange::new("127.0.0.1", port, Duration::from_secs(5));
        let err = exchange.post("handshake2", &[0u8; 32]).await.unwrap_err();
        assert!(matches!(err, Error::HttpStatus(403)));
        assert!(err.is_transport());
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_body_without_content_length_reads_to_eof() {
        let raw = b"HTTP/1.1 200 OK\r\nServer: klap\r\n\r\nstreamed body".to_vec();
        let (port, device) = stub_device(vec![raw]).await;

        let mut exchange = HttpExchange::new("127.0.0.1", port, Duration::from_secs(5));
        let body = exchange.post("request?seq=1", b"{}").await.unwrap();
        assert_eq!(body, b"streamed body");

        let requests = device.await.unwrap();
        assert!(requests[0].starts_with(b"POST /app/request?seq=1 HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut exchange = HttpExchange::new("127.0.0.1", port, Duration::from_secs(2));
        let err = exchange.post("handshake1", &[0u8; 16]).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed(_)));
    }

    #[test]
    fn test_debug_redacts_cookie() {
        let mut exchange = HttpExchange::new("plug.local", 80, Duration::from_secs(1));
        exchange.session_cookie = Some("SECRETCOOKIE".into());
        let debug = format!("{:?}", exchange);
        assert!(debug.contains("plug.local"));
        assert!(!debug.contains("SECRETCOOKIE"));
    }
}
