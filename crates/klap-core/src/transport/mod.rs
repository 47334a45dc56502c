//! Transport layer between the KLAP engine and a device.
//!
//! The handshake and the client only need one primitive: POST a byte body to
//! an endpoint under `/app` and get the response body back. [`Exchange`]
//! captures that, and [`HttpExchange`] implements it over a raw HTTP/1.1
//! connection.

pub mod http;

pub use http::HttpExchange;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Error;

/// Default HTTP port for the KLAP protocol.
pub const DEFAULT_PORT: u16 = 80;

/// Default timeout for transport operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Request/response primitive consumed by the handshake and the client.
///
/// Implementations enforce their own timeouts and report failures as
/// [`Error`]; callers never retry.
#[async_trait]
pub trait Exchange: Send {
    /// Posts `body` to `endpoint` and returns the response body.
    ///
    /// `endpoint` is relative to the application root and may carry a query
    /// string, e.g. `handshake1` or `request?seq=42`. Responses with a status
    /// of 400 or above fail with [`Error::HttpStatus`].
    async fn post(&mut self, endpoint: &str, body: &[u8]) -> Result<Vec<u8>, Error>;

    /// Discards any session state (cookies) kept from earlier requests.
    fn reset_session(&mut self);
}

/// Configuration for connecting to a device.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The device hostname or IP address.
    pub host: String,
    /// HTTP port.
    pub port: u16,
    /// Connection and I/O timeout.
    pub timeout: Duration,
}

impl ClientConfig {
    /// Creates a configuration with the default port and timeout.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
