//! KLAP client: handshake, encrypt, send, decrypt.

use std::collections::BTreeMap;

use tracing::debug;

use crate::{
    Credentials,
    crypto::{AuthHash, KlapSessionCipher, split_sealed},
    error::Error,
    handshake::perform_handshake,
    transport::{ClientConfig, Exchange, HttpExchange},
};

/// Default application endpoint for encrypted requests.
pub const REQUEST_ENDPOINT: &str = "request";

/// Client for a KLAP device.
///
/// Every [`request`](Self::request) runs a new handshake, so each request gets
/// its own session cipher; the previous one is dropped.
///
/// # Example
///
/// ```no_run
/// use klap_core::{ClientConfig, Credentials, KlapClient};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let credentials = Credentials::new("user@example.com", "password");
///     let mut client = KlapClient::new(ClientConfig::new("192.168.1.100"), &credentials);
///
///     let response = client
///         .request_str("request", r#"{"method": "get_energy_usage", "params": null}"#, None)
///         .await?;
///     println!("{}", response);
///     Ok(())
/// }
/// ```
pub struct KlapClient<E = HttpExchange> {
    exchange: E,
    auth_hash: AuthHash,
    session: Option<KlapSessionCipher>,
}

impl KlapClient<HttpExchange> {
    /// Creates a client that talks HTTP to the configured device.
    pub fn new(config: ClientConfig, credentials: &Credentials) -> Self {
        Self::with_exchange(HttpExchange::from_config(&config), credentials)
    }
}

impl<E: Exchange> KlapClient<E> {
    /// Creates a client over any [`Exchange`].
    pub fn with_exchange(exchange: E, credentials: &Credentials) -> Self {
        Self {
            exchange,
            auth_hash: AuthHash::from_credentials(credentials),
            session: None,
        }
    }

    /// Returns the underlying exchange.
    pub fn exchange(&self) -> &E {
        &self.exchange
    }

    /// Returns the session cipher of the last successful handshake.
    pub fn session(&self) -> Option<&KlapSessionCipher> {
        self.session.as_ref()
    }

    /// Runs a handshake and installs a new session cipher.
    ///
    /// On failure the previous session is discarded as well.
    pub async fn handshake(&mut self) -> Result<&mut KlapSessionCipher, Error> {
        self.session = None;
        let seeds = perform_handshake(&mut self.exchange, &self.auth_hash).await?;
        Ok(self.session.insert(seeds.session_cipher(&self.auth_hash)))
    }

    /// Sends an encrypted message to `target` and returns the decrypted reply.
    ///
    /// `params` are added to the query string next to the `seq` parameter,
    /// which is always set from the session cipher.
    pub async fn request(
        &mut self,
        target: &str,
        message: &[u8],
        params: Option<&BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, Error> {
        self.handshake().await?;
        let Self {
            exchange, session, ..
        } = self;
        let cipher = session
            .as_mut()
            .ok_or_else(|| Error::Protocol("no session after handshake".into()))?;

        let payload = cipher.encrypt(message)?;
        let seq = cipher.seq();
        let endpoint = format!("{}?{}", target, encode_query(params, seq));

        debug!(seq, bytes = payload.len(), "Sending KLAP request");
        let response = exchange.post(&endpoint, &payload).await?;

        let (_tag, ciphertext) = split_sealed(&response)?;
        let decrypted = cipher.decrypt(ciphertext)?;
        debug!(seq, bytes = decrypted.len(), "Decrypted KLAP response");
        Ok(decrypted)
    }

    /// Like [`request`](Self::request), for UTF-8 messages such as JSON.
    pub async fn request_str(
        &mut self,
        target: &str,
        message: &str,
        params: Option<&BTreeMap<String, String>>,
    ) -> Result<String, Error> {
        let decrypted = self.request(target, message.as_bytes(), params).await?;
        String::from_utf8(decrypted)
            .map_err(|e| Error::Protocol(format!("Response is not valid UTF-8: {}", e)))
    }
}

impl<E> std::fmt::Debug for KlapClient<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KlapClient")
            .field("auth_hash", &self.auth_hash)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Builds `k=v&...` with keys in sorted order and `seq` set to `seq`.
fn encode_query(params: Option<&BTreeMap<String, String>>, seq: i32) -> String {
    let mut params = params.cloned().unwrap_or_default();
    params.insert("seq".to_string(), seq.to_string());
    params
        .iter()
        .map(|(key, value)| format!("{}={}", query_escape(key), query_escape(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Form-encodes a query component: unreserved bytes pass, space becomes `+`.
fn query_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
