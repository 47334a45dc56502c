//! Core library for the KLAP protocol used by TP-Link smart home devices.
//!
//! KLAP authenticates a client with a two-phase challenge-response handshake
//! over plain HTTP and then exchanges AES-128-CBC encrypted payloads whose IV
//! and integrity tag are bound to a per-session sequence number.
//!
//! # Overview
//!
//! - [`handshake`] negotiates the local and remote seeds and proves that both
//!   sides hold the same credential hash.
//! - [`crypto`] derives the session key material from the seeds and encrypts
//!   and decrypts messages.
//! - [`transport`] posts raw bodies to the device.
//! - [`KlapClient`] composes the three for one request at a time.
//!
//! # Example
//!
//! ```no_run
//! use klap_core::{ClientConfig, Credentials, KlapClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), klap_core::Error> {
//!     let credentials = Credentials::new("user@example.com", "password");
//!     let mut client = KlapClient::new(ClientConfig::new("192.168.1.100"), &credentials);
//!
//!     let response = client
//!         .request_str("request", r#"{"method": "get_device_info"}"#, None)
//!         .await?;
//!     println!("{}", response);
//!     Ok(())
//! }
//! ```
//!
//! # Protocol Details
//!
//! 1. `POST /app/handshake1` with 16 random bytes; the device returns its own
//!    16 bytes and `sha256(local ‖ remote ‖ auth_hash)`
//! 2. `POST /app/handshake2` with `sha256(remote ‖ local ‖ auth_hash)`
//! 3. `POST /app/request?seq=N` with `tag ‖ ciphertext`; the response has the
//!    same shape and is decrypted with the IV of request `N`

pub mod client;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod transport;

pub use client::KlapClient;
pub use credentials::Credentials;
pub use error::Error;
pub use handshake::HandshakeSeeds;
pub use transport::{ClientConfig, DEFAULT_PORT, DEFAULT_TIMEOUT, Exchange, HttpExchange};

/// The version of the klap-core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
