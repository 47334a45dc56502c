//! Error types for klap-core.
//!
//! This module defines the error types returned by the library.

use thiserror::Error;

use crate::crypto::CipherError;

/// Error type for klap-core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection to the device failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Device answered with an HTTP error status (400 or above).
    #[error("device returned HTTP status {0}")]
    HttpStatus(u16),

    /// Protocol error (unexpected response format, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The device could not prove it holds the same credential hash.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The secure random source failed to produce a seed.
    #[error("random source failed: {0}")]
    Randomness(String),

    /// Session cipher failure.
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
}

impl Error {
    /// Returns `true` if the error was raised by the transport collaborator
    /// rather than by the handshake or the cipher.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed(_)
                | Error::Timeout(_)
                | Error::IoError(_)
                | Error::HttpStatus(_)
                | Error::Protocol(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}
