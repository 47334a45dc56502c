//! Cryptographic primitives for the KLAP protocol.
//!
//! - [`klap`]: credential hashing, handshake hashes and the session cipher

pub mod klap;

pub use klap::{
    AuthHash, CipherError, ExchangeState, KlapSessionCipher, SEED_LEN, Seed, TAG_LEN,
    handshake1_hash, handshake2_hash, split_sealed, verify_server_hash,
};
