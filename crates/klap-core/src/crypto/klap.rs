//! KLAP hashing, key derivation and session cipher.
//!
//! Every secret in KLAP comes from one SHA-256 shape:
//!
//! ```text
//! sha256(label ‖ first_seed ‖ second_seed ‖ auth_hash)
//! ```
//!
//! | context          | label   | seed order      | bytes used          |
//! |------------------|---------|-----------------|---------------------|
//! | handshake1 hash  | (none)  | local, remote   | all 32              |
//! | handshake2 proof | (none)  | remote, local   | all 32              |
//! | AES key          | `lsk`   | local, remote   | `[0..16]`           |
//! | IV base + seq    | `iv`    | local, remote   | `[0..12]`, `[28..32]` |
//! | signature base   | `ldk`   | local, remote   | `[0..28]`           |
//!
//! Messages are AES-128-CBC with PKCS#7 padding. The IV is the 12-byte base
//! followed by the big-endian sequence number, and each sealed request is
//! prefixed with `sha256(sig_base ‖ be32(seq) ‖ ciphertext)`.

use std::fmt;

use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::Credentials;

/// Length of the local and remote handshake seeds.
pub const SEED_LEN: usize = 16;

/// Length of the credential hash.
pub const AUTH_HASH_LEN: usize = 32;

/// Length of the integrity tag prefixed to every sealed message.
pub const TAG_LEN: usize = 32;

const KEY_LEN: usize = 16;
const IV_BASE_LEN: usize = 12;
const SIG_LEN: usize = 28;
const BLOCK_LEN: usize = 16;

const KEY_LABEL: &[u8] = b"lsk";
const IV_LABEL: &[u8] = b"iv";
const SIG_LABEL: &[u8] = b"ldk";

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// A 16-byte handshake nonce.
pub type Seed = [u8; SEED_LEN];

/// Credential hash shared by the client and the device.
///
/// `sha256(sha1(username) ‖ sha1(password))`. It is computed once per client
/// and never leaves the process.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthHash([u8; AUTH_HASH_LEN]);

impl AuthHash {
    /// Hashes a username/password pair.
    pub fn from_credentials(credentials: &Credentials) -> Self {
        Self::from_parts(&credentials.username, credentials.expose_password())
    }

    /// Hashes a raw username and password.
    pub fn from_parts(username: &str, password: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(Sha1::digest(username.as_bytes()));
        hasher.update(Sha1::digest(password.as_bytes()));
        Self(hasher.finalize().into())
    }

    /// Wraps an already computed hash.
    pub fn from_bytes(bytes: [u8; AUTH_HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; AUTH_HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for AuthHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthHash([REDACTED])")
    }
}

/// `sha256(label ‖ first ‖ second ‖ auth_hash)`.
fn seeded_digest(label: &[u8], first: &Seed, second: &Seed, auth_hash: &AuthHash) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(first);
    hasher.update(second);
    hasher.update(auth_hash.as_bytes());
    hasher.finalize().into()
}

/// Hash the device must return in handshake1: `sha256(local ‖ remote ‖ auth_hash)`.
pub fn handshake1_hash(local_seed: &Seed, remote_seed: &Seed, auth_hash: &AuthHash) -> [u8; 32] {
    seeded_digest(&[], local_seed, remote_seed, auth_hash)
}

/// Client proof sent in handshake2: `sha256(remote ‖ local ‖ auth_hash)`.
pub fn handshake2_hash(local_seed: &Seed, remote_seed: &Seed, auth_hash: &AuthHash) -> [u8; 32] {
    seeded_digest(&[], remote_seed, local_seed, auth_hash)
}

/// Checks the device's handshake1 hash in constant time.
///
/// A `server_hash` of the wrong length never matches.
pub fn verify_server_hash(
    local_seed: &Seed,
    remote_seed: &Seed,
    auth_hash: &AuthHash,
    server_hash: &[u8],
) -> bool {
    let expected = handshake1_hash(local_seed, remote_seed, auth_hash);
    expected.as_slice().ct_eq(server_hash).into()
}

/// Error type for KLAP session cipher operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    /// Derived key or IV had the wrong length for AES-128-CBC.
    #[error("invalid key material length")]
    InvalidKeyLength,
    /// Plaintext could not be padded into the output buffer.
    #[error("invalid PKCS#7 padding on encrypt")]
    Padding,
    /// Decrypted data did not end in valid PKCS#7 padding.
    #[error("invalid PKCS#7 padding on decrypt")]
    Unpad,
    /// Ciphertext is empty or not a whole number of blocks.
    #[error("ciphertext length {0} is not a positive multiple of the block size")]
    InvalidCiphertextLength(usize),
    /// A sealed message was shorter than its tag.
    #[error("sealed message is {0} bytes, shorter than the 32-byte tag")]
    MessageTooShort(usize),
    /// `decrypt` was called without a matching `encrypt`.
    #[error("no encrypted request is awaiting a response")]
    OutOfSequence,
}

/// Exchange state of a [`KlapSessionCipher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// No request is in flight.
    Ready,
    /// A request was sealed with `seq` and its response has not been opened.
    AwaitingResponse { seq: i32 },
}

/// Per-session KLAP cipher.
///
/// Built from the two handshake seeds and the credential hash. Each
/// [`encrypt`](Self::encrypt) advances the sequence number and arms the
/// cipher for exactly one [`decrypt`](Self::decrypt) of the response, which
/// reuses the IV of that request. A new handshake is needed for a new cipher;
/// one cipher must not serve concurrent requests.
pub struct KlapSessionCipher {
    key: [u8; KEY_LEN],
    iv_base: [u8; IV_BASE_LEN],
    sig_base: [u8; SIG_LEN],
    seq: i32,
    state: ExchangeState,
}

impl KlapSessionCipher {
    /// Derives the session key material.
    pub fn new(local_seed: &Seed, remote_seed: &Seed, auth_hash: &AuthHash) -> Self {
        let key_digest = seeded_digest(KEY_LABEL, local_seed, remote_seed, auth_hash);
        let iv_digest = seeded_digest(IV_LABEL, local_seed, remote_seed, auth_hash);
        let sig_digest = seeded_digest(SIG_LABEL, local_seed, remote_seed, auth_hash);

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&key_digest[..KEY_LEN]);

        let mut iv_base = [0u8; IV_BASE_LEN];
        iv_base.copy_from_slice(&iv_digest[..IV_BASE_LEN]);

        let mut seq_bytes = [0u8; 4];
        seq_bytes.copy_from_slice(&iv_digest[28..]);

        let mut sig_base = [0u8; SIG_LEN];
        sig_base.copy_from_slice(&sig_digest[..SIG_LEN]);

        Self {
            key,
            iv_base,
            sig_base,
            seq: i32::from_be_bytes(seq_bytes),
            state: ExchangeState::Ready,
        }
    }

    /// Current sequence number, sent as the `seq` query parameter.
    pub fn seq(&self) -> i32 {
        self.seq
    }

    /// Returns the exchange state.
    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Seals a request: advances the sequence and returns `tag ‖ ciphertext`.
    ///
    /// Sealing again before the previous response was decrypted abandons that
    /// exchange.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.seq = self.seq.wrapping_add(1);
        let sealed = self.seal(self.seq, plaintext)?;
        self.state = ExchangeState::AwaitingResponse { seq: self.seq };
        Ok(sealed)
    }

    /// Opens the response to the most recent [`encrypt`](Self::encrypt).
    ///
    /// `ciphertext` is the response body with its 32-byte tag already
    /// removed. The exchange is consumed even if decryption fails.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let ExchangeState::AwaitingResponse { seq } = self.state else {
            return Err(CipherError::OutOfSequence);
        };
        self.state = ExchangeState::Ready;
        self.open(seq, ciphertext)
    }

    /// Encrypts `plaintext` under `seq` and prefixes the integrity tag.
    pub(crate) fn seal(&self, seq: i32, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let iv = self.iv_for_seq(seq);
        let cipher = Aes128CbcEnc::new_from_slices(&self.key, &iv)
            .map_err(|_| CipherError::InvalidKeyLength)?;

        let padded_len = (plaintext.len() / BLOCK_LEN + 1) * BLOCK_LEN;
        let mut sealed = vec![0u8; TAG_LEN + padded_len];
        sealed[TAG_LEN..TAG_LEN + plaintext.len()].copy_from_slice(plaintext);

        let ciphertext_len = cipher
            .encrypt_padded_mut::<Pkcs7>(&mut sealed[TAG_LEN..], plaintext.len())
            .map_err(|_| CipherError::Padding)?
            .len();
        sealed.truncate(TAG_LEN + ciphertext_len);

        let tag = self.signature(seq, &sealed[TAG_LEN..]);
        sealed[..TAG_LEN].copy_from_slice(&tag);
        Ok(sealed)
    }

    /// Decrypts tag-less `ciphertext` under `seq` and strips the padding.
    pub(crate) fn open(&self, seq: i32, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(CipherError::InvalidCiphertextLength(ciphertext.len()));
        }

        let iv = self.iv_for_seq(seq);
        let cipher = Aes128CbcDec::new_from_slices(&self.key, &iv)
            .map_err(|_| CipherError::InvalidKeyLength)?;

        let mut buf = ciphertext.to_vec();
        let plaintext_len = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut buf)
            .map_err(|_| CipherError::Unpad)?
            .len();
        buf.truncate(plaintext_len);
        Ok(buf)
    }

    /// `sha256(sig_base ‖ be32(seq) ‖ ciphertext)`.
    pub(crate) fn signature(&self, seq: i32, ciphertext: &[u8]) -> [u8; TAG_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(self.sig_base);
        hasher.update(seq.to_be_bytes());
        hasher.update(ciphertext);
        hasher.finalize().into()
    }

    /// IV for a given sequence number: `iv_base ‖ be32(seq)`.
    fn iv_for_seq(&self, seq: i32) -> [u8; BLOCK_LEN] {
        let mut iv = [0u8; BLOCK_LEN];
        iv[..IV_BASE_LEN].copy_from_slice(&self.iv_base);
        iv[IV_BASE_LEN..].copy_from_slice(&seq.to_be_bytes());
        iv
    }
}

/// Splits a sealed message into its tag and ciphertext.
pub fn split_sealed(sealed: &[u8]) -> Result<(&[u8], &[u8]), CipherError> {
    if sealed.len() < TAG_LEN {
        return Err(CipherError::MessageTooShort(sealed.len()));
    }
    Ok(sealed.split_at(TAG_LEN))
}

impl fmt::Debug for KlapSessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KlapSessionCipher")
            .field("seq", &self.seq)
            .field("state", &self.state)
            .field("key", &"[REDACTED]")
            .finish()
    }
}
