//! KLAP two-phase handshake.
//!
//! 1. **Handshake 1**: the client posts a fresh 16-byte local seed to
//!    `handshake1`. The device answers with its 16-byte remote seed followed
//!    by `sha256(local_seed ‖ remote_seed ‖ auth_hash)`, proving it knows the
//!    credential hash.
//! 2. **Handshake 2**: the client posts `sha256(remote_seed ‖ local_seed ‖
//!    auth_hash)` to `handshake2`, proving the same in the other direction.
//!    Any non-error status completes the handshake.
//!
//! Neither step is retried. A failure anywhere means starting over with a
//! new local seed.

use rand::{TryRngCore, rngs::OsRng};
use tracing::debug;

use crate::{
    crypto::{AuthHash, KlapSessionCipher, SEED_LEN, Seed, handshake2_hash, verify_server_hash},
    error::Error,
    transport::Exchange,
};

/// Endpoint receiving the local seed.
pub const HANDSHAKE1_ENDPOINT: &str = "handshake1";

/// Endpoint receiving the client proof.
pub const HANDSHAKE2_ENDPOINT: &str = "handshake2";

/// Shortest acceptable handshake1 response: remote seed plus server hash.
const MIN_HANDSHAKE1_RESPONSE: usize = 32;

/// Seeds agreed by a successful handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeSeeds {
    /// Seed generated by this client.
    pub local_seed: Seed,
    /// Seed received from the device.
    pub remote_seed: Seed,
}

impl HandshakeSeeds {
    /// Derives the session cipher for these seeds.
    pub fn session_cipher(&self, auth_hash: &AuthHash) -> KlapSessionCipher {
        KlapSessionCipher::new(&self.local_seed, &self.remote_seed, auth_hash)
    }
}

/// Draws a local seed from the operating system's secure random source.
pub fn generate_seed() -> Result<Seed, Error> {
    let mut seed = [0u8; SEED_LEN];
    OsRng
        .try_fill_bytes(&mut seed)
        .map_err(|e| Error::Randomness(e.to_string()))?;
    Ok(seed)
}

/// Runs both handshake round trips with a freshly generated local seed.
///
/// The exchange's session cookies are discarded first so that the device
/// starts a new session.
pub async fn perform_handshake<E>(
    exchange: &mut E,
    auth_hash: &AuthHash,
) -> Result<HandshakeSeeds, Error>
where
    E: Exchange + ?Sized,
{
    let local_seed = generate_seed()?;
    handshake_with_seed(exchange, auth_hash, local_seed).await
}

/// Runs both handshake round trips with the given local seed.
pub async fn handshake_with_seed<E>(
    exchange: &mut E,
    auth_hash: &AuthHash,
    local_seed: Seed,
) -> Result<HandshakeSeeds, Error>
where
    E: Exchange + ?Sized,
{
    exchange.reset_session();

    let remote_seed = handshake1(exchange, auth_hash, &local_seed).await?;
    handshake2(exchange, auth_hash, &local_seed, &remote_seed).await?;

    debug!("KLAP handshake completed successfully");
    Ok(HandshakeSeeds {
        local_seed,
        remote_seed,
    })
}

/// Sends the local seed and verifies the device's answer.
async fn handshake1<E>(
    exchange: &mut E,
    auth_hash: &AuthHash,
    local_seed: &Seed,
) -> Result<Seed, Error>
where
    E: Exchange + ?Sized,
{
    debug!(local_seed = %hex::encode(local_seed), "Performing KLAP handshake1");

    let body = exchange.post(HANDSHAKE1_ENDPOINT, local_seed).await?;

    if body.len() < MIN_HANDSHAKE1_RESPONSE {
        return Err(Error::Protocol(format!(
            "Handshake1 response has unexpected length: {} (expected at least {})",
            body.len(),
            MIN_HANDSHAKE1_RESPONSE
        )));
    }

    let (remote, server_hash) = body.split_at(SEED_LEN);
    let mut remote_seed = [0u8; SEED_LEN];
    remote_seed.copy_from_slice(remote);

    debug!(
        remote_seed = %hex::encode(remote_seed),
        server_hash = %hex::encode(server_hash),
        "Handshake1 received response"
    );

    if !verify_server_hash(local_seed, &remote_seed, auth_hash, server_hash) {
        return Err(Error::AuthenticationFailed(
            "device handshake1 hash does not match the credential hash. \
             Check that your username and password (both case-sensitive) are correct."
                .into(),
        ));
    }

    Ok(remote_seed)
}

/// Sends the client proof.
async fn handshake2<E>(
    exchange: &mut E,
    auth_hash: &AuthHash,
    local_seed: &Seed,
    remote_seed: &Seed,
) -> Result<(), Error>
where
    E: Exchange + ?Sized,
{
    debug!("Performing KLAP handshake2");

    let payload = handshake2_hash(local_seed, remote_seed, auth_hash);
    exchange.post(HANDSHAKE2_ENDPOINT, &payload).await?;

    debug!("Handshake2 succeeded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::crypto::handshake1_hash;

    const LOCAL: Seed = [0x01; SEED_LEN];
    const REMOTE: Seed = [0x02; SEED_LEN];

    /// Exchange that replays scripted responses and records every call.
    #[derive(Default)]
    struct ScriptedExchange {
        responses: Vec<Result<Vec<u8>, Error>>,
        calls: Vec<(String, Vec<u8>)>,
        resets: usize,
    }

    impl ScriptedExchange {
        fn new(responses: Vec<Result<Vec<u8>, Error>>) -> Self {
            Self {
                responses,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Exchange for ScriptedExchange {
        async fn post(&mut self, endpoint: &str, body: &[u8]) -> Result<Vec<u8>, Error> {
            self.calls.push((endpoint.to_string(), body.to_vec()));
            if self.responses.is_empty() {
                return Err(Error::ConnectionFailed("no scripted response".into()));
            }
            self.responses.remove(0)
        }

        fn reset_session(&mut self) {
            self.resets += 1;
        }
    }

    fn bob() -> AuthHash {
        AuthHash::from_parts("bob", "secret")
    }

    fn handshake1_response(server_hash: &[u8]) -> Vec<u8> {
        let mut body = REMOTE.to_vec();
        body.extend_from_slice(server_hash);
        body
    }

    #[test]
    fn test_generate_seed_is_random() {
        let a = generate_seed().unwrap();
        let b = generate_seed().unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let good = handshake1_hash(&LOCAL, &REMOTE, &bob());
        let mut exchange =
            ScriptedExchange::new(vec![Ok(handshake1_response(&good)), Ok(Vec::new())]);

        let seeds = handshake_with_seed(&mut exchange, &bob(), LOCAL)
            .await
            .unwrap();

        assert_eq!(seeds.local_seed, LOCAL);
        assert_eq!(seeds.remote_seed, REMOTE);
        assert_eq!(exchange.resets, 1);
        assert_eq!(exchange.calls.len(), 2);
        assert_eq!(exchange.calls[0], ("handshake1".to_string(), LOCAL.to_vec()));
        assert_eq!(exchange.calls[1].0, "handshake2");
        assert_eq!(
            exchange.calls[1].1,
            handshake2_hash(&LOCAL, &REMOTE, &bob()).to_vec()
        );
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_server_hash() {
        let mut bad = handshake1_hash(&LOCAL, &REMOTE, &bob());
        bad[0] ^= 0xFF;
        let mut exchange =
            ScriptedExchange::new(vec![Ok(handshake1_response(&bad)), Ok(Vec::new())]);

        let err = handshake_with_seed(&mut exchange, &bob(), LOCAL)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AuthenticationFailed(_)));
        assert_eq!(exchange.calls.len(), 1, "handshake2 must not be attempted");
    }

    #[tokio::test]
    async fn test_handshake_rejects_other_credentials() {
        let other = AuthHash::from_parts("alice", "secret");
        let hash_for_other = handshake1_hash(&LOCAL, &REMOTE, &other);
        let mut exchange = ScriptedExchange::new(vec![Ok(handshake1_response(&hash_for_other))]);

        let err = handshake_with_seed(&mut exchange, &bob(), LOCAL)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn test_handshake_rejects_trailing_bytes_in_server_hash() {
        let mut hash = handshake1_hash(&LOCAL, &REMOTE, &bob()).to_vec();
        hash.push(0x00);
        let mut exchange = ScriptedExchange::new(vec![Ok(handshake1_response(&hash))]);

        let err = handshake_with_seed(&mut exchange, &bob(), LOCAL)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn test_handshake_rejects_short_response() {
        let mut exchange = ScriptedExchange::new(vec![Ok(vec![0u8; 31])]);

        let err = handshake_with_seed(&mut exchange, &bob(), LOCAL)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(exchange.calls.len(), 1);
    }

    #[tokio::test]
    async fn test_handshake1_transport_error_propagates() {
        let mut exchange = ScriptedExchange::new(vec![Err(Error::Timeout("Read timed out".into()))]);

        let err = handshake_with_seed(&mut exchange, &bob(), LOCAL)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(exchange.calls.len(), 1);
    }

    #[tokio::test]
    async fn test_handshake2_rejection_propagates() {
        let good = handshake1_hash(&LOCAL, &REMOTE, &bob());
        let mut exchange = ScriptedExchange::new(vec![
            Ok(handshake1_response(&good)),
            Err(Error::HttpStatus(403)),
        ]);

        let err = handshake_with_seed(&mut exchange, &bob(), LOCAL)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HttpStatus(403)));
        assert_eq!(exchange.calls.len(), 2);
    }

    #[tokio::test]
    async fn test_perform_handshake_uses_fresh_seed() {
        // The scripted device cannot know the random seed, so authentication fails,
        // but the seed that was sent must be 16 bytes.
        let mut exchange = ScriptedExchange::new(vec![Ok(handshake1_response(&[0u8; 32]))]);

        let err = perform_handshake(&mut exchange, &bob()).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
        assert_eq!(exchange.calls[0].1.len(), SEED_LEN);
    }

    #[test]
    fn test_seeds_build_matching_cipher() {
        let seeds = HandshakeSeeds {
            local_seed: LOCAL,
            remote_seed: REMOTE,
        };
        let cipher = seeds.session_cipher(&bob());
        let direct = KlapSessionCipher::new(&LOCAL, &REMOTE, &bob());
        assert_eq!(cipher.seq(), direct.seq());
    }
}
