//! PKCE (S256 only)
//!
//! The verifier is 32 random bytes, base64url-encoded; the challenge is the
//! base64url SHA-256 of the verifier string. Verification is constant-time.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// A generated verifier/challenge pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkcePair {
    /// Secret kept by the client
    pub verifier: String,
    /// Digest sent on the authorization request
    pub challenge: String,
}

/// Generate a fresh verifier and its S256 challenge
pub fn generate_pair() -> PkcePair {
    let bytes: [u8; 32] = rand::rng().random();
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = challenge_for(&verifier);
    PkcePair {
        verifier,
        challenge,
    }
}

/// The S256 challenge for a verifier
pub fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Constant-time check that `verifier` hashes to `challenge`
pub fn verify(verifier: &str, challenge: &str) -> bool {
    let computed = challenge_for(verifier);
    computed.as_bytes().ct_eq(challenge.as_bytes()).into()
}

/// Constant-time equality for secrets of possibly different lengths
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
