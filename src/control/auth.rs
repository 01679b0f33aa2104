//! Challenge-response primitives.
//!
//! The server hands out an unpredictable challenge; the client proves it
//! knows the secret by returning a keyed digest of the challenge. The secret
//! itself never crosses the wire, and a captured response is useless against
//! any later challenge.

use std::fmt;

use rand::Rng;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::secret::Secret;

/// Length of a generated challenge.
pub const CHALLENGE_LEN: usize = 32;

/// A one-time challenge string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Challenge(String);

impl Challenge {
    /// Draw a fresh challenge of lowercase letters from the OS random source.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let text = (0..CHALLENGE_LEN)
            .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
            .collect();
        Self(text)
    }

    /// The challenge text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Challenge {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Computes the expected response to a challenge.
///
/// The byte layout is pluggable so the server can match whichever framing
/// the deployed admin clients use.
pub trait ResponseDigest: Send + Sync {
    /// Lowercase hex digest for `challenge` under `secret`.
    fn compute(&self, challenge: &Challenge, secret: &Secret) -> String;
}

/// `SHA-256(challenge || secret || challenge)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Sandwich;

impl ResponseDigest for Sha256Sandwich {
    fn compute(&self, challenge: &Challenge, secret: &Secret) -> String {
        let mut hasher = Sha256::new();
        hasher.update(challenge.as_str().as_bytes());
        hasher.update(secret.as_bytes());
        hasher.update(challenge.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// `SHA-256(challenge || "\n" || secret || challenge || "\n")`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256NewlineFramed;

impl ResponseDigest for Sha256NewlineFramed {
    fn compute(&self, challenge: &Challenge, secret: &Secret) -> String {
        let mut hasher = Sha256::new();
        hasher.update(challenge.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(secret.as_bytes());
        hasher.update(challenge.as_str().as_bytes());
        hasher.update(b"\n");
        hex::encode(hasher.finalize())
    }
}

/// Digest selection in the config file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DigestKind {
    /// [`Sha256Sandwich`].
    #[default]
    Sandwich,
    /// [`Sha256NewlineFramed`].
    NewlineFramed,
}

impl DigestKind {
    /// Instantiate the digest.
    pub fn build(self) -> Box<dyn ResponseDigest> {
        match self {
            DigestKind::Sandwich => Box::new(Sha256Sandwich),
            DigestKind::NewlineFramed => Box::new(Sha256NewlineFramed),
        }
    }
}

/// Check a client response against the expected digest.
///
/// The submitted text is lowercased first (hex is case-insensitive) and the
/// comparison runs in constant time with respect to the content.
pub fn verify(
    digest: &dyn ResponseDigest,
    challenge: &Challenge,
    secret: &Secret,
    response: &str,
) -> bool {
    let expected = digest.compute(challenge, secret);
    let submitted = response.trim().to_ascii_lowercase();
    expected.as_bytes().ct_eq(submitted.as_bytes()).into()
}
