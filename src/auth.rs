//! The handshake's salted iterated-hash password scheme (spec.md §4.1).
//!
//! The server never stores or transmits the plaintext password after boot;
//! it only ever computes the expected hash and compares it, constant-time,
//! against what the client sent.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Lower bound (inclusive) of the randomly chosen iteration count offered
/// in the `+HI` greeting.
pub const ITER_MIN: u32 = 4000;
/// Upper bound (exclusive).
pub const ITER_MAX: u32 = 8096;

/// The `+HI <payload>` document the server sends first.
#[derive(Debug, Clone, Serialize)]
pub struct HiDoc {
    pub v: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<String>,
}

impl HiDoc {
    /// Protocol version this server speaks.
    pub const VERSION: u32 = 2;

    pub fn new(challenge: Option<&(u32, String)>) -> Self {
        Self {
            v: Self::VERSION,
            i: challenge.map(|(i, _)| *i),
            s: challenge.map(|(_, s)| s.clone()),
        }
    }
}

/// The `HELLO <payload>` document the client replies with.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HelloDoc {
    pub v: u32,
    #[serde(default)]
    pub wid: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub pwdhash: Option<String>,
}

/// Generates a random 63-bit salt, rendered as lowercase hex.
pub fn generate_salt() -> String {
    let n: u64 = rand::thread_rng().gen_range(0..(1u64 << 63));
    format!("{n:x}")
}

/// Generates a random iteration count in `[4000, 8096)`.
pub fn generate_iterations() -> u32 {
    rand::thread_rng().gen_range(ITER_MIN..ITER_MAX)
}

/// Computes the iterated SHA-256 hash of `password || salt`, hex-encoded.
///
/// The first iteration hashes `password || salt`; every subsequent
/// iteration rehashes the previous digest. `iterations` is clamped to at
/// least 1 -- an iteration count of zero has no sensible meaning here.
pub fn compute_hash(password: &str, salt: &str, iterations: u32) -> String {
    let iterations = iterations.max(1);

    let mut digest = {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hasher.update(salt.as_bytes());
        hasher.finalize()
    };

    for _ in 1..iterations {
        let mut hasher = Sha256::new();
        hasher.update(digest);
        digest = hasher.finalize();
    }

    hex::encode(digest)
}

/// Verifies a client-supplied `pwdhash` against the expected value,
/// honouring the v1 backward-compatibility rule: clients reporting protocol
/// version `< 2` are checked against `iterations = 1` regardless of what
/// iteration count the server offered on the wire, since pre-v2 clients
/// never applied it.
///
/// The comparison is constant-time with respect to the password.
pub fn verify(
    password: &str,
    salt: &str,
    server_iterations: u32,
    client_version: u32,
    given_hash: &str,
) -> bool {
    let effective_iterations = if client_version >= 2 {
        server_iterations
    } else {
        1
    };

    let expected = compute_hash(password, salt, effective_iterations);
    expected.as_bytes().ct_eq(given_hash.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_lowercase_hex() {
        let h1 = compute_hash("hunter2", "abc123", 3);
        let h2 = compute_hash("hunter2", "abc123", 3);
        assert_eq!(h1, h2);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn verify_accepts_matching_hash() {
        let salt = "deadbeef";
        let iterations = 100;
        let hash = compute_hash("hunter2", salt, iterations);
        assert!(verify("hunter2", salt, iterations, 2, &hash));
    }

    #[test]
    fn verify_rejects_wrong_password() {
        let salt = "deadbeef";
        let hash = compute_hash("hunter2", salt, 100);
        assert!(!verify("wrongpass", salt, 100, 2, &hash));
    }

    #[test]
    fn legacy_v1_client_uses_single_iteration() {
        let salt = "deadbeef";
        // Client believes iterations == 1 regardless of what the server
        // offered, matching the v1 protocol's lack of iteration support.
        let legacy_hash = compute_hash("hunter2", salt, 1);
        assert!(verify("hunter2", salt, 9999, 1, &legacy_hash));
    }
}
