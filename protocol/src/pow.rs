//! # Admission Proof-of-Work
//!
//! Optional gate on overlay admission: a HELLO must carry a SHA-256
//! puzzle solution binding the sender's node id to a nonce. The digest of
//! the decimal nonce string concatenated with the node id (no separator)
//! must start with `k` zero hex characters.
//!
//! Generation is CPU-bound and runs exactly once at startup, before the
//! first HELLO goes out — never on the datagram path. Verification is a
//! single hash.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// The only digest algorithm credentials may claim.
pub const POW_HASH_ALG: &str = "sha256";

/// A solved admission puzzle, carried in the HELLO payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowCredential {
    /// Digest algorithm. Always `"sha256"`; anything else is rejected.
    pub hash_alg: String,
    /// Difficulty the solution was mined for, in leading zero hex digits.
    pub difficulty_k: u32,
    /// The nonce that satisfies the difficulty.
    pub nonce: u32,
    /// Lowercase hex digest of `"{nonce}{node_id}"`.
    pub digest_hex: String,
}

/// Why a credential was rejected. The reason string feeds the
/// `hello_rejected` event, so variants map to stable snake_case names.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PowError {
    /// Credential claims an algorithm other than sha256.
    #[error("pow_bad_alg")]
    BadAlg,
    /// Credential was mined for a different difficulty than required.
    #[error("pow_difficulty_mismatch")]
    DifficultyMismatch,
    /// Recomputed digest does not match the claimed one.
    #[error("pow_digest_mismatch")]
    DigestMismatch,
    /// Digest does not carry the required zero prefix.
    #[error("pow_insufficient_difficulty")]
    InsufficientDifficulty,
}

fn digest_hex(node_id: &str, nonce: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce.to_string().as_bytes());
    hasher.update(node_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Mines a credential for `node_id` at difficulty `k` by scanning nonces
/// from zero. `k = 0` is satisfied immediately by nonce 0 (the empty
/// prefix matches any digest), so the degenerate case stays verifiable
/// by the same rule as every other credential.
pub fn generate(node_id: &str, k: u32) -> PowCredential {
    let prefix = "0".repeat(k as usize);
    let mut nonce: u32 = 0;
    loop {
        let digest = digest_hex(node_id, nonce);
        if digest.starts_with(&prefix) {
            return PowCredential {
                hash_alg: POW_HASH_ALG.to_string(),
                difficulty_k: k,
                nonce,
                digest_hex: digest,
            };
        }
        nonce = nonce.wrapping_add(1);
    }
}

/// Checks a credential against the difficulty this node requires:
/// algorithm, claimed difficulty, exact digest equality, and the zero
/// prefix. Recomputes the digest rather than trusting the claim.
pub fn verify(node_id: &str, cred: &PowCredential, k_required: u32) -> Result<(), PowError> {
    if !cred.hash_alg.eq_ignore_ascii_case(POW_HASH_ALG) {
        return Err(PowError::BadAlg);
    }
    if cred.difficulty_k != k_required {
        return Err(PowError::DifficultyMismatch);
    }
    let computed = digest_hex(node_id, cred.nonce);
    if computed != cred.digest_hex {
        return Err(PowError::DigestMismatch);
    }
    if !computed.starts_with(&"0".repeat(k_required as usize)) {
        return Err(PowError::InsufficientDifficulty);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_difficulty_accepts_nonce_zero() {
        let cred = generate("node-a", 0);
        assert_eq!(cred.nonce, 0);
        assert_eq!(cred.difficulty_k, 0);
        verify("node-a", &cred, 0).unwrap();
    }

    #[test]
    fn generated_credential_verifies() {
        let cred = generate("node-a", 1);
        assert!(cred.digest_hex.starts_with('0'));
        verify("node-a", &cred, 1).unwrap();
    }

    #[test]
    fn credential_is_bound_to_node_id() {
        let cred = generate("node-a", 1);
        assert_eq!(verify("node-b", &cred, 1), Err(PowError::DigestMismatch));
    }

    #[test]
    fn difficulty_mismatch_rejected() {
        let cred = generate("node-a", 1);
        assert_eq!(verify("node-a", &cred, 2), Err(PowError::DifficultyMismatch));
    }

    #[test]
    fn forged_digest_rejected() {
        let mut cred = generate("node-a", 1);
        cred.digest_hex = format!("f{}", &cred.digest_hex[1..]);
        assert_eq!(verify("node-a", &cred, 1), Err(PowError::DigestMismatch));
    }

    #[test]
    fn wrong_algorithm_rejected() {
        let mut cred = generate("node-a", 1);
        cred.hash_alg = "md5".to_string();
        assert_eq!(verify("node-a", &cred, 1), Err(PowError::BadAlg));
    }

    #[test]
    fn preimage_is_nonce_then_node_id() {
        // Pin the preimage encoding: decimal nonce string, then node id,
        // no separator. Wire-compatible peers depend on this exact form.
        let cred = generate("abc", 0);
        let mut hasher = Sha256::new();
        hasher.update(b"0abc");
        assert_eq!(cred.digest_hex, hex::encode(hasher.finalize()));
    }
}
