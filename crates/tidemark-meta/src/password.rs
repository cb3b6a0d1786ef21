//! Salted, iterated password hashing.
//!
//! Hashes are PBKDF2-HMAC-SHA256 encoded as
//! `pbkdf2-sha256$<iterations>$<salt hex>$<hash hex>` so the iteration count
//! can be raised later without invalidating stored hashes.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::MetaError;

const SCHEME: &str = "pbkdf2-sha256";
const SALT_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<[u8; 32], MetaError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| MetaError::InvalidArgument(e.to_string()))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().into())
}

/// PBKDF2 with HMAC-SHA256, one output block.
fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> Result<[u8; 32], MetaError> {
    let mut input = Vec::with_capacity(salt.len() + 4);
    input.extend_from_slice(salt);
    input.extend_from_slice(&1u32.to_be_bytes());
    let mut u_prev = hmac_sha256(password, &input)?;
    let mut result = u_prev;

    for _ in 1..iterations {
        let u_next = hmac_sha256(password, &u_prev)?;
        for (r, u) in result.iter_mut().zip(u_next.iter()) {
            *r ^= u;
        }
        u_prev = u_next;
    }
    Ok(result)
}

/// Hashes `password` with a fresh random salt.
pub fn hash_password(password: &str, iterations: u32) -> Result<String, MetaError> {
    if iterations == 0 {
        return Err(MetaError::InvalidArgument(
            "password hash iterations must be non-zero".to_string(),
        ));
    }
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let hash = pbkdf2_sha256(password.as_bytes(), &salt, iterations)?;
    Ok(format!(
        "{}${}${}${}",
        SCHEME,
        iterations,
        hex::encode(salt),
        hex::encode(hash)
    ))
}

/// Returns true if `password` matches `encoded`. Malformed hashes never match.
pub fn verify_password(password: &str, encoded: &str) -> bool {
    let parts: Vec<&str> = encoded.split('$').collect();
    let [scheme, iterations, salt, expected] = parts.as_slice() else {
        return false;
    };
    if *scheme != SCHEME {
        return false;
    }
    let (Ok(iterations), Ok(salt), Ok(expected)) =
        (iterations.parse::<u32>(), hex::decode(salt), hex::decode(expected))
    else {
        return false;
    };
    if iterations == 0 {
        return false;
    }
    match pbkdf2_sha256(password.as_bytes(), &salt, iterations) {
        Ok(actual) => actual[..].ct_eq(&expected[..]).into(),
        Err(_) => false,
    }
}

/// A well-formed hash nobody knows the password for. Verifying against it
/// costs the same as verifying a real user, so unknown names and wrong
/// passwords take the same time to reject.
pub(crate) fn dummy_hash(iterations: u32) -> String {
    format!(
        "{}${}${}${}",
        SCHEME,
        iterations.max(1),
        hex::encode([0u8; SALT_LEN]),
        hex::encode([0u8; 32])
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("s3cret", 100).unwrap();
        assert!(hash.starts_with("pbkdf2-sha256$100$"));
        assert!(!hash.contains("s3cret"));
        assert!(verify_password("s3cret", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn test_salt_is_random() {
        let a = hash_password("same", 10).unwrap();
        let b = hash_password("same", 10).unwrap();
        assert_ne!(a, b);
        assert!(verify_password("same", &a));
        assert!(verify_password("same", &b));
    }

    #[test]
    fn test_pbkdf2_known_vector() {
        // RFC 7914 section 11 test vector for PBKDF2-HMAC-SHA256, c = 1.
        let out = pbkdf2_sha256(b"passwd", b"salt", 1).unwrap();
        assert_eq!(
            hex::encode(&out[..16]),
            "55ac046e56e3089fec1691c22544b605"
        );
    }

    #[test]
    fn test_malformed_hash_never_verifies() {
        assert!(!verify_password("x", ""));
        assert!(!verify_password("x", "bcrypt$10$aa$bb"));
        assert!(!verify_password("x", "pbkdf2-sha256$abc$00$00"));
        assert!(!verify_password("x", "pbkdf2-sha256$0$00$00"));
        assert!(!verify_password("x", "pbkdf2-sha256$1$zz$00"));
    }

    #[test]
    fn test_dummy_hash_rejects() {
        let dummy = dummy_hash(10);
        assert!(!verify_password("", &dummy));
        assert!(!verify_password("anything", &dummy));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        assert!(hash_password("x", 0).is_err());
    }
}
