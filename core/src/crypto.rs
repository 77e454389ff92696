//! # Cryptographic Primitives
//!
//! Low-level building blocks shared by the signer (C2), token factory (C3),
//! and password service (C8). Nothing in this module understands storage or
//! HTTP; it only turns bytes into bytes.
//!
//! | Concern | Function | Backing crate |
//! |---------|----------|---------------|
//! | Password hashing | [`hash_password`] / [`verify_password`] | `bcrypt` |
//! | At-rest key encryption | [`encrypt_with_master_keys`] / [`decrypt_with_master_keys`] | `aes-gcm` |
//! | Random identifiers | [`random_token`] | `rand` |
//! | PKCE verification | [`pkce_challenge_matches`] | `sha2` + `base64` |
//!
//! Master keys are supplied hex-encoded (32 raw bytes, AES-256). The first
//! configured key encrypts; every configured key is tried on decrypt,
//! oldest-compatible first, so a retired key still opens ciphertext minted
//! under it (spec §6, `SignerConfig::master_keys`).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::errors::SignerError;

const NONCE_LEN: usize = 12;

/// Hashes a plaintext password with bcrypt at the given cost factor.
///
/// Runs on whatever executor calls it; callers on an async runtime should
/// wrap this in `tokio::task::spawn_blocking` since bcrypt is CPU-bound
/// (spec §5).
pub fn hash_password(plaintext: &str, cost: u32) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(plaintext, cost)
}

/// Verifies a plaintext password against a bcrypt hash.
pub fn verify_password(plaintext: &str, hash: &str) -> Result<bool, bcrypt::BcryptError> {
    bcrypt::verify(plaintext, hash)
}

/// Encrypts `plaintext` under the first entry of `master_keys_hex`.
///
/// Output is `nonce || ciphertext`, with a fresh random 96-bit nonce per
/// call (spec §3 `SigningKey::private_params_encrypted`).
pub fn encrypt_with_master_keys(
    plaintext: &[u8],
    master_keys_hex: &[String],
) -> Result<Vec<u8>, SignerError> {
    let active = master_keys_hex
        .first()
        .ok_or_else(|| SignerError::Encryption("no master keys configured".into()))?;
    let key_bytes = decode_master_key(active)
        .map_err(|e| SignerError::Encryption(format!("invalid master key: {e}")))?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| SignerError::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts `ciphertext` (`nonce || body`), trying each configured master
/// key in order until one succeeds.
pub fn decrypt_with_master_keys(
    ciphertext: &[u8],
    master_keys_hex: &[String],
) -> Result<Vec<u8>, SignerError> {
    if ciphertext.len() < NONCE_LEN {
        return Err(SignerError::Decryption("ciphertext too short".into()));
    }
    let (nonce_bytes, body) = ciphertext.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    for key_hex in master_keys_hex {
        let Ok(key_bytes) = decode_master_key(key_hex) else {
            continue;
        };
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        if let Ok(plaintext) = cipher.decrypt(nonce, body) {
            return Ok(plaintext);
        }
    }
    Err(SignerError::Decryption(
        "no configured master key could decrypt ciphertext".into(),
    ))
}

fn decode_master_key(hex_key: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(hex_key).map_err(|e| e.to_string())?;
    bytes
        .try_into()
        .map_err(|_| "master key must decode to exactly 32 bytes".to_string())
}

/// Generates a URL-safe, unpadded random token of `byte_len` bytes of
/// entropy. Used for session ids, auth codes, and refresh-token payloads.
pub fn random_token(byte_len: usize) -> String {
    let mut bytes = vec![0u8; byte_len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Checks a PKCE `code_verifier` against the `code_challenge` stored on the
/// session, per the declared `code_challenge_method` (RFC 7636).
///
/// `"plain"` compares directly; `"S256"` compares against the base64url
/// (no padding) of the SHA-256 digest of the verifier. An unrecognized
/// method always fails closed.
pub fn pkce_challenge_matches(verifier: &str, challenge: &str, method: &str) -> bool {
    match method {
        "plain" => verifier == challenge,
        "S256" => {
            let digest = Sha256::digest(verifier.as_bytes());
            URL_SAFE_NO_PAD.encode(digest) == challenge
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_master_key() -> String {
        hex::encode([7u8; 32])
    }

    #[test]
    fn password_hash_round_trips() {
        let hash = hash_password("correct horse battery staple", 4).unwrap();
        assert!(verify_password("correct horse battery staple", &hash).unwrap());
        assert!(!verify_password("wrong password", &hash).unwrap());
    }

    #[test]
    fn encryption_round_trips_under_same_key() {
        let keys = vec![test_master_key()];
        let ciphertext = encrypt_with_master_keys(b"super secret rsa params", &keys).unwrap();
        let plaintext = decrypt_with_master_keys(&ciphertext, &keys).unwrap();
        assert_eq!(plaintext, b"super secret rsa params");
    }

    #[test]
    fn decryption_tries_older_keys_after_rotation() {
        let old_key = test_master_key();
        let ciphertext = encrypt_with_master_keys(b"data", &[old_key.clone()]).unwrap();

        let new_key = hex::encode([9u8; 32]);
        let keys_after_rotation = vec![new_key, old_key];
        let plaintext = decrypt_with_master_keys(&ciphertext, &keys_after_rotation).unwrap();
        assert_eq!(plaintext, b"data");
    }

    #[test]
    fn decryption_fails_when_no_key_matches() {
        let ciphertext =
            encrypt_with_master_keys(b"data", &[test_master_key()]).unwrap();
        let wrong_keys = vec![hex::encode([1u8; 32])];
        assert!(decrypt_with_master_keys(&ciphertext, &wrong_keys).is_err());
    }

    #[test]
    fn pkce_s256_matches_known_vector() {
        // RFC 7636 appendix B example.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
        assert!(pkce_challenge_matches(verifier, challenge, "S256"));
        assert!(!pkce_challenge_matches("wrong-verifier", challenge, "S256"));
    }

    #[test]
    fn pkce_plain_requires_exact_match() {
        assert!(pkce_challenge_matches("abc", "abc", "plain"));
        assert!(!pkce_challenge_matches("abc", "xyz", "plain"));
    }

    #[test]
    fn pkce_unknown_method_fails_closed() {
        assert!(!pkce_challenge_matches("abc", "abc", "none"));
    }
}
