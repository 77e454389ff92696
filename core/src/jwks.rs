//! # JWK Set Publication
//!
//! Turns the verification keys held by [`crate::signer::Signer`] into the
//! `keys` array served at `/keys` (spec §4.9), per RFC 7517. RSA keys are
//! re-parsed from their stored PKCS#1 DER via the `rsa` crate to recover
//! `n`/`e`; EC keys via `p256`'s SEC1/PKCS8 decoder to recover `x`/`y`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::Algorithm;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use serde::Serialize;

use crate::signer::VerificationKey;

#[derive(Debug, Serialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    #[serde(rename = "RSA")]
    Rsa {
        #[serde(rename = "use")]
        use_: &'static str,
        alg: &'static str,
        kid: String,
        n: String,
        e: String,
    },
    #[serde(rename = "EC")]
    Ec {
        #[serde(rename = "use")]
        use_: &'static str,
        alg: &'static str,
        kid: String,
        crv: &'static str,
        x: String,
        y: String,
    },
}

#[derive(Debug, Serialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// Converts one verification key to its published JWK form. Returns `None`
/// if the stored public parameters can't be parsed (a corrupt row should
/// never block publishing the rest of the set).
pub fn to_jwk(key: &VerificationKey) -> Option<Jwk> {
    match key.algorithm {
        Algorithm::RS256 => rsa_jwk(key),
        Algorithm::ES256 => ec_jwk(key),
        _ => None,
    }
}

pub fn build_jwk_set(keys: &[VerificationKey]) -> JwkSet {
    JwkSet {
        keys: keys.iter().filter_map(to_jwk).collect(),
    }
}

fn rsa_jwk(key: &VerificationKey) -> Option<Jwk> {
    use rsa::pkcs1::DecodeRsaPublicKey;
    let public_key = RsaPublicKey::from_pkcs1_der(&key.public_params).ok()?;
    Some(Jwk::Rsa {
        use_: "sig",
        alg: "RS256",
        kid: key.id.clone(),
        n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
        e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
    })
}

fn ec_jwk(key: &VerificationKey) -> Option<Jwk> {
    use p256::pkcs8::DecodePublicKey;
    use p256::PublicKey;

    let public_key = PublicKey::from_public_key_der(&key.public_params).ok()?;
    let point = public_key.to_encoded_point(false);
    let x = point.x()?;
    let y = point.y()?;
    Some(Jwk::Ec {
        use_: "sig",
        alg: "ES256",
        kid: key.id.clone(),
        crv: "P-256",
        x: URL_SAFE_NO_PAD.encode(x),
        y: URL_SAFE_NO_PAD.encode(y),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::Signer;
    use crate::storage::memory::MemoryStorage;
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn rsa_verification_key_converts_to_rsa_jwk() {
        let storage = Arc::new(MemoryStorage::new());
        let signer = Signer::new(
            storage,
            vec![hex::encode([2u8; 32])],
            "RS256",
            Duration::hours(6),
            Duration::minutes(15),
        )
        .await
        .unwrap();

        let keys = signer.verification_keys().await;
        let set = build_jwk_set(&keys);
        assert_eq!(set.keys.len(), 1);
        assert!(matches!(set.keys[0], Jwk::Rsa { .. }));
    }

    #[tokio::test]
    async fn es256_verification_key_converts_to_ec_jwk() {
        let storage = Arc::new(MemoryStorage::new());
        let signer = Signer::new(
            storage,
            vec![hex::encode([4u8; 32])],
            "ES256",
            Duration::hours(6),
            Duration::minutes(15),
        )
        .await
        .unwrap();

        let keys = signer.verification_keys().await;
        let set = build_jwk_set(&keys);
        assert_eq!(set.keys.len(), 1);
        assert!(matches!(set.keys[0], Jwk::Ec { .. }));
    }
}
