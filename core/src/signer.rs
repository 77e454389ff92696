//! # Key Rotation & Signer (C2)
//!
//! Owns the identity provider's asymmetric signing key material: one active
//! key used to sign new tokens, plus a bounded window of retired keys kept
//! around purely for verification while outstanding tokens they signed are
//! still live.
//!
//! ## Rotation
//!
//! [`Signer::rotate`] generates a fresh key pair, encrypts the private
//! parameters under the signer's configured master keys ([`crate::crypto`]),
//! persists it via [`SigningKeyStore::put_signing_key`], and demotes the
//! previously-active key by setting its `expires_at` to
//! `now + rotation_interval + token lifetime`, ensuring old tokens stay
//! verifiable past the point their signer stops minting new ones.
//!
//! Rotation is driven by a periodic ticker (spec §6) that calls `rotate`
//! on an interval; a failed rotation is logged and retried next tick, and
//! the currently active key is left untouched so the service keeps
//! functioning through a transient storage outage.
//!
//! ## Bootstrap
//!
//! If storage has no active key when [`Signer::new`] runs, one is minted
//! immediately so `current_signing_key` never returns `None` once
//! construction succeeds.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey};
use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::RsaPrivateKey;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::crypto::{decrypt_with_master_keys, encrypt_with_master_keys};
use crate::errors::{SignerError, StorageResult};
use crate::storage::entities::SigningKey;
use crate::storage::SigningKeyStore;

const RSA_KEY_BITS: usize = 2048;

/// A signing key pair materialized out of storage, ready for use by the
/// token factory (C3).
#[derive(Clone)]
pub struct ActiveKey {
    pub id: String,
    pub algorithm: Algorithm,
    pub encoding_key: Arc<EncodingKey>,
    /// DER-ish PKCS#1 bytes, kept for re-publishing via JWKS.
    pub public_params: Vec<u8>,
}

/// A retired key, usable only to verify tokens it already signed.
#[derive(Clone)]
pub struct VerificationKey {
    pub id: String,
    pub algorithm: Algorithm,
    pub public_params: Vec<u8>,
}

struct KeySet {
    active: Option<ActiveKey>,
    verification: Vec<VerificationKey>,
}

/// Holds the current key set behind a lock and knows how to rotate it.
///
/// One `Signer` is constructed per process and shared via `Arc` with the
/// token factory and the gRPC/HTTP handlers that publish JWKS.
pub struct Signer<S: ?Sized> {
    storage: Arc<S>,
    master_keys: Vec<String>,
    algorithm: Algorithm,
    rotation_interval: Duration,
    token_max_lifetime: Duration,
    keys: RwLock<KeySet>,
}

impl<S: SigningKeyStore + ?Sized> Signer<S> {
    /// Loads the current key set from storage, minting an active key if
    /// none exists yet.
    pub async fn new(
        storage: Arc<S>,
        master_keys: Vec<String>,
        algorithm: &str,
        rotation_interval: Duration,
        token_max_lifetime: Duration,
    ) -> Result<Self, SignerError> {
        let algorithm = parse_algorithm(algorithm);
        let signer = Self {
            storage,
            master_keys,
            algorithm,
            rotation_interval,
            token_max_lifetime,
            keys: RwLock::new(KeySet {
                active: None,
                verification: Vec::new(),
            }),
        };
        signer.reload().await?;
        if signer.keys.read().await.active.is_none() {
            info!("no active signing key found in storage, bootstrapping one");
            signer.rotate().await?;
        }
        Ok(signer)
    }

    /// Re-reads the active and verification keys from storage into memory.
    async fn reload(&self) -> Result<(), SignerError> {
        let stored_active = self.storage.get_active_signing_key().await?;
        let stored_verification = self.storage.list_verification_keys().await?;

        let active = match stored_active {
            Some(key) => Some(self.materialize_active(key)?),
            None => None,
        };
        let verification = stored_verification
            .into_iter()
            .map(|key| VerificationKey {
                id: key.id,
                algorithm: parse_algorithm(&key.algorithm),
                public_params: key.public_params,
            })
            .collect();

        let mut guard = self.keys.write().await;
        guard.active = active;
        guard.verification = verification;
        Ok(())
    }

    fn materialize_active(&self, key: SigningKey) -> Result<ActiveKey, SignerError> {
        let private_der = decrypt_with_master_keys(&key.private_params_encrypted, &self.master_keys)?;
        let encoding_key = match parse_algorithm(&key.algorithm) {
            Algorithm::RS256 => EncodingKey::from_rsa_der(&private_der),
            Algorithm::ES256 => EncodingKey::from_ec_der(&private_der),
            _ => return Err(SignerError::Generation("unsupported algorithm".into())),
        };
        Ok(ActiveKey {
            id: key.id,
            algorithm: parse_algorithm(&key.algorithm),
            encoding_key: Arc::new(encoding_key),
            public_params: key.public_params,
        })
    }

    /// Generates a new key pair, persists it as the active key, and demotes
    /// the previous active key to verification-only.
    pub async fn rotate(&self) -> Result<(), SignerError> {
        let (public_der, private_der) = generate_key_pair(self.algorithm)?;
        let encrypted_private = encrypt_with_master_keys(&private_der, &self.master_keys)?;

        let new_key = SigningKey {
            id: Uuid::new_v4().to_string(),
            algorithm: algorithm_name(self.algorithm).to_string(),
            public_params: public_der,
            private_params_encrypted: encrypted_private,
            created_at: Utc::now(),
            expires_at: None,
        };

        if let Some(previous) = self.storage.get_active_signing_key().await? {
            let demoted = SigningKey {
                expires_at: Some(Utc::now() + self.rotation_interval + self.token_max_lifetime),
                ..previous
            };
            self.storage.put_signing_key(demoted).await?;
        }

        self.storage.put_signing_key(new_key).await?;
        self.reload().await?;
        info!("rotated signing key");
        Ok(())
    }

    /// Removes verification keys whose `expires_at` has passed. Driven by
    /// the same periodic ticker as `rotate` (spec §6).
    pub async fn prune_expired(&self) -> StorageResult<u64> {
        let pruned = self.storage.prune_expired_signing_keys(Utc::now()).await?;
        if pruned > 0 {
            if let Err(err) = self.reload().await {
                warn!(error = %err, "failed to reload key set after pruning");
            }
        }
        Ok(pruned)
    }

    /// Returns the key currently used to sign new tokens.
    pub async fn current_signing_key(&self) -> Result<ActiveKey, SignerError> {
        self.keys
            .read()
            .await
            .active
            .clone()
            .ok_or(SignerError::NoActiveKey)
    }

    /// Returns every key eligible to verify an incoming token: the active
    /// key plus every non-expired retired key.
    pub async fn verification_keys(&self) -> Vec<VerificationKey> {
        let guard = self.keys.read().await;
        let mut keys: Vec<VerificationKey> = guard.verification.clone();
        if let Some(active) = &guard.active {
            keys.push(VerificationKey {
                id: active.id.clone(),
                algorithm: active.algorithm,
                public_params: active.public_params.clone(),
            });
        }
        keys
    }

    /// Timestamp the keyset is considered "fresh" until, for health checks.
    pub fn rotation_interval(&self) -> Duration {
        self.rotation_interval
    }
}

fn parse_algorithm(name: &str) -> Algorithm {
    match name {
        "ES256" => Algorithm::ES256,
        _ => Algorithm::RS256,
    }
}

fn algorithm_name(algorithm: Algorithm) -> &'static str {
    match algorithm {
        Algorithm::ES256 => "ES256",
        _ => "RS256",
    }
}

/// Generates a fresh `(public_der, private_der)` pair for the given
/// algorithm. RS256 uses PKCS#1 DER; ES256 uses a raw P-256 scalar/point
/// encoded as SEC1 DER via the `p256`/`ecdsa` crates.
fn generate_key_pair(algorithm: Algorithm) -> Result<(Vec<u8>, Vec<u8>), SignerError> {
    match algorithm {
        Algorithm::RS256 => {
            let mut rng = rand::thread_rng();
            let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
                .map_err(|e| SignerError::Generation(e.to_string()))?;
            let public_key = private_key.to_public_key();

            let private_der = private_key
                .to_pkcs1_der()
                .map_err(|e| SignerError::Generation(e.to_string()))?
                .as_bytes()
                .to_vec();
            let public_der = public_key
                .to_pkcs1_der()
                .map_err(|e| SignerError::Generation(e.to_string()))?
                .into_vec();
            Ok((public_der, private_der))
        }
        Algorithm::ES256 => {
            use p256::ecdsa::SigningKey as P256SigningKey;
            use p256::pkcs8::{EncodePrivateKey, EncodePublicKey};

            let mut rng = rand::thread_rng();
            let signing_key = P256SigningKey::random(&mut rng);
            let verifying_key = signing_key.verifying_key();

            let private_der = signing_key
                .to_pkcs8_der()
                .map_err(|e| SignerError::Generation(e.to_string()))?
                .as_bytes()
                .to_vec();
            let public_der = verifying_key
                .to_public_key_der()
                .map_err(|e| SignerError::Generation(e.to_string()))?
                .into_vec();
            Ok((public_der, private_der))
        }
        _ => Err(SignerError::Generation(
            "only RS256 and ES256 are supported".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn test_master_keys() -> Vec<String> {
        vec![hex::encode([3u8; 32])]
    }

    #[tokio::test]
    async fn bootstrap_mints_an_active_key_when_storage_is_empty() {
        let storage = Arc::new(MemoryStorage::new());
        let signer = Signer::new(
            storage,
            test_master_keys(),
            "RS256",
            Duration::hours(6),
            Duration::minutes(15),
        )
        .await
        .unwrap();

        let active = signer.current_signing_key().await.unwrap();
        assert_eq!(active.algorithm, Algorithm::RS256);
    }

    #[tokio::test]
    async fn rotate_demotes_previous_key_to_verification_only() {
        let storage = Arc::new(MemoryStorage::new());
        let signer = Signer::new(
            storage,
            test_master_keys(),
            "RS256",
            Duration::hours(6),
            Duration::minutes(15),
        )
        .await
        .unwrap();

        let first_active = signer.current_signing_key().await.unwrap();
        signer.rotate().await.unwrap();
        let second_active = signer.current_signing_key().await.unwrap();

        assert_ne!(first_active.id, second_active.id);
        let verification_ids: Vec<_> = signer
            .verification_keys()
            .await
            .into_iter()
            .map(|k| k.id)
            .collect();
        assert!(verification_ids.contains(&first_active.id));
        assert!(verification_ids.contains(&second_active.id));
    }

    #[tokio::test]
    async fn es256_rotation_also_round_trips() {
        let storage = Arc::new(MemoryStorage::new());
        let signer = Signer::new(
            storage,
            test_master_keys(),
            "ES256",
            Duration::hours(6),
            Duration::minutes(15),
        )
        .await
        .unwrap();
        let active = signer.current_signing_key().await.unwrap();
        assert_eq!(active.algorithm, Algorithm::ES256);
    }
}
