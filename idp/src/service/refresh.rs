//! # Refresh-Token Service (C7)
//!
//! Issues, rotates, validates, and revokes refresh tokens. The wire form is
//! `<decimal id><space><base64url-nopad payload>` (spec §6); the id keys a
//! storage row carrying the current payload hash, granted scopes, and the
//! connector data needed to re-resolve the identity on refresh.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use sha2::{Digest, Sha256};

use fedid_core::crypto::random_token;
use fedid_core::errors::StorageError;
use fedid_core::storage::entities::RefreshToken;
use fedid_core::storage::{RefreshTokenStore, Storage};

use crate::error::ApiError;

const PAYLOAD_BYTES: usize = 32;
const WIRE_SEPARATOR: char = ' ';

/// Inputs needed to mint a fresh refresh token at code-redemption time.
pub struct IssueRequest {
    pub client_id: String,
    pub user_id: String,
    pub scopes: Vec<String>,
    pub connector_id: String,
    pub connector_data: Vec<u8>,
}

/// Outcome of a successful redemption: a new wire token plus the stored
/// record, from which the caller re-mints an ID token.
pub struct RedeemOutcome {
    pub wire_token: String,
    pub record: RefreshToken,
}

pub struct RefreshTokenService<S: ?Sized> {
    storage: Arc<S>,
}

impl<S: Storage + ?Sized> RefreshTokenService<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    pub async fn issue(&self, request: IssueRequest) -> Result<String, ApiError> {
        let payload = random_token(PAYLOAD_BYTES);
        let payload_hash = hash_payload(&payload);
        let now = Utc::now();

        let record = RefreshToken {
            id: 0, // storage assigns the real id
            payload_hash,
            previous_payload_hash: None,
            client_id: request.client_id,
            user_id: request.user_id,
            scopes: request.scopes,
            connector_id: request.connector_id,
            connector_data: request.connector_data,
            created_at: now,
            last_used_at: now,
        };
        let id = self.storage.create_refresh_token(record).await?;
        Ok(encode_wire_token(id, &payload))
    }

    /// Parses, validates, and rotates a presented wire token. The rotated
    /// record is persisted before this returns; the caller is responsible
    /// for minting a fresh ID token from `record`.
    pub async fn redeem(
        &self,
        wire_token: &str,
        client_id: &str,
        requested_scopes: Option<&[String]>,
    ) -> Result<RedeemOutcome, ApiError> {
        let (id, payload) = decode_wire_token(wire_token)
            .ok_or_else(|| ApiError::InvalidGrant("malformed refresh token".into()))?;

        let record = self
            .storage
            .get_refresh_token(id)
            .await
            .map_err(|_| ApiError::InvalidGrant("unknown refresh token".into()))?;

        if record.client_id != client_id {
            return Err(ApiError::InvalidClient);
        }

        let presented_hash = hash_payload(&payload);
        if !constant_time_eq(&presented_hash, &record.payload_hash) {
            // Stale payload presented: if it matches what we rotated away
            // from last time, treat this as a theft signal.
            if record
                .previous_payload_hash
                .as_ref()
                .is_some_and(|prev| constant_time_eq(&presented_hash, prev))
            {
                self.storage
                    .revoke_for_client(&record.user_id, &record.client_id)
                    .await?;
            }
            return Err(ApiError::InvalidGrant("stale refresh token".into()));
        }

        let scopes = match requested_scopes {
            Some(requested) => {
                if requested.iter().any(|s| !record.scopes.contains(s)) {
                    return Err(ApiError::InvalidScope(
                        "requested scope exceeds granted scope".into(),
                    ));
                }
                requested.to_vec()
            }
            None => record.scopes.clone(),
        };

        let new_payload = random_token(PAYLOAD_BYTES);
        let new_hash = hash_payload(&new_payload);
        let rotated = RefreshToken {
            payload_hash: new_hash,
            previous_payload_hash: Some(record.payload_hash.clone()),
            scopes,
            last_used_at: Utc::now(),
            ..record.clone()
        };
        self.storage.update_refresh_token(rotated.clone()).await?;

        Ok(RedeemOutcome {
            wire_token: encode_wire_token(id, &new_payload),
            record: rotated,
        })
    }

    pub async fn revoke_for_client(&self, user_id: &str, client_id: &str) -> Result<u64, ApiError> {
        Ok(self.storage.revoke_for_client(user_id, client_id).await?)
    }

    pub async fn list_clients_with_refresh_tokens(&self, user_id: &str) -> Result<Vec<String>, ApiError> {
        Ok(self.storage.list_clients_with_refresh_tokens(user_id).await?)
    }

    pub async fn sweep_expired(&self, refresh_token_lifetime_seconds: i64) -> Result<u64, StorageError> {
        if refresh_token_lifetime_seconds <= 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - chrono::Duration::seconds(refresh_token_lifetime_seconds);
        self.storage.delete_expired_refresh_tokens(cutoff).await
    }
}

fn hash_payload(payload: &str) -> Vec<u8> {
    Sha256::digest(payload.as_bytes()).to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn encode_wire_token(id: i64, payload: &str) -> String {
    format!("{id}{WIRE_SEPARATOR}{payload}")
}

fn decode_wire_token(wire: &str) -> Option<(i64, String)> {
    let (id_part, payload_part) = wire.split_once(WIRE_SEPARATOR)?;
    let id: i64 = id_part.parse().ok()?;
    if id < 0 {
        return None;
    }
    URL_SAFE_NO_PAD.decode(payload_part).ok()?;
    Some((id, payload_part.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedid_core::storage::memory::MemoryStorage;

    fn issue_request() -> IssueRequest {
        IssueRequest {
            client_id: "example-app".into(),
            user_id: "user-1".into(),
            scopes: vec!["openid".into(), "offline_access".into()],
            connector_id: "local".into(),
            connector_data: vec![],
        }
    }

    #[tokio::test]
    async fn issue_then_redeem_rotates_wire_token() {
        let storage = Arc::new(MemoryStorage::new());
        let service = RefreshTokenService::new(storage);

        let first = service.issue(issue_request()).await.unwrap();
        let outcome = service.redeem(&first, "example-app", None).await.unwrap();

        assert_ne!(outcome.wire_token, first);
        assert_eq!(outcome.record.user_id, "user-1");
    }

    #[tokio::test]
    async fn replaying_rotated_token_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let service = RefreshTokenService::new(storage);

        let first = service.issue(issue_request()).await.unwrap();
        let _second = service.redeem(&first, "example-app", None).await.unwrap();

        let replay = service.redeem(&first, "example-app", None).await;
        assert!(matches!(replay, Err(ApiError::InvalidGrant(_))));
    }

    #[tokio::test]
    async fn replay_detection_revokes_all_tokens_for_user_client() {
        let storage = Arc::new(MemoryStorage::new());
        let service = RefreshTokenService::new(storage.clone());

        let first = service.issue(issue_request()).await.unwrap();
        let second = service.redeem(&first, "example-app", None).await.unwrap();

        // Replaying the stale `first` token should wipe out `second` too.
        let _ = service.redeem(&first, "example-app", None).await;

        let replay_of_second = service.redeem(&second.wire_token, "example-app", None).await;
        assert!(replay_of_second.is_err());
    }

    #[tokio::test]
    async fn redeem_rejects_mismatched_client() {
        let storage = Arc::new(MemoryStorage::new());
        let service = RefreshTokenService::new(storage);
        let token = service.issue(issue_request()).await.unwrap();

        let result = service.redeem(&token, "other-client", None).await;
        assert!(matches!(result, Err(ApiError::InvalidClient)));
    }

    #[tokio::test]
    async fn requested_scope_superset_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let service = RefreshTokenService::new(storage);
        let token = service.issue(issue_request()).await.unwrap();

        let result = service
            .redeem(&token, "example-app", Some(&["admin".to_string()]))
            .await;
        assert!(matches!(result, Err(ApiError::InvalidScope(_))));
    }

    #[tokio::test]
    async fn malformed_wire_token_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let service = RefreshTokenService::new(storage);
        let result = service.redeem("not-a-token", "example-app", None).await;
        assert!(matches!(result, Err(ApiError::InvalidGrant(_))));
    }

    #[test]
    fn wire_token_round_trips_for_nonnegative_ids() {
        let encoded = encode_wire_token(42, "abcXYZ");
        assert_eq!(encoded, "42 abcXYZ");
        let (id, payload) = decode_wire_token(&encoded).unwrap();
        assert_eq!(id, 42);
        assert_eq!(payload, "abcXYZ");
    }
}
