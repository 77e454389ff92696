//! Domain entities persisted by the storage abstraction (spec §3).
//!
//! These are plain data structs; storage adapters own the mapping to their
//! backend representation ([`sqlx::FromRow`] for Postgres, a `HashMap` for
//! the in-memory adapter).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered relying party.
///
/// Invariants: `id` is globally unique; at least one entry in
/// `redirect_uris` unless `device_flow` is `true`; `secret` is opaque bytes
/// (storage-encrypted where the backend supports it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub secret: Option<Vec<u8>>,
    pub redirect_uris: Vec<String>,
    pub logo_url: Option<String>,
    pub name: String,
    /// Other client ids whose audience this client is allowed to assert,
    /// via the `audience:server:client_id:<id>` scope convention.
    pub trusted_peers: Vec<String>,
    pub public: bool,
    pub admin: bool,
    pub device_flow: bool,
}

/// A pairing of upstream connector and the remote-side identifier it issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIdentity {
    pub connector_id: String,
    pub remote_id: String,
}

/// The end user within this IdP.
///
/// Invariants: `id` is stable and never reused; a ⟨connector_id, remote_id⟩
/// pair identifies at most one user; `email` uniqueness is enforced
/// case-insensitively by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub email_verified: bool,
    pub display_name: String,
    pub admin: bool,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
    pub remote_identities: Vec<RemoteIdentity>,
}

/// An optional local credential, keyed by the owning user's email.
///
/// Invariant: at most one `PasswordInfo` per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordInfo {
    pub email: String,
    pub user_id: String,
    pub bcrypt_hash: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A running authorization request (spec §3 "Session").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub connector_id: Option<String>,
    pub redirect_uri: String,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub identity: Option<Identity>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub register: bool,
    pub offline_requested: bool,
    pub consent_granted: bool,
}

/// Identity normalized by a connector, optionally reshaped by the
/// middleware chain (C4/C5).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub preferred_username: String,
    pub email: String,
    pub email_verified: bool,
    pub groups: Vec<String>,
    pub custom_claims: HashMap<String, serde_json::Value>,
    /// Opaque bytes the connector wants persisted on a refresh token and
    /// handed back verbatim on refresh.
    pub connector_data: Vec<u8>,
}

/// A one-shot bearer redeemable once at the token endpoint.
///
/// Invariant: after first successful redemption, any further redemption
/// must fail — enforced by storage via atomic fetch-and-delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCode {
    pub code: String,
    pub session_id: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A long-lived bearer for re-authentication at a specific client.
///
/// Invariant: at most one payload hash is valid for a given `id` at any
/// time; rotation overwrites it in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    pub id: i64,
    pub payload_hash: Vec<u8>,
    /// Hash of the payload prior to the most recent rotation, retained for
    /// a short replay window to power theft detection.
    pub previous_payload_hash: Option<Vec<u8>>,
    pub client_id: String,
    pub user_id: String,
    pub scopes: Vec<String>,
    pub connector_id: String,
    pub connector_data: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// An asymmetric signing key pair (spec §3 "SigningKey").
///
/// `private_params_encrypted` is AES-GCM ciphertext (96-bit random nonce
/// prepended) under one of the signer's configured master keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningKey {
    pub id: String,
    pub algorithm: String,
    pub public_params: Vec<u8>,
    pub private_params_encrypted: Vec<u8>,
    pub created_at: DateTime<Utc>,
    /// `None` for the active key; set when demoted to verification-only.
    pub expires_at: Option<DateTime<Utc>>,
}

/// State for one in-flight device-authorization grant (RFC 8628).
///
/// `user_code` is what the end user types in at the verification page;
/// `device_code` is what the polling device holds and exchanges at
/// `/token` once `approved == Some(true)`. Invariant: both codes are
/// globally unique and each identifies at most one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_poll_at: Option<DateTime<Utc>>,
    /// `None` while awaiting the user's decision; `Some(true)`/`Some(false)`
    /// once they approve or deny it at the verification page.
    pub approved: Option<bool>,
    pub identity: Option<Identity>,
}

/// Serialized description of an upstream identity source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub id: String,
    pub connector_type: String,
    pub config: Vec<u8>,
}
