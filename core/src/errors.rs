//! # Core Error Taxonomy
//!
//! Each subsystem (storage, signer, token verifier, connectors, middleware)
//! gets its own distinct error enum rather than one grab-bag type — callers
//! match on kind, never on a formatted string.
//!
//! ## Design Philosophy
//!
//! This follows the "make illegal states unrepresentable" principle: a
//! `StorageError::NotFound` and a `TokenError::Expired` are different shapes
//! of failure handled at different layers, so they stay different types.
//! The `idp` crate's HTTP-facing `ApiError` composes these via `#[from]`
//! and maps them onto the RFC 6749 error vocabulary at the boundary.
//!
//! ## Error Categories
//!
//! | Type | Owner | Used by |
//! |------|-------|---------|
//! | [`StorageError`] | C1 | every repository method |
//! | [`SignerError`] | C2 | key rotation, at-rest encryption |
//! | [`TokenError`] | C3 | JWT signing/verification |
//! | [`ConnectorError`] | C4 | upstream identity resolution |
//! | [`MiddlewareError`] | C5 | claims/groups/gRPC transforms |

use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by the storage abstraction (C1 §4.1).
///
/// Distinct kinds, never string-matched. `Conflict` is retried by callers
/// with jittered backoff before being surfaced further up as `Internal`.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No record matches the requested id/key.
    #[error("not found")]
    NotFound,

    /// A `create` would violate the entity's id uniqueness constraint.
    #[error("duplicate id")]
    DuplicateId,

    /// A `create`/`update` would violate email uniqueness (fold-case compared).
    #[error("duplicate email")]
    DuplicateEmail,

    /// A `create` would bind a ⟨connector-id, remote-id⟩ pair already owned
    /// by another user.
    #[error("duplicate remote identity")]
    DuplicateRemoteIdentity,

    /// Caller-supplied argument fails a storage-level invariant (e.g. a
    /// client with zero redirect URIs and `device_flow = false`).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A concurrent writer won the race; the operation is retriable.
    #[error("write conflict")]
    Conflict,

    /// Backend-level failure with no more specific classification.
    #[error("internal storage error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StorageError::NotFound,
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    // Postgres: 23505 = unique_violation, 40001 = serialization_failure
                    match code.as_ref() {
                        "23505" => StorageError::Conflict,
                        "40001" => StorageError::Conflict,
                        _ => StorageError::Internal(db_err.to_string()),
                    }
                } else {
                    StorageError::Internal(db_err.to_string())
                }
            }
            other => StorageError::Internal(other.to_string()),
        }
    }
}

/// Errors from the key rotation / signer subsystem (C2 §4.2).
#[derive(Debug, Error)]
pub enum SignerError {
    /// Asymmetric key-pair generation failed.
    #[error("key generation failed: {0}")]
    Generation(String),

    /// AES-GCM encryption of private key material failed.
    #[error("key encryption failed: {0}")]
    Encryption(String),

    /// AES-GCM decryption failed against every configured master key.
    #[error("key decryption failed: {0}")]
    Decryption(String),

    /// No active signing key is available (should not happen once bootstrapped).
    #[error("no active signing key")]
    NoActiveKey,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result alias for token operations.
pub type TokenResult<T> = Result<T, TokenError>;

/// Classified JWT verification failures (C3 §4.3).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,

    #[error("signature verification failed")]
    Signature,

    #[error("issuer mismatch")]
    Issuer,

    #[error("audience mismatch")]
    Audience,

    #[error("malformed token")]
    Malformed,
}

/// Errors from an upstream identity connector (C4 §4.4).
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("connector {connector_id} failed: {detail}")]
    Failure {
        connector_id: String,
        detail: String,
    },

    #[error("connector not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from the claims/groups/gRPC middleware pipeline (C5 §4.5).
#[derive(Debug, Error)]
pub enum MiddlewareError {
    /// The gRPC middleware's negotiated remote API version is below the
    /// pinned minimum; the pipeline fails closed.
    #[error("incompatible middleware version: remote={remote}, minimum required={minimum}")]
    IncompatibleVersion { remote: u32, minimum: u32 },

    #[error("middleware failure: {0}")]
    Failure(String),

    #[error("invalid regex in middleware config: {0}")]
    InvalidPattern(#[from] regex::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_distinct_kinds() {
        assert!(matches!(StorageError::NotFound, StorageError::NotFound));
        assert!(!matches!(StorageError::NotFound, StorageError::Conflict));
    }

    #[test]
    fn sqlx_row_not_found_maps_to_not_found() {
        let err: StorageError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StorageError::NotFound));
    }

    #[test]
    fn token_error_variants_are_comparable() {
        assert_eq!(TokenError::Expired, TokenError::Expired);
        assert_ne!(TokenError::Expired, TokenError::Signature);
    }
}
