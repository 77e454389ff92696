//! # HTTP/gRPC Error Taxonomy
//!
//! One `thiserror`-derived enum covers everything the authorization state
//! machine (C6), refresh-token service (C7), password service (C8), and the
//! discovery/userinfo handlers (C9) can fail with. It composes the
//! finer-grained `fedid_core` error types via `#[from]` and maps onto the
//! RFC 6749 §5.2 error vocabulary at the HTTP boundary.
//!
//! ## Propagation policy
//!
//! - Validation errors at `/auth` redirect back to the client with
//!   `error=...` once the redirect URI itself has been validated;
//!   otherwise an HTML error page renders (no safe redirect target yet).
//! - Validation errors at `/token` return JSON with HTTP 400.
//! - `InvalidClient` returns 401 with `WWW-Authenticate: Basic`.
//! - Connector failures are logged with the connector id and surfaced to
//!   the user as `AccessDenied`, never leaking upstream detail.

use actix_web::{http::header, http::StatusCode, HttpResponse, ResponseError};
use fedid_core::errors::{ConnectorError, MiddlewareError, SignerError, StorageError, TokenError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    // ---- Input errors ----
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid client")]
    InvalidClient,
    #[error("invalid grant: {0}")]
    InvalidGrant(String),
    #[error("invalid scope: {0}")]
    InvalidScope(String),
    #[error("unsupported grant type: {0}")]
    UnsupportedGrantType(String),
    #[error("invalid redirect uri")]
    InvalidRedirectUri,

    // ---- Device flow (RFC 8628) ----
    #[error("authorization pending")]
    DeviceAuthorizationPending,
    #[error("slow down")]
    DeviceSlowDown,
    #[error("device code expired")]
    DeviceCodeExpired,

    // ---- Authentication errors ----
    #[error("access denied")]
    AccessDenied,
    #[error("login required")]
    LoginRequired,
    #[error("token expired")]
    ExpiredToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("invalid signature")]
    InvalidSignature,

    // ---- Storage errors ----
    #[error("not found")]
    NotFound,
    #[error("duplicate id")]
    DuplicateId,
    #[error("duplicate email")]
    DuplicateEmail,
    #[error("duplicate remote identity")]
    DuplicateRemoteIdentity,
    #[error("write conflict")]
    Conflict,

    // ---- Upstream errors ----
    #[error("connector failure")]
    ConnectorFailure,
    #[error("middleware failure: {0}")]
    MiddlewareFailure(String),
    #[error("incompatible middleware version")]
    IncompatibleMiddlewareVersion,

    // ---- Fatal ----
    #[error("internal error: {0}")]
    Internal(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => ApiError::NotFound,
            StorageError::DuplicateId => ApiError::DuplicateId,
            StorageError::DuplicateEmail => ApiError::DuplicateEmail,
            StorageError::DuplicateRemoteIdentity => ApiError::DuplicateRemoteIdentity,
            StorageError::InvalidArgument(msg) => ApiError::InvalidRequest(msg),
            StorageError::Conflict => ApiError::Conflict,
            StorageError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<SignerError> for ApiError {
    fn from(err: SignerError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => ApiError::ExpiredToken,
            TokenError::Signature => ApiError::InvalidSignature,
            TokenError::Issuer | TokenError::Audience | TokenError::Malformed => {
                ApiError::InvalidToken
            }
        }
    }
}

impl From<ConnectorError> for ApiError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::InvalidCredentials => ApiError::AccessDenied,
            ConnectorError::Failure {
                connector_id,
                detail,
            } => {
                tracing::warn!(connector_id = %connector_id, detail = %detail, "connector failure");
                ApiError::ConnectorFailure
            }
            ConnectorError::NotFound(id) => ApiError::InvalidRequest(format!("unknown connector: {id}")),
            ConnectorError::Storage(e) => e.into(),
        }
    }
}

impl From<MiddlewareError> for ApiError {
    fn from(err: MiddlewareError) -> Self {
        match err {
            MiddlewareError::IncompatibleVersion { .. } => ApiError::IncompatibleMiddlewareVersion,
            MiddlewareError::Failure(msg) => ApiError::MiddlewareFailure(msg),
            MiddlewareError::InvalidPattern(e) => ApiError::Configuration(e.to_string()),
        }
    }
}

impl From<bcrypt::BcryptError> for ApiError {
    fn from(err: bcrypt::BcryptError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        ApiError::InvalidRequest(err.to_string())
    }
}

/// RFC 6749 §5.2 error response shape.
#[derive(Debug, Serialize)]
pub struct OAuthErrorBody {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl ApiError {
    /// The RFC 6749 `error` code this variant maps onto.
    pub fn oauth_code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::InvalidClient => "invalid_client",
            ApiError::InvalidGrant(_) => "invalid_grant",
            ApiError::InvalidScope(_) => "invalid_scope",
            ApiError::UnsupportedGrantType(_) => "unsupported_grant_type",
            ApiError::InvalidRedirectUri => "invalid_request",
            ApiError::DeviceAuthorizationPending => "authorization_pending",
            ApiError::DeviceSlowDown => "slow_down",
            ApiError::DeviceCodeExpired => "expired_token",
            ApiError::AccessDenied => "access_denied",
            ApiError::LoginRequired => "login_required",
            ApiError::ExpiredToken | ApiError::InvalidToken | ApiError::InvalidSignature => {
                "invalid_token"
            }
            ApiError::NotFound => "invalid_request",
            ApiError::DuplicateId | ApiError::DuplicateEmail | ApiError::DuplicateRemoteIdentity => {
                "invalid_request"
            }
            ApiError::Conflict => "temporarily_unavailable",
            ApiError::ConnectorFailure => "access_denied",
            ApiError::MiddlewareFailure(_) | ApiError::IncompatibleMiddlewareVersion => {
                "server_error"
            }
            ApiError::Internal(_) | ApiError::Configuration(_) => "server_error",
        }
    }

    fn description(&self) -> Option<String> {
        match self {
            ApiError::Internal(_) | ApiError::Configuration(_) => None,
            other => Some(other.to_string()),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidClient => StatusCode::UNAUTHORIZED,
            ApiError::ExpiredToken | ApiError::InvalidToken | ApiError::InvalidSignature => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) | ApiError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = OAuthErrorBody {
            error: self.oauth_code(),
            error_description: self.description(),
        };
        let mut builder = HttpResponse::build(self.status_code());
        if matches!(self, ApiError::InvalidClient) {
            builder.insert_header((header::WWW_AUTHENTICATE, "Basic"));
        }
        builder.json(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_client_maps_to_401_with_basic_challenge() {
        let err = ApiError::InvalidClient;
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.oauth_code(), "invalid_client");
    }

    #[test]
    fn storage_not_found_maps_to_invalid_request_oauth_code() {
        let err: ApiError = StorageError::NotFound.into();
        assert!(matches!(err, ApiError::NotFound));
    }

    #[test]
    fn token_expired_maps_through() {
        let err: ApiError = TokenError::Expired.into();
        assert!(matches!(err, ApiError::ExpiredToken));
        assert_eq!(err.oauth_code(), "invalid_token");
    }
}
