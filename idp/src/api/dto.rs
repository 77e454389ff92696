//! # Wire Types
//!
//! Request/response shapes for the HTTP surface: the authorization and
//! token endpoints speak the vocabulary RFC 6749/OIDC Core define (snake_case
//! query/form fields, `snake_case` JSON), not a frontend-facing convention.
//!
//! The interactive steps this service exposes as JSON rather than rendered
//! HTML (connector choice, consent) are a deliberate simplification: login
//! and consent templates are somebody else's concern, layered in front of
//! this service's redirect/JSON contract.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// AUTHORIZATION ENDPOINT
// =============================================================================

/// Query parameters accepted by `GET /auth` and `GET /auth/{connector_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeQuery {
    pub client_id: String,
    pub redirect_uri: String,
    pub response_type: String,
    pub scope: String,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorOption {
    pub id: String,
}

/// Returned when more than one connector is configured and the caller must
/// choose before dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorChoiceResponse {
    pub session_id: String,
    pub connectors: Vec<ConnectorOption>,
}

/// Returned once a connector has been selected (explicitly, by the sole
/// configured connector, or via `GET /auth/{connector_id}`).
///
/// `redirect_url` is set for redirect-capable connectors, the user agent's
/// next hop. Password connectors leave it `None`; the caller is expected to
/// `POST` credentials to `/callback/{connector_id}` instead.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchResponse {
    pub session_id: String,
    pub connector_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

// =============================================================================
// CALLBACK ENDPOINT
// =============================================================================

/// Credentials posted to `POST /callback/{connector_id}` for password
/// connectors. `session_id` round-trips the same way a redirect connector's
/// `state` parameter does.
#[derive(Debug, Clone, Deserialize)]
pub struct PasswordCallbackRequest {
    pub session_id: String,
    pub username: String,
    pub password: String,
}

/// Raw query parameters a redirect connector's callback is invoked with.
/// Carried through as an opaque bag since each connector type defines its
/// own parameter vocabulary beyond the common `code`/`state`.
pub type RedirectCallbackQuery = HashMap<String, String>;

/// Shape returned once a callback resolves an identity: either consent is
/// still needed, or (public/trusted clients) a code has already been minted
/// and the caller should redirect to `redirect_uri`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallbackResponse {
    AwaitingConsent { session_id: String },
    Redirect { redirect_uri: String },
}

// =============================================================================
// APPROVAL (CONSENT) ENDPOINT
// =============================================================================

/// `POST /approval` body. Exactly one of `session_id` (authorization-code
/// flow) or `user_code` (device flow) is expected to be set.
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_code: Option<String>,
    pub approved: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApprovalResponse {
    Redirect { redirect_uri: String },
    Denied,
    Approved,
}

// =============================================================================
// TOKEN ENDPOINT
// =============================================================================

/// `POST /token` form body. Fields are a union across every supported grant
/// type (spec §6); handlers read only the ones their `grant_type` defines.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenRequest {
    pub grant_type: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub code_verifier: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub device_code: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub scope: String,
}

// =============================================================================
// DEVICE FLOW (RFC 8628)
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeRequest {
    pub client_id: String,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_uri_complete: Option<String>,
    pub expires_in: i64,
    pub interval: i64,
}

// =============================================================================
// USERINFO
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct UserInfoResponse {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
}

// =============================================================================
// DISCOVERY
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub jwks_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_authorization_endpoint: Option<String>,
    pub response_types_supported: Vec<&'static str>,
    pub subject_types_supported: Vec<&'static str>,
    pub id_token_signing_alg_values_supported: Vec<String>,
    pub scopes_supported: Vec<&'static str>,
    pub token_endpoint_auth_methods_supported: Vec<&'static str>,
    pub grant_types_supported: Vec<&'static str>,
    pub claims_supported: Vec<&'static str>,
    pub code_challenge_methods_supported: Vec<&'static str>,
}

// =============================================================================
// MISC
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_response_tags_awaiting_consent() {
        let response = CallbackResponse::AwaitingConsent {
            session_id: "s1".into(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"awaiting_consent\""));
        assert!(json.contains("\"session_id\":\"s1\""));
    }

    #[test]
    fn token_response_omits_absent_refresh_token() {
        let response = TokenResponse {
            access_token: "at".into(),
            token_type: "Bearer",
            expires_in: 900,
            id_token: Some("it".into()),
            refresh_token: None,
            scope: "openid".into(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("refresh_token"));
    }

    #[test]
    fn token_request_defaults_absent_fields() {
        let json = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": "42 abc",
        });
        let parsed: TokenRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.grant_type, "refresh_token");
        assert_eq!(parsed.refresh_token.as_deref(), Some("42 abc"));
        assert!(parsed.code.is_none());
    }
}
