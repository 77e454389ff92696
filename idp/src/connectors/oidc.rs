//! # Upstream OIDC Redirect Connector
//!
//! A [`RedirectConnector`] for a generic upstream OpenID Connect provider:
//! builds the authorization URL, and on callback exchanges the returned
//! `code` for tokens at the upstream token endpoint via `reqwest`, then
//! decodes the returned ID Token's claims without re-verifying its
//! signature. The TLS channel to the upstream token endpoint is the trust
//! boundary here, the same assumption RFC 6749's authorization-code grant
//! makes of the client/AS channel.
//!
//! The upstream's `authorization_endpoint` and `token_endpoint` are read
//! directly from the persisted connector config rather than discovered live
//! from `/.well-known/openid-configuration`, since [`ConnectorFactory::build`]
//! is synchronous.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

use fedid_core::connector::{
    AnyConnector, Connector, ConnectorCapability, ConnectorFactory, RedirectConnector,
};
use fedid_core::errors::ConnectorError;
use fedid_core::storage::entities::{ConnectorConfig, Identity};

const CONNECTOR_TYPE: &str = "oidc";
const CAPABILITIES: &[ConnectorCapability] = &[ConnectorCapability::Redirect, ConnectorCapability::Callback];

#[derive(Debug, Clone, Deserialize)]
struct OidcConnectorSettings {
    #[allow(dead_code)]
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    client_id: String,
    client_secret: String,
    #[serde(default = "default_scope")]
    scope: String,
}

fn default_scope() -> String {
    "openid email profile".to_string()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<bool>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

pub struct OidcRedirectConnector {
    id: String,
    settings: OidcConnectorSettings,
    http: reqwest::Client,
}

impl OidcRedirectConnector {
    fn new(id: String, settings: OidcConnectorSettings) -> Self {
        Self {
            id,
            settings,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Connector for OidcRedirectConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[ConnectorCapability] {
        CAPABILITIES
    }
}

#[async_trait]
impl RedirectConnector for OidcRedirectConnector {
    async fn login_url(&self, callback_url: &str, state: &str) -> Result<String, ConnectorError> {
        let mut url = url::Url::parse(&self.settings.authorization_endpoint).map_err(|e| {
            ConnectorError::Failure {
                connector_id: self.id.clone(),
                detail: e.to_string(),
            }
        })?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.settings.client_id)
            .append_pair("redirect_uri", callback_url)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.settings.scope)
            .append_pair("state", state);
        Ok(url.to_string())
    }

    async fn handle_callback(&self, query: &HashMap<String, String>) -> Result<Identity, ConnectorError> {
        let code = query.get("code").ok_or_else(|| ConnectorError::Failure {
            connector_id: self.id.clone(),
            detail: "callback missing code".into(),
        })?;
        let callback_url = query.get("redirect_uri").cloned().unwrap_or_default();

        let response = self
            .http
            .post(&self.settings.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("redirect_uri", callback_url.as_str()),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ConnectorError::Failure {
                connector_id: self.id.clone(),
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ConnectorError::Failure {
                connector_id: self.id.clone(),
                detail: format!("token exchange failed with status {}", response.status()),
            });
        }

        let body: TokenResponse = response.json().await.map_err(|e| ConnectorError::Failure {
            connector_id: self.id.clone(),
            detail: e.to_string(),
        })?;

        let claims = decode_id_token_claims(&body.id_token).map_err(|detail| ConnectorError::Failure {
            connector_id: self.id.clone(),
            detail,
        })?;

        let preferred_username = claims
            .preferred_username
            .or(claims.name)
            .unwrap_or_else(|| claims.sub.clone());

        Ok(Identity {
            user_id: claims.sub,
            username: preferred_username.clone(),
            preferred_username,
            email: claims.email.unwrap_or_default(),
            email_verified: claims.email_verified.unwrap_or(false),
            groups: vec![],
            custom_claims: HashMap::new(),
            connector_data: body.refresh_token.unwrap_or_default().into_bytes(),
        })
    }

    async fn refresh(&self, connector_data: &[u8]) -> Result<Identity, ConnectorError> {
        if connector_data.is_empty() {
            return Err(ConnectorError::Failure {
                connector_id: self.id.clone(),
                detail: "no upstream refresh token stored for this connector_data".into(),
            });
        }
        let upstream_refresh_token = String::from_utf8_lossy(connector_data).into_owned();

        let response = self
            .http
            .post(&self.settings.token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", upstream_refresh_token.as_str()),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ConnectorError::Failure {
                connector_id: self.id.clone(),
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ConnectorError::Failure {
                connector_id: self.id.clone(),
                detail: format!("upstream refresh failed with status {}", response.status()),
            });
        }

        let body: TokenResponse = response.json().await.map_err(|e| ConnectorError::Failure {
            connector_id: self.id.clone(),
            detail: e.to_string(),
        })?;

        let claims = decode_id_token_claims(&body.id_token).map_err(|detail| ConnectorError::Failure {
            connector_id: self.id.clone(),
            detail,
        })?;

        let preferred_username = claims
            .preferred_username
            .or(claims.name)
            .unwrap_or_else(|| claims.sub.clone());

        Ok(Identity {
            user_id: claims.sub,
            username: preferred_username.clone(),
            preferred_username,
            email: claims.email.unwrap_or_default(),
            email_verified: claims.email_verified.unwrap_or(false),
            groups: vec![],
            custom_claims: HashMap::new(),
            // The upstream provider may or may not rotate its own refresh
            // token; fall back to the one we were handed if it didn't.
            connector_data: body
                .refresh_token
                .unwrap_or(upstream_refresh_token)
                .into_bytes(),
        })
    }
}

fn decode_id_token_claims(id_token: &str) -> Result<UpstreamClaims, String> {
    let payload = id_token.split('.').nth(1).ok_or_else(|| "malformed id_token".to_string())?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|e| e.to_string())?;
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

/// Builds an [`OidcRedirectConnector`] from a persisted connector config
/// whose `config` bytes decode as [`OidcConnectorSettings`] JSON.
pub struct OidcConnectorFactory;

impl ConnectorFactory for OidcConnectorFactory {
    fn connector_type(&self) -> &'static str {
        CONNECTOR_TYPE
    }

    fn build(&self, config: &ConnectorConfig) -> Result<AnyConnector, ConnectorError> {
        let settings: OidcConnectorSettings = serde_json::from_slice(&config.config).map_err(|e| {
            ConnectorError::Failure {
                connector_id: config.id.clone(),
                detail: format!("invalid oidc connector config: {e}"),
            }
        })?;
        Ok(AnyConnector::Redirect(std::sync::Arc::new(OidcRedirectConnector::new(
            config.id.clone(),
            settings,
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_json() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "issuer": "https://upstream.example.com",
            "authorization_endpoint": "https://upstream.example.com/authorize",
            "token_endpoint": "https://upstream.example.com/token",
            "client_id": "fedid",
            "client_secret": "s3cr3t",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn login_url_carries_state_and_redirect_uri() {
        let factory = OidcConnectorFactory;
        let connector = factory
            .build(&ConnectorConfig {
                id: "upstream".into(),
                connector_type: "oidc".into(),
                config: settings_json(),
            })
            .unwrap();
        let redirect = connector.as_redirect().unwrap();
        let url = redirect
            .login_url("https://idp.example.com/callback/upstream", "xyz")
            .await
            .unwrap();
        assert!(url.starts_with("https://upstream.example.com/authorize?"));
        assert!(url.contains("state=xyz"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fidp.example.com%2Fcallback%2Fupstream"));
    }

    #[test]
    fn decode_id_token_claims_reads_payload_segment() {
        let payload = serde_json::json!({
            "sub": "upstream-user-1",
            "email": "person@example.com",
            "email_verified": true,
        });
        let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap());
        let token = format!("header.{encoded}.signature");
        let claims = decode_id_token_claims(&token).unwrap();
        assert_eq!(claims.sub, "upstream-user-1");
        assert_eq!(claims.email.as_deref(), Some("person@example.com"));
        assert_eq!(claims.email_verified, Some(true));
    }

    #[tokio::test]
    async fn handle_callback_without_code_fails() {
        let connector = OidcRedirectConnector::new(
            "upstream".into(),
            serde_json::from_slice(&settings_json()).unwrap(),
        );
        let query = HashMap::new();
        let result = connector.handle_callback(&query).await;
        assert!(matches!(result, Err(ConnectorError::Failure { .. })));
    }

    #[tokio::test]
    async fn refresh_without_stored_connector_data_fails() {
        let connector = OidcRedirectConnector::new(
            "upstream".into(),
            serde_json::from_slice(&settings_json()).unwrap(),
        );
        let result = connector.refresh(&[]).await;
        assert!(matches!(result, Err(ConnectorError::Failure { .. })));
    }
}
