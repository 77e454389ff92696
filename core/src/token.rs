//! # Token Factory & Verifier (C3)
//!
//! Mints and verifies the two JWTs this service issues: the OIDC ID Token
//! and the bearer access token. Both are signed with the active key from
//! [`crate::signer::Signer`] and carry a `kid` header so the verifier can
//! pick the matching verification key without trial-and-error.
//!
//! Verification classifies every failure into a [`TokenError`] variant so
//! callers (the HTTP layer) can map it onto the right OAuth error code
//! without parsing a message string.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, decode_header, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::errors::{TokenError, TokenResult};
use crate::signer::{Signer, VerificationKey};
use crate::storage::SigningKeyStore;

/// Claims carried by an OIDC ID Token (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub auth_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub groups: Vec<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Claims carried by the access token.
///
/// Access tokens are opaque to clients by design but are still JWTs so the
/// resource server (here, `/userinfo`) can verify them with the same
/// machinery as the ID token, per spec §4.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub groups: Vec<String>,
}

/// Parameters for minting an ID token, gathered by the caller from the
/// session/identity/client (spec §4.6 step 4).
pub struct IdTokenRequest {
    pub subject: String,
    pub audience: String,
    pub auth_time: DateTime<Utc>,
    pub nonce: Option<String>,
    pub email: Option<String>,
    pub email_verified: Option<bool>,
    pub name: Option<String>,
    pub groups: Vec<String>,
    pub custom_claims: HashMap<String, Value>,
}

pub struct AccessTokenRequest {
    pub subject: String,
    pub audience: String,
    pub scopes: Vec<String>,
    pub groups: Vec<String>,
}

/// Signs and verifies tokens against the current signer key set.
pub struct TokenFactory<S: ?Sized> {
    signer: Arc<Signer<S>>,
    issuer: String,
    id_token_lifetime: Duration,
    access_token_lifetime: Duration,
    clock_skew: Duration,
}

impl<S: SigningKeyStore + ?Sized> TokenFactory<S> {
    pub fn new(
        signer: Arc<Signer<S>>,
        issuer: String,
        id_token_lifetime: Duration,
        access_token_lifetime: Duration,
        clock_skew: Duration,
    ) -> Self {
        Self {
            signer,
            issuer,
            id_token_lifetime,
            access_token_lifetime,
            clock_skew,
        }
    }

    pub async fn sign_id_token(
        &self,
        request: IdTokenRequest,
    ) -> Result<String, crate::errors::SignerError> {
        let now = Utc::now();
        let claims = IdTokenClaims {
            iss: self.issuer.clone(),
            sub: request.subject,
            aud: request.audience,
            exp: (now + self.id_token_lifetime).timestamp(),
            iat: now.timestamp(),
            auth_time: request.auth_time.timestamp(),
            nonce: request.nonce,
            email: request.email,
            email_verified: request.email_verified,
            name: request.name,
            groups: request.groups,
            extra: request.custom_claims,
        };
        self.sign(&claims).await
    }

    pub async fn sign_access_token(
        &self,
        request: AccessTokenRequest,
    ) -> Result<String, crate::errors::SignerError> {
        let now = Utc::now();
        let claims = AccessTokenClaims {
            iss: self.issuer.clone(),
            sub: request.subject,
            aud: request.audience,
            exp: (now + self.access_token_lifetime).timestamp(),
            iat: now.timestamp(),
            scopes: request.scopes,
            groups: request.groups,
        };
        self.sign(&claims).await
    }

    async fn sign<C: Serialize>(&self, claims: &C) -> Result<String, crate::errors::SignerError> {
        let active = self.signer.current_signing_key().await?;
        let mut header = Header::new(active.algorithm);
        header.kid = Some(active.id.clone());
        encode(&header, claims, &active.encoding_key)
            .map_err(|e| crate::errors::SignerError::Generation(e.to_string()))
    }

    /// Verifies an access token's signature, issuer, audience, and
    /// expiry, returning the decoded claims on success.
    pub async fn verify_access_token(
        &self,
        token: &str,
        expected_audience: &str,
    ) -> TokenResult<AccessTokenClaims> {
        let claims: AccessTokenClaims = self.verify(token, Some(expected_audience)).await?;
        Ok(claims)
    }

    pub async fn verify_id_token(
        &self,
        token: &str,
        expected_audience: &str,
    ) -> TokenResult<IdTokenClaims> {
        let claims: IdTokenClaims = self.verify(token, Some(expected_audience)).await?;
        Ok(claims)
    }

    /// Verifies signature, issuer, and expiry without pinning the
    /// audience. Used by `/userinfo`, which authenticates a bearer access
    /// token before knowing which client it was issued to — the `aud`
    /// claim comes back trustworthy precisely because the signature over
    /// it just verified.
    pub async fn verify_access_token_any_audience(&self, token: &str) -> TokenResult<AccessTokenClaims> {
        let claims: AccessTokenClaims = self.verify(token, None).await?;
        Ok(claims)
    }

    async fn verify<C: for<'de> Deserialize<'de>>(
        &self,
        token: &str,
        expected_audience: Option<&str>,
    ) -> TokenResult<C> {
        let header = decode_header(token).map_err(|_| TokenError::Malformed)?;
        let kid = header.kid.as_deref().ok_or(TokenError::Malformed)?;

        let keys = self.signer.verification_keys().await;
        let matching: &VerificationKey = keys
            .iter()
            .find(|k| k.id == kid)
            .ok_or(TokenError::Signature)?;

        let decoding_key = match matching.algorithm {
            jsonwebtoken::Algorithm::RS256 => {
                DecodingKey::from_rsa_der(&matching.public_params)
            }
            jsonwebtoken::Algorithm::ES256 => DecodingKey::from_ec_der(&matching.public_params),
            _ => return Err(TokenError::Malformed),
        };

        let mut validation = Validation::new(matching.algorithm);
        match expected_audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        validation.set_issuer(&[&self.issuer]);
        validation.leeway = self.clock_skew.num_seconds().max(0) as u64;

        decode::<C>(token, &decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|err| classify_jwt_error(err.kind()))
    }
}

fn classify_jwt_error(kind: &jsonwebtoken::errors::ErrorKind) -> TokenError {
    use jsonwebtoken::errors::ErrorKind;
    match kind {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::InvalidIssuer => TokenError::Issuer,
        ErrorKind::InvalidAudience => TokenError::Audience,
        ErrorKind::InvalidSignature | ErrorKind::InvalidEcdsaKey | ErrorKind::InvalidRsaKey(_) => {
            TokenError::Signature
        }
        _ => TokenError::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use std::sync::Arc;

    async fn test_factory() -> TokenFactory<MemoryStorage> {
        let storage = Arc::new(MemoryStorage::new());
        let signer = Arc::new(
            Signer::new(
                storage,
                vec![hex::encode([5u8; 32])],
                "RS256",
                Duration::hours(6),
                Duration::minutes(15),
            )
            .await
            .unwrap(),
        );
        TokenFactory::new(
            signer,
            "https://idp.example.com".to_string(),
            Duration::hours(1),
            Duration::minutes(15),
            Duration::seconds(60),
        )
    }

    #[tokio::test]
    async fn id_token_round_trips_through_sign_and_verify() {
        let factory = test_factory().await;
        let token = factory
            .sign_id_token(IdTokenRequest {
                subject: "user-1".into(),
                audience: "client-1".into(),
                auth_time: Utc::now(),
                nonce: Some("abc".into()),
                email: Some("user@example.com".into()),
                email_verified: Some(true),
                name: Some("User One".into()),
                groups: vec!["admins".into()],
                custom_claims: HashMap::new(),
            })
            .await
            .unwrap();

        let claims = factory.verify_id_token(&token, "client-1").await.unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.nonce.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn verification_rejects_wrong_audience() {
        let factory = test_factory().await;
        let token = factory
            .sign_access_token(AccessTokenRequest {
                subject: "user-1".into(),
                audience: "client-1".into(),
                scopes: vec!["openid".into()],
                groups: vec![],
            })
            .await
            .unwrap();

        let result = factory.verify_access_token(&token, "client-2").await;
        assert_eq!(result.unwrap_err(), TokenError::Audience);
    }

    #[tokio::test]
    async fn verification_survives_key_rotation_via_kid() {
        let factory = test_factory().await;
        let token = factory
            .sign_access_token(AccessTokenRequest {
                subject: "user-1".into(),
                audience: "client-1".into(),
                scopes: vec![],
                groups: vec![],
            })
            .await
            .unwrap();

        factory.signer.rotate().await.unwrap();

        let claims = factory
            .verify_access_token(&token, "client-1")
            .await
            .unwrap();
        assert_eq!(claims.sub, "user-1");
    }

    #[tokio::test]
    async fn malformed_token_is_classified_correctly() {
        let factory = test_factory().await;
        let result = factory.verify_access_token("not-a-jwt", "client-1").await;
        assert_eq!(result.unwrap_err(), TokenError::Malformed);
    }
}
