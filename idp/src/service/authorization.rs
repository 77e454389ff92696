//! # Authorization State Machine (C6)
//!
//! Threads an authenticating end user through request validation, connector
//! dispatch, the external identity callback, consent, and code/token
//! issuance.
//!
//! ```text
//! START --(validate)--> AWAITING_CONNECTOR_CHOICE --(choose)--> CONNECTOR_DISPATCHED
//!   (single connector configured skips straight to CONNECTOR_DISPATCHED)
//! CONNECTOR_DISPATCHED --(callback ok)--> IDENTITY_RESOLVED --(callback failed)--> FAILED
//! IDENTITY_RESOLVED --(consent needed)--> AWAITING_CONSENT --(trusted/public client)--> CODE_ISSUED
//! AWAITING_CONSENT --(approve)--> CODE_ISSUED --(deny)--> FAILED
//! CODE_ISSUED --(redeemed)--> TOKENS_ISSUED | --(expired)--> EXPIRED
//! ```
//!
//! There is no explicit state column: the session row's populated fields
//! (`connector_id`, `identity`, `consent_granted`) and the presence/absence
//! of an [`AuthCode`] row *are* the state, read back out by
//! [`current_state`].
//!
//! The session row is intentionally **not** deleted at code issuance —
//! redemption needs to recover the resolved identity, which lives on the
//! session, not the code. It's deleted once the code is redeemed (or by
//! the periodic sweeper on expiry), at which point `auth_codes`' foreign
//! key cascade would have already been moot since the code itself was
//! already consumed via [`AuthCodeStore::take_auth_code`].

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};

use fedid_core::connector::ConnectorRegistry;
use fedid_core::crypto::{pkce_challenge_matches, random_token};
use fedid_core::middleware::MiddlewareChain;
use fedid_core::storage::entities::{AuthCode, Client, Identity, Session, User};
use fedid_core::storage::{
    AuthCodeStore, ClientStore, RefreshTokenStore, SessionStore, Storage, StorageExt, UserStore,
};
use fedid_core::token::{AccessTokenRequest, IdTokenRequest, TokenFactory};

use crate::error::ApiError;
use crate::service::refresh::{IssueRequest as RefreshIssueRequest, RefreshTokenService};

const AUTH_CODE_ENTROPY_BYTES: usize = 16;
const RECOGNIZED_SCOPES: &[&str] = &["openid", "email", "profile", "groups", "offline_access"];
const AUDIENCE_SCOPE_PREFIX: &str = "audience:server:client_id:";

/// A parsed, not-yet-validated authorization request (query params of
/// `GET /auth`, spec §6).
pub struct StartAuthorizationRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub response_type: String,
    pub scope: String,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub connector_id: Option<String>,
}

pub struct ConnectorSummary {
    pub id: String,
}

pub enum StartOutcome {
    NeedsConnectorChoice {
        session_id: String,
        connectors: Vec<ConnectorSummary>,
    },
    DispatchToConnector {
        session_id: String,
        connector_id: String,
    },
}

/// Observed current state of a session, reconstructed from its stored
/// fields (see module docs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingConnectorChoice,
    ConnectorDispatched,
    IdentityResolved,
    AwaitingConsent,
    CodeIssued,
    Expired,
}

pub fn current_state(session: &Session, now: DateTime<Utc>) -> SessionState {
    if session.expires_at <= now {
        return SessionState::Expired;
    }
    if session.consent_granted {
        return SessionState::CodeIssued;
    }
    match (&session.connector_id, &session.identity) {
        (None, _) => SessionState::AwaitingConnectorChoice,
        (Some(_), None) => SessionState::ConnectorDispatched,
        (Some(_), Some(_)) => SessionState::AwaitingConsent,
    }
}

/// Tokens issued on successful code or refresh-token redemption.
pub struct IssuedTokens {
    pub access_token: String,
    pub id_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub refresh_token: Option<String>,
    pub scope: String,
}

/// Result of the atomic fetch-and-delete transaction inside
/// [`AuthorizationService::redeem_code`]. Kept as an `Ok` variant (not a
/// transaction-level `Err`) so a client-mismatch still commits the code
/// delete and the theft-signal revocation it performed alongside it.
enum RedeemOutcome {
    Redeemed { session: Session, scopes: Vec<String> },
    ClientMismatch,
}

pub struct AuthorizationService<S: ?Sized> {
    storage: Arc<S>,
    connectors: Arc<ConnectorRegistry<S>>,
    token_factory: Arc<TokenFactory<S>>,
    refresh_service: Arc<RefreshTokenService<S>>,
    session_lifetime: Duration,
    auth_code_lifetime: Duration,
    access_token_lifetime_seconds: i64,
}

impl<S> AuthorizationService<S>
where
    S: Storage,
{
    pub fn new(
        storage: Arc<S>,
        connectors: Arc<ConnectorRegistry<S>>,
        token_factory: Arc<TokenFactory<S>>,
        refresh_service: Arc<RefreshTokenService<S>>,
        session_lifetime: Duration,
        auth_code_lifetime: Duration,
        access_token_lifetime_seconds: i64,
    ) -> Self {
        Self {
            storage,
            connectors,
            token_factory,
            refresh_service,
            session_lifetime,
            auth_code_lifetime,
            access_token_lifetime_seconds,
        }
    }

    /// START: validates the request and persists a new session.
    pub async fn start(&self, request: StartAuthorizationRequest) -> Result<StartOutcome, ApiError> {
        let client = self
            .storage
            .get_client(&request.client_id)
            .await
            .map_err(|_| ApiError::InvalidClient)?;

        if !client.redirect_uris.iter().any(|u| u == &request.redirect_uri) {
            return Err(ApiError::InvalidRedirectUri);
        }

        if request.response_type != "code" {
            return Err(ApiError::InvalidRequest(format!(
                "unsupported response_type: {}",
                request.response_type
            )));
        }

        let scopes = validate_and_filter_scopes(&request.scope, &client)?;

        if let Some(challenge) = &request.code_challenge {
            match request.code_challenge_method.as_deref() {
                Some("S256") | Some("plain") => {}
                _ => {
                    return Err(ApiError::InvalidRequest(
                        "code_challenge_method must be S256 or plain when code_challenge is set"
                            .into(),
                    ))
                }
            }
            if challenge.is_empty() {
                return Err(ApiError::InvalidRequest("code_challenge must not be empty".into()));
            }
        }

        let now = Utc::now();
        let session_id = random_token(16);
        let offline_requested = scopes.iter().any(|s| s == "offline_access");

        let mut session = Session {
            id: session_id.clone(),
            client_id: request.client_id,
            scopes,
            connector_id: request.connector_id.clone(),
            redirect_uri: request.redirect_uri,
            state: request.state,
            nonce: request.nonce,
            code_challenge: request.code_challenge,
            code_challenge_method: request.code_challenge_method,
            identity: None,
            created_at: now,
            expires_at: now + self.session_lifetime,
            register: false,
            offline_requested,
            consent_granted: false,
        };

        let available = self.connectors.list().await;
        let chosen = match &request.connector_id {
            Some(id) => {
                if !available.iter().any(|c| c.id() == id) {
                    return Err(ApiError::InvalidRequest(format!("unknown connector: {id}")));
                }
                Some(id.clone())
            }
            None if available.len() == 1 => Some(available[0].id().to_string()),
            None => None,
        };
        session.connector_id = chosen.clone();

        self.storage.create_session(session).await?;

        match chosen {
            Some(connector_id) => Ok(StartOutcome::DispatchToConnector {
                session_id,
                connector_id,
            }),
            None => Ok(StartOutcome::NeedsConnectorChoice {
                session_id,
                connectors: available
                    .iter()
                    .map(|c| ConnectorSummary { id: c.id().to_string() })
                    .collect(),
            }),
        }
    }

    /// AWAITING_CONNECTOR_CHOICE -> CONNECTOR_DISPATCHED.
    pub async fn choose_connector(&self, session_id: &str, connector_id: &str) -> Result<(), ApiError> {
        let mut session = self.load_live_session(session_id).await?;
        self.connectors.get(connector_id).await?;
        session.connector_id = Some(connector_id.to_string());
        self.storage.update_session(session).await?;
        Ok(())
    }

    /// CONNECTOR_DISPATCHED -> IDENTITY_RESOLVED (or AWAITING_CONSENT/CODE_ISSUED
    /// directly, per the client's trust level).
    ///
    /// `raw_identity` is whatever the connector resolved; `middleware` is
    /// the chain configured for that connector.
    pub async fn handle_callback(
        &self,
        session_id: &str,
        raw_identity: Identity,
        middleware: &MiddlewareChain,
    ) -> Result<CallbackOutcome, ApiError> {
        let mut session = self.load_live_session(session_id).await?;
        let identity = middleware.process(raw_identity)?;

        let client = self.storage.get_client(&session.client_id).await?;
        let resolved = self.resolve_user(&identity, session.connector_id.as_deref()).await?;

        let mut final_identity = identity;
        final_identity.user_id = resolved.id.clone();
        session.identity = Some(final_identity);
        self.storage.update_session(session.clone()).await?;

        if client.public {
            let code = self.issue_code_for(&mut session).await?;
            Ok(CallbackOutcome::CodeIssued { session_id: session.id, code })
        } else {
            Ok(CallbackOutcome::AwaitingConsent { session_id: session.id })
        }
    }

    /// AWAITING_CONSENT -> CODE_ISSUED | FAILED. Returns the issued code on
    /// approval so the caller can redirect the user agent back to the
    /// client's `redirect_uri` with `?code=...`.
    pub async fn approve(&self, session_id: &str, approved: bool) -> Result<Option<String>, ApiError> {
        let mut session = self.load_live_session(session_id).await?;
        if !approved {
            self.storage.delete_session(&session.id).await.ok();
            return Ok(None);
        }
        let code = self.issue_code_for(&mut session).await?;
        Ok(Some(code))
    }

    async fn issue_code_for(&self, session: &mut Session) -> Result<String, ApiError> {
        session.consent_granted = true;
        self.storage.update_session(session.clone()).await?;

        let now = Utc::now();
        let code = random_token(AUTH_CODE_ENTROPY_BYTES);
        let auth_code = AuthCode {
            code: code.clone(),
            session_id: session.id.clone(),
            client_id: session.client_id.clone(),
            scopes: session.scopes.clone(),
            created_at: now,
            expires_at: now + self.auth_code_lifetime,
        };
        self.storage.create_auth_code(auth_code).await?;
        Ok(code)
    }

    /// Exchanges an authorization code (the `authorization_code` grant) for
    /// tokens. Runs under `perform_in_transaction` so the one-shot fetch
    /// and (on mismatch) theft-signal revocation are atomic.
    ///
    /// The mismatch branch returns `Ok(RedeemOutcome::ClientMismatch)`
    /// rather than an `Err` — the closure body's return value decides
    /// commit vs. rollback for the whole transaction (`postgres::
    /// PostgresStorage::perform_in_transaction_erased` rolls back on any
    /// `Err`), and the code delete plus the revocation it guards both need
    /// to survive as one committed unit. The mismatch is translated to
    /// `invalid_grant` by the caller, after the transaction has committed.
    pub async fn redeem_code(
        &self,
        code: &str,
        client_id: &str,
        client_secret: Option<&str>,
        code_verifier: Option<&str>,
    ) -> Result<IssuedTokens, ApiError> {
        self.authenticate_client(client_id, client_secret).await?;

        let outcome = {
            let code = code.to_string();
            let client_id_owned = client_id.to_string();
            let storage = self.storage.clone();
            storage
                .perform_in_transaction(move |txn: &dyn Storage| {
                    Box::pin(async move {
                        let auth_code = txn.take_auth_code(&code).await?;
                        if auth_code.client_id != client_id_owned {
                            // Theft signal (spec §4.6 step 2, scenario 2): a
                            // code redeemed by a client other than the one it
                            // was issued to. Resolve the session back to the
                            // (user, client) pair refresh tokens are keyed on
                            // and revoke all of them, not just this code.
                            if let Ok(session) = txn.get_session(&auth_code.session_id).await {
                                if let Some(user_id) =
                                    session.identity.as_ref().map(|i| i.user_id.clone())
                                {
                                    let _ = txn.revoke_for_client(&user_id, &session.client_id).await;
                                }
                            }
                            return Ok(RedeemOutcome::ClientMismatch);
                        }
                        let session = txn.get_session(&auth_code.session_id).await?;
                        Ok(RedeemOutcome::Redeemed { session, scopes: auth_code.scopes })
                    })
                })
                .await
                .map_err(|_: fedid_core::errors::StorageError| {
                    ApiError::InvalidGrant("invalid or expired code".into())
                })?
        };

        let (session, scopes) = match outcome {
            RedeemOutcome::Redeemed { session, scopes } => (session, scopes),
            RedeemOutcome::ClientMismatch => {
                return Err(ApiError::InvalidGrant("invalid or expired code".into()));
            }
        };

        if session.expires_at <= Utc::now() {
            return Err(ApiError::InvalidGrant("session expired".into()));
        }

        self.verify_pkce(&session, code_verifier)?;

        let identity = session
            .identity
            .clone()
            .ok_or_else(|| ApiError::Internal("code issued without resolved identity".into()))?;

        let tokens = self
            .mint_tokens(
                &session.client_id,
                session.created_at,
                session.nonce.clone(),
                session.connector_id.as_deref(),
                &identity,
                &scopes,
                session.offline_requested,
            )
            .await?;

        self.storage.delete_session(&session.id).await.ok();
        Ok(tokens)
    }

    /// Mints ID/access/(optional) refresh tokens for an already-resolved
    /// identity outside the session/consent flow this service otherwise
    /// threads through — used directly by the device-authorization grant
    /// once a `user_code` has been approved at the verification page.
    pub async fn mint_tokens_for_device(
        &self,
        client_id: &str,
        identity: &Identity,
        scopes: &[String],
        connector_id: Option<&str>,
    ) -> Result<IssuedTokens, ApiError> {
        let offline_requested = scopes.iter().any(|s| s == "offline_access");
        self.mint_tokens(
            client_id,
            Utc::now(),
            None,
            connector_id,
            identity,
            scopes,
            offline_requested,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn mint_tokens(
        &self,
        client_id: &str,
        auth_time: DateTime<Utc>,
        nonce: Option<String>,
        connector_id: Option<&str>,
        identity: &Identity,
        scopes: &[String],
        offline_requested: bool,
    ) -> Result<IssuedTokens, ApiError> {
        let wants = |scope: &str| scopes.iter().any(|s| s == scope);

        let id_token = self
            .token_factory
            .sign_id_token(IdTokenRequest {
                subject: identity.user_id.clone(),
                audience: client_id.to_string(),
                auth_time,
                nonce,
                email: wants("email").then(|| identity.email.clone()),
                email_verified: wants("email").then_some(identity.email_verified),
                name: wants("profile").then(|| identity.preferred_username.clone()),
                groups: if wants("groups") { identity.groups.clone() } else { vec![] },
                custom_claims: HashMap::new(),
            })
            .await?;

        let access_token = self
            .token_factory
            .sign_access_token(AccessTokenRequest {
                subject: identity.user_id.clone(),
                audience: client_id.to_string(),
                scopes: scopes.to_vec(),
                groups: identity.groups.clone(),
            })
            .await?;

        let refresh_token = if offline_requested {
            Some(
                self.refresh_service
                    .issue(RefreshIssueRequest {
                        client_id: client_id.to_string(),
                        user_id: identity.user_id.clone(),
                        scopes: scopes.to_vec(),
                        connector_id: connector_id.unwrap_or_default().to_string(),
                        connector_data: identity.connector_data.clone(),
                    })
                    .await?,
            )
        } else {
            None
        };

        Ok(IssuedTokens {
            access_token,
            id_token,
            token_type: "Bearer",
            expires_in: self.access_token_lifetime_seconds,
            refresh_token,
            scope: scopes.join(" "),
        })
    }

    fn verify_pkce(&self, session: &Session, code_verifier: Option<&str>) -> Result<(), ApiError> {
        match (&session.code_challenge, &session.code_challenge_method) {
            (Some(challenge), Some(method)) => {
                let verifier = code_verifier
                    .ok_or_else(|| ApiError::InvalidGrant("missing code_verifier".into()))?;
                if !pkce_challenge_matches(verifier, challenge, method) {
                    return Err(ApiError::InvalidGrant("PKCE verification failed".into()));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Authenticates a client by id and (for confidential clients) secret.
    /// Shared by the authorization-code, refresh, password, and device-code
    /// grants, all of which authenticate the same way at `/token`.
    pub(crate) async fn authenticate_client(&self, client_id: &str, client_secret: Option<&str>) -> Result<Client, ApiError> {
        let client = self
            .storage
            .get_client(client_id)
            .await
            .map_err(|_| ApiError::InvalidClient)?;

        if client.public {
            return Ok(client);
        }

        let presented = client_secret.ok_or(ApiError::InvalidClient)?;
        let matches = client
            .secret
            .as_ref()
            .is_some_and(|stored| stored.as_slice() == presented.as_bytes());
        if matches {
            Ok(client)
        } else {
            Err(ApiError::InvalidClient)
        }
    }

    /// Selects the owning user for a resolved identity: an existing user
    /// bound to the same ⟨connector, remote_id⟩ pair if one exists,
    /// otherwise a user matched by verified email, otherwise a brand new
    /// user (spec §4.6 "ordering and tie-breaks").
    async fn resolve_user(&self, identity: &Identity, connector_id: Option<&str>) -> Result<User, ApiError> {
        let connector_id = connector_id.unwrap_or_default();

        if let Ok(user) = self
            .storage
            .get_user_by_remote_identity(connector_id, &identity.user_id)
            .await
        {
            return Ok(user);
        }

        if identity.email_verified {
            if let Ok(mut user) = self.storage.get_user_by_email(&identity.email).await {
                user.remote_identities.push(fedid_core::storage::entities::RemoteIdentity {
                    connector_id: connector_id.to_string(),
                    remote_id: identity.user_id.clone(),
                });
                self.storage.update_user(user.clone()).await?;
                return Ok(user);
            }
        }

        let new_user = User {
            id: random_token(16),
            email: identity.email.clone(),
            email_verified: identity.email_verified,
            display_name: identity.preferred_username.clone(),
            admin: false,
            disabled: false,
            created_at: Utc::now(),
            remote_identities: vec![fedid_core::storage::entities::RemoteIdentity {
                connector_id: connector_id.to_string(),
                remote_id: identity.user_id.clone(),
            }],
        };
        self.storage.create_user(new_user.clone()).await?;
        Ok(new_user)
    }

    /// Loads a session's redirect target without requiring it still be
    /// live, so the caller can redirect back to the client with an
    /// `error=access_denied` even after the consent decision expires it.
    pub async fn session_redirect_info(&self, session_id: &str) -> Result<(String, Option<String>), ApiError> {
        let session = self
            .storage
            .get_session(session_id)
            .await
            .map_err(|_| ApiError::InvalidGrant("unknown session".into()))?;
        Ok((session.redirect_uri, session.state))
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, ApiError> {
        Ok(self.load_live_session(session_id).await?)
    }

    /// Re-mints ID/access tokens for a rotated refresh-token record (spec
    /// §4.7 step 5): re-resolves the connector by the id stored on the
    /// record and, if it supports `refresh`, re-derives the identity from
    /// its stored `connector_data` rather than the snapshot taken at the
    /// original code redemption. Connectors that don't support refresh
    /// (or whose lookup fails) fall back to the user's current stored
    /// profile.
    pub async fn reissue_for_refresh(
        &self,
        record: &fedid_core::storage::entities::RefreshToken,
        wire_token: String,
    ) -> Result<IssuedTokens, ApiError> {
        let identity = self.resolve_identity_for_refresh(record).await?;
        let scopes = record.scopes.clone();
        let wants = |scope: &str| scopes.iter().any(|s| s == scope);
        let now = Utc::now();

        let id_token = self
            .token_factory
            .sign_id_token(IdTokenRequest {
                subject: record.user_id.clone(),
                audience: record.client_id.clone(),
                auth_time: now,
                nonce: None,
                email: wants("email").then(|| identity.email.clone()),
                email_verified: wants("email").then_some(identity.email_verified),
                name: wants("profile").then(|| identity.preferred_username.clone()),
                groups: if wants("groups") { identity.groups.clone() } else { vec![] },
                custom_claims: HashMap::new(),
            })
            .await?;

        let access_token = self
            .token_factory
            .sign_access_token(AccessTokenRequest {
                subject: record.user_id.clone(),
                audience: record.client_id.clone(),
                scopes: scopes.clone(),
                groups: identity.groups.clone(),
            })
            .await?;

        Ok(IssuedTokens {
            access_token,
            id_token,
            token_type: "Bearer",
            expires_in: self.access_token_lifetime_seconds,
            refresh_token: Some(wire_token),
            scope: scopes.join(" "),
        })
    }

    async fn resolve_identity_for_refresh(
        &self,
        record: &fedid_core::storage::entities::RefreshToken,
    ) -> Result<Identity, ApiError> {
        if let Ok(connector) = self.connectors.get(&record.connector_id).await {
            if let Some(redirect) = connector.as_redirect() {
                if let Ok(identity) = redirect.refresh(&record.connector_data).await {
                    return Ok(identity);
                }
            }
        }

        let user = self.storage.get_user(&record.user_id).await?;
        Ok(Identity {
            user_id: user.id,
            username: user.email.clone(),
            preferred_username: user.display_name,
            email: user.email,
            email_verified: user.email_verified,
            groups: vec![],
            custom_claims: HashMap::new(),
            connector_data: record.connector_data.clone(),
        })
    }

    async fn load_live_session(&self, session_id: &str) -> Result<Session, ApiError> {
        let session = self
            .storage
            .get_session(session_id)
            .await
            .map_err(|_| ApiError::InvalidGrant("unknown session".into()))?;
        if session.expires_at <= Utc::now() {
            self.storage.delete_session(session_id).await.ok();
            return Err(ApiError::InvalidGrant("session expired".into()));
        }
        Ok(session)
    }
}

pub enum CallbackOutcome {
    AwaitingConsent { session_id: String },
    CodeIssued { session_id: String, code: String },
}

/// Tokenizes `scope` on whitespace, requires `openid`, validates
/// `audience:server:client_id:<id>` entries against the client's
/// trusted-peer list, and silently drops anything else unrecognized
/// (spec §4.6 validation contracts).
pub(crate) fn validate_and_filter_scopes(raw_scope: &str, client: &Client) -> Result<Vec<String>, ApiError> {
    let tokens: Vec<&str> = raw_scope.split_whitespace().collect();
    if !tokens.contains(&"openid") {
        return Err(ApiError::InvalidScope("openid scope is required".into()));
    }

    let mut scopes = Vec::new();
    for token in tokens {
        if let Some(peer_id) = token.strip_prefix(AUDIENCE_SCOPE_PREFIX) {
            if client.trusted_peers.iter().any(|p| p == peer_id) {
                scopes.push(token.to_string());
            }
            // Untrusted audience scopes are dropped, not rejected outright,
            // matching the "unknown scopes silently dropped" rule.
            continue;
        }
        if RECOGNIZED_SCOPES.contains(&token) {
            scopes.push(token.to_string());
        }
    }
    Ok(scopes)
}

/// Decodes the `code_verifier`'s expected base64url alphabet eagerly so
/// malformed verifiers fail fast with a clear error instead of a PKCE
/// mismatch.
pub fn validate_code_verifier_alphabet(verifier: &str) -> Result<(), ApiError> {
    URL_SAFE_NO_PAD
        .decode(verifier)
        .map(|_| ())
        .map_err(|_| ApiError::InvalidRequest("code_verifier is not valid base64url".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedid_core::connector::ConnectorFactory;
    use fedid_core::errors::ConnectorError;
    use fedid_core::signer::Signer;
    use fedid_core::storage::entities::ConnectorConfig;
    use fedid_core::storage::memory::MemoryStorage;

    struct NoopFactory;
    impl ConnectorFactory for NoopFactory {
        fn connector_type(&self) -> &'static str {
            "noop"
        }
        fn build(&self, _config: &ConnectorConfig) -> Result<fedid_core::connector::AnyConnector, ConnectorError> {
            unreachable!("not exercised in these tests")
        }
    }

    async fn setup() -> (Arc<MemoryStorage>, AuthorizationService<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .create_client(Client {
                id: "example-app".into(),
                secret: Some(b"example-app-secret".to_vec()),
                redirect_uris: vec!["http://127.0.0.1:5555/callback".into()],
                logo_url: None,
                name: "Example App".into(),
                trusted_peers: vec![],
                public: true,
                admin: false,
                device_flow: false,
            })
            .await
            .unwrap();

        let signer = Arc::new(
            Signer::new(
                storage.clone(),
                vec![hex::encode([1u8; 32])],
                "RS256",
                Duration::hours(6),
                Duration::minutes(15),
            )
            .await
            .unwrap(),
        );
        let token_factory = Arc::new(TokenFactory::new(
            signer,
            "https://idp.example.com".into(),
            Duration::hours(1),
            Duration::minutes(15),
            Duration::seconds(60),
        ));
        let refresh_service = Arc::new(RefreshTokenService::new(storage.clone()));
        let connectors = Arc::new(ConnectorRegistry::new(storage.clone(), vec![Arc::new(NoopFactory)]));

        let service = AuthorizationService::new(
            storage.clone(),
            connectors,
            token_factory,
            refresh_service,
            Duration::minutes(10),
            Duration::seconds(60),
            900,
        );
        (storage, service)
    }

    #[tokio::test]
    async fn start_rejects_unknown_redirect_uri() {
        let (_storage, service) = setup().await;
        let result = service
            .start(StartAuthorizationRequest {
                client_id: "example-app".into(),
                redirect_uri: "http://evil.example.com/callback".into(),
                response_type: "code".into(),
                scope: "openid".into(),
                state: None,
                nonce: None,
                code_challenge: None,
                code_challenge_method: None,
                connector_id: None,
            })
            .await;
        assert!(matches!(result, Err(ApiError::InvalidRedirectUri)));
    }

    #[tokio::test]
    async fn start_requires_openid_scope() {
        let (_storage, service) = setup().await;
        let result = service
            .start(StartAuthorizationRequest {
                client_id: "example-app".into(),
                redirect_uri: "http://127.0.0.1:5555/callback".into(),
                response_type: "code".into(),
                scope: "email profile".into(),
                state: None,
                nonce: None,
                code_challenge: None,
                code_challenge_method: None,
                connector_id: None,
            })
            .await;
        assert!(matches!(result, Err(ApiError::InvalidScope(_))));
    }

    #[tokio::test]
    async fn start_with_no_connectors_awaits_connector_choice() {
        let (_storage, service) = setup().await;
        let result = service
            .start(StartAuthorizationRequest {
                client_id: "example-app".into(),
                redirect_uri: "http://127.0.0.1:5555/callback".into(),
                response_type: "code".into(),
                scope: "openid email profile".into(),
                state: Some("xyz".into()),
                nonce: None,
                code_challenge: None,
                code_challenge_method: None,
                connector_id: None,
            })
            .await
            .unwrap();
        assert!(matches!(result, StartOutcome::NeedsConnectorChoice { .. }));
    }

    #[tokio::test]
    async fn full_authorization_code_happy_path_issues_tokens() {
        let (storage, service) = setup().await;

        let StartOutcome::NeedsConnectorChoice { session_id, .. } = service
            .start(StartAuthorizationRequest {
                client_id: "example-app".into(),
                redirect_uri: "http://127.0.0.1:5555/callback".into(),
                response_type: "code".into(),
                scope: "openid email profile".into(),
                state: Some("xyz".into()),
                nonce: Some("nonce-1".into()),
                code_challenge: None,
                code_challenge_method: None,
                connector_id: None,
            })
            .await
            .unwrap()
        else {
            panic!("expected connector choice");
        };

        let identity = Identity {
            user_id: "remote-1".into(),
            username: "admin".into(),
            preferred_username: "admin".into(),
            email: "admin@example.com".into(),
            email_verified: true,
            groups: vec![],
            custom_claims: HashMap::new(),
            connector_data: vec![],
        };
        let chain = MiddlewareChain::default();
        let outcome = service
            .handle_callback(&session_id, identity, &chain)
            .await
            .unwrap();
        let CallbackOutcome::CodeIssued { session_id, code } = outcome else {
            panic!("public client should skip consent");
        };

        let session = storage.get_session(&session_id).await.unwrap();
        assert!(session.consent_granted);

        let tokens = service
            .redeem_code(&code, "example-app", Some("example-app-secret"), None)
            .await
            .unwrap();
        assert!(!tokens.access_token.is_empty());
        assert!(!tokens.id_token.is_empty());
        assert!(tokens.refresh_token.is_none());
        assert_eq!(tokens.scope, "openid email profile");
    }

    #[tokio::test]
    async fn redeem_code_rejects_unknown_code() {
        let (_storage, service) = setup().await;
        let result = service
            .redeem_code("does-not-exist", "example-app", Some("example-app-secret"), None)
            .await;
        assert!(matches!(result, Err(ApiError::InvalidGrant(_))));
    }

    #[tokio::test]
    async fn redeem_code_rejects_client_mismatch_and_revokes_session_tokens() {
        let (storage, service) = setup().await;
        storage
            .create_client(Client {
                id: "impostor-app".into(),
                secret: Some(b"impostor-secret".to_vec()),
                redirect_uris: vec!["http://127.0.0.1:6666/callback".into()],
                logo_url: None,
                name: "Impostor".into(),
                trusted_peers: vec![],
                public: true,
                admin: false,
                device_flow: false,
            })
            .await
            .unwrap();

        // Plant a refresh token for (user-1, example-app) as if an earlier
        // legitimate session had already requested offline_access.
        storage
            .create_refresh_token(fedid_core::storage::entities::RefreshToken {
                id: 0,
                payload_hash: vec![0u8; 32],
                previous_payload_hash: None,
                client_id: "example-app".into(),
                user_id: "user-1".into(),
                scopes: vec!["openid".into(), "offline_access".into()],
                connector_id: "local".into(),
                connector_data: vec![],
                created_at: Utc::now(),
                last_used_at: Utc::now(),
            })
            .await
            .unwrap();

        let session = Session {
            id: "stolen-session".into(),
            client_id: "example-app".into(),
            scopes: vec!["openid".into()],
            connector_id: Some("local".into()),
            redirect_uri: "http://127.0.0.1:5555/callback".into(),
            state: None,
            nonce: None,
            code_challenge: None,
            code_challenge_method: None,
            identity: Some(Identity {
                user_id: "user-1".into(),
                username: "admin".into(),
                preferred_username: "admin".into(),
                email: "admin@example.com".into(),
                email_verified: true,
                groups: vec![],
                custom_claims: HashMap::new(),
                connector_data: vec![],
            }),
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::minutes(10),
            register: false,
            offline_requested: false,
            consent_granted: true,
        };
        storage.create_session(session).await.unwrap();
        storage
            .create_auth_code(AuthCode {
                code: "stolen-code".into(),
                session_id: "stolen-session".into(),
                client_id: "example-app".into(),
                scopes: vec!["openid".into()],
                created_at: Utc::now(),
                expires_at: Utc::now() + Duration::seconds(60),
            })
            .await
            .unwrap();

        let result = service
            .redeem_code("stolen-code", "impostor-app", None, None)
            .await;
        assert!(matches!(result, Err(ApiError::InvalidGrant(_))));

        let remaining = storage
            .list_refresh_tokens_for("user-1", "example-app")
            .await
            .unwrap();
        assert!(remaining.is_empty(), "theft signal should revoke example-app's refresh tokens for user-1");
    }

    #[tokio::test]
    async fn reissue_for_refresh_falls_back_to_stored_user_profile() {
        let (storage, service) = setup().await;
        storage
            .create_user(User {
                id: "user-1".into(),
                email: "admin@example.com".into(),
                email_verified: true,
                display_name: "Admin".into(),
                admin: false,
                disabled: false,
                created_at: Utc::now(),
                remote_identities: vec![],
            })
            .await
            .unwrap();

        let record = fedid_core::storage::entities::RefreshToken {
            id: 7,
            payload_hash: vec![0u8; 32],
            previous_payload_hash: None,
            client_id: "example-app".into(),
            user_id: "user-1".into(),
            scopes: vec!["openid".into(), "email".into()],
            connector_id: "nonexistent".into(),
            connector_data: vec![],
            created_at: Utc::now(),
            last_used_at: Utc::now(),
        };

        let tokens = service
            .reissue_for_refresh(&record, "7 rotated-payload".into())
            .await
            .unwrap();
        assert!(!tokens.id_token.is_empty());
        assert_eq!(tokens.refresh_token.as_deref(), Some("7 rotated-payload"));
        assert_eq!(tokens.scope, "openid email");
    }

    #[test]
    fn session_state_reports_expired_past_ttl() {
        let session = Session {
            id: "s1".into(),
            client_id: "c1".into(),
            scopes: vec![],
            connector_id: None,
            redirect_uri: "http://localhost/cb".into(),
            state: None,
            nonce: None,
            code_challenge: None,
            code_challenge_method: None,
            identity: None,
            created_at: Utc::now() - Duration::minutes(20),
            expires_at: Utc::now() - Duration::minutes(10),
            register: false,
            offline_requested: false,
            consent_granted: false,
        };
        assert_eq!(current_state(&session, Utc::now()), SessionState::Expired);
    }
}
