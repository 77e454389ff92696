//! # Request Handlers
//!
//! HTTP request handlers that bridge the API layer with the service layer.
//! Every handler is generic over the storage backend (`S: Storage + 'static`)
//! so `routes::configure` can register one monomorphized set per backend
//! chosen in `main.rs`.
//!
//! ## Error Handling
//!
//! All handlers return `Result<HttpResponse, ApiError>`; `ApiError` converts
//! to the RFC 6749 §5.2 error body via its `ResponseError` impl.
//!
//! ## JSON over HTML
//!
//! The interactive steps (connector choice, consent, the redirect callback)
//! all return JSON rather than rendered HTML — login/consent templates are
//! somebody else's concern, layered in front of this service (see
//! [`super::dto`]). Only the token endpoint's grant dispatch and discovery
//! documents are genuinely "final" responses; everything upstream of a
//! relying party's `redirect_uri` is handed back as structured data for a
//! frontend to act on.

use std::collections::HashMap;

use actix_web::{web, HttpRequest, HttpResponse};

use fedid_core::connector::{PasswordConnector, RedirectConnector};
use fedid_core::jwks::build_jwk_set;
use fedid_core::storage::entities::Identity;
use fedid_core::storage::{Storage, UserStore};

use crate::error::ApiError;
use crate::service::authorization::{CallbackOutcome, StartAuthorizationRequest, StartOutcome};
use crate::service::device::{issue_tokens_for_grant, StartDeviceAuthorization};
use crate::state::AppState;

use super::dto::{
    ApprovalRequest, ApprovalResponse, AuthorizeQuery, CallbackResponse, ConnectorChoiceResponse,
    ConnectorOption, DeviceCodeRequest, DeviceCodeResponse, DiscoveryDocument, DispatchResponse,
    HealthResponse, PasswordCallbackRequest, TokenRequest, TokenResponse, UserInfoResponse,
};

// =============================================================================
// AUTHORIZATION ENDPOINT
// =============================================================================

/// `GET /auth`.
pub async fn auth<S: Storage + 'static>(
    state: web::Data<AppState<S>>,
    query: web::Query<AuthorizeQuery>,
) -> Result<HttpResponse, ApiError> {
    start_authorization(&state, query.into_inner(), None).await
}

/// `GET /auth/{connector_id}`: re-dispatches a session already parked in
/// `AwaitingConnectorChoice` (spec §6) to the connector named in the path.
pub async fn auth_with_connector<S: Storage + 'static>(
    state: web::Data<AppState<S>>,
    path: web::Path<String>,
    query: web::Query<AuthorizeQuery>,
) -> Result<HttpResponse, ApiError> {
    start_authorization(&state, query.into_inner(), Some(path.into_inner())).await
}

async fn start_authorization<S: Storage + 'static>(
    state: &AppState<S>,
    query: AuthorizeQuery,
    connector_id: Option<String>,
) -> Result<HttpResponse, ApiError> {
    let outcome = state
        .authorization
        .start(StartAuthorizationRequest {
            client_id: query.client_id,
            redirect_uri: query.redirect_uri,
            response_type: query.response_type,
            scope: query.scope,
            state: query.state,
            nonce: query.nonce,
            code_challenge: query.code_challenge,
            code_challenge_method: query.code_challenge_method,
            connector_id,
        })
        .await?;

    dispatch_outcome(state, outcome).await
}

async fn dispatch_outcome<S: Storage + 'static>(
    state: &AppState<S>,
    outcome: StartOutcome,
) -> Result<HttpResponse, ApiError> {
    match outcome {
        StartOutcome::NeedsConnectorChoice { session_id, connectors } => {
            Ok(HttpResponse::Ok().json(ConnectorChoiceResponse {
                session_id,
                connectors: connectors
                    .into_iter()
                    .map(|c| ConnectorOption { id: c.id })
                    .collect(),
            }))
        }
        StartOutcome::DispatchToConnector { session_id, connector_id } => {
            let redirect_url = match state.connectors.get(&connector_id).await {
                Ok(connector) => match connector.as_redirect() {
                    Some(redirect) => {
                        let callback_url = format!("{}/callback/{connector_id}", state.http_base_url);
                        Some(redirect.login_url(&callback_url, &session_id).await?)
                    }
                    None => None,
                },
                Err(err) => return Err(err.into()),
            };
            Ok(HttpResponse::Ok().json(DispatchResponse {
                session_id,
                connector_id,
                redirect_url,
            }))
        }
    }
}

// =============================================================================
// CALLBACK ENDPOINT
// =============================================================================

/// `GET /callback/{connector_id}`: the redirect target a redirect connector
/// sends the user agent back to. `state` in the query string is the
/// session id handed to [`fedid_core::connector::RedirectConnector::login_url`].
pub async fn callback_redirect<S: Storage + 'static>(
    state: web::Data<AppState<S>>,
    path: web::Path<String>,
    query: web::Query<HashMap<String, String>>,
) -> Result<HttpResponse, ApiError> {
    let connector_id = path.into_inner();
    let session_id = query
        .get("state")
        .cloned()
        .ok_or_else(|| ApiError::InvalidRequest("missing state parameter".into()))?;

    let connector = state.connectors.get(&connector_id).await?;
    let redirect = connector
        .as_redirect()
        .ok_or_else(|| ApiError::InvalidRequest(format!("connector {connector_id} does not support redirect callback")))?;
    let identity = redirect.handle_callback(&query).await?;

    let outcome = state
        .authorization
        .handle_callback(&session_id, identity, &state.middleware)
        .await?;
    finish_callback(&state, outcome).await
}

/// `POST /callback/{connector_id}`: credential submission for password
/// connectors.
pub async fn callback_password<S: Storage + 'static>(
    state: web::Data<AppState<S>>,
    path: web::Path<String>,
    body: web::Json<PasswordCallbackRequest>,
) -> Result<HttpResponse, ApiError> {
    let connector_id = path.into_inner();
    let body = body.into_inner();

    let connector = state.connectors.get(&connector_id).await?;
    let password = connector
        .as_password()
        .ok_or_else(|| ApiError::InvalidRequest(format!("connector {connector_id} is not a password connector")))?;
    let identity = password.login(&body.username, &body.password).await?;

    let outcome = state
        .authorization
        .handle_callback(&body.session_id, identity, &state.middleware)
        .await?;
    finish_callback(&state, outcome).await
}

async fn finish_callback<S: Storage + 'static>(
    state: &AppState<S>,
    outcome: CallbackOutcome,
) -> Result<HttpResponse, ApiError> {
    match outcome {
        CallbackOutcome::AwaitingConsent { session_id } => {
            Ok(HttpResponse::Ok().json(CallbackResponse::AwaitingConsent { session_id }))
        }
        CallbackOutcome::CodeIssued { session_id, code } => {
            let (redirect_uri, client_state) = state.authorization.session_redirect_info(&session_id).await?;
            let redirect_uri = append_code_to_redirect(&redirect_uri, &code, client_state.as_deref());
            Ok(HttpResponse::Ok().json(CallbackResponse::Redirect { redirect_uri }))
        }
    }
}

fn append_code_to_redirect(redirect_uri: &str, code: &str, client_state: Option<&str>) -> String {
    let separator = if redirect_uri.contains('?') { '&' } else { '?' };
    let mut result = format!("{redirect_uri}{separator}code={code}");
    if let Some(client_state) = client_state {
        result.push_str("&state=");
        result.push_str(&url::form_urlencoded::byte_serialize(client_state.as_bytes()).collect::<String>());
    }
    result
}

// =============================================================================
// APPROVAL (CONSENT) ENDPOINT
// =============================================================================

/// `GET`/`POST /approval`: resolves either an `AWAITING_CONSENT` session
/// (spec §6, authorization-code flow) or a pending device-authorization
/// `user_code` (RFC 8628), depending on which field of [`ApprovalRequest`]
/// is populated.
///
/// The device-flow branch requires the caller to authenticate as the
/// approving end user via `Authorization: Bearer <access_token>` — the
/// verification page only ever has that user's own session to vouch for
/// them, never the device's.
pub async fn approval<S: Storage + 'static>(
    state: web::Data<AppState<S>>,
    request: HttpRequest,
    body: web::Either<web::Json<ApprovalRequest>, web::Query<ApprovalRequest>>,
) -> Result<HttpResponse, ApiError> {
    let body = match body {
        web::Either::Left(json) => json.into_inner(),
        web::Either::Right(query) => query.into_inner(),
    };

    match (body.session_id, body.user_code) {
        (Some(session_id), None) => {
            match state.authorization.approve(&session_id, body.approved).await? {
                Some(code) => {
                    let (redirect_uri, client_state) =
                        state.authorization.session_redirect_info(&session_id).await?;
                    let redirect_uri = append_code_to_redirect(&redirect_uri, &code, client_state.as_deref());
                    Ok(HttpResponse::Ok().json(ApprovalResponse::Redirect { redirect_uri }))
                }
                None => Ok(HttpResponse::Ok().json(ApprovalResponse::Denied)),
            }
        }
        (None, Some(user_code)) => {
            if !state.device_flow_enabled {
                return Err(ApiError::InvalidRequest("device authorization grant is disabled".into()));
            }
            let identity = if body.approved {
                Some(resolve_bearer_identity(&request, &state).await?)
            } else {
                None
            };
            state.device.approve(&user_code, body.approved, identity).await?;
            Ok(HttpResponse::Ok().json(if body.approved {
                ApprovalResponse::Approved
            } else {
                ApprovalResponse::Denied
            }))
        }
        _ => Err(ApiError::InvalidRequest(
            "exactly one of session_id or user_code must be set".into(),
        )),
    }
}

async fn resolve_bearer_identity<S: Storage + 'static>(
    request: &HttpRequest,
    state: &AppState<S>,
) -> Result<Identity, ApiError> {
    let header = request
        .headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::InvalidToken)?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::InvalidToken)?;

    let claims = state.token_factory.verify_access_token_any_audience(token).await?;
    let user = state.storage.get_user(&claims.sub).await?;

    Ok(Identity {
        user_id: user.id,
        username: user.email.clone(),
        preferred_username: user.display_name,
        email: user.email,
        email_verified: user.email_verified,
        groups: claims.groups,
        custom_claims: Default::default(),
        connector_data: vec![],
    })
}

// =============================================================================
// TOKEN ENDPOINT
// =============================================================================

/// `POST /token`: dispatches across the four supported grant types. All
/// four authenticate the client the same way ([`AuthorizationService::authenticate_client`](crate::service::authorization::AuthorizationService)
/// via `client_id`/`client_secret`) before doing anything grant-specific.
pub async fn token<S: Storage + 'static>(
    state: web::Data<AppState<S>>,
    form: web::Form<TokenRequest>,
) -> Result<HttpResponse, ApiError> {
    let form = form.into_inner();
    match form.grant_type.as_str() {
        "authorization_code" => authorization_code_grant(&state, form).await,
        "refresh_token" => refresh_token_grant(&state, form).await,
        "password" => password_grant(&state, form).await,
        "urn:ietf:params:oauth:grant-type:device_code" => device_code_grant(&state, form).await,
        other => Err(ApiError::UnsupportedGrantType(other.to_string())),
    }
}

async fn authorization_code_grant<S: Storage + 'static>(
    state: &AppState<S>,
    form: TokenRequest,
) -> Result<HttpResponse, ApiError> {
    let code = form.code.ok_or_else(|| ApiError::InvalidRequest("code is required".into()))?;
    let client_id = form
        .client_id
        .ok_or_else(|| ApiError::InvalidRequest("client_id is required".into()))?;

    let tokens = state
        .authorization
        .redeem_code(&code, &client_id, form.client_secret.as_deref(), form.code_verifier.as_deref())
        .await?;
    Ok(HttpResponse::Ok().json(tokens_to_response(tokens)))
}

async fn refresh_token_grant<S: Storage + 'static>(
    state: &AppState<S>,
    form: TokenRequest,
) -> Result<HttpResponse, ApiError> {
    let refresh_token = form
        .refresh_token
        .ok_or_else(|| ApiError::InvalidRequest("refresh_token is required".into()))?;
    let client_id = form
        .client_id
        .ok_or_else(|| ApiError::InvalidRequest("client_id is required".into()))?;
    state
        .authorization
        .authenticate_client(&client_id, form.client_secret.as_deref())
        .await?;

    let requested_scopes = form
        .scope
        .as_deref()
        .map(|s| s.split_whitespace().map(str::to_string).collect::<Vec<_>>());

    let outcome = state
        .refresh
        .redeem(&refresh_token, &client_id, requested_scopes.as_deref())
        .await?;
    let tokens = state
        .authorization
        .reissue_for_refresh(&outcome.record, outcome.wire_token)
        .await?;
    Ok(HttpResponse::Ok().json(tokens_to_response(tokens)))
}

async fn password_grant<S: Storage + 'static>(
    state: &AppState<S>,
    form: TokenRequest,
) -> Result<HttpResponse, ApiError> {
    let client_id = form
        .client_id
        .ok_or_else(|| ApiError::InvalidRequest("client_id is required".into()))?;
    let username = form
        .username
        .ok_or_else(|| ApiError::InvalidRequest("username is required".into()))?;
    let password = form
        .password
        .ok_or_else(|| ApiError::InvalidRequest("password is required".into()))?;

    let client = state
        .authorization
        .authenticate_client(&client_id, form.client_secret.as_deref())
        .await?;

    let connector = state.connectors.get("local").await?;
    let password_connector = connector
        .as_password()
        .ok_or_else(|| ApiError::Configuration("no local password connector configured".into()))?;
    let identity = password_connector
        .login(&username, &password)
        .await
        .map_err(|_| ApiError::InvalidGrant("invalid username or password".into()))?;

    let scopes = crate::service::authorization::validate_and_filter_scopes(
        form.scope.as_deref().unwrap_or("openid"),
        &client,
    )?;

    let tokens = state
        .authorization
        .mint_tokens_for_device(&client_id, &identity, &scopes, Some("local"))
        .await?;
    Ok(HttpResponse::Ok().json(tokens_to_response(tokens)))
}

async fn device_code_grant<S: Storage + 'static>(
    state: &AppState<S>,
    form: TokenRequest,
) -> Result<HttpResponse, ApiError> {
    if !state.device_flow_enabled {
        return Err(ApiError::UnsupportedGrantType(form.grant_type));
    }
    let device_code = form
        .device_code
        .ok_or_else(|| ApiError::InvalidRequest("device_code is required".into()))?;
    let client_id = form
        .client_id
        .ok_or_else(|| ApiError::InvalidRequest("client_id is required".into()))?;
    state
        .authorization
        .authenticate_client(&client_id, form.client_secret.as_deref())
        .await?;

    let grant = state.device.poll(&device_code).await?;
    let tokens = issue_tokens_for_grant(&state.authorization, grant).await?;
    Ok(HttpResponse::Ok().json(tokens_to_response(tokens)))
}

fn tokens_to_response(tokens: crate::service::authorization::IssuedTokens) -> TokenResponse {
    TokenResponse {
        access_token: tokens.access_token,
        token_type: tokens.token_type,
        expires_in: tokens.expires_in,
        id_token: Some(tokens.id_token),
        refresh_token: tokens.refresh_token,
        scope: tokens.scope,
    }
}

// =============================================================================
// DEVICE AUTHORIZATION (RFC 8628)
// =============================================================================

/// `POST /device/code`.
pub async fn device_code<S: Storage + 'static>(
    state: web::Data<AppState<S>>,
    form: web::Form<DeviceCodeRequest>,
) -> Result<HttpResponse, ApiError> {
    if !state.device_flow_enabled {
        return Err(ApiError::InvalidRequest("device authorization grant is disabled".into()));
    }
    let form = form.into_inner();
    let handle = state
        .device
        .start(StartDeviceAuthorization {
            client_id: form.client_id,
            scope: form.scope.unwrap_or_else(|| "openid".to_string()),
        })
        .await?;

    let verification_uri = format!("{}/device", state.http_base_url);
    let verification_uri_complete = Some(format!("{verification_uri}?user_code={}", handle.user_code));

    Ok(HttpResponse::Ok().json(DeviceCodeResponse {
        device_code: handle.device_code,
        user_code: handle.user_code,
        verification_uri,
        verification_uri_complete,
        expires_in: handle.expires_in,
        interval: handle.interval,
    }))
}

// =============================================================================
// USERINFO
// =============================================================================

/// `GET`/`POST /userinfo`: resource-server-style endpoint authenticated by
/// bearer access token rather than by session (spec §4.3).
pub async fn userinfo<S: Storage + 'static>(
    state: web::Data<AppState<S>>,
    request: HttpRequest,
) -> Result<HttpResponse, ApiError> {
    let header = request
        .headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::InvalidToken)?;
    let token = header.strip_prefix("Bearer ").ok_or(ApiError::InvalidToken)?;
    let claims = state.token_factory.verify_access_token_any_audience(token).await?;

    let wants = |scope: &str| claims.scopes.iter().any(|s| s == scope);
    let user = state.storage.get_user(&claims.sub).await?;

    Ok(HttpResponse::Ok().json(UserInfoResponse {
        sub: claims.sub,
        email: wants("email").then_some(user.email),
        email_verified: wants("email").then_some(user.email_verified),
        name: wants("profile").then_some(user.display_name),
        groups: wants("groups").then_some(claims.groups),
    }))
}

// =============================================================================
// DISCOVERY & KEYS
// =============================================================================

/// `GET /keys`: the JWKS document (RFC 7517).
pub async fn keys<S: Storage + 'static>(state: web::Data<AppState<S>>) -> HttpResponse {
    let verification_keys = state.signer.verification_keys().await;
    HttpResponse::Ok().json(build_jwk_set(&verification_keys))
}

/// `GET /.well-known/openid-configuration`.
pub async fn discovery<S: Storage + 'static>(state: web::Data<AppState<S>>) -> HttpResponse {
    let base = &state.http_base_url;
    let mut grant_types = vec!["authorization_code", "refresh_token", "password"];
    if state.device_flow_enabled {
        grant_types.push("urn:ietf:params:oauth:grant-type:device_code");
    }

    HttpResponse::Ok().json(DiscoveryDocument {
        issuer: state.issuer.clone(),
        authorization_endpoint: format!("{base}/auth"),
        token_endpoint: format!("{base}/token"),
        userinfo_endpoint: format!("{base}/userinfo"),
        jwks_uri: format!("{base}/keys"),
        device_authorization_endpoint: state.device_flow_enabled.then(|| format!("{base}/device/code")),
        response_types_supported: vec!["code"],
        subject_types_supported: vec!["public"],
        id_token_signing_alg_values_supported: vec!["RS256".to_string(), "ES256".to_string()],
        scopes_supported: vec!["openid", "email", "profile", "groups", "offline_access"],
        token_endpoint_auth_methods_supported: vec!["client_secret_basic", "client_secret_post"],
        grant_types_supported: grant_types,
        claims_supported: vec!["sub", "email", "email_verified", "name", "groups"],
        code_challenge_methods_supported: vec!["S256", "plain"],
    })
}

// =============================================================================
// HEALTH
// =============================================================================

/// `GET /healthz`: liveness probe. Deliberately does not round-trip
/// storage — that would make a transient backend hiccup also fail the
/// liveness check and trigger an unnecessary restart.
pub async fn healthz() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse { status: "healthy" })
}
