//! # Device Authorization Grant Service (RFC 8628)
//!
//! Runs the device flow's own small state machine alongside the
//! authorization-code one in [`authorization`](crate::service::authorization):
//! a device with no browser calls [`DeviceFlowService::start`] to obtain a
//! `device_code`/`user_code` pair, the end user resolves it at the
//! verification page via [`DeviceFlowService::approve`] (using whatever
//! identity their own browser session already authenticated), and the
//! device polls [`DeviceFlowService::poll`] until it sees an outcome.
//!
//! `user_code` is drawn from an alphabet with ambiguous characters removed
//! (no `0`/`O`, `1`/`I`/`L`, vowels) so it reads back correctly over a phone
//! or a TV remote; `device_code` carries the same entropy budget as a
//! refresh-token payload since it is just as sensitive.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::Rng;

use fedid_core::crypto::random_token;
use fedid_core::storage::entities::{DeviceAuthorization, Identity};
use fedid_core::storage::{DeviceAuthorizationStore, Storage};

use crate::error::ApiError;
use crate::service::authorization::{validate_and_filter_scopes, AuthorizationService, IssuedTokens};

const DEVICE_CODE_ENTROPY_BYTES: usize = 32;
const USER_CODE_ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ23456789";
const USER_CODE_GROUP_LEN: usize = 4;
const USER_CODE_GROUPS: usize = 2;

pub struct StartDeviceAuthorization {
    pub client_id: String,
    pub scope: String,
}

pub struct DeviceAuthorizationHandle {
    pub device_code: String,
    pub user_code: String,
    pub expires_in: i64,
    pub interval: i64,
}

/// Outcome of a poll once the end user has decided.
pub struct ApprovedGrant {
    pub client_id: String,
    pub scopes: Vec<String>,
    pub identity: Identity,
}

pub struct DeviceFlowService<S: ?Sized> {
    storage: Arc<S>,
    lifetime: Duration,
    interval_seconds: i64,
}

impl<S> DeviceFlowService<S>
where
    S: Storage,
{
    pub fn new(storage: Arc<S>, lifetime: Duration, interval_seconds: i64) -> Self {
        Self {
            storage,
            lifetime,
            interval_seconds,
        }
    }

    /// `POST /device/code`.
    pub async fn start(
        &self,
        request: StartDeviceAuthorization,
    ) -> Result<DeviceAuthorizationHandle, ApiError> {
        let client = self
            .storage
            .get_client(&request.client_id)
            .await
            .map_err(|_| ApiError::InvalidClient)?;
        if !client.device_flow {
            return Err(ApiError::InvalidRequest(
                "client is not enabled for the device authorization grant".into(),
            ));
        }
        let scopes = validate_and_filter_scopes(&request.scope, &client)?;

        let now = Utc::now();
        let device_code = random_token(DEVICE_CODE_ENTROPY_BYTES);
        let user_code = generate_user_code();

        self.storage
            .create_device_authorization(DeviceAuthorization {
                device_code: device_code.clone(),
                user_code: user_code.clone(),
                client_id: request.client_id,
                scopes,
                created_at: now,
                expires_at: now + self.lifetime,
                last_poll_at: None,
                approved: None,
                identity: None,
            })
            .await?;

        Ok(DeviceAuthorizationHandle {
            device_code,
            user_code,
            expires_in: self.lifetime.num_seconds(),
            interval: self.interval_seconds,
        })
    }

    /// Resolves a pending authorization at the verification page, keyed by
    /// the `user_code` the end user typed in. `identity` is `None` on
    /// denial; on approval it's the identity their browser session already
    /// resolved, persisted so the device's eventual poll can mint tokens
    /// from it without asking the user to authenticate twice.
    pub async fn approve(
        &self,
        user_code: &str,
        approved: bool,
        identity: Option<Identity>,
    ) -> Result<(), ApiError> {
        let mut auth = self
            .storage
            .get_device_authorization_by_user_code(user_code)
            .await
            .map_err(|_| ApiError::InvalidRequest("unknown or expired user_code".into()))?;

        if auth.expires_at <= Utc::now() {
            return Err(ApiError::InvalidRequest("user_code has expired".into()));
        }
        if auth.approved.is_some() {
            return Err(ApiError::InvalidRequest(
                "user_code has already been resolved".into(),
            ));
        }

        auth.approved = Some(approved);
        if approved {
            auth.identity = identity;
        }
        self.storage.update_device_authorization(auth).await?;
        Ok(())
    }

    /// `POST /token` with `grant_type=urn:ietf:params:oauth:grant-type:device_code`.
    /// Returns the approved grant's pieces so the caller mints tokens via
    /// [`AuthorizationService::mint_tokens_for_device`]; keeping minting out
    /// of this service avoids duplicating the scope-to-claims wiring.
    pub async fn poll(&self, device_code: &str) -> Result<ApprovedGrant, ApiError> {
        let auth = self
            .storage
            .peek_device_authorization(device_code)
            .await
            .map_err(|_| ApiError::DeviceCodeExpired)?;

        if auth.expires_at <= Utc::now() {
            self.storage.take_device_authorization(device_code).await.ok();
            return Err(ApiError::DeviceCodeExpired);
        }

        match auth.approved {
            None => {
                self.enforce_poll_interval(&auth).await?;
                Err(ApiError::DeviceAuthorizationPending)
            }
            Some(false) => {
                self.storage.take_device_authorization(device_code).await.ok();
                Err(ApiError::AccessDenied)
            }
            Some(true) => {
                let mut consumed = self.storage.take_device_authorization(device_code).await?;
                let identity = consumed
                    .identity
                    .take()
                    .ok_or_else(|| ApiError::Internal("approved device authorization missing identity".into()))?;
                Ok(ApprovedGrant {
                    client_id: consumed.client_id,
                    scopes: consumed.scopes,
                    identity,
                })
            }
        }
    }

    /// RFC 8628 §3.5: a poll inside the advertised `interval` gets
    /// `slow_down` instead of `authorization_pending`.
    async fn enforce_poll_interval(&self, auth: &DeviceAuthorization) -> Result<(), ApiError> {
        if let Some(last_poll) = auth.last_poll_at {
            if Utc::now() - last_poll < Duration::seconds(self.interval_seconds) {
                let mut updated = auth.clone();
                updated.last_poll_at = Some(Utc::now());
                self.storage.update_device_authorization(updated).await?;
                return Err(ApiError::DeviceSlowDown);
            }
        }
        let mut updated = auth.clone();
        updated.last_poll_at = Some(Utc::now());
        self.storage.update_device_authorization(updated).await?;
        Ok(())
    }
}

/// Mints tokens for an [`ApprovedGrant`], the glue `main.rs`'s `/token`
/// handler calls after [`DeviceFlowService::poll`] succeeds.
pub async fn issue_tokens_for_grant<S: Storage>(
    authorization: &AuthorizationService<S>,
    grant: ApprovedGrant,
) -> Result<IssuedTokens, ApiError> {
    authorization
        .mint_tokens_for_device(&grant.client_id, &grant.identity, &grant.scopes, None)
        .await
}

fn generate_user_code() -> String {
    let mut rng = rand::thread_rng();
    let mut code = String::with_capacity(USER_CODE_GROUPS * USER_CODE_GROUP_LEN + USER_CODE_GROUPS - 1);
    for group in 0..USER_CODE_GROUPS {
        if group > 0 {
            code.push('-');
        }
        for _ in 0..USER_CODE_GROUP_LEN {
            let idx = rng.gen_range(0..USER_CODE_ALPHABET.len());
            code.push(USER_CODE_ALPHABET[idx] as char);
        }
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedid_core::storage::entities::Client;
    use fedid_core::storage::memory::MemoryStorage;
    use std::collections::HashMap;

    async fn setup_with_client(device_flow: bool) -> (Arc<MemoryStorage>, DeviceFlowService<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .create_client(Client {
                id: "tv-app".into(),
                secret: None,
                redirect_uris: vec![],
                logo_url: None,
                name: "TV App".into(),
                trusted_peers: vec![],
                public: true,
                admin: false,
                device_flow,
            })
            .await
            .unwrap();
        let service = DeviceFlowService::new(storage.clone(), Duration::minutes(10), 5);
        (storage, service)
    }

    fn sample_identity() -> Identity {
        Identity {
            user_id: "user-1".into(),
            username: "person".into(),
            preferred_username: "person".into(),
            email: "person@example.com".into(),
            email_verified: true,
            groups: vec![],
            custom_claims: HashMap::new(),
            connector_data: vec![],
        }
    }

    #[tokio::test]
    async fn start_rejects_client_without_device_flow_enabled() {
        let (_storage, service) = setup_with_client(false).await;
        let result = service
            .start(StartDeviceAuthorization {
                client_id: "tv-app".into(),
                scope: "openid".into(),
            })
            .await;
        assert!(matches!(result, Err(ApiError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn poll_before_approval_is_pending() {
        let (_storage, service) = setup_with_client(true).await;
        let handle = service
            .start(StartDeviceAuthorization {
                client_id: "tv-app".into(),
                scope: "openid".into(),
            })
            .await
            .unwrap();
        let result = service.poll(&handle.device_code).await;
        assert!(matches!(result, Err(ApiError::DeviceAuthorizationPending)));
    }

    #[tokio::test]
    async fn poll_immediately_after_pending_is_slow_down() {
        let (_storage, service) = setup_with_client(true).await;
        let handle = service
            .start(StartDeviceAuthorization {
                client_id: "tv-app".into(),
                scope: "openid".into(),
            })
            .await
            .unwrap();
        let _ = service.poll(&handle.device_code).await;
        let second = service.poll(&handle.device_code).await;
        assert!(matches!(second, Err(ApiError::DeviceSlowDown)));
    }

    #[tokio::test]
    async fn approve_then_poll_returns_grant() {
        let (_storage, service) = setup_with_client(true).await;
        let handle = service
            .start(StartDeviceAuthorization {
                client_id: "tv-app".into(),
                scope: "openid email".into(),
            })
            .await
            .unwrap();

        service
            .approve(&handle.user_code, true, Some(sample_identity()))
            .await
            .unwrap();

        let grant = service.poll(&handle.device_code).await.unwrap();
        assert_eq!(grant.client_id, "tv-app");
        assert_eq!(grant.identity.user_id, "user-1");
    }

    #[tokio::test]
    async fn denied_authorization_surfaces_access_denied() {
        let (_storage, service) = setup_with_client(true).await;
        let handle = service
            .start(StartDeviceAuthorization {
                client_id: "tv-app".into(),
                scope: "openid".into(),
            })
            .await
            .unwrap();

        service.approve(&handle.user_code, false, None).await.unwrap();

        let result = service.poll(&handle.device_code).await;
        assert!(matches!(result, Err(ApiError::AccessDenied)));
    }

    #[tokio::test]
    async fn device_code_is_redeemable_only_once() {
        let (_storage, service) = setup_with_client(true).await;
        let handle = service
            .start(StartDeviceAuthorization {
                client_id: "tv-app".into(),
                scope: "openid".into(),
            })
            .await
            .unwrap();
        service
            .approve(&handle.user_code, true, Some(sample_identity()))
            .await
            .unwrap();

        service.poll(&handle.device_code).await.unwrap();
        let second = service.poll(&handle.device_code).await;
        assert!(matches!(second, Err(ApiError::DeviceCodeExpired)));
    }

    #[test]
    fn user_code_uses_unambiguous_alphabet_and_expected_shape() {
        let code = generate_user_code();
        assert_eq!(code.len(), USER_CODE_GROUPS * USER_CODE_GROUP_LEN + (USER_CODE_GROUPS - 1));
        assert!(code.contains('-'));
        for c in code.chars().filter(|c| *c != '-') {
            assert!(USER_CODE_ALPHABET.contains(&(c as u8)), "unexpected character {c}");
        }
    }
}
