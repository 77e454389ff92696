//! # Storage Abstraction (C1)
//!
//! A single interface bundle exposes per-entity repositories over the
//! entities in [`entities`]. Two adapters share the same trait bundle and
//! the same [`StorageExt::perform_in_transaction`] contract:
//!
//! | Adapter | Module | Isolation |
//! |---------|--------|-----------|
//! | In-memory | [`memory`] | one global lock emulates a transaction |
//! | Postgres | [`postgres`] | `sqlx::Transaction`, serializable-equivalent, retry on `23505`/`40001` |
//!
//! ## Transactions
//!
//! All multi-step operations (code redemption, refresh rotation, user
//! create-with-remote-identity) run inside [`StorageExt::perform_in_transaction`]
//! with at-least snapshot isolation. A write conflict surfaces as
//! [`StorageError::Conflict`]; callers retry idempotent outer operations with
//! jittered backoff (see [`retry_on_conflict`]).
//!
//! ## Invariant enforcement
//!
//! Email-case normalization happens at the boundary of the store: callers
//! see whatever case was persisted, but uniqueness compares fold-case.

pub mod entities;
pub mod memory;
pub mod postgres;

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::Rng;

use crate::errors::{StorageError, StorageResult};
use entities::{
    AuthCode, Client, ConnectorConfig, DeviceAuthorization, PasswordInfo, RefreshToken, Session,
    SigningKey, User,
};

#[async_trait]
pub trait ClientStore: Send + Sync {
    async fn get_client(&self, id: &str) -> StorageResult<Client>;
    async fn list_clients(&self) -> StorageResult<Vec<Client>>;
    async fn create_client(&self, client: Client) -> StorageResult<()>;
    async fn update_client(&self, id: &str, update: ClientUpdate) -> StorageResult<()>;
    async fn delete_client(&self, id: &str) -> StorageResult<()>;
}

/// Explicit per-field update for a [`Client`], replacing the source's
/// variadic-any update dispatch with nullable fields (spec §9).
#[derive(Debug, Clone, Default)]
pub struct ClientUpdate {
    pub name: Option<String>,
    pub redirect_uris: Option<Vec<String>>,
    pub logo_url: Option<Option<String>>,
    pub trusted_peers: Option<Vec<String>>,
    pub secret: Option<Option<Vec<u8>>>,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, id: &str) -> StorageResult<User>;
    async fn get_user_by_email(&self, email: &str) -> StorageResult<User>;
    async fn get_user_by_remote_identity(
        &self,
        connector_id: &str,
        remote_id: &str,
    ) -> StorageResult<User>;
    async fn list_users(&self) -> StorageResult<Vec<User>>;
    async fn create_user(&self, user: User) -> StorageResult<()>;
    async fn update_user(&self, user: User) -> StorageResult<()>;
    async fn delete_user(&self, id: &str) -> StorageResult<()>;
}

#[async_trait]
pub trait PasswordStore: Send + Sync {
    async fn get_password(&self, email: &str) -> StorageResult<PasswordInfo>;
    async fn list_passwords(&self) -> StorageResult<Vec<PasswordInfo>>;
    async fn create_password(&self, password: PasswordInfo) -> StorageResult<()>;
    async fn update_password(&self, password: PasswordInfo) -> StorageResult<()>;
    async fn delete_password(&self, email: &str) -> StorageResult<()>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, id: &str) -> StorageResult<Session>;
    async fn create_session(&self, session: Session) -> StorageResult<()>;
    async fn update_session(&self, session: Session) -> StorageResult<()>;
    async fn delete_session(&self, id: &str) -> StorageResult<()>;
    /// Deletes every session whose `expires_at` is before `now`, returning
    /// the number removed. Driven by the periodic sweeper (§4.6).
    async fn delete_expired_sessions(&self, now: chrono::DateTime<chrono::Utc>)
        -> StorageResult<u64>;
}

#[async_trait]
pub trait AuthCodeStore: Send + Sync {
    /// Atomically fetches and removes the code, so two concurrent
    /// redemptions can never both succeed (spec §4.6 step 2).
    async fn take_auth_code(&self, code: &str) -> StorageResult<AuthCode>;
    async fn create_auth_code(&self, code: AuthCode) -> StorageResult<()>;
    async fn delete_expired_auth_codes(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> StorageResult<u64>;
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn get_refresh_token(&self, id: i64) -> StorageResult<RefreshToken>;
    async fn list_refresh_tokens_for(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> StorageResult<Vec<RefreshToken>>;
    async fn list_clients_with_refresh_tokens(&self, user_id: &str) -> StorageResult<Vec<String>>;
    async fn create_refresh_token(&self, token: RefreshToken) -> StorageResult<i64>;
    async fn update_refresh_token(&self, token: RefreshToken) -> StorageResult<()>;
    async fn delete_refresh_token(&self, id: i64) -> StorageResult<()>;
    async fn revoke_for_client(&self, user_id: &str, client_id: &str) -> StorageResult<u64>;
    async fn delete_expired_refresh_tokens(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> StorageResult<u64>;
}

#[async_trait]
pub trait SigningKeyStore: Send + Sync {
    async fn get_active_signing_key(&self) -> StorageResult<Option<SigningKey>>;
    async fn list_verification_keys(&self) -> StorageResult<Vec<SigningKey>>;
    async fn put_signing_key(&self, key: SigningKey) -> StorageResult<()>;
    async fn prune_expired_signing_keys(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> StorageResult<u64>;
}

#[async_trait]
pub trait DeviceAuthorizationStore: Send + Sync {
    async fn create_device_authorization(&self, auth: DeviceAuthorization) -> StorageResult<()>;
    async fn get_device_authorization_by_user_code(
        &self,
        user_code: &str,
    ) -> StorageResult<DeviceAuthorization>;
    async fn update_device_authorization(&self, auth: DeviceAuthorization) -> StorageResult<()>;
    /// Atomically fetches and removes the row once the device successfully
    /// exchanges it for tokens, so a device-code is redeemable at most once.
    async fn take_device_authorization(&self, device_code: &str) -> StorageResult<DeviceAuthorization>;
    /// Non-consuming read used by the polling loop while `approved` is
    /// still `None`.
    async fn peek_device_authorization(&self, device_code: &str) -> StorageResult<DeviceAuthorization>;
    async fn delete_expired_device_authorizations(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> StorageResult<u64>;
}

#[async_trait]
pub trait ConnectorConfigStore: Send + Sync {
    async fn list_connector_configs(&self) -> StorageResult<Vec<ConnectorConfig>>;
    async fn put_connector_config(&self, config: ConnectorConfig) -> StorageResult<()>;
}

/// Unifying bundle every adapter implements; `idp` depends on this trait
/// object, never on a concrete backend.
///
/// [`perform_in_transaction_erased`](Storage::perform_in_transaction_erased) is
/// the only transaction primitive the trait itself declares. It carries no
/// generic type parameter, so `Storage` stays object-safe and `&dyn Storage`
/// remains a well-formed type (a generic method here, even one used only
/// through `Arc<S>`-generic call sites, would make `dyn Storage` illegal to
/// form anywhere in the crate). Callers use the ergonomic generic wrapper on
/// [`StorageExt`] instead, which boxes its typed result as `dyn Any` on the
/// way in and downcasts it back out.
pub trait Storage:
    ClientStore
    + UserStore
    + PasswordStore
    + SessionStore
    + AuthCodeStore
    + RefreshTokenStore
    + SigningKeyStore
    + DeviceAuthorizationStore
    + ConnectorConfigStore
    + Send
    + Sync
{
    /// Runs `f` against a transactional view of this storage with
    /// at-least snapshot isolation. The in-memory adapter emulates this
    /// with a single global lock; the Postgres adapter opens an
    /// `sqlx::Transaction` at the serializable-equivalent level.
    ///
    /// `f` receives the same `&dyn Storage` bundle, scoped to the
    /// transaction's lifetime, so call sites read identically whether or
    /// not a transaction is active. The result is type-erased; use
    /// [`StorageExt::perform_in_transaction`] rather than calling this
    /// directly.
    fn perform_in_transaction_erased<'a>(
        &'a self,
        f: Box<
            dyn FnOnce(&'a dyn Storage) -> BoxFuture<'a, StorageResult<Box<dyn Any + Send>>>
                + Send
                + 'a,
        >,
    ) -> BoxFuture<'a, StorageResult<Box<dyn Any + Send>>>;
}

/// Generic convenience layer over [`Storage::perform_in_transaction_erased`].
/// Blanket-implemented for every `Storage`, but the method itself requires
/// `Self: Sized` so it can only be called through a concrete backend type
/// (`Arc<MemoryStorage>`, `Arc<PostgresStorage>`, …) — never through
/// `dyn Storage`, which is exactly what keeps the underlying trait
/// object-safe.
pub trait StorageExt: Storage {
    fn perform_in_transaction<'a, T, F>(&'a self, f: F) -> BoxFuture<'a, StorageResult<T>>
    where
        Self: Sized,
        T: Send + 'static,
        F: FnOnce(&'a dyn Storage) -> BoxFuture<'a, StorageResult<T>> + Send + 'a,
    {
        Box::pin(async move {
            let erased = self
                .perform_in_transaction_erased(Box::new(move |txn: &'a dyn Storage| {
                    Box::pin(async move {
                        let value = f(txn).await?;
                        Ok(Box::new(value) as Box<dyn Any + Send>)
                    }) as BoxFuture<'a, StorageResult<Box<dyn Any + Send>>>
                }))
                .await?;
            Ok(*erased
                .downcast::<T>()
                .expect("perform_in_transaction: result type mismatch"))
        })
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}

/// Retries `op` up to `max_attempts` times with jittered backoff when it
/// fails with [`StorageError::Conflict`], matching §7's "up to 3 retries,
/// 25–100ms jitter" policy before surfacing as `Internal`.
pub async fn retry_on_conflict<T, F, Fut>(max_attempts: u32, mut op: F) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = StorageResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(StorageError::Conflict) if attempt + 1 < max_attempts => {
                attempt += 1;
                let jitter_ms = rand::thread_rng().gen_range(25..=100);
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            }
            Err(StorageError::Conflict) => {
                return Err(StorageError::Internal(
                    "write conflict persisted after retries".into(),
                ))
            }
            other => return other,
        }
    }
}

pub(crate) fn fold_case(email: &str) -> String {
    email.to_lowercase()
}
