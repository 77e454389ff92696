//! In-memory storage adapter.
//!
//! Backed by striped `RwLock<HashMap<..>>`s, one per entity. Used for tests
//! and single-node evaluation. Transactions are emulated with a single
//! global lock — callers never observe interleaved writes from another
//! `perform_in_transaction` body, at the cost of serializing all writers.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::Mutex as AsyncMutex;

use super::entities::{
    AuthCode, Client, ConnectorConfig, DeviceAuthorization, PasswordInfo, RefreshToken, Session,
    SigningKey, User,
};
use super::{fold_case, AuthCodeStore, ClientStore, ClientUpdate, ConnectorConfigStore};
use super::{DeviceAuthorizationStore, PasswordStore, RefreshTokenStore};
use super::{SessionStore, SigningKeyStore, Storage, UserStore};
use crate::errors::{StorageError, StorageResult};

#[derive(Default)]
struct Tables {
    clients: HashMap<String, Client>,
    users: HashMap<String, User>,
    passwords: HashMap<String, PasswordInfo>,
    sessions: HashMap<String, Session>,
    auth_codes: HashMap<String, AuthCode>,
    refresh_tokens: HashMap<i64, RefreshToken>,
    next_refresh_id: i64,
    signing_keys: HashMap<String, SigningKey>,
    device_authorizations: HashMap<String, DeviceAuthorization>,
    connector_configs: HashMap<String, ConnectorConfig>,
}

/// In-memory [`Storage`] implementation.
///
/// The global `tx_lock` is held for the duration of
/// [`StorageExt::perform_in_transaction`]; individual single-entity methods
/// take the fine-grained `RwLock` directly, since they're each already
/// atomic with respect to the table they touch.
pub struct MemoryStorage {
    tables: RwLock<Tables>,
    tx_lock: AsyncMutex<()>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            tx_lock: AsyncMutex::new(()),
        }
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientStore for MemoryStorage {
    async fn get_client(&self, id: &str) -> StorageResult<Client> {
        self.tables
            .read()
            .unwrap()
            .clients
            .get(id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn list_clients(&self) -> StorageResult<Vec<Client>> {
        Ok(self.tables.read().unwrap().clients.values().cloned().collect())
    }

    async fn create_client(&self, client: Client) -> StorageResult<()> {
        if client.redirect_uris.is_empty() && !client.device_flow {
            return Err(StorageError::InvalidArgument(
                "client must have at least one redirect URI unless device_flow is set".into(),
            ));
        }
        let mut tables = self.tables.write().unwrap();
        if tables.clients.contains_key(&client.id) {
            return Err(StorageError::DuplicateId);
        }
        tables.clients.insert(client.id.clone(), client);
        Ok(())
    }

    async fn update_client(&self, id: &str, update: ClientUpdate) -> StorageResult<()> {
        let mut tables = self.tables.write().unwrap();
        let client = tables.clients.get_mut(id).ok_or(StorageError::NotFound)?;
        if let Some(name) = update.name {
            client.name = name;
        }
        if let Some(redirect_uris) = update.redirect_uris {
            if redirect_uris.is_empty() && !client.device_flow {
                return Err(StorageError::InvalidArgument(
                    "client must have at least one redirect URI unless device_flow is set".into(),
                ));
            }
            client.redirect_uris = redirect_uris;
        }
        if let Some(logo_url) = update.logo_url {
            client.logo_url = logo_url;
        }
        if let Some(trusted_peers) = update.trusted_peers {
            client.trusted_peers = trusted_peers;
        }
        if let Some(secret) = update.secret {
            client.secret = secret;
        }
        Ok(())
    }

    async fn delete_client(&self, id: &str) -> StorageResult<()> {
        self.tables
            .write()
            .unwrap()
            .clients
            .remove(id)
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }
}

#[async_trait]
impl UserStore for MemoryStorage {
    async fn get_user(&self, id: &str) -> StorageResult<User> {
        self.tables.read().unwrap().users.get(id).cloned().ok_or(StorageError::NotFound)
    }

    async fn get_user_by_email(&self, email: &str) -> StorageResult<User> {
        let target = fold_case(email);
        self.tables
            .read()
            .unwrap()
            .users
            .values()
            .find(|u| fold_case(&u.email) == target)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn get_user_by_remote_identity(
        &self,
        connector_id: &str,
        remote_id: &str,
    ) -> StorageResult<User> {
        self.tables
            .read()
            .unwrap()
            .users
            .values()
            .find(|u| {
                u.remote_identities
                    .iter()
                    .any(|r| r.connector_id == connector_id && r.remote_id == remote_id)
            })
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn list_users(&self) -> StorageResult<Vec<User>> {
        Ok(self.tables.read().unwrap().users.values().cloned().collect())
    }

    async fn create_user(&self, user: User) -> StorageResult<()> {
        let target = fold_case(&user.email);
        let mut tables = self.tables.write().unwrap();
        if tables.users.contains_key(&user.id) {
            return Err(StorageError::DuplicateId);
        }
        if !user.email.is_empty() && tables.users.values().any(|u| fold_case(&u.email) == target) {
            return Err(StorageError::DuplicateEmail);
        }
        for ri in &user.remote_identities {
            if tables.users.values().any(|u| {
                u.remote_identities
                    .iter()
                    .any(|r| r.connector_id == ri.connector_id && r.remote_id == ri.remote_id)
            }) {
                return Err(StorageError::DuplicateRemoteIdentity);
            }
        }
        tables.users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn update_user(&self, user: User) -> StorageResult<()> {
        let mut tables = self.tables.write().unwrap();
        if !tables.users.contains_key(&user.id) {
            return Err(StorageError::NotFound);
        }
        tables.users.insert(user.id.clone(), user);
        Ok(())
    }

    async fn delete_user(&self, id: &str) -> StorageResult<()> {
        self.tables.write().unwrap().users.remove(id).map(|_| ()).ok_or(StorageError::NotFound)
    }
}

#[async_trait]
impl PasswordStore for MemoryStorage {
    async fn get_password(&self, email: &str) -> StorageResult<PasswordInfo> {
        let target = fold_case(email);
        self.tables
            .read()
            .unwrap()
            .passwords
            .get(&target)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn list_passwords(&self) -> StorageResult<Vec<PasswordInfo>> {
        // Empty table returns an empty Vec, never an error (spec §9).
        Ok(self.tables.read().unwrap().passwords.values().cloned().collect())
    }

    async fn create_password(&self, password: PasswordInfo) -> StorageResult<()> {
        let key = fold_case(&password.email);
        let mut tables = self.tables.write().unwrap();
        if tables.passwords.contains_key(&key) {
            return Err(StorageError::DuplicateId);
        }
        tables.passwords.insert(key, password);
        Ok(())
    }

    async fn update_password(&self, password: PasswordInfo) -> StorageResult<()> {
        let key = fold_case(&password.email);
        let mut tables = self.tables.write().unwrap();
        if !tables.passwords.contains_key(&key) {
            return Err(StorageError::NotFound);
        }
        tables.passwords.insert(key, password);
        Ok(())
    }

    async fn delete_password(&self, email: &str) -> StorageResult<()> {
        let key = fold_case(email);
        self.tables
            .write()
            .unwrap()
            .passwords
            .remove(&key)
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }
}

#[async_trait]
impl SessionStore for MemoryStorage {
    async fn get_session(&self, id: &str) -> StorageResult<Session> {
        self.tables.read().unwrap().sessions.get(id).cloned().ok_or(StorageError::NotFound)
    }

    async fn create_session(&self, session: Session) -> StorageResult<()> {
        let mut tables = self.tables.write().unwrap();
        if tables.sessions.contains_key(&session.id) {
            return Err(StorageError::DuplicateId);
        }
        tables.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn update_session(&self, session: Session) -> StorageResult<()> {
        let mut tables = self.tables.write().unwrap();
        if !tables.sessions.contains_key(&session.id) {
            return Err(StorageError::NotFound);
        }
        tables.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> StorageResult<()> {
        self.tables.write().unwrap().sessions.remove(id).map(|_| ()).ok_or(StorageError::NotFound)
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let mut tables = self.tables.write().unwrap();
        let before = tables.sessions.len();
        tables.sessions.retain(|_, s| s.expires_at > now);
        Ok((before - tables.sessions.len()) as u64)
    }
}

#[async_trait]
impl AuthCodeStore for MemoryStorage {
    async fn take_auth_code(&self, code: &str) -> StorageResult<AuthCode> {
        self.tables
            .write()
            .unwrap()
            .auth_codes
            .remove(code)
            .ok_or(StorageError::NotFound)
    }

    async fn create_auth_code(&self, code: AuthCode) -> StorageResult<()> {
        let mut tables = self.tables.write().unwrap();
        if tables.auth_codes.contains_key(&code.code) {
            return Err(StorageError::DuplicateId);
        }
        tables.auth_codes.insert(code.code.clone(), code);
        Ok(())
    }

    async fn delete_expired_auth_codes(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let mut tables = self.tables.write().unwrap();
        let before = tables.auth_codes.len();
        tables.auth_codes.retain(|_, c| c.expires_at > now);
        Ok((before - tables.auth_codes.len()) as u64)
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryStorage {
    async fn get_refresh_token(&self, id: i64) -> StorageResult<RefreshToken> {
        self.tables
            .read()
            .unwrap()
            .refresh_tokens
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn list_refresh_tokens_for(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> StorageResult<Vec<RefreshToken>> {
        Ok(self
            .tables
            .read()
            .unwrap()
            .refresh_tokens
            .values()
            .filter(|t| t.user_id == user_id && t.client_id == client_id)
            .cloned()
            .collect())
    }

    async fn list_clients_with_refresh_tokens(&self, user_id: &str) -> StorageResult<Vec<String>> {
        let tables = self.tables.read().unwrap();
        let mut clients: Vec<String> = tables
            .refresh_tokens
            .values()
            .filter(|t| t.user_id == user_id)
            .map(|t| t.client_id.clone())
            .collect();
        clients.sort();
        clients.dedup();
        Ok(clients)
    }

    async fn create_refresh_token(&self, mut token: RefreshToken) -> StorageResult<i64> {
        let mut tables = self.tables.write().unwrap();
        tables.next_refresh_id += 1;
        let id = tables.next_refresh_id;
        token.id = id;
        tables.refresh_tokens.insert(id, token);
        Ok(id)
    }

    async fn update_refresh_token(&self, token: RefreshToken) -> StorageResult<()> {
        let mut tables = self.tables.write().unwrap();
        if !tables.refresh_tokens.contains_key(&token.id) {
            return Err(StorageError::NotFound);
        }
        tables.refresh_tokens.insert(token.id, token);
        Ok(())
    }

    async fn delete_refresh_token(&self, id: i64) -> StorageResult<()> {
        self.tables
            .write()
            .unwrap()
            .refresh_tokens
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    async fn revoke_for_client(&self, user_id: &str, client_id: &str) -> StorageResult<u64> {
        let mut tables = self.tables.write().unwrap();
        let before = tables.refresh_tokens.len();
        tables
            .refresh_tokens
            .retain(|_, t| !(t.user_id == user_id && t.client_id == client_id));
        Ok((before - tables.refresh_tokens.len()) as u64)
    }

    async fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let mut tables = self.tables.write().unwrap();
        let before = tables.refresh_tokens.len();
        // Refresh tokens with no configured lifetime (0) never expire; the
        // service layer enforces `refresh_token_lifetime_seconds` against
        // `created_at` before calling this sweep.
        tables.refresh_tokens.retain(|_, t| t.last_used_at > now);
        Ok((before - tables.refresh_tokens.len()) as u64)
    }
}

#[async_trait]
impl SigningKeyStore for MemoryStorage {
    async fn get_active_signing_key(&self) -> StorageResult<Option<SigningKey>> {
        Ok(self
            .tables
            .read()
            .unwrap()
            .signing_keys
            .values()
            .find(|k| k.expires_at.is_none())
            .cloned())
    }

    async fn list_verification_keys(&self) -> StorageResult<Vec<SigningKey>> {
        Ok(self.tables.read().unwrap().signing_keys.values().cloned().collect())
    }

    async fn put_signing_key(&self, key: SigningKey) -> StorageResult<()> {
        let mut tables = self.tables.write().unwrap();
        if key.expires_at.is_none() {
            // Promoting a new active key demotes any existing one is the
            // signer's responsibility; storage just persists what it's given.
            for other in tables.signing_keys.values_mut() {
                if other.id != key.id && other.expires_at.is_none() {
                    return Err(StorageError::InvalidArgument(
                        "only one active signing key may exist at a time".into(),
                    ));
                }
            }
        }
        tables.signing_keys.insert(key.id.clone(), key);
        Ok(())
    }

    async fn prune_expired_signing_keys(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let mut tables = self.tables.write().unwrap();
        let before = tables.signing_keys.len();
        tables.signing_keys.retain(|_, k| k.expires_at.map(|e| e > now).unwrap_or(true));
        Ok((before - tables.signing_keys.len()) as u64)
    }
}

#[async_trait]
impl DeviceAuthorizationStore for MemoryStorage {
    async fn create_device_authorization(&self, auth: DeviceAuthorization) -> StorageResult<()> {
        let mut tables = self.tables.write().unwrap();
        if tables.device_authorizations.contains_key(&auth.device_code) {
            return Err(StorageError::DuplicateId);
        }
        tables.device_authorizations.insert(auth.device_code.clone(), auth);
        Ok(())
    }

    async fn get_device_authorization_by_user_code(
        &self,
        user_code: &str,
    ) -> StorageResult<DeviceAuthorization> {
        self.tables
            .read()
            .unwrap()
            .device_authorizations
            .values()
            .find(|a| a.user_code == user_code)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn update_device_authorization(&self, auth: DeviceAuthorization) -> StorageResult<()> {
        let mut tables = self.tables.write().unwrap();
        if !tables.device_authorizations.contains_key(&auth.device_code) {
            return Err(StorageError::NotFound);
        }
        tables.device_authorizations.insert(auth.device_code.clone(), auth);
        Ok(())
    }

    async fn take_device_authorization(&self, device_code: &str) -> StorageResult<DeviceAuthorization> {
        self.tables
            .write()
            .unwrap()
            .device_authorizations
            .remove(device_code)
            .ok_or(StorageError::NotFound)
    }

    async fn peek_device_authorization(&self, device_code: &str) -> StorageResult<DeviceAuthorization> {
        self.tables
            .read()
            .unwrap()
            .device_authorizations
            .get(device_code)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn delete_expired_device_authorizations(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let mut tables = self.tables.write().unwrap();
        let before = tables.device_authorizations.len();
        tables.device_authorizations.retain(|_, a| a.expires_at > now);
        Ok((before - tables.device_authorizations.len()) as u64)
    }
}

#[async_trait]
impl ConnectorConfigStore for MemoryStorage {
    async fn list_connector_configs(&self) -> StorageResult<Vec<ConnectorConfig>> {
        Ok(self.tables.read().unwrap().connector_configs.values().cloned().collect())
    }

    async fn put_connector_config(&self, config: ConnectorConfig) -> StorageResult<()> {
        self.tables.write().unwrap().connector_configs.insert(config.id.clone(), config);
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn perform_in_transaction_erased<'a>(
        &'a self,
        f: Box<
            dyn FnOnce(&'a dyn Storage) -> BoxFuture<'a, StorageResult<Box<dyn std::any::Any + Send>>>
                + Send
                + 'a,
        >,
    ) -> BoxFuture<'a, StorageResult<Box<dyn std::any::Any + Send>>> {
        Box::pin(async move {
            let _guard = self.tx_lock.lock().await;
            f(self).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_client(id: &str) -> Client {
        Client {
            id: id.to_string(),
            secret: Some(b"secret".to_vec()),
            redirect_uris: vec!["http://127.0.0.1:5555/callback".into()],
            logo_url: None,
            name: id.to_string(),
            trusted_peers: vec![],
            public: false,
            admin: false,
            device_flow: false,
        }
    }

    #[tokio::test]
    async fn create_and_get_client_round_trips() {
        let storage = MemoryStorage::new();
        storage.create_client(test_client("example-app")).await.unwrap();
        let fetched = storage.get_client("example-app").await.unwrap();
        assert_eq!(fetched.id, "example-app");
    }

    #[tokio::test]
    async fn duplicate_client_id_rejected() {
        let storage = MemoryStorage::new();
        storage.create_client(test_client("dup")).await.unwrap();
        let err = storage.create_client(test_client("dup")).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateId));
    }

    #[tokio::test]
    async fn zero_redirect_uris_requires_device_flow() {
        let storage = MemoryStorage::new();
        let mut client = test_client("device-client");
        client.redirect_uris.clear();
        let err = storage.create_client(client.clone()).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));

        client.device_flow = true;
        storage.create_client(client).await.unwrap();
    }

    #[tokio::test]
    async fn auth_code_redemption_is_one_shot() {
        let storage = MemoryStorage::new();
        let code = AuthCode {
            code: "abc".into(),
            session_id: "s1".into(),
            client_id: "example-app".into(),
            scopes: vec!["openid".into()],
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::seconds(60),
        };
        storage.create_auth_code(code).await.unwrap();
        storage.take_auth_code("abc").await.unwrap();
        let err = storage.take_auth_code("abc").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
    }

    #[tokio::test]
    async fn email_uniqueness_is_case_insensitive() {
        let storage = MemoryStorage::new();
        let mut user = User {
            id: "u1".into(),
            email: "Admin@Example.com".into(),
            email_verified: true,
            display_name: "Admin".into(),
            admin: true,
            disabled: false,
            created_at: Utc::now(),
            remote_identities: vec![],
        };
        storage.create_user(user.clone()).await.unwrap();
        user.id = "u2".into();
        user.email = "admin@example.com".into();
        let err = storage.create_user(user).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateEmail));
    }

    #[tokio::test]
    async fn device_authorization_redemption_is_one_shot() {
        let storage = MemoryStorage::new();
        let auth = DeviceAuthorization {
            device_code: "dev-1".into(),
            user_code: "ABCD-EFGH".into(),
            client_id: "example-app".into(),
            scopes: vec!["openid".into()],
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::minutes(10),
            last_poll_at: None,
            approved: None,
            identity: None,
        };
        storage.create_device_authorization(auth).await.unwrap();

        let by_user_code = storage
            .get_device_authorization_by_user_code("ABCD-EFGH")
            .await
            .unwrap();
        assert_eq!(by_user_code.device_code, "dev-1");

        storage.take_device_authorization("dev-1").await.unwrap();
        let err = storage.take_device_authorization("dev-1").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
    }

    #[tokio::test]
    async fn perform_in_transaction_runs_closure_against_same_storage() {
        use super::super::StorageExt;

        let storage = MemoryStorage::new();
        storage.create_client(test_client("tx-client")).await.unwrap();

        let result: StorageResult<Client> = storage
            .perform_in_transaction(|tx: &dyn Storage| {
                Box::pin(async move { tx.get_client("tx-client").await })
            })
            .await;

        assert_eq!(result.unwrap().id, "tx-client");
    }
}
