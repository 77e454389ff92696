//! # Local Password Connector
//!
//! Implements [`PasswordConnector`] on top of the local credential store
//! ([`PasswordService`], C8), resolving the authenticated account's profile
//! via [`UserStore`] so the identity handed to the authorization state
//! machine carries a real email and display name rather than a bare id.

use std::sync::Arc;

use async_trait::async_trait;

use fedid_core::connector::{
    AnyConnector, Connector, ConnectorCapability, ConnectorFactory, PasswordConnector,
};
use fedid_core::errors::ConnectorError;
use fedid_core::storage::entities::{ConnectorConfig, Identity};
use fedid_core::storage::{PasswordStore, UserStore};

use crate::service::PasswordService;

const CONNECTOR_TYPE: &str = "local";
const CAPABILITIES: &[ConnectorCapability] = &[ConnectorCapability::Password];

pub struct LocalPasswordConnector<S: ?Sized> {
    id: String,
    password_service: Arc<PasswordService<S>>,
    storage: Arc<S>,
}

impl<S: PasswordStore + UserStore + Send + Sync + ?Sized> LocalPasswordConnector<S> {
    pub fn new(id: String, password_service: Arc<PasswordService<S>>, storage: Arc<S>) -> Self {
        Self {
            id,
            password_service,
            storage,
        }
    }
}

#[async_trait]
impl<S: PasswordStore + UserStore + Send + Sync + ?Sized> Connector for LocalPasswordConnector<S> {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[ConnectorCapability] {
        CAPABILITIES
    }
}

#[async_trait]
impl<S: PasswordStore + UserStore + Send + Sync + ?Sized> PasswordConnector for LocalPasswordConnector<S> {
    async fn login(&self, username: &str, password: &str) -> Result<Identity, ConnectorError> {
        let user_id = self
            .password_service
            .verify(username, password)
            .await
            .map_err(|_| ConnectorError::InvalidCredentials)?;

        let user = self.storage.get_user(&user_id).await?;

        Ok(Identity {
            user_id: user.id,
            username: user.email.clone(),
            preferred_username: user.display_name,
            email: user.email,
            email_verified: user.email_verified,
            groups: vec![],
            custom_claims: Default::default(),
            connector_data: vec![],
        })
    }
}

/// Builds a [`LocalPasswordConnector`] for each persisted `"local"`
/// connector config, sharing the process-wide [`PasswordService`].
pub struct LocalConnectorFactory<S: ?Sized> {
    password_service: Arc<PasswordService<S>>,
    storage: Arc<S>,
}

impl<S: PasswordStore + UserStore + Send + Sync + 'static> LocalConnectorFactory<S> {
    pub fn new(password_service: Arc<PasswordService<S>>, storage: Arc<S>) -> Self {
        Self {
            password_service,
            storage,
        }
    }
}

impl<S: PasswordStore + UserStore + Send + Sync + 'static> ConnectorFactory for LocalConnectorFactory<S> {
    fn connector_type(&self) -> &'static str {
        CONNECTOR_TYPE
    }

    fn build(&self, config: &ConnectorConfig) -> Result<AnyConnector, ConnectorError> {
        Ok(AnyConnector::Password(Arc::new(LocalPasswordConnector::new(
            config.id.clone(),
            self.password_service.clone(),
            self.storage.clone(),
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fedid_core::storage::entities::User;
    use fedid_core::storage::memory::MemoryStorage;

    async fn seeded_storage() -> Arc<MemoryStorage> {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .create_user(User {
                id: "user-1".into(),
                email: "admin@example.com".into(),
                email_verified: true,
                display_name: "Admin".into(),
                admin: true,
                disabled: false,
                created_at: Utc::now(),
                remote_identities: vec![],
            })
            .await
            .unwrap();
        storage
    }

    #[tokio::test]
    async fn login_resolves_identity_from_matched_user() {
        let storage = seeded_storage().await;
        let password_service = Arc::new(PasswordService::new(storage.clone(), 4, 8));
        password_service
            .set("admin@example.com", "user-1", "correct horse battery")
            .await
            .unwrap();

        let connector = LocalPasswordConnector::new("local".into(), password_service, storage);
        let identity = connector
            .login("admin@example.com", "correct horse battery")
            .await
            .unwrap();
        assert_eq!(identity.user_id, "user-1");
        assert_eq!(identity.email, "admin@example.com");
        assert!(identity.email_verified);
    }

    #[tokio::test]
    async fn login_rejects_wrong_password() {
        let storage = seeded_storage().await;
        let password_service = Arc::new(PasswordService::new(storage.clone(), 4, 8));
        password_service
            .set("admin@example.com", "user-1", "right-password")
            .await
            .unwrap();

        let connector = LocalPasswordConnector::new("local".into(), password_service, storage);
        let result = connector.login("admin@example.com", "wrong-password").await;
        assert!(matches!(result, Err(ConnectorError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn factory_builds_connector_advertising_password_capability() {
        let storage = seeded_storage().await;
        let password_service = Arc::new(PasswordService::new(storage.clone(), 4, 8));
        let factory = LocalConnectorFactory::new(password_service, storage);
        let connector = factory
            .build(&ConnectorConfig {
                id: "local".into(),
                connector_type: "local".into(),
                config: vec![],
            })
            .unwrap();
        assert_eq!(connector.id(), "local");
        assert!(connector.capabilities().contains(&ConnectorCapability::Password));
        assert!(connector.as_password().is_some());
    }
}
