//! # Connector Registry (C4)
//!
//! An upstream identity source — a redirect-based OIDC provider, a SAML
//! IdP, or the local password store — is represented behind the
//! [`Connector`] trait family. The registry loads serialized
//! [`ConnectorConfig`](crate::storage::entities::ConnectorConfig) rows from
//! storage, instantiates each connector once, and caches it until
//! `reload_from_store` is called (spec §4.4).
//!
//! Each connector advertises a capability set rather than implementing
//! every trait: a SAML connector typically supports redirect + callback but
//! not password; the local connector supports password only.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::errors::ConnectorError;
use crate::storage::entities::{ConnectorConfig, Identity};
use crate::storage::ConnectorConfigStore;

/// Capabilities a connector implementation may expose. Mirrors the
/// dex-style connector interface split (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorCapability {
    Redirect,
    Callback,
    Refresh,
    Password,
    Groups,
}

/// Common identity shared by every connector kind.
#[async_trait]
pub trait Connector: Send + Sync {
    fn id(&self) -> &str;
    fn capabilities(&self) -> &[ConnectorCapability];
}

/// A connector the user is redirected to (e.g. an upstream OIDC provider).
#[async_trait]
pub trait RedirectConnector: Connector {
    /// Builds the URL to redirect the user agent to, given this service's
    /// callback URL and an opaque state value round-tripped back in the
    /// callback.
    async fn login_url(&self, callback_url: &str, state: &str) -> Result<String, ConnectorError>;

    /// Exchanges the callback's query parameters for a resolved identity.
    async fn handle_callback(
        &self,
        query: &HashMap<String, String>,
    ) -> Result<Identity, ConnectorError>;

    /// Re-resolves the identity from a refresh token's stored
    /// `connector_data`, without round-tripping the user through the
    /// redirect flow again. Backs the `Refresh` capability; connectors that
    /// don't support it return [`ConnectorError::Failure`].
    async fn refresh(&self, _connector_data: &[u8]) -> Result<Identity, ConnectorError> {
        Err(ConnectorError::Failure {
            connector_id: self.id().to_string(),
            detail: "connector does not support refresh".into(),
        })
    }
}

/// A connector that authenticates directly against provided credentials
/// (e.g. the local password store, C8).
#[async_trait]
pub trait PasswordConnector: Connector {
    async fn login(&self, username: &str, password: &str) -> Result<Identity, ConnectorError>;
}

/// Type-erased handle to a connector, downcast by the caller based on
/// `capabilities()`.
pub enum AnyConnector {
    Redirect(Arc<dyn RedirectConnector>),
    Password(Arc<dyn PasswordConnector>),
}

impl AnyConnector {
    pub fn id(&self) -> &str {
        match self {
            AnyConnector::Redirect(c) => c.id(),
            AnyConnector::Password(c) => c.id(),
        }
    }

    pub fn capabilities(&self) -> &[ConnectorCapability] {
        match self {
            AnyConnector::Redirect(c) => c.capabilities(),
            AnyConnector::Password(c) => c.capabilities(),
        }
    }

    pub fn as_redirect(&self) -> Option<&Arc<dyn RedirectConnector>> {
        match self {
            AnyConnector::Redirect(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_password(&self) -> Option<&Arc<dyn PasswordConnector>> {
        match self {
            AnyConnector::Password(c) => Some(c),
            _ => None,
        }
    }
}

/// A factory that turns a persisted [`ConnectorConfig`] into a live
/// connector instance. The `idp` binary registers one factory per
/// supported `connector_type` string (e.g. `"oidc"`, `"local"`).
pub trait ConnectorFactory: Send + Sync {
    fn connector_type(&self) -> &'static str;
    fn build(&self, config: &ConnectorConfig) -> Result<AnyConnector, ConnectorError>;
}

/// Caches instantiated connectors, keyed by id, and knows how to rebuild
/// the cache from storage.
pub struct ConnectorRegistry<S: ?Sized> {
    storage: Arc<S>,
    factories: Vec<Arc<dyn ConnectorFactory>>,
    connectors: RwLock<HashMap<String, Arc<AnyConnector>>>,
}

impl<S: ConnectorConfigStore + ?Sized> ConnectorRegistry<S> {
    pub fn new(storage: Arc<S>, factories: Vec<Arc<dyn ConnectorFactory>>) -> Self {
        Self {
            storage,
            factories,
            connectors: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuilds the connector cache from the current storage contents.
    /// Instantiation errors for one connector don't block the others; the
    /// bad connector is simply absent from the cache and a caller asking
    /// for it by id sees [`ConnectorError::NotFound`].
    pub async fn reload_from_store(&self) -> Result<(), ConnectorError> {
        let configs = self.storage.list_connector_configs().await?;
        let mut built = HashMap::new();
        for config in configs {
            let Some(factory) = self
                .factories
                .iter()
                .find(|f| f.connector_type() == config.connector_type)
            else {
                tracing::warn!(
                    connector_id = %config.id,
                    connector_type = %config.connector_type,
                    "no factory registered for connector type, skipping"
                );
                continue;
            };
            match factory.build(&config) {
                Ok(connector) => {
                    built.insert(config.id.clone(), Arc::new(connector));
                }
                Err(err) => {
                    tracing::warn!(connector_id = %config.id, error = %err, "failed to build connector");
                }
            }
        }
        *self.connectors.write().await = built;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Arc<AnyConnector>, ConnectorError> {
        self.connectors
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ConnectorError::NotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<Arc<AnyConnector>> {
        self.connectors.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    struct StubPasswordConnector {
        id: String,
        capabilities: Vec<ConnectorCapability>,
    }

    #[async_trait]
    impl Connector for StubPasswordConnector {
        fn id(&self) -> &str {
            &self.id
        }
        fn capabilities(&self) -> &[ConnectorCapability] {
            &self.capabilities
        }
    }

    #[async_trait]
    impl PasswordConnector for StubPasswordConnector {
        async fn login(&self, username: &str, _password: &str) -> Result<Identity, ConnectorError> {
            if username == "known" {
                Ok(Identity {
                    user_id: "user-1".into(),
                    username: username.into(),
                    preferred_username: username.into(),
                    email: "user@example.com".into(),
                    email_verified: true,
                    groups: vec![],
                    custom_claims: Default::default(),
                    connector_data: vec![],
                })
            } else {
                Err(ConnectorError::InvalidCredentials)
            }
        }
    }

    struct StubFactory;

    impl ConnectorFactory for StubFactory {
        fn connector_type(&self) -> &'static str {
            "stub"
        }
        fn build(&self, config: &ConnectorConfig) -> Result<AnyConnector, ConnectorError> {
            Ok(AnyConnector::Password(Arc::new(StubPasswordConnector {
                id: config.id.clone(),
                capabilities: vec![ConnectorCapability::Password],
            })))
        }
    }

    #[tokio::test]
    async fn reload_builds_registered_connector_types() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .put_connector_config(ConnectorConfig {
                id: "local".into(),
                connector_type: "stub".into(),
                config: vec![],
            })
            .await
            .unwrap();

        let registry = ConnectorRegistry::new(storage, vec![Arc::new(StubFactory)]);
        registry.reload_from_store().await.unwrap();

        let connector = registry.get("local").await.unwrap();
        assert_eq!(connector.id(), "local");
        assert!(connector
            .capabilities()
            .contains(&ConnectorCapability::Password));
    }

    #[tokio::test]
    async fn unknown_connector_type_is_skipped_not_fatal() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .put_connector_config(ConnectorConfig {
                id: "mystery".into(),
                connector_type: "does-not-exist".into(),
                config: vec![],
            })
            .await
            .unwrap();

        let registry = ConnectorRegistry::new(storage, vec![Arc::new(StubFactory)]);
        registry.reload_from_store().await.unwrap();
        assert!(matches!(
            registry.get("mystery").await,
            Err(ConnectorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn get_missing_connector_returns_not_found() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = ConnectorRegistry::new(storage, vec![Arc::new(StubFactory)]);
        registry.reload_from_store().await.unwrap();
        assert!(matches!(
            registry.get("nope").await,
            Err(ConnectorError::NotFound(_))
        ));
    }
}
