//! # Concrete Connectors
//!
//! The connector registry (C4) works against the [`fedid_core::connector`]
//! trait family; this module supplies the two connector kinds this service
//! ships out of the box.
//!
//! | Module | Connector type | Capability |
//! |--------|-----------------|------------|
//! | [`local`] | `"local"` | [`fedid_core::connector::PasswordConnector`], backed by C8 |
//! | [`oidc`] | `"oidc"` | [`fedid_core::connector::RedirectConnector`], against a configured upstream OIDC provider |
//!
//! Any other upstream (LDAP, SAML, GitHub, GitLab, ...) only needs its own
//! `ConnectorFactory` registered with the same registry; none of the state
//! machine in [`crate::service::authorization`] is aware of connector kind
//! beyond the capability it advertises.

pub mod local;
pub mod oidc;

pub use local::LocalConnectorFactory;
pub use oidc::OidcConnectorFactory;
