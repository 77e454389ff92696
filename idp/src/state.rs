//! # Shared Application State
//!
//! One [`AppState`] is constructed in `main.rs` and wrapped in
//! [`actix_web::web::Data`] for the HTTP surface, and handed to the
//! [`crate::grpc`] service for the admin surface — both read from the same
//! storage handle, signer, and service layer (spec §6 "process wiring").
//!
//! `Storage` is threaded through as a concrete, `main.rs`-selected type
//! parameter rather than `Arc<dyn Storage>`: every service already is
//! generic over `S: Storage`, and a concrete type lets `sqlx`/in-memory
//! specific methods stay monomorphized rather than forcing dynamic dispatch
//! down every call path.

use std::sync::Arc;

use fedid_core::connector::ConnectorRegistry;
use fedid_core::middleware::MiddlewareChain;
use fedid_core::signer::Signer;
use fedid_core::storage::Storage;
use fedid_core::token::TokenFactory;

use crate::service::{AuthorizationService, DeviceFlowService, PasswordService, RefreshTokenService};

pub struct AppState<S: Storage + ?Sized> {
    pub storage: Arc<S>,
    pub signer: Arc<Signer<S>>,
    pub token_factory: Arc<TokenFactory<S>>,
    pub connectors: Arc<ConnectorRegistry<S>>,
    pub middleware: MiddlewareChain,
    pub authorization: Arc<AuthorizationService<S>>,
    pub refresh: Arc<RefreshTokenService<S>>,
    pub password: Arc<PasswordService<S>>,
    pub device: Arc<DeviceFlowService<S>>,
    pub issuer: String,
    pub http_base_url: String,
    pub device_flow_enabled: bool,
}
