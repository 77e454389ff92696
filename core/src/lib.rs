//! # fedid-core
//!
//! Shared foundation for the fedid identity-provider binary: storage
//! abstraction, signing-key lifecycle, token factory, connector registry,
//! middleware pipeline, and the ambient concerns (config, errors, tracing,
//! validation) every component depends on.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         idp binary                          │
//! │  ┌─────────┐ ┌──────────┐ ┌───────────┐ ┌────────────────┐ │
//! │  │  api    │ │  grpc    │ │  service  │ │    state       │ │
//! │  └────┬────┘ └────┬─────┘ └─────┬─────┘ └───────┬────────┘ │
//! │       │           │             │                │          │
//! │       └───────────┴─────────────┴────────────────┘          │
//! │                       │                                     │
//! │              ┌────────▼────────┐                            │
//! │              │  fedid-core     │ ◄── You are here           │
//! │              └─────────────────┘                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose | Key Types |
//! |--------|---------|-----------|
//! | [`config`] | Environment-based configuration | [`AppConfig`] |
//! | [`errors`] | Per-subsystem error taxonomy | [`errors::StorageError`], [`errors::TokenError`] |
//! | [`storage`] | Persistence abstraction + in-memory/Postgres adapters | [`storage::Storage`] |
//! | [`signer`] | Key rotation + at-rest encryption | [`signer::Signer`] |
//! | [`token`] | ID/access token minting and verification | [`token::TokenFactory`] |
//! | [`connector`] | Upstream identity source registry | [`connector::ConnectorRegistry`] |
//! | [`middleware`] | Claims/groups identity transform chain | [`middleware::MiddlewareChain`] |
//! | [`jwks`] | JWK Set publication | [`jwks::build_jwk_set`] |
//! | [`crypto`] | Password hashing + AES-GCM key-at-rest helpers | [`crypto::hash_password`] |
//! | [`database`] | PostgreSQL connection pool | [`database::create_pool`] |
//! | [`tracing_config`] | Structured logging setup | [`tracing_config::init_tracing`] |
//! | [`validation`] | Request validation helpers | [`validation::validate_request`] |
//!
//! ## Design Decisions
//!
//! 1. **Single source of truth**: persistence and crypto primitives live here so
//!    both the HTTP and gRPC surfaces in `idp` share one implementation.
//! 2. **Typed errors per subsystem**: see [`errors`] module docs.
//! 3. **Observable by default**: structured logging and tracing built-in.

pub mod config;
pub mod connector;
pub mod crypto;
pub mod database;
pub mod errors;
pub mod jwks;
pub mod middleware;
pub mod signer;
pub mod storage;
pub mod token;
pub mod tracing_config;
pub mod validation;

pub use config::AppConfig;
