//! # API Layer
//!
//! Bridges the HTTP world with the service layer (spec §6). Every handler is
//! generic over the storage backend; `routes::configure::<S>` is invoked
//! once per concrete backend `main.rs` selects at startup.
//!
//! ## Module Organization
//!
//! | Module       | Responsibility                                      |
//! |--------------|-----------------------------------------------------|
//! | `routes`     | Route definitions with actix-web's `configure()`    |
//! | `handlers`   | Request handlers (extractors → service → response)  |
//! | `dto`        | Wire types for request/response bodies              |
//!
//! ## Endpoint Summary
//!
//! | Method    | Path                                  | Handler                |
//! |-----------|---------------------------------------|------------------------|
//! | GET       | `/.well-known/openid-configuration`   | `discovery`            |
//! | GET       | `/keys`                               | `keys`                 |
//! | GET       | `/healthz`                            | `healthz`               |
//! | GET       | `/auth`                               | `auth`                 |
//! | GET       | `/auth/{connector_id}`                | `auth_with_connector`  |
//! | GET       | `/callback/{connector_id}`            | `callback_redirect`    |
//! | POST      | `/callback/{connector_id}`            | `callback_password`    |
//! | GET, POST | `/approval`                           | `approval`              |
//! | POST      | `/token`                              | `token`                 |
//! | POST      | `/device/code`                        | `device_code`           |
//! | POST      | `/device/token`                       | `token` (alias)         |
//! | GET, POST | `/userinfo`                           | `userinfo`              |
//!
//! ## Related Documentation
//!
//! - Service layer: [`crate::service`]
//! - Error responses: [`crate::error::ApiError`]
//! - Shared state: [`crate::state::AppState`]

pub mod dto;
pub mod handlers;
pub mod routes;
