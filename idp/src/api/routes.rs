//! # Route Configuration
//!
//! Maps the HTTP surface (spec §6) onto [`handlers`]. `configure` is generic
//! over the storage backend so `main.rs` can instantiate one monomorphized
//! route table per concrete backend it selects at startup.
//!
//! ```text
//! GET    /.well-known/openid-configuration   discovery
//! GET    /keys                               JWKS
//! GET    /healthz                            liveness
//! GET    /auth                               start an authorization request
//! GET    /auth/{connector_id}                start, forcing a connector
//! GET    /callback/{connector_id}            redirect-connector return
//! POST   /callback/{connector_id}            password-connector login
//! GET    /approval                           consent/device-approval (query form)
//! POST   /approval                           consent/device-approval (JSON body)
//! POST   /token                              all four grant types
//! POST   /device/code                        RFC 8628 device authorization
//! POST   /device/token                       alias of /token (device polling)
//! GET    /userinfo                           resource-server profile lookup
//! POST   /userinfo                           same, per OIDC Core §5.3.1
//! ```

use actix_web::web;

use fedid_core::storage::Storage;

use super::handlers;

pub fn configure<S: Storage + 'static>(cfg: &mut web::ServiceConfig) {
    cfg.route(
        "/.well-known/openid-configuration",
        web::get().to(handlers::discovery::<S>),
    )
    .route("/keys", web::get().to(handlers::keys::<S>))
    .route("/healthz", web::get().to(handlers::healthz))
    .route("/auth", web::get().to(handlers::auth::<S>))
    .route("/auth/{connector_id}", web::get().to(handlers::auth_with_connector::<S>))
    .route("/callback/{connector_id}", web::get().to(handlers::callback_redirect::<S>))
    .route("/callback/{connector_id}", web::post().to(handlers::callback_password::<S>))
    .route("/approval", web::get().to(handlers::approval::<S>))
    .route("/approval", web::post().to(handlers::approval::<S>))
    .route("/token", web::post().to(handlers::token::<S>))
    .route("/device/code", web::post().to(handlers::device_code::<S>))
    .route("/device/token", web::post().to(handlers::token::<S>))
    .route("/userinfo", web::get().to(handlers::userinfo::<S>))
    .route("/userinfo", web::post().to(handlers::userinfo::<S>));
}

#[cfg(test)]
mod tests {
    use actix_web::{test, web, App};
    use fedid_core::storage::memory::MemoryStorage;

    #[actix_web::test]
    async fn discovery_route_responds_ok() {
        use crate::state::AppState;
        use std::sync::Arc;

        let storage = Arc::new(MemoryStorage::new());
        let signer = Arc::new(
            fedid_core::signer::Signer::new(
                storage.clone(),
                vec!["00".repeat(32)],
                "RS256",
                chrono::Duration::hours(6),
                chrono::Duration::hours(2),
            )
            .await
            .unwrap(),
        );
        let token_factory = Arc::new(fedid_core::token::TokenFactory::new(
            signer.clone(),
            "https://idp.example.com".into(),
            chrono::Duration::hours(1),
            chrono::Duration::minutes(15),
            chrono::Duration::seconds(60),
        ));
        let connectors = Arc::new(fedid_core::connector::ConnectorRegistry::new(storage.clone(), vec![]));
        let refresh = Arc::new(crate::service::RefreshTokenService::new(storage.clone()));
        let authorization = Arc::new(crate::service::AuthorizationService::new(
            storage.clone(),
            connectors.clone(),
            token_factory.clone(),
            refresh.clone(),
            chrono::Duration::minutes(10),
            chrono::Duration::seconds(60),
            900,
        ));
        let password = Arc::new(crate::service::PasswordService::new(storage.clone(), 4, 8));
        let device = Arc::new(crate::service::DeviceFlowService::new(
            storage.clone(),
            chrono::Duration::minutes(10),
            5,
        ));

        let state = web::Data::new(AppState {
            storage: storage.clone(),
            signer,
            token_factory,
            connectors,
            middleware: fedid_core::middleware::MiddlewareChain::default(),
            authorization,
            refresh,
            password,
            device,
            issuer: "https://idp.example.com".into(),
            http_base_url: "https://idp.example.com".into(),
            device_flow_enabled: false,
        });

        let app = test::init_service(
            App::new()
                .app_data(state)
                .configure(super::configure::<MemoryStorage>),
        )
        .await;
        let req = test::TestRequest::get()
            .uri("/.well-known/openid-configuration")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }
}
