//! # fedid-idp
//!
//! The federated OIDC/OAuth2 identity-provider binary. Wires the ambient
//! stack ([`fedid_core::config`], [`fedid_core::tracing_config`]) to the
//! storage backend selected at startup, then to the OIDC broker's service
//! layer (token factory, authorization state machine, refresh-token
//! service, password service, device-authorization service) and exposes it
//! over two surfaces:
//!
//! - the public HTTP surface (spec §6): `/auth`, `/callback/*`, `/approval`,
//!   `/token`, `/device/code`, `/userinfo`, `/keys`,
//!   `/.well-known/openid-configuration`;
//! - the administrative gRPC surface (C10): client/password CRUD and
//!   refresh-token revocation, on a separate listen address so it can sit
//!   behind its own network boundary.
//!
//! Three background tickers run alongside the request handlers (spec §5):
//! the signing-key rotator (C2), a session/auth-code/device-authorization
//! sweeper, and the refresh-token garbage collector. All three share the
//! same storage handle as request handlers and are safe to run
//! concurrently with them.
//!
//! TLS termination (`server.tls_cert`/`tls_key` in config) is expected to
//! happen upstream of this process (reverse proxy or service-mesh sidecar);
//! the values are validated but not wired to the HTTP listener here, since
//! the teacher's `actix-web` dependency set carries no TLS feature.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use actix_cors::Cors;
use actix_web::{middleware as actix_middleware, web, App, HttpServer};
use anyhow::Context;
use chrono::Duration;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server as GrpcServer;
use tracing::{error, info, warn};

use fedid_core::config::{AppConfig, StorageConfig, StorageKind};
use fedid_core::connector::{ConnectorFactory, ConnectorRegistry};
use fedid_core::database;
use fedid_core::middleware::MiddlewareChain;
use fedid_core::signer::Signer;
use fedid_core::storage::memory::MemoryStorage;
use fedid_core::storage::postgres::PostgresStorage;
use fedid_core::storage::Storage;
use fedid_core::token::TokenFactory;
use fedid_core::tracing_config;

mod api;
mod connectors;
mod error;
mod grpc;
mod service;
mod state;

use connectors::{LocalConnectorFactory, OidcConnectorFactory};
use grpc::proto::admin_service_server::AdminServiceServer;
use grpc::AdminServer;
use service::{AuthorizationService, DeviceFlowService, PasswordService, RefreshTokenService};
use state::AppState;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("failed to load configuration")?;
    tracing_config::init_tracing(&config.service_name, config.is_production());

    info!(
        service = %config.service_name,
        storage_kind = ?config.storage.kind,
        http_listen = %config.server.http_listen,
        grpc_listen = %config.server.grpc_listen,
        "starting fedid-idp"
    );

    match config.storage.kind {
        StorageKind::Memory => {
            let storage = Arc::new(MemoryStorage::new());
            run(storage, config).await
        }
        StorageKind::Postgres => {
            let storage = Arc::new(build_postgres_storage(&config.storage).await?);
            run(storage, config).await
        }
        StorageKind::Sqlite | StorageKind::Mysql => {
            anyhow::bail!(
                "storage.kind = {:?} has no adapter in this build; only memory and postgres are wired",
                config.storage.kind
            )
        }
    }
}

async fn build_postgres_storage(config: &StorageConfig) -> anyhow::Result<PostgresStorage> {
    let pool = database::create_pool(config)
        .await
        .context("failed to create postgres connection pool")?;
    let storage = PostgresStorage::new(pool);
    storage.migrate().await.context("failed to run storage migrations")?;
    Ok(storage)
}

/// Builds the full service graph for a concrete storage backend and runs
/// both network surfaces until shutdown.
async fn run<S>(storage: Arc<S>, config: AppConfig) -> anyhow::Result<()>
where
    S: Storage + 'static,
{
    let rotation_interval = Duration::seconds(config.signer.rotation_interval_seconds);
    let id_token_lifetime = Duration::seconds(config.token.id_token_lifetime_seconds);
    let access_token_lifetime = Duration::seconds(config.token.access_token_lifetime_seconds);
    let clock_skew = Duration::seconds(config.token.clock_skew_seconds);
    let session_lifetime = Duration::seconds(config.flow.session_lifetime_seconds);
    let auth_code_lifetime = Duration::seconds(config.flow.auth_code_lifetime_seconds);

    // C2: eager bootstrap rotation happens inside `Signer::new` if storage
    // has no active key yet, before either listener accepts requests.
    let signer = Arc::new(
        Signer::new(
            storage.clone(),
            config.signer.master_keys.clone(),
            &config.signer.algorithm,
            rotation_interval,
            id_token_lifetime,
        )
        .await
        .context("failed to initialize signing-key rotator")?,
    );

    let token_factory = Arc::new(TokenFactory::new(
        signer.clone(),
        config.token.issuer.clone(),
        id_token_lifetime,
        access_token_lifetime,
        clock_skew,
    ));

    let password_service = Arc::new(PasswordService::new(
        storage.clone(),
        config.password.bcrypt_cost,
        config.password.min_length,
    ));

    let factories: Vec<Arc<dyn ConnectorFactory>> = vec![
        Arc::new(LocalConnectorFactory::new(password_service.clone(), storage.clone())),
        Arc::new(OidcConnectorFactory),
    ];
    let connectors = Arc::new(ConnectorRegistry::new(storage.clone(), factories));
    connectors
        .reload_from_store()
        .await
        .context("failed to load connector configuration")?;

    let refresh = Arc::new(RefreshTokenService::new(storage.clone()));
    let authorization = Arc::new(AuthorizationService::new(
        storage.clone(),
        connectors.clone(),
        token_factory.clone(),
        refresh.clone(),
        session_lifetime,
        auth_code_lifetime,
        config.token.access_token_lifetime_seconds,
    ));
    let device = Arc::new(DeviceFlowService::new(
        storage.clone(),
        session_lifetime,
        5,
    ));

    let http_base_url = format!("http://{}", public_host(&config.server.http_listen));
    let state = web::Data::new(AppState {
        storage: storage.clone(),
        signer: signer.clone(),
        token_factory,
        connectors,
        middleware: MiddlewareChain::default(),
        authorization,
        refresh: refresh.clone(),
        password: password_service.clone(),
        device,
        issuer: config.token.issuer.clone(),
        http_base_url,
        device_flow_enabled: config.flow.enable_device_flow,
    });

    let shutdown = CancellationToken::new();
    let background = spawn_background_tasks(storage.clone(), signer, refresh, &config, shutdown.clone());

    let http_listen = config.server.http_listen.clone();
    let workers = config.server.workers;
    let mut http_server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(actix_middleware::Logger::default())
            .wrap(actix_middleware::Compress::default())
            .wrap(tracing_actix_web::TracingLogger::default())
            .app_data(state.clone())
            .configure(api::routes::configure::<S>)
    })
    .bind(http_listen.as_str())
    .with_context(|| format!("failed to bind HTTP listener on {http_listen}"))?;
    if workers > 0 {
        http_server = http_server.workers(workers);
    }
    let http_server = http_server.run();

    let grpc_listen: std::net::SocketAddr = config
        .server
        .grpc_listen
        .parse()
        .with_context(|| format!("invalid gRPC listen address: {}", config.server.grpc_listen))?;
    let admin = AdminServer::new(storage.clone(), password_service);
    let grpc_shutdown = shutdown.clone();
    let grpc_server = GrpcServer::builder()
        .add_service(AdminServiceServer::new(admin))
        .serve_with_shutdown(grpc_listen, async move {
            grpc_shutdown.cancelled().await;
        });

    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, stopping background tasks and listeners");
            ctrl_c_shutdown.cancel();
        }
    });

    info!(http_listen = %http_listen, grpc_listen = %config.server.grpc_listen, "listening");

    let http_result = tokio::select! {
        result = http_server => result.context("http server exited with error"),
        result = grpc_server => {
            shutdown.cancel();
            result.context("grpc server exited with error")
        }
    };

    shutdown.cancel();
    background.abort();
    http_result
}

/// Derives the externally-visible host:port used to build callback URLs
/// from the HTTP bind address. `0.0.0.0` isn't a valid callback host, so it
/// is rewritten to `127.0.0.1` for local development; production
/// deployments should set `APP_TOKEN__ISSUER`/reverse-proxy host headers
/// rather than rely on this default.
fn public_host(bind_addr: &str) -> String {
    if let Some(port) = bind_addr.rsplit(':').next() {
        if bind_addr.starts_with("0.0.0.0") || bind_addr.starts_with('[') {
            return format!("127.0.0.1:{port}");
        }
    }
    bind_addr.to_string()
}

/// Starts the three periodic tasks spec §5 requires to run alongside
/// request handlers: key rotation (C2), session/auth-code/device-auth
/// expiry sweeping (C6), and refresh-token garbage collection (C7). Each
/// uses the same storage handle request handlers use and is cancelled via
/// the shared `shutdown` token.
fn spawn_background_tasks<S>(
    storage: Arc<S>,
    signer: Arc<Signer<S>>,
    refresh: Arc<RefreshTokenService<S>>,
    config: &AppConfig,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    S: Storage + 'static,
{
    let rotation_interval = StdDuration::from_secs(config.signer.rotation_interval_seconds.max(1) as u64);
    let refresh_token_lifetime_seconds = config.flow.refresh_token_lifetime_seconds;
    let sweep_interval = StdDuration::from_secs(30);

    tokio::spawn(async move {
        let mut rotation_ticker = tokio::time::interval(rotation_interval);
        let mut sweep_ticker = tokio::time::interval(sweep_interval);
        // Skip the immediate first tick both intervals fire on creation;
        // startup already performed an eager bootstrap rotation.
        rotation_ticker.tick().await;
        sweep_ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("background tasks stopping");
                    return;
                }
                _ = rotation_ticker.tick() => {
                    if let Err(err) = signer.rotate().await {
                        // Failure mode per spec §4.2: a rotation error does
                        // not replace the active key; log and retry next tick.
                        error!(error = %err, "key rotation failed, will retry next tick");
                    }
                    if let Err(err) = signer.prune_expired().await {
                        warn!(error = %err, "failed to prune expired signing keys");
                    }
                }
                _ = sweep_ticker.tick() => {
                    let now = chrono::Utc::now();
                    if let Err(err) = storage.delete_expired_sessions(now).await {
                        warn!(error = %err, "session sweeper failed");
                    }
                    if let Err(err) = storage.delete_expired_auth_codes(now).await {
                        warn!(error = %err, "auth-code sweeper failed");
                    }
                    if let Err(err) = storage.delete_expired_device_authorizations(now).await {
                        warn!(error = %err, "device-authorization sweeper failed");
                    }
                    if let Err(err) = refresh.sweep_expired(refresh_token_lifetime_seconds).await {
                        warn!(error = %err, "refresh-token garbage collection failed");
                    }
                }
            }
        }
    })
}
