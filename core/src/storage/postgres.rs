//! Postgres storage adapter.
//!
//! Shares the [`Storage`] trait bundle with [`super::memory::MemoryStorage`].
//! Complex fields (`Vec<String>`, claim maps) are stored as `jsonb` columns;
//! `sqlx::types::Json` handles the (de)serialization. Each query function is
//! generic over `sqlx::PgExecutor` so the same SQL runs unchanged whether
//! called against the pool directly or against an open transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::{PgExecutor, Row};
use tokio::sync::Mutex as AsyncMutex;

use super::entities::{
    AuthCode, Client, ConnectorConfig, Identity, PasswordInfo, RefreshToken, RemoteIdentity,
    Session, SigningKey, User,
};
use super::{fold_case, AuthCodeStore, ClientStore, ClientUpdate, ConnectorConfigStore};
use super::{PasswordStore, RefreshTokenStore, SessionStore, SigningKeyStore, Storage, UserStore};
use crate::errors::{StorageError, StorageResult};

/// Embedded schema migrations, run once at startup via [`PostgresStorage::migrate`].
pub const MIGRATIONS_DIR: &str = "migrations";

#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs the embedded migration set. Idempotent; safe to call on every
    /// startup before the signer bootstrap check.
    pub async fn migrate(&self) -> StorageResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Internal(e.to_string()))
    }
}

async fn get_client<'c, E: PgExecutor<'c>>(exec: E, id: &str) -> StorageResult<Client> {
    let row = sqlx::query(
        "SELECT id, secret, redirect_uris, logo_url, name, trusted_peers, public, admin, device_flow \
         FROM clients WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(exec)
    .await?
    .ok_or(StorageError::NotFound)?;

    Ok(Client {
        id: row.try_get("id")?,
        secret: row.try_get("secret")?,
        redirect_uris: row.try_get::<Json<Vec<String>>, _>("redirect_uris")?.0,
        logo_url: row.try_get("logo_url")?,
        name: row.try_get("name")?,
        trusted_peers: row.try_get::<Json<Vec<String>>, _>("trusted_peers")?.0,
        public: row.try_get("public")?,
        admin: row.try_get("admin")?,
        device_flow: row.try_get("device_flow")?,
    })
}

async fn list_clients<'c, E: PgExecutor<'c>>(exec: E) -> StorageResult<Vec<Client>> {
    let rows = sqlx::query(
        "SELECT id, secret, redirect_uris, logo_url, name, trusted_peers, public, admin, device_flow \
         FROM clients ORDER BY id",
    )
    .fetch_all(exec)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(Client {
                id: row.try_get("id")?,
                secret: row.try_get("secret")?,
                redirect_uris: row.try_get::<Json<Vec<String>>, _>("redirect_uris")?.0,
                logo_url: row.try_get("logo_url")?,
                name: row.try_get("name")?,
                trusted_peers: row.try_get::<Json<Vec<String>>, _>("trusted_peers")?.0,
                public: row.try_get("public")?,
                admin: row.try_get("admin")?,
                device_flow: row.try_get("device_flow")?,
            })
        })
        .collect()
}

async fn create_client<'c, E: PgExecutor<'c>>(exec: E, client: Client) -> StorageResult<()> {
    if client.redirect_uris.is_empty() && !client.device_flow {
        return Err(StorageError::InvalidArgument(
            "client must have at least one redirect URI unless device_flow is set".into(),
        ));
    }
    sqlx::query(
        "INSERT INTO clients (id, secret, redirect_uris, logo_url, name, trusted_peers, public, admin, device_flow) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(&client.id)
    .bind(&client.secret)
    .bind(Json(&client.redirect_uris))
    .bind(&client.logo_url)
    .bind(&client.name)
    .bind(Json(&client.trusted_peers))
    .bind(client.public)
    .bind(client.admin)
    .bind(client.device_flow)
    .execute(exec)
    .await?;
    Ok(())
}

async fn delete_client<'c, E: PgExecutor<'c>>(exec: E, id: &str) -> StorageResult<()> {
    let result = sqlx::query("DELETE FROM clients WHERE id = $1").bind(id).execute(exec).await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }
    Ok(())
}

async fn update_client<'c, E: PgExecutor<'c>>(
    exec: E,
    id: &str,
    update: ClientUpdate,
) -> StorageResult<()> {
    // Read-modify-write; callers invoke this inside perform_in_transaction
    // when update semantics must be atomic with other operations.
    let current = get_client(exec, id).await?;
    let _ = current;
    sqlx::query(
        "UPDATE clients SET \
            name = COALESCE($2, name), \
            redirect_uris = COALESCE($3, redirect_uris), \
            logo_url = CASE WHEN $4 THEN $5 ELSE logo_url END, \
            trusted_peers = COALESCE($6, trusted_peers), \
            secret = CASE WHEN $7 THEN $8 ELSE secret END \
         WHERE id = $1",
    )
    .bind(id)
    .bind(update.name)
    .bind(update.redirect_uris.map(Json))
    .bind(update.logo_url.is_some())
    .bind(update.logo_url.flatten())
    .bind(update.trusted_peers.map(Json))
    .bind(update.secret.is_some())
    .bind(update.secret.flatten())
    .execute(exec)
    .await?;
    Ok(())
}

fn row_to_user(row: &sqlx::postgres::PgRow) -> StorageResult<User> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        email_verified: row.try_get("email_verified")?,
        display_name: row.try_get("display_name")?,
        admin: row.try_get("admin")?,
        disabled: row.try_get("disabled")?,
        created_at: row.try_get("created_at")?,
        remote_identities: row.try_get::<Json<Vec<RemoteIdentity>>, _>("remote_identities")?.0,
    })
}

async fn get_user<'c, E: PgExecutor<'c>>(exec: E, id: &str) -> StorageResult<User> {
    let row = sqlx::query(
        "SELECT id, email, email_verified, display_name, admin, disabled, created_at, remote_identities \
         FROM users WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(exec)
    .await?
    .ok_or(StorageError::NotFound)?;
    row_to_user(&row)
}

async fn get_user_by_email<'c, E: PgExecutor<'c>>(exec: E, email: &str) -> StorageResult<User> {
    let row = sqlx::query(
        "SELECT id, email, email_verified, display_name, admin, disabled, created_at, remote_identities \
         FROM users WHERE lower(email) = lower($1)",
    )
    .bind(email)
    .fetch_optional(exec)
    .await?
    .ok_or(StorageError::NotFound)?;
    row_to_user(&row)
}

async fn get_user_by_remote_identity<'c, E: PgExecutor<'c>>(
    exec: E,
    connector_id: &str,
    remote_id: &str,
) -> StorageResult<User> {
    let row = sqlx::query(
        "SELECT id, email, email_verified, display_name, admin, disabled, created_at, remote_identities \
         FROM users WHERE remote_identities @> $1::jsonb",
    )
    .bind(serde_json::json!([{ "connector_id": connector_id, "remote_id": remote_id }]))
    .fetch_optional(exec)
    .await?
    .ok_or(StorageError::NotFound)?;
    row_to_user(&row)
}

async fn list_users<'c, E: PgExecutor<'c>>(exec: E) -> StorageResult<Vec<User>> {
    let rows = sqlx::query(
        "SELECT id, email, email_verified, display_name, admin, disabled, created_at, remote_identities \
         FROM users ORDER BY created_at",
    )
    .fetch_all(exec)
    .await?;
    rows.iter().map(row_to_user).collect()
}

async fn create_user<'c, E: PgExecutor<'c>>(exec: E, user: User) -> StorageResult<()> {
    sqlx::query(
        "INSERT INTO users (id, email, email_verified, display_name, admin, disabled, created_at, remote_identities) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(&user.id)
    .bind(&user.email)
    .bind(user.email_verified)
    .bind(&user.display_name)
    .bind(user.admin)
    .bind(user.disabled)
    .bind(user.created_at)
    .bind(Json(&user.remote_identities))
    .execute(exec)
    .await
    .map_err(StorageError::from)?;
    Ok(())
}

async fn update_user<'c, E: PgExecutor<'c>>(exec: E, user: User) -> StorageResult<()> {
    let result = sqlx::query(
        "UPDATE users SET email = $2, email_verified = $3, display_name = $4, admin = $5, \
         disabled = $6, remote_identities = $7 WHERE id = $1",
    )
    .bind(&user.id)
    .bind(&user.email)
    .bind(user.email_verified)
    .bind(&user.display_name)
    .bind(user.admin)
    .bind(user.disabled)
    .bind(Json(&user.remote_identities))
    .execute(exec)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }
    Ok(())
}

async fn delete_user<'c, E: PgExecutor<'c>>(exec: E, id: &str) -> StorageResult<()> {
    let result = sqlx::query("DELETE FROM users WHERE id = $1").bind(id).execute(exec).await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }
    Ok(())
}

fn row_to_password(row: &sqlx::postgres::PgRow) -> StorageResult<PasswordInfo> {
    Ok(PasswordInfo {
        email: row.try_get("email")?,
        user_id: row.try_get("user_id")?,
        bcrypt_hash: row.try_get("bcrypt_hash")?,
        expires_at: row.try_get("expires_at")?,
    })
}

async fn get_password<'c, E: PgExecutor<'c>>(exec: E, email: &str) -> StorageResult<PasswordInfo> {
    let row = sqlx::query("SELECT email, user_id, bcrypt_hash, expires_at FROM passwords WHERE lower(email) = lower($1)")
        .bind(email)
        .fetch_optional(exec)
        .await?
        .ok_or(StorageError::NotFound)?;
    row_to_password(&row)
}

async fn list_passwords<'c, E: PgExecutor<'c>>(exec: E) -> StorageResult<Vec<PasswordInfo>> {
    let rows = sqlx::query("SELECT email, user_id, bcrypt_hash, expires_at FROM passwords")
        .fetch_all(exec)
        .await?;
    rows.iter().map(row_to_password).collect()
}

async fn create_password<'c, E: PgExecutor<'c>>(exec: E, password: PasswordInfo) -> StorageResult<()> {
    sqlx::query(
        "INSERT INTO passwords (email, user_id, bcrypt_hash, expires_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(fold_case(&password.email))
    .bind(&password.user_id)
    .bind(&password.bcrypt_hash)
    .bind(password.expires_at)
    .execute(exec)
    .await
    .map_err(StorageError::from)?;
    Ok(())
}

async fn update_password<'c, E: PgExecutor<'c>>(exec: E, password: PasswordInfo) -> StorageResult<()> {
    let result = sqlx::query(
        "UPDATE passwords SET bcrypt_hash = $2, expires_at = $3 WHERE lower(email) = lower($1)",
    )
    .bind(&password.email)
    .bind(&password.bcrypt_hash)
    .bind(password.expires_at)
    .execute(exec)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }
    Ok(())
}

async fn delete_password<'c, E: PgExecutor<'c>>(exec: E, email: &str) -> StorageResult<()> {
    let result = sqlx::query("DELETE FROM passwords WHERE lower(email) = lower($1)")
        .bind(email)
        .execute(exec)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }
    Ok(())
}

fn row_to_session(row: &sqlx::postgres::PgRow) -> StorageResult<Session> {
    Ok(Session {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        scopes: row.try_get::<Json<Vec<String>>, _>("scopes")?.0,
        connector_id: row.try_get("connector_id")?,
        redirect_uri: row.try_get("redirect_uri")?,
        state: row.try_get("state")?,
        nonce: row.try_get("nonce")?,
        code_challenge: row.try_get("code_challenge")?,
        code_challenge_method: row.try_get("code_challenge_method")?,
        identity: row.try_get::<Option<Json<Identity>>, _>("identity")?.map(|j| j.0),
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        register: row.try_get("register")?,
        offline_requested: row.try_get("offline_requested")?,
        consent_granted: row.try_get("consent_granted")?,
    })
}

async fn get_session<'c, E: PgExecutor<'c>>(exec: E, id: &str) -> StorageResult<Session> {
    let row = sqlx::query(
        "SELECT id, client_id, scopes, connector_id, redirect_uri, state, nonce, code_challenge, \
         code_challenge_method, identity, created_at, expires_at, register, offline_requested, consent_granted \
         FROM sessions WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(exec)
    .await?
    .ok_or(StorageError::NotFound)?;
    row_to_session(&row)
}

async fn create_session<'c, E: PgExecutor<'c>>(exec: E, session: Session) -> StorageResult<()> {
    sqlx::query(
        "INSERT INTO sessions (id, client_id, scopes, connector_id, redirect_uri, state, nonce, \
         code_challenge, code_challenge_method, identity, created_at, expires_at, register, \
         offline_requested, consent_granted) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
    )
    .bind(&session.id)
    .bind(&session.client_id)
    .bind(Json(&session.scopes))
    .bind(&session.connector_id)
    .bind(&session.redirect_uri)
    .bind(&session.state)
    .bind(&session.nonce)
    .bind(&session.code_challenge)
    .bind(&session.code_challenge_method)
    .bind(session.identity.as_ref().map(Json))
    .bind(session.created_at)
    .bind(session.expires_at)
    .bind(session.register)
    .bind(session.offline_requested)
    .bind(session.consent_granted)
    .execute(exec)
    .await
    .map_err(StorageError::from)?;
    Ok(())
}

async fn update_session<'c, E: PgExecutor<'c>>(exec: E, session: Session) -> StorageResult<()> {
    let result = sqlx::query(
        "UPDATE sessions SET connector_id = $2, identity = $3, register = $4, \
         offline_requested = $5, consent_granted = $6 WHERE id = $1",
    )
    .bind(&session.id)
    .bind(&session.connector_id)
    .bind(session.identity.as_ref().map(Json))
    .bind(session.register)
    .bind(session.offline_requested)
    .bind(session.consent_granted)
    .execute(exec)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }
    Ok(())
}

async fn delete_session<'c, E: PgExecutor<'c>>(exec: E, id: &str) -> StorageResult<()> {
    let result = sqlx::query("DELETE FROM sessions WHERE id = $1").bind(id).execute(exec).await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }
    Ok(())
}

async fn delete_expired_sessions<'c, E: PgExecutor<'c>>(
    exec: E,
    now: DateTime<Utc>,
) -> StorageResult<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1").bind(now).execute(exec).await?;
    Ok(result.rows_affected())
}

async fn take_auth_code<'c, E: PgExecutor<'c>>(exec: E, code: &str) -> StorageResult<AuthCode> {
    let row = sqlx::query(
        "DELETE FROM auth_codes WHERE code = $1 \
         RETURNING code, session_id, client_id, scopes, created_at, expires_at",
    )
    .bind(code)
    .fetch_optional(exec)
    .await?
    .ok_or(StorageError::NotFound)?;

    Ok(AuthCode {
        code: row.try_get("code")?,
        session_id: row.try_get("session_id")?,
        client_id: row.try_get("client_id")?,
        scopes: row.try_get::<Json<Vec<String>>, _>("scopes")?.0,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

async fn create_auth_code<'c, E: PgExecutor<'c>>(exec: E, code: AuthCode) -> StorageResult<()> {
    sqlx::query(
        "INSERT INTO auth_codes (code, session_id, client_id, scopes, created_at, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(&code.code)
    .bind(&code.session_id)
    .bind(&code.client_id)
    .bind(Json(&code.scopes))
    .bind(code.created_at)
    .bind(code.expires_at)
    .execute(exec)
    .await
    .map_err(StorageError::from)?;
    Ok(())
}

async fn delete_expired_auth_codes<'c, E: PgExecutor<'c>>(
    exec: E,
    now: DateTime<Utc>,
) -> StorageResult<u64> {
    let result =
        sqlx::query("DELETE FROM auth_codes WHERE expires_at <= $1").bind(now).execute(exec).await?;
    Ok(result.rows_affected())
}

fn row_to_refresh_token(row: &sqlx::postgres::PgRow) -> StorageResult<RefreshToken> {
    Ok(RefreshToken {
        id: row.try_get("id")?,
        payload_hash: row.try_get("payload_hash")?,
        previous_payload_hash: row.try_get("previous_payload_hash")?,
        client_id: row.try_get("client_id")?,
        user_id: row.try_get("user_id")?,
        scopes: row.try_get::<Json<Vec<String>>, _>("scopes")?.0,
        connector_id: row.try_get("connector_id")?,
        connector_data: row.try_get("connector_data")?,
        created_at: row.try_get("created_at")?,
        last_used_at: row.try_get("last_used_at")?,
    })
}

async fn get_refresh_token<'c, E: PgExecutor<'c>>(exec: E, id: i64) -> StorageResult<RefreshToken> {
    let row = sqlx::query(
        "SELECT id, payload_hash, previous_payload_hash, client_id, user_id, scopes, connector_id, \
         connector_data, created_at, last_used_at FROM refresh_tokens WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(exec)
    .await?
    .ok_or(StorageError::NotFound)?;
    row_to_refresh_token(&row)
}

async fn list_refresh_tokens_for<'c, E: PgExecutor<'c>>(
    exec: E,
    user_id: &str,
    client_id: &str,
) -> StorageResult<Vec<RefreshToken>> {
    let rows = sqlx::query(
        "SELECT id, payload_hash, previous_payload_hash, client_id, user_id, scopes, connector_id, \
         connector_data, created_at, last_used_at FROM refresh_tokens WHERE user_id = $1 AND client_id = $2",
    )
    .bind(user_id)
    .bind(client_id)
    .fetch_all(exec)
    .await?;
    rows.iter().map(row_to_refresh_token).collect()
}

async fn list_clients_with_refresh_tokens<'c, E: PgExecutor<'c>>(
    exec: E,
    user_id: &str,
) -> StorageResult<Vec<String>> {
    let rows = sqlx::query("SELECT DISTINCT client_id FROM refresh_tokens WHERE user_id = $1 ORDER BY client_id")
        .bind(user_id)
        .fetch_all(exec)
        .await?;
    rows.into_iter().map(|r| r.try_get("client_id").map_err(StorageError::from)).collect()
}

async fn create_refresh_token<'c, E: PgExecutor<'c>>(
    exec: E,
    token: RefreshToken,
) -> StorageResult<i64> {
    let row = sqlx::query(
        "INSERT INTO refresh_tokens (payload_hash, previous_payload_hash, client_id, user_id, scopes, \
         connector_id, connector_data, created_at, last_used_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9) RETURNING id",
    )
    .bind(&token.payload_hash)
    .bind(&token.previous_payload_hash)
    .bind(&token.client_id)
    .bind(&token.user_id)
    .bind(Json(&token.scopes))
    .bind(&token.connector_id)
    .bind(&token.connector_data)
    .bind(token.created_at)
    .bind(token.last_used_at)
    .fetch_one(exec)
    .await
    .map_err(StorageError::from)?;
    row.try_get("id").map_err(StorageError::from)
}

async fn update_refresh_token<'c, E: PgExecutor<'c>>(exec: E, token: RefreshToken) -> StorageResult<()> {
    let result = sqlx::query(
        "UPDATE refresh_tokens SET payload_hash = $2, previous_payload_hash = $3, scopes = $4, \
         connector_data = $5, last_used_at = $6 WHERE id = $1",
    )
    .bind(token.id)
    .bind(&token.payload_hash)
    .bind(&token.previous_payload_hash)
    .bind(Json(&token.scopes))
    .bind(&token.connector_data)
    .bind(token.last_used_at)
    .execute(exec)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }
    Ok(())
}

async fn delete_refresh_token<'c, E: PgExecutor<'c>>(exec: E, id: i64) -> StorageResult<()> {
    let result = sqlx::query("DELETE FROM refresh_tokens WHERE id = $1").bind(id).execute(exec).await?;
    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }
    Ok(())
}

async fn revoke_for_client<'c, E: PgExecutor<'c>>(
    exec: E,
    user_id: &str,
    client_id: &str,
) -> StorageResult<u64> {
    let result = sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1 AND client_id = $2")
        .bind(user_id)
        .bind(client_id)
        .execute(exec)
        .await?;
    Ok(result.rows_affected())
}

async fn delete_expired_refresh_tokens<'c, E: PgExecutor<'c>>(
    exec: E,
    now: DateTime<Utc>,
) -> StorageResult<u64> {
    let result = sqlx::query(
        "DELETE FROM refresh_tokens WHERE last_used_at <= $1",
    )
    .bind(now)
    .execute(exec)
    .await?;
    Ok(result.rows_affected())
}

fn row_to_signing_key(row: &sqlx::postgres::PgRow) -> StorageResult<SigningKey> {
    Ok(SigningKey {
        id: row.try_get("id")?,
        algorithm: row.try_get("algorithm")?,
        public_params: row.try_get("public_params")?,
        private_params_encrypted: row.try_get("private_params_encrypted")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

async fn get_active_signing_key<'c, E: PgExecutor<'c>>(exec: E) -> StorageResult<Option<SigningKey>> {
    let row = sqlx::query(
        "SELECT id, algorithm, public_params, private_params_encrypted, created_at, expires_at \
         FROM signing_keys WHERE expires_at IS NULL LIMIT 1",
    )
    .fetch_optional(exec)
    .await?;
    row.as_ref().map(row_to_signing_key).transpose()
}

async fn list_verification_keys<'c, E: PgExecutor<'c>>(exec: E) -> StorageResult<Vec<SigningKey>> {
    let rows = sqlx::query(
        "SELECT id, algorithm, public_params, private_params_encrypted, created_at, expires_at FROM signing_keys",
    )
    .fetch_all(exec)
    .await?;
    rows.iter().map(row_to_signing_key).collect()
}

async fn put_signing_key<'c, E: PgExecutor<'c>>(exec: E, key: SigningKey) -> StorageResult<()> {
    sqlx::query(
        "INSERT INTO signing_keys (id, algorithm, public_params, private_params_encrypted, created_at, expires_at) \
         VALUES ($1,$2,$3,$4,$5,$6) \
         ON CONFLICT (id) DO UPDATE SET expires_at = EXCLUDED.expires_at",
    )
    .bind(&key.id)
    .bind(&key.algorithm)
    .bind(&key.public_params)
    .bind(&key.private_params_encrypted)
    .bind(key.created_at)
    .bind(key.expires_at)
    .execute(exec)
    .await
    .map_err(StorageError::from)?;
    Ok(())
}

async fn prune_expired_signing_keys<'c, E: PgExecutor<'c>>(
    exec: E,
    now: DateTime<Utc>,
) -> StorageResult<u64> {
    let result =
        sqlx::query("DELETE FROM signing_keys WHERE expires_at IS NOT NULL AND expires_at <= $1")
            .bind(now)
            .execute(exec)
            .await?;
    Ok(result.rows_affected())
}

async fn list_connector_configs<'c, E: PgExecutor<'c>>(exec: E) -> StorageResult<Vec<ConnectorConfig>> {
    let rows = sqlx::query("SELECT id, connector_type, config FROM connector_configs")
        .fetch_all(exec)
        .await?;
    rows.into_iter()
        .map(|row| {
            Ok(ConnectorConfig {
                id: row.try_get("id")?,
                connector_type: row.try_get("connector_type")?,
                config: row.try_get("config")?,
            })
        })
        .collect()
}

async fn put_connector_config<'c, E: PgExecutor<'c>>(exec: E, config: ConnectorConfig) -> StorageResult<()> {
    sqlx::query(
        "INSERT INTO connector_configs (id, connector_type, config) VALUES ($1, $2, $3) \
         ON CONFLICT (id) DO UPDATE SET connector_type = EXCLUDED.connector_type, config = EXCLUDED.config",
    )
    .bind(&config.id)
    .bind(&config.connector_type)
    .bind(&config.config)
    .execute(exec)
    .await
    .map_err(StorageError::from)?;
    Ok(())
}

macro_rules! impl_stores_for {
    ($ty:ty, $exec:expr) => {
        #[async_trait]
        impl ClientStore for $ty {
            async fn get_client(&self, id: &str) -> StorageResult<Client> {
                get_client($exec, id).await
            }
            async fn list_clients(&self) -> StorageResult<Vec<Client>> {
                list_clients($exec).await
            }
            async fn create_client(&self, client: Client) -> StorageResult<()> {
                create_client($exec, client).await
            }
            async fn update_client(&self, id: &str, update: ClientUpdate) -> StorageResult<()> {
                update_client($exec, id, update).await
            }
            async fn delete_client(&self, id: &str) -> StorageResult<()> {
                delete_client($exec, id).await
            }
        }

        #[async_trait]
        impl UserStore for $ty {
            async fn get_user(&self, id: &str) -> StorageResult<User> {
                get_user($exec, id).await
            }
            async fn get_user_by_email(&self, email: &str) -> StorageResult<User> {
                get_user_by_email($exec, email).await
            }
            async fn get_user_by_remote_identity(
                &self,
                connector_id: &str,
                remote_id: &str,
            ) -> StorageResult<User> {
                get_user_by_remote_identity($exec, connector_id, remote_id).await
            }
            async fn list_users(&self) -> StorageResult<Vec<User>> {
                list_users($exec).await
            }
            async fn create_user(&self, user: User) -> StorageResult<()> {
                create_user($exec, user).await
            }
            async fn update_user(&self, user: User) -> StorageResult<()> {
                update_user($exec, user).await
            }
            async fn delete_user(&self, id: &str) -> StorageResult<()> {
                delete_user($exec, id).await
            }
        }

        #[async_trait]
        impl PasswordStore for $ty {
            async fn get_password(&self, email: &str) -> StorageResult<PasswordInfo> {
                get_password($exec, email).await
            }
            async fn list_passwords(&self) -> StorageResult<Vec<PasswordInfo>> {
                list_passwords($exec).await
            }
            async fn create_password(&self, password: PasswordInfo) -> StorageResult<()> {
                create_password($exec, password).await
            }
            async fn update_password(&self, password: PasswordInfo) -> StorageResult<()> {
                update_password($exec, password).await
            }
            async fn delete_password(&self, email: &str) -> StorageResult<()> {
                delete_password($exec, email).await
            }
        }

        #[async_trait]
        impl SessionStore for $ty {
            async fn get_session(&self, id: &str) -> StorageResult<Session> {
                get_session($exec, id).await
            }
            async fn create_session(&self, session: Session) -> StorageResult<()> {
                create_session($exec, session).await
            }
            async fn update_session(&self, session: Session) -> StorageResult<()> {
                update_session($exec, session).await
            }
            async fn delete_session(&self, id: &str) -> StorageResult<()> {
                delete_session($exec, id).await
            }
            async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> StorageResult<u64> {
                delete_expired_sessions($exec, now).await
            }
        }

        #[async_trait]
        impl AuthCodeStore for $ty {
            async fn take_auth_code(&self, code: &str) -> StorageResult<AuthCode> {
                take_auth_code($exec, code).await
            }
            async fn create_auth_code(&self, code: AuthCode) -> StorageResult<()> {
                create_auth_code($exec, code).await
            }
            async fn delete_expired_auth_codes(&self, now: DateTime<Utc>) -> StorageResult<u64> {
                delete_expired_auth_codes($exec, now).await
            }
        }

        #[async_trait]
        impl RefreshTokenStore for $ty {
            async fn get_refresh_token(&self, id: i64) -> StorageResult<RefreshToken> {
                get_refresh_token($exec, id).await
            }
            async fn list_refresh_tokens_for(
                &self,
                user_id: &str,
                client_id: &str,
            ) -> StorageResult<Vec<RefreshToken>> {
                list_refresh_tokens_for($exec, user_id, client_id).await
            }
            async fn list_clients_with_refresh_tokens(&self, user_id: &str) -> StorageResult<Vec<String>> {
                list_clients_with_refresh_tokens($exec, user_id).await
            }
            async fn create_refresh_token(&self, token: RefreshToken) -> StorageResult<i64> {
                create_refresh_token($exec, token).await
            }
            async fn update_refresh_token(&self, token: RefreshToken) -> StorageResult<()> {
                update_refresh_token($exec, token).await
            }
            async fn delete_refresh_token(&self, id: i64) -> StorageResult<()> {
                delete_refresh_token($exec, id).await
            }
            async fn revoke_for_client(&self, user_id: &str, client_id: &str) -> StorageResult<u64> {
                revoke_for_client($exec, user_id, client_id).await
            }
            async fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> StorageResult<u64> {
                delete_expired_refresh_tokens($exec, now).await
            }
        }

        #[async_trait]
        impl SigningKeyStore for $ty {
            async fn get_active_signing_key(&self) -> StorageResult<Option<SigningKey>> {
                get_active_signing_key($exec).await
            }
            async fn list_verification_keys(&self) -> StorageResult<Vec<SigningKey>> {
                list_verification_keys($exec).await
            }
            async fn put_signing_key(&self, key: SigningKey) -> StorageResult<()> {
                put_signing_key($exec, key).await
            }
            async fn prune_expired_signing_keys(&self, now: DateTime<Utc>) -> StorageResult<u64> {
                prune_expired_signing_keys($exec, now).await
            }
        }

        #[async_trait]
        impl ConnectorConfigStore for $ty {
            async fn list_connector_configs(&self) -> StorageResult<Vec<ConnectorConfig>> {
                list_connector_configs($exec).await
            }
            async fn put_connector_config(&self, config: ConnectorConfig) -> StorageResult<()> {
                put_connector_config($exec, config).await
            }
        }
    };
}

impl_stores_for!(PostgresStorage, &self.pool);

impl Storage for PostgresStorage {
    fn perform_in_transaction_erased<'a>(
        &'a self,
        f: Box<
            dyn FnOnce(&'a dyn Storage) -> BoxFuture<'a, StorageResult<Box<dyn std::any::Any + Send>>>
                + Send
                + 'a,
        >,
    ) -> BoxFuture<'a, StorageResult<Box<dyn std::any::Any + Send>>> {
        Box::pin(async move {
            let tx = self.pool.begin().await.map_err(StorageError::from)?;
            let tx_storage = PgTransactionStorage { tx: AsyncMutex::new(tx) };
            let result = f(&tx_storage).await;
            match result {
                Ok(value) => {
                    tx_storage.tx.into_inner().commit().await.map_err(StorageError::from)?;
                    Ok(value)
                }
                Err(e) => {
                    let _ = tx_storage.tx.into_inner().rollback().await;
                    Err(e)
                }
            }
        })
    }
}

/// Wraps an open `sqlx::Transaction` and implements every store trait
/// against it, so [`PostgresStorage::perform_in_transaction_erased`]'s
/// closure body reads identically to code running against the pool
/// directly.
struct PgTransactionStorage {
    tx: AsyncMutex<sqlx::Transaction<'static, sqlx::Postgres>>,
}

impl_stores_for!(PgTransactionStorage, &mut *self.tx.lock().await);

impl Storage for PgTransactionStorage {
    fn perform_in_transaction_erased<'a>(
        &'a self,
        f: Box<
            dyn FnOnce(&'a dyn Storage) -> BoxFuture<'a, StorageResult<Box<dyn std::any::Any + Send>>>
                + Send
                + 'a,
        >,
    ) -> BoxFuture<'a, StorageResult<Box<dyn std::any::Any + Send>>> {
        // Nested transactions collapse into the already-open one; Postgres
        // has no independent nested-transaction concept here (a savepoint
        // could be added if a caller needs partial rollback).
        f(self)
    }
}
