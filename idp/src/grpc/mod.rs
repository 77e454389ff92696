//! # gRPC Administrative Surface (C10)
//!
//! CRUD over clients and passwords, plus refresh-token revocation, exposed
//! over the wire schema in `proto/admin.proto` (spec §6). This surface sits
//! behind its own listen address ([`fedid_core::config::ServerConfig::grpc_listen`])
//! so it can be placed behind a separate network boundary than the public
//! OIDC/OAuth HTTP surface.
//!
//! Per spec §6, responses favor boolean discriminators (`already_exists`,
//! `not_found`) over gRPC status codes for ordinary "the thing already/
//! doesn't exist" outcomes; `tonic::Status` is reserved for request-shape
//! errors (missing required fields) and storage/internal failures.

pub mod proto {
    tonic::include_proto!("fedid.admin.v1");
}

use std::sync::Arc;

use tonic::{Request, Response, Status};

use fedid_core::errors::StorageError;
use fedid_core::storage::entities::{Client, PasswordInfo};
use fedid_core::storage::{ClientStore, ClientUpdate, PasswordStore, RefreshTokenStore};

use proto::admin_service_server::AdminService;
use proto::{
    CreateClientRequest, CreateClientResponse, CreatePasswordRequest, CreatePasswordResponse,
    DeleteClientRequest, DeleteClientResponse, DeletePasswordRequest, DeletePasswordResponse,
    GetClientRequest, GetClientResponse, ListClientsRequest, ListClientsResponse,
    ListClientsWithRefreshTokensRequest, ListClientsWithRefreshTokensResponse,
    ListPasswordsRequest, ListPasswordsResponse, PasswordSummary,
    RevokeRefreshTokensForClientRequest, RevokeRefreshTokensForClientResponse,
    UpdateClientRequest, UpdateClientResponse, UpdatePasswordRequest, UpdatePasswordResponse,
    VerifyPasswordRequest, VerifyPasswordResponse,
};

use crate::service::PasswordService;

/// Implements the generated [`AdminService`] trait against a concrete
/// storage backend, sharing the process-wide [`PasswordService`] so
/// password hashing goes through the same bcrypt-cost configuration the
/// HTTP surface uses.
pub struct AdminServer<S: ?Sized> {
    storage: Arc<S>,
    password_service: Arc<PasswordService<S>>,
}

impl<S: ClientStore + PasswordStore + RefreshTokenStore + Send + Sync + ?Sized> AdminServer<S> {
    pub fn new(storage: Arc<S>, password_service: Arc<PasswordService<S>>) -> Self {
        Self {
            storage,
            password_service,
        }
    }
}

fn client_to_proto(client: Client) -> proto::Client {
    proto::Client {
        id: client.id,
        secret: client.secret.unwrap_or_default(),
        redirect_uris: client.redirect_uris,
        logo_url: client.logo_url.unwrap_or_default(),
        name: client.name,
        trusted_peers: client.trusted_peers,
        public: client.public,
        admin: client.admin,
        device_flow: client.device_flow,
    }
}

fn proto_to_client(proto: proto::Client) -> Client {
    Client {
        id: proto.id,
        secret: (!proto.secret.is_empty()).then_some(proto.secret),
        redirect_uris: proto.redirect_uris,
        logo_url: (!proto.logo_url.is_empty()).then_some(proto.logo_url),
        name: proto.name,
        trusted_peers: proto.trusted_peers,
        public: proto.public,
        admin: proto.admin,
        device_flow: proto.device_flow,
    }
}

/// Maps everything but `NotFound`/`DuplicateId` (handled as boolean
/// discriminators by each RPC) onto a `tonic::Status`.
fn storage_err_to_status(err: StorageError) -> Status {
    match err {
        StorageError::NotFound => Status::not_found("not found"),
        StorageError::DuplicateId => Status::already_exists("duplicate id"),
        StorageError::DuplicateEmail => Status::already_exists("duplicate email"),
        StorageError::DuplicateRemoteIdentity => Status::already_exists("duplicate remote identity"),
        StorageError::InvalidArgument(msg) => Status::invalid_argument(msg),
        StorageError::Conflict => Status::unavailable("write conflict, retry"),
        StorageError::Internal(msg) => Status::internal(msg),
    }
}

#[tonic::async_trait]
impl<S> AdminService for AdminServer<S>
where
    S: ClientStore + PasswordStore + RefreshTokenStore + Send + Sync + 'static,
{
    async fn create_client(
        &self,
        request: Request<CreateClientRequest>,
    ) -> Result<Response<CreateClientResponse>, Status> {
        let proto_client = request
            .into_inner()
            .client
            .ok_or_else(|| Status::invalid_argument("client is required"))?;
        let client = proto_to_client(proto_client);

        if !client.device_flow && client.redirect_uris.is_empty() {
            return Err(Status::invalid_argument(
                "at least one redirect uri is required unless device_flow is set",
            ));
        }

        match self.storage.create_client(client).await {
            Ok(()) => Ok(Response::new(CreateClientResponse {
                already_exists: false,
            })),
            Err(StorageError::DuplicateId) => Ok(Response::new(CreateClientResponse {
                already_exists: true,
            })),
            Err(err) => Err(storage_err_to_status(err)),
        }
    }

    async fn update_client(
        &self,
        request: Request<UpdateClientRequest>,
    ) -> Result<Response<UpdateClientResponse>, Status> {
        let req = request.into_inner();

        let logo_url = match req.logo_url_update {
            Some(proto::update_client_request::LogoUrlUpdate::SetLogoUrl(url)) => Some(Some(url)),
            Some(proto::update_client_request::LogoUrlUpdate::ClearLogoUrl(true)) => Some(None),
            _ => None,
        };
        let secret = match req.secret_update {
            Some(proto::update_client_request::SecretUpdate::SetSecret(bytes)) => Some(Some(bytes)),
            Some(proto::update_client_request::SecretUpdate::ClearSecret(true)) => Some(None),
            _ => None,
        };

        let update = ClientUpdate {
            name: req.name,
            redirect_uris: req.redirect_uris.map(|l| l.values),
            trusted_peers: req.trusted_peers.map(|l| l.values),
            logo_url,
            secret,
        };

        match self.storage.update_client(&req.id, update).await {
            Ok(()) => Ok(Response::new(UpdateClientResponse { not_found: false })),
            Err(StorageError::NotFound) => Ok(Response::new(UpdateClientResponse { not_found: true })),
            Err(err) => Err(storage_err_to_status(err)),
        }
    }

    async fn delete_client(
        &self,
        request: Request<DeleteClientRequest>,
    ) -> Result<Response<DeleteClientResponse>, Status> {
        let id = request.into_inner().id;
        match self.storage.delete_client(&id).await {
            Ok(()) => Ok(Response::new(DeleteClientResponse { not_found: false })),
            Err(StorageError::NotFound) => Ok(Response::new(DeleteClientResponse { not_found: true })),
            Err(err) => Err(storage_err_to_status(err)),
        }
    }

    async fn get_client(
        &self,
        request: Request<GetClientRequest>,
    ) -> Result<Response<GetClientResponse>, Status> {
        let id = request.into_inner().id;
        match self.storage.get_client(&id).await {
            Ok(client) => Ok(Response::new(GetClientResponse {
                not_found: false,
                client: Some(client_to_proto(client)),
            })),
            Err(StorageError::NotFound) => Ok(Response::new(GetClientResponse {
                not_found: true,
                client: None,
            })),
            Err(err) => Err(storage_err_to_status(err)),
        }
    }

    async fn list_clients(
        &self,
        _request: Request<ListClientsRequest>,
    ) -> Result<Response<ListClientsResponse>, Status> {
        let clients = self
            .storage
            .list_clients()
            .await
            .map_err(storage_err_to_status)?
            .into_iter()
            .map(client_to_proto)
            .collect();
        Ok(Response::new(ListClientsResponse { clients }))
    }

    async fn create_password(
        &self,
        request: Request<CreatePasswordRequest>,
    ) -> Result<Response<CreatePasswordResponse>, Status> {
        let req = request.into_inner();
        match self
            .password_service
            .create(&req.email, &req.user_id, &req.plaintext_password)
            .await
        {
            Ok(()) => Ok(Response::new(CreatePasswordResponse {
                already_exists: false,
            })),
            Err(crate::error::ApiError::DuplicateId) | Err(crate::error::ApiError::DuplicateEmail) => {
                Ok(Response::new(CreatePasswordResponse {
                    already_exists: true,
                }))
            }
            Err(err) => Err(Status::internal(err.to_string())),
        }
    }

    async fn update_password(
        &self,
        request: Request<UpdatePasswordRequest>,
    ) -> Result<Response<UpdatePasswordResponse>, Status> {
        let req = request.into_inner();
        match self
            .password_service
            .update(&req.email, &req.plaintext_password)
            .await
        {
            Ok(()) => Ok(Response::new(UpdatePasswordResponse { not_found: false })),
            Err(crate::error::ApiError::NotFound) => {
                Ok(Response::new(UpdatePasswordResponse { not_found: true }))
            }
            Err(err) => Err(Status::internal(err.to_string())),
        }
    }

    async fn delete_password(
        &self,
        request: Request<DeletePasswordRequest>,
    ) -> Result<Response<DeletePasswordResponse>, Status> {
        let email = request.into_inner().email;
        match self.storage.delete_password(&email).await {
            Ok(()) => Ok(Response::new(DeletePasswordResponse { not_found: false })),
            Err(StorageError::NotFound) => {
                Ok(Response::new(DeletePasswordResponse { not_found: true }))
            }
            Err(err) => Err(storage_err_to_status(err)),
        }
    }

    async fn list_passwords(
        &self,
        _request: Request<ListPasswordsRequest>,
    ) -> Result<Response<ListPasswordsResponse>, Status> {
        // spec §9 resolves the source's "nil means empty" ambiguity as
        // empty-list-plus-Ok; `list_passwords` already returns that.
        let passwords = self
            .storage
            .list_passwords()
            .await
            .map_err(storage_err_to_status)?
            .into_iter()
            .map(|p: PasswordInfo| PasswordSummary {
                email: p.email,
                user_id: p.user_id,
                expires_at_unix: p.expires_at.map(|t| t.timestamp()).unwrap_or_default(),
                has_expiry: p.expires_at.is_some(),
            })
            .collect();
        Ok(Response::new(ListPasswordsResponse { passwords }))
    }

    async fn verify_password(
        &self,
        request: Request<VerifyPasswordRequest>,
    ) -> Result<Response<VerifyPasswordResponse>, Status> {
        let req = request.into_inner();
        match self
            .password_service
            .verify(&req.email, &req.plaintext_password)
            .await
        {
            Ok(user_id) => Ok(Response::new(VerifyPasswordResponse {
                valid: true,
                user_id,
            })),
            Err(_) => Ok(Response::new(VerifyPasswordResponse {
                valid: false,
                user_id: String::new(),
            })),
        }
    }

    async fn revoke_refresh_tokens_for_client(
        &self,
        request: Request<RevokeRefreshTokensForClientRequest>,
    ) -> Result<Response<RevokeRefreshTokensForClientResponse>, Status> {
        let req = request.into_inner();
        let revoked_count = self
            .storage
            .revoke_for_client(&req.user_id, &req.client_id)
            .await
            .map_err(storage_err_to_status)?;
        Ok(Response::new(RevokeRefreshTokensForClientResponse {
            revoked_count,
        }))
    }

    async fn list_clients_with_refresh_tokens(
        &self,
        request: Request<ListClientsWithRefreshTokensRequest>,
    ) -> Result<Response<ListClientsWithRefreshTokensResponse>, Status> {
        let user_id = request.into_inner().user_id;
        let client_ids = self
            .storage
            .list_clients_with_refresh_tokens(&user_id)
            .await
            .map_err(storage_err_to_status)?;
        Ok(Response::new(ListClientsWithRefreshTokensResponse {
            client_ids,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedid_core::storage::memory::MemoryStorage;

    fn server() -> AdminServer<MemoryStorage> {
        let storage = Arc::new(MemoryStorage::new());
        let password_service = Arc::new(PasswordService::new(storage.clone(), 4, 8));
        AdminServer::new(storage, password_service)
    }

    #[tokio::test]
    async fn create_client_then_create_again_reports_already_exists() {
        let server = server();
        let client = proto::Client {
            id: "example-app".into(),
            secret: b"shh".to_vec(),
            redirect_uris: vec!["http://127.0.0.1:5555/callback".into()],
            logo_url: String::new(),
            name: "Example".into(),
            trusted_peers: vec![],
            public: false,
            admin: false,
            device_flow: false,
        };

        let first = server
            .create_client(Request::new(CreateClientRequest {
                client: Some(client.clone()),
            }))
            .await
            .unwrap();
        assert!(!first.into_inner().already_exists);

        let second = server
            .create_client(Request::new(CreateClientRequest { client: Some(client) }))
            .await
            .unwrap();
        assert!(second.into_inner().already_exists);
    }

    #[tokio::test]
    async fn create_client_without_redirect_uri_rejected_unless_device_flow() {
        let server = server();
        let client = proto::Client {
            id: "device-app".into(),
            secret: vec![],
            redirect_uris: vec![],
            logo_url: String::new(),
            name: "Device App".into(),
            trusted_peers: vec![],
            public: true,
            admin: false,
            device_flow: false,
        };
        let result = server
            .create_client(Request::new(CreateClientRequest { client: Some(client) }))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn update_client_rename_is_visible_on_get() {
        let server = server();
        server
            .create_client(Request::new(CreateClientRequest {
                client: Some(proto::Client {
                    id: "example-app".into(),
                    secret: vec![],
                    redirect_uris: vec!["http://127.0.0.1:5555/callback".into()],
                    logo_url: String::new(),
                    name: "Old Name".into(),
                    trusted_peers: vec![],
                    public: true,
                    admin: false,
                    device_flow: false,
                }),
            }))
            .await
            .unwrap();

        server
            .update_client(Request::new(UpdateClientRequest {
                id: "example-app".into(),
                name: Some("New Name".into()),
                redirect_uris: None,
                trusted_peers: None,
                logo_url_update: None,
                secret_update: None,
            }))
            .await
            .unwrap();

        let fetched = server
            .get_client(Request::new(GetClientRequest {
                id: "example-app".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(fetched.client.unwrap().name, "New Name");
    }

    #[tokio::test]
    async fn delete_missing_client_reports_not_found() {
        let server = server();
        let resp = server
            .delete_client(Request::new(DeleteClientRequest {
                id: "nope".into(),
            }))
            .await
            .unwrap();
        assert!(resp.into_inner().not_found);
    }

    #[tokio::test]
    async fn create_then_verify_password_round_trips() {
        let server = server();
        server
            .create_password(Request::new(CreatePasswordRequest {
                email: "admin@example.com".into(),
                user_id: "user-1".into(),
                plaintext_password: "correct horse battery".into(),
            }))
            .await
            .unwrap();

        let verified = server
            .verify_password(Request::new(VerifyPasswordRequest {
                email: "admin@example.com".into(),
                plaintext_password: "correct horse battery".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(verified.valid);
        assert_eq!(verified.user_id, "user-1");

        let wrong = server
            .verify_password(Request::new(VerifyPasswordRequest {
                email: "admin@example.com".into(),
                plaintext_password: "wrong".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!wrong.valid);
    }

    #[tokio::test]
    async fn create_password_twice_reports_already_exists() {
        let server = server();
        server
            .create_password(Request::new(CreatePasswordRequest {
                email: "a@example.com".into(),
                user_id: "user-1".into(),
                plaintext_password: "first-password".into(),
            }))
            .await
            .unwrap();

        let second = server
            .create_password(Request::new(CreatePasswordRequest {
                email: "a@example.com".into(),
                user_id: "user-1".into(),
                plaintext_password: "second-password".into(),
            }))
            .await
            .unwrap();
        assert!(second.into_inner().already_exists);
    }

    #[tokio::test]
    async fn revoke_refresh_tokens_for_client_returns_count() {
        let server = server();
        let resp = server
            .revoke_refresh_tokens_for_client(Request::new(RevokeRefreshTokensForClientRequest {
                user_id: "user-1".into(),
                client_id: "example-app".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.revoked_count, 0);
    }
}
