//! # Password / Local-Login Service (C8)
//!
//! Verifies local credentials against stored bcrypt hashes and backs both
//! the `password` OAuth grant and the local-password connector
//! ([`crate::connectors::local`]).

use std::sync::Arc;

use fedid_core::storage::entities::PasswordInfo;
use fedid_core::storage::PasswordStore;

use crate::error::ApiError;

pub struct PasswordService<S: ?Sized> {
    storage: Arc<S>,
    bcrypt_cost: u32,
    min_length: usize,
}

impl<S: PasswordStore + ?Sized> PasswordService<S> {
    pub fn new(storage: Arc<S>, bcrypt_cost: u32, min_length: usize) -> Self {
        Self {
            storage,
            bcrypt_cost,
            min_length,
        }
    }

    /// Verifies `password` for `email`. Returns `Ok(user_id)` on match.
    pub async fn verify(&self, email: &str, password: &str) -> Result<String, ApiError> {
        let info = self
            .storage
            .get_password(email)
            .await
            .map_err(|_| ApiError::InvalidGrant("invalid credentials".into()))?;

        if let Some(expires_at) = info.expires_at {
            if expires_at <= chrono::Utc::now() {
                return Err(ApiError::InvalidGrant("credentials expired".into()));
            }
        }

        let password = password.to_string();
        let hash = info.bcrypt_hash.clone();
        let matches = tokio::task::spawn_blocking(move || fedid_core::crypto::verify_password(&password, &hash))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))??;

        if matches {
            Ok(info.user_id)
        } else {
            Err(ApiError::InvalidGrant("invalid credentials".into()))
        }
    }

    /// Hashes `new_password` and upserts the credential for `email`.
    pub async fn set(&self, email: &str, user_id: &str, new_password: &str) -> Result<(), ApiError> {
        let info = self.hash_into_info(email, user_id, new_password).await?;

        match self.storage.create_password(info.clone()).await {
            Ok(()) => Ok(()),
            Err(fedid_core::errors::StorageError::DuplicateId)
            | Err(fedid_core::errors::StorageError::Conflict) => {
                self.storage.update_password(info).await?;
                Ok(())
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Hashes `new_password` and creates a new credential for `email`,
    /// failing with [`ApiError::DuplicateId`] if one already exists.
    /// Distinct from [`Self::set`]'s upsert behavior: the gRPC admin
    /// surface's `CreatePassword`/`UpdatePassword` (C10) need separate
    /// create-only and update-only semantics to report `already_exists`/
    /// `not_found` discriminators accurately (spec §6).
    pub async fn create(&self, email: &str, user_id: &str, new_password: &str) -> Result<(), ApiError> {
        let info = self.hash_into_info(email, user_id, new_password).await?;
        self.storage.create_password(info).await?;
        Ok(())
    }

    /// Hashes `new_password` and overwrites the existing credential for
    /// `email`, failing with [`ApiError::NotFound`] if none exists.
    pub async fn update(&self, email: &str, new_password: &str) -> Result<(), ApiError> {
        let existing = self.storage.get_password(email).await?;
        let info = self.hash_into_info(email, &existing.user_id, new_password).await?;
        self.storage.update_password(info).await?;
        Ok(())
    }

    async fn hash_into_info(
        &self,
        email: &str,
        user_id: &str,
        new_password: &str,
    ) -> Result<PasswordInfo, ApiError> {
        if new_password.len() < self.min_length {
            return Err(ApiError::InvalidRequest(format!(
                "password must be at least {} characters",
                self.min_length
            )));
        }

        let cost = self.bcrypt_cost;
        let plaintext = new_password.to_string();
        let hash = tokio::task::spawn_blocking(move || fedid_core::crypto::hash_password(&plaintext, cost))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))??;

        Ok(PasswordInfo {
            email: email.to_string(),
            user_id: user_id.to_string(),
            bcrypt_hash: hash,
            expires_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedid_core::storage::memory::MemoryStorage;

    #[tokio::test]
    async fn set_then_verify_round_trips() {
        let storage = Arc::new(MemoryStorage::new());
        let service = PasswordService::new(storage, 4, 8);

        service
            .set("admin@example.com", "user-1", "correct horse battery")
            .await
            .unwrap();

        let user_id = service
            .verify("admin@example.com", "correct horse battery")
            .await
            .unwrap();
        assert_eq!(user_id, "user-1");
    }

    #[tokio::test]
    async fn verify_rejects_wrong_password() {
        let storage = Arc::new(MemoryStorage::new());
        let service = PasswordService::new(storage, 4, 8);
        service.set("a@example.com", "user-1", "right-password").await.unwrap();

        let result = service.verify("a@example.com", "wrong-password").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn set_rejects_too_short_password() {
        let storage = Arc::new(MemoryStorage::new());
        let service = PasswordService::new(storage, 4, 8);
        let result = service.set("a@example.com", "user-1", "short").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn set_twice_upserts_rather_than_conflicting() {
        let storage = Arc::new(MemoryStorage::new());
        let service = PasswordService::new(storage, 4, 8);
        service.set("a@example.com", "user-1", "first-password").await.unwrap();
        service.set("a@example.com", "user-1", "second-password").await.unwrap();

        assert!(service.verify("a@example.com", "second-password").await.is_ok());
        assert!(service.verify("a@example.com", "first-password").await.is_err());
    }

    #[tokio::test]
    async fn create_twice_fails_with_duplicate_id() {
        let storage = Arc::new(MemoryStorage::new());
        let service = PasswordService::new(storage, 4, 8);
        service.create("a@example.com", "user-1", "first-password").await.unwrap();

        let result = service.create("a@example.com", "user-1", "second-password").await;
        assert!(matches!(result, Err(ApiError::DuplicateId)));
    }

    #[tokio::test]
    async fn update_without_existing_credential_fails_not_found() {
        let storage = Arc::new(MemoryStorage::new());
        let service = PasswordService::new(storage, 4, 8);
        let result = service.update("nobody@example.com", "new-password").await;
        assert!(matches!(result, Err(ApiError::NotFound)));
    }

    #[tokio::test]
    async fn update_overwrites_existing_credential() {
        let storage = Arc::new(MemoryStorage::new());
        let service = PasswordService::new(storage, 4, 8);
        service.create("a@example.com", "user-1", "first-password").await.unwrap();
        service.update("a@example.com", "second-password").await.unwrap();

        assert!(service.verify("a@example.com", "second-password").await.is_ok());
        assert!(service.verify("a@example.com", "first-password").await.is_err());
    }
}
