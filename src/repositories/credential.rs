//! # AccountCredential Repository
//!
//! Read access to the credential store plus in-place token rotation.

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set,
};
use uuid::Uuid;

use super::to_db_time;
use crate::error::{RefreshError, map_db_err};
use crate::models::account_credential::{Column, Entity, Model};

/// Tokens returned by a successful refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatedTokens {
    pub access_token: String,
    /// `None` keeps the stored refresh token
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Repository for account credential database operations
#[derive(Clone)]
pub struct CredentialRepository {
    db: DatabaseConnection,
}

impl CredentialRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn find(&self, owner_id: Uuid) -> Result<Option<Model>, RefreshError> {
        Entity::find_by_id(owner_id)
            .one(&self.db)
            .await
            .map_err(|err| map_db_err("failed to load account credential", err))
    }

    /// Credentials linked to a remote account, i.e. owners that can be refreshed.
    pub async fn list_linked(&self) -> Result<Vec<Model>, RefreshError> {
        Entity::find()
            .filter(Column::RemoteAccountId.is_not_null())
            .filter(Column::RemoteAccountId.ne(""))
            .order_by_asc(Column::OwnerId)
            .all(&self.db)
            .await
            .map_err(|err| map_db_err("failed to list linked credentials", err))
    }

    /// Store rotated tokens for an existing credential.
    pub async fn store_rotated(
        &self,
        credential: Model,
        tokens: RotatedTokens,
        now: DateTime<Utc>,
    ) -> Result<Model, RefreshError> {
        let owner_id = credential.owner_id;
        let mut active = credential.into_active_model();
        active.access_token = Set(tokens.access_token);
        if let Some(refresh_token) = tokens.refresh_token {
            active.refresh_token = Set(Some(refresh_token));
        }
        active.expires_at = Set(tokens.expires_at.map(to_db_time));
        active.updated_at = Set(to_db_time(now));

        let updated = active
            .update(&self.db)
            .await
            .map_err(|err| map_db_err("failed to store rotated tokens", err))?;

        tracing::info!(owner_id = %owner_id, "Rotated account access token");
        Ok(updated)
    }
}
