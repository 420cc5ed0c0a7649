//! # Refresh Lock Manager
//!
//! Durable per-owner mutual exclusion backed by `metrics_sync_locks`. Rows
//! are created lazily and never deleted. A lock is claimed by a single
//! conditional `UPDATE`, so at most one worker across processes wins; a lock
//! held longer than the stale threshold is presumed abandoned and may be
//! taken over.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, IntoActiveModel,
    QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use super::to_db_time;
use crate::error::{RefreshError, map_db_err};
use crate::models::sync_lock::{ActiveModel, Column, Entity, Model};

/// Result of one owner run, persisted as `last_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed,
    CompletedWithErrors,
    Noop,
    RateLimited,
    AuthError,
    Error,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Completed => "completed",
            SyncOutcome::CompletedWithErrors => "completed_with_errors",
            SyncOutcome::Noop => "noop",
            SyncOutcome::RateLimited => "rate_limited",
            SyncOutcome::AuthError => "auth_error",
            SyncOutcome::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(SyncOutcome::Completed),
            "completed_with_errors" => Some(SyncOutcome::CompletedWithErrors),
            "noop" => Some(SyncOutcome::Noop),
            "rate_limited" => Some(SyncOutcome::RateLimited),
            "auth_error" => Some(SyncOutcome::AuthError),
            "error" => Some(SyncOutcome::Error),
            _ => None,
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing knobs for the lock manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// In-progress locks older than this may be taken over
    pub stale_after: Duration,
    /// Minimum gap between two completed runs for one owner
    pub cooldown: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::minutes(30),
            cooldown: Duration::minutes(5),
        }
    }
}

/// Repository managing per-owner refresh locks
#[derive(Clone)]
pub struct SyncLockRepository {
    db: DatabaseConnection,
    settings: LockSettings,
}

impl SyncLockRepository {
    pub fn new(db: DatabaseConnection, settings: LockSettings) -> Self {
        Self { db, settings }
    }

    /// Whether `lock` is held by a live worker at `now`.
    pub fn is_held(&self, lock: &Model, now: DateTime<Utc>) -> bool {
        lock.in_progress
            && lock
                .started_at
                .is_some_and(|started| started.with_timezone(&Utc) >= now - self.settings.stale_after)
    }

    /// Try to claim the lock for `owner_id`. Returns `true` only for the winner.
    pub async fn acquire(&self, owner_id: Uuid, now: DateTime<Utc>) -> Result<bool, RefreshError> {
        let now_db = to_db_time(now);

        let seed = ActiveModel {
            owner_id: Set(owner_id),
            in_progress: Set(false),
            started_at: Set(None),
            last_sync_at: Set(None),
            next_allowed_at: Set(None),
            last_result: Set(None),
            updated_at: Set(now_db),
        };
        Entity::insert(seed)
            .on_conflict(OnConflict::column(Column::OwnerId).do_nothing().to_owned())
            .exec_without_returning(&self.db)
            .await
            .map_err(|err| map_db_err("failed to create sync lock row", err))?;

        let stale_cutoff = to_db_time(now - self.settings.stale_after);
        let claimed = Entity::update_many()
            .col_expr(Column::InProgress, Expr::value(true))
            .col_expr(Column::StartedAt, Expr::value(Some(now_db)))
            .col_expr(Column::UpdatedAt, Expr::value(now_db))
            .filter(Column::OwnerId.eq(owner_id))
            .filter(
                Condition::any()
                    .add(Column::InProgress.eq(false))
                    .add(Column::StartedAt.is_null())
                    .add(Column::StartedAt.lt(stale_cutoff)),
            )
            .exec(&self.db)
            .await
            .map_err(|err| map_db_err("failed to claim sync lock", err))?;

        let acquired = claimed.rows_affected == 1;
        debug!(owner_id = %owner_id, acquired, "Sync lock claim attempted");
        Ok(acquired)
    }

    /// Clear `in_progress` without touching scheduling fields.
    pub async fn release(&self, owner_id: Uuid, now: DateTime<Utc>) -> Result<(), RefreshError> {
        Entity::update_many()
            .col_expr(Column::InProgress, Expr::value(false))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(now)))
            .filter(Column::OwnerId.eq(owner_id))
            .exec(&self.db)
            .await
            .map_err(|err| map_db_err("failed to release sync lock", err))?;
        Ok(())
    }

    /// Release the lock and persist the run outcome.
    ///
    /// `next_allowed_at` becomes the latest of the provider hint, `now` plus
    /// the cooldown, and the previously stored value, so it never moves back.
    pub async fn record_completion(
        &self,
        owner_id: Uuid,
        next_allowed_hint: Option<DateTime<Utc>>,
        outcome: SyncOutcome,
        now: DateTime<Utc>,
    ) -> Result<Model, RefreshError> {
        let existing = self.find(owner_id).await?;

        let previous = existing
            .as_ref()
            .and_then(|lock| lock.next_allowed_at)
            .map(|at| at.with_timezone(&Utc));
        let next_allowed = [next_allowed_hint, Some(now + self.settings.cooldown), previous]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(now);

        let now_db = to_db_time(now);
        let lock = match existing {
            Some(lock) => {
                let mut active = lock.into_active_model();
                active.in_progress = Set(false);
                active.last_sync_at = Set(Some(now_db));
                active.next_allowed_at = Set(Some(to_db_time(next_allowed)));
                active.last_result = Set(Some(outcome.as_str().to_string()));
                active.updated_at = Set(now_db);
                active.update(&self.db).await
            }
            // Rows are created lazily; a completion may be the first write.
            None => {
                ActiveModel {
                    owner_id: Set(owner_id),
                    in_progress: Set(false),
                    started_at: Set(None),
                    last_sync_at: Set(Some(now_db)),
                    next_allowed_at: Set(Some(to_db_time(next_allowed))),
                    last_result: Set(Some(outcome.as_str().to_string())),
                    updated_at: Set(now_db),
                }
                .insert(&self.db)
                .await
            }
        }
        .map_err(|err| map_db_err("failed to record sync completion", err))?;

        info!(
            owner_id = %owner_id,
            outcome = %outcome,
            next_allowed_at = %next_allowed,
            "Recorded metrics sync completion"
        );
        Ok(lock)
    }

    pub async fn find(&self, owner_id: Uuid) -> Result<Option<Model>, RefreshError> {
        Entity::find_by_id(owner_id)
            .one(&self.db)
            .await
            .map_err(|err| map_db_err("failed to load sync lock", err))
    }

    /// Lock rows for the given owners, keyed by owner.
    pub async fn find_many(&self, owner_ids: &[Uuid]) -> Result<HashMap<Uuid, Model>, RefreshError> {
        if owner_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let locks = Entity::find()
            .filter(Column::OwnerId.is_in(owner_ids.iter().copied()))
            .all(&self.db)
            .await
            .map_err(|err| map_db_err("failed to load sync locks", err))?;

        Ok(locks.into_iter().map(|lock| (lock.owner_id, lock)).collect())
    }
}
