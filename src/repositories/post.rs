//! # TrackedPost Repository
//!
//! Read paths for candidate selection and the two write paths of the result
//! applier: overwriting a metric snapshot and flipping a post to `deleted`.

use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Select,
};
use uuid::Uuid;

use super::to_db_time;
use crate::error::{RefreshError, map_db_err};
use crate::lookup::PostMetrics;
use crate::models::tracked_post::{Column, Entity, Model, STATUS_DELETED, STATUS_POSTED};

/// Identifies the posts of one owner that may be refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityScope {
    pub owner_id: Uuid,
    /// Remote account the owner is linked to; posts by other authors are ignored
    pub remote_author_id: String,
    /// Oldest publication time still tracked
    pub published_since: DateTime<Utc>,
}

impl EligibilityScope {
    pub fn new(
        owner_id: Uuid,
        remote_author_id: impl Into<String>,
        lookback_days: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            owner_id,
            remote_author_id: remote_author_id.into(),
            published_since: Duration::try_days(lookback_days)
                .and_then(|lookback| now.checked_sub_signed(lookback))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        }
    }
}

/// Repository for tracked post database operations
#[derive(Clone)]
pub struct PostRepository {
    db: DatabaseConnection,
}

impl PostRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn eligible(scope: &EligibilityScope) -> Select<Entity> {
        Entity::find()
            .filter(Column::OwnerId.eq(scope.owner_id))
            .filter(Column::RemoteAuthorId.eq(scope.remote_author_id.as_str()))
            .filter(Column::Status.eq(STATUS_POSTED))
            .filter(Column::RemoteId.is_not_null())
            .filter(Column::RemoteId.ne(""))
            .filter(Column::PublishedAt.gte(to_db_time(scope.published_since)))
    }

    /// The `limit` most recently published eligible posts.
    pub async fn newest_eligible(
        &self,
        scope: &EligibilityScope,
        limit: u64,
    ) -> Result<Vec<Model>, RefreshError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        Self::eligible(scope)
            .order_by_desc(Column::PublishedAt)
            .order_by_asc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await
            .map_err(|err| map_db_err("failed to load newest eligible posts", err))
    }

    /// Eligible posts whose snapshot is missing or older than `updated_before`,
    /// newest first.
    ///
    /// This is a coarse pre-filter; the freshness policy makes the final call.
    pub async fn stale_eligible(
        &self,
        scope: &EligibilityScope,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Model>, RefreshError> {
        Self::eligible(scope)
            .filter(
                Column::MetricsUpdatedAt
                    .is_null()
                    .or(Column::MetricsUpdatedAt.lte(to_db_time(updated_before))),
            )
            .order_by_desc(Column::PublishedAt)
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await
            .map_err(|err| map_db_err("failed to load stale eligible posts", err))
    }

    /// Whether the owner has at least one eligible post.
    pub async fn has_eligible(&self, scope: &EligibilityScope) -> Result<bool, RefreshError> {
        let count = Self::eligible(scope)
            .count(&self.db)
            .await
            .map_err(|err| map_db_err("failed to count eligible posts", err))?;
        Ok(count > 0)
    }

    /// Overwrite the metric snapshot of a post. Returns `false` if no row matched.
    pub async fn apply_metrics(
        &self,
        post_id: Uuid,
        metrics: &PostMetrics,
        now: DateTime<Utc>,
    ) -> Result<bool, RefreshError> {
        let now = to_db_time(now);
        let result = Entity::update_many()
            .col_expr(Column::Impressions, Expr::value(metrics.impressions))
            .col_expr(Column::Likes, Expr::value(metrics.likes))
            .col_expr(Column::Retweets, Expr::value(metrics.retweets))
            .col_expr(Column::Replies, Expr::value(metrics.replies))
            .col_expr(Column::Quotes, Expr::value(metrics.quotes))
            .col_expr(Column::Bookmarks, Expr::value(metrics.bookmarks))
            .col_expr(Column::MetricsUpdatedAt, Expr::value(Some(now)))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(post_id))
            .exec(&self.db)
            .await
            .map_err(|err| map_db_err("failed to apply post metrics", err))?;

        Ok(result.rows_affected > 0)
    }

    /// Flip a post to `deleted`, leaving its metrics untouched.
    pub async fn mark_deleted(
        &self,
        post_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, RefreshError> {
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(STATUS_DELETED))
            .col_expr(Column::UpdatedAt, Expr::value(to_db_time(now)))
            .filter(Column::Id.eq(post_id))
            .exec(&self.db)
            .await
            .map_err(|err| map_db_err("failed to mark post deleted", err))?;

        Ok(result.rows_affected > 0)
    }
}
