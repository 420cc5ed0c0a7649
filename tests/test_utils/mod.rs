//! Test utilities for database and scheduler testing.
//!
//! In-memory SQLite databases with migrations applied, fixture inserts for
//! credentials and tracked posts, and a scripted lookup client.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics_refresher::config::SchedulerConfig;
use metrics_refresher::lookup::{BatchLookup, LookupClient, LookupError, LookupOutcome, PostMetrics};
use metrics_refresher::models::account_credential::{
    ActiveModel as CredentialActiveModel, Model as AccountCredential,
};
use metrics_refresher::models::sync_lock::{Entity as SyncLock, Model as SyncLockModel};
use metrics_refresher::models::tracked_post::{
    ActiveModel as PostActiveModel, Entity as TrackedPost, Model as PostModel, STATUS_POSTED,
};
use metrics_refresher::scheduler::{ManualClock, MetricsScheduler};
use metrics_refresher::token_refresh::TokenRefresher;
use migration::{Migrator, MigratorTrait};
use sea_orm::{ActiveModelTrait, Database, DatabaseConnection, EntityTrait, Set};
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Fixed reference time used across scheduler tests.
pub fn fixed_now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

/// Inserts a credential linked to `remote_account_id`.
pub async fn insert_credential(
    db: &DatabaseConnection,
    owner_id: Uuid,
    remote_account_id: Option<&str>,
    expires_at: Option<DateTime<Utc>>,
    refresh_token: Option<&str>,
) -> Result<AccountCredential> {
    let credential = CredentialActiveModel {
        owner_id: Set(owner_id),
        access_token: Set(format!("access-{owner_id}")),
        refresh_token: Set(refresh_token.map(str::to_string)),
        expires_at: Set(expires_at.map(|at| at.fixed_offset())),
        remote_account_id: Set(remote_account_id.map(str::to_string)),
        updated_at: Set(fixed_now().fixed_offset()),
    };
    Ok(credential.insert(db).await?)
}

/// Fixture description for a tracked post.
#[derive(Debug, Clone)]
pub struct PostFixture {
    pub owner_id: Uuid,
    pub remote_id: Option<String>,
    pub remote_author_id: Option<String>,
    pub published_at: DateTime<Utc>,
    pub metrics_updated_at: Option<DateTime<Utc>>,
    pub status: String,
}

impl PostFixture {
    pub fn new(owner_id: Uuid, author: &str, published_at: DateTime<Utc>) -> Self {
        Self {
            owner_id,
            remote_id: Some(format!("tw-{}", Uuid::new_v4().simple())),
            remote_author_id: Some(author.to_string()),
            published_at,
            metrics_updated_at: None,
            status: STATUS_POSTED.to_string(),
        }
    }

    pub fn updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.metrics_updated_at = Some(at);
        self
    }

    pub fn status(mut self, status: &str) -> Self {
        self.status = status.to_string();
        self
    }

    pub fn remote_id(mut self, remote_id: Option<&str>) -> Self {
        self.remote_id = remote_id.map(str::to_string);
        self
    }
}

/// Inserts a tracked post and returns it.
pub async fn insert_post(db: &DatabaseConnection, fixture: PostFixture) -> Result<PostModel> {
    let now = fixed_now().fixed_offset();
    let post = PostActiveModel {
        id: Set(Uuid::new_v4()),
        owner_id: Set(fixture.owner_id),
        remote_id: Set(fixture.remote_id),
        remote_author_id: Set(fixture.remote_author_id),
        published_at: Set(fixture.published_at.fixed_offset()),
        metrics_updated_at: Set(fixture.metrics_updated_at.map(|at| at.fixed_offset())),
        impressions: Set(0),
        likes: Set(0),
        retweets: Set(0),
        replies: Set(0),
        quotes: Set(0),
        bookmarks: Set(0),
        status: Set(fixture.status),
        created_at: Set(now),
        updated_at: Set(now),
    };
    Ok(post.insert(db).await?)
}

pub async fn load_post(db: &DatabaseConnection, id: Uuid) -> Result<PostModel> {
    TrackedPost::find_by_id(id)
        .one(db)
        .await?
        .ok_or_else(|| anyhow::anyhow!("post {id} not found"))
}

pub async fn load_lock(db: &DatabaseConnection, owner_id: Uuid) -> Result<Option<SyncLockModel>> {
    Ok(SyncLock::find_by_id(owner_id).one(db).await?)
}

/// Canned response of the scripted lookup client for one owner.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Every requested ID succeeds with these metrics
    Metrics(PostMetrics),
    /// Every requested ID is reported gone
    NotFound,
    RateLimited(Option<DateTime<Utc>>),
    Unauthorized,
    Transient,
}

/// Lookup client that answers per owner from a script and records calls.
#[derive(Default)]
pub struct ScriptedLookup {
    responses: Mutex<HashMap<Uuid, Scripted>>,
    calls: Mutex<Vec<(Uuid, Vec<String>)>>,
}

impl ScriptedLookup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, owner_id: Uuid, response: Scripted) {
        self.responses
            .lock()
            .unwrap()
            .insert(owner_id, response);
    }

    pub fn calls(&self) -> Vec<(Uuid, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, owner_id: Uuid) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(owner, _)| *owner == owner_id)
            .count()
    }
}

#[async_trait]
impl LookupClient for ScriptedLookup {
    async fn fetch_batch(
        &self,
        credential: &AccountCredential,
        remote_ids: &[String],
        _now: DateTime<Utc>,
    ) -> Result<BatchLookup, LookupError> {
        self.calls
            .lock()
            .unwrap()
            .push((credential.owner_id, remote_ids.to_vec()));

        let response = self
            .responses
            .lock()
            .unwrap()
            .get(&credential.owner_id)
            .cloned()
            .unwrap_or(Scripted::Metrics(PostMetrics::default()));

        let each = |outcome: LookupOutcome| {
            BatchLookup::Completed(
                remote_ids
                    .iter()
                    .map(|id| (id.clone(), outcome.clone()))
                    .collect(),
            )
        };

        match response {
            Scripted::Metrics(metrics) => Ok(each(LookupOutcome::Success(metrics))),
            Scripted::NotFound => Ok(each(LookupOutcome::NotFound)),
            Scripted::RateLimited(resume_at) => Ok(BatchLookup::RateLimited { resume_at }),
            Scripted::Unauthorized => Err(LookupError::Unauthorized("revoked".to_string())),
            Scripted::Transient => Err(LookupError::Transient("connection reset".to_string())),
        }
    }
}

/// Scheduler wired to `db`, the scripted lookup and a manual clock.
pub fn build_scheduler(
    db: &DatabaseConnection,
    config: SchedulerConfig,
    lookup: Arc<ScriptedLookup>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    clock: &ManualClock,
) -> MetricsScheduler {
    MetricsScheduler::new(
        db.clone(),
        config,
        lookup,
        refresher,
        Arc::new(clock.clone()),
    )
}
