//! SyncLock entity model
//!
//! Durable per-owner refresh lock plus the owner's refresh cadence state.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "metrics_sync_locks")]
pub struct Model {
    /// Account owner (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub owner_id: Uuid,

    /// Whether a worker currently holds the lock
    pub in_progress: bool,

    /// When the current (or last) holder claimed the lock
    pub started_at: Option<DateTimeWithTimeZone>,

    pub last_sync_at: Option<DateTimeWithTimeZone>,

    /// Earliest time the owner may be refreshed again
    pub next_allowed_at: Option<DateTimeWithTimeZone>,

    /// Outcome of the last completed run (see `SyncOutcome`)
    pub last_result: Option<String>,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
