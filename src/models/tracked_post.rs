//! TrackedPost entity model
//!
//! A post published on (or synced from) the remote network whose engagement
//! counters are kept fresh by the scheduler.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

/// Lifecycle status of a post that is live on the remote network.
pub const STATUS_POSTED: &str = "posted";
/// Lifecycle status of a post the remote network reports as gone.
pub const STATUS_DELETED: &str = "deleted";

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "tracked_posts")]
pub struct Model {
    /// Local identifier (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Account owner the post is tracked for
    pub owner_id: Uuid,

    /// Remote post identifier, absent until the post is published
    pub remote_id: Option<String>,

    /// Remote account that authored the post
    pub remote_author_id: Option<String>,

    pub published_at: DateTimeWithTimeZone,

    /// When the metric snapshot was last overwritten, `None` if never fetched
    pub metrics_updated_at: Option<DateTimeWithTimeZone>,

    pub impressions: i64,
    pub likes: i64,
    pub retweets: i64,
    pub replies: i64,
    pub quotes: i64,
    pub bookmarks: i64,

    /// Lifecycle status (posted|deleted, other values are never refreshed)
    pub status: String,

    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
