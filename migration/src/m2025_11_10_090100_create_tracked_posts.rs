//! Migration to create the tracked_posts table.
//!
//! Tracked posts hold the latest engagement snapshot for a post published on
//! (or synced from) the remote network.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TrackedPosts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TrackedPosts::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(TrackedPosts::OwnerId).uuid().not_null())
                    .col(ColumnDef::new(TrackedPosts::RemoteId).text().null())
                    .col(ColumnDef::new(TrackedPosts::RemoteAuthorId).text().null())
                    .col(
                        ColumnDef::new(TrackedPosts::PublishedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TrackedPosts::MetricsUpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(TrackedPosts::Impressions)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(TrackedPosts::Likes)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(TrackedPosts::Retweets)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(TrackedPosts::Replies)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(TrackedPosts::Quotes)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(TrackedPosts::Bookmarks)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(TrackedPosts::Status)
                            .text()
                            .not_null()
                            .default("posted"),
                    )
                    .col(
                        ColumnDef::new(TrackedPosts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(TrackedPosts::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Candidate selection scans one owner's recent posts newest-first
        manager
            .create_index(
                Index::create()
                    .name("idx_tracked_posts_owner_status_published")
                    .table(TrackedPosts::Table)
                    .col(TrackedPosts::OwnerId)
                    .col(TrackedPosts::Status)
                    .col(TrackedPosts::PublishedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_tracked_posts_remote_id")
                    .table(TrackedPosts::Table)
                    .col(TrackedPosts::RemoteId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_tracked_posts_owner_status_published")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(Index::drop().name("idx_tracked_posts_remote_id").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(TrackedPosts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TrackedPosts {
    Table,
    Id,
    OwnerId,
    RemoteId,
    RemoteAuthorId,
    PublishedAt,
    MetricsUpdatedAt,
    Impressions,
    Likes,
    Retweets,
    Replies,
    Quotes,
    Bookmarks,
    Status,
    CreatedAt,
    UpdatedAt,
}
