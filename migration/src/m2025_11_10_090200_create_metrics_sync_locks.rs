//! Migration to create the metrics_sync_locks table.
//!
//! One row per account owner. The row doubles as the cross-process refresh
//! lock and the record of when the owner may be refreshed again.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(MetricsSyncLocks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MetricsSyncLocks::OwnerId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(MetricsSyncLocks::InProgress)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(MetricsSyncLocks::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(MetricsSyncLocks::LastSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(MetricsSyncLocks::NextAllowedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(MetricsSyncLocks::LastResult).text().null())
                    .col(
                        ColumnDef::new(MetricsSyncLocks::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_metrics_sync_locks_next_allowed")
                    .table(MetricsSyncLocks::Table)
                    .col(MetricsSyncLocks::InProgress)
                    .col(MetricsSyncLocks::NextAllowedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_metrics_sync_locks_next_allowed")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(MetricsSyncLocks::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum MetricsSyncLocks {
    Table,
    OwnerId,
    InProgress,
    StartedAt,
    LastSyncAt,
    NextAllowedAt,
    LastResult,
    UpdatedAt,
}
