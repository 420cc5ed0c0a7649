//! Migration to create the account_credentials table.
//!
//! Credentials are written by the auth subsystem; the refresher reads them and
//! writes back rotated tokens.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AccountCredentials::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AccountCredentials::OwnerId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(AccountCredentials::AccessToken)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AccountCredentials::RefreshToken)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AccountCredentials::ExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AccountCredentials::RemoteAccountId)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AccountCredentials::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AccountCredentials::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AccountCredentials {
    Table,
    OwnerId,
    AccessToken,
    RefreshToken,
    ExpiresAt,
    RemoteAccountId,
    UpdatedAt,
}
