//! Database migrations for the metrics refresher.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_11_10_090000_create_account_credentials;
mod m2025_11_10_090100_create_tracked_posts;
mod m2025_11_10_090200_create_metrics_sync_locks;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_11_10_090000_create_account_credentials::Migration),
            Box::new(m2025_11_10_090100_create_tracked_posts::Migration),
            Box::new(m2025_11_10_090200_create_metrics_sync_locks::Migration),
        ]
    }
}
