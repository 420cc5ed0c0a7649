//! # Data Models
//!
//! SeaORM entities for tracked posts, account credentials and refresh locks,
//! plus the service info payload served at `/`.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod account_credential;
pub mod sync_lock;
pub mod tracked_post;

pub use account_credential::Entity as AccountCredential;
pub use sync_lock::Entity as SyncLock;
pub use tracked_post::Entity as TrackedPost;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "metrics-refresher".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
