//! Lookup client boundary
//!
//! The scheduler talks to the remote network only through [`LookupClient`].
//! Provider-specific response shapes are folded into [`LookupOutcome`] before
//! they reach the core.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::account_credential::Model as AccountCredential;

pub mod x_api;

pub use x_api::XLookupClient;

/// Engagement counters reported by the remote network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMetrics {
    pub impressions: i64,
    pub likes: i64,
    pub retweets: i64,
    pub replies: i64,
    pub quotes: i64,
    pub bookmarks: i64,
}

/// Per-ID result of a batch lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Success(PostMetrics),
    /// The remote post is gone (deleted or never existed)
    NotFound,
    /// This ID was refused because of quota, with an optional resume hint
    RateLimited(Option<DateTime<Utc>>),
    OtherError(String),
}

/// Result of one batch lookup call.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchLookup {
    /// The call went through; every requested ID has an outcome
    Completed(HashMap<String, LookupOutcome>),
    /// The whole call was refused because of quota
    RateLimited { resume_at: Option<DateTime<Utc>> },
}

impl BatchLookup {
    /// Resume hint if the batch, or any ID in it, was throttled.
    ///
    /// Returns `Some(None)` for a throttle without a hint.
    pub fn rate_limit(&self) -> Option<Option<DateTime<Utc>>> {
        match self {
            BatchLookup::RateLimited { resume_at } => Some(*resume_at),
            BatchLookup::Completed(outcomes) => outcomes
                .values()
                .filter_map(|outcome| match outcome {
                    LookupOutcome::RateLimited(resume_at) => Some(*resume_at),
                    _ => None,
                })
                .reduce(|latest, current| latest.max(current)),
        }
    }
}

/// Call-level failures that prevent any outcome from being reported.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LookupError {
    #[error("credential rejected by provider: {0}")]
    Unauthorized(String),
    #[error("transient lookup failure: {0}")]
    Transient(String),
    #[error("malformed lookup response: {0}")]
    Malformed(String),
}

/// Batch metrics lookup against the remote network.
#[async_trait]
pub trait LookupClient: Send + Sync {
    /// Look up current metrics for `remote_ids` using `credential`.
    ///
    /// `now` anchors relative rate-limit hints such as `Retry-After`.
    async fn fetch_batch(
        &self,
        credential: &AccountCredential,
        remote_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<BatchLookup, LookupError>;
}
