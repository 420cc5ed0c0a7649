//! # Result Applier
//!
//! Writes lookup outcomes back to tracked posts. The remote network is the
//! source of truth, so a successful lookup overwrites the whole snapshot.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, warn};

use crate::lookup::LookupOutcome;
use crate::repositories::PostRepository;
use crate::selector::RefreshCandidate;

/// Counts of what one apply pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub updated_count: u64,
    pub deleted_count: u64,
    pub error_count: u64,
}

pub struct ResultApplier {
    posts: PostRepository,
}

impl ResultApplier {
    pub fn new(posts: PostRepository) -> Self {
        Self { posts }
    }

    /// Apply per-ID outcomes to the candidates they were fetched for.
    ///
    /// Row write failures are counted and logged rather than returned.
    /// Throttled IDs are left for a later pass and not counted.
    pub async fn apply(
        &self,
        candidates: &[RefreshCandidate],
        outcomes: &HashMap<String, LookupOutcome>,
        now: DateTime<Utc>,
    ) -> ApplySummary {
        let mut summary = ApplySummary::default();

        for candidate in candidates {
            let Some(outcome) = outcomes.get(&candidate.remote_id) else {
                summary.error_count += 1;
                warn!(
                    post_id = %candidate.post_id,
                    remote_id = %candidate.remote_id,
                    "No lookup outcome for candidate"
                );
                continue;
            };

            match outcome {
                LookupOutcome::Success(metrics) => {
                    match self.posts.apply_metrics(candidate.post_id, metrics, now).await {
                        Ok(true) => summary.updated_count += 1,
                        Ok(false) => {
                            summary.error_count += 1;
                            warn!(post_id = %candidate.post_id, "Tracked post vanished before update");
                        }
                        Err(err) => {
                            summary.error_count += 1;
                            warn!(post_id = %candidate.post_id, error = %err, "Failed to store metrics");
                        }
                    }
                }
                LookupOutcome::NotFound => {
                    match self.posts.mark_deleted(candidate.post_id, now).await {
                        Ok(true) => {
                            summary.deleted_count += 1;
                            debug!(
                                post_id = %candidate.post_id,
                                remote_id = %candidate.remote_id,
                                "Remote post gone; marked deleted"
                            );
                        }
                        Ok(false) => summary.error_count += 1,
                        Err(err) => {
                            summary.error_count += 1;
                            warn!(post_id = %candidate.post_id, error = %err, "Failed to mark post deleted");
                        }
                    }
                }
                LookupOutcome::RateLimited(_) => {}
                LookupOutcome::OtherError(detail) => {
                    summary.error_count += 1;
                    debug!(
                        post_id = %candidate.post_id,
                        remote_id = %candidate.remote_id,
                        detail = %detail,
                        "Lookup failed for post"
                    );
                }
            }
        }

        counter!("metrics_refresh_posts_updated_total").increment(summary.updated_count);
        counter!("metrics_refresh_posts_deleted_total").increment(summary.deleted_count);
        counter!("metrics_refresh_post_errors_total").increment(summary.error_count);

        summary
    }
}
