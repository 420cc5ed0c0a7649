//! # Candidate Selector
//!
//! Picks the posts of one owner to look up in a pass: the newest few are
//! always refreshed, the rest only when the freshness policy says their
//! snapshot is stale. The union is deduplicated, sorted newest-first and
//! capped so one owner costs at most one lookup batch.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::RefreshError;
use crate::freshness::{FreshnessBucket, FreshnessPolicy};
use crate::models::tracked_post::Model as TrackedPost;
use crate::repositories::post::{EligibilityScope, PostRepository};

/// A post chosen for lookup in the current pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshCandidate {
    pub post_id: Uuid,
    pub remote_id: String,
    pub published_at: DateTime<Utc>,
    pub bucket: FreshnessBucket,
    /// Included through the force-refresh set
    pub forced: bool,
}

/// Per-pass selection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionLimits {
    pub candidate_cap: usize,
    pub force_refresh_count: usize,
}

impl SelectionLimits {
    /// The force-refresh count is clamped to the cap.
    pub fn new(candidate_cap: usize, force_refresh_count: usize) -> Self {
        Self {
            candidate_cap,
            force_refresh_count: force_refresh_count.min(candidate_cap),
        }
    }
}

pub struct CandidateSelector {
    posts: PostRepository,
    policy: FreshnessPolicy,
    limits: SelectionLimits,
}

impl CandidateSelector {
    pub fn new(posts: PostRepository, policy: FreshnessPolicy, limits: SelectionLimits) -> Self {
        Self {
            posts,
            policy,
            limits,
        }
    }

    /// Select at most `candidate_cap` distinct candidates, newest first.
    pub async fn select(
        &self,
        scope: &EligibilityScope,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshCandidate>, RefreshError> {
        if self.limits.candidate_cap == 0 {
            return Ok(Vec::new());
        }

        let forced = self
            .posts
            .newest_eligible(scope, self.limits.force_refresh_count as u64)
            .await?;

        // Nothing fresher than the shortest threshold can be stale.
        let min_stale = self
            .policy
            .stale_minutes
            .iter()
            .copied()
            .min()
            .unwrap_or_default();
        let pool = self
            .posts
            .stale_eligible(scope, now - Duration::minutes(min_stale))
            .await?;

        Ok(merge_candidates(
            &self.policy,
            self.limits,
            forced,
            pool,
            now,
        ))
    }
}

/// Union the forced set with the policy-eligible pool, dedupe, sort and cap.
pub fn merge_candidates(
    policy: &FreshnessPolicy,
    limits: SelectionLimits,
    forced: Vec<TrackedPost>,
    pool: Vec<TrackedPost>,
    now: DateTime<Utc>,
) -> Vec<RefreshCandidate> {
    let mut by_id: HashMap<Uuid, RefreshCandidate> = HashMap::new();

    for post in forced.into_iter().take(limits.force_refresh_count) {
        if let Some(candidate) = to_candidate(policy, &post, now, true) {
            insert_newest(&mut by_id, candidate);
        }
    }

    let mut stale: Vec<RefreshCandidate> = pool
        .iter()
        .filter(|post| {
            policy
                .needs_refresh(
                    post.published_at.with_timezone(&Utc),
                    post.metrics_updated_at.map(|at| at.with_timezone(&Utc)),
                    now,
                )
                .is_some()
        })
        .filter_map(|post| to_candidate(policy, post, now, false))
        .collect();
    // Most urgent bucket first, then newest.
    stale.sort_by(|a, b| {
        a.bucket
            .cmp(&b.bucket)
            .then(b.published_at.cmp(&a.published_at))
    });

    for candidate in stale {
        if by_id.len() >= limits.candidate_cap && !by_id.contains_key(&candidate.post_id) {
            break;
        }
        insert_newest(&mut by_id, candidate);
    }

    let mut candidates: Vec<RefreshCandidate> = by_id.into_values().collect();
    candidates.sort_by(|a, b| {
        b.published_at
            .cmp(&a.published_at)
            .then(a.post_id.cmp(&b.post_id))
    });
    candidates.truncate(limits.candidate_cap);
    candidates
}

fn to_candidate(
    policy: &FreshnessPolicy,
    post: &TrackedPost,
    now: DateTime<Utc>,
    forced: bool,
) -> Option<RefreshCandidate> {
    let remote_id = post.remote_id.clone().filter(|id| !id.is_empty())?;
    let published_at = post.published_at.with_timezone(&Utc);

    Some(RefreshCandidate {
        post_id: post.id,
        remote_id,
        published_at,
        bucket: policy.bucket_at(published_at, now),
        forced,
    })
}

fn insert_newest(by_id: &mut HashMap<Uuid, RefreshCandidate>, candidate: RefreshCandidate) {
    match by_id.get_mut(&candidate.post_id) {
        Some(existing) => {
            if candidate.published_at > existing.published_at {
                existing.published_at = candidate.published_at;
            }
            existing.forced |= candidate.forced;
        }
        None => {
            by_id.insert(candidate.post_id, candidate);
        }
    }
}
