//! # Tiered Freshness Policy
//!
//! Maps a post's age onto a freshness bucket and decides whether its metric
//! snapshot is stale enough to be looked up again. Young posts move fast and
//! are refreshed every few minutes; month-old posts barely change.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::SchedulerConfig;

/// Freshness bucket ordered by age: `Hot < Warm < Cool < Cold`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessBucket {
    Hot,
    Warm,
    Cool,
    Cold,
}

impl FreshnessBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            FreshnessBucket::Hot => "hot",
            FreshnessBucket::Warm => "warm",
            FreshnessBucket::Cool => "cool",
            FreshnessBucket::Cold => "cold",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

const DEFAULT_MAX_HOURS: [i64; 4] = [6, 24, 72, 720];
const DEFAULT_STALE_MINUTES: [i64; 4] = [15, 60, 360, 1440];

/// Bucket boundaries and staleness thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FreshnessPolicy {
    /// Upper age bound in hours for hot, warm, cool and cold posts
    #[schema(value_type = Vec<i64>)]
    pub max_hours: [i64; 4],
    /// Minutes after which a snapshot in each bucket is stale
    #[schema(value_type = Vec<i64>)]
    pub stale_minutes: [i64; 4],
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            max_hours: DEFAULT_MAX_HOURS,
            stale_minutes: DEFAULT_STALE_MINUTES,
        }
    }
}

impl FreshnessPolicy {
    /// Build the policy from scheduler configuration.
    ///
    /// Non-positive values fall back to their defaults. Boundaries that are not
    /// strictly increasing after that fall back as a whole.
    pub fn from_config(config: &SchedulerConfig) -> Self {
        let mut max_hours = [
            config.hot_max_hours,
            config.warm_max_hours,
            config.cool_max_hours,
            config.cold_max_hours,
        ];
        let mut stale_minutes = [
            config.hot_stale_minutes,
            config.warm_stale_minutes,
            config.cool_stale_minutes,
            config.cold_stale_minutes,
        ];

        for (value, default) in max_hours.iter_mut().zip(DEFAULT_MAX_HOURS) {
            if *value <= 0 {
                *value = default;
            }
        }
        for (value, default) in stale_minutes.iter_mut().zip(DEFAULT_STALE_MINUTES) {
            if *value <= 0 {
                *value = default;
            }
        }

        if max_hours.windows(2).any(|pair| pair[0] >= pair[1]) {
            max_hours = DEFAULT_MAX_HOURS;
        }

        Self {
            max_hours,
            stale_minutes,
        }
    }

    /// Bucket for a post of the given age in hours.
    pub fn bucket(&self, age_hours: f64) -> FreshnessBucket {
        if age_hours <= self.max_hours[0] as f64 {
            FreshnessBucket::Hot
        } else if age_hours <= self.max_hours[1] as f64 {
            FreshnessBucket::Warm
        } else if age_hours <= self.max_hours[2] as f64 {
            FreshnessBucket::Cool
        } else {
            FreshnessBucket::Cold
        }
    }

    /// Bucket for a post published at `published_at`, seen at `now`.
    pub fn bucket_at(&self, published_at: DateTime<Utc>, now: DateTime<Utc>) -> FreshnessBucket {
        self.bucket(age_hours(published_at, now))
    }

    /// Minutes after which a snapshot in `bucket` is considered stale.
    pub fn stale_minutes(&self, bucket: FreshnessBucket) -> i64 {
        self.stale_minutes[bucket.index()]
    }

    /// Whether the post is past the oldest tracked boundary.
    pub fn is_beyond_horizon(&self, published_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        age_hours(published_at, now) > self.max_hours[3] as f64
    }

    /// Decide whether a post needs a refresh, returning its bucket if so.
    ///
    /// Posts whose metrics were never fetched always qualify. Posts past the
    /// cold boundary with a snapshot only come back through force-refresh.
    pub fn needs_refresh(
        &self,
        published_at: DateTime<Utc>,
        metrics_updated_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<FreshnessBucket> {
        let bucket = self.bucket_at(published_at, now);

        let Some(last_updated) = metrics_updated_at else {
            return Some(bucket);
        };

        if self.is_beyond_horizon(published_at, now) {
            return None;
        }

        let since_update = now - last_updated;
        if since_update >= Duration::minutes(self.stale_minutes(bucket)) {
            Some(bucket)
        } else {
            None
        }
    }
}

fn age_hours(published_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - published_at).num_seconds() as f64 / 3600.0
}
