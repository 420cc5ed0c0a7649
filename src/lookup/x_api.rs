//! X API v2 lookup client
//!
//! Batch tweet lookup (`GET /2/tweets?ids=...`) with engagement metrics.
//! The scheduler never asks for more than [`MAX_IDS_PER_REQUEST`] IDs, so a
//! pass costs one request. Larger batches are split into chunks and issued
//! sequentially.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::{BatchLookup, LookupClient, LookupError, LookupOutcome, PostMetrics};
use crate::models::account_credential::Model as AccountCredential;

/// Maximum IDs accepted by one tweet lookup request.
pub const MAX_IDS_PER_REQUEST: usize = 100;

const USER_AGENT: &str = "Metrics-Refresher/0.1";

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    data: Vec<TweetData>,
    #[serde(default)]
    errors: Vec<TweetError>,
}

#[derive(Debug, Deserialize)]
struct TweetData {
    id: String,
    #[serde(default)]
    public_metrics: Option<PublicMetrics>,
    #[serde(default)]
    non_public_metrics: Option<ImpressionMetrics>,
    #[serde(default)]
    organic_metrics: Option<ImpressionMetrics>,
}

/// Owner-only metric groups; only the impression count is used.
#[derive(Debug, Default, Deserialize)]
struct ImpressionMetrics {
    #[serde(default)]
    impression_count: Option<i64>,
}

impl TweetData {
    fn into_metrics(self) -> PostMetrics {
        let impressions = self
            .non_public_metrics
            .and_then(|metrics| metrics.impression_count)
            .or_else(|| {
                self.organic_metrics
                    .and_then(|metrics| metrics.impression_count)
            });
        let mut metrics = PostMetrics::from(self.public_metrics.unwrap_or_default());
        if let Some(impressions) = impressions {
            metrics.impressions = impressions;
        }
        metrics
    }
}

#[derive(Debug, Default, Deserialize)]
struct PublicMetrics {
    #[serde(default)]
    retweet_count: i64,
    #[serde(default)]
    reply_count: i64,
    #[serde(default)]
    like_count: i64,
    #[serde(default)]
    quote_count: i64,
    #[serde(default)]
    bookmark_count: i64,
    #[serde(default)]
    impression_count: i64,
}

#[derive(Debug, Deserialize)]
struct TweetError {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    resource_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

impl TweetError {
    fn remote_id(&self) -> Option<&str> {
        self.resource_id.as_deref().or(self.value.as_deref())
    }

    fn is_not_found(&self) -> bool {
        self.title.as_deref() == Some("Not Found Error")
            || self
                .kind
                .as_deref()
                .is_some_and(|kind| kind.ends_with("resource-not-found"))
    }
}

impl From<PublicMetrics> for PostMetrics {
    fn from(metrics: PublicMetrics) -> Self {
        PostMetrics {
            impressions: metrics.impression_count,
            likes: metrics.like_count,
            retweets: metrics.retweet_count,
            replies: metrics.reply_count,
            quotes: metrics.quote_count,
            bookmarks: metrics.bookmark_count,
        }
    }
}

/// Result of a single chunked request.
enum ChunkResult {
    Completed(HashMap<String, LookupOutcome>),
    RateLimited(Option<DateTime<Utc>>),
}

/// Tweet lookup client for the X API.
#[derive(Debug, Clone)]
pub struct XLookupClient {
    client: reqwest::Client,
    api_base: String,
}

impl XLookupClient {
    /// Create a client for `api_base` (e.g. `https://api.x.com`).
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Result<Self, LookupError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| LookupError::Transient(format!("failed to build client: {err}")))?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    fn lookup_url(&self, ids: &[String]) -> Result<Url, LookupError> {
        let mut url = Url::parse(&format!("{}/2/tweets", self.api_base))
            .map_err(|err| LookupError::Malformed(format!("invalid api base: {err}")))?;
        url.query_pairs_mut()
            .append_pair("ids", &ids.join(","))
            .append_pair(
                "tweet.fields",
                "public_metrics,non_public_metrics,organic_metrics",
            );
        Ok(url)
    }

    async fn fetch_chunk(
        &self,
        access_token: &str,
        ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<ChunkResult, LookupError> {
        let url = self.lookup_url(ids)?;

        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|err| LookupError::Transient(err.to_string()))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let resume_at = resume_hint(response.headers(), now);
            warn!(resume_at = ?resume_at, "Rate limited by X API");
            return Ok(ChunkResult::RateLimited(resume_at));
        }

        if status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(LookupError::Unauthorized(snippet(&body)));
        }

        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(LookupError::Transient(format!(
                "X API server error {}: {}",
                status,
                snippet(&body)
            )));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LookupError::Transient(format!(
                "X API returned {}: {}",
                status,
                snippet(&body)
            )));
        }

        let payload: LookupResponse = response
            .json()
            .await
            .map_err(|err| LookupError::Malformed(err.to_string()))?;

        Ok(ChunkResult::Completed(collect_outcomes(ids, payload)))
    }
}

#[async_trait]
impl LookupClient for XLookupClient {
    async fn fetch_batch(
        &self,
        credential: &AccountCredential,
        remote_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<BatchLookup, LookupError> {
        let mut outcomes = HashMap::with_capacity(remote_ids.len());

        for (index, chunk) in remote_ids.chunks(MAX_IDS_PER_REQUEST).enumerate() {
            match self.fetch_chunk(&credential.access_token, chunk, now).await? {
                ChunkResult::Completed(chunk_outcomes) => outcomes.extend(chunk_outcomes),
                ChunkResult::RateLimited(resume_at) if index == 0 => {
                    return Ok(BatchLookup::RateLimited { resume_at });
                }
                ChunkResult::RateLimited(resume_at) => {
                    // Keep what earlier chunks returned; the rest waits for the window.
                    for id in &remote_ids[index * MAX_IDS_PER_REQUEST..] {
                        outcomes.insert(id.clone(), LookupOutcome::RateLimited(resume_at));
                    }
                    break;
                }
            }
        }

        debug!(
            owner_id = %credential.owner_id,
            requested = remote_ids.len(),
            returned = outcomes.len(),
            "X API batch lookup finished"
        );

        Ok(BatchLookup::Completed(outcomes))
    }
}

fn collect_outcomes(ids: &[String], payload: LookupResponse) -> HashMap<String, LookupOutcome> {
    let mut outcomes = HashMap::with_capacity(ids.len());

    for tweet in payload.data {
        let id = tweet.id.clone();
        outcomes.insert(id, LookupOutcome::Success(tweet.into_metrics()));
    }

    for error in payload.errors {
        let Some(remote_id) = error.remote_id() else {
            continue;
        };
        let outcome = if error.is_not_found() {
            LookupOutcome::NotFound
        } else {
            LookupOutcome::OtherError(
                error
                    .detail
                    .clone()
                    .or_else(|| error.title.clone())
                    .unwrap_or_else(|| "unknown error".to_string()),
            )
        };
        outcomes.entry(remote_id.to_string()).or_insert(outcome);
    }

    for id in ids {
        outcomes
            .entry(id.clone())
            .or_insert_with(|| LookupOutcome::OtherError("missing from response".to_string()));
    }

    outcomes
}

/// Resume time from `x-rate-limit-reset` (epoch seconds) or `Retry-After` (seconds after `now`).
fn resume_hint(headers: &reqwest::header::HeaderMap, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let reset = headers
        .get("x-rate-limit-reset")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .and_then(|timestamp| DateTime::from_timestamp(timestamp, 0));

    reset.or_else(|| {
        headers
            .get("retry-after")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .and_then(chrono::Duration::try_seconds)
            .and_then(|delay| now.checked_add_signed(delay))
    })
}

fn snippet(body: &str) -> String {
    body.chars().take(256).collect()
}
