//! # Token Refresh
//!
//! Makes sure an owner's access token is usable before a lookup call.
//! Tokens expiring within the lead window are rotated through the provider's
//! OAuth2 token endpoint and stored back in place.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::error::RefreshError;
use crate::models::account_credential::Model as AccountCredential;
use crate::repositories::CredentialRepository;
use crate::repositories::credential::RotatedTokens;

/// Credential problems that prevent a lookup for an owner.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("credential has no access token or linked account")]
    MissingCredential,
    #[error("access token expired and no refresh token is available")]
    Expired,
    #[error("token refresh is not configured")]
    RefreshUnavailable,
    #[error("token refresh rejected: {0}")]
    Rejected(String),
    #[error("token refresh failed: {0}")]
    Transient(String),
}

/// Token endpoint response, the subset the refresher needs.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of the new access token in seconds
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Exchanges a refresh token for a new access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError>;
}

/// OAuth2 refresh-token grant against the X token endpoint.
#[derive(Debug, Clone)]
pub struct XTokenRefresher {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
}

impl XTokenRefresher {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AuthError::Transient(format!("failed to build client: {err}")))?;

        Ok(Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
        })
    }
}

#[async_trait]
impl TokenRefresher for XTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];

        let mut request = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&params);
        // Confidential clients authenticate with HTTP basic auth.
        if let Some(secret) = &self.client_secret {
            request = request.basic_auth(&self.client_id, Some(secret));
        }

        let response = request
            .send()
            .await
            .map_err(|err| AuthError::Transient(format!("token request failed: {err}")))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<TokenResponse>()
                .await
                .map_err(|err| AuthError::Transient(format!("invalid token response: {err}")));
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            Err(AuthError::Rejected(format!("{status}: {body}")))
        } else {
            Err(AuthError::Transient(format!("{status}: {body}")))
        }
    }
}

/// Hands out credentials that are valid for at least the lead window.
#[derive(Clone)]
pub struct CredentialProvider {
    credentials: CredentialRepository,
    refresher: Option<Arc<dyn TokenRefresher>>,
    lead: Duration,
}

impl CredentialProvider {
    pub fn new(
        credentials: CredentialRepository,
        refresher: Option<Arc<dyn TokenRefresher>>,
        lead: Duration,
    ) -> Self {
        Self {
            credentials,
            refresher,
            lead,
        }
    }

    /// Return a usable credential, refreshing it first if it is near expiry.
    ///
    /// A token that is close to expiring but still valid is used as-is when
    /// no refresh token is stored.
    #[instrument(skip_all, fields(owner_id = %credential.owner_id))]
    pub async fn ensure_fresh(
        &self,
        credential: AccountCredential,
        now: DateTime<Utc>,
    ) -> Result<AccountCredential, RefreshError> {
        if credential.access_token.is_empty()
            || credential
                .remote_account_id
                .as_deref()
                .is_none_or(str::is_empty)
        {
            return Err(AuthError::MissingCredential.into());
        }

        let Some(expires_at) = credential.expires_at.map(|at| at.with_timezone(&Utc)) else {
            return Ok(credential);
        };

        if expires_at > now + self.lead {
            return Ok(credential);
        }

        let Some(refresh_token) = credential.refresh_token.clone().filter(|t| !t.is_empty())
        else {
            if expires_at > now {
                debug!("Access token near expiry without refresh token; using as-is");
                return Ok(credential);
            }
            return Err(AuthError::Expired.into());
        };

        let Some(refresher) = &self.refresher else {
            if expires_at > now {
                return Ok(credential);
            }
            return Err(AuthError::RefreshUnavailable.into());
        };

        counter!("metrics_refresh_token_refresh_attempts_total").increment(1);
        let response = match refresher.refresh(&refresh_token).await {
            Ok(response) => response,
            Err(err) => {
                counter!("metrics_refresh_token_refresh_failures_total").increment(1);
                warn!(error = %err, "Access token refresh failed");
                return Err(err.into());
            }
        };

        let tokens = RotatedTokens {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at: response.expires_in.map(|seconds| now + Duration::seconds(seconds)),
        };

        self.credentials.store_rotated(credential, tokens, now).await
    }
}
