//! Configuration loading for the metrics refresher.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `METRICS_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tick interval floor; shorter intervals are clamped rather than rejected.
pub const MIN_TICK_INTERVAL_SECONDS: u64 = 60;

/// Upper bound for the per-owner candidate cap: one lookup request per owner per pass.
pub const MAX_CANDIDATE_CAP: usize = crate::lookup::x_api::MAX_IDS_PER_REQUEST;

/// Longest accepted tick interval and bootstrap delay.
pub const MAX_SCHEDULE_SECONDS: u64 = 86_400;

/// Longest accepted lookback, in days.
pub const MAX_LOOKBACK_DAYS: i64 = 3_650;

/// Largest accepted bucket boundary, in hours.
pub const MAX_BUCKET_HOURS: i64 = 24 * MAX_LOOKBACK_DAYS;

/// Largest accepted staleness, lock, cooldown or delay window, in minutes.
pub const MAX_WINDOW_MINUTES: i64 = 525_600;

/// Longest accepted token refresh lead time, in seconds.
pub const MAX_TOKEN_REFRESH_LEAD_SECONDS: i64 = 86_400;

/// Application configuration derived from `METRICS_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default = "default_x_api_base")]
    pub x_api_base: String,
    #[serde(default = "default_x_token_url")]
    pub x_token_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_client_secret: Option<String>,
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Metrics refresh scheduler configuration.
///
/// Every field has a default so the scheduler runs with zero external
/// configuration. [`SchedulerConfig::validate`] is applied once at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SchedulerConfig {
    /// Whether the background loop is started at all (default: true)
    ///
    /// Environment variable: `METRICS_REFRESH_ENABLED`
    #[serde(default = "default_refresh_enabled")]
    pub enabled: bool,

    /// Seconds between ticks (default: 300, clamped to at least 60)
    ///
    /// Environment variable: `METRICS_REFRESH_TICK_INTERVAL_SECONDS`
    #[serde(default = "default_refresh_tick_interval_seconds")]
    pub tick_interval_seconds: u64,

    /// Delay before the first tick after start (default: 30)
    #[serde(default = "default_refresh_bootstrap_delay_seconds")]
    pub bootstrap_delay_seconds: u64,

    /// Maximum owners processed per tick (default: 25)
    #[serde(default = "default_refresh_owner_batch_size")]
    pub owner_batch_size: usize,

    /// Maximum posts looked up per owner per tick (default: 100)
    #[serde(default = "default_refresh_candidate_cap")]
    pub candidate_cap: usize,

    /// Newest posts refreshed on every pass regardless of freshness (default: 5)
    #[serde(default = "default_refresh_force_refresh_count")]
    pub force_refresh_count: usize,

    /// Only posts published within this many days are tracked (default: 30)
    #[serde(default = "default_refresh_lookback_days")]
    pub lookback_days: i64,

    /// Upper age bound of the hot bucket in hours (default: 6)
    #[serde(default = "default_refresh_hot_max_hours")]
    pub hot_max_hours: i64,
    /// Upper age bound of the warm bucket in hours (default: 24)
    #[serde(default = "default_refresh_warm_max_hours")]
    pub warm_max_hours: i64,
    /// Upper age bound of the cool bucket in hours (default: 72)
    #[serde(default = "default_refresh_cool_max_hours")]
    pub cool_max_hours: i64,
    /// Posts older than this many hours are only refreshed when forced (default: 720)
    #[serde(default = "default_refresh_cold_max_hours")]
    pub cold_max_hours: i64,

    /// Staleness threshold for hot posts in minutes (default: 15)
    #[serde(default = "default_refresh_hot_stale_minutes")]
    pub hot_stale_minutes: i64,
    /// Staleness threshold for warm posts in minutes (default: 60)
    #[serde(default = "default_refresh_warm_stale_minutes")]
    pub warm_stale_minutes: i64,
    /// Staleness threshold for cool posts in minutes (default: 360)
    #[serde(default = "default_refresh_cool_stale_minutes")]
    pub cool_stale_minutes: i64,
    /// Staleness threshold for cold posts in minutes (default: 1440)
    #[serde(default = "default_refresh_cold_stale_minutes")]
    pub cold_stale_minutes: i64,

    /// Age after which an in-progress lock is presumed abandoned (default: 30)
    #[serde(default = "default_refresh_stale_lock_minutes")]
    pub stale_lock_minutes: i64,

    /// Minimum gap between two completed runs for one owner (default: 5)
    #[serde(default = "default_refresh_cooldown_minutes")]
    pub cooldown_minutes: i64,

    /// Resume delay used when the provider rate-limits without a hint (default: 15)
    #[serde(default = "default_refresh_rate_limit_default_delay_minutes")]
    pub rate_limit_default_delay_minutes: i64,

    /// Tokens expiring within this window are refreshed before use (default: 300)
    #[serde(default = "default_refresh_token_refresh_lead_seconds")]
    pub token_refresh_lead_seconds: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            x_api_base: default_x_api_base(),
            x_token_url: default_x_token_url(),
            x_client_id: None,
            x_client_secret: None,
            lookup_timeout_ms: default_lookup_timeout_ms(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_refresh_enabled(),
            tick_interval_seconds: default_refresh_tick_interval_seconds(),
            bootstrap_delay_seconds: default_refresh_bootstrap_delay_seconds(),
            owner_batch_size: default_refresh_owner_batch_size(),
            candidate_cap: default_refresh_candidate_cap(),
            force_refresh_count: default_refresh_force_refresh_count(),
            lookback_days: default_refresh_lookback_days(),
            hot_max_hours: default_refresh_hot_max_hours(),
            warm_max_hours: default_refresh_warm_max_hours(),
            cool_max_hours: default_refresh_cool_max_hours(),
            cold_max_hours: default_refresh_cold_max_hours(),
            hot_stale_minutes: default_refresh_hot_stale_minutes(),
            warm_stale_minutes: default_refresh_warm_stale_minutes(),
            cool_stale_minutes: default_refresh_cool_stale_minutes(),
            cold_stale_minutes: default_refresh_cold_stale_minutes(),
            stale_lock_minutes: default_refresh_stale_lock_minutes(),
            cooldown_minutes: default_refresh_cooldown_minutes(),
            rate_limit_default_delay_minutes: default_refresh_rate_limit_default_delay_minutes(),
            token_refresh_lead_seconds: default_refresh_token_refresh_lead_seconds(),
        }
    }
}

impl SchedulerConfig {
    /// Tick interval after applying the one-minute floor and the one-day ceiling.
    pub fn effective_tick_interval_seconds(&self) -> u64 {
        self.tick_interval_seconds
            .clamp(MIN_TICK_INTERVAL_SECONDS, MAX_SCHEDULE_SECONDS)
    }

    /// Copy with every numeric field forced into its accepted range.
    ///
    /// The scheduler runs on this so time arithmetic stays in range even for
    /// a configuration that never went through [`SchedulerConfig::validate`].
    pub fn bounded(&self) -> Self {
        let hours = |value: i64| value.min(MAX_BUCKET_HOURS);
        let window = |value: i64| value.min(MAX_WINDOW_MINUTES);
        let candidate_cap = self.candidate_cap.min(MAX_CANDIDATE_CAP);

        Self {
            enabled: self.enabled,
            tick_interval_seconds: self.effective_tick_interval_seconds(),
            bootstrap_delay_seconds: self.bootstrap_delay_seconds.min(MAX_SCHEDULE_SECONDS),
            owner_batch_size: self.owner_batch_size.max(1),
            candidate_cap,
            force_refresh_count: self.force_refresh_count.min(candidate_cap),
            lookback_days: self.lookback_days.clamp(1, MAX_LOOKBACK_DAYS),
            hot_max_hours: hours(self.hot_max_hours),
            warm_max_hours: hours(self.warm_max_hours),
            cool_max_hours: hours(self.cool_max_hours),
            cold_max_hours: hours(self.cold_max_hours),
            hot_stale_minutes: window(self.hot_stale_minutes),
            warm_stale_minutes: window(self.warm_stale_minutes),
            cool_stale_minutes: window(self.cool_stale_minutes),
            cold_stale_minutes: window(self.cold_stale_minutes),
            stale_lock_minutes: self.stale_lock_minutes.clamp(1, MAX_WINDOW_MINUTES),
            cooldown_minutes: self.cooldown_minutes.clamp(0, MAX_WINDOW_MINUTES),
            rate_limit_default_delay_minutes: self
                .rate_limit_default_delay_minutes
                .clamp(1, MAX_WINDOW_MINUTES),
            token_refresh_lead_seconds: self
                .token_refresh_lead_seconds
                .clamp(0, MAX_TOKEN_REFRESH_LEAD_SECONDS),
        }
    }

    /// Force-refresh count clamped to the candidate cap.
    pub fn effective_force_refresh_count(&self) -> usize {
        self.force_refresh_count.min(self.candidate_cap)
    }

    /// Validate scheduler configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value, max) in [
            ("tick interval seconds", self.tick_interval_seconds, MAX_SCHEDULE_SECONDS),
            ("bootstrap delay seconds", self.bootstrap_delay_seconds, MAX_SCHEDULE_SECONDS),
        ] {
            if value > max {
                return Err(ConfigError::TooLarge {
                    name,
                    value: value.to_string(),
                    max: max.to_string(),
                });
            }
        }

        for (name, value, max) in [
            ("lookback days", self.lookback_days, MAX_LOOKBACK_DAYS),
            ("hot max hours", self.hot_max_hours, MAX_BUCKET_HOURS),
            ("warm max hours", self.warm_max_hours, MAX_BUCKET_HOURS),
            ("cool max hours", self.cool_max_hours, MAX_BUCKET_HOURS),
            ("cold max hours", self.cold_max_hours, MAX_BUCKET_HOURS),
            ("hot stale minutes", self.hot_stale_minutes, MAX_WINDOW_MINUTES),
            ("warm stale minutes", self.warm_stale_minutes, MAX_WINDOW_MINUTES),
            ("cool stale minutes", self.cool_stale_minutes, MAX_WINDOW_MINUTES),
            ("cold stale minutes", self.cold_stale_minutes, MAX_WINDOW_MINUTES),
            ("stale lock minutes", self.stale_lock_minutes, MAX_WINDOW_MINUTES),
            ("cooldown minutes", self.cooldown_minutes, MAX_WINDOW_MINUTES),
            (
                "rate limit default delay minutes",
                self.rate_limit_default_delay_minutes,
                MAX_WINDOW_MINUTES,
            ),
            (
                "token refresh lead seconds",
                self.token_refresh_lead_seconds,
                MAX_TOKEN_REFRESH_LEAD_SECONDS,
            ),
        ] {
            if value > max {
                return Err(ConfigError::TooLarge {
                    name,
                    value: value.to_string(),
                    max: max.to_string(),
                });
            }
        }

        if self.owner_batch_size == 0 {
            return Err(ConfigError::InvalidOwnerBatchSize {
                value: self.owner_batch_size,
            });
        }

        if self.candidate_cap == 0 || self.candidate_cap > MAX_CANDIDATE_CAP {
            return Err(ConfigError::InvalidCandidateCap {
                value: self.candidate_cap,
                max: MAX_CANDIDATE_CAP,
            });
        }

        if self.force_refresh_count > self.candidate_cap {
            return Err(ConfigError::ForceRefreshExceedsCap {
                force: self.force_refresh_count,
                cap: self.candidate_cap,
            });
        }

        if self.lookback_days < 1 {
            return Err(ConfigError::InvalidLookbackDays {
                value: self.lookback_days,
            });
        }

        let boundaries = [
            self.hot_max_hours,
            self.warm_max_hours,
            self.cool_max_hours,
            self.cold_max_hours,
        ];
        if boundaries[0] <= 0 || boundaries.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ConfigError::InvalidBucketBoundaries {
                hot: self.hot_max_hours,
                warm: self.warm_max_hours,
                cool: self.cool_max_hours,
                cold: self.cold_max_hours,
            });
        }

        // Older buckets must never be refreshed more eagerly than younger ones.
        let stale_minutes = [
            self.hot_stale_minutes,
            self.warm_stale_minutes,
            self.cool_stale_minutes,
            self.cold_stale_minutes,
        ];
        if stale_minutes[0] <= 0 || stale_minutes.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(ConfigError::InvalidStaleMinutes {
                hot: self.hot_stale_minutes,
                warm: self.warm_stale_minutes,
                cool: self.cool_stale_minutes,
                cold: self.cold_stale_minutes,
            });
        }

        if self.stale_lock_minutes < 1 {
            return Err(ConfigError::InvalidStaleLockMinutes {
                value: self.stale_lock_minutes,
            });
        }

        if self.cooldown_minutes < 0 {
            return Err(ConfigError::InvalidCooldownMinutes {
                value: self.cooldown_minutes,
            });
        }

        if self.rate_limit_default_delay_minutes < 1 {
            return Err(ConfigError::InvalidRateLimitDelay {
                value: self.rate_limit_default_delay_minutes,
            });
        }

        if self.token_refresh_lead_seconds < 0 {
            return Err(ConfigError::InvalidTokenRefreshLead {
                value: self.token_refresh_lead_seconds,
            });
        }

        Ok(())
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.x_client_secret.is_some() {
            config.x_client_secret = Some("[REDACTED]".to_string());
        }
        if let Some((scheme, rest)) = config.database_url.split_once("://")
            && let Some((_, host)) = rest.rsplit_once('@')
        {
            config.database_url = format!("{scheme}://[REDACTED]@{host}");
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        for (name, value) in [("X_API_BASE", &self.x_api_base), ("X_TOKEN_URL", &self.x_token_url)] {
            url::Url::parse(value).map_err(|source| ConfigError::InvalidUrl {
                name,
                value: value.clone(),
                source,
            })?;
        }

        if self.lookup_timeout_ms == 0 {
            return Err(ConfigError::InvalidLookupTimeout {
                value: self.lookup_timeout_ms,
            });
        }

        self.scheduler.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "postgresql://localhost:5432/metrics_refresher".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_x_api_base() -> String {
    "https://api.x.com".to_string()
}

fn default_x_token_url() -> String {
    "https://api.x.com/2/oauth2/token".to_string()
}

fn default_lookup_timeout_ms() -> u64 {
    15_000
}

fn default_refresh_enabled() -> bool {
    true
}

fn default_refresh_tick_interval_seconds() -> u64 {
    300 // 5 minutes
}

fn default_refresh_bootstrap_delay_seconds() -> u64 {
    30
}

fn default_refresh_owner_batch_size() -> usize {
    25
}

fn default_refresh_candidate_cap() -> usize {
    100 // one lookup request
}

fn default_refresh_force_refresh_count() -> usize {
    5
}

fn default_refresh_lookback_days() -> i64 {
    30
}

fn default_refresh_hot_max_hours() -> i64 {
    6
}

fn default_refresh_warm_max_hours() -> i64 {
    24
}

fn default_refresh_cool_max_hours() -> i64 {
    72
}

fn default_refresh_cold_max_hours() -> i64 {
    720 // 30 days
}

fn default_refresh_hot_stale_minutes() -> i64 {
    15
}

fn default_refresh_warm_stale_minutes() -> i64 {
    60
}

fn default_refresh_cool_stale_minutes() -> i64 {
    360
}

fn default_refresh_cold_stale_minutes() -> i64 {
    1440
}

fn default_refresh_stale_lock_minutes() -> i64 {
    30
}

fn default_refresh_cooldown_minutes() -> i64 {
    5
}

fn default_refresh_rate_limit_default_delay_minutes() -> i64 {
    15 // one API window
}

fn default_refresh_token_refresh_lead_seconds() -> i64 {
    300
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("database url is missing; set METRICS_DATABASE_URL")]
    MissingDatabaseUrl,
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("invalid {name} '{value}': {source}")]
    InvalidUrl {
        name: &'static str,
        value: String,
        source: url::ParseError,
    },
    #[error("lookup timeout must be positive, got {value}")]
    InvalidLookupTimeout { value: u64 },
    #[error("refresh owner batch size must be at least 1, got {value}")]
    InvalidOwnerBatchSize { value: usize },
    #[error("refresh candidate cap must be between 1 and {max}, got {value}")]
    InvalidCandidateCap { value: usize, max: usize },
    #[error("force refresh count ({force}) cannot exceed candidate cap ({cap})")]
    ForceRefreshExceedsCap { force: usize, cap: usize },
    #[error("refresh lookback must be at least 1 day, got {value}")]
    InvalidLookbackDays { value: i64 },
    #[error(
        "freshness bucket boundaries must be positive and strictly increasing, got {hot}/{warm}/{cool}/{cold} hours"
    )]
    InvalidBucketBoundaries {
        hot: i64,
        warm: i64,
        cool: i64,
        cold: i64,
    },
    #[error(
        "freshness staleness minutes must be positive and non-decreasing, got {hot}/{warm}/{cool}/{cold}"
    )]
    InvalidStaleMinutes {
        hot: i64,
        warm: i64,
        cool: i64,
        cold: i64,
    },
    #[error("stale lock threshold must be at least 1 minute, got {value}")]
    InvalidStaleLockMinutes { value: i64 },
    #[error("refresh cooldown cannot be negative, got {value}")]
    InvalidCooldownMinutes { value: i64 },
    #[error("rate limit default delay must be at least 1 minute, got {value}")]
    InvalidRateLimitDelay { value: i64 },
    #[error("token refresh lead time cannot be negative, got {value}")]
    InvalidTokenRefreshLead { value: i64 },
    #[error("{name} must be at most {max}, got {value}")]
    TooLarge {
        name: &'static str,
        value: String,
        max: String,
    },
}

/// Loads configuration using layered `.env` files and `METRICS_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("METRICS_") {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let api_bind_addr =
            take_string(&mut layered, "API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let log_format = take_string(&mut layered, "LOG_FORMAT").unwrap_or_else(default_log_format);
        let database_url =
            take_string(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = take_parsed(&mut layered, "DB_MAX_CONNECTIONS")
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")
            .unwrap_or_else(default_db_acquire_timeout_ms);

        let x_api_base = take_string(&mut layered, "X_API_BASE").unwrap_or_else(default_x_api_base);
        let x_token_url =
            take_string(&mut layered, "X_TOKEN_URL").unwrap_or_else(default_x_token_url);
        let x_client_id = take_string(&mut layered, "X_CLIENT_ID");
        let x_client_secret = take_string(&mut layered, "X_CLIENT_SECRET");
        let lookup_timeout_ms = take_parsed(&mut layered, "LOOKUP_TIMEOUT_MS")
            .unwrap_or_else(default_lookup_timeout_ms);

        let scheduler = SchedulerConfig {
            enabled: take_parsed(&mut layered, "REFRESH_ENABLED")
                .unwrap_or_else(default_refresh_enabled),
            tick_interval_seconds: take_parsed(&mut layered, "REFRESH_TICK_INTERVAL_SECONDS")
                .unwrap_or_else(default_refresh_tick_interval_seconds),
            bootstrap_delay_seconds: take_parsed(&mut layered, "REFRESH_BOOTSTRAP_DELAY_SECONDS")
                .unwrap_or_else(default_refresh_bootstrap_delay_seconds),
            owner_batch_size: take_parsed(&mut layered, "REFRESH_OWNER_BATCH_SIZE")
                .unwrap_or_else(default_refresh_owner_batch_size),
            candidate_cap: take_parsed(&mut layered, "REFRESH_CANDIDATE_CAP")
                .unwrap_or_else(default_refresh_candidate_cap),
            force_refresh_count: take_parsed(&mut layered, "REFRESH_FORCE_REFRESH_COUNT")
                .unwrap_or_else(default_refresh_force_refresh_count),
            lookback_days: take_parsed(&mut layered, "REFRESH_LOOKBACK_DAYS")
                .unwrap_or_else(default_refresh_lookback_days),
            hot_max_hours: take_parsed(&mut layered, "REFRESH_HOT_MAX_HOURS")
                .unwrap_or_else(default_refresh_hot_max_hours),
            warm_max_hours: take_parsed(&mut layered, "REFRESH_WARM_MAX_HOURS")
                .unwrap_or_else(default_refresh_warm_max_hours),
            cool_max_hours: take_parsed(&mut layered, "REFRESH_COOL_MAX_HOURS")
                .unwrap_or_else(default_refresh_cool_max_hours),
            cold_max_hours: take_parsed(&mut layered, "REFRESH_COLD_MAX_HOURS")
                .unwrap_or_else(default_refresh_cold_max_hours),
            hot_stale_minutes: take_parsed(&mut layered, "REFRESH_HOT_STALE_MINUTES")
                .unwrap_or_else(default_refresh_hot_stale_minutes),
            warm_stale_minutes: take_parsed(&mut layered, "REFRESH_WARM_STALE_MINUTES")
                .unwrap_or_else(default_refresh_warm_stale_minutes),
            cool_stale_minutes: take_parsed(&mut layered, "REFRESH_COOL_STALE_MINUTES")
                .unwrap_or_else(default_refresh_cool_stale_minutes),
            cold_stale_minutes: take_parsed(&mut layered, "REFRESH_COLD_STALE_MINUTES")
                .unwrap_or_else(default_refresh_cold_stale_minutes),
            stale_lock_minutes: take_parsed(&mut layered, "REFRESH_STALE_LOCK_MINUTES")
                .unwrap_or_else(default_refresh_stale_lock_minutes),
            cooldown_minutes: take_parsed(&mut layered, "REFRESH_COOLDOWN_MINUTES")
                .unwrap_or_else(default_refresh_cooldown_minutes),
            rate_limit_default_delay_minutes: take_parsed(
                &mut layered,
                "REFRESH_RATE_LIMIT_DEFAULT_DELAY_MINUTES",
            )
            .unwrap_or_else(default_refresh_rate_limit_default_delay_minutes),
            token_refresh_lead_seconds: take_parsed(
                &mut layered,
                "REFRESH_TOKEN_REFRESH_LEAD_SECONDS",
            )
            .unwrap_or_else(default_refresh_token_refresh_lead_seconds),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            x_api_base,
            x_token_url,
            x_client_id,
            x_client_secret,
            lookup_timeout_ms,
            scheduler,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("METRICS_PROFILE")
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix("METRICS_") {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered
        .remove(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Unparseable values fall back to the caller's default.
fn take_parsed<T: FromStr>(layered: &mut BTreeMap<String, String>, key: &str) -> Option<T> {
    take_string(layered, key).and_then(|value| value.parse().ok())
}
