//! # Metrics Refresh Scheduler
//!
//! Background task that keeps engagement metrics of tracked posts fresh.
//! Each tick picks the owners that are due, then runs Lock → Select →
//! Fetch → Apply per owner, sequentially. Cross-process exclusion per owner
//! comes from the durable lock rows; inside one process a tick that fires
//! while the previous one is still running is dropped.
//!
//! A rate-limited lookup ends the whole tick: the quota is shared by every
//! owner, so later owners would only be throttled too.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge, histogram};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Duration as TokioDuration, Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::applier::ResultApplier;
use crate::config::SchedulerConfig;
use crate::error::RefreshError;
use crate::freshness::FreshnessPolicy;
use crate::lookup::{BatchLookup, LookupClient, LookupError};
use crate::models::account_credential::Model as AccountCredential;
use crate::repositories::post::EligibilityScope;
use crate::repositories::sync_lock::LockSettings;
use crate::repositories::{CredentialRepository, PostRepository, SyncLockRepository, SyncOutcome};
use crate::selector::{CandidateSelector, SelectionLimits};
use crate::telemetry::{TraceContext, with_trace_context};
use crate::token_refresh::{CredentialProvider, TokenRefresher};

/// Source of wall-clock time for scheduling decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Whether a tick is currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TickState {
    #[default]
    Idle,
    Running,
}

/// Record of one completed tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TickSummary {
    pub tick_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Owners selected as due this tick
    pub owners_scanned: u64,
    /// Owners whose lock was acquired and whose run was recorded
    pub owners_synced: u64,
    /// Owners skipped because another worker holds their lock
    pub owners_skipped: u64,
    pub posts_updated: u64,
    pub posts_deleted: u64,
    pub errors: u64,
    pub rate_limited: bool,
    /// Set when the tick aborted before processing owners
    pub error: Option<String>,
}

impl TickSummary {
    fn new(tick_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            tick_id,
            started_at,
            finished_at: None,
            owners_scanned: 0,
            owners_synced: 0,
            owners_skipped: 0,
            posts_updated: 0,
            posts_deleted: 0,
            errors: 0,
            rate_limited: false,
            error: None,
        }
    }
}

/// Mutable scheduler state shared between the loop, ticks and status readers.
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    pub tick_state: TickState,
    pub last_tick_summary: Option<TickSummary>,
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    /// Whether the background loop is enabled in configuration
    pub enabled: bool,
    /// Whether the background loop is currently started
    pub running: bool,
    /// Whether a tick is executing right now
    pub in_flight: bool,
    pub interval_ms: u64,
    pub policy: FreshnessPolicy,
    pub last_tick_summary: Option<TickSummary>,
}

/// Outcome of one owner run, before it is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OwnerRun {
    outcome: SyncOutcome,
    next_allowed_hint: Option<DateTime<Utc>>,
}

impl OwnerRun {
    fn finished(outcome: SyncOutcome) -> Self {
        Self {
            outcome,
            next_allowed_hint: None,
        }
    }

    fn rate_limited(resume_at: DateTime<Utc>) -> Self {
        Self {
            outcome: SyncOutcome::RateLimited,
            next_allowed_hint: Some(resume_at),
        }
    }
}

struct LoopHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    config: SchedulerConfig,
    policy: FreshnessPolicy,
    clock: Arc<dyn Clock>,
    credentials: CredentialRepository,
    credential_provider: CredentialProvider,
    posts: PostRepository,
    locks: SyncLockRepository,
    selector: CandidateSelector,
    applier: ResultApplier,
    lookup: Arc<dyn LookupClient>,
    state: Mutex<SchedulerState>,
    loop_handle: Mutex<Option<LoopHandle>>,
}

/// Background metrics refresh scheduler.
#[derive(Clone)]
pub struct MetricsScheduler {
    inner: Arc<Inner>,
}

/// Resets the tick state to idle even if the tick panics.
struct InFlightGuard<'a> {
    state: &'a Mutex<SchedulerState>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock_state(self.state).tick_state = TickState::Idle;
        gauge!("metrics_refresh_tick_in_flight").set(0.0);
    }
}

fn lock_state(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MetricsScheduler {
    /// Create a scheduler over `db`.
    ///
    /// `config` is clamped with [`SchedulerConfig::bounded`] first.
    ///
    /// `refresher` is optional; without it, expired tokens cannot be rotated
    /// and their owners end with `auth_error`.
    pub fn new(
        db: DatabaseConnection,
        config: SchedulerConfig,
        lookup: Arc<dyn LookupClient>,
        refresher: Option<Arc<dyn TokenRefresher>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let config = config.bounded();
        let policy = FreshnessPolicy::from_config(&config);
        let credentials = CredentialRepository::new(db.clone());
        let posts = PostRepository::new(db.clone());
        let locks = SyncLockRepository::new(
            db,
            LockSettings {
                stale_after: Duration::minutes(config.stale_lock_minutes),
                cooldown: Duration::minutes(config.cooldown_minutes),
            },
        );
        let credential_provider = CredentialProvider::new(
            credentials.clone(),
            refresher,
            Duration::seconds(config.token_refresh_lead_seconds),
        );
        let selector = CandidateSelector::new(
            posts.clone(),
            policy.clone(),
            SelectionLimits::new(config.candidate_cap, config.effective_force_refresh_count()),
        );
        let applier = ResultApplier::new(posts.clone());

        Self {
            inner: Arc::new(Inner {
                config,
                policy,
                clock,
                credentials,
                credential_provider,
                posts,
                locks,
                selector,
                applier,
                lookup,
                state: Mutex::new(SchedulerState::default()),
                loop_handle: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Start the background loop. Returns `false` if disabled or already started.
    pub fn start(&self) -> bool {
        if !self.inner.config.enabled {
            info!("Metrics refresh scheduler disabled by configuration");
            return false;
        }

        let mut handle = self
            .inner
            .loop_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if handle.is_some() {
            return false;
        }

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.clone().run(shutdown.clone()));
        *handle = Some(LoopHandle { shutdown, task });
        true
    }

    /// Stop the background loop and wait for it to exit.
    ///
    /// A tick that is already executing runs to completion on its own task;
    /// lock rows are never touched here.
    pub async fn stop(&self) {
        let handle = self
            .inner
            .loop_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(LoopHandle { shutdown, task }) = handle {
            shutdown.cancel();
            if let Err(err) = task.await {
                error!(error = %err, "Metrics refresh loop ended abnormally");
            }
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let running = self
            .inner
            .loop_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.shutdown.is_cancelled());
        let state = lock_state(&self.inner.state).clone();

        SchedulerStatus {
            enabled: self.inner.config.enabled,
            running,
            in_flight: state.tick_state == TickState::Running,
            interval_ms: self
                .inner
                .config
                .effective_tick_interval_seconds()
                .saturating_mul(1_000),
            policy: self.inner.policy.clone(),
            last_tick_summary: state.last_tick_summary,
        }
    }

    /// Run the loop until `shutdown` fires: bootstrap delay, then a fixed interval.
    #[instrument(skip_all)]
    async fn run(self, shutdown: CancellationToken) {
        let bootstrap = TokioDuration::from_secs(self.inner.config.bootstrap_delay_seconds);
        let period = TokioDuration::from_secs(self.inner.config.effective_tick_interval_seconds());
        info!(
            bootstrap_delay_secs = bootstrap.as_secs(),
            interval_secs = period.as_secs(),
            "Starting metrics refresh scheduler"
        );

        let mut ticker = interval_at(Instant::now() + bootstrap, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Metrics refresh scheduler shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    // Ticks run on their own task so a slow tick never delays the timer;
                    // the in-flight guard drops overlapping ones.
                    let scheduler = self.clone();
                    tokio::spawn(async move {
                        scheduler.run_tick().await;
                    });
                }
            }
        }

        info!("Metrics refresh scheduler stopped");
    }

    /// Execute one tick. Returns `None` if another tick is still running.
    pub async fn run_tick(&self) -> Option<TickSummary> {
        {
            let mut state = lock_state(&self.inner.state);
            if state.tick_state == TickState::Running {
                counter!("metrics_refresh_ticks_dropped_total").increment(1);
                debug!("Previous metrics refresh tick still running; dropping this one");
                return None;
            }
            state.tick_state = TickState::Running;
        }
        gauge!("metrics_refresh_tick_in_flight").set(1.0);
        let _guard = InFlightGuard {
            state: &self.inner.state,
        };

        let tick_id = Uuid::new_v4();
        let tick_started = Instant::now();
        let summary =
            with_trace_context(TraceContext::for_tick(tick_id), self.execute_tick(tick_id)).await;

        histogram!("metrics_refresh_tick_duration_ms")
            .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
        counter!("metrics_refresh_ticks_total").increment(1);

        lock_state(&self.inner.state).last_tick_summary = Some(summary.clone());
        Some(summary)
    }

    #[instrument(skip(self), fields(tick_id = %tick_id))]
    async fn execute_tick(&self, tick_id: Uuid) -> TickSummary {
        let mut summary = TickSummary::new(tick_id, self.inner.clock.now());

        match self.select_owners(summary.started_at).await {
            Ok(owners) => {
                summary.owners_scanned = owners.len() as u64;
                for credential in owners {
                    let outcome = self.process_owner(credential, &mut summary).await;
                    if outcome == Some(SyncOutcome::RateLimited) {
                        summary.rate_limited = true;
                        counter!("metrics_refresh_rate_limit_aborts_total").increment(1);
                        warn!("Rate limited; aborting remaining owners this tick");
                        break;
                    }
                }
            }
            Err(err) => {
                error!(error = %err, "Failed to select owners for metrics refresh");
                summary.error = Some(err.to_string());
            }
        }

        summary.finished_at = Some(self.inner.clock.now());
        gauge!("metrics_refresh_last_tick_owners_synced").set(summary.owners_synced as f64);

        info!(
            owners_scanned = summary.owners_scanned,
            owners_synced = summary.owners_synced,
            owners_skipped = summary.owners_skipped,
            posts_updated = summary.posts_updated,
            posts_deleted = summary.posts_deleted,
            errors = summary.errors,
            rate_limited = summary.rate_limited,
            "Metrics refresh tick completed"
        );

        summary
    }

    /// Owners due for a refresh, longest-since-last-sync first.
    async fn select_owners(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AccountCredential>, RefreshError> {
        let linked = self.inner.credentials.list_linked().await?;
        let owner_ids: Vec<Uuid> = linked.iter().map(|cred| cred.owner_id).collect();
        let locks = self.inner.locks.find_many(&owner_ids).await?;

        let mut due: Vec<(AccountCredential, Option<DateTime<Utc>>)> = linked
            .into_iter()
            .filter_map(|credential| {
                let lock = locks.get(&credential.owner_id);
                if let Some(lock) = lock {
                    if self.inner.locks.is_held(lock, now) {
                        return None;
                    }
                    if let Some(next_allowed) = lock.next_allowed_at
                        && next_allowed.with_timezone(&Utc) > now
                    {
                        return None;
                    }
                }
                let last_sync = lock
                    .and_then(|lock| lock.last_sync_at)
                    .map(|at| at.with_timezone(&Utc));
                Some((credential, last_sync))
            })
            .collect();
        // Never-synced owners (`None`) sort first.
        due.sort_by_key(|(_, last_sync)| *last_sync);

        let mut owners = Vec::new();
        for (credential, _) in due {
            if owners.len() >= self.inner.config.owner_batch_size {
                break;
            }
            let Some(author) = credential.remote_account_id.clone() else {
                continue;
            };
            let scope = EligibilityScope::new(
                credential.owner_id,
                author,
                self.inner.config.lookback_days,
                now,
            );
            if self.inner.posts.has_eligible(&scope).await? {
                owners.push(credential);
            }
        }

        Ok(owners)
    }

    /// Run one owner end to end. Returns the recorded outcome, or `None` if skipped.
    #[instrument(skip_all, fields(owner_id = %credential.owner_id))]
    async fn process_owner(
        &self,
        credential: AccountCredential,
        summary: &mut TickSummary,
    ) -> Option<SyncOutcome> {
        let owner_id = credential.owner_id;

        match self.inner.locks.acquire(owner_id, self.inner.clock.now()).await {
            Ok(true) => {}
            Ok(false) => {
                summary.owners_skipped += 1;
                counter!("metrics_refresh_lock_contention_total").increment(1);
                debug!("Sync lock held elsewhere; skipping owner");
                return None;
            }
            Err(err) => {
                summary.errors += 1;
                error!(error = %err, "Failed to acquire sync lock");
                return None;
            }
        }

        let run = match self.refresh_owner(credential, summary).await {
            Ok(run) => run,
            Err(err) => {
                summary.errors += 1;
                error!(error = %err, "Metrics refresh failed for owner");
                OwnerRun::finished(SyncOutcome::Error)
            }
        };

        let now = self.inner.clock.now();
        if let Err(err) = self
            .inner
            .locks
            .record_completion(owner_id, run.next_allowed_hint, run.outcome, now)
            .await
        {
            summary.errors += 1;
            error!(error = %err, "Failed to record sync completion; releasing lock");
            if let Err(err) = self.inner.locks.release(owner_id, now).await {
                error!(error = %err, "Failed to release sync lock");
            }
        }

        summary.owners_synced += 1;
        counter!("metrics_refresh_owner_runs_total", "outcome" => run.outcome.as_str())
            .increment(1);
        Some(run.outcome)
    }

    async fn refresh_owner(
        &self,
        credential: AccountCredential,
        summary: &mut TickSummary,
    ) -> Result<OwnerRun, RefreshError> {
        let now = self.inner.clock.now();
        let owner_id = credential.owner_id;

        let credential = match self
            .inner
            .credential_provider
            .ensure_fresh(credential, now)
            .await
        {
            Ok(credential) => credential,
            Err(RefreshError::Auth(err)) => {
                warn!(error = %err, "Credential unusable; skipping lookup");
                return Ok(OwnerRun::finished(SyncOutcome::AuthError));
            }
            Err(err) => return Err(err),
        };

        let Some(author) = credential.remote_account_id.clone() else {
            return Ok(OwnerRun::finished(SyncOutcome::AuthError));
        };
        let scope = EligibilityScope::new(owner_id, author, self.inner.config.lookback_days, now);

        let candidates = self.inner.selector.select(&scope, now).await?;
        if candidates.is_empty() {
            debug!("No posts need a refresh");
            return Ok(OwnerRun::finished(SyncOutcome::Noop));
        }

        let mut seen = HashSet::with_capacity(candidates.len());
        let remote_ids: Vec<String> = candidates
            .iter()
            .filter(|candidate| seen.insert(candidate.remote_id.as_str()))
            .map(|candidate| candidate.remote_id.clone())
            .collect();

        let batch = match self
            .inner
            .lookup
            .fetch_batch(&credential, &remote_ids, now)
            .await
        {
            Ok(batch) => batch,
            Err(LookupError::Unauthorized(detail)) => {
                warn!(detail = %detail, "Lookup rejected credential");
                return Ok(OwnerRun::finished(SyncOutcome::AuthError));
            }
            Err(err) => return Err(err.into()),
        };

        let throttled = batch.rate_limit();
        let outcomes = match batch {
            BatchLookup::RateLimited { resume_at } => {
                return Ok(OwnerRun::rate_limited(self.resume_time(resume_at, now)));
            }
            BatchLookup::Completed(outcomes) => outcomes,
        };

        let applied = self
            .inner
            .applier
            .apply(&candidates, &outcomes, self.inner.clock.now())
            .await;
        summary.posts_updated += applied.updated_count;
        summary.posts_deleted += applied.deleted_count;
        summary.errors += applied.error_count;

        debug!(
            candidates = candidates.len(),
            updated = applied.updated_count,
            deleted = applied.deleted_count,
            errors = applied.error_count,
            "Applied lookup results"
        );

        if let Some(resume_at) = throttled {
            return Ok(OwnerRun::rate_limited(self.resume_time(resume_at, now)));
        }

        Ok(OwnerRun::finished(if applied.error_count == 0 {
            SyncOutcome::Completed
        } else {
            SyncOutcome::CompletedWithErrors
        }))
    }

    /// Provider hint if present, otherwise the configured default delay.
    fn resume_time(&self, hint: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
        hint.unwrap_or_else(|| {
            now + Duration::minutes(self.inner.config.rate_limit_default_delay_minutes)
        })
    }
}
