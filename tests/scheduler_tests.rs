//! End-to-end scheduler ticks against an in-memory database.

mod test_utils;

use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics_refresher::config::SchedulerConfig;
use metrics_refresher::lookup::PostMetrics;
use metrics_refresher::models::tracked_post::STATUS_DELETED;
use metrics_refresher::repositories::sync_lock::LockSettings;
use metrics_refresher::repositories::{
    CredentialRepository, PostRepository, SyncLockRepository, SyncOutcome,
};
use metrics_refresher::scheduler::ManualClock;
use metrics_refresher::token_refresh::{TokenRefresher, XTokenRefresher};
use sea_orm::ConnectionTrait;
use test_utils::*;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const AUTHOR: &str = "4242";

fn likes(count: i64) -> PostMetrics {
    PostMetrics {
        likes: count,
        ..Default::default()
    }
}

fn no_force() -> SchedulerConfig {
    SchedulerConfig {
        force_refresh_count: 0,
        ..Default::default()
    }
}

#[tokio::test]
async fn rate_limit_aborts_remaining_owners() {
    let db = setup_test_db().await.unwrap();
    let now = fixed_now();
    let clock = ManualClock::new(now);
    let lookup = ScriptedLookup::new();

    let owners = [Uuid::from_u128(1), Uuid::from_u128(2), Uuid::from_u128(3)];
    let mut posts = Vec::new();
    for owner in owners {
        insert_credential(&db, owner, Some(AUTHOR), None, None)
            .await
            .unwrap();
        let post = insert_post(&db, PostFixture::new(owner, AUTHOR, now - Duration::hours(1)))
            .await
            .unwrap();
        posts.push(post);
    }

    let resume_at = now + Duration::minutes(42);
    lookup.script(owners[0], Scripted::Metrics(likes(5)));
    lookup.script(owners[1], Scripted::RateLimited(Some(resume_at)));
    lookup.script(owners[2], Scripted::Metrics(likes(9)));

    let scheduler = build_scheduler(&db, SchedulerConfig::default(), lookup.clone(), None, &clock);
    let summary = scheduler.run_tick().await.expect("tick runs");

    assert!(summary.rate_limited);
    assert_eq!(summary.owners_scanned, 3);
    assert_eq!(summary.owners_synced, 2);
    assert_eq!(summary.posts_updated, 1);

    let first = load_lock(&db, owners[0]).await.unwrap().unwrap();
    assert_eq!(first.last_result.as_deref(), Some("completed"));
    assert_eq!(load_post(&db, posts[0].id).await.unwrap().likes, 5);

    let second = load_lock(&db, owners[1]).await.unwrap().unwrap();
    assert_eq!(second.last_result.as_deref(), Some("rate_limited"));
    assert!(!second.in_progress);
    assert_eq!(
        second.next_allowed_at.map(|at| at.with_timezone(&Utc)),
        Some(resume_at)
    );

    assert_eq!(lookup.calls_for(owners[2]), 0);
    assert!(load_lock(&db, owners[2]).await.unwrap().is_none());
    assert_eq!(load_post(&db, posts[2].id).await.unwrap().likes, 0);
}

#[tokio::test]
async fn rate_limit_without_hint_uses_default_delay() {
    let db = setup_test_db().await.unwrap();
    let now = fixed_now();
    let clock = ManualClock::new(now);
    let lookup = ScriptedLookup::new();
    let owner = Uuid::new_v4();

    insert_credential(&db, owner, Some(AUTHOR), None, None)
        .await
        .unwrap();
    insert_post(&db, PostFixture::new(owner, AUTHOR, now - Duration::hours(2)))
        .await
        .unwrap();
    lookup.script(owner, Scripted::RateLimited(None));

    let scheduler = build_scheduler(&db, SchedulerConfig::default(), lookup, None, &clock);
    scheduler.run_tick().await.unwrap();

    let lock = load_lock(&db, owner).await.unwrap().unwrap();
    assert_eq!(
        lock.next_allowed_at.map(|at| at.with_timezone(&Utc)),
        Some(now + Duration::minutes(15))
    );
}

#[tokio::test]
async fn hot_post_is_refreshed_then_held_back_until_stale() {
    let db = setup_test_db().await.unwrap();
    let now = fixed_now();
    let clock = ManualClock::new(now);
    let lookup = ScriptedLookup::new();
    let owner = Uuid::new_v4();

    insert_credential(&db, owner, Some(AUTHOR), None, None)
        .await
        .unwrap();
    let post = insert_post(&db, PostFixture::new(owner, AUTHOR, now - Duration::hours(1)))
        .await
        .unwrap();
    lookup.script(owner, Scripted::Metrics(likes(5)));

    let scheduler = build_scheduler(&db, no_force(), lookup.clone(), None, &clock);

    let first = scheduler.run_tick().await.unwrap();
    assert_eq!(first.posts_updated, 1);
    let stored = load_post(&db, post.id).await.unwrap();
    assert_eq!(stored.likes, 5);
    assert_eq!(
        stored.metrics_updated_at.map(|at| at.with_timezone(&Utc)),
        Some(now)
    );

    // Past the cooldown but inside the hot staleness window.
    clock.advance(Duration::minutes(10));
    let second = scheduler.run_tick().await.unwrap();
    assert_eq!(second.posts_updated, 0);
    assert_eq!(lookup.calls_for(owner), 1);
    let lock = load_lock(&db, owner).await.unwrap().unwrap();
    assert_eq!(lock.last_result.as_deref(), Some("noop"));

    clock.advance(Duration::minutes(6));
    let third = scheduler.run_tick().await.unwrap();
    assert_eq!(third.posts_updated, 1);
    assert_eq!(lookup.calls_for(owner), 2);
    assert_eq!(lookup.calls()[1].1, vec![post.remote_id.clone().unwrap()]);
}

#[tokio::test]
async fn owner_without_stale_posts_records_noop() {
    let db = setup_test_db().await.unwrap();
    let now = fixed_now();
    let clock = ManualClock::new(now);
    let lookup = ScriptedLookup::new();
    let owner = Uuid::new_v4();

    insert_credential(&db, owner, Some(AUTHOR), None, None)
        .await
        .unwrap();
    insert_post(
        &db,
        PostFixture::new(owner, AUTHOR, now - Duration::hours(3))
            .updated_at(now - Duration::minutes(2)),
    )
    .await
    .unwrap();

    let scheduler = build_scheduler(&db, no_force(), lookup.clone(), None, &clock);
    let summary = scheduler.run_tick().await.unwrap();

    assert_eq!(summary.owners_synced, 1);
    assert_eq!(lookup.calls_for(owner), 0);
    let lock = load_lock(&db, owner).await.unwrap().unwrap();
    assert!(!lock.in_progress);
    assert_eq!(lock.last_result.as_deref(), Some("noop"));
    assert_eq!(
        lock.next_allowed_at.map(|at| at.with_timezone(&Utc)),
        Some(now + Duration::minutes(5))
    );
}

#[tokio::test]
async fn expired_credential_without_refresh_token_is_auth_error() {
    let db = setup_test_db().await.unwrap();
    let now = fixed_now();
    let clock = ManualClock::new(now);
    let lookup = ScriptedLookup::new();
    let owner = Uuid::new_v4();

    insert_credential(&db, owner, Some(AUTHOR), Some(now - Duration::hours(1)), None)
        .await
        .unwrap();
    insert_post(&db, PostFixture::new(owner, AUTHOR, now - Duration::hours(1)))
        .await
        .unwrap();

    let scheduler = build_scheduler(&db, SchedulerConfig::default(), lookup.clone(), None, &clock);
    scheduler.run_tick().await.unwrap();

    assert!(lookup.calls().is_empty());
    let lock = load_lock(&db, owner).await.unwrap().unwrap();
    assert_eq!(lock.last_result.as_deref(), Some("auth_error"));
    assert!(!lock.in_progress);
    assert_eq!(
        lock.next_allowed_at.map(|at| at.with_timezone(&Utc)),
        Some(now + Duration::minutes(5))
    );
}

#[tokio::test]
async fn near_expiry_token_is_rotated_before_lookup() {
    let db = setup_test_db().await.unwrap();
    let now = fixed_now();
    let clock = ManualClock::new(now);
    let lookup = ScriptedLookup::new();
    let owner = Uuid::new_v4();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/2/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "token_type": "bearer",
            "expires_in": 7200,
            "access_token": "rotated-access",
            "refresh_token": "rotated-refresh"
        })))
        .expect(1)
        .mount(&server)
        .await;
    let refresher: Arc<dyn TokenRefresher> = Arc::new(
        XTokenRefresher::new(
            format!("{}/2/oauth2/token", server.uri()),
            "client",
            None,
            std::time::Duration::from_secs(5),
        )
        .unwrap(),
    );

    insert_credential(
        &db,
        owner,
        Some(AUTHOR),
        Some(now + Duration::minutes(1)),
        Some("old-refresh"),
    )
    .await
    .unwrap();
    insert_post(&db, PostFixture::new(owner, AUTHOR, now - Duration::hours(1)))
        .await
        .unwrap();

    let scheduler = build_scheduler(
        &db,
        SchedulerConfig::default(),
        lookup.clone(),
        Some(refresher),
        &clock,
    );
    scheduler.run_tick().await.unwrap();

    let credential = CredentialRepository::new(db.clone())
        .find(owner)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(credential.access_token, "rotated-access");
    assert_eq!(credential.refresh_token.as_deref(), Some("rotated-refresh"));
    assert_eq!(
        credential.expires_at.map(|at| at.with_timezone(&Utc)),
        Some(now + Duration::seconds(7200))
    );
    assert_eq!(lookup.calls_for(owner), 1);
    let lock = load_lock(&db, owner).await.unwrap().unwrap();
    assert_eq!(lock.last_result.as_deref(), Some("completed"));
}

#[tokio::test]
async fn rejected_lookup_credential_is_auth_error() {
    let db = setup_test_db().await.unwrap();
    let now = fixed_now();
    let clock = ManualClock::new(now);
    let lookup = ScriptedLookup::new();
    let owner = Uuid::new_v4();

    insert_credential(&db, owner, Some(AUTHOR), None, None)
        .await
        .unwrap();
    insert_post(&db, PostFixture::new(owner, AUTHOR, now - Duration::hours(1)))
        .await
        .unwrap();
    lookup.script(owner, Scripted::Unauthorized);

    let scheduler = build_scheduler(&db, SchedulerConfig::default(), lookup, None, &clock);
    let summary = scheduler.run_tick().await.unwrap();

    assert!(!summary.rate_limited);
    let lock = load_lock(&db, owner).await.unwrap().unwrap();
    assert_eq!(lock.last_result.as_deref(), Some("auth_error"));
}

#[tokio::test]
async fn transient_failure_is_isolated_to_its_owner() {
    let db = setup_test_db().await.unwrap();
    let now = fixed_now();
    let clock = ManualClock::new(now);
    let lookup = ScriptedLookup::new();
    let failing = Uuid::from_u128(10);
    let healthy = Uuid::from_u128(11);

    for owner in [failing, healthy] {
        insert_credential(&db, owner, Some(AUTHOR), None, None)
            .await
            .unwrap();
        insert_post(&db, PostFixture::new(owner, AUTHOR, now - Duration::hours(1)))
            .await
            .unwrap();
    }
    lookup.script(failing, Scripted::Transient);
    lookup.script(healthy, Scripted::Metrics(likes(1)));

    let scheduler = build_scheduler(&db, SchedulerConfig::default(), lookup, None, &clock);
    let summary = scheduler.run_tick().await.unwrap();

    assert_eq!(summary.owners_synced, 2);
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.posts_updated, 1);

    let failed = load_lock(&db, failing).await.unwrap().unwrap();
    assert_eq!(failed.last_result.as_deref(), Some("error"));
    assert!(!failed.in_progress);
    let ok = load_lock(&db, healthy).await.unwrap().unwrap();
    assert_eq!(ok.last_result.as_deref(), Some("completed"));
}

#[tokio::test]
async fn not_found_posts_are_marked_deleted() {
    let db = setup_test_db().await.unwrap();
    let now = fixed_now();
    let clock = ManualClock::new(now);
    let lookup = ScriptedLookup::new();
    let owner = Uuid::new_v4();

    insert_credential(&db, owner, Some(AUTHOR), None, None)
        .await
        .unwrap();
    let post = insert_post(&db, PostFixture::new(owner, AUTHOR, now - Duration::hours(1)))
        .await
        .unwrap();
    PostRepository::new(db.clone())
        .apply_metrics(post.id, &likes(7), now - Duration::hours(1))
        .await
        .unwrap();
    lookup.script(owner, Scripted::NotFound);

    let scheduler = build_scheduler(&db, SchedulerConfig::default(), lookup, None, &clock);
    let summary = scheduler.run_tick().await.unwrap();

    assert_eq!(summary.posts_deleted, 1);
    let stored = load_post(&db, post.id).await.unwrap();
    assert_eq!(stored.status, STATUS_DELETED);
    assert_eq!(stored.likes, 7);
    let lock = load_lock(&db, owner).await.unwrap().unwrap();
    assert_eq!(lock.last_result.as_deref(), Some("completed"));
}

#[tokio::test]
async fn owner_selection_respects_locks_schedule_and_posts() {
    let db = setup_test_db().await.unwrap();
    let now = fixed_now();
    let clock = ManualClock::new(now);
    let lookup = ScriptedLookup::new();
    let locks = SyncLockRepository::new(db.clone(), LockSettings::default());

    let held = Uuid::from_u128(20);
    let cooling = Uuid::from_u128(21);
    let no_posts = Uuid::from_u128(22);
    let unlinked = Uuid::from_u128(23);
    let abandoned = Uuid::from_u128(24);
    let due = Uuid::from_u128(25);

    for owner in [held, cooling, no_posts, abandoned, due] {
        insert_credential(&db, owner, Some(AUTHOR), None, None)
            .await
            .unwrap();
    }
    insert_credential(&db, unlinked, None, None, None).await.unwrap();
    for owner in [held, cooling, unlinked, abandoned, due] {
        insert_post(&db, PostFixture::new(owner, AUTHOR, now - Duration::hours(1)))
            .await
            .unwrap();
    }

    assert!(locks.acquire(held, now - Duration::minutes(5)).await.unwrap());
    assert!(locks.acquire(abandoned, now - Duration::hours(2)).await.unwrap());
    locks
        .record_completion(
            cooling,
            Some(now + Duration::hours(1)),
            SyncOutcome::RateLimited,
            now - Duration::minutes(1),
        )
        .await
        .unwrap();

    let scheduler = build_scheduler(&db, SchedulerConfig::default(), lookup.clone(), None, &clock);
    let summary = scheduler.run_tick().await.unwrap();

    assert_eq!(summary.owners_scanned, 2);
    let processed: Vec<Uuid> = lookup.calls().into_iter().map(|(owner, _)| owner).collect();
    assert_eq!(processed.len(), 2);
    assert!(processed.contains(&abandoned));
    assert!(processed.contains(&due));
    assert!(locks.find(held).await.unwrap().unwrap().in_progress);
}

#[tokio::test]
async fn longest_since_last_sync_goes_first_and_batch_is_capped() {
    let db = setup_test_db().await.unwrap();
    let now = fixed_now();
    let clock = ManualClock::new(now);
    let lookup = ScriptedLookup::new();
    let locks = SyncLockRepository::new(db.clone(), LockSettings::default());

    let recent = Uuid::from_u128(30);
    let older = Uuid::from_u128(31);
    let never = Uuid::from_u128(32);

    for owner in [recent, older, never] {
        insert_credential(&db, owner, Some(AUTHOR), None, None)
            .await
            .unwrap();
        insert_post(&db, PostFixture::new(owner, AUTHOR, now - Duration::hours(1)))
            .await
            .unwrap();
    }
    for (owner, synced_at) in [
        (recent, now - Duration::minutes(30)),
        (older, now - Duration::hours(5)),
    ] {
        locks
            .record_completion(
                owner,
                None,
                SyncOutcome::Completed,
                synced_at,
            )
            .await
            .unwrap();
    }

    let config = SchedulerConfig {
        owner_batch_size: 2,
        ..Default::default()
    };
    let scheduler = build_scheduler(&db, config, lookup.clone(), None, &clock);
    let summary = scheduler.run_tick().await.unwrap();

    assert_eq!(summary.owners_scanned, 2);
    let order: Vec<Uuid> = lookup.calls().into_iter().map(|(owner, _)| owner).collect();
    assert_eq!(order, vec![never, older]);
}

#[tokio::test]
async fn overlapping_manual_ticks_do_not_double_process() {
    let db = setup_test_db().await.unwrap();
    let now = fixed_now();
    let clock = ManualClock::new(now);
    let lookup = ScriptedLookup::new();
    let owner = Uuid::new_v4();

    insert_credential(&db, owner, Some(AUTHOR), None, None)
        .await
        .unwrap();
    insert_post(&db, PostFixture::new(owner, AUTHOR, now - Duration::hours(1)))
        .await
        .unwrap();

    let scheduler = build_scheduler(&db, SchedulerConfig::default(), lookup.clone(), None, &clock);
    let (first, second) = tokio::join!(scheduler.run_tick(), scheduler.run_tick());

    let ran = [first, second].into_iter().flatten().count();
    assert!(ran >= 1);
    assert_eq!(lookup.calls_for(owner), 1);
}

#[tokio::test]
async fn owner_selection_failure_is_recorded_and_next_tick_runs() {
    let db = setup_test_db().await.unwrap();
    let now = fixed_now();
    let clock = ManualClock::new(now);
    let lookup = ScriptedLookup::new();

    db.execute_unprepared("DROP TABLE account_credentials")
        .await
        .unwrap();

    let scheduler = build_scheduler(&db, SchedulerConfig::default(), lookup.clone(), None, &clock);
    let first = scheduler.run_tick().await.expect("tick runs");

    assert!(first.error.is_some());
    assert_eq!(first.owners_scanned, 0);
    assert_eq!(first.owners_synced, 0);
    assert!(first.finished_at.is_some());
    assert!(lookup.calls().is_empty());

    let status = scheduler.status();
    assert!(!status.in_flight);
    assert_eq!(status.last_tick_summary, Some(first.clone()));

    clock.advance(Duration::minutes(5));
    let second = scheduler.run_tick().await.expect("next tick still runs");
    assert_ne!(second.tick_id, first.tick_id);
    assert!(second.error.is_some());
}

#[tokio::test]
async fn oversized_windows_do_not_break_a_tick() {
    let db = setup_test_db().await.unwrap();
    let now = fixed_now();
    let clock = ManualClock::new(now);
    let lookup = ScriptedLookup::new();
    let owner = Uuid::new_v4();

    insert_credential(&db, owner, Some(AUTHOR), None, None)
        .await
        .unwrap();
    insert_post(&db, PostFixture::new(owner, AUTHOR, now - Duration::hours(1)))
        .await
        .unwrap();

    let config = SchedulerConfig {
        lookback_days: 1_000_000_000_000,
        cooldown_minutes: i64::MAX,
        stale_lock_minutes: i64::MAX,
        rate_limit_default_delay_minutes: i64::MAX,
        tick_interval_seconds: u64::MAX,
        bootstrap_delay_seconds: u64::MAX,
        ..Default::default()
    };
    let scheduler = build_scheduler(&db, config, lookup.clone(), None, &clock);

    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run_tick().await }
    });
    let summary = handle.await.expect("tick does not panic").expect("tick runs");

    assert!(summary.error.is_none());
    assert_eq!(summary.owners_synced, 1);
    assert_eq!(lookup.calls_for(owner), 1);
    assert_eq!(scheduler.status().interval_ms, 86_400_000);
}

#[tokio::test]
async fn owner_with_only_blank_remote_ids_is_not_selected() {
    let db = setup_test_db().await.unwrap();
    let now = fixed_now();
    let clock = ManualClock::new(now);
    let lookup = ScriptedLookup::new();
    let owner = Uuid::new_v4();

    insert_credential(&db, owner, Some(AUTHOR), None, None)
        .await
        .unwrap();
    insert_post(
        &db,
        PostFixture::new(owner, AUTHOR, now - Duration::hours(1)).remote_id(Some("")),
    )
    .await
    .unwrap();

    let scheduler = build_scheduler(&db, SchedulerConfig::default(), lookup.clone(), None, &clock);
    let summary = scheduler.run_tick().await.unwrap();

    assert_eq!(summary.owners_scanned, 0);
    assert!(load_lock(&db, owner).await.unwrap().is_none());
    assert!(lookup.calls().is_empty());
}
