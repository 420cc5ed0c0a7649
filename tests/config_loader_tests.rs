use metrics_refresher::config::{ConfigError, ConfigLoader};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const MANAGED_VARS: [&str; 7] = [
    "METRICS_PROFILE",
    "METRICS_API_BIND_ADDR",
    "METRICS_LOG_LEVEL",
    "METRICS_REFRESH_CANDIDATE_CAP",
    "METRICS_REFRESH_FORCE_REFRESH_COUNT",
    "METRICS_REFRESH_TICK_INTERVAL_SECONDS",
    "METRICS_REFRESH_OWNER_BATCH_SIZE",
];

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    unsafe {
        for name in MANAGED_VARS {
            env::remove_var(name);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert!(cfg.scheduler.enabled);
    assert_eq!(cfg.scheduler.tick_interval_seconds, 300);
    assert_eq!(cfg.scheduler.candidate_cap, 100);
    assert_eq!(cfg.scheduler.force_refresh_count, 5);
    cfg.bind_addr().expect("default bind addr parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "METRICS_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.test",
        "METRICS_API_BIND_ADDR=192.168.0.10:5000\nMETRICS_REFRESH_CANDIDATE_CAP=40\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "METRICS_API_BIND_ADDR=10.0.0.5:6000\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "METRICS_PROFILE=test\nMETRICS_API_BIND_ADDR=127.0.0.1:4000\n",
    );

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.scheduler.candidate_cap, 40);
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "METRICS_API_BIND_ADDR=127.0.0.1:3000\nMETRICS_REFRESH_OWNER_BATCH_SIZE=3\n",
    );

    unsafe {
        env::set_var("METRICS_API_BIND_ADDR", "0.0.0.0:9090");
        env::set_var("METRICS_REFRESH_OWNER_BATCH_SIZE", "12");
    }

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.scheduler.owner_batch_size, 12);

    clear_env();
}

#[test]
fn short_tick_interval_is_accepted_and_floored() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("METRICS_REFRESH_TICK_INTERVAL_SECONDS", "10");
    }

    let temp_dir = TempDir::new().unwrap();
    let cfg = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()))
        .load()
        .expect("short interval is not an error");
    assert_eq!(cfg.scheduler.tick_interval_seconds, 10);
    assert_eq!(cfg.scheduler.effective_tick_interval_seconds(), 60);

    clear_env();
}

#[test]
fn force_refresh_above_cap_is_rejected() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("METRICS_REFRESH_CANDIDATE_CAP", "10");
        env::set_var("METRICS_REFRESH_FORCE_REFRESH_COUNT", "20");
    }

    let temp_dir = TempDir::new().unwrap();
    let err = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()))
        .load()
        .expect_err("force count above cap should fail");
    assert!(matches!(
        err,
        ConfigError::ForceRefreshExceedsCap { force: 20, cap: 10 }
    ));

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("METRICS_API_BIND_ADDR", "not-an-addr");
    }
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid api bind address"));

    clear_env();
}
