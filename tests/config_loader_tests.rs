use adsync::config::{ConfigError, ConfigLoader};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const KEY_32: &str = "YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=";

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
    let keys: Vec<String> = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("ADSYNC_"))
        .collect();
    for key in keys {
        unsafe {
            env::remove_var(key);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn loader_for(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(PathBuf::from(dir.path()))
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let cfg = loader_for(&temp_dir).load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert!(cfg.crypto_key.is_none());
    assert_eq!(cfg.queue.max_attempts, 3);
    assert_eq!(cfg.worker.concurrency, 5);
    assert_eq!(cfg.scheduler.recurring_dedupe_key, "recurring-sync-all");
    cfg.bind_addr().expect("default bind addr parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "ADSYNC_API_BIND_ADDR=127.0.0.1:3000\nADSYNC_WORKER_CONCURRENCY=8\n",
    );
    write_env_file(&temp_dir, ".env.test", "ADSYNC_API_BIND_ADDR=192.168.0.10:5000\n");
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "ADSYNC_API_BIND_ADDR=10.0.0.5:6000\n",
    );
    // Profile is chosen in .env.local before the profile files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "ADSYNC_PROFILE=test\nADSYNC_API_BIND_ADDR=127.0.0.1:4000\n",
    );

    let cfg = loader_for(&temp_dir)
        .load()
        .expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.worker.concurrency, 8);
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
        "ADSYNC_API_BIND_ADDR=127.0.0.1:3000\nADSYNC_QUEUE_MAX_ATTEMPTS=5\n",
    );
    unsafe {
        env::set_var("ADSYNC_API_BIND_ADDR", "0.0.0.0:9090");
        env::set_var("ADSYNC_QUEUE_BACKOFF_BASE_MS", "500");
    }

    let cfg = loader_for(&temp_dir)
        .load()
        .expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.queue.max_attempts, 5);
    assert_eq!(cfg.queue.backoff_base_ms, 500);
    clear_env();
}

#[test]
fn production_profile_requires_crypto_key() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("ADSYNC_PROFILE", "prod");
    }
    let err = loader_for(&temp_dir).load().expect_err("key is required");
    assert!(matches!(err, ConfigError::MissingCryptoKey));

    unsafe {
        env::set_var("ADSYNC_CRYPTO_KEY", KEY_32);
    }
    let cfg = loader_for(&temp_dir).load().expect("key satisfies prod");
    assert_eq!(cfg.crypto_key.as_deref().map(<[u8]>::len), Some(32));
    clear_env();
}

#[test]
fn short_crypto_key_is_rejected() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        // 16 bytes
        env::set_var("ADSYNC_CRYPTO_KEY", "YWFhYWFhYWFhYWFhYWFhYQ==");
    }
    let err = loader_for(&temp_dir).load().expect_err("short key fails");
    assert!(matches!(err, ConfigError::InvalidCryptoKeyLength { length: 16 }));

    unsafe {
        env::set_var("ADSYNC_CRYPTO_KEY", "not base64!");
    }
    let err = loader_for(&temp_dir).load().expect_err("garbage key fails");
    assert!(matches!(err, ConfigError::InvalidCryptoKeyBase64 { .. }));
    clear_env();
}

#[test]
fn invalid_cron_is_rejected() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "ADSYNC_SCHEDULER_RECURRING_CRON=\"every six hours\"\n",
    );
    let err = loader_for(&temp_dir).load().expect_err("bad cron fails");
    assert!(matches!(err, ConfigError::InvalidCronSpec { .. }));
    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("ADSYNC_API_BIND_ADDR", "not-an-addr");
    }
    let err = loader_for(&temp_dir)
        .load()
        .expect_err("invalid bind addr should fail");
    assert!(err.to_string().contains("invalid api bind address"));
    clear_env();
}

#[test]
fn stale_window_must_outlive_adapter_deadline() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "ADSYNC_WORKER_ADAPTER_TIMEOUT_SECONDS=120\nADSYNC_WORKER_STALE_CLAIM_SECONDS=60\n",
    );
    let err = loader_for(&temp_dir).load().expect_err("window too short");
    assert!(matches!(
        err,
        ConfigError::InvalidStaleClaimWindow {
            stale: 60,
            timeout: 120
        }
    ));
    clear_env();
}
