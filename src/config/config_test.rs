use super::*;

#[test]
fn defaults_are_sane() {
    let settings = Settings::default();
    assert_eq!(settings.backend.namespace, "/prefsync");
    assert_eq!(settings.backend.convergence_timeout_ms, 500);
    assert_eq!(settings.retry.activation.max_retries, 3);
    assert_eq!(settings.retry.flush.max_retries, 5);
    assert_eq!(settings.retry.sync.timeout_ms, 500);
}

#[test]
fn load_without_file_yields_defaults() {
    let settings = Settings::load(None).unwrap();
    assert_eq!(settings.backend.convergence_timeout_ms, 500);
    assert_eq!(settings.retry.flush.max_delay_ms, 2000);
}

#[test]
fn environment_overrides_defaults() {
    std::env::set_var("PREFSYNC_BACKEND__CONVERGENCE_POLL_MS", "7");
    let settings = Settings::load(None).unwrap();
    std::env::remove_var("PREFSYNC_BACKEND__CONVERGENCE_POLL_MS");
    assert_eq!(settings.backend.convergence_poll_ms, 7);
}

#[test]
fn file_overrides_defaults() {
    let path = std::env::temp_dir().join(format!("prefsync-config-{}.toml", std::process::id()));
    std::fs::write(
        &path,
        r#"
[backend]
namespace = "/custom"
convergence_timeout_ms = 750

[retry.flush]
max_retries = 9
"#,
    )
    .unwrap();
    let settings = Settings::load(path.to_str()).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(settings.backend.namespace, "/custom");
    assert_eq!(settings.backend.convergence_timeout_ms, 750);
    assert_eq!(settings.retry.flush.max_retries, 9);
    // Untouched sections keep their defaults.
    assert_eq!(settings.retry.activation.max_retries, 3);
}

#[test]
fn missing_file_is_an_error() {
    assert!(Settings::load(Some("/nonexistent/prefsync.toml")).is_err());
}
