use super::*;
use serial_test::serial;
use std::env;

fn cleanup_test_env() {
    env::remove_var("HUB_ADMIN_API_KEY");
    env::remove_var("HUB_HOST");
    env::remove_var("HUB_PORT");
    env::remove_var("HUB_DATA_DIR");
    env::remove_var("ALLOWED_ORIGINS");
    env::remove_var("TASK_TTL_MS");
    env::remove_var("FALLBACK_WAIT_MS");
    env::remove_var("DEFAULT_OLLAMA_MODEL");
}

#[test]
#[serial]
fn missing_admin_key_is_rejected() {
    cleanup_test_env();
    let result = load_static_config();
    assert!(result.is_err());
    match result.unwrap_err() {
        HubError::Configuration(msg) => assert!(msg.contains("HUB_ADMIN_API_KEY")),
        other => panic!("expected Configuration error, got {other:?}"),
    }
    cleanup_test_env();
}

#[test]
#[serial]
fn short_admin_key_is_rejected() {
    cleanup_test_env();
    env::set_var("HUB_ADMIN_API_KEY", "too-short");
    let result = load_static_config();
    assert!(result.is_err());
    cleanup_test_env();
}

#[test]
#[serial]
fn valid_config_loads_with_defaults() {
    cleanup_test_env();
    env::set_var(
        "HUB_ADMIN_API_KEY",
        "a-sufficiently-long-admin-key-0123456789",
    );
    let config = load_static_config().unwrap();
    assert_eq!(config.bind_host, "127.0.0.1");
    assert_eq!(config.bind_port, 7100);
    assert_eq!(
        config.allowed_origins,
        vec!["http://localhost:3000", "http://127.0.0.1:3000"]
    );
    cleanup_test_env();
}

#[test]
#[serial]
fn allowed_origins_parses_csv() {
    cleanup_test_env();
    env::set_var(
        "HUB_ADMIN_API_KEY",
        "a-sufficiently-long-admin-key-0123456789",
    );
    env::set_var("ALLOWED_ORIGINS", "https://a.example,https://b.example");
    let config = load_static_config().unwrap();
    assert_eq!(config.allowed_origins.len(), 2);
    cleanup_test_env();
}

#[test]
fn runtime_config_defaults_match_constants() {
    let config = RuntimeConfig::from_env();
    assert_eq!(config.task_ttl_ms(), crate::constants::DEFAULT_TASK_TTL_MS);
    assert_eq!(config.fallback_wait_ms(), crate::constants::DEFAULT_FALLBACK_WAIT_MS);
    assert_eq!(config.default_ollama_model(), crate::constants::DEFAULT_OLLAMA_MODEL);
}

#[test]
fn runtime_config_setters_are_visible_to_clones() {
    let config = RuntimeConfig::from_env();
    let cloned = config.clone();
    config.set_task_ttl_ms(42);
    assert_eq!(cloned.task_ttl_ms(), 42);
}

#[test]
fn budget_caps_default_to_configured_values() {
    let config = RuntimeConfig::from_env();
    let caps = config.budget_caps(InvocationCategory::Executing);
    assert!(caps.hourly > 0);
    assert!(caps.daily >= caps.hourly);
}
