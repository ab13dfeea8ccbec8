//! Loading and validating configuration files from disk.

mod common;

use serial_test::serial;

use melp::config::{Config, LoadOptions};
use melp::error::ConfigError;

use common::temp_config_file;

const DUPLICATES: &str = r#"
endpoints:
  kafka:
    - name: local
      endpoint: localhost:9092
producers:
  kafka:
    - id: orders
      endpoint: local
      topic: orders
      auth: { anon: true }
    - id: orders
      endpoint: local
      topic: orders-v2
      auth: { anon: true }
      disabled: DISABLED
"#;

fn config_error(err: anyhow::Error) -> ConfigError {
    err.downcast::<ConfigError>().expect("a ConfigError")
}

#[test]
fn test_duplicate_enabled_ids_fail_validation() {
    let (_dir, path) = temp_config_file(&DUPLICATES.replace("DISABLED", "false"));
    let config = Config::load(path.to_str().unwrap(), LoadOptions::default()).unwrap();

    assert_eq!(
        config.validate(),
        Err(vec![ConfigError::DuplicateId("orders".to_string())])
    );
}

#[test]
fn test_disabled_duplicate_is_allowed() {
    let (_dir, path) = temp_config_file(&DUPLICATES.replace("DISABLED", "true"));
    let config = Config::load(path.to_str().unwrap(), LoadOptions::default()).unwrap();

    assert!(config.validate().is_ok());
    assert_eq!(config.active_producers().count(), 1);
}

#[test]
fn test_missing_file_is_reported() {
    let err = Config::load("/nonexistent/melp.yaml", LoadOptions::default()).unwrap_err();
    assert!(matches!(config_error(err), ConfigError::Read(_)));
}

#[test]
fn test_unknown_field_is_rejected() {
    let (_dir, path) = temp_config_file("server:\n  allow_sotp: true\n");
    let err = Config::load(path.to_str().unwrap(), LoadOptions::default()).unwrap_err();
    assert!(matches!(config_error(err), ConfigError::Parse(_)));
}

#[test]
fn test_relaxed_load_ignores_unknown_fields() {
    let (_dir, path) = temp_config_file("server:\n  allow_sotp: true\nmetrics:\n  process: true\n");
    let relaxed = LoadOptions {
        relaxed: true,
        ..Default::default()
    };
    let config = Config::load(path.to_str().unwrap(), relaxed).unwrap();
    assert!(!config.server.allow_stop);
    assert!(config.metrics.process);
}

#[test]
#[serial]
fn test_environment_variables_are_expanded() {
    std::env::set_var("MELP_TEST_BROKER", "broker.internal:9093");
    std::env::set_var("MELP_TEST_TOKEN", "t0ken");
    let (_dir, path) = temp_config_file(
        r#"
endpoints:
  kafka:
    - name: main
      endpoint: ${MELP_TEST_BROKER}
producers:
  kafka:
    - id: orders
      endpoint: main
      topic: orders
      auth:
        bearer: ${MELP_TEST_TOKEN}
"#,
    );
    let config = Config::load(path.to_str().unwrap(), LoadOptions::default());
    std::env::remove_var("MELP_TEST_BROKER");
    std::env::remove_var("MELP_TEST_TOKEN");

    let config = config.unwrap();
    assert_eq!(config.endpoints.kafka[0].endpoint, "broker.internal:9093");
    assert_eq!(config.producers.kafka[0].auth.bearer, "t0ken");
}

#[test]
#[serial]
fn test_unresolved_variables_fail_unless_echo() {
    std::env::remove_var("MELP_TEST_MISSING_A");
    std::env::remove_var("MELP_TEST_MISSING_B");
    let (_dir, path) = temp_config_file(
        "endpoints:\n  kafka:\n    - name: ${MELP_TEST_MISSING_B}\n      endpoint: ${MELP_TEST_MISSING_A}\n",
    );

    let err = Config::load(path.to_str().unwrap(), LoadOptions::default()).unwrap_err();
    assert_eq!(
        config_error(err),
        ConfigError::UnresolvedVariables(vec![
            "MELP_TEST_MISSING_A".to_string(),
            "MELP_TEST_MISSING_B".to_string(),
        ])
    );

    let echo = LoadOptions {
        echo: true,
        ..Default::default()
    };
    let config = Config::load(path.to_str().unwrap(), echo).unwrap();
    assert_eq!(
        config.endpoints.kafka[0].endpoint,
        "${MELP_TEST_MISSING_A !!NOT_FOUND!!}"
    );
}

#[test]
#[serial]
fn test_allow_stop_environment_override() {
    std::env::set_var("MELP_ALLOW_STOP", "true");
    let (_dir, path) = temp_config_file("server:\n  allow_stop: false\n");
    let config = Config::load(path.to_str().unwrap(), LoadOptions::default());
    std::env::remove_var("MELP_ALLOW_STOP");

    assert!(config.unwrap().server.allow_stop);
}
