use super::*;
use std::io::Write;

use serial_test::serial;

use crate::retry::ErrorPolicy;

fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_config_default() {
    let config = Config::default();
    assert_eq!(config.service.name, "projects");
    assert_eq!(config.messaging.messaging_type, MessagingType::Channel);
    assert_eq!(config.storage.storage_type, StorageType::Memory);
    assert_eq!(config.consumer.max_in_flight, 64);
    assert!(!config.is_debug_profile());
}

#[test]
fn test_production_retry_profile() {
    let policy = Config::default().retry_policy();
    assert_eq!(policy.max_retries(), 5);
    assert_eq!(
        policy.delays(),
        &[5, 15, 30, 60, 120].map(Duration::from_secs)
    );
}

#[test]
fn test_debug_flags_select_debug_profile() {
    for config in [
        Config {
            debug: true,
            ..Config::default()
        },
        Config {
            local: true,
            ..Config::default()
        },
        Config::for_test(),
    ] {
        assert!(config.is_debug_profile());
        let policy = config.retry_policy();
        assert_eq!(policy.max_retries(), 1);
        assert_eq!(policy.delays(), &[Duration::from_secs(1)]);
    }
}

#[test]
fn test_retry_overrides_apply_on_top_of_profile() {
    let config = Config {
        retry: RetryConfig {
            max_retries: Some(3),
            delays_secs: Some(vec![2, 4]),
            error_policy: ErrorPolicy::FailFastPermanent,
        },
        ..Config::default()
    };
    let policy = config.retry_policy();
    assert_eq!(policy.max_retries(), 3);
    assert_eq!(
        policy.delays(),
        &[Duration::from_secs(2), Duration::from_secs(4)]
    );
    assert_eq!(policy.error_policy(), ErrorPolicy::FailFastPermanent);
}

#[test]
#[serial]
fn test_load_from_yaml_file() {
    let file = write_yaml(
        r#"
service:
  name: identity
messaging:
  type: nats
  nats:
    url: nats://broker:4222
storage:
  type: sqlite
  sqlite:
    path: /tmp/identity.db
retry:
  max_retries: 2
consumer:
  max_in_flight: 8
"#,
    );

    let config = Config::load(file.path().to_str()).unwrap();
    assert_eq!(config.service.name, "identity");
    assert_eq!(config.messaging.messaging_type, MessagingType::Nats);
    assert_eq!(config.messaging.nats.url, "nats://broker:4222");
    assert_eq!(config.storage.storage_type, StorageType::Sqlite);
    assert_eq!(config.storage.sqlite.path, "/tmp/identity.db");
    assert_eq!(config.consumer.max_in_flight, 8);
    assert_eq!(config.retry_policy().max_retries(), 2);
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let file = write_yaml("service:\n  name: identity\n");
    std::env::set_var("CQBUS__SERVICE__NAME", "documents");
    std::env::set_var("CQBUS__DEBUG", "true");

    let result = Config::load(file.path().to_str());

    std::env::remove_var("CQBUS__SERVICE__NAME");
    std::env::remove_var("CQBUS__DEBUG");

    let config = result.unwrap();
    assert_eq!(config.service.name, "documents");
    assert!(config.debug);
    assert_eq!(config.retry_policy().max_retries(), 1);
}

#[test]
#[serial]
fn test_load_rejects_invalid_service_name() {
    let file = write_yaml("service:\n  name: bad.name\n");
    assert!(matches!(
        Config::load(file.path().to_str()),
        Err(ConfigError::Invalid(_))
    ));
}

#[test]
#[serial]
fn test_load_rejects_zero_retries() {
    let file = write_yaml("retry:\n  max_retries: 0\n");
    assert!(matches!(
        Config::load(file.path().to_str()),
        Err(ConfigError::Invalid(_))
    ));
}
