use super::*;
use serial_test::serial;
use std::io::Write;

#[test]
fn test_config_default() {
    let config = Config::default();
    assert_eq!(config.service_name, "default");
    assert_eq!(config.process_name.len(), 8);
    assert_eq!(config.codec, Codec::ByField);
    assert_eq!(config.transport.transport_type, TransportType::Memory);
    assert_eq!(config.transport.redis.key_prefix, "relaybus");
    assert_eq!(config.rpc.timeout(), Duration::from_secs(5));
    assert_eq!(config.events.start_from, StartFrom::Latest);
    assert!(config.validation.strict);
    assert!(config.state.enabled);
    assert!(config.rpc.serve);
    assert!(!config.metrics.enabled);
    assert!(config.schema.share);
    assert_eq!(config.schema.ttl(), Duration::from_secs(86_400));
}

#[test]
fn test_process_names_are_unique() {
    assert_ne!(Config::default().process_name, Config::default().process_name);
}

#[test]
fn test_rpc_timeout_override() {
    let mut config = Config::default();
    config.apis.insert(
        "auth".to_string(),
        ApiConfig {
            rpc_timeout_ms: Some(250),
        },
    );
    assert_eq!(config.rpc_timeout("auth"), Duration::from_millis(250));
    assert_eq!(config.rpc_timeout("images"), Duration::from_secs(5));
}

#[test]
fn test_validate_rejects_zero_concurrency() {
    let mut config = Config::default();
    config.dispatch.max_concurrency = 0;
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
}

#[test]
fn test_validate_rejects_zero_block_window() {
    let mut config = Config::default();
    config.transport.redis.block_ms = 0;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("block_ms"));
}

#[test]
fn test_validate_rejects_zero_schema_ttl_only_when_sharing() {
    let mut config = Config::default();
    config.schema.ttl_secs = 0;
    assert!(config.validate().is_err());
    config.schema.share = false;
    assert!(config.validate().is_ok());
}

#[test]
fn test_for_test_config_is_valid() {
    Config::for_test().validate().unwrap();
}

#[test]
#[serial]
fn test_load_events_only_process() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "rpc:\n  serve: false\nmetrics:\n  enabled: true\nschema:\n  share: false"
    )
    .unwrap();
    let config = Config::load(file.path().to_str()).unwrap();
    assert!(!config.rpc.serve);
    assert!(config.metrics.enabled);
    assert!(!config.schema.share);
    assert_eq!(config.rpc.timeout_ms, 5000);
}

#[test]
#[serial]
fn test_load_from_yaml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
service_name: billing
process_name: billing-1
codec: blob
transport:
  type: redis
  redis:
    url: redis://cache:6379
    batch_size: 50
events:
  start_from: beginning
dispatch:
  max_concurrency: 4
validation:
  strict: false
apis:
  auth:
    rpc_timeout_ms: 1000
"#
    )
    .unwrap();

    let config = Config::load(file.path().to_str()).unwrap();
    assert_eq!(config.service_name, "billing");
    assert_eq!(config.process_name, "billing-1");
    assert_eq!(config.codec, Codec::Blob);
    assert_eq!(config.transport.transport_type, TransportType::Redis);
    assert_eq!(config.transport.redis.url, "redis://cache:6379");
    assert_eq!(config.transport.redis.batch_size, 50);
    // Unspecified values keep their defaults
    assert_eq!(config.transport.redis.block_ms, 100);
    assert_eq!(config.events.start_from, StartFrom::Beginning);
    assert_eq!(config.dispatch.max_concurrency, 4);
    assert!(!config.validation.strict);
    assert_eq!(config.rpc_timeout("auth"), Duration::from_secs(1));
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "service_name: from-file").unwrap();

    std::env::set_var("RELAYBUS__SERVICE_NAME", "from-env");
    std::env::set_var("RELAYBUS__DISPATCH__MAX_CONCURRENCY", "3");
    let loaded = Config::load(file.path().to_str());
    std::env::remove_var("RELAYBUS__SERVICE_NAME");
    std::env::remove_var("RELAYBUS__DISPATCH__MAX_CONCURRENCY");

    let config = loaded.unwrap();
    assert_eq!(config.service_name, "from-env");
    assert_eq!(config.dispatch.max_concurrency, 3);
}

#[test]
#[serial]
fn test_load_missing_required_file_fails() {
    let result = Config::load(Some("/nonexistent/relaybus.yaml"));
    assert!(matches!(result, Err(ConfigError::Load(_))));
}

#[test]
#[serial]
fn test_load_rejects_invalid_values() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "dispatch:\n  intake_buffer: 0").unwrap();
    let result = Config::load(file.path().to_str());
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}
