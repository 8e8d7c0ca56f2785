//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.
//! We test observable outcomes, not implementation details of TOML parsing.

use fleetwire::config::{ConfigError, FleetConfig, StoreKind};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_agent_config_loads_from_file() {
    let temp_file = write_config(
        r#"
[node]
service_id = "transfer"
instance_id = "transfer-01"

[client]
server_addr = "tcp://collector.internal:7070"
max_reconnect_attempts = 5
metadata = { zone = "a" }
"#,
    );

    let config = FleetConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.node.service_id, "transfer");
    let client = config.client_config().unwrap();
    assert_eq!(client.client_id, "transfer-01");
    assert_eq!(client.reconnect_interval, Duration::from_secs(1));
    assert_eq!(client.max_reconnect_attempts, 5);
    assert_eq!(client.metadata.get("zone").map(String::as_str), Some("a"));
    assert!(config.server.is_none());
}

#[test]
fn test_server_config_with_registry_loads_from_file() {
    let temp_file = write_config(
        r#"
[node]
service_id = "collector"
instance_id = "collector-2"

[server]
listen_addr = "0.0.0.0:7070"

[registry]
enabled = true
root_prefix = "/fleet/services/"
ttl_secs = 2

[health]
port = 9090
"#,
    );

    let config = FleetConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.registry.store, StoreKind::Memory);
    assert_eq!(config.health.port, Some(9090));
    assert_eq!(config.session_config().unwrap().queue_capacity, 100);

    let registrar = config.registrar_config();
    assert_eq!(registrar.root_key(), "/fleet/services/collector/collector-2");
    // Requested TTL below the floor is raised
    assert_eq!(registrar.effective_ttl(), 6);
}

#[test]
fn test_missing_file_is_read_error() {
    let result = FleetConfig::load_from_file(std::path::Path::new("/nonexistent/fleetwire.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let temp_file = write_config("[node\nservice_id = ");
    let result = FleetConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_invalid_instance_id_is_rejected() {
    let temp_file = write_config(
        r#"
[node]
service_id = "collector"
instance_id = "node 1"
"#,
    );

    let result = FleetConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidId(_))));
}

#[test]
fn test_http_server_addr_is_rejected() {
    let temp_file = write_config(
        r#"
[node]
service_id = "transfer"
instance_id = "transfer-01"

[client]
server_addr = "http://collector:7070"
"#,
    );

    let result = FleetConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_survives_serialization() {
    let temp_file = write_config(
        r#"
[node]
service_id = "collector"
instance_id = "collector-1"

[client]
server_addr = "127.0.0.1:7070"

[server]
listen_addr = "127.0.0.1:7070"
handshake_timeout_secs = 3
"#,
    );
    let config = FleetConfig::load_from_file(temp_file.path()).unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = FleetConfig::from_toml(&rendered).unwrap();
    assert_eq!(reparsed, config);
}
