//! Configuration file for the fleetwire binary
//!
//! One TOML file drives both roles. Core components never read it directly:
//! the binary converts each section into the explicit config struct of the
//! component it builds.

use crate::discovery::RegistrarConfig;
use crate::session::SessionConfig;
use crate::transport::tcp::{parse_address, TransportOptions};
use crate::transport::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub transport: TransportSection,
    /// Agent role; required by `fleetwire agent`
    pub client: Option<ClientSection>,
    /// Server role; required by `fleetwire serve`
    pub server: Option<ServerSection>,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub health: HealthSection,
}

/// Identity of this process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSection {
    /// Service identifier (must match [a-zA-Z0-9._-]+)
    pub service_id: String,
    /// Instance identifier (must match [a-zA-Z0-9._-]+)
    pub instance_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    #[serde(default = "default_keepalive_ping_secs")]
    pub keepalive_ping_secs: u64,
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            keepalive_ping_secs: default_keepalive_ping_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            max_message_bytes: default_max_message_bytes(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_keepalive_ping_secs() -> u64 {
    10
}

fn default_ping_timeout_secs() -> u64 {
    3
}

fn default_max_message_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_connect_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    /// `tcp://host:port` or `host:port`
    pub server_addr: String,
    /// Defaults to the node's instance id
    pub client_id: Option<String>,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// 0 = unlimited
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    /// Period of the agent's heartbeat push
    #[serde(default = "default_push_interval_secs")]
    pub push_interval_secs: u64,
    /// Announced to the server in the handshake
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_reconnect_interval_ms() -> u64 {
    1000
}

fn default_monitor_interval_ms() -> u64 {
    5000
}

fn default_push_interval_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    pub listen_addr: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
    pub handshake_timeout_secs: Option<u64>,
}

fn default_queue_capacity() -> usize {
    100
}

fn default_inbound_capacity() -> usize {
    1024
}

/// Which coordination store backs the registry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Etcd,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrySection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub store: StoreKind,
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Environment variable containing the store username
    pub username_env: Option<String>,
    /// Environment variable containing the store password
    pub password_env: Option<String>,
    #[serde(default = "default_root_prefix")]
    pub root_prefix: String,
    /// Raised to the registrar's minimum when lower
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            enabled: false,
            store: StoreKind::default(),
            endpoints: Vec::new(),
            username_env: None,
            password_env: None,
            root_prefix: default_root_prefix(),
            ttl_secs: default_ttl_secs(),
            dial_timeout_secs: default_dial_timeout_secs(),
        }
    }
}

fn default_root_prefix() -> String {
    "/fleetwire/registry".to_string()
}

fn default_ttl_secs() -> i64 {
    6
}

fn default_dial_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    /// Health server port; no server when absent
    pub port: Option<u16>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid identifier format: {0}")]
    InvalidId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FleetConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_id(&self.node.service_id)?;
        validate_id(&self.node.instance_id)?;

        if self.transport.max_message_bytes == 0 {
            return Err(ConfigError::InvalidConfig(
                "transport.max_message_bytes must be positive".to_string(),
            ));
        }

        if let Some(client) = &self.client {
            parse_address(&client.server_addr)
                .map_err(|e| ConfigError::InvalidConfig(format!("client.server_addr: {e}")))?;
            if let Some(client_id) = &client.client_id {
                validate_id(client_id)?;
            }
            if client.reconnect_interval_ms == 0 {
                return Err(ConfigError::InvalidConfig(
                    "client.reconnect_interval_ms must be positive".to_string(),
                ));
            }
            if client.push_interval_secs == 0 {
                return Err(ConfigError::InvalidConfig(
                    "client.push_interval_secs must be positive".to_string(),
                ));
            }
        }

        if let Some(server) = &self.server {
            if server.listen_addr.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "server.listen_addr is empty".to_string(),
                ));
            }
            if server.queue_capacity == 0 || server.inbound_capacity == 0 {
                return Err(ConfigError::InvalidConfig(
                    "server queue capacities must be positive".to_string(),
                ));
            }
        }

        if self.registry.enabled {
            if self.registry.store == StoreKind::Etcd && self.registry.endpoints.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "registry.store = \"etcd\" requires registry.endpoints".to_string(),
                ));
            }
            if self.registry.ttl_secs <= 0 {
                return Err(ConfigError::InvalidConfig(
                    "registry.ttl_secs must be positive".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            keepalive_ping: Duration::from_secs(self.transport.keepalive_ping_secs),
            ping_timeout: Duration::from_secs(self.transport.ping_timeout_secs),
            max_message_bytes: self.transport.max_message_bytes,
            connect_timeout: Duration::from_secs(self.transport.connect_timeout_secs),
        }
    }

    /// Client settings for the agent role
    pub fn client_config(&self) -> Result<ClientConfig, ConfigError> {
        let client = self.client_section()?;
        let client_id = client
            .client_id
            .clone()
            .unwrap_or_else(|| self.node.instance_id.clone());

        Ok(ClientConfig::new(
            client_id,
            Duration::from_millis(client.reconnect_interval_ms),
            client.max_reconnect_attempts,
        )
        .with_monitor_interval(Duration::from_millis(client.monitor_interval_ms))
        .with_metadata(client.metadata.clone()))
    }

    pub fn client_section(&self) -> Result<&ClientSection, ConfigError> {
        self.client
            .as_ref()
            .ok_or_else(|| ConfigError::InvalidConfig("missing [client] section".to_string()))
    }

    pub fn server_section(&self) -> Result<&ServerSection, ConfigError> {
        self.server
            .as_ref()
            .ok_or_else(|| ConfigError::InvalidConfig("missing [server] section".to_string()))
    }

    /// Session settings for the server role
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let server = self.server_section()?;
        Ok(SessionConfig {
            queue_capacity: server.queue_capacity,
            handshake_timeout: server.handshake_timeout_secs.map(Duration::from_secs),
        })
    }

    pub fn registrar_config(&self) -> RegistrarConfig {
        RegistrarConfig::new(
            self.registry.root_prefix.clone(),
            self.node.service_id.clone(),
            self.node.instance_id.clone(),
        )
        .with_ttl(self.registry.ttl_secs)
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Store username, read from the environment at call time
    pub fn get_registry_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.registry.username_env.as_ref())
    }

    /// Store password, read from the environment at call time
    pub fn get_registry_password(&self) -> Result<Option<String>, ConfigError> {
        match &self.registry.password_env {
            None => Ok(None),
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[node]
service_id = "collector"
instance_id = "node-1"

[client]
server_addr = "tcp://127.0.0.1:7070"

[server]
listen_addr = "127.0.0.1:7070"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Validate identifier format: [a-zA-Z0-9._-]+
pub fn validate_id(id: &str) -> Result<(), ConfigError> {
    let valid_chars = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidId(format!(
            "'{id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
