//! Configuration for the test-rest service.
//!
//! Holds the fixture and schema directories, the listen address and the
//! broker settings. Loaded once at startup and never mutated afterwards.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TestRestConfig {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Fixture and schema locations
    #[serde(default)]
    pub fixtures: FixtureSettings,

    /// Message broker settings
    #[serde(default)]
    pub broker: BrokerSettings,
}

impl TestRestConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.broker
            .validate()
            .map_err(|e| anyhow::anyhow!("broker: {}", e))
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    /// Address the HTTP listener binds to
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Fixture and schema directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureSettings {
    /// Directory holding canned response bodies
    #[serde(default = "default_response_dir")]
    pub response_dir: PathBuf,

    /// Directory holding JSON-Schema documents
    #[serde(default = "default_schema_dir")]
    pub schema_dir: PathBuf,
}

impl Default for FixtureSettings {
    fn default() -> Self {
        Self {
            response_dir: default_response_dir(),
            schema_dir: default_schema_dir(),
        }
    }
}

fn default_response_dir() -> PathBuf {
    PathBuf::from("./responses")
}

fn default_schema_dir() -> PathBuf {
    PathBuf::from("./schemas")
}

/// Broker connection and routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerSettings {
    /// Whether messaging is enabled at all
    #[serde(default)]
    pub enabled: bool,

    /// Upper bound for a single forward, in milliseconds
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Buffered messages per destination
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Client carrying the messages
    #[serde(default)]
    pub transport: BrokerTransport,

    /// Network broker endpoint, used by the `stomp` transport
    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Destinations the producer side may send to
    #[serde(default)]
    pub destinations: Vec<String>,

    /// Consumer side settings
    #[serde(default)]
    pub consumer: ConsumerSettings,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            send_timeout_ms: default_send_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            transport: BrokerTransport::default(),
            connection: ConnectionSettings::default(),
            destinations: Vec::new(),
            consumer: ConsumerSettings::default(),
        }
    }
}

fn default_send_timeout_ms() -> u64 {
    5000
}

fn default_queue_capacity() -> usize {
    1024
}

impl BrokerSettings {
    /// Forward timeout as a `Duration`.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Validate the broker settings.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_timeout_ms == 0 {
            anyhow::bail!("send_timeout_ms must be greater than zero");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than zero");
        }

        if self.transport == BrokerTransport::Stomp {
            self.connection.validate()?;
        }

        let name_pattern = Regex::new(r"^[A-Za-z0-9._:-]+$")?;
        let mut seen = HashSet::new();
        for name in &self.destinations {
            if !name_pattern.is_match(name) {
                anyhow::bail!("Invalid destination name: {:?}", name);
            }
            if !seen.insert(name.as_str()) {
                anyhow::bail!("Duplicate destination: {}", name);
            }
        }

        for source in &self.consumer.sources {
            if !name_pattern.is_match(source) {
                anyhow::bail!("Invalid consumer source name: {:?}", source);
            }
            if self.enabled && !seen.contains(source.as_str()) {
                anyhow::bail!("Consumer source {} is not a declared destination", source);
            }
        }
        Ok(())
    }
}

/// Broker client implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerTransport {
    /// Bounded in-process queues shared by the service and its listener
    #[default]
    InMemory,
    /// STOMP 1.2 over TCP, e.g. an ActiveMQ or RabbitMQ STOMP endpoint
    Stomp,
}

/// Network broker endpoint and credentials.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionSettings {
    /// Broker host name or address
    #[serde(default = "default_broker_host")]
    pub host: String,

    /// Broker STOMP port
    #[serde(default = "default_broker_port")]
    pub port: u16,

    /// Login sent when connecting
    #[serde(default)]
    pub username: Option<String>,

    /// Passcode sent when connecting
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            username: None,
            password: None,
        }
    }
}

// Keeps the password out of logs.
impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

fn default_broker_host() -> String {
    "127.0.0.1".to_string()
}

fn default_broker_port() -> u16 {
    61613
}

impl ConnectionSettings {
    /// Validate the connection settings.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("connection host must not be empty");
        }
        if self.port == 0 {
            anyhow::bail!("connection port must be greater than zero");
        }
        if self.password.is_some() && self.username.is_none() {
            anyhow::bail!("connection password given without a username");
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConsumerSettings {
    /// Sources the listener subscribes to
    #[serde(default)]
    pub sources: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let config: TestRestConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.fixtures.response_dir, PathBuf::from("./responses"));
        assert_eq!(config.fixtures.schema_dir, PathBuf::from("./schemas"));
        assert!(!config.broker.enabled);
        assert_eq!(config.broker.send_timeout(), Duration::from_secs(5));
        assert_eq!(config.broker.transport, BrokerTransport::InMemory);
        assert_eq!(config.broker.connection.port, 61613);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  listen: 127.0.0.1:9000
fixtures:
  response_dir: /srv/responses
  schema_dir: /srv/schemas
broker:
  enabled: true
  send_timeout_ms: 250
  destinations: [testQueue, audit.events]
  consumer:
    sources: [testQueue]
"#;
        let config = TestRestConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen.port(), 9000);
        assert_eq!(config.fixtures.response_dir, PathBuf::from("/srv/responses"));
        assert_eq!(config.broker.destinations.len(), 2);
        assert_eq!(config.broker.send_timeout(), Duration::from_millis(250));
        assert_eq!(config.broker.consumer.sources, vec!["testQueue".to_string()]);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = r#"
fixtures:
  response_directory: /tmp
"#;
        assert!(TestRestConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let yaml = r#"
broker:
  send_timeout_ms: 0
"#;
        let err = TestRestConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("send_timeout_ms"));
    }

    #[test]
    fn test_invalid_destination_name_rejected() {
        let yaml = r#"
broker:
  destinations: ["has space"]
"#;
        assert!(TestRestConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_duplicate_destination_rejected() {
        let yaml = r#"
broker:
  destinations: [a, a]
"#;
        let err = TestRestConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_undeclared_source_rejected_when_enabled() {
        let yaml = r#"
broker:
  enabled: true
  destinations: [out]
  consumer:
    sources: [in]
"#;
        assert!(TestRestConfig::from_yaml(yaml).is_err());

        let disabled = r#"
broker:
  destinations: [out]
  consumer:
    sources: [in]
"#;
        assert!(TestRestConfig::from_yaml(disabled).is_ok());
    }

    #[test]
    fn test_parse_stomp_connection() {
        let yaml = r#"
broker:
  enabled: true
  transport: stomp
  connection:
    host: mq.internal
    port: 61614
    username: admin
    password: secret
  destinations: [testQueue]
"#;
        let config = TestRestConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.broker.transport, BrokerTransport::Stomp);
        assert_eq!(config.broker.connection.host, "mq.internal");
        assert_eq!(config.broker.connection.port, 61614);
        assert_eq!(config.broker.connection.username.as_deref(), Some("admin"));

        let printed = format!("{:?}", config.broker.connection);
        assert!(!printed.contains("secret"));
    }

    #[test]
    fn test_stomp_connection_validated() {
        let no_host = r#"
broker:
  transport: stomp
  connection:
    host: ""
"#;
        let err = TestRestConfig::from_yaml(no_host).unwrap_err();
        assert!(err.to_string().contains("host"));

        let password_only = r#"
broker:
  transport: stomp
  connection:
    password: secret
"#;
        let err = TestRestConfig::from_yaml(password_only).unwrap_err();
        assert!(err.to_string().contains("username"));
    }

    #[test]
    fn test_bundled_default_config_is_valid() {
        let yaml = include_str!("../config/default-config.yaml");
        assert!(TestRestConfig::from_yaml(yaml).is_ok());
    }
}
