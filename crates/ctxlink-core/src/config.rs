use crate::discovery::default_discovery_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT_MIN: u16 = 10000;
pub const DEFAULT_PORT_MAX: u16 = 65535;
pub const DEFAULT_CONNECTION_WAIT_DELAY_MS: u64 = 200;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_DEBOUNCE_MS: u64 = 50;
pub const DEFAULT_SEND_PACING_MS: u64 = 25;
pub const DEFAULT_POST_CONNECT_POLL_MS: u64 = 10;
pub const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_IDE_NAME: &str = "ctxlink";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_PORT_MIN,
            max: DEFAULT_PORT_MAX,
        }
    }
}

impl PortRange {
    pub fn ports(&self) -> std::ops::RangeInclusive<u16> {
        self.min..=self.max
    }
}

/// Everything the bridge needs, with defaults filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub port_range: PortRange,
    /// Settle time after a fresh connection before the first queued send.
    pub connection_wait_delay: Duration,
    /// How long queued mentions wait for an agent before being dropped.
    pub connection_timeout: Duration,
    /// Max age of a queued mention at send time.
    pub queue_timeout: Duration,
    pub debounce_window: Duration,
    pub send_pacing: Duration,
    pub post_connect_poll: Duration,
    /// Zero disables keepalive pings.
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub client_queue_capacity: usize,
    pub ide_name: String,
    pub discovery_dir: PathBuf,
    pub workspace: PathBuf,
    pub focus_after_send: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port_range: PortRange::default(),
            connection_wait_delay: Duration::from_millis(DEFAULT_CONNECTION_WAIT_DELAY_MS),
            connection_timeout: Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS),
            queue_timeout: Duration::from_millis(DEFAULT_QUEUE_TIMEOUT_MS),
            debounce_window: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            send_pacing: Duration::from_millis(DEFAULT_SEND_PACING_MS),
            post_connect_poll: Duration::from_millis(DEFAULT_POST_CONNECT_POLL_MS),
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MS),
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
            ide_name: DEFAULT_IDE_NAME.to_string(),
            discovery_dir: default_discovery_dir(),
            workspace: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            focus_after_send: false,
        }
    }
}

/// On-disk shape. Every field optional; absent fields keep their defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    port_range: Option<PortRangeFile>,
    connection_wait_delay_ms: Option<u64>,
    connection_timeout_ms: Option<u64>,
    queue_timeout_ms: Option<u64>,
    debounce_ms: Option<u64>,
    send_pacing_ms: Option<u64>,
    post_connect_poll_ms: Option<u64>,
    ping_interval_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    client_queue_capacity: Option<usize>,
    ide_name: Option<String>,
    discovery_dir: Option<PathBuf>,
    workspace: Option<PathBuf>,
    focus_after_send: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PortRangeFile {
    min: Option<u16>,
    max: Option<u16>,
}

/// A legacy key that was rewritten during load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyKeyNotice {
    pub legacy: String,
    pub replacement: String,
    /// False when the new-style key was also present and took precedence.
    pub applied: bool,
}

const LEGACY_TOP_LEVEL: &[(&str, &str)] = &[
    ("wait_delay_ms", "connection_wait_delay_ms"),
    ("connect_timeout_ms", "connection_timeout_ms"),
    ("mention_ttl_ms", "queue_timeout_ms"),
];

const LEGACY_PORT_KEYS: &[(&str, &str)] = &[("min_port", "min"), ("max_port", "max")];

/// Rewrite old key names to their current equivalents. A current key
/// always wins over its legacy alias.
pub fn migrate_legacy_keys(mut table: toml::Table) -> (toml::Table, Vec<LegacyKeyNotice>) {
    let mut notices = Vec::new();

    for (legacy, replacement) in LEGACY_TOP_LEVEL {
        let Some(value) = table.remove(*legacy) else {
            continue;
        };
        let applied = !table.contains_key(*replacement);
        if applied {
            table.insert(replacement.to_string(), value);
        }
        notices.push(LegacyKeyNotice {
            legacy: legacy.to_string(),
            replacement: replacement.to_string(),
            applied,
        });
    }

    for (legacy, field) in LEGACY_PORT_KEYS {
        let Some(value) = table.remove(*legacy) else {
            continue;
        };
        let range = table
            .entry("port_range")
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        let applied = match range.as_table_mut() {
            Some(range) if !range.contains_key(*field) => {
                range.insert(field.to_string(), value);
                true
            }
            _ => false,
        };
        notices.push(LegacyKeyNotice {
            legacy: legacy.to_string(),
            replacement: format!("port_range.{field}"),
            applied,
        });
    }

    (table, notices)
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<(Self, Vec<LegacyKeyNotice>), ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<(Self, Vec<LegacyKeyNotice>), ConfigError> {
        let table: toml::Table =
            toml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        let (table, notices) = migrate_legacy_keys(table);
        let file: ConfigFile = toml::Value::Table(table)
            .try_into()
            .map_err(|err: toml::de::Error| ConfigError::Parse(err.to_string()))?;
        let config = Self::default().merged(file);
        config.validate()?;
        Ok((config, notices))
    }

    fn merged(mut self, file: ConfigFile) -> Self {
        let ms = Duration::from_millis;
        if let Some(range) = file.port_range {
            self.port_range.min = range.min.unwrap_or(self.port_range.min);
            self.port_range.max = range.max.unwrap_or(self.port_range.max);
        }
        if let Some(value) = file.connection_wait_delay_ms {
            self.connection_wait_delay = ms(value);
        }
        if let Some(value) = file.connection_timeout_ms {
            self.connection_timeout = ms(value);
        }
        if let Some(value) = file.queue_timeout_ms {
            self.queue_timeout = ms(value);
        }
        if let Some(value) = file.debounce_ms {
            self.debounce_window = ms(value);
        }
        if let Some(value) = file.send_pacing_ms {
            self.send_pacing = ms(value);
        }
        if let Some(value) = file.post_connect_poll_ms {
            self.post_connect_poll = ms(value);
        }
        if let Some(value) = file.ping_interval_ms {
            self.ping_interval = ms(value);
        }
        if let Some(value) = file.write_timeout_ms {
            self.write_timeout = ms(value);
        }
        if let Some(value) = file.client_queue_capacity {
            self.client_queue_capacity = value;
        }
        if let Some(value) = file.ide_name {
            self.ide_name = value;
        }
        if let Some(value) = file.discovery_dir {
            self.discovery_dir = value;
        }
        if let Some(value) = file.workspace {
            self.workspace = value;
        }
        if let Some(value) = file.focus_after_send {
            self.focus_after_send = value;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_range.min == 0 {
            return Err(ConfigError::Invalid("port_range.min must be > 0".to_string()));
        }
        if self.port_range.min > self.port_range.max {
            return Err(ConfigError::Invalid(format!(
                "port_range.min {} exceeds port_range.max {}",
                self.port_range.min, self.port_range.max
            )));
        }
        if self.connection_timeout.is_zero() {
            return Err(ConfigError::Invalid("connection_timeout must be > 0".to_string()));
        }
        if self.queue_timeout.is_zero() {
            return Err(ConfigError::Invalid("queue_timeout must be > 0".to_string()));
        }
        if self.client_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "client_queue_capacity must be > 0".to_string(),
            ));
        }
        if self.post_connect_poll.is_zero() {
            return Err(ConfigError::Invalid("post_connect_poll must be > 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = BridgeConfig::default();
        assert_eq!(config.port_range, PortRange { min: 10000, max: 65535 });
        assert_eq!(config.connection_wait_delay, Duration::from_millis(200));
        assert_eq!(config.connection_timeout, Duration::from_millis(10_000));
        assert_eq!(config.queue_timeout, Duration::from_millis(5_000));
        assert_eq!(config.debounce_window, Duration::from_millis(50));
        assert_eq!(config.send_pacing, Duration::from_millis(25));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let (config, notices) = BridgeConfig::from_toml_str(
            r#"
queue_timeout_ms = 1500
ide_name = "helix"

[port_range]
min = 20000
"#,
        )
        .expect("parse");
        assert!(notices.is_empty());
        assert_eq!(config.queue_timeout, Duration::from_millis(1500));
        assert_eq!(config.ide_name, "helix");
        assert_eq!(config.port_range, PortRange { min: 20000, max: 65535 });
        assert_eq!(config.connection_timeout, Duration::from_millis(10_000));
    }

    #[test]
    fn legacy_keys_are_remapped() {
        let table: toml::Table = toml::from_str(
            r#"
min_port = 12000
max_port = 12010
wait_delay_ms = 300
mention_ttl_ms = 900
"#,
        )
        .expect("table");
        let (table, notices) = migrate_legacy_keys(table);

        assert_eq!(notices.len(), 4);
        assert!(notices.iter().all(|n| n.applied));
        assert!(!table.contains_key("min_port"));
        assert_eq!(
            table["port_range"]["min"].as_integer(),
            Some(12000)
        );
        assert_eq!(table["connection_wait_delay_ms"].as_integer(), Some(300));
        assert_eq!(table["queue_timeout_ms"].as_integer(), Some(900));
    }

    #[test]
    fn current_key_wins_over_legacy_alias() {
        let (config, notices) = BridgeConfig::from_toml_str(
            r#"
connect_timeout_ms = 1
connection_timeout_ms = 4000
max_port = 1

[port_range]
max = 30000
"#,
        )
        .expect("parse");
        assert_eq!(config.connection_timeout, Duration::from_millis(4000));
        assert_eq!(config.port_range.max, 30000);
        assert_eq!(notices.len(), 2);
        assert!(notices.iter().all(|n| !n.applied));
    }

    #[test]
    fn rejects_inverted_port_range() {
        let result = BridgeConfig::from_toml_str(
            r#"
[port_range]
min = 5000
max = 4000
"#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_timeouts() {
        assert!(matches!(
            BridgeConfig::from_toml_str("queue_timeout_ms = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            BridgeConfig::from_toml_str("connection_timeout_ms = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            BridgeConfig::from_toml_str("queue_timeout_ms = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            BridgeConfig::from_toml_str("[port_range"),
            Err(ConfigError::Parse(_))
        ));
    }
}
