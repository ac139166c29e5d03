//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::BusSpec;
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub base_topic: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_qos() -> u8 {
    0
}

fn default_client_id() -> String {
    "modbus-gateway".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchReadConfig {
    #[serde(default = "default_batch_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_bits")]
    pub max_bits: usize,
    #[serde(default = "default_max_registers")]
    pub max_registers: usize,
}

fn default_batch_enabled() -> bool {
    true
}

fn default_max_bits() -> usize {
    2000
}

fn default_max_registers() -> usize {
    125
}

impl Default for BatchReadConfig {
    fn default() -> Self {
        Self {
            enabled: default_batch_enabled(),
            max_bits: default_max_bits(),
            max_registers: default_max_registers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_errors")]
    pub max_errors_before_backoff: u32,
    #[serde(default)]
    pub batch_read: BatchReadConfig,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_jitter_ms() -> u64 {
    100
}

fn default_backoff_ms() -> u64 {
    2000
}

fn default_max_errors() -> u32 {
    3
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            jitter_ms: default_jitter_ms(),
            backoff_ms: default_backoff_ms(),
            max_errors_before_backoff: default_max_errors(),
            batch_read: BatchReadConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HistoryConfig {
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u32,
    #[serde(default = "default_cleanup_every")]
    pub cleanup_every: u64,
}

fn default_max_rows() -> usize {
    100_000
}

fn default_ttl_days() -> u32 {
    30
}

fn default_cleanup_every() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurrentConfig {
    #[serde(default = "default_touch_read_every_s")]
    pub touch_read_every_s: u64,
    #[serde(default = "default_precision_decimals")]
    pub precision_decimals: u32,
}

fn default_touch_read_every_s() -> u64 {
    60
}

fn default_precision_decimals() -> u32 {
    3
}

impl Default for CurrentConfig {
    fn default() -> Self {
        Self {
            touch_read_every_s: default_touch_read_every_s(),
            precision_decimals: default_precision_decimals(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AddressingConfig {
    #[serde(default)]
    pub normalize: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SerialConfig {
    #[serde(default)]
    pub echo: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_broker_bind_address(),
            port: default_broker_port(),
        }
    }
}

fn default_metrics_interval_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    pub mqtt: MqttConfig,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub current: CurrentConfig,
    #[serde(default)]
    pub addressing: AddressingConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    pub lines: Vec<BusSpec>,
}

/// Main configuration struct used throughout the application.
#[derive(Debug, Clone)]
pub struct Config {
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_base_topic: String,
    mqtt_qos: u8,
    mqtt_retain: bool,
    mqtt_client_id: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    metrics_interval_secs: u64,
    polling_interval_ms: u64,
    polling_jitter_ms: u64,
    polling_backoff_ms: u64,
    max_errors_before_backoff: u32,
    batch_read_enabled: bool,
    batch_max_bits: usize,
    batch_max_registers: usize,
    history_max_rows: usize,
    history_ttl_days: u32,
    history_cleanup_every: u64,
    touch_read_every_s: u64,
    precision_decimals: u32,
    addressing_normalize: bool,
    serial_echo: bool,
    broker_enabled: bool,
    broker_bind_address: String,
    broker_port: u16,
    config_file: String,
    lines: Vec<BusSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_base_topic: "/devices".to_string(),
            mqtt_qos: default_qos(),
            mqtt_retain: false,
            mqtt_client_id: default_client_id(),
            mqtt_username: None,
            mqtt_password: None,
            metrics_interval_secs: default_metrics_interval_secs(),
            polling_interval_ms: default_interval_ms(),
            polling_jitter_ms: default_jitter_ms(),
            polling_backoff_ms: default_backoff_ms(),
            max_errors_before_backoff: default_max_errors(),
            batch_read_enabled: default_batch_enabled(),
            batch_max_bits: default_max_bits(),
            batch_max_registers: default_max_registers(),
            history_max_rows: default_max_rows(),
            history_ttl_days: default_ttl_days(),
            history_cleanup_every: default_cleanup_every(),
            touch_read_every_s: default_touch_read_every_s(),
            precision_decimals: default_precision_decimals(),
            addressing_normalize: false,
            serial_echo: false,
            broker_enabled: false,
            broker_bind_address: default_broker_bind_address(),
            broker_port: default_broker_port(),
            config_file: "default".to_string(),
            lines: Vec::new(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        for bus in &toml_config.lines {
            bus.validate().map_err(anyhow::Error::msg)?;
        }

        Ok(Self {
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_base_topic: toml_config.mqtt.base_topic,
            mqtt_qos: toml_config.mqtt.qos,
            mqtt_retain: toml_config.mqtt.retain,
            mqtt_client_id: toml_config.mqtt.client_id,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            metrics_interval_secs: toml_config.metrics_interval_secs,
            polling_interval_ms: toml_config.polling.interval_ms,
            polling_jitter_ms: toml_config.polling.jitter_ms,
            polling_backoff_ms: toml_config.polling.backoff_ms,
            max_errors_before_backoff: toml_config.polling.max_errors_before_backoff,
            batch_read_enabled: toml_config.polling.batch_read.enabled,
            batch_max_bits: toml_config.polling.batch_read.max_bits,
            batch_max_registers: toml_config.polling.batch_read.max_registers,
            history_max_rows: toml_config.history.max_rows,
            history_ttl_days: toml_config.history.ttl_days,
            history_cleanup_every: toml_config.history.cleanup_every,
            touch_read_every_s: toml_config.current.touch_read_every_s,
            precision_decimals: toml_config.current.precision_decimals,
            addressing_normalize: toml_config.addressing.normalize,
            serial_echo: toml_config.serial.echo,
            broker_enabled: toml_config.broker.enabled,
            broker_bind_address: toml_config.broker.bind_address,
            broker_port: toml_config.broker.port,
            config_file: path.display().to_string(),
            lines: toml_config.lines,
        })
    }

    /// Load configuration from the given path - tries the TOML file first,
    /// falls back to defaults if it's missing or invalid.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {}. Using defaults.", e);
                Self::default()
            }
        }
    }

    // Getters for all config fields.
    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_base_topic(&self) -> &str {
        &self.mqtt_base_topic
    }

    pub fn mqtt_qos(&self) -> u8 {
        self.mqtt_qos
    }

    pub fn mqtt_retain(&self) -> bool {
        self.mqtt_retain
    }

    pub fn mqtt_client_id(&self) -> &str {
        &self.mqtt_client_id
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn polling_interval_ms(&self) -> u64 {
        self.polling_interval_ms
    }

    pub fn polling_jitter_ms(&self) -> u64 {
        self.polling_jitter_ms
    }

    pub fn polling_backoff_ms(&self) -> u64 {
        self.polling_backoff_ms
    }

    pub fn max_errors_before_backoff(&self) -> u32 {
        self.max_errors_before_backoff
    }

    pub fn batch_read_enabled(&self) -> bool {
        self.batch_read_enabled
    }

    pub fn batch_max_bits(&self) -> usize {
        self.batch_max_bits
    }

    pub fn batch_max_registers(&self) -> usize {
        self.batch_max_registers
    }

    pub fn history_max_rows(&self) -> usize {
        self.history_max_rows
    }

    pub fn history_ttl_days(&self) -> u32 {
        self.history_ttl_days
    }

    pub fn history_cleanup_every(&self) -> u64 {
        self.history_cleanup_every
    }

    pub fn touch_read_every_s(&self) -> u64 {
        self.touch_read_every_s
    }

    pub fn precision_decimals(&self) -> u32 {
        self.precision_decimals
    }

    pub fn addressing_normalize(&self) -> bool {
        self.addressing_normalize
    }

    pub fn serial_echo(&self) -> bool {
        self.serial_echo
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker_enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn lines(&self) -> &[BusSpec] {
        &self.lines
    }

    /// Builder method for tests to set the bus list.
    #[cfg(test)]
    pub fn with_lines(mut self, lines: Vec<BusSpec>) -> Self {
        self.lines = lines;
        self
    }

    /// Builder method for tests to set polling cadence.
    #[cfg(test)]
    pub fn with_polling_interval_ms(mut self, ms: u64) -> Self {
        self.polling_interval_ms = ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.mqtt_host(), "localhost");
        assert_eq!(config.mqtt_port(), 1883);
        assert_eq!(config.polling_interval_ms(), 1000);
        assert_eq!(config.batch_max_registers(), 125);
        assert!(!config.addressing_normalize());
    }

    #[test]
    fn test_load_from_path_falls_back_to_defaults_on_missing_file() {
        let config = Config::load_from_path("/nonexistent/config.toml");
        assert_eq!(config.mqtt_host(), "localhost");
        assert_eq!(config.mqtt_port(), 1883);
        assert!(config.lines().is_empty());
    }

    #[test]
    fn test_from_file_parses_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.toml");
        std::fs::write(
            &path,
            r#"
            [mqtt]
            host = "localhost"
            port = 1883
            base_topic = "/devices"

            [[lines]]
            name = "line1"
            kind = "tcp"
            host = "10.0.0.5"
            port = 502

            [[lines.nodes]]
            unit_id = 1
            object = "r1"

            [[lines.nodes.params]]
            name = "temp"
            register_type = "holding"
            address = 1
            publish_mode = "on_change"
            "#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.lines().len(), 1);
        assert_eq!(config.lines()[0].nodes.len(), 1);
    }
}
