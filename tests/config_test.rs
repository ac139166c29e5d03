//! Integration tests for configuration loading

use modbus_gateway::infra::Config;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[mqtt]
host = "test-host"
port = 1884
base_topic = "/devices"
qos = 1
retain = true

[polling]
interval_ms = 500
jitter_ms = 50

[history]
max_rows = 1000
ttl_days = 7

[addressing]
normalize = true

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
address = 40001
publish_mode = "on_change"
scale = 0.1
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt_host(), "test-host");
    assert_eq!(config.mqtt_port(), 1884);
    assert_eq!(config.mqtt_qos(), 1);
    assert!(config.mqtt_retain());
    assert!(config.addressing_normalize());
    assert_eq!(config.history_max_rows(), 1000);
    assert_eq!(config.lines().len(), 1);
    assert_eq!(config.lines()[0].nodes[0].params[0].name, "temp");
}

#[test]
fn test_load_falls_back_to_defaults_on_missing_file() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.mqtt_host(), "localhost");
    assert_eq!(config.mqtt_port(), 1883);
    assert!(config.lines().is_empty());
}
