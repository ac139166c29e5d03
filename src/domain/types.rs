//! Core data shapes shared across the gateway: register/parameter
//! identity, wire types, and the outbound envelope.

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer};
use std::fmt;

/// Modbus object type a parameter is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Coil,
    Discrete,
    Holding,
    Input,
}

impl RegisterType {
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Discrete)
    }

    /// Modbus function code used for a read of this register type.
    pub fn read_function_code(&self) -> u8 {
        match self {
            RegisterType::Coil => 1,
            RegisterType::Discrete => 2,
            RegisterType::Holding => 3,
            RegisterType::Input => 4,
        }
    }
}

impl fmt::Display for RegisterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegisterType::Coil => "coil",
            RegisterType::Discrete => "discrete",
            RegisterType::Holding => "holding",
            RegisterType::Input => "input",
        };
        write!(f, "{}", s)
    }
}

/// Decoded numeric representation of a multi-word register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U16,
    S16,
    U32,
    S32,
    U64,
    S64,
    F32,
    F64,
}

impl DataType {
    pub fn words(&self) -> usize {
        match self {
            DataType::U16 | DataType::S16 => 1,
            DataType::U32 | DataType::S32 | DataType::F32 => 2,
            DataType::U64 | DataType::S64 | DataType::F64 => 4,
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, DataType::F32 | DataType::F64)
    }
}

/// Word ordering applied before integer/float reinterpretation for
/// multi-word values. Single-word types ignore this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum WordOrder {
    #[default]
    Ab,
    Ba,
    Abcd,
    Dcba,
    Badc,
    Cdab,
}

/// When a parameter's read result is published to MQTT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    OnChange,
    Interval,
    OnChangeAndInterval,
}

impl<'de> Deserialize<'de> for PublishMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "on_change" => Ok(PublishMode::OnChange),
            "interval" => Ok(PublishMode::Interval),
            // "both" is accepted as a legacy alias for on_change_and_interval.
            "on_change_and_interval" | "both" => Ok(PublishMode::OnChangeAndInterval),
            other => Err(de::Error::custom(format!("unknown publish_mode {other:?}"))),
        }
    }
}

/// Label attached to an emitted envelope describing why it fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Change,
    Interval,
    Heartbeat,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Change => "change",
            Trigger::Interval => "interval",
            Trigger::Heartbeat => "heartbeat",
        }
    }
}

/// Stable, classified error codes surfaced on the wire. Mirrors the
/// integer contract in SPEC_FULL.md §6; never string-matched outside
/// the classifier that produces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    Timeout,
    CrcError,
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    PortBusy,
    ConfigError,
    UnknownError,
}

impl ErrorCode {
    pub fn as_i32(&self) -> i32 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::Timeout => 1,
            ErrorCode::CrcError => 2,
            ErrorCode::IllegalFunction => 3,
            ErrorCode::IllegalDataAddress => 4,
            ErrorCode::IllegalDataValue => 5,
            ErrorCode::SlaveDeviceFailure => 6,
            ErrorCode::PortBusy => 7,
            ErrorCode::ConfigError => 10,
            ErrorCode::UnknownError => 12,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::Timeout => "timeout",
            ErrorCode::CrcError => "crc error",
            ErrorCode::IllegalFunction => "illegal function",
            ErrorCode::IllegalDataAddress => "illegal data address",
            ErrorCode::IllegalDataValue => "illegal data value",
            ErrorCode::SlaveDeviceFailure => "slave device failure",
            ErrorCode::PortBusy => "port busy",
            ErrorCode::ConfigError => "config error",
            ErrorCode::UnknownError => "unknown error",
        }
    }

    /// Maps a Modbus exception code (1-6) from the wire to our enum.
    pub fn from_exception(code: u8) -> Self {
        match code {
            1 => ErrorCode::IllegalFunction,
            2 => ErrorCode::IllegalDataAddress,
            3 => ErrorCode::IllegalDataValue,
            4 | 6 => ErrorCode::SlaveDeviceFailure,
            _ => ErrorCode::UnknownError,
        }
    }
}

/// One polled/written value on a node.
#[derive(Debug, Clone, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub register_type: RegisterType,
    pub address: u32,
    #[serde(default = "default_words")]
    pub words: usize,
    #[serde(default = "default_data_type")]
    pub data_type: DataType,
    #[serde(default)]
    pub word_order: WordOrder,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default = "default_mode")]
    pub mode: ParamMode,
    pub publish_mode: PublishMode,
    #[serde(default)]
    pub publish_interval_s: u64,
    #[serde(default)]
    pub step: Option<f64>,
    #[serde(default)]
    pub hysteresis: Option<f64>,
    #[serde(default)]
    pub topic: Option<String>,
}

fn default_words() -> usize {
    1
}

fn default_data_type() -> DataType {
    DataType::U16
}

fn default_scale() -> f64 {
    1.0
}

fn default_mode() -> ParamMode {
    ParamMode::R
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamMode {
    R,
    Rw,
}

impl ParamSpec {
    /// Validates the cross-field invariants from SPEC_FULL.md §3.
    pub fn validate(&self) -> Result<(), String> {
        if self.register_type.is_bit() && self.words != 1 {
            return Err(format!("{}: bit registers must have words=1", self.name));
        }
        if matches!(self.data_type, DataType::U16 | DataType::S16) && self.words != 1 {
            return Err(format!("{}: 16-bit data types require words=1", self.name));
        }
        if matches!(self.data_type, DataType::U32 | DataType::S32 | DataType::F32) && self.words != 2 {
            return Err(format!("{}: 32-bit data types require words=2", self.name));
        }
        if matches!(self.data_type, DataType::U64 | DataType::S64 | DataType::F64) && self.words != 4 {
            return Err(format!("{}: 64-bit data types require words=4", self.name));
        }
        if self.mode == ParamMode::Rw
            && !matches!(self.register_type, RegisterType::Coil | RegisterType::Holding)
        {
            return Err(format!("{}: writable parameters must be coil or holding", self.name));
        }
        if self.scale <= 0.0 {
            return Err(format!("{}: scale must be positive", self.name));
        }
        Ok(())
    }

    /// Resolves this parameter's publish topic against a base topic,
    /// per SPEC_FULL.md §4.7 (absolute if it starts with `/`).
    pub fn resolve_topic(&self, base_topic: &str, object: &str) -> String {
        match &self.topic {
            Some(t) if t.starts_with('/') => t.clone(),
            Some(t) => format!("{}/{}", base_topic, t),
            None => format!("{}/{}/{}", base_topic, object, self.name),
        }
    }
}

/// A single Modbus slave on a bus.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSpec {
    pub unit_id: u8,
    pub object: String,
    #[serde(default)]
    pub num_object: Option<i64>,
    pub params: Vec<ParamSpec>,
}

impl NodeSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.object.is_empty() {
            return Err("node object must be non-empty".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.params {
            p.validate()?;
            if !seen.insert(p.name.as_str()) {
                return Err(format!("duplicate parameter name {} on node {}", p.name, self.object));
            }
        }
        Ok(())
    }
}

/// Physical/logical link configuration for one bus.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BusKind {
    Serial {
        device: String,
        baudrate: u32,
        #[serde(default = "default_timeout_s")]
        timeout_s: f64,
        #[serde(default = "default_parity")]
        parity: String,
        #[serde(default = "default_stopbits")]
        stopbits: u8,
        #[serde(default)]
        rs485_rts_toggle: bool,
        #[serde(default = "default_port_retry_backoff_s")]
        port_retry_backoff_s: u64,
    },
    Tcp {
        host: String,
        port: u16,
        #[serde(default = "default_timeout_s")]
        timeout_s: f64,
        #[serde(default = "default_port_retry_backoff_s")]
        port_retry_backoff_s: u64,
    },
}

fn default_timeout_s() -> f64 {
    1.0
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_stopbits() -> u8 {
    1
}

fn default_port_retry_backoff_s() -> u64 {
    5
}

/// One physical Modbus bus and the nodes polled on it.
#[derive(Debug, Clone, Deserialize)]
pub struct BusSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: BusKind,
    pub nodes: Vec<NodeSpec>,
}

impl BusSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("bus name must be non-empty".to_string());
        }
        if let BusKind::Serial { parity, stopbits, .. } = &self.kind {
            if !matches!(parity.as_str(), "N" | "E" | "O") {
                return Err(format!("bus {} has invalid parity {parity} (expected N, E, or O)", self.name));
            }
            if !matches!(stopbits, 1 | 2) {
                return Err(format!("bus {} has invalid stopbits {stopbits} (expected 1 or 2)", self.name));
            }
        }
        for n in &self.nodes {
            n.validate()?;
        }
        Ok(())
    }
}

/// Outbound MQTT message: the bit-exact contract in SPEC_FULL.md §6.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Envelope {
    pub value: Option<String>,
    pub metadata: EnvelopeMetadata,
    #[serde(skip)]
    pub topic: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EnvelopeMetadata {
    pub timestamp: DateTime<Utc>,
    pub status_code: StatusCode,
    pub silent_for_s: i64,
    pub trigger: &'static str,
    pub no_reply: u32,
    pub context: EnvelopeContext,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusCode {
    pub source: &'static str,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EnvelopeContext {
    pub object: String,
    pub line: String,
    pub unit_id: u8,
    pub register_type: String,
    pub address: u32,
    pub param: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_mode_both_alias() {
        let m: PublishMode = serde_json::from_str("\"both\"").unwrap();
        assert_eq!(m, PublishMode::OnChangeAndInterval);
    }

    #[test]
    fn test_register_type_function_codes() {
        assert_eq!(RegisterType::Coil.read_function_code(), 1);
        assert_eq!(RegisterType::Discrete.read_function_code(), 2);
        assert_eq!(RegisterType::Holding.read_function_code(), 3);
        assert_eq!(RegisterType::Input.read_function_code(), 4);
    }

    #[test]
    fn test_param_spec_validate_words_mismatch() {
        let p = ParamSpec {
            name: "bad".into(),
            register_type: RegisterType::Holding,
            address: 1,
            words: 1,
            data_type: DataType::U32,
            word_order: WordOrder::Abcd,
            scale: 1.0,
            mode: ParamMode::R,
            publish_mode: PublishMode::OnChange,
            publish_interval_s: 0,
            step: None,
            hysteresis: None,
            topic: None,
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_resolve_topic_absolute_vs_relative() {
        let mut p = ParamSpec {
            name: "temp".into(),
            register_type: RegisterType::Holding,
            address: 1,
            words: 1,
            data_type: DataType::U16,
            word_order: WordOrder::Ab,
            scale: 1.0,
            mode: ParamMode::R,
            publish_mode: PublishMode::OnChange,
            publish_interval_s: 0,
            step: None,
            hysteresis: None,
            topic: Some("/custom/topic".to_string()),
        };
        assert_eq!(p.resolve_topic("/devices", "r1"), "/custom/topic");
        p.topic = None;
        assert_eq!(p.resolve_topic("/devices", "r1"), "/devices/r1/temp");
    }

    #[test]
    fn test_error_code_from_exception() {
        assert_eq!(ErrorCode::from_exception(1).as_i32(), 3);
        assert_eq!(ErrorCode::from_exception(2).as_i32(), 4);
        assert_eq!(ErrorCode::from_exception(4).as_i32(), 6);
        assert_eq!(ErrorCode::from_exception(99).as_i32(), 12);
    }
}
