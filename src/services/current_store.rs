//! Current-Value Store: the live "what do we know right now" view.
//!
//! Grounded in `original_source/app/services/current_store.py`'s
//! `CurrentStore`/`ParamState`: a keyed map of `(line, unit_id, object,
//! param)` updated on every successful read (`apply_read`), on every
//! published envelope (`apply_publish`), and touched at most once per
//! `touch_read_every_s` on successful-but-unpublished reads so the live
//! view still advances `last_ok_ts` (`touch_read`).

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::domain::types::{BusSpec, ErrorCode, RegisterType};

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ParamKey {
    pub line: String,
    pub unit_id: u8,
    pub object: String,
    pub param: String,
}

#[derive(Debug, Clone)]
pub struct ParamState {
    pub object: String,
    pub param: String,
    pub line: String,
    pub unit_id: u8,
    pub register_type: RegisterType,
    pub address: u32,

    pub value: Option<f64>,
    pub code: ErrorCode,
    pub message: String,

    pub last_ok_ts: Option<DateTime<Utc>>,
    pub last_pub_ts: Option<DateTime<Utc>>,
    pub last_touch_ts: Option<DateTime<Utc>>,

    pub trigger: Option<&'static str>,
    pub no_reply: u32,
}

impl ParamState {
    fn new(key: &ParamKey, register_type: RegisterType, address: u32) -> Self {
        Self {
            object: key.object.clone(),
            param: key.param.clone(),
            line: key.line.clone(),
            unit_id: key.unit_id,
            register_type,
            address,
            value: None,
            code: ErrorCode::Ok,
            message: String::new(),
            last_ok_ts: None,
            last_pub_ts: None,
            last_touch_ts: None,
            trigger: None,
            no_reply: 0,
        }
    }
}

/// Thread-safe keyed store of parameter runtime state.
pub struct CurrentStore {
    items: RwLock<FxHashMap<ParamKey, ParamState>>,
}

impl CurrentStore {
    pub fn new() -> Self {
        Self { items: RwLock::new(FxHashMap::default()) }
    }

    /// Rebuilds the key set from a fresh configuration while preserving
    /// the runtime state (value/timestamps) of keys that survive, per
    /// the hot-reload invariant in SPEC_FULL.md §4.9.
    pub fn reset_from_lines(&self, lines: &[BusSpec]) {
        let mut items = self.items.write();
        let mut new_items = FxHashMap::default();
        for line in lines {
            for node in &line.nodes {
                for p in &node.params {
                    let key = ParamKey {
                        line: line.name.clone(),
                        unit_id: node.unit_id,
                        object: node.object.clone(),
                        param: p.name.clone(),
                    };
                    let state = match items.remove(&key) {
                        Some(mut prev) => {
                            prev.register_type = p.register_type;
                            prev.address = p.address;
                            prev
                        }
                        None => ParamState::new(&key, p.register_type, p.address),
                    };
                    new_items.insert(key, state);
                }
            }
        }
        *items = new_items;
    }

    pub fn apply_read(
        &self,
        key: &ParamKey,
        register_type: RegisterType,
        address: u32,
        value: f64,
        now: DateTime<Utc>,
    ) {
        let mut items = self.items.write();
        let state = items
            .entry(key.clone())
            .or_insert_with(|| ParamState::new(key, register_type, address));
        state.value = Some(value);
        state.code = ErrorCode::Ok;
        state.message = "OK".to_string();
        state.register_type = register_type;
        state.address = address;
        state.last_ok_ts = Some(now);
    }

    /// Advances `last_ok_ts` without touching the published value, at
    /// most once per `touch_read_every_s` per parameter.
    pub fn touch_read(&self, key: &ParamKey, now: DateTime<Utc>, touch_read_every_s: u64) {
        let mut items = self.items.write();
        let Some(state) = items.get_mut(key) else { return };
        let due = match state.last_touch_ts {
            Some(last) => (now - last).num_seconds() >= touch_read_every_s as i64,
            None => true,
        };
        if due {
            state.last_ok_ts = Some(now);
            state.last_touch_ts = Some(now);
        }
    }

    pub fn apply_publish(
        &self,
        key: &ParamKey,
        value: Option<f64>,
        code: ErrorCode,
        message: &str,
        trigger: &'static str,
        silent_for_s: i64,
        now: DateTime<Utc>,
    ) {
        let mut items = self.items.write();
        let state = items
            .entry(key.clone())
            .or_insert_with(|| ParamState::new(key, RegisterType::Holding, 0));
        state.value = value;
        state.code = code;
        state.message = message.to_string();
        state.last_pub_ts = Some(now);
        state.trigger = Some(trigger);
        if code == ErrorCode::Ok {
            state.last_ok_ts = Some(now);
        } else {
            state.last_ok_ts = Some(now - chrono::Duration::seconds(silent_for_s));
        }
    }

    pub fn list(&self) -> Vec<ParamState> {
        self.items.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }
}

impl Default for CurrentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{BusKind, NodeSpec, ParamMode, ParamSpec, PublishMode, WordOrder};

    fn line() -> BusSpec {
        BusSpec {
            name: "line1".to_string(),
            kind: BusKind::Tcp {
                host: "127.0.0.1".to_string(),
                port: 502,
                timeout_s: 1.0,
                port_retry_backoff_s: 5,
            },
            nodes: vec![NodeSpec {
                unit_id: 1,
                object: "r1".to_string(),
                num_object: None,
                params: vec![ParamSpec {
                    name: "temp".to_string(),
                    register_type: RegisterType::Holding,
                    address: 0,
                    words: 1,
                    data_type: crate::domain::types::DataType::U16,
                    word_order: WordOrder::Ab,
                    scale: 1.0,
                    mode: ParamMode::R,
                    publish_mode: PublishMode::OnChange,
                    publish_interval_s: 0,
                    step: None,
                    hysteresis: None,
                    topic: None,
                }],
            }],
        }
    }

    fn key() -> ParamKey {
        ParamKey { line: "line1".to_string(), unit_id: 1, object: "r1".to_string(), param: "temp".to_string() }
    }

    #[test]
    fn test_reset_from_lines_populates_keys() {
        let store = CurrentStore::new();
        store.reset_from_lines(std::slice::from_ref(&line()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_reset_from_lines_preserves_value_on_surviving_key() {
        let store = CurrentStore::new();
        store.reset_from_lines(std::slice::from_ref(&line()));
        store.apply_read(&key(), RegisterType::Holding, 0, 42.0, Utc::now());

        store.reset_from_lines(std::slice::from_ref(&line()));
        let state = store.list().into_iter().find(|s| s.param == "temp").unwrap();
        assert_eq!(state.value, Some(42.0));
    }

    #[test]
    fn test_apply_publish_error_backdates_last_ok_ts() {
        let store = CurrentStore::new();
        let now = Utc::now();
        store.apply_publish(&key(), None, ErrorCode::Timeout, "TIMEOUT", "heartbeat", 30, now);
        let state = store.list().into_iter().find(|s| s.param == "temp").unwrap();
        let expected = now - chrono::Duration::seconds(30);
        assert_eq!(state.last_ok_ts.unwrap().timestamp(), expected.timestamp());
    }

    #[test]
    fn test_touch_read_respects_interval() {
        let store = CurrentStore::new();
        let now = Utc::now();
        store.touch_read(&key(), now, 60);
        // not present yet -> no-op (no state created by touch_read)
        assert_eq!(store.len(), 0);

        store.apply_read(&key(), RegisterType::Holding, 0, 1.0, now);
        store.touch_read(&key(), now + chrono::Duration::seconds(10), 60);
        let state = store.list().into_iter().find(|s| s.param == "temp").unwrap();
        assert_eq!(state.last_ok_ts.unwrap().timestamp(), now.timestamp());

        store.touch_read(&key(), now + chrono::Duration::seconds(61), 60);
        let state = store.list().into_iter().find(|s| s.param == "temp").unwrap();
        assert_eq!(state.last_ok_ts.unwrap().timestamp(), (now + chrono::Duration::seconds(61)).timestamp());
    }
}
