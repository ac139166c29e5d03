//! Bus Worker: the per-bus poll loop tying the Planner, Transport, Codec,
//! Decider, MQTT Bridge, and Current Store together.
//!
//! The loop shape (drain writes, read nodes, jittered pacing sleep,
//! `tokio::select!` against a shutdown watch) is grounded in the
//! teacher's `io::rs485::Rs485Monitor::run` and `services::gate_worker`'s
//! queue-draining pattern; the per-node batch-read/publish/backoff
//! sequencing is grounded in `original_source/app/services/modbus_line.py`'s
//! `run()`/`_maybe_publish`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::domain::codec::{apply_scale, decode_words, normalize_address};
use crate::domain::types::{Envelope, EnvelopeContext, EnvelopeMetadata, ErrorCode, NodeSpec, StatusCode};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::mqtt_bridge::{Command, MqttBridge};
use crate::io::planner::plan_node_reads;
use crate::io::transport::{Transport, TransportError};
use crate::services::current_store::{CurrentStore, ParamKey};
use crate::services::decider::{decide, DeciderState};

/// A write task enqueued from an MQTT command handler, tagged with the
/// node and parameter it targets.
#[derive(Debug, Clone)]
pub struct WriteCommand {
    pub unit_id: u8,
    pub param: String,
    pub value_str: String,
}

struct WorkerConfig {
    normalize: bool,
    batching_enabled: bool,
    max_bits: usize,
    max_registers: usize,
    interval_ms: u64,
    jitter_ms: u64,
    backoff_ms: u64,
    max_errors_before_backoff: u32,
    precision_decimals: u32,
    touch_read_every_s: u64,
    base_topic: String,
}

impl WorkerConfig {
    fn from_config(config: &Config) -> Self {
        Self {
            normalize: config.addressing_normalize(),
            batching_enabled: config.batch_read_enabled(),
            max_bits: config.batch_max_bits(),
            max_registers: config.batch_max_registers(),
            interval_ms: config.polling_interval_ms(),
            jitter_ms: config.polling_jitter_ms(),
            backoff_ms: config.polling_backoff_ms(),
            max_errors_before_backoff: config.max_errors_before_backoff(),
            precision_decimals: config.precision_decimals(),
            touch_read_every_s: config.touch_read_every_s(),
            base_topic: config.mqtt_base_topic().to_string(),
        }
    }
}

pub struct BusWorker {
    line_name: String,
    nodes: Vec<NodeSpec>,
    transport: Arc<dyn Transport>,
    bridge: Arc<MqttBridge>,
    current_store: Arc<CurrentStore>,
    metrics: Arc<Metrics>,
    cfg: WorkerConfig,
    write_rx: mpsc::Receiver<WriteCommand>,
    decider_states: FxHashMap<(u8, String), DeciderState>,
    no_reply: FxHashMap<u8, u32>,
}

impl BusWorker {
    /// Builds a worker for one bus and registers MQTT write-command
    /// handlers for every `mode=rw` parameter, per SPEC_FULL.md §4.5.
    pub async fn build(
        line_name: String,
        nodes: Vec<NodeSpec>,
        transport: Arc<dyn Transport>,
        bridge: Arc<MqttBridge>,
        current_store: Arc<CurrentStore>,
        metrics: Arc<Metrics>,
        config: &Config,
    ) -> Self {
        let cfg = WorkerConfig::from_config(config);
        let (write_tx, write_rx) = mpsc::channel::<WriteCommand>(256);

        for node in &nodes {
            for param in &node.params {
                if param.mode != crate::domain::types::ParamMode::Rw {
                    continue;
                }
                let pub_topic = param.resolve_topic(&cfg.base_topic, &node.object);
                let unit_id = node.unit_id;
                let param_name = param.name.clone();
                let write_tx = write_tx.clone();
                let handler: crate::io::mqtt_bridge::CommandHandler = Arc::new(move |cmd: Command| {
                    let task = WriteCommand { unit_id, param: param_name.clone(), value_str: cmd.value };
                    if write_tx.try_send(task).is_err() {
                        warn!(unit_id, param = %param_name, "bus_worker_write_queue_full");
                    }
                });
                bridge.register_command_handler(&pub_topic, handler).await;
            }
        }

        Self {
            line_name,
            nodes,
            transport,
            bridge,
            current_store,
            metrics,
            cfg,
            write_rx,
            decider_states: FxHashMap::default(),
            no_reply: FxHashMap::default(),
        }
    }

    /// Runs the poll loop until the shutdown channel signals true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(line = %self.line_name, nodes = self.nodes.len(), "bus_worker_started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let loop_start = tokio::time::Instant::now();

            self.drain_writes().await;

            for node_idx in 0..self.nodes.len() {
                self.poll_node(node_idx).await;
            }

            let elapsed = loop_start.elapsed();
            let base = Duration::from_millis(self.cfg.interval_ms);
            let sleep_for = base.saturating_sub(elapsed) + jitter_duration(self.cfg.jitter_ms);

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(line = %self.line_name, "bus_worker_shutdown");
                        return;
                    }
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        info!(line = %self.line_name, "bus_worker_shutdown");
    }

    /// Drains up to 100 pending write commands per cycle, per
    /// SPEC_FULL.md §4.5's write-interleaving rule.
    async fn drain_writes(&mut self) {
        const MAX_WRITES_PER_CYCLE: usize = 100;
        for _ in 0..MAX_WRITES_PER_CYCLE {
            let Ok(cmd) = self.write_rx.try_recv() else { break };
            self.apply_write(cmd).await;
        }
    }

    async fn apply_write(&mut self, cmd: WriteCommand) {
        let Some((node, param)) =
            self.nodes.iter().find(|n| n.unit_id == cmd.unit_id).and_then(|n| {
                n.params.iter().find(|p| p.name == cmd.param).map(|p| (n, p))
            })
        else {
            warn!(unit_id = cmd.unit_id, param = %cmd.param, "bus_worker_write_unknown_param");
            return;
        };

        let num: f64 = cmd.value_str.trim().parse().unwrap_or(0.0);
        let address = normalize_address(param.register_type, param.address, self.cfg.normalize) as u16;

        let result = if param.register_type.is_bit() {
            self.transport.write_coil(node.unit_id, address, num != 0.0).await
        } else {
            let raw = (num * param.scale).round() as i64;
            self.transport.write_register(node.unit_id, address, raw as u16).await
        };

        match result {
            Ok(()) => {
                self.metrics.record_write_command();
                let key = (node.unit_id, param.name.clone());
                if let Some(state) = self.decider_states.get_mut(&key) {
                    state.last_value = Some(num);
                }
                debug!(unit_id = node.unit_id, param = %param.name, value = num, "bus_worker_write_ok");
            }
            Err(e) => {
                self.metrics.record_write_command_dropped();
                warn!(unit_id = node.unit_id, param = %param.name, error = %e, "bus_worker_write_failed");
            }
        }
    }

    async fn poll_node(&mut self, node_idx: usize) {
        let node = &self.nodes[node_idx];
        let plan = plan_node_reads(
            &node.params,
            self.cfg.normalize,
            self.cfg.batching_enabled,
            self.cfg.max_bits,
            self.cfg.max_registers,
        );

        for rejection in &plan.rejections {
            let param = &node.params[rejection.param_index];
            warn!(
                line = %self.line_name,
                unit_id = node.unit_id,
                param = %param.name,
                reason = %rejection.reason,
                "bus_worker_planner_rejected_param"
            );
        }

        let unit_id = node.unit_id;
        let now = Utc::now();

        for read in &plan.reads {
            let outcome = if read.register_type.is_bit() {
                self.transport
                    .read_bits(unit_id, read.register_type.read_function_code(), read.start, read.count)
                    .await
                    .map(ReadOutcome::Bits)
            } else {
                self.transport
                    .read_registers(unit_id, read.register_type.read_function_code(), read.start, read.count)
                    .await
                    .map(ReadOutcome::Registers)
            };

            match outcome {
                Ok(values) => {
                    self.no_reply.insert(unit_id, 0);
                    for member in &read.members {
                        let param = &node.params[member.param_index];
                        let offset = (member.normalized_address - read.start) as usize;
                        let value = match &values {
                            ReadOutcome::Bits(bits) => {
                                self.metrics.record_read(true, 0);
                                if bits[offset] { 1.0 } else { 0.0 }
                            }
                            ReadOutcome::Registers(regs) => {
                                self.metrics.record_read(true, 0);
                                let words = &regs[offset..offset + member.words];
                                let raw = decode_words(words, param.data_type, param.word_order);
                                apply_scale(raw, param.scale, param.data_type, self.cfg.precision_decimals)
                            }
                        };
                        self.handle_success(node, param, value, now).await;
                    }
                }
                Err(e) => {
                    let code = classify(&e);
                    let no_reply = self.no_reply.entry(unit_id).or_insert(0);
                    *no_reply += 1;
                    let no_reply_count = *no_reply;

                    for member in &read.members {
                        let param = &node.params[member.param_index];
                        self.metrics.record_read(false, 0);
                        self.handle_error(node, param, code, no_reply_count, now).await;
                    }

                    if no_reply_count >= self.cfg.max_errors_before_backoff {
                        tokio::time::sleep(Duration::from_millis(self.cfg.backoff_ms)).await;
                    }
                }
            }
        }
    }

    async fn handle_success(
        &mut self,
        node: &NodeSpec,
        param: &crate::domain::types::ParamSpec,
        value: f64,
        now: chrono::DateTime<Utc>,
    ) {
        let key = (node.unit_id, param.name.clone());
        let state = self.decider_states.entry(key.clone()).or_default();
        let decision = decide(state, param, Some(value), ErrorCode::Ok, "OK", now);

        let store_key = ParamKey {
            line: self.line_name.clone(),
            unit_id: node.unit_id,
            object: node.object.clone(),
            param: param.name.clone(),
        };
        self.current_store.apply_read(&store_key, param.register_type, param.address, value, now);

        if decision.touch {
            self.current_store.touch_read(&store_key, now, self.cfg.touch_read_every_s);
        }

        for intent in decision.publish {
            self.publish(node, param, intent, now).await;
        }
    }

    async fn handle_error(
        &mut self,
        node: &NodeSpec,
        param: &crate::domain::types::ParamSpec,
        code: ErrorCode,
        no_reply: u32,
        now: chrono::DateTime<Utc>,
    ) {
        let key = (node.unit_id, param.name.clone());
        let state = self.decider_states.entry(key.clone()).or_default();
        let message = code.message();
        let decision = decide(state, param, None, code, message, now);

        let store_key = ParamKey {
            line: self.line_name.clone(),
            unit_id: node.unit_id,
            object: node.object.clone(),
            param: param.name.clone(),
        };

        for intent in decision.publish {
            self.publish_with_no_reply(node, param, intent, no_reply, now, &store_key).await;
        }
    }

    async fn publish(
        &mut self,
        node: &NodeSpec,
        param: &crate::domain::types::ParamSpec,
        intent: crate::services::decider::PublishIntent,
        now: chrono::DateTime<Utc>,
    ) {
        let store_key = ParamKey {
            line: self.line_name.clone(),
            unit_id: node.unit_id,
            object: node.object.clone(),
            param: param.name.clone(),
        };
        self.publish_with_no_reply(node, param, intent, 0, now, &store_key).await;
    }

    async fn publish_with_no_reply(
        &mut self,
        node: &NodeSpec,
        param: &crate::domain::types::ParamSpec,
        intent: crate::services::decider::PublishIntent,
        no_reply: u32,
        now: chrono::DateTime<Utc>,
        store_key: &ParamKey,
    ) {
        let topic = param.resolve_topic(&self.cfg.base_topic, &node.object);
        let normalized_address = normalize_address(param.register_type, param.address, self.cfg.normalize);

        let envelope = Envelope {
            value: intent.value.map(|v| format_value(v, param.data_type)),
            topic: topic.clone(),
            metadata: EnvelopeMetadata {
                timestamp: now,
                status_code: StatusCode {
                    source: "persay",
                    code: intent.code.as_i32(),
                    message: if intent.code == ErrorCode::Ok { None } else { Some(intent.message.clone()) },
                },
                silent_for_s: intent.silent_for_s,
                trigger: intent.trigger.as_str(),
                no_reply,
                context: EnvelopeContext {
                    object: node.object.clone(),
                    line: self.line_name.clone(),
                    unit_id: node.unit_id,
                    register_type: param.register_type.to_string(),
                    address: normalized_address,
                    param: param.name.clone(),
                },
            },
        };

        self.current_store.apply_publish(
            store_key,
            intent.value,
            intent.code,
            &intent.message,
            intent.trigger.as_str(),
            intent.silent_for_s,
            now,
        );

        if self.bridge.try_publish(envelope) {
            self.metrics.record_envelope_published();
        }
    }
}

enum ReadOutcome {
    Bits(Vec<bool>),
    Registers(Vec<u16>),
}

fn format_value(value: f64, data_type: crate::domain::types::DataType) -> String {
    if data_type.is_integer() && value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Classifies a transport failure into the stable error taxonomy,
/// grounded in `modbus_line.py`'s `_map_ex`.
fn classify(err: &TransportError) -> ErrorCode {
    match err {
        TransportError::Timeout => ErrorCode::Timeout,
        TransportError::Crc => ErrorCode::CrcError,
        TransportError::Exception(code) => ErrorCode::from_exception(*code),
        TransportError::PortBusy => ErrorCode::PortBusy,
        TransportError::Io(_) => ErrorCode::PortBusy,
        TransportError::Protocol(_) => ErrorCode::UnknownError,
    }
}

/// Jitter without a `rand` dependency (absent from the teacher's
/// dependency stack): derives a pseudo-random offset in `[0, jitter_ms)`
/// from the low bits of the monotonic clock.
fn jitter_duration(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::ZERO;
    }
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::Instant::now().elapsed().subsec_nanos() as u64;
    let entropy = nanos.wrapping_add(n.wrapping_mul(2654435761));
    Duration::from_millis(entropy % jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_exception_code() {
        assert_eq!(classify(&TransportError::Exception(2)), ErrorCode::IllegalDataAddress);
    }

    #[test]
    fn test_classify_timeout() {
        assert_eq!(classify(&TransportError::Timeout), ErrorCode::Timeout);
    }

    #[test]
    fn test_format_value_integer_has_no_decimal() {
        assert_eq!(format_value(42.0, crate::domain::types::DataType::U16), "42");
    }

    #[test]
    fn test_format_value_float_keeps_fraction() {
        assert_eq!(format_value(12.3, crate::domain::types::DataType::F32), "12.3");
    }

    #[test]
    fn test_jitter_bounded() {
        for _ in 0..20 {
            let d = jitter_duration(50);
            assert!(d.as_millis() < 50);
        }
        assert_eq!(jitter_duration(0), Duration::ZERO);
    }
}
