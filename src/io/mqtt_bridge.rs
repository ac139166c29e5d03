//! MQTT Bridge: outbound envelope publisher + inbound command dispatch.
//!
//! The event-loop driving (dedicated task polling `rumqttc::EventLoop`,
//! logging and backing off on error rather than tearing down) is grounded
//! in the teacher's `io::mqtt`/`io::mqtt_egress`. The topic→handler
//! registry with resubscribe-on-reconnect and the envelope/command shape
//! are grounded in `original_source/app/services/mqtt_bridge.py`.

use crate::domain::types::Envelope;
use crate::infra::config::Config;
use crate::io::journal::{Journal, JournalRecord};
use parking_lot::RwLock;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

/// A write command decoded from an inbound MQTT payload, handed to a
/// registered handler for a `(bus, unit, param)` write topic.
#[derive(Debug, Clone)]
pub struct Command {
    pub topic: String,
    pub value: String,
}

pub type CommandHandler = Arc<dyn Fn(Command) + Send + Sync>;

struct Registry {
    handlers: FxHashMap<String, CommandHandler>,
}

/// Owns the MQTT client, the outbound publish queue, and the inbound
/// command handler registry.
pub struct MqttBridge {
    client: AsyncClient,
    tx: mpsc::Sender<Envelope>,
    registry: Arc<RwLock<Registry>>,
    qos: QoS,
    retain: bool,
}

impl MqttBridge {
    /// Connects the client, spawns the event-loop driving task and the
    /// publisher task, and returns a handle usable for queuing envelopes
    /// and registering command handlers.
    pub fn start(config: &Config, journal: Arc<Journal>) -> Self {
        let mut mqttoptions = MqttOptions::new(config.mqtt_client_id(), config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 256);
        let registry = Arc::new(RwLock::new(Registry { handlers: FxHashMap::default() }));
        let qos = qos_from_u8(config.mqtt_qos());
        let retain = config.mqtt_retain();

        let (tx, rx) = mpsc::channel::<Envelope>(1024);

        tokio::spawn(drive_eventloop(client.clone(), eventloop, registry.clone()));
        tokio::spawn(run_publisher(client.clone(), rx, journal, qos, retain));

        Self { client, tx, registry, qos, retain }
    }

    /// Queues an envelope for publication. Non-blocking: if the queue is
    /// full the envelope is dropped and counted by the caller via the
    /// returned `bool`.
    pub fn try_publish(&self, envelope: Envelope) -> bool {
        match self.tx.try_send(envelope) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("mqtt_bridge_queue_full: dropping envelope");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!("mqtt_bridge_publisher_closed");
                false
            }
        }
    }

    /// Registers a handler for the write-command topic `<pub_topic>/on`
    /// and subscribes to it immediately. The registry is the source of
    /// truth for resubscription on reconnect.
    pub async fn register_command_handler(&self, pub_topic: &str, handler: CommandHandler) {
        let topic = format!("{pub_topic}/on");
        self.registry.write().handlers.insert(topic.clone(), handler);
        if let Err(e) = self.client.subscribe(&topic, QoS::AtLeastOnce).await {
            warn!(topic = %topic, error = %e, "mqtt_bridge_subscribe_failed");
        }
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn retain(&self) -> bool {
        self.retain
    }
}

fn qos_from_u8(v: u8) -> QoS {
    match v {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Drives the `rumqttc` event loop on a dedicated task. Resubscribes
/// every registered command topic on each fresh `ConnAck` since the
/// handler map, not the broker session, is the source of truth.
async fn drive_eventloop(
    client: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    registry: Arc<RwLock<Registry>>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt_bridge_connected");
                let topics: Vec<String> = registry.read().handlers.keys().cloned().collect();
                for topic in topics {
                    if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                        warn!(topic = %topic, error = %e, "mqtt_bridge_resubscribe_failed");
                    } else {
                        debug!(topic = %topic, "mqtt_bridge_resubscribed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = publish.topic.clone();
                let handler = registry.read().handlers.get(&topic).cloned();
                let Some(handler) = handler else {
                    continue;
                };
                match decode_command_value(&publish.payload) {
                    Some(value) => handler(Command { topic, value }),
                    None => warn!(topic = %topic, "mqtt_bridge_command_decode_failed"),
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "mqtt_bridge_eventloop_error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Payload decoding tolerates either a bare string/number or a
/// `{"value": ...}` JSON object.
fn decode_command_value(payload: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct ValueEnvelope {
        value: serde_json::Value,
    }

    let text = std::str::from_utf8(payload).ok()?;
    if let Ok(env) = serde_json::from_str::<ValueEnvelope>(text) {
        return Some(json_value_to_string(&env.value));
    }
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(text) {
        return Some(json_value_to_string(&v));
    }
    Some(text.trim().to_string())
}

fn json_value_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Drains the outbound queue and publishes each envelope, journaling
/// successful publishes.
async fn run_publisher(
    client: AsyncClient,
    mut rx: mpsc::Receiver<Envelope>,
    journal: Arc<Journal>,
    qos: QoS,
    retain: bool,
) {
    while let Some(envelope) = rx.recv().await {
        let topic = envelope.topic.clone();
        let payload = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(topic = %topic, error = %e, "mqtt_bridge_serialize_failed");
                continue;
            }
        };

        match client.publish(&topic, qos, retain, payload).await {
            Ok(()) => {
                journal.append(JournalRecord {
                    id: 0,
                    topic: topic.clone(),
                    object: envelope.metadata.context.object.clone(),
                    line: envelope.metadata.context.line.clone(),
                    unit_id: envelope.metadata.context.unit_id,
                    register_type: envelope.metadata.context.register_type.clone(),
                    address: envelope.metadata.context.address,
                    param: envelope.metadata.context.param.clone(),
                    value: envelope.value.clone(),
                    code: envelope.metadata.status_code.code,
                    message: envelope.metadata.status_code.message.clone().unwrap_or_default(),
                    silent_for_s: envelope.metadata.silent_for_s,
                    ts: envelope.metadata.timestamp,
                });
            }
            Err(e) => {
                error!(topic = %topic, error = %e, "mqtt_bridge_publish_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_command_bare_string() {
        assert_eq!(decode_command_value(b"1"), Some("1".to_string()));
    }

    #[test]
    fn test_decode_command_value_object() {
        assert_eq!(decode_command_value(br#"{"value":"1"}"#), Some("1".to_string()));
    }

    #[test]
    fn test_decode_command_value_object_numeric() {
        assert_eq!(decode_command_value(br#"{"value":42}"#), Some("42".to_string()));
    }

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
    }
}
