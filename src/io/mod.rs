//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `transport` - transport trait + error taxonomy shared by RTU/TCP
//! - `serial_transport` - Modbus RTU over a serial port (CRC16 framing)
//! - `tcp_transport` - Modbus TCP over a plain socket (MBAP framing)
//! - `planner` - groups a node's parameters into batched reads
//! - `mqtt_bridge` - outbound envelope publisher + command registry
//! - `journal` - in-memory bounded telemetry journal

pub mod journal;
pub mod mqtt_bridge;
pub mod planner;
pub mod serial_transport;
pub mod tcp_transport;
pub mod transport;

// Re-export commonly used types
pub use journal::{Journal, JournalRecord};
pub use mqtt_bridge::{Command, CommandHandler, MqttBridge};
pub use planner::{Plan, PlannedMember, PlannedRead, PlannerRejection, plan_node_reads};
pub use serial_transport::SerialTransport;
pub use tcp_transport::TcpTransport;
pub use transport::{Transport, TransportError};

#[cfg(test)]
pub use transport::MockTransport;
