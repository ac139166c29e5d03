//! Transport trait for Modbus links - enables mock implementations for testing
//!
//! Grounded in the teacher crate's `GateCommand` trait/`MockGateController`
//! pattern (`services/gate.rs`): one trait at the I/O seam, one concrete
//! implementation per bus variant, one mock for tests.

use async_trait::async_trait;
use std::fmt;

/// Classified transport-level failure. The Bus Worker's classifier is the
/// only place that turns this into a stable `ErrorCode` (domain::types).
#[derive(Debug)]
pub enum TransportError {
    Timeout,
    Crc,
    /// A Modbus exception reply, carrying its exception code (1-6).
    Exception(u8),
    PortBusy,
    Io(std::io::Error),
    /// Malformed/unexpected frame that isn't a recognized exception.
    Protocol(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "timeout"),
            TransportError::Crc => write!(f, "crc mismatch"),
            TransportError::Exception(code) => write!(f, "modbus exception {code}"),
            TransportError::PortBusy => write!(f, "port busy"),
            TransportError::Io(e) => write!(f, "io error: {e}"),
            TransportError::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// A Modbus bus connection. Implementors guarantee per-transaction mutual
/// exclusion on the underlying link (SPEC_FULL.md §4.1).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn read_bits(
        &self,
        unit_id: u8,
        function_code: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError>;

    async fn read_registers(
        &self,
        unit_id: u8,
        function_code: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    async fn write_coil(&self, unit_id: u8, address: u16, value: bool) -> Result<(), TransportError>;

    async fn write_register(
        &self,
        unit_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError>;
}

/// In-memory transport for Bus Worker unit tests.
#[cfg(test)]
pub struct MockTransport {
    pub bits: parking_lot::Mutex<rustc_hash::FxHashMap<u16, bool>>,
    pub registers: parking_lot::Mutex<rustc_hash::FxHashMap<u16, u16>>,
    pub fail_next: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MockTransport {
    pub fn new() -> Self {
        Self {
            bits: parking_lot::Mutex::new(rustc_hash::FxHashMap::default()),
            registers: parking_lot::Mutex::new(rustc_hash::FxHashMap::default()),
            fail_next: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_register(&self, addr: u16, value: u16) {
        self.registers.lock().insert(addr, value);
    }

    pub fn set_bit(&self, addr: u16, value: bool) {
        self.bits.lock().insert(addr, value);
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for MockTransport {
    async fn read_bits(
        &self,
        _unit_id: u8,
        _function_code: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(TransportError::Timeout);
        }
        let bits = self.bits.lock();
        Ok((start..start + count).map(|a| *bits.get(&a).unwrap_or(&false)).collect())
    }

    async fn read_registers(
        &self,
        _unit_id: u8,
        _function_code: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(TransportError::Timeout);
        }
        let regs = self.registers.lock();
        Ok((start..start + count).map(|a| *regs.get(&a).unwrap_or(&0)).collect())
    }

    async fn write_coil(
        &self,
        _unit_id: u8,
        address: u16,
        value: bool,
    ) -> Result<(), TransportError> {
        self.bits.lock().insert(address, value);
        Ok(())
    }

    async fn write_register(
        &self,
        _unit_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        self.registers.lock().insert(address, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_read_write_register() {
        let t = MockTransport::new();
        t.write_register(1, 10, 42).await.unwrap();
        let v = t.read_registers(1, 3, 10, 1).await.unwrap();
        assert_eq!(v, vec![42]);
    }

    #[tokio::test]
    async fn test_mock_transport_fail_next() {
        let t = MockTransport::new();
        t.fail_next.store(true, std::sync::atomic::Ordering::SeqCst);
        let result = t.read_registers(1, 3, 0, 1).await;
        assert!(result.is_err());
    }
}
