//! Modbus TCP transport (MBAP framing) over a plain TCP socket.
//!
//! Frame layout: `[transaction_id:u16, protocol_id:u16=0, length:u16,
//! unit_id:u8, pdu...]`. No teacher precedent exists for a TCP Modbus
//! client; the connection-lifecycle shape (lazy connect, fault/backoff,
//! single-transaction lock) mirrors `io::serial_transport`/the teacher's
//! `io::rs485` port lifecycle, applied to a `TcpStream` instead of a
//! serial port (see DESIGN.md Open Question 4).

use crate::io::transport::{Transport, TransportError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

struct ConnState {
    stream: Option<TcpStream>,
    faulted_until: Option<Instant>,
}

pub struct TcpTransport {
    host: String,
    port: u16,
    timeout: Duration,
    port_retry_backoff: Duration,
    next_transaction_id: AtomicU16,
    state: AsyncMutex<ConnState>,
}

impl TcpTransport {
    pub fn new(host: &str, port: u16, timeout_s: f64, port_retry_backoff_s: u64) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout: Duration::from_secs_f64(timeout_s),
            port_retry_backoff: Duration::from_secs(port_retry_backoff_s),
            next_transaction_id: AtomicU16::new(1),
            state: AsyncMutex::new(ConnState { stream: None, faulted_until: None }),
        }
    }

    async fn ensure_connected<'a>(
        &self,
        state: &'a mut ConnState,
    ) -> Result<&'a mut TcpStream, TransportError> {
        if let Some(until) = state.faulted_until {
            if Instant::now() < until {
                return Err(TransportError::PortBusy);
            }
        }
        if state.stream.is_none() {
            let addr = format!("{}:{}", self.host, self.port);
            match tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => {
                    info!(addr = %addr, "tcp_transport_connected");
                    state.stream = Some(stream);
                    state.faulted_until = None;
                }
                Ok(Err(e)) => {
                    warn!(addr = %addr, error = %e, "tcp_transport_connect_failed");
                    state.faulted_until = Some(Instant::now() + self.port_retry_backoff);
                    return Err(e.into());
                }
                Err(_) => {
                    warn!(addr = %addr, "tcp_transport_connect_timeout");
                    state.faulted_until = Some(Instant::now() + self.port_retry_backoff);
                    return Err(TransportError::Timeout);
                }
            }
        }
        Ok(state.stream.as_mut().expect("stream ensured open above"))
    }

    async fn transact(&self, unit_id: u8, pdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock().await;
        let transaction_id = self.next_transaction_id.fetch_add(1, Ordering::Relaxed);
        let timeout = self.timeout;

        let mut request = Vec::with_capacity(7 + pdu.len());
        request.extend_from_slice(&transaction_id.to_be_bytes());
        request.extend_from_slice(&0u16.to_be_bytes()); // protocol id
        let length = (pdu.len() + 1) as u16;
        request.extend_from_slice(&length.to_be_bytes());
        request.push(unit_id);
        request.extend_from_slice(pdu);

        let stream = self.ensure_connected(&mut state).await?;
        if let Err(e) = stream.write_all(&request).await {
            state.stream = None;
            return Err(e.into());
        }

        let mut header = [0u8; 7];
        match tokio::time::timeout(timeout, stream.read_exact(&mut header)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                state.stream = None;
                return Err(e.into());
            }
            Err(_) => {
                state.stream = None;
                return Err(TransportError::Timeout);
            }
        }

        let resp_transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let resp_length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let resp_unit_id = header[6];

        if resp_transaction_id != transaction_id {
            return Err(TransportError::Protocol("transaction id mismatch".to_string()));
        }
        if resp_unit_id != unit_id {
            return Err(TransportError::Protocol("unit id mismatch".to_string()));
        }
        if resp_length == 0 {
            return Err(TransportError::Protocol("zero length MBAP frame".to_string()));
        }

        let mut body = vec![0u8; resp_length - 1];
        match tokio::time::timeout(timeout, stream.read_exact(&mut body)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                state.stream = None;
                return Err(e.into());
            }
            Err(_) => {
                state.stream = None;
                return Err(TransportError::Timeout);
            }
        }

        let function_code = pdu[0];
        if body[0] == function_code | 0x80 {
            return Err(TransportError::Exception(body[1]));
        }
        if body[0] != function_code {
            return Err(TransportError::Protocol(format!("unexpected function code {}", body[0])));
        }
        Ok(body[1..].to_vec())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn read_bits(
        &self,
        unit_id: u8,
        function_code: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        let pdu = [
            function_code,
            (start >> 8) as u8,
            (start & 0xFF) as u8,
            (count >> 8) as u8,
            (count & 0xFF) as u8,
        ];
        let body = self.transact(unit_id, &pdu).await?;
        let byte_count = *body.first().ok_or(TransportError::Protocol("empty body".to_string()))? as usize;
        let bytes = body.get(1..1 + byte_count).ok_or(TransportError::Protocol("short bits payload".to_string()))?;
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let byte = bytes[i / 8];
            out.push((byte >> (i % 8)) & 1 == 1);
        }
        Ok(out)
    }

    async fn read_registers(
        &self,
        unit_id: u8,
        function_code: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let pdu = [
            function_code,
            (start >> 8) as u8,
            (start & 0xFF) as u8,
            (count >> 8) as u8,
            (count & 0xFF) as u8,
        ];
        let body = self.transact(unit_id, &pdu).await?;
        let byte_count = *body.first().ok_or(TransportError::Protocol("empty body".to_string()))? as usize;
        let bytes = body.get(1..1 + byte_count).ok_or(TransportError::Protocol("short regs payload".to_string()))?;
        Ok(bytes.chunks_exact(2).map(|c| (c[0] as u16) << 8 | c[1] as u16).collect())
    }

    async fn write_coil(&self, unit_id: u8, address: u16, value: bool) -> Result<(), TransportError> {
        let coil_value: u16 = if value { 0xFF00 } else { 0x0000 };
        let pdu =
            [5, (address >> 8) as u8, (address & 0xFF) as u8, (coil_value >> 8) as u8, (coil_value & 0xFF) as u8];
        self.transact(unit_id, &pdu).await?;
        Ok(())
    }

    async fn write_register(
        &self,
        unit_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        let pdu = [6, (address >> 8) as u8, (address & 0xFF) as u8, (value >> 8) as u8, (value & 0xFF) as u8];
        self.transact(unit_id, &pdu).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_increments() {
        let t = TcpTransport::new("127.0.0.1", 502, 1.0, 5);
        let a = t.next_transaction_id.fetch_add(1, Ordering::Relaxed);
        let b = t.next_transaction_id.fetch_add(1, Ordering::Relaxed);
        assert_eq!(b, a + 1);
    }
}
