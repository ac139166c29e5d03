//! Modbus RTU transport over a serial port.
//!
//! Frame layout: `[unit_id, function_code, payload..., crc_lo, crc_hi]`,
//! CRC16 (poly 0xA001, init 0xFFFF) over everything before the CRC bytes.
//! The persistent-buffer / resync-on-garbage reading technique is
//! grounded in the teacher's `io::rs485::Rs485Monitor` (`read_buffer`,
//! `synchronize_buffer`, `MAX_READ_ATTEMPTS`), generalized here from its
//! fixed door-status frame to a variable-length Modbus PDU.

use crate::domain::types::RegisterType;
use crate::io::transport::{Transport, TransportError};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio_serial::{SerialPort, SerialPortBuilderExt};
use tracing::{debug, info, warn};

const MAX_READ_ATTEMPTS: usize = 50;
const MAX_ADU_LEN: usize = 256;

pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn parity_from_str(parity: &str) -> tokio_serial::Parity {
    match parity {
        "E" => tokio_serial::Parity::Even,
        "O" => tokio_serial::Parity::Odd,
        _ => tokio_serial::Parity::None,
    }
}

fn stopbits_from_u8(stopbits: u8) -> tokio_serial::StopBits {
    match stopbits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}

struct PortState {
    port: Option<tokio_serial::SerialStream>,
    read_buffer: Vec<u8>,
    faulted_until: Option<Instant>,
}

pub struct SerialTransport {
    device: String,
    baudrate: u32,
    timeout: Duration,
    parity: tokio_serial::Parity,
    stopbits: tokio_serial::StopBits,
    rs485_rts_toggle: bool,
    echo: bool,
    port_retry_backoff: Duration,
    state: AsyncMutex<PortState>,
}

impl SerialTransport {
    pub fn new(
        device: &str,
        baudrate: u32,
        timeout_s: f64,
        parity: &str,
        stopbits: u8,
        rs485_rts_toggle: bool,
        echo: bool,
        port_retry_backoff_s: u64,
    ) -> Self {
        Self {
            device: device.to_string(),
            baudrate,
            timeout: Duration::from_secs_f64(timeout_s),
            parity: parity_from_str(parity),
            stopbits: stopbits_from_u8(stopbits),
            rs485_rts_toggle,
            echo,
            port_retry_backoff: Duration::from_secs(port_retry_backoff_s),
            state: AsyncMutex::new(PortState {
                port: None,
                read_buffer: Vec::with_capacity(64),
                faulted_until: None,
            }),
        }
    }

    async fn ensure_open(
        &self,
        state: &mut PortState,
    ) -> Result<&mut tokio_serial::SerialStream, TransportError> {
        if let Some(until) = state.faulted_until {
            if Instant::now() < until {
                return Err(TransportError::PortBusy);
            }
        }
        if state.port.is_none() {
            let builder = tokio_serial::new(&self.device, self.baudrate)
                .timeout(self.timeout)
                .parity(self.parity)
                .stop_bits(self.stopbits);
            match builder.open_native_async() {
                Ok(p) => {
                    info!(device = %self.device, "serial_port_opened");
                    state.port = Some(p);
                    state.faulted_until = None;
                }
                Err(e) => {
                    warn!(device = %self.device, error = %e, "serial_port_open_failed");
                    state.faulted_until = Some(Instant::now() + self.port_retry_backoff);
                    return Err(TransportError::Io(std::io::Error::new(ErrorKind::NotConnected, e)));
                }
            }
        }
        Ok(state.port.as_mut().expect("port ensured open above"))
    }

    /// Sends a request PDU (unit id + function code + payload) and reads
    /// back a validated response, applying CRC framing both ways.
    async fn transact(&self, unit_id: u8, pdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock().await;

        let mut frame = Vec::with_capacity(pdu.len() + 3);
        frame.push(unit_id);
        frame.extend_from_slice(pdu);
        let crc = crc16(&frame);
        frame.push((crc & 0xFF) as u8);
        frame.push((crc >> 8) as u8);

        let timeout = self.timeout;
        let echo = self.echo;
        let rs485 = self.rs485_rts_toggle;
        let port = self.ensure_open(&mut state).await?;

        // rts_level_for_tx=true, rts_level_for_rx=false: RTS high only while transmitting.
        if rs485 {
            if let Err(e) = port.write_request_to_send(true) {
                warn!(device = %self.device, error = %e, "serial_rts_assert_failed");
            }
        }

        let write_result = port.write_all(&frame).await;

        if rs485 {
            if let Err(e) = port.write_request_to_send(false) {
                warn!(device = %self.device, error = %e, "serial_rts_deassert_failed");
            }
        }

        if let Err(e) = write_result {
            state.port = None;
            return Err(e.into());
        }

        if echo {
            // Half-duplex echo suppression: drain exactly what we wrote.
            let mut drained = 0;
            let mut drain_buf = [0u8; MAX_ADU_LEN];
            while drained < frame.len() {
                match tokio::time::timeout(timeout, port.read(&mut drain_buf)).await {
                    Ok(Ok(n)) if n > 0 => drained += n,
                    _ => break,
                }
            }
        }

        let response = Self::read_frame(port, &mut state.read_buffer, timeout).await?;
        state.read_buffer.clear();
        Self::validate_frame(unit_id, pdu[0], &response)
    }

    async fn read_frame(
        port: &mut tokio_serial::SerialStream,
        buffer: &mut Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut attempts = 0;
        let mut temp_buf = [0u8; 64];

        loop {
            // A minimal RTU ADU is unit_id + function + 2 CRC bytes = 4 bytes,
            // but exception replies are exactly 5 bytes; wait for at least
            // that much before attempting to parse.
            if buffer.len() >= 5 {
                if let Some(frame) = Self::try_extract(buffer) {
                    return Ok(frame);
                }
            }

            attempts += 1;
            if attempts > MAX_READ_ATTEMPTS {
                debug!(attempts = MAX_READ_ATTEMPTS, "serial_max_read_attempts");
                return Err(TransportError::Timeout);
            }

            match tokio::time::timeout(timeout, port.read(&mut temp_buf)).await {
                Ok(Ok(n)) if n > 0 => buffer.extend_from_slice(&temp_buf[..n]),
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(TransportError::Timeout),
            }
        }
    }

    /// Tries to find a complete, CRC-valid frame in the buffer. RTU has no
    /// length prefix, so we try the shortest plausible frame first
    /// (exception reply, 5 bytes) and grow until CRC validates or we run
    /// out of buffered bytes.
    fn try_extract(buffer: &[u8]) -> Option<Vec<u8>> {
        for len in 5..=buffer.len().min(MAX_ADU_LEN) {
            let candidate = &buffer[..len];
            let (body, crc_bytes) = candidate.split_at(len - 2);
            let expected = crc16(body);
            let actual = (crc_bytes[1] as u16) << 8 | crc_bytes[0] as u16;
            if expected == actual {
                return Some(candidate.to_vec());
            }
        }
        None
    }

    fn validate_frame(
        expected_unit: u8,
        request_fc: u8,
        frame: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        if frame.len() < 5 {
            return Err(TransportError::Protocol("short frame".to_string()));
        }
        if frame[0] != expected_unit {
            return Err(TransportError::Protocol("unit id mismatch".to_string()));
        }
        let fc = frame[1];
        if fc == request_fc | 0x80 {
            return Err(TransportError::Exception(frame[2]));
        }
        if fc != request_fc {
            return Err(TransportError::Protocol(format!("unexpected function code {fc}")));
        }
        Ok(frame[2..frame.len() - 2].to_vec())
    }
}

#[async_trait]
impl Transport for SerialTransport {
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
        let pdu = [
            RegisterType::Coil.read_function_code() + 4, // FC 5
            (address >> 8) as u8,
            (address & 0xFF) as u8,
            (coil_value >> 8) as u8,
            (coil_value & 0xFF) as u8,
        ];
        self.transact(unit_id, &pdu).await?;
        Ok(())
    }

    async fn write_register(
        &self,
        unit_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        let pdu = [
            6, // FC 6: write single holding register
            (address >> 8) as u8,
            (address & 0xFF) as u8,
            (value >> 8) as u8,
            (value & 0xFF) as u8,
        ];
        self.transact(unit_id, &pdu).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_vector() {
        // Standard Modbus RTU example: 01 03 00 00 00 0A -> CRC 0xCDC5 (C5 CD on wire)
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A];
        assert_eq!(crc16(&frame), 0xCDC5);
    }

    #[test]
    fn test_try_extract_valid_frame() {
        let body = [0x01, 0x03, 0x02, 0x00, 0x2A];
        let crc = crc16(&body);
        let mut buf = body.to_vec();
        buf.push((crc & 0xFF) as u8);
        buf.push((crc >> 8) as u8);

        let extracted = SerialTransport::try_extract(&buf).unwrap();
        assert_eq!(extracted, buf);
    }

    #[test]
    fn test_validate_frame_exception() {
        let frame = vec![0x01, 0x83, 0x02, 0x00, 0x00];
        let result = SerialTransport::validate_frame(0x01, 0x03, &frame);
        assert!(matches!(result, Err(TransportError::Exception(2))));
    }

    #[test]
    fn test_validate_frame_unit_mismatch() {
        let frame = vec![0x02, 0x03, 0x02, 0x00, 0x2A, 0x00, 0x00];
        let result = SerialTransport::validate_frame(0x01, 0x03, &frame);
        assert!(result.is_err());
    }
}
