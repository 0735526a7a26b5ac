//! # Modbus Transports
//!
//! The polling core only needs two operations from a transport: read a run
//! of input registers and write holding registers. [`ModbusTransport`] is
//! that seam. Connection handling, framing, checksums and timeouts all live
//! behind it.
//!
//! Implementations:
//! - [`tcp::TcpTransport`]: Modbus/TCP (MBAP header) over a TCP socket or gateway
//! - [`rtu::RtuTransport`]: Modbus RTU over a serial port
//! - [`mock::MockTransport`]: in-memory register image for tests

pub mod mock;
pub mod rtu;
pub mod tcp;

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};

use crate::error::TransportError;

pub use mock::MockTransport;
pub use rtu::RtuTransport;
pub use tcp::TcpTransport;

pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Largest run a single FC16 request can carry.
pub const MAX_WRITE_WORDS: u16 = 123;

/// A serially reusable Modbus client. One request is in flight at a time.
#[async_trait]
pub trait ModbusTransport: Send {
    /// Read `count` contiguous input registers starting at `address`.
    async fn read_input_registers(
        &mut self,
        address: u16,
        count: u16,
        unit: u8,
    ) -> Result<Vec<u16>, TransportError>;

    /// Write one holding register.
    async fn write_register(
        &mut self,
        address: u16,
        value: u16,
        unit: u8,
    ) -> Result<(), TransportError>;

    /// Write a run of holding registers. Falls back to single writes.
    async fn write_registers(
        &mut self,
        address: u16,
        values: &[u16],
        unit: u8,
    ) -> Result<(), TransportError> {
        for (offset, value) in values.iter().enumerate() {
            let offset = u16::try_from(offset)
                .map_err(|_| TransportError::InvalidResponse("write too long".into()))?;
            self.write_register(address.wrapping_add(offset), *value, unit)
                .await?;
        }
        Ok(())
    }

    /// Short human-readable name, e.g. `tcp:10.0.0.5:502`.
    fn describe(&self) -> String;

    /// Adjust the per-request timeout. Transports without one ignore it.
    fn set_timeout(&mut self, _timeout: Duration) {}
}

/// Request PDUs and response parsing shared by the TCP and RTU framings.
pub(crate) mod pdu {
    use super::*;

    pub fn read_input_registers(address: u16, count: u16) -> BytesMut {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(FC_READ_INPUT_REGISTERS);
        buf.put_u16(address);
        buf.put_u16(count);
        buf
    }

    pub fn write_single_register(address: u16, value: u16) -> BytesMut {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(FC_WRITE_SINGLE_REGISTER);
        buf.put_u16(address);
        buf.put_u16(value);
        buf
    }

    pub fn write_multiple_registers(
        address: u16,
        values: &[u16],
    ) -> Result<BytesMut, TransportError> {
        let count = match u16::try_from(values.len()) {
            Ok(count) if (1..=MAX_WRITE_WORDS).contains(&count) => count,
            _ => {
                return Err(TransportError::TooManyRegisters {
                    count: values.len(),
                    max: MAX_WRITE_WORDS,
                })
            }
        };
        let mut buf = BytesMut::with_capacity(6 + values.len() * 2);
        buf.put_u8(FC_WRITE_MULTIPLE_REGISTERS);
        buf.put_u16(address);
        buf.put_u16(count);
        // At most 246 bytes
        buf.put_u8((count * 2) as u8);
        values.iter().for_each(|v| buf.put_u16(*v));
        Ok(buf)
    }

    /// Check function code and exception flag of a response PDU.
    pub fn check_function(mut pdu: &[u8], function: u8) -> Result<&[u8], TransportError> {
        if pdu.is_empty() {
            return Err(TransportError::InvalidResponse("empty PDU".into()));
        }
        let fc = pdu.get_u8();
        if fc == function | 0x80 {
            let code = pdu.first().copied().unwrap_or(0);
            return Err(TransportError::Exception { function, code });
        }
        if fc != function {
            return Err(TransportError::InvalidResponse(format!(
                "function 0x{fc:02X}, expected 0x{function:02X}"
            )));
        }
        Ok(pdu)
    }

    pub fn parse_read_response(pdu: &[u8], count: u16) -> Result<Vec<u16>, TransportError> {
        let mut body = check_function(pdu, FC_READ_INPUT_REGISTERS)?;
        if body.is_empty() {
            return Err(TransportError::InvalidResponse("missing byte count".into()));
        }
        let byte_count = usize::from(body.get_u8());
        if byte_count != usize::from(count) * 2 || body.len() < byte_count {
            return Err(TransportError::InvalidResponse(format!(
                "byte count {byte_count} for {count} registers"
            )));
        }
        Ok((0..count).map(|_| body.get_u16()).collect())
    }

    /// Write responses echo address and value/quantity.
    pub fn parse_write_response(
        pdu: &[u8],
        function: u8,
        address: u16,
        second: u16,
    ) -> Result<(), TransportError> {
        let mut body = check_function(pdu, function)?;
        if body.len() < 4 {
            return Err(TransportError::InvalidResponse("short write response".into()));
        }
        let (echo_addr, echo_second) = (body.get_u16(), body.get_u16());
        if echo_addr != address || echo_second != second {
            return Err(TransportError::InvalidResponse(format!(
                "write echo 0x{echo_addr:04X}/{echo_second} for 0x{address:04X}/{second}"
            )));
        }
        Ok(())
    }
}
