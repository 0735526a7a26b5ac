//! Modbus RTU client over a serial port.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use log::{debug, trace};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::{
    pdu, ModbusTransport, FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_REGISTER,
};
use crate::error::TransportError;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Serial line parameters.
#[derive(Debug, Clone)]
pub struct RtuConfig {
    pub baudrate: u32,
    pub parity: tokio_serial::Parity,
    pub timeout: Duration,
}

impl Default for RtuConfig {
    fn default() -> Self {
        RtuConfig {
            baudrate: 9600,
            parity: tokio_serial::Parity::None,
            timeout: Duration::from_millis(500),
        }
    }
}

pub struct RtuTransport {
    port: SerialStream,
    name: String,
    config: RtuConfig,
}

impl RtuTransport {
    pub fn open(port_name: &str, config: RtuConfig) -> Result<Self, TransportError> {
        let port = tokio_serial::new(port_name, config.baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(config.parity)
            .timeout(config.timeout)
            .open_native_async()
            .map_err(|e| TransportError::Io(e.into()))?;
        debug!("Opened {port_name} at {} baud", config.baudrate);
        Ok(RtuTransport {
            port,
            name: port_name.to_string(),
            config,
        })
    }

    async fn request(&mut self, unit: u8, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let frame = encode_frame(unit, request);
        trace!("TX {}", hex::encode(&frame));

        let function = request.first().copied().unwrap_or(0);
        let response = timeout(self.config.timeout, async {
            self.port.write_all(&frame).await?;
            self.port.flush().await?;
            Ok::<_, TransportError>(read_frame(&mut self.port, function).await?)
        })
        .await
        .map_err(|_| TransportError::Timeout)??;
        trace!("RX {}", hex::encode(&response));

        decode_frame(&response, unit).map(<[u8]>::to_vec)
    }
}

/// Append unit address and CRC (low byte first) to a PDU.
pub fn encode_frame(unit: u8, pdu: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(pdu.len() + 3);
    frame.put_u8(unit);
    frame.put_slice(pdu);
    let crc = MODBUS_CRC.checksum(&frame);
    frame.put_u16_le(crc);
    frame
}

/// Verify address and CRC, returning the PDU.
pub fn decode_frame(frame: &[u8], unit: u8) -> Result<&[u8], TransportError> {
    if frame.len() < 4 {
        return Err(TransportError::InvalidResponse("short RTU frame".into()));
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    let expected = MODBUS_CRC.checksum(body);
    if received != expected {
        return Err(TransportError::Crc { expected, received });
    }
    if body[0] != unit {
        return Err(TransportError::InvalidResponse(format!(
            "response from unit {}, expected {unit}",
            body[0]
        )));
    }
    Ok(&body[1..])
}

/// RTU has no length prefix; the frame length follows from the function code.
async fn read_frame(port: &mut SerialStream, function: u8) -> Result<Vec<u8>, TransportError> {
    let mut frame = vec![0u8; 2];
    port.read_exact(&mut frame).await?;

    let remaining = if frame[1] & 0x80 != 0 {
        // exception code + CRC
        3
    } else {
        match function {
            FC_READ_INPUT_REGISTERS => {
                let mut count = [0u8; 1];
                port.read_exact(&mut count).await?;
                frame.push(count[0]);
                usize::from(count[0]) + 2
            }
            FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_REGISTERS => 6,
            other => {
                return Err(TransportError::InvalidResponse(format!(
                    "unsupported function 0x{other:02X}"
                )))
            }
        }
    };

    let start = frame.len();
    frame.resize(start + remaining, 0);
    port.read_exact(&mut frame[start..]).await?;
    Ok(frame)
}

#[async_trait]
impl ModbusTransport for RtuTransport {
    async fn read_input_registers(
        &mut self,
        address: u16,
        count: u16,
        unit: u8,
    ) -> Result<Vec<u16>, TransportError> {
        let response = self
            .request(unit, &pdu::read_input_registers(address, count))
            .await?;
        pdu::parse_read_response(&response, count)
    }

    async fn write_register(
        &mut self,
        address: u16,
        value: u16,
        unit: u8,
    ) -> Result<(), TransportError> {
        let response = self
            .request(unit, &pdu::write_single_register(address, value))
            .await?;
        pdu::parse_write_response(&response, FC_WRITE_SINGLE_REGISTER, address, value)
    }

    async fn write_registers(
        &mut self,
        address: u16,
        values: &[u16],
        unit: u8,
    ) -> Result<(), TransportError> {
        let request = pdu::write_multiple_registers(address, values)?;
        let response = self.request(unit, &request).await?;
        pdu::parse_write_response(
            &response,
            FC_WRITE_MULTIPLE_REGISTERS,
            address,
            values.len() as u16,
        )
    }

    fn describe(&self) -> String {
        format!("rtu:{}", self.name)
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }
}
