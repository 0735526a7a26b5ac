//! Modbus/TCP client, usable directly or through a TCP-to-RTU gateway.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use log::{debug, trace};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{pdu, ModbusTransport, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER};
use crate::error::TransportError;

const MBAP_HEADER_LEN: usize = 7;

pub struct TcpTransport {
    stream: Option<TcpStream>,
    addr: String,
    timeout: Duration,
    transaction: u16,
}

impl TcpTransport {
    pub async fn connect(addr: &str, timeout_after: Duration) -> Result<Self, TransportError> {
        let stream = timeout(timeout_after, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;
        debug!("Connected to Modbus/TCP endpoint {addr}");
        Ok(TcpTransport {
            stream: Some(stream),
            addr: addr.to_string(),
            timeout: timeout_after,
            transaction: 0,
        })
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        let stream = timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn request(&mut self, unit: u8, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        if self.stream.is_none() {
            self.reconnect().await?;
        }
        self.transaction = self.transaction.wrapping_add(1);
        let transaction = self.transaction;

        let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + request.len());
        frame.put_u16(transaction);
        frame.put_u16(0);
        frame.put_u16((request.len() + 1) as u16);
        frame.put_u8(unit);
        frame.put_slice(request);
        trace!("TX {}", hex::encode(&frame));

        let result = timeout(self.timeout, Self::exchange(&mut self.stream, &frame)).await;
        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                // Drop the socket; the next request reconnects
                self.stream = None;
                return Err(e);
            }
            Err(_) => {
                self.stream = None;
                return Err(TransportError::Timeout);
            }
        };
        trace!("RX {}", hex::encode(&response));

        let mut header = &response[..MBAP_HEADER_LEN];
        let (rx_transaction, protocol, _len, rx_unit) =
            (header.get_u16(), header.get_u16(), header.get_u16(), header.get_u8());
        if rx_transaction != transaction || protocol != 0 || rx_unit != unit {
            self.stream = None;
            return Err(TransportError::InvalidResponse(format!(
                "MBAP mismatch: transaction {rx_transaction}/{transaction}, unit {rx_unit}/{unit}"
            )));
        }
        Ok(response[MBAP_HEADER_LEN..].to_vec())
    }

    async fn exchange(stream: &mut Option<TcpStream>, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let stream = stream.as_mut().ok_or(TransportError::NotConnected)?;
        stream.write_all(frame).await?;
        stream.flush().await?;

        let mut header = [0u8; MBAP_HEADER_LEN];
        stream.read_exact(&mut header).await?;
        let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
        if !(2..=254).contains(&length) {
            return Err(TransportError::InvalidResponse(format!("MBAP length {length}")));
        }
        let mut response = vec![0u8; MBAP_HEADER_LEN + length - 1];
        response[..MBAP_HEADER_LEN].copy_from_slice(&header);
        stream.read_exact(&mut response[MBAP_HEADER_LEN..]).await?;
        Ok(response)
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
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
        format!("tcp:{}", self.addr)
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}
