//! Mock transport implementation for testing
//!
//! Holds an in-memory register image that reads and writes operate on, and
//! records every call so tests can assert on wire traffic without hardware.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{ModbusTransport, FC_READ_INPUT_REGISTERS};
use crate::error::TransportError;

/// One recorded transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Read { address: u16, count: u16, unit: u8 },
    Write { address: u16, values: Vec<u16>, unit: u8 },
}

#[derive(Default)]
struct MockState {
    registers: HashMap<(u8, u16), u16>,
    calls: Vec<TransportCall>,
    read_errors: VecDeque<TransportError>,
    write_errors: VecDeque<TransportError>,
    /// Addresses that accept writes but keep their old value
    sticky: HashSet<(u8, u16)>,
    /// Units that never answer
    absent: HashSet<u8>,
    /// Read start addresses answered with an illegal-address exception
    illegal: HashSet<(u8, u16)>,
    latency: Duration,
    timeout: Option<Duration>,
}

/// Mock Modbus transport; clones share the same state.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set one register of `unit`.
    pub fn set_register(&self, unit: u8, address: u16, value: u16) {
        self.state().registers.insert((unit, address), value);
    }

    /// Set consecutive registers of `unit` starting at `address`.
    pub fn set_registers(&self, unit: u8, address: u16, values: &[u16]) {
        let mut state = self.state();
        for (i, value) in values.iter().enumerate() {
            state
                .registers
                .insert((unit, address.wrapping_add(i as u16)), *value);
        }
    }

    pub fn register(&self, unit: u8, address: u16) -> u16 {
        self.state()
            .registers
            .get(&(unit, address))
            .copied()
            .unwrap_or(0)
    }

    /// Queue an error for the next read.
    pub fn fail_next_read(&self, error: TransportError) {
        self.state().read_errors.push_back(error);
    }

    /// Queue an error for the next write.
    pub fn fail_next_write(&self, error: TransportError) {
        self.state().write_errors.push_back(error);
    }

    /// Writes to this address succeed on the wire but are not applied.
    pub fn ignore_writes_to(&self, unit: u8, address: u16) {
        self.state().sticky.insert((unit, address));
    }

    /// Every request to `unit` times out.
    pub fn set_absent(&self, unit: u8) {
        self.state().absent.insert(unit);
    }

    pub fn set_present(&self, unit: u8) {
        self.state().absent.remove(&unit);
    }

    /// Reads starting at `address` fail with exception 0x02 until cleared.
    pub fn fail_reads_at(&self, unit: u8, address: u16) {
        self.state().illegal.insert((unit, address));
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.illegal.clear();
        state.read_errors.clear();
        state.write_errors.clear();
    }

    /// Simulated round-trip time for each call.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Last timeout handed to [`ModbusTransport::set_timeout`].
    pub fn timeout(&self) -> Option<Duration> {
        self.state().timeout
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state().calls.clone()
    }

    pub fn reads(&self) -> Vec<TransportCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, TransportCall::Read { .. }))
            .collect()
    }

    pub fn writes(&self) -> Vec<TransportCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, TransportCall::Write { .. }))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    async fn delay(&self) {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ModbusTransport for MockTransport {
    async fn read_input_registers(
        &mut self,
        address: u16,
        count: u16,
        unit: u8,
    ) -> Result<Vec<u16>, TransportError> {
        self.delay().await;
        let mut state = self.state();
        state.calls.push(TransportCall::Read { address, count, unit });
        if let Some(err) = state.read_errors.pop_front() {
            return Err(err);
        }
        if state.absent.contains(&unit) {
            return Err(TransportError::Timeout);
        }
        if state.illegal.contains(&(unit, address)) {
            return Err(TransportError::Exception {
                function: FC_READ_INPUT_REGISTERS,
                code: 0x02,
            });
        }
        Ok((0..count)
            .map(|i| {
                state
                    .registers
                    .get(&(unit, address.wrapping_add(i)))
                    .copied()
                    .unwrap_or(0)
            })
            .collect())
    }

    async fn write_register(
        &mut self,
        address: u16,
        value: u16,
        unit: u8,
    ) -> Result<(), TransportError> {
        self.write_registers(address, &[value], unit).await
    }

    async fn write_registers(
        &mut self,
        address: u16,
        values: &[u16],
        unit: u8,
    ) -> Result<(), TransportError> {
        self.delay().await;
        let mut state = self.state();
        state.calls.push(TransportCall::Write {
            address,
            values: values.to_vec(),
            unit,
        });
        if let Some(err) = state.write_errors.pop_front() {
            return Err(err);
        }
        if state.absent.contains(&unit) {
            return Err(TransportError::Timeout);
        }
        for (i, value) in values.iter().enumerate() {
            let key = (unit, address.wrapping_add(i as u16));
            if !state.sticky.contains(&key) {
                state.registers.insert(key, *value);
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.state().timeout = Some(timeout);
    }
}
