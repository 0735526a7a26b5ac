//! # Service Configuration
//!
//! JSON file listing the transports to scan and the polling policy:
//!
//! ```json
//! {
//!   "devices": [
//!     { "transport": { "type": "tcp", "host": "10.0.0.5" }, "units": [1, 2] },
//!     { "transport": { "type": "rtu", "port": "/dev/ttyUSB0", "baudrate": 9600 } }
//!   ],
//!   "poll_interval_ms": 1000,
//!   "settings_path": "/data/modmeter-settings.json"
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MeterError, TransportError};
use crate::transport::rtu::RtuConfig;
use crate::transport::{ModbusTransport, RtuTransport, TcpTransport};

pub const DEFAULT_TCP_PORT: u16 = 502;
pub const DEFAULT_BAUDRATE: u32 = 9600;
pub const MAX_UNIT: u8 = 247;

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_baudrate() -> u32 {
    DEFAULT_BAUDRATE
}

fn default_units() -> Vec<u8> {
    vec![1]
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_failures() -> u32 {
    3
}

fn default_rescan_interval_ms() -> u64 {
    60_000
}

fn default_timeout_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportSpec {
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
    Rtu {
        port: String,
        #[serde(default = "default_baudrate")]
        baudrate: u32,
        #[serde(default)]
        parity: Parity,
    },
}

impl TransportSpec {
    pub fn describe(&self) -> String {
        match self {
            TransportSpec::Tcp { host, port } => format!("tcp:{host}:{port}"),
            TransportSpec::Rtu { port, .. } => format!("rtu:{port}"),
        }
    }

    /// Connect or open the port.
    pub async fn open(&self, timeout: Duration) -> Result<Box<dyn ModbusTransport>, TransportError> {
        match self {
            TransportSpec::Tcp { host, port } => {
                let transport = TcpTransport::connect(&format!("{host}:{port}"), timeout).await?;
                Ok(Box::new(transport))
            }
            TransportSpec::Rtu {
                port,
                baudrate,
                parity,
            } => {
                let config = RtuConfig {
                    baudrate: *baudrate,
                    parity: (*parity).into(),
                    timeout,
                };
                Ok(Box::new(RtuTransport::open(port, config)?))
            }
        }
    }
}

/// One transport and the unit ids to probe on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub transport: TransportSpec,
    #[serde(default = "default_units")]
    pub units: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub devices: Vec<DeviceSpec>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Consecutive failed cycles before a meter is dropped.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_rescan_interval_ms")]
    pub rescan_interval_ms: u64,
    /// Initial transport timeout, before latency tuning takes over.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_path: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            devices: Vec::new(),
            poll_interval_ms: default_poll_interval_ms(),
            max_failures: default_max_failures(),
            rescan_interval_ms: default_rescan_interval_ms(),
            timeout_ms: default_timeout_ms(),
            settings_path: None,
        }
    }
}

impl ServiceConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MeterError> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, MeterError> {
        let config: ServiceConfig =
            serde_json::from_str(text).map_err(|e| MeterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MeterError> {
        if self.devices.is_empty() {
            return Err(MeterError::Config("no devices configured".into()));
        }
        for device in &self.devices {
            let name = device.transport.describe();
            if device.units.is_empty() {
                return Err(MeterError::Config(format!("{name}: empty unit list")));
            }
            if let Some(unit) = device.units.iter().find(|u| !(1..=MAX_UNIT).contains(*u)) {
                return Err(MeterError::Config(format!(
                    "{name}: unit {unit} outside 1..={MAX_UNIT}"
                )));
            }
        }
        if self.poll_interval_ms == 0 || self.rescan_interval_ms == 0 || self.timeout_ms == 0 {
            return Err(MeterError::Config("intervals must be non-zero".into()));
        }
        if self.max_failures == 0 {
            return Err(MeterError::Config("max_failures must be at least 1".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
