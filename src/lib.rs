//! # modmeter-rs - Model Probing and Register Polling for Modbus Energy Meters
//!
//! The modmeter-rs crate identifies Modbus energy meters by a model register,
//! builds the register map for the detected model and phase configuration,
//! and keeps the decoded values fresh with as few reads as possible.
//!
//! ## Features
//!
//! - Register descriptors for 16/32/64-bit integers, floats, packed text and mapped codes
//! - Big- and little-endian word order, scaling and fixed-precision display
//! - One coalesced read per due batch per polling cycle
//! - Probing across meter families in a fixed order (Carlo Gavazzi, Eastron, ABB)
//! - Post-probe initialisation writes with read-back verification
//! - Modbus/TCP and RTU transports, plus an in-memory mock for tests
//! - A service loop with offline detection, rescans and inbound writes
//!
//! ## Usage
//!
//! ```rust,no_run
//! use modmeter_rs::{init_logger, DiagContext, Meter, ProbeRegistry, TcpTransport};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), modmeter_rs::MeterError> {
//! init_logger();
//! let mut transport = TcpTransport::connect("10.0.0.5:502", Duration::from_secs(1)).await?;
//! let found = ProbeRegistry::global().probe(&mut transport, 1).await?;
//! let mut meter = Meter::new(found, DiagContext::new("tcp:10.0.0.5:1"));
//! meter.init(&mut transport).await?;
//! for update in meter.update(&mut transport).await?.updates {
//!     println!("{} = {:?}", update.path, update.value);
//! }
//! # Ok(())
//! # }
//! ```

pub mod coalesce;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod poll;
pub mod probe;
pub mod publish;
pub mod register;
pub mod service;
pub mod transport;
pub mod util;
pub mod vendors;

pub use crate::error::{DecodeError, EncodeError, MeterError, ProbeError, TransportError};
pub use crate::logging::{init_logger, log_info, DiagContext, DiagnosticSink, LogSink};

// Core types
pub use coalesce::{coalesce, group_registers, ReadSpan, MAX_READ_WORDS};
pub use device::{DeviceHandler, DeviceInfo, InfoMap, Meter, MeterState, WriteOutcome};
pub use poll::{CycleOutcome, PollEngine, PollState, ValueUpdate};
pub use probe::{ModelEntry, ModelInfo, ModelProber, ProbeMatch, ProbeRegistry};
pub use register::{
    DisplayFormat, FormattedValue, Register, RegisterKind, RegisterSet, RegisterValue, WordOrder,
};

// Runtime
pub use config::{DeviceSpec, ServiceConfig, TransportSpec};
pub use device::{DeviceSettings, MeterRole, SettingsStore};
pub use publish::{LogPublisher, MemoryPublisher, Publisher};
pub use service::{MeterService, ServiceCommand, SettingsChange, WriteRequest};
pub use transport::{MockTransport, ModbusTransport, RtuTransport, TcpTransport};
