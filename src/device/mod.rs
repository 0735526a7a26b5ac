//! # Device Handlers and the Meter Runtime
//!
//! A [`DeviceHandler`] is the per-family knowledge: which info registers to
//! read after a model match, how the phase configuration maps to a phase
//! count, which data registers to poll, and any initialisation writes the
//! meter needs. One implementation exists per meter family (see
//! [`crate::vendors`]).
//!
//! A [`Meter`] runs a handler against a transport:
//!
//! ```text
//! Probed --init()--> Active --write() on a configuration path--> init() again
//!    \                 |
//!     \--fatal error-->+--> Failed (terminal)
//! ```
//!
//! Register state lives in two [`RegisterSet`] arenas owned by the meter and
//! is only changed by the [`PollEngine`].

pub mod latency;
pub mod settings;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{DecodeError, EncodeError, MeterError};
use crate::logging::DiagContext;
use crate::poll::{CycleOutcome, PollEngine};
use crate::probe::{ModelInfo, ProbeMatch};
use crate::register::{FormattedValue, Register, RegisterKind, RegisterSet, RegisterValue};
use crate::transport::ModbusTransport;

pub use latency::LatencyFilter;
pub use settings::{DeviceSettings, MeterRole, SettingsStore};

/// Publication paths shared by every family.
pub mod paths {
    pub const HARDWARE_VERSION: &str = "/HardwareVersion";
    pub const FIRMWARE_VERSION: &str = "/FirmwareVersion";
    pub const PHASE_CONFIG: &str = "/PhaseConfig";
    pub const SERIAL: &str = "/Serial";
    pub const PHASE_SEQUENCE: &str = "/PhaseSequence";

    /// `/Ac/L<n>/<leaf>`
    pub fn phase(n: u8, leaf: &str) -> String {
        format!("/Ac/L{n}/{leaf}")
    }
}

/// Decoded info registers by path. Registers that failed to decode are
/// absent from the values and keep their error instead.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfoMap {
    values: BTreeMap<String, RegisterValue>,
    errors: BTreeMap<String, DecodeError>,
}

impl InfoMap {
    pub fn from_registers(set: &RegisterSet) -> Self {
        let mut info = InfoMap::default();
        for reg in set.iter() {
            if let Some(value) = reg.value() {
                info.values.insert(reg.path.clone(), value.clone());
            } else if let Some(err) = reg.decode_error() {
                info.errors.insert(reg.path.clone(), err.clone());
            }
        }
        info
    }

    /// Value at `path`, or a non-fatal decode error naming why it is absent.
    pub fn require(&self, path: &str) -> Result<&RegisterValue, MeterError> {
        self.values.get(path).ok_or_else(|| MeterError::Decode {
            path: path.to_string(),
            source: self.errors.get(path).cloned().unwrap_or(DecodeError::Missing),
        })
    }

    pub fn insert(&mut self, path: impl Into<String>, value: RegisterValue) {
        let path = path.into();
        self.errors.remove(&path);
        self.values.insert(path, value);
    }

    pub fn get(&self, path: &str) -> Option<&RegisterValue> {
        self.values.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RegisterValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Family-specific behaviour of a meter.
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    fn product_name(&self) -> &str;

    fn product_id(&self) -> u16;

    /// Lower bound for the transport timeout.
    fn min_timeout(&self) -> Duration {
        Duration::from_millis(500)
    }

    /// Registers read once after the model match.
    fn info_registers(&self) -> Vec<Register>;

    /// Number of phases for the decoded info. Unknown configurations are fatal.
    fn phase_count(&self, info: &InfoMap) -> Result<u8, MeterError>;

    /// Registers polled regardless of the phase count.
    fn fixed_registers(&self, phases: u8) -> Vec<Register>;

    /// Registers of phase `n`, counting from 1.
    fn phase_registers(&self, n: u8) -> Vec<Register>;

    /// Fixed registers followed by the registers of phases `1..=phases`.
    fn build_data_registers(&self, phases: u8) -> Vec<Register> {
        let mut regs = self.fixed_registers(phases);
        for n in 1..=phases {
            regs.extend(self.phase_registers(n));
        }
        regs
    }

    /// Writes needed before the first data poll.
    async fn post_probe_init(
        &self,
        _transport: &mut dyn ModbusTransport,
        _unit: u8,
        _ctx: &DiagContext,
    ) -> Result<(), MeterError> {
        Ok(())
    }

    /// Writes to these paths change the register layout and force a re-init.
    fn is_configuration_path(&self, path: &str) -> bool {
        path == paths::PHASE_CONFIG
    }

    /// Stable identity derived from the serial number. An unreadable serial
    /// is a decode error, so the meter can be initialised again later.
    fn ident(&self, info: &InfoMap) -> Result<String, MeterError> {
        let serial = info.require(paths::SERIAL)?.to_string();
        if serial.is_empty() {
            return Err(MeterError::Decode {
                path: paths::SERIAL.to_string(),
                source: DecodeError::InvalidText,
            });
        }
        Ok(format!("cg_{serial}"))
    }
}

/// Phase count looked up by the raw phase-configuration code.
///
/// Only a code the table does not cover is fatal; an unreadable register is
/// reported as a decode error.
pub fn phases_from_table(info: &InfoMap, table: &[u8]) -> Result<u8, MeterError> {
    let code = info
        .require(paths::PHASE_CONFIG)?
        .as_code()
        .ok_or_else(|| MeterError::Decode {
            path: paths::PHASE_CONFIG.to_string(),
            source: DecodeError::NotNumeric,
        })?;
    match table.get(code) {
        Some(&phases) if phases > 0 => Ok(phases),
        _ => Err(MeterError::Configuration(format!(
            "unsupported phase configuration {code}"
        ))),
    }
}

/// Read and decode one register outside the polling engine.
pub async fn read_register(
    transport: &mut dyn ModbusTransport,
    unit: u8,
    reg: &Register,
) -> Result<RegisterValue, MeterError> {
    let words = transport
        .read_input_registers(reg.base, reg.word_count(), unit)
        .await?;
    reg.decode_words(&words).map_err(|source| MeterError::Decode {
        path: reg.path.clone(),
        source,
    })
}

/// Range-check, encode and write `value`. Nothing is sent if validation fails.
pub async fn write_register(
    transport: &mut dyn ModbusTransport,
    unit: u8,
    reg: &Register,
    value: f64,
) -> Result<(), MeterError> {
    let words = reg.encode_value(value).map_err(|source| match source {
        EncodeError::OutOfRange { value, min, max } => MeterError::Range {
            path: reg.path.clone(),
            value,
            min,
            max,
        },
        EncodeError::NotWritable => MeterError::ReadOnly(reg.path.clone()),
        source => MeterError::Encode {
            path: reg.path.clone(),
            source,
        },
    })?;
    send_words(transport, unit, reg.base, &words).await
}

/// Single-register writes use FC06, longer runs FC16.
async fn send_words(
    transport: &mut dyn ModbusTransport,
    unit: u8,
    address: u16,
    words: &[u16],
) -> Result<(), MeterError> {
    match words {
        [word] => transport.write_register(address, *word, unit).await?,
        words => transport.write_registers(address, words, unit).await?,
    }
    Ok(())
}

/// Whether a read-back value equals what was written, within encoding resolution.
pub fn readback_matches(reg: &Register, value: f64, readback: &RegisterValue) -> bool {
    let Some(actual) = readback.as_f64() else {
        return false;
    };
    let tolerance = match reg.kind {
        RegisterKind::F32 => (value.abs() * 1e-6).max(1e-6),
        RegisterKind::Mapped(_) => 0.0,
        _ => 0.5 / reg.scale,
    };
    (actual - value).abs() <= tolerance
}

/// Make sure a setup register holds `value`: write it if it does not, read it
/// back, and retry the write once. Still wrong after the retry is fatal.
pub async fn ensure_register(
    transport: &mut dyn ModbusTransport,
    unit: u8,
    reg: &Register,
    value: f64,
    ctx: &DiagContext,
) -> Result<(), MeterError> {
    let current = read_register(transport, unit, reg).await?;
    if readback_matches(reg, value, &current) {
        return Ok(());
    }

    for attempt in 1..=2 {
        ctx.debug(format_args!(
            "Setting {:#06x} to {value} (attempt {attempt})",
            reg.base
        ));
        let words = crate::register::encode(reg.kind, reg.word_order, reg.scale, value)
            .map_err(|source| MeterError::Encode {
                path: format!("{:#06x}", reg.base),
                source,
            })?;
        send_words(transport, unit, reg.base, &words).await?;
        let readback = read_register(transport, unit, reg).await?;
        if readback_matches(reg, value, &readback) {
            return Ok(());
        }
    }

    ctx.error(format_args!("Register {:#06x} does not accept {value}", reg.base));
    Err(MeterError::Configuration(format!(
        "register {:#06x} did not take value {value}",
        reg.base
    )))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterState {
    /// Model matched, not yet initialised.
    Probed,
    Active,
    /// Initialisation failed fatally. Never retried.
    Failed,
}

/// Result of an inbound write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub readback: RegisterValue,
    /// The write changed the configuration and the meter was re-initialised.
    pub reinitialized: bool,
}

/// Static description of an active meter, published when it appears.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub ident: String,
    pub family: &'static str,
    pub model: &'static str,
    pub product_name: String,
    pub product_id: u16,
    pub unit: u8,
    pub phases: u8,
    pub info: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<DeviceSettings>,
}

/// One meter on one unit of a transport.
pub struct Meter {
    handler: Box<dyn DeviceHandler>,
    model: ModelInfo,
    ctx: DiagContext,
    engine: PollEngine,
    info_regs: RegisterSet,
    data_regs: RegisterSet,
    info: InfoMap,
    phases: u8,
    ident: Option<String>,
    state: MeterState,
    latency: LatencyFilter,
}

impl Meter {
    pub fn new(probed: ProbeMatch, ctx: DiagContext) -> Self {
        let handler = probed.build();
        Self::with_handler(handler, probed.info, ctx)
    }

    pub fn with_handler(handler: Box<dyn DeviceHandler>, model: ModelInfo, ctx: DiagContext) -> Self {
        let info_regs = RegisterSet::new(handler.info_registers());
        let latency = LatencyFilter::new(handler.min_timeout());
        Meter {
            handler,
            model,
            ctx,
            engine: PollEngine::new(),
            info_regs,
            data_regs: RegisterSet::default(),
            info: InfoMap::default(),
            phases: 0,
            ident: None,
            state: MeterState::Probed,
            latency,
        }
    }

    pub fn state(&self) -> MeterState {
        self.state
    }

    pub fn unit(&self) -> u8 {
        self.model.unit
    }

    pub fn model(&self) -> &ModelInfo {
        &self.model
    }

    pub fn handler(&self) -> &dyn DeviceHandler {
        self.handler.as_ref()
    }

    pub fn context(&self) -> &DiagContext {
        &self.ctx
    }

    pub fn ident(&self) -> Option<&str> {
        self.ident.as_deref()
    }

    pub fn info(&self) -> &InfoMap {
        &self.info
    }

    pub fn phases(&self) -> u8 {
        self.phases
    }

    pub fn info_registers(&self) -> &RegisterSet {
        &self.info_regs
    }

    pub fn data_registers(&self) -> &RegisterSet {
        &self.data_regs
    }

    pub fn latency(&self) -> &LatencyFilter {
        &self.latency
    }

    pub fn engine(&self) -> &PollEngine {
        &self.engine
    }

    /// Run the init hook, read info, derive the phase count and build the data registers.
    ///
    /// Transport errors leave the meter `Probed` so the caller may retry;
    /// configuration errors move it to `Failed` for good.
    pub async fn init(&mut self, transport: &mut dyn ModbusTransport) -> Result<(), MeterError> {
        if self.state == MeterState::Failed {
            return Err(MeterError::Configuration(format!(
                "{} failed initialisation",
                self.ctx.label()
            )));
        }

        match self.try_init(transport).await {
            Ok(ident) => {
                self.ctx.relabel(ident.as_str());
                self.ident = Some(ident);
                self.state = MeterState::Active;
                self.ctx.info(format_args!(
                    "{} {} active, {} phase(s), {} data registers in {} batch(es)",
                    self.model.family,
                    self.model.model,
                    self.phases,
                    self.data_regs.len(),
                    self.data_regs.batches().len()
                ));
                Ok(())
            }
            Err(err) => {
                if err.is_fatal() {
                    self.state = MeterState::Failed;
                    self.ctx.error(format_args!("Initialisation failed: {err}"));
                } else {
                    self.state = MeterState::Probed;
                    self.ctx.warn(format_args!("Initialisation interrupted: {err}"));
                }
                Err(err)
            }
        }
    }

    async fn try_init(&mut self, transport: &mut dyn ModbusTransport) -> Result<String, MeterError> {
        let unit = self.model.unit;
        self.handler
            .post_probe_init(transport, unit, &self.ctx)
            .await?;
        self.read_info(transport).await?;

        let phases = self.handler.phase_count(&self.info)?;
        let ident = self.handler.ident(&self.info)?;
        self.data_regs = RegisterSet::new(self.handler.build_data_registers(phases));
        self.phases = phases;
        Ok(ident)
    }

    /// Read every info register once, in grouped batches.
    pub async fn read_info(
        &mut self,
        transport: &mut dyn ModbusTransport,
    ) -> Result<&InfoMap, MeterError> {
        self.info_regs.invalidate_all();
        let outcome = self
            .engine
            .poll(transport, self.model.unit, &mut self.info_regs, Instant::now(), &self.ctx)
            .await?;
        if let Some(latency) = outcome.latency {
            self.latency.add(latency);
        }
        self.info = InfoMap::from_registers(&self.info_regs);
        Ok(&self.info)
    }

    /// One polling cycle over the data registers.
    ///
    /// On success the transport timeout is re-tuned from the latency filter.
    pub async fn update(
        &mut self,
        transport: &mut dyn ModbusTransport,
    ) -> Result<CycleOutcome, MeterError> {
        self.ensure_active()?;
        let outcome = self
            .engine
            .poll(transport, self.model.unit, &mut self.data_regs, Instant::now(), &self.ctx)
            .await?;
        if let Some(latency) = outcome.latency {
            self.latency.add(latency);
            transport.set_timeout(self.latency.timeout());
        }
        Ok(outcome)
    }

    /// Handle an inbound write: validate, write, read back, and re-initialise
    /// when the path affects the configuration.
    pub async fn write(
        &mut self,
        transport: &mut dyn ModbusTransport,
        path: &str,
        value: f64,
    ) -> Result<WriteOutcome, MeterError> {
        self.ensure_active()?;
        let unit = self.model.unit;
        let reg = self
            .data_regs
            .by_path(path)
            .or_else(|| self.info_regs.by_path(path))
            .ok_or_else(|| MeterError::UnknownPath(path.to_string()))?;

        write_register(transport, unit, reg, value).await?;
        let readback = read_register(transport, unit, reg).await?;
        if !readback_matches(reg, value, &readback) {
            self.ctx.warn(format_args!(
                "Write of {value} to {path} read back as {readback}"
            ));
            return Err(MeterError::WriteRejected {
                path: path.to_string(),
                value,
                readback: readback.to_string(),
            });
        }
        self.ctx.info(format_args!("Wrote {value} to {path}"));

        let reinitialized = self.handler.is_configuration_path(path);
        if reinitialized {
            self.reinit(transport).await?;
        }
        Ok(WriteOutcome {
            readback,
            reinitialized,
        })
    }

    /// Drop cached state and initialise again.
    pub async fn reinit(&mut self, transport: &mut dyn ModbusTransport) -> Result<(), MeterError> {
        self.ctx.info(format_args!("Re-initialising"));
        self.state = MeterState::Probed;
        self.data_regs = RegisterSet::default();
        self.init(transport).await
    }

    /// Every currently valid info and data value.
    pub fn snapshot(&self) -> Vec<(String, FormattedValue)> {
        self.info_regs
            .iter()
            .chain(self.data_regs.iter())
            .filter(|r| !r.path.is_empty())
            .filter_map(|r| r.formatted().map(|v| (r.path.clone(), v)))
            .collect()
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        let ident = self.ident.clone()?;
        let info = self
            .info_regs
            .iter()
            .filter_map(|r| r.formatted().map(|v| (r.path.clone(), v.text)))
            .collect();
        Some(DeviceInfo {
            ident,
            family: self.model.family,
            model: self.model.model,
            product_name: self.handler.product_name().to_string(),
            product_id: self.handler.product_id(),
            unit: self.model.unit,
            phases: self.phases,
            info,
            settings: None,
        })
    }

    fn ensure_active(&self) -> Result<(), MeterError> {
        if self.state == MeterState::Active {
            Ok(())
        } else {
            Err(MeterError::NotActive(self.ctx.label().to_string()))
        }
    }
}

impl std::fmt::Debug for Meter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Meter")
            .field("model", &self.model)
            .field("ident", &self.ident)
            .field("state", &self.state)
            .field("phases", &self.phases)
            .finish()
    }
}
