//! # Model Probing
//!
//! Each meter family exposes one identifying register whose raw value names
//! the model. A [`ModelProber`] reads exactly that register and looks the code
//! up in the family's static model table. The [`ProbeRegistry`] tries its
//! probers in registration order and stops at the first match.
//!
//! A code that is read but not in a table is not an error for the device:
//! another family may still claim it. Only when every prober failed to reach
//! the device is the transport error passed on.

use std::fmt;

use log::{debug, info};
use once_cell::sync::Lazy;

use crate::device::DeviceHandler;
use crate::error::{DecodeError, MeterError, ProbeError};
use crate::register::Register;
use crate::transport::ModbusTransport;

/// Builds the handler for a matched model.
pub type HandlerConstructor = fn(&ModelInfo) -> Box<dyn DeviceHandler>;

/// One row of a family's model table.
#[derive(Clone, Copy)]
pub struct ModelEntry {
    pub code: u64,
    pub model: &'static str,
    pub handler: HandlerConstructor,
}

impl fmt::Debug for ModelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelEntry")
            .field("code", &self.code)
            .field("model", &self.model)
            .finish()
    }
}

/// What a successful probe learned about the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub family: &'static str,
    pub model: &'static str,
    /// Raw value of the identifying register.
    pub code: u64,
    pub unit: u8,
}

/// A matched model plus the constructor for its handler.
#[derive(Clone)]
pub struct ProbeMatch {
    pub info: ModelInfo,
    pub handler: HandlerConstructor,
}

impl ProbeMatch {
    pub fn build(&self) -> Box<dyn DeviceHandler> {
        (self.handler)(&self.info)
    }
}

impl fmt::Debug for ProbeMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeMatch").field("info", &self.info).finish()
    }
}

/// Probing strategy of one meter family.
pub struct ModelProber {
    family: &'static str,
    id_register: Register,
    models: &'static [ModelEntry],
    units: &'static [u8],
}

impl ModelProber {
    /// `id_register` must decode to an integral code.
    pub fn new(family: &'static str, id_register: Register, models: &'static [ModelEntry]) -> Self {
        ModelProber {
            family,
            id_register,
            models,
            units: &[1],
        }
    }

    /// Unit ids scanned when the caller does not configure any.
    pub fn units(mut self, units: &'static [u8]) -> Self {
        self.units = units;
        self
    }

    pub fn family(&self) -> &'static str {
        self.family
    }

    pub fn id_register(&self) -> &Register {
        &self.id_register
    }

    pub fn models(&self) -> &'static [ModelEntry] {
        self.models
    }

    pub fn default_units(&self) -> &'static [u8] {
        self.units
    }

    pub fn lookup(&self, code: u64) -> Option<&'static ModelEntry> {
        self.models.iter().find(|entry| entry.code == code)
    }

    /// Read the identifying register of `unit` and match it against the model table.
    pub async fn probe(
        &self,
        transport: &mut dyn ModbusTransport,
        unit: u8,
    ) -> Result<ProbeMatch, ProbeError> {
        let family = self.family;
        let reg = &self.id_register;
        let words = transport
            .read_input_registers(reg.base, reg.word_count(), unit)
            .await
            .map_err(|source| ProbeError::Transport { family, source })?;
        let value = reg
            .decode_words(&words)
            .map_err(|source| ProbeError::Decode { family, source })?;
        let code = value.as_code().ok_or(ProbeError::Decode {
            family,
            source: DecodeError::NotNumeric,
        })? as u64;

        match self.lookup(code) {
            Some(entry) => Ok(ProbeMatch {
                info: ModelInfo {
                    family,
                    model: entry.model,
                    code,
                    unit,
                },
                handler: entry.handler,
            }),
            None => Err(ProbeError::NoMatch { family, code }),
        }
    }
}

impl fmt::Debug for ModelProber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelProber")
            .field("family", &self.family)
            .field("id_register", &format_args!("{:#06x}", self.id_register.base))
            .field("models", &self.models.len())
            .finish()
    }
}

/// Ordered list of probers. Order is significant: the first match wins.
#[derive(Debug, Default)]
pub struct ProbeRegistry {
    probers: Vec<ModelProber>,
}

static DEFAULT_REGISTRY: Lazy<ProbeRegistry> = Lazy::new(ProbeRegistry::with_defaults);

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a prober. A family can only be registered once.
    pub fn register(&mut self, prober: ModelProber) -> Result<(), MeterError> {
        if self.probers.iter().any(|p| p.family == prober.family) {
            return Err(MeterError::Other(format!(
                "Prober already registered for family: {}",
                prober.family
            )));
        }
        self.probers.push(prober);
        Ok(())
    }

    pub fn probers(&self) -> &[ModelProber] {
        &self.probers
    }

    pub fn families(&self) -> Vec<&'static str> {
        self.probers.iter().map(ModelProber::family).collect()
    }

    /// Registry with every supported family, in probing order:
    /// Carlo Gavazzi, Eastron, ABB.
    pub fn with_defaults() -> Self {
        ProbeRegistry {
            probers: crate::vendors::default_probers(),
        }
    }

    /// Shared instance of [`with_defaults`](Self::with_defaults).
    pub fn global() -> &'static ProbeRegistry {
        &DEFAULT_REGISTRY
    }

    /// Union of every prober's default units, in first-seen order.
    pub fn default_units(&self) -> Vec<u8> {
        let mut units = Vec::new();
        for unit in self.probers.iter().flat_map(|p| p.units.iter().copied()) {
            if !units.contains(&unit) {
                units.push(unit);
            }
        }
        units
    }

    /// Try each prober in order and return the first match.
    ///
    /// Returns [`MeterError::NoMatch`] when the device answered but no family
    /// recognised it, or the last transport error when no prober could reach
    /// the device at all.
    pub async fn probe(
        &self,
        transport: &mut dyn ModbusTransport,
        unit: u8,
    ) -> Result<ProbeMatch, MeterError> {
        let mut answered = false;
        let mut last_error = None;

        for prober in &self.probers {
            match prober.probe(transport, unit).await {
                Ok(found) => {
                    info!(
                        "Found {} {} (code {}) at {}:{unit}",
                        found.info.family,
                        found.info.model,
                        found.info.code,
                        transport.describe()
                    );
                    return Ok(found);
                }
                Err(ProbeError::Transport { family, source }) => {
                    debug!("{family}: probe read failed: {source}");
                    last_error = Some(source);
                }
                Err(err) => {
                    debug!("{err}");
                    answered = true;
                }
            }
        }

        match last_error {
            Some(err) if !answered => Err(MeterError::Transport(err)),
            _ => Err(MeterError::NoMatch),
        }
    }
}
