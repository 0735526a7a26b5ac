//! Carlo Gavazzi EM24 DIN energy meters.
//!
//! 32-bit measurements are stored least significant word first. The meter
//! only publishes the full register map in application mode "H", so the
//! handler forces the application register before reading anything else.

use async_trait::async_trait;

use super::{energy, measure};
use crate::device::{ensure_register, paths, phases_from_table, DeviceHandler, InfoMap};
use crate::error::MeterError;
use crate::logging::DiagContext;
use crate::probe::{ModelEntry, ModelInfo, ModelProber};
use crate::register::Register;
use crate::transport::ModbusTransport;

pub const FAMILY: &str = "Carlo Gavazzi";
pub const PRODUCT_ID: u16 = 0xb017;

const MODEL_REGISTER: u16 = 0x000b;
const APPLICATION_REGISTER: u16 = 0x1101;
const APPLICATION_H: f64 = 7.0;

/// Phases per phase-configuration code.
const PHASE_COUNTS: [u8; 5] = [3, 3, 2, 1, 3];

const PHASE_CONFIGS: [&str; 5] = ["3P.n", "3P.1", "2P", "1P", "3P"];

const UNKNOWN: &str = "unknown";

const HARDWARE_VERSIONS: [&str; 80] = [
    "EM24DINAV93XO2PFA",
    UNKNOWN,
    "EM24DINAV93XISPFA",
    "EM24DINAV93XXXPFA",
    "EM24DINAV23XO2PFA",
    "EM24DINAV23XISPFA",
    "EM24DINAV23XXXPFA",
    "EM24DINAV53xO2PFA",
    UNKNOWN,
    "EM24DINAV53xISPFA",
    "EM24DINAV53xXXPFA",
    UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN,
    UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN,
    UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN,
    UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN,
    UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN,
    UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN,
    UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN,
    UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN,
    UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN,
    UNKNOWN,
    "EM24DINAV93XISX",
    UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN, UNKNOWN,
    "EM24DINAV53DISX",
    UNKNOWN, UNKNOWN,
    "EM24DINAV63xO2X",
    "EM24DINAV63xR2X",
    "EM24DINAV63xISX",
    "EM24DINAV63xXXX",
];

const PHASE_SEQUENCE: &[(u16, u16)] = &[(0x0000, 0), (0xffff, 1)];

static MODELS: [ModelEntry; 4] = [
    ModelEntry { code: 70, model: "EM24-DIN AV9", handler: Em24::boxed },
    ModelEntry { code: 71, model: "EM24-DIN AV2", handler: Em24::boxed },
    ModelEntry { code: 72, model: "EM24-DIN AV5", handler: Em24::boxed },
    ModelEntry { code: 73, model: "EM24-DIN AV6", handler: Em24::boxed },
];

pub fn prober() -> ModelProber {
    ModelProber::new(FAMILY, Register::u16(MODEL_REGISTER, ""), &MODELS)
}

pub struct Em24 {
    name: String,
}

impl Em24 {
    pub fn new(model: &ModelInfo) -> Self {
        Em24 {
            name: format!("Carlo Gavazzi {}", model.model),
        }
    }

    fn boxed(model: &ModelInfo) -> Box<dyn DeviceHandler> {
        Box::new(Self::new(model))
    }
}

#[async_trait]
impl DeviceHandler for Em24 {
    fn product_name(&self) -> &str {
        &self.name
    }

    fn product_id(&self) -> u16 {
        PRODUCT_ID
    }

    fn info_registers(&self) -> Vec<Register> {
        vec![
            Register::u16(0x0302, paths::HARDWARE_VERSION)
                .labels(&HARDWARE_VERSIONS)
                .writable(0.0, 78.0),
            Register::u16(0x0303, paths::FIRMWARE_VERSION),
            Register::u16(0x1102, paths::PHASE_CONFIG)
                .labels(&PHASE_CONFIGS)
                .writable(0.0, 4.0),
            Register::text(0x1300, 7, paths::SERIAL),
        ]
    }

    fn phase_count(&self, info: &InfoMap) -> Result<u8, MeterError> {
        phases_from_table(info, &PHASE_COUNTS)
    }

    fn fixed_registers(&self, phases: u8) -> Vec<Register> {
        let mut regs = vec![
            Register::s32(0x0028, "/Ac/Power").little_endian().scale(10.0).format(1, "W"),
            Register::u16(0x0037, "/Ac/Frequency").scale(10.0).format(1, "Hz"),
            energy(Register::s32(0x003e, "/Ac/Energy/Forward").little_endian(), 10.0),
            energy(Register::s32(0x005c, "/Ac/Energy/Reverse").little_endian(), 10.0),
        ];
        if phases == 3 {
            regs.push(Register::mapped(0x0036, paths::PHASE_SEQUENCE, PHASE_SEQUENCE));
        }
        regs
    }

    fn phase_registers(&self, n: u8) -> Vec<Register> {
        let s = 2 * u16::from(n - 1);
        vec![
            measure(Register::s32(0x0000 + s, paths::phase(n, "Voltage")).little_endian(), 10.0, "V"),
            measure(Register::s32(0x000c + s, paths::phase(n, "Current")).little_endian(), 1000.0, "A"),
            measure(Register::s32(0x0012 + s, paths::phase(n, "Power")).little_endian(), 10.0, "W"),
            energy(Register::s32(0x0046 + s, paths::phase(n, "Energy/Forward")).little_endian(), 10.0),
        ]
    }

    /// Force application mode H.
    async fn post_probe_init(
        &self,
        transport: &mut dyn ModbusTransport,
        unit: u8,
        ctx: &DiagContext,
    ) -> Result<(), MeterError> {
        let appreg = Register::u16(APPLICATION_REGISTER, "");
        ensure_register(transport, unit, &appreg, APPLICATION_H, ctx).await
    }

    /// Every writable EM24 register is part of the configuration.
    fn is_configuration_path(&self, _path: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_tables() {
        assert_eq!(HARDWARE_VERSIONS[66], "EM24DINAV93XISX");
        assert_eq!(HARDWARE_VERSIONS[73], "EM24DINAV53DISX");
        assert_eq!(HARDWARE_VERSIONS[79], "EM24DINAV63xXXX");
        assert_eq!(PHASE_COUNTS.len(), PHASE_CONFIGS.len());
    }

    #[test]
    fn test_three_phase_layout_fits_one_read() {
        let em24 = Em24::new(&ModelInfo {
            family: FAMILY,
            model: "EM24-DIN AV5",
            code: 72,
            unit: 1,
        });
        let set = crate::register::RegisterSet::new(em24.build_data_registers(3));
        assert_eq!(set.len(), 4 + 1 + 3 * 4);
        assert_eq!(set.batches().len(), 1);
        assert!(set.by_path("/PhaseSequence").is_some());

        let single = em24.build_data_registers(1);
        assert!(single.iter().all(|r| r.path != "/PhaseSequence"));
        assert_eq!(single.len(), 8);
    }
}
