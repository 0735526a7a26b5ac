//! Eastron SDM120 and SDM630 v2 meters.
//!
//! Both models store every measurement as a big-endian IEEE float and share
//! the model register at 0xfc02. They differ in where the serial number,
//! totals and per-phase energy counters live.

use async_trait::async_trait;

use super::{energy, measure};
use crate::device::{paths, phases_from_table, DeviceHandler, InfoMap};
use crate::error::MeterError;
use crate::probe::{ModelEntry, ModelInfo, ModelProber};
use crate::register::Register;

pub const FAMILY: &str = "Eastron";
pub const PRODUCT_ID: u16 = 0xb023;

const MODEL_REGISTER: u16 = 0xfc02;

/// Register map of one Eastron model.
#[derive(Debug)]
pub struct Layout {
    pub product_name: &'static str,
    serial: u16,
    total_power: u16,
    total_current: u16,
    phase_forward: u16,
    phase_reverse: u16,
    phase_counts: &'static [u8],
    phase_configs: &'static [&'static str],
}

pub static SDM120: Layout = Layout {
    product_name: "Eastron SDM120-Modbus",
    serial: 0xfc00,
    total_power: 0x000c,
    total_current: 0x0006,
    phase_forward: 0x0048,
    phase_reverse: 0x004a,
    phase_counts: &[1, 1, 3, 3],
    phase_configs: &["1P", "1P", "3P.1", "3P.n"],
};

/// Configuration code 0 is undefined on the SDM630 and has no phases.
pub static SDM630V2: Layout = Layout {
    product_name: "Eastron SDM630-Modbus v2",
    serial: 0x0014,
    total_power: 0x0034,
    total_current: 0x0030,
    phase_forward: 0x015a,
    phase_reverse: 0x0160,
    phase_counts: &[0, 1, 3, 3],
    phase_configs: &["undefined", "1P", "3P.1", "3P.n"],
};

static MODELS: [ModelEntry; 3] = [
    ModelEntry { code: 32, model: "SDM120Modbus", handler: Eastron::sdm120 },
    ModelEntry { code: 112, model: "SDM630Modbusv2", handler: Eastron::sdm630 },
    ModelEntry { code: 121, model: "SDM630Modbusv2", handler: Eastron::sdm630 },
];

pub fn prober() -> ModelProber {
    ModelProber::new(FAMILY, Register::u16(MODEL_REGISTER, ""), &MODELS)
}

pub struct Eastron {
    layout: &'static Layout,
}

impl Eastron {
    pub fn new(layout: &'static Layout) -> Self {
        Eastron { layout }
    }

    pub fn layout(&self) -> &'static Layout {
        self.layout
    }

    fn sdm120(_: &ModelInfo) -> Box<dyn DeviceHandler> {
        Box::new(Self::new(&SDM120))
    }

    fn sdm630(_: &ModelInfo) -> Box<dyn DeviceHandler> {
        Box::new(Self::new(&SDM630V2))
    }
}

#[async_trait]
impl DeviceHandler for Eastron {
    fn product_name(&self) -> &str {
        self.layout.product_name
    }

    fn product_id(&self) -> u16 {
        PRODUCT_ID
    }

    fn info_registers(&self) -> Vec<Register> {
        vec![
            Register::u16(0xfc02, paths::HARDWARE_VERSION),
            Register::u16(0xfc03, paths::FIRMWARE_VERSION),
            Register::f32(0x000a, paths::PHASE_CONFIG)
                .labels(self.layout.phase_configs)
                .writable(0.0, 3.0),
            Register::u32(self.layout.serial, paths::SERIAL),
        ]
    }

    fn phase_count(&self, info: &InfoMap) -> Result<u8, MeterError> {
        phases_from_table(info, self.layout.phase_counts)
    }

    fn fixed_registers(&self, _phases: u8) -> Vec<Register> {
        vec![
            measure(Register::f32(self.layout.total_power, "/Ac/Power"), 1.0, "W"),
            measure(Register::f32(self.layout.total_current, "/Ac/Current"), 1.0, "A"),
            measure(Register::f32(0x0046, "/Ac/Frequency"), 1.0, "Hz"),
            energy(Register::f32(0x0048, "/Ac/Energy/Forward"), 1.0),
            energy(Register::f32(0x004a, "/Ac/Energy/Reverse"), 1.0),
        ]
    }

    fn phase_registers(&self, n: u8) -> Vec<Register> {
        let s = 2 * u16::from(n - 1);
        vec![
            measure(Register::f32(s, paths::phase(n, "Voltage")), 1.0, "V"),
            measure(Register::f32(0x0006 + s, paths::phase(n, "Current")), 1.0, "A"),
            measure(Register::f32(0x000c + s, paths::phase(n, "Power")), 1.0, "W"),
            energy(Register::f32(self.layout.phase_forward + s, paths::phase(n, "Energy/Forward")), 1.0),
            energy(Register::f32(self.layout.phase_reverse + s, paths::phase(n, "Energy/Reverse")), 1.0),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{RegisterSet, RegisterValue};

    fn info_with_config(code: f64) -> InfoMap {
        let mut info = InfoMap::default();
        info.insert(paths::PHASE_CONFIG, RegisterValue::Number(code));
        info
    }

    #[test]
    fn test_phase_tables_differ() {
        let sdm120 = Eastron::new(&SDM120);
        let sdm630 = Eastron::new(&SDM630V2);
        assert_eq!(sdm120.phase_count(&info_with_config(0.0)).unwrap(), 1);
        assert!(sdm630.phase_count(&info_with_config(0.0)).unwrap_err().is_fatal());
        assert_eq!(sdm630.phase_count(&info_with_config(3.0)).unwrap(), 3);
        assert!(sdm630.phase_count(&info_with_config(4.0)).is_err());
    }

    #[test]
    fn test_sdm630_energy_counters_in_separate_batch() {
        let set = RegisterSet::new(Eastron::new(&SDM630V2).build_data_registers(3));
        assert_eq!(set.len(), 5 + 3 * 5);
        assert_eq!(set.batches().len(), 2);
        assert_eq!(set.by_path("/Ac/L3/Energy/Reverse").unwrap().base, 0x0164);
    }
}
