//! ABB B2x series meters.
//!
//! Always wired three-phase. Energy counters are 64-bit, versions are text.

use async_trait::async_trait;

use super::{energy, measure};
use crate::device::{paths, DeviceHandler, InfoMap};
use crate::error::MeterError;
use crate::probe::{ModelEntry, ModelInfo, ModelProber};
use crate::register::Register;

pub const FAMILY: &str = "ABB";
pub const PRODUCT_ID: u16 = 0xb017;

const MODEL_REGISTER: u16 = 0x8960;
const PHASES: u8 = 3;

static MODELS: [ModelEntry; 1] = [ModelEntry {
    code: 16946,
    model: "ABB_B2x",
    handler: AbbB2x::boxed,
}];

pub fn prober() -> ModelProber {
    ModelProber::new(FAMILY, Register::u16(MODEL_REGISTER, ""), &MODELS)
}

#[derive(Debug, Default)]
pub struct AbbB2x;

impl AbbB2x {
    fn boxed(_: &ModelInfo) -> Box<dyn DeviceHandler> {
        Box::new(AbbB2x)
    }
}

#[async_trait]
impl DeviceHandler for AbbB2x {
    fn product_name(&self) -> &str {
        "ABB B2x"
    }

    fn product_id(&self) -> u16 {
        PRODUCT_ID
    }

    fn info_registers(&self) -> Vec<Register> {
        vec![
            Register::text(0x8960, 6, paths::HARDWARE_VERSION),
            Register::text(0x8908, 8, paths::FIRMWARE_VERSION),
            Register::u32(0x8900, paths::SERIAL),
        ]
    }

    fn phase_count(&self, _info: &InfoMap) -> Result<u8, MeterError> {
        Ok(PHASES)
    }

    fn fixed_registers(&self, _phases: u8) -> Vec<Register> {
        vec![
            measure(Register::s32(0x5b14, "/Ac/Power"), 100.0, "W"),
            measure(Register::u16(0x5b2c, "/Ac/Frequency"), 100.0, "Hz"),
            energy(Register::u64(0x5000, "/Ac/Energy/Forward"), 100.0),
            energy(Register::u64(0x5004, "/Ac/Energy/Reverse"), 100.0),
        ]
    }

    fn phase_registers(&self, n: u8) -> Vec<Register> {
        let s2 = 2 * u16::from(n - 1);
        let s4 = 4 * u16::from(n - 1);
        vec![
            measure(Register::u32(0x5b00 + s2, paths::phase(n, "Voltage")), 10.0, "V"),
            measure(Register::u32(0x5b0c + s2, paths::phase(n, "Current")), 100.0, "A"),
            measure(Register::s32(0x5b16 + s2, paths::phase(n, "Power")), 100.0, "W"),
            energy(Register::u64(0x5460 + s4, paths::phase(n, "Energy/Forward")), 100.0),
            energy(Register::u64(0x546c + s4, paths::phase(n, "Energy/Reverse")), 100.0),
        ]
    }

    /// No writable registers.
    fn is_configuration_path(&self, _path: &str) -> bool {
        false
    }
}
