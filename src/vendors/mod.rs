//! # Supported Meter Families
//!
//! One module per family, each providing a [`ModelProber`] and a
//! [`DeviceHandler`](crate::device::DeviceHandler) implementation built from
//! static register tables.

pub mod abb;
pub mod carlo_gavazzi;
pub mod eastron;

use crate::probe::ModelProber;
use crate::register::Register;

/// Probers for every supported family, in probing order.
pub fn default_probers() -> Vec<ModelProber> {
    vec![carlo_gavazzi::prober(), eastron::prober(), abb::prober()]
}

/// Scaled measurement shown with one decimal.
pub(crate) fn measure(reg: Register, scale: f64, unit: &'static str) -> Register {
    reg.scale(scale).format(1, unit)
}

/// Energy counter in kWh.
pub(crate) fn energy(reg: Register, scale: f64) -> Register {
    measure(reg, scale, "kWh")
}
