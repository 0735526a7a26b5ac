//! Register images of real meters for the mock transport.

#![allow(dead_code)]

use modmeter_rs::register::codec::encode_text;
use modmeter_rs::MockTransport;

pub const UNIT: u8 = 1;
pub const EM24_SERIAL: &str = "BX1234567";

/// 32-bit value as the EM24 stores it, least significant word first.
pub fn le32(value: i32) -> [u16; 2] {
    let raw = value as u32;
    [(raw & 0xffff) as u16, (raw >> 16) as u16]
}

pub fn f32_words(value: f32) -> [u16; 2] {
    let raw = value.to_bits();
    [(raw >> 16) as u16, (raw & 0xffff) as u16]
}

/// EM24-DIN AV2 in application mode H with the given phase configuration code.
pub fn em24(mock: &MockTransport, phase_config: u16) {
    mock.set_register(UNIT, 0x000b, 71);
    mock.set_register(UNIT, 0x1101, 7);
    mock.set_register(UNIT, 0x0302, 66);
    mock.set_register(UNIT, 0x0303, 5);
    mock.set_register(UNIT, 0x1102, phase_config);
    mock.set_registers(UNIT, 0x1300, &encode_text(EM24_SERIAL, 7).unwrap());

    for n in 0..3u16 {
        mock.set_registers(UNIT, 2 * n, &le32(2301 + i32::from(n)));
        mock.set_registers(UNIT, 0x000c + 2 * n, &le32(4_500));
        mock.set_registers(UNIT, 0x0012 + 2 * n, &le32(10_350));
        mock.set_registers(UNIT, 0x0046 + 2 * n, &le32(123_456));
    }
    mock.set_registers(UNIT, 0x0028, &le32(31_050));
    mock.set_register(UNIT, 0x0036, 0);
    mock.set_register(UNIT, 0x0037, 500);
    mock.set_registers(UNIT, 0x003e, &le32(370_368));
    mock.set_registers(UNIT, 0x005c, &le32(-1));
}

/// SDM630 v2 wired three-phase.
pub fn sdm630(mock: &MockTransport) {
    mock.set_register(UNIT, 0xfc02, 112);
    mock.set_register(UNIT, 0xfc03, 2);
    mock.set_registers(UNIT, 0x000a, &f32_words(3.0));
    mock.set_registers(UNIT, 0x0014, &[0x0001, 0xe240]);
    mock.set_registers(UNIT, 0x0000, &f32_words(229.5));
    mock.set_registers(UNIT, 0x0046, &f32_words(49.98));
}

/// ABB B23 with text versions.
pub fn abb(mock: &MockTransport) {
    // The model code is the first word of the hardware version text, "B2"
    mock.set_registers(UNIT, 0x8960, &encode_text("B23 312", 6).unwrap());
    mock.set_registers(UNIT, 0x8908, &encode_text("1.2.3", 8).unwrap());
    mock.set_registers(UNIT, 0x8900, &[0x0000, 0x3039]);
    mock.set_registers(UNIT, 0x5b00, &[0x0000, 2305]);
    mock.set_registers(UNIT, 0x5000, &[0, 0, 0x0002, 0x49f0]);
}
