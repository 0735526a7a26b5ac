//! Integration tests for meter initialisation, polling and inbound writes.

mod common;

use common::{EM24_SERIAL, UNIT};
use modmeter_rs::transport::mock::TransportCall;
use modmeter_rs::{
    DiagContext, Meter, MeterError, MeterState, MockTransport, ProbeRegistry, RegisterValue,
    TransportError,
};

async fn probed(mock: &mut MockTransport) -> Meter {
    let found = ProbeRegistry::global().probe(mock, UNIT).await.unwrap();
    mock.clear_calls();
    Meter::new(found, DiagContext::new(format!("mock:{UNIT}")))
}

fn text(meter: &Meter, path: &str) -> String {
    meter
        .data_registers()
        .by_path(path)
        .or_else(|| meter.info_registers().by_path(path))
        .and_then(|r| r.formatted())
        .map(|v| v.text)
        .unwrap_or_else(|| panic!("{path} has no value"))
}

/// Tests a full EM24 bring-up: info read, phase count, ident and first poll.
#[tokio::test]
async fn test_em24_init_and_poll() {
    let mut mock = MockTransport::new();
    common::em24(&mock, 0);
    let mut meter = probed(&mut mock).await;

    meter.init(&mut mock).await.unwrap();
    assert_eq!(meter.state(), MeterState::Active);
    assert_eq!(meter.ident(), Some(format!("cg_{EM24_SERIAL}").as_str()));
    assert_eq!(meter.phases(), 3);
    assert_eq!(meter.context().label(), format!("cg_{EM24_SERIAL}"));
    // Application register already in mode H
    assert!(mock.writes().is_empty());

    let outcome = meter.update(&mut mock).await.unwrap();
    assert_eq!(outcome.spans.len(), 1);
    assert_eq!(outcome.updates.len(), meter.data_registers().len());
    assert_eq!(text(&meter, "/Ac/L1/Voltage"), "230.1 V");
    assert_eq!(text(&meter, "/Ac/L3/Voltage"), "230.3 V");
    assert_eq!(text(&meter, "/Ac/L2/Current"), "4.5 A");
    assert_eq!(text(&meter, "/Ac/Power"), "3105.0 W");
    assert_eq!(text(&meter, "/Ac/Frequency"), "50.0 Hz");
    assert_eq!(text(&meter, "/Ac/Energy/Forward"), "37036.8 kWh");
    assert_eq!(text(&meter, "/Ac/Energy/Reverse"), "-0.1 kWh");
    assert_eq!(text(&meter, "/HardwareVersion"), "EM24DINAV93XISX");
    assert_eq!(text(&meter, "/PhaseConfig"), "3P.n");
    assert!(mock.timeout().is_some());

    let info = meter.device_info().unwrap();
    assert_eq!(info.product_id, 0xb017);
    assert_eq!(info.info.get("/Serial").map(String::as_str), Some(EM24_SERIAL));
}

/// Tests that an application register that never takes the write fails the
/// meter after one retry, and that a failed meter is not re-initialised.
#[tokio::test]
async fn test_init_write_not_applied_is_fatal() {
    let mut mock = MockTransport::new();
    common::em24(&mock, 0);
    mock.set_register(UNIT, 0x1101, 0);
    mock.ignore_writes_to(UNIT, 0x1101);
    let mut meter = probed(&mut mock).await;

    let err = meter.init(&mut mock).await.unwrap_err();
    assert!(matches!(err, MeterError::Configuration(_)));
    assert_eq!(meter.state(), MeterState::Failed);
    assert_eq!(
        mock.writes(),
        vec![
            TransportCall::Write { address: 0x1101, values: vec![7], unit: UNIT },
            TransportCall::Write { address: 0x1101, values: vec![7], unit: UNIT },
        ]
    );

    mock.clear_calls();
    assert!(meter.init(&mut mock).await.is_err());
    assert!(mock.calls().is_empty());
    assert!(matches!(meter.update(&mut mock).await, Err(MeterError::NotActive(_))));
}

/// Tests that the application mode is forced when the meter is in another mode.
#[tokio::test]
async fn test_init_forces_application_mode() {
    let mut mock = MockTransport::new();
    common::em24(&mock, 0);
    mock.set_register(UNIT, 0x1101, 2);
    let mut meter = probed(&mut mock).await;

    meter.init(&mut mock).await.unwrap();
    assert_eq!(mock.register(UNIT, 0x1101), 7);
    assert_eq!(mock.writes().len(), 1);
}

/// Tests that an unsupported phase configuration is fatal.
#[tokio::test]
async fn test_unknown_phase_config_is_fatal() {
    let mut mock = MockTransport::new();
    common::em24(&mock, 9);
    let mut meter = probed(&mut mock).await;

    let err = meter.init(&mut mock).await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(meter.state(), MeterState::Failed);
}

/// Tests that an unreadable serial defers init instead of failing the meter.
#[tokio::test]
async fn test_unreadable_serial_is_retryable() {
    let mut mock = MockTransport::new();
    common::em24(&mock, 0);
    mock.set_registers(UNIT, 0x1300, &[0x4258, 0x3132, 0x3334, 0x3536, 0x37ff, 0xffff, 0xffff]);
    let mut meter = probed(&mut mock).await;

    let err = meter.init(&mut mock).await.unwrap_err();
    assert!(!err.is_fatal());
    assert!(matches!(err, MeterError::Decode { ref path, .. } if path == "/Serial"));
    assert_eq!(meter.state(), MeterState::Probed);
    assert_eq!(meter.ident(), None);

    common::em24(&mock, 0);
    meter.init(&mut mock).await.unwrap();
    assert_eq!(meter.state(), MeterState::Active);
    assert_eq!(meter.ident(), Some(format!("cg_{EM24_SERIAL}").as_str()));
}

/// Tests that a phase configuration that is not a code defers init.
#[tokio::test]
async fn test_unreadable_phase_config_is_retryable() {
    let mut mock = MockTransport::new();
    common::sdm630(&mock);
    mock.set_registers(UNIT, 0x000a, &common::f32_words(f32::NAN));
    let mut meter = probed(&mut mock).await;

    let err = meter.init(&mut mock).await.unwrap_err();
    assert!(!err.is_fatal());
    assert!(matches!(err, MeterError::Decode { ref path, .. } if path == "/PhaseConfig"));
    assert_eq!(meter.state(), MeterState::Probed);

    mock.set_registers(UNIT, 0x000a, &common::f32_words(3.0));
    meter.init(&mut mock).await.unwrap();
    assert_eq!(meter.phases(), 3);
}

/// Tests that a transport failure during init leaves the meter retryable.
#[tokio::test]
async fn test_init_transport_error_is_retryable() {
    let mut mock = MockTransport::new();
    common::em24(&mock, 0);
    let mut meter = probed(&mut mock).await;

    mock.set_absent(UNIT);
    let err = meter.init(&mut mock).await.unwrap_err();
    assert!(matches!(err, MeterError::Transport(TransportError::Timeout)));
    assert_eq!(meter.state(), MeterState::Probed);

    mock.set_present(UNIT);
    meter.init(&mut mock).await.unwrap();
    assert_eq!(meter.state(), MeterState::Active);
}

/// Tests that an out-of-range write is rejected without touching the wire.
#[tokio::test]
async fn test_out_of_range_write_sends_nothing() {
    let mut mock = MockTransport::new();
    common::em24(&mock, 0);
    let mut meter = probed(&mut mock).await;
    meter.init(&mut mock).await.unwrap();
    mock.clear_calls();

    let err = meter.write(&mut mock, "/PhaseConfig", 5.0).await.unwrap_err();
    assert!(matches!(err, MeterError::Range { max, .. } if max == 4.0));
    assert!(mock.calls().is_empty());

    let err = meter.write(&mut mock, "/FirmwareVersion", 1.0).await.unwrap_err();
    assert!(matches!(err, MeterError::ReadOnly(_)));
    let err = meter.write(&mut mock, "/No/Such/Path", 1.0).await.unwrap_err();
    assert!(matches!(err, MeterError::UnknownPath(_)));
    assert!(mock.calls().is_empty());
}

/// Tests that changing the phase configuration rebuilds the register map.
#[tokio::test]
async fn test_phase_config_write_reinitialises() {
    let mut mock = MockTransport::new();
    common::em24(&mock, 0);
    let mut meter = probed(&mut mock).await;
    meter.init(&mut mock).await.unwrap();
    assert_eq!(meter.data_registers().len(), 17);
    mock.clear_calls();

    let outcome = meter.write(&mut mock, "/PhaseConfig", 3.0).await.unwrap();
    assert!(outcome.reinitialized);
    assert_eq!(outcome.readback, RegisterValue::Number(3.0));
    assert_eq!(mock.writes()[0], TransportCall::Write { address: 0x1102, values: vec![3], unit: UNIT });

    assert_eq!(meter.state(), MeterState::Active);
    assert_eq!(meter.phases(), 1);
    assert_eq!(meter.data_registers().len(), 8);
    assert!(meter.data_registers().by_path("/Ac/L2/Voltage").is_none());
    assert!(meter.data_registers().by_path("/PhaseSequence").is_none());
}

/// Tests that a write the meter ignores is reported with the read-back value.
#[tokio::test]
async fn test_write_readback_mismatch() {
    let mut mock = MockTransport::new();
    common::em24(&mock, 0);
    mock.ignore_writes_to(UNIT, 0x1102);
    let mut meter = probed(&mut mock).await;
    meter.init(&mut mock).await.unwrap();

    let err = meter.write(&mut mock, "/PhaseConfig", 3.0).await.unwrap_err();
    match err {
        MeterError::WriteRejected { path, readback, .. } => {
            assert_eq!(path, "/PhaseConfig");
            assert_eq!(readback, "0");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(meter.state(), MeterState::Active);
    assert_eq!(meter.phases(), 3);
}

/// Tests SDM630 bring-up with a numeric serial and float registers.
#[tokio::test]
async fn test_sdm630_init() {
    let mut mock = MockTransport::new();
    common::sdm630(&mock);
    let mut meter = probed(&mut mock).await;

    meter.init(&mut mock).await.unwrap();
    assert_eq!(meter.ident(), Some("cg_123456"));
    assert_eq!(meter.phases(), 3);
    assert_eq!(text(&meter, "/PhaseConfig"), "3P.n");

    let outcome = meter.update(&mut mock).await.unwrap();
    assert_eq!(outcome.spans.len(), 2);
    assert_eq!(text(&meter, "/Ac/L1/Voltage"), "229.5 V");
    assert_eq!(text(&meter, "/Ac/Frequency"), "50.0 Hz");
}

/// Tests ABB bring-up with text version registers.
#[tokio::test]
async fn test_abb_init() {
    let mut mock = MockTransport::new();
    common::abb(&mock);
    let mut meter = probed(&mut mock).await;

    meter.init(&mut mock).await.unwrap();
    assert_eq!(meter.ident(), Some("cg_12345"));
    assert_eq!(meter.phases(), 3);
    assert_eq!(text(&meter, "/HardwareVersion"), "B23 312");
    assert_eq!(text(&meter, "/FirmwareVersion"), "1.2.3");

    meter.update(&mut mock).await.unwrap();
    assert_eq!(text(&meter, "/Ac/L1/Voltage"), "230.5 V");
    assert_eq!(text(&meter, "/Ac/Energy/Forward"), "1500.0 kWh");
}

/// Tests that a failed poll keeps the last good values and the meter active.
#[tokio::test]
async fn test_update_after_transport_error_keeps_values() {
    let mut mock = MockTransport::new();
    common::em24(&mock, 0);
    let mut meter = probed(&mut mock).await;
    meter.init(&mut mock).await.unwrap();
    meter.update(&mut mock).await.unwrap();

    mock.fail_next_read(TransportError::Crc { expected: 1, received: 2 });
    let err = meter.update(&mut mock).await.unwrap_err();
    assert!(matches!(err, MeterError::Transport(TransportError::Crc { .. })));
    assert_eq!(text(&meter, "/Ac/L1/Voltage"), "230.1 V");
    assert_eq!(meter.state(), MeterState::Active);
}
