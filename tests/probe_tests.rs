//! Integration tests for model probing across meter families.

mod common;

use common::UNIT;
use modmeter_rs::transport::mock::TransportCall;
use modmeter_rs::vendors::{abb, carlo_gavazzi, eastron};
use modmeter_rs::{MeterError, MockTransport, ProbeError, ProbeRegistry, TransportError};

/// Tests that an EM24 is found by the first prober with a single read.
#[tokio::test]
async fn test_em24_selected_without_other_probers() {
    let mut mock = MockTransport::new();
    common::em24(&mock, 0);

    let found = ProbeRegistry::global().probe(&mut mock, UNIT).await.unwrap();
    assert_eq!(found.info.family, carlo_gavazzi::FAMILY);
    assert_eq!(found.info.code, 71);
    assert_eq!(found.info.unit, UNIT);
    assert_eq!(found.build().product_name(), "Carlo Gavazzi EM24-DIN AV2");
    assert_eq!(
        mock.calls(),
        vec![TransportCall::Read { address: 0x000b, count: 1, unit: UNIT }]
    );
}

/// Tests that an SDM630 is found after the Carlo Gavazzi prober declines.
#[tokio::test]
async fn test_sdm630_selected() {
    let mut mock = MockTransport::new();
    common::sdm630(&mock);

    let found = ProbeRegistry::global().probe(&mut mock, UNIT).await.unwrap();
    assert_eq!(found.info.family, eastron::FAMILY);
    assert_eq!(found.info.model, "SDM630Modbusv2");
    assert_eq!(
        mock.reads(),
        vec![
            TransportCall::Read { address: 0x000b, count: 1, unit: UNIT },
            TransportCall::Read { address: 0xfc02, count: 1, unit: UNIT },
        ]
    );
}

/// Tests that an ABB meter is found last in probing order.
#[tokio::test]
async fn test_abb_selected() {
    let mut mock = MockTransport::new();
    common::abb(&mock);

    let found = ProbeRegistry::global().probe(&mut mock, UNIT).await.unwrap();
    assert_eq!(found.info.family, abb::FAMILY);
    assert_eq!(found.info.model, "ABB_B2x");
    assert_eq!(mock.reads().len(), 3);
}

/// Tests that each family rejects a code outside its table on its own.
#[tokio::test]
async fn test_unknown_code_per_prober() {
    let mut mock = MockTransport::new();
    mock.set_register(UNIT, 0x000b, 999);
    mock.set_register(UNIT, 0xfc02, 999);
    mock.set_register(UNIT, 0x8960, 999);

    for prober in [carlo_gavazzi::prober(), eastron::prober(), abb::prober()] {
        let err = prober.probe(&mut mock, UNIT).await.unwrap_err();
        assert!(
            matches!(err, ProbeError::NoMatch { code: 999, .. }),
            "{}: {err}",
            prober.family()
        );
    }
    assert_eq!(mock.writes().len(), 0);
}

/// Tests that the registry reports no match once any prober got an answer.
#[tokio::test]
async fn test_partial_transport_failure_is_no_match() {
    let mut mock = MockTransport::new();
    mock.fail_next_read(TransportError::Timeout);

    let err = ProbeRegistry::global().probe(&mut mock, UNIT).await.unwrap_err();
    assert!(matches!(err, MeterError::NoMatch));
}

/// Tests that a custom registry honours registration order.
#[tokio::test]
async fn test_custom_order() {
    let mut registry = ProbeRegistry::new();
    registry.register(abb::prober()).unwrap();
    registry.register(carlo_gavazzi::prober()).unwrap();
    assert_eq!(registry.families(), vec!["ABB", "Carlo Gavazzi"]);

    let mut mock = MockTransport::new();
    common::em24(&mock, 0);
    let found = registry.probe(&mut mock, UNIT).await.unwrap();
    assert_eq!(found.info.family, "Carlo Gavazzi");
    assert_eq!(mock.reads().len(), 2);
}
