//! Integration tests for the meter service: scanning, polling, offline
//! detection, inbound commands and persisted settings.

mod common;

use std::sync::Arc;

use common::{EM24_SERIAL, UNIT};
use modmeter_rs::publish::PublishEvent;
use modmeter_rs::{
    MemoryPublisher, MeterError, MeterRole, MeterService, MockTransport, ServiceCommand,
    ServiceConfig, SettingsChange, SettingsStore, WriteRequest,
};
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

fn ident() -> String {
    format!("cg_{EM24_SERIAL}")
}

fn service_with_em24(config: ServiceConfig) -> (MeterService, MockTransport, MemoryPublisher) {
    let mock = MockTransport::new();
    common::em24(&mock, 0);
    let publisher = MemoryPublisher::new();
    let mut service = MeterService::new(config, Arc::new(publisher.clone())).unwrap();
    service.add_transport(Box::new(mock.clone()), vec![UNIT, 2]);
    (service, mock, publisher)
}

/// Tests that a scan announces the meter with its info and settings.
#[tokio::test]
async fn test_scan_announces_meter() {
    let (mut service, _mock, publisher) = service_with_em24(ServiceConfig::default());

    assert_eq!(service.scan().await, 1);
    let events = publisher.events();
    let PublishEvent::DeviceAdded(info) = &events[0] else {
        panic!("expected DeviceAdded first, got {:?}", events[0]);
    };
    assert_eq!(info.ident, ident());
    assert_eq!(info.phases, 3);
    assert_eq!(info.settings.as_ref().map(|s| s.role), Some(MeterRole::Grid));
    assert_eq!(
        publisher.latest(&ident(), "/PhaseConfig"),
        Some(Some("3P.n".to_string()))
    );

    // Already attached units are not probed again
    assert_eq!(service.scan().await, 0);
    assert_eq!(service.meters().count(), 1);
}

/// Tests that polling publishes decoded values under the device ident.
#[tokio::test]
async fn test_poll_publishes_values() {
    let (mut service, mock, publisher) = service_with_em24(ServiceConfig::default());
    service.scan().await;
    publisher.clear();

    service.poll_all().await;
    assert_eq!(
        publisher.latest(&ident(), "/Ac/L1/Voltage"),
        Some(Some("230.1 V".to_string()))
    );

    mock.set_registers(UNIT, 0x0000, &common::le32(2299));
    publisher.clear();
    service.poll_all().await;
    let changed: Vec<_> = publisher
        .events()
        .into_iter()
        .filter_map(|e| match e {
            PublishEvent::ValueChanged { path, .. } => Some(path),
            _ => None,
        })
        .collect();
    assert_eq!(changed, vec!["/Ac/L1/Voltage".to_string()]);
}

/// Tests that a meter is removed after the failure limit and found again by a rescan.
#[tokio::test]
async fn test_offline_meter_removed_and_rediscovered() {
    let (mut service, mock, publisher) = service_with_em24(ServiceConfig::default());
    service.scan().await;

    mock.set_absent(UNIT);
    service.poll_all().await;
    service.poll_all().await;
    assert_eq!(service.meters().count(), 1);
    service.poll_all().await;
    assert_eq!(service.meters().count(), 0);
    assert_eq!(
        publisher.events().last(),
        Some(&PublishEvent::DeviceRemoved(ident()))
    );

    assert_eq!(service.scan().await, 0);
    mock.set_present(UNIT);
    assert_eq!(service.scan().await, 1);
    assert!(service.meter(&ident()).is_some());
}

/// Tests that a fatally failed unit is never probed again.
#[tokio::test]
async fn test_failed_unit_not_reprobed() {
    let (mut service, mock, publisher) = service_with_em24(ServiceConfig::default());
    mock.set_register(UNIT, 0x1102, 9);

    assert_eq!(service.scan().await, 0);
    mock.clear_calls();
    mock.set_register(UNIT, 0x1102, 0);
    assert_eq!(service.scan().await, 0);
    assert!(mock.reads().iter().all(|call| matches!(
        call,
        modmeter_rs::transport::mock::TransportCall::Read { unit: 2, .. }
    )));
    assert!(publisher.events().is_empty());
}

/// Tests that a write command is answered on its reply channel and re-announces the meter.
#[tokio::test]
async fn test_write_command_reply() {
    let (mut service, mock, publisher) = service_with_em24(ServiceConfig::default());
    service.scan().await;
    publisher.clear();

    let (tx, rx) = oneshot::channel();
    service
        .handle(ServiceCommand::Write(WriteRequest {
            ident: ident(),
            path: "/PhaseConfig".to_string(),
            value: 3.0,
            reply: Some(tx),
        }))
        .await;

    let outcome = rx.await.unwrap().unwrap();
    assert!(outcome.reinitialized);
    assert_eq!(mock.register(UNIT, 0x1102), 3);
    assert_eq!(service.meter(&ident()).unwrap().phases(), 1);

    let events = publisher.events();
    assert_eq!(events[0], PublishEvent::DeviceRemoved(ident()));
    assert!(matches!(&events[1], PublishEvent::DeviceAdded(info) if info.phases == 1));

    let (tx, rx) = oneshot::channel();
    service
        .handle(ServiceCommand::Write(WriteRequest {
            ident: ident(),
            path: "/PhaseConfig".to_string(),
            value: 8.0,
            reply: Some(tx),
        }))
        .await;
    assert!(matches!(rx.await.unwrap(), Err(MeterError::Range { .. })));
}

/// Tests that settings changes are validated and written to disk.
#[tokio::test]
async fn test_settings_persisted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");
    let config = ServiceConfig {
        settings_path: Some(path.clone()),
        ..ServiceConfig::default()
    };
    let (mut service, _mock, publisher) = service_with_em24(config);
    service.scan().await;
    assert!(path.exists());

    let err = service
        .update_settings(&ident(), SettingsChange::Position(1))
        .unwrap_err();
    assert!(matches!(err, MeterError::Settings(_)));

    publisher.clear();
    let (tx, rx) = oneshot::channel();
    service
        .handle(ServiceCommand::UpdateSettings {
            ident: ident(),
            change: SettingsChange::Role(MeterRole::PvInverter),
            reply: Some(tx),
        })
        .await;
    assert_eq!(rx.await.unwrap().unwrap().role, MeterRole::PvInverter);
    service
        .update_settings(&ident(), SettingsChange::Position(2))
        .unwrap();

    // Role changes re-announce the meter
    assert_eq!(publisher.events()[0], PublishEvent::DeviceRemoved(ident()));

    let reloaded = SettingsStore::load(&path).unwrap();
    let settings = reloaded.get(&ident());
    assert_eq!(settings.role, MeterRole::PvInverter);
    assert_eq!(settings.position, Some(2));
}

/// Tests that the run loop exits on shutdown and withdraws every meter.
#[tokio::test]
async fn test_run_until_shutdown() {
    let (service, _mock, publisher) = service_with_em24(ServiceConfig::default());
    let (tx, rx) = mpsc::channel(4);
    tx.send(ServiceCommand::Rescan).await.unwrap();
    tx.send(ServiceCommand::Shutdown).await.unwrap();

    service.run(rx).await;

    let events = publisher.events();
    assert!(matches!(events.first(), Some(PublishEvent::DeviceAdded(_))));
    assert_eq!(events.last(), Some(&PublishEvent::DeviceRemoved(ident())));
}
