//! # Meter Service
//!
//! Drives every configured transport: probes the configured unit ids, keeps
//! the matched meters polled at a fixed interval, drops meters that stop
//! answering, and re-probes empty units periodically.
//!
//! Inbound writes and settings changes arrive as [`ServiceCommand`]s on a
//! channel and are handled between poll cycles, so a write always completes
//! (including its read-back) before the next poll of that transport.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use crate::config::{ServiceConfig, TransportSpec};
use crate::device::{DeviceSettings, Meter, MeterRole, MeterState, SettingsStore, WriteOutcome};
use crate::error::{MeterError, TransportError};
use crate::logging::DiagContext;
use crate::probe::ProbeRegistry;
use crate::publish::Publisher;
use crate::transport::ModbusTransport;
use crate::util::logging::ThrottleManager;

/// Inbound write of a logical value.
#[derive(Debug)]
pub struct WriteRequest {
    pub ident: String,
    pub path: String,
    pub value: f64,
    pub reply: Option<oneshot::Sender<Result<WriteOutcome, MeterError>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettingsChange {
    Role(MeterRole),
    Position(u8),
    CustomName(Option<String>),
}

#[derive(Debug)]
pub enum ServiceCommand {
    Write(WriteRequest),
    UpdateSettings {
        ident: String,
        change: SettingsChange,
        reply: Option<oneshot::Sender<Result<DeviceSettings, MeterError>>>,
    },
    Rescan,
    Shutdown,
}

struct Bus {
    name: String,
    spec: Option<TransportSpec>,
    transport: Option<Box<dyn ModbusTransport>>,
    units: Vec<u8>,
}

struct Slot {
    bus: usize,
    meter: Meter,
    failures: u32,
}

pub struct MeterService {
    config: ServiceConfig,
    registry: ProbeRegistry,
    buses: Vec<Bus>,
    meters: Vec<Slot>,
    /// (bus, unit) pairs whose meter failed initialisation. Never re-probed.
    failed: HashSet<(usize, u8)>,
    publisher: Arc<dyn Publisher>,
    settings: SettingsStore,
    throttle: ThrottleManager,
}

impl MeterService {
    /// Build the service. Transports from `config` are opened on the first scan.
    pub fn new(config: ServiceConfig, publisher: Arc<dyn Publisher>) -> Result<Self, MeterError> {
        let settings = match &config.settings_path {
            Some(path) => SettingsStore::load(path)?,
            None => SettingsStore::in_memory(),
        };
        let buses = config
            .devices
            .iter()
            .map(|device| Bus {
                name: device.transport.describe(),
                spec: Some(device.transport.clone()),
                transport: None,
                units: device.units.clone(),
            })
            .collect();
        Ok(MeterService {
            config,
            registry: ProbeRegistry::with_defaults(),
            buses,
            meters: Vec::new(),
            failed: HashSet::new(),
            publisher,
            settings,
            throttle: ThrottleManager::default(),
        })
    }

    pub fn with_registry(mut self, registry: ProbeRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Attach an already open transport.
    pub fn add_transport(&mut self, transport: Box<dyn ModbusTransport>, units: Vec<u8>) {
        self.buses.push(Bus {
            name: transport.describe(),
            spec: None,
            transport: Some(transport),
            units,
        });
    }

    pub fn meters(&self) -> impl Iterator<Item = &Meter> {
        self.meters.iter().map(|slot| &slot.meter)
    }

    pub fn meter(&self, ident: &str) -> Option<&Meter> {
        self.meters().find(|m| m.ident() == Some(ident))
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    /// Probe every unit without a meter. Returns the number of meters added.
    pub async fn scan(&mut self) -> usize {
        let mut found = Vec::new();

        for (index, bus) in self.buses.iter_mut().enumerate() {
            if bus.transport.is_none() {
                let Some(spec) = &bus.spec else { continue };
                match spec.open(self.config.timeout()).await {
                    Ok(transport) => bus.transport = Some(transport),
                    Err(err) => {
                        if self.throttle.allow(&bus.name) {
                            warn!("Cannot open {}: {err}", bus.name);
                        }
                        continue;
                    }
                }
            }
            let Some(transport) = bus.transport.as_mut() else { continue };

            for &unit in &bus.units {
                let attached = self
                    .meters
                    .iter()
                    .any(|slot| slot.bus == index && slot.meter.unit() == unit);
                if attached || self.failed.contains(&(index, unit)) {
                    continue;
                }

                let probed = match self.registry.probe(transport.as_mut(), unit).await {
                    Ok(probed) => probed,
                    Err(err) => {
                        debug!("{}:{unit}: {err}", bus.name);
                        continue;
                    }
                };

                let ctx = DiagContext::new(format!("{}:{unit}", bus.name));
                let mut meter = Meter::new(probed, ctx);
                match meter.init(transport.as_mut()).await {
                    Ok(()) => found.push(Slot {
                        bus: index,
                        meter,
                        failures: 0,
                    }),
                    Err(err) if err.is_fatal() => {
                        self.failed.insert((index, unit));
                    }
                    Err(err) => debug!("{}:{unit}: init deferred: {err}", bus.name),
                }
            }
        }

        let mut added = 0;
        for slot in found {
            let ident = slot.meter.ident().unwrap_or_default().to_string();
            if self.meter(&ident).is_some() {
                warn!("{ident} already attached, ignoring second instance");
                continue;
            }
            if !self.settings.contains(&ident) {
                if let Err(err) = self.settings.update(&ident, |_| Ok(())) {
                    warn!("{ident}: cannot store settings: {err}");
                }
            }
            self.announce(&slot.meter);
            self.meters.push(slot);
            added += 1;
        }
        added
    }

    /// One polling cycle on every meter, dropping those past the failure limit.
    pub async fn poll_all(&mut self) {
        let mut offline = Vec::new();

        for (index, slot) in self.meters.iter_mut().enumerate() {
            let Some(transport) = self.buses[slot.bus].transport.as_mut() else {
                continue;
            };
            let ident = slot.meter.ident().unwrap_or_default().to_string();
            match slot.meter.update(transport.as_mut()).await {
                Ok(outcome) => {
                    if slot.failures > 0 {
                        info!("{ident} answering again");
                        self.throttle.clear(&ident);
                    }
                    slot.failures = 0;
                    for update in &outcome.updates {
                        self.publisher
                            .value_changed(&ident, &update.path, update.value.as_ref());
                    }
                }
                Err(err) => {
                    slot.failures += 1;
                    if self.throttle.allow(&ident) {
                        warn!(
                            "{ident}: poll failed ({}/{}): {err}",
                            slot.failures, self.config.max_failures
                        );
                    }
                    if slot.failures >= self.config.max_failures {
                        offline.push(index);
                    }
                }
            }
        }

        for index in offline.into_iter().rev() {
            let slot = self.meters.remove(index);
            let ident = slot.meter.ident().unwrap_or_default();
            warn!("{ident} offline, removing");
            self.publisher.device_removed(ident);
        }
    }

    pub async fn handle(&mut self, command: ServiceCommand) {
        match command {
            ServiceCommand::Write(request) => {
                let result = self
                    .write(&request.ident, &request.path, request.value)
                    .await;
                if let Err(err) = &result {
                    warn!("{}{}: write rejected: {err}", request.ident, request.path);
                }
                if let Some(reply) = request.reply {
                    let _ = reply.send(result);
                }
            }
            ServiceCommand::UpdateSettings {
                ident,
                change,
                reply,
            } => {
                let result = self.update_settings(&ident, change);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            ServiceCommand::Rescan => {
                self.scan().await;
            }
            ServiceCommand::Shutdown => {}
        }
    }

    /// Apply an inbound write to the meter with `ident`.
    pub async fn write(
        &mut self,
        ident: &str,
        path: &str,
        value: f64,
    ) -> Result<WriteOutcome, MeterError> {
        let index = self
            .meters
            .iter()
            .position(|slot| slot.meter.ident() == Some(ident))
            .ok_or_else(|| MeterError::NotActive(ident.to_string()))?;
        let slot = &mut self.meters[index];
        let transport = self.buses[slot.bus]
            .transport
            .as_mut()
            .ok_or(MeterError::Transport(TransportError::NotConnected))?;

        let result = slot.meter.write(transport.as_mut(), path, value).await;
        match &result {
            Ok(outcome) if outcome.reinitialized => {
                self.publisher.device_removed(ident);
                self.announce(&self.meters[index].meter);
            }
            Err(_) if slot.meter.state() == MeterState::Failed => {
                let slot = self.meters.remove(index);
                self.failed.insert((slot.bus, slot.meter.unit()));
                self.publisher.device_removed(ident);
            }
            _ => {}
        }
        result
    }

    pub fn update_settings(
        &mut self,
        ident: &str,
        change: SettingsChange,
    ) -> Result<DeviceSettings, MeterError> {
        let role_change = matches!(change, SettingsChange::Role(_));
        let settings = self.settings.update(ident, |settings| match change {
            SettingsChange::Role(role) => {
                settings.set_role(role);
                Ok(())
            }
            SettingsChange::Position(position) => settings.set_position(position),
            SettingsChange::CustomName(name) => {
                settings.set_custom_name(name);
                Ok(())
            }
        })?;

        if role_change {
            if let Some(meter) = self.meter(ident) {
                self.publisher.device_removed(ident);
                self.announce(meter);
            }
        }
        Ok(settings)
    }

    /// Scan, then poll and rescan on their intervals while serving commands.
    /// Returns when a `Shutdown` arrives or the channel closes.
    pub async fn run(mut self, mut commands: mpsc::Receiver<ServiceCommand>) {
        let added = self.scan().await;
        info!("Started with {added} meter(s)");

        let mut poll = interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let rescan_every = self.config.rescan_interval();
        let mut rescan = interval_at(Instant::now() + rescan_every, rescan_every);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll.tick() => self.poll_all().await,
                _ = rescan.tick() => {
                    let added = self.scan().await;
                    if added > 0 {
                        info!("Rescan found {added} meter(s)");
                    }
                }
                command = commands.recv() => match command {
                    Some(ServiceCommand::Shutdown) | None => break,
                    Some(command) => self.handle(command).await,
                },
            }
        }

        for slot in self.meters.drain(..) {
            self.publisher
                .device_removed(slot.meter.ident().unwrap_or_default());
        }
        info!("Stopped");
    }

    /// Publish a meter as added, followed by all of its current values.
    fn announce(&self, meter: &Meter) {
        let Some(mut device) = meter.device_info() else {
            return;
        };
        device.settings = Some(self.settings.get(&device.ident));
        self.publisher.device_added(&device);
        for (path, value) in meter.snapshot() {
            self.publisher.value_changed(&device.ident, &path, Some(&value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::MemoryPublisher;
    use crate::transport::MockTransport;

    #[tokio::test]
    async fn test_scan_without_meters() {
        let publisher = MemoryPublisher::new();
        let mut service =
            MeterService::new(ServiceConfig::default(), Arc::new(publisher.clone())).unwrap();
        service.add_transport(Box::new(MockTransport::new()), vec![1, 2]);

        assert_eq!(service.scan().await, 0);
        assert!(publisher.events().is_empty());
        assert_eq!(service.meters().count(), 0);
    }

    #[tokio::test]
    async fn test_write_to_unknown_device() {
        let mut service =
            MeterService::new(ServiceConfig::default(), Arc::new(MemoryPublisher::new())).unwrap();
        let err = service.write("cg_missing", "/PhaseConfig", 1.0).await.unwrap_err();
        assert!(matches!(err, MeterError::NotActive(_)));
    }
}
