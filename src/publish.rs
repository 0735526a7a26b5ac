//! # Publication Boundary
//!
//! The core never talks to a bus directly. Changed values, newly active
//! meters and removed meters are handed to a [`Publisher`]. A value of `None`
//! means the path stopped being valid.

use std::sync::{Arc, Mutex, MutexGuard};

use log::info;

use crate::device::DeviceInfo;
use crate::register::FormattedValue;

pub trait Publisher: Send + Sync {
    fn device_added(&self, info: &DeviceInfo);

    fn value_changed(&self, ident: &str, path: &str, value: Option<&FormattedValue>);

    fn device_removed(&self, ident: &str);
}

/// Writes every event to the log at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

impl Publisher for LogPublisher {
    fn device_added(&self, info: &DeviceInfo) {
        match serde_json::to_string(info) {
            Ok(json) => info!(target: "modmeter::publish", "added {json}"),
            Err(_) => info!(target: "modmeter::publish", "added {}", info.ident),
        }
    }

    fn value_changed(&self, ident: &str, path: &str, value: Option<&FormattedValue>) {
        match value {
            Some(value) => info!(target: "modmeter::publish", "{ident}{path} = {value}"),
            None => info!(target: "modmeter::publish", "{ident}{path} invalid"),
        }
    }

    fn device_removed(&self, ident: &str) {
        info!(target: "modmeter::publish", "removed {ident}");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PublishEvent {
    DeviceAdded(DeviceInfo),
    ValueChanged {
        ident: String,
        path: String,
        value: Option<String>,
    },
    DeviceRemoved(String),
}

/// Records events in memory. Clones share the same record.
#[derive(Debug, Default, Clone)]
pub struct MemoryPublisher {
    events: Arc<Mutex<Vec<PublishEvent>>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PublishEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn events(&self) -> Vec<PublishEvent> {
        self.lock().clone()
    }

    /// Most recent published text for `ident`/`path`; `Some(None)` if it was invalidated.
    pub fn latest(&self, ident: &str, path: &str) -> Option<Option<String>> {
        self.lock().iter().rev().find_map(|event| match event {
            PublishEvent::ValueChanged {
                ident: i,
                path: p,
                value,
            } if i == ident && p == path => Some(value.clone()),
            _ => None,
        })
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Publisher for MemoryPublisher {
    fn device_added(&self, info: &DeviceInfo) {
        self.lock().push(PublishEvent::DeviceAdded(info.clone()));
    }

    fn value_changed(&self, ident: &str, path: &str, value: Option<&FormattedValue>) {
        self.lock().push(PublishEvent::ValueChanged {
            ident: ident.to_string(),
            path: path.to_string(),
            value: value.map(|v| v.text.clone()),
        });
    }

    fn device_removed(&self, ident: &str) {
        self.lock().push(PublishEvent::DeviceRemoved(ident.to_string()));
    }
}
