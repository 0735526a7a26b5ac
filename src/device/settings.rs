//! # Device Settings
//!
//! Role, position, instance and custom name of each meter, keyed by device
//! ident and persisted as JSON so a meter keeps its settings across restarts
//! and re-probes.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::MeterError;

pub const DEFAULT_INSTANCE: u16 = 40;
pub const MAX_POSITION: u8 = 2;

/// What the meter measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterRole {
    #[default]
    Grid,
    PvInverter,
    Genset,
    AcLoad,
}

impl MeterRole {
    pub const ALL: [MeterRole; 4] = [
        MeterRole::Grid,
        MeterRole::PvInverter,
        MeterRole::Genset,
        MeterRole::AcLoad,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MeterRole::Grid => "grid",
            MeterRole::PvInverter => "pvinverter",
            MeterRole::Genset => "genset",
            MeterRole::AcLoad => "acload",
        }
    }

    /// Only PV inverter meters carry a position.
    pub fn has_position(&self) -> bool {
        matches!(self, MeterRole::PvInverter)
    }
}

impl fmt::Display for MeterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeterRole {
    type Err = MeterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MeterRole::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| MeterError::Settings(format!("unknown role: {s}")))
    }
}

fn default_instance() -> u16 {
    DEFAULT_INSTANCE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default)]
    pub role: MeterRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u8>,
    #[serde(default = "default_instance")]
    pub instance: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings {
            role: MeterRole::Grid,
            position: None,
            instance: DEFAULT_INSTANCE,
            custom_name: None,
        }
    }
}

impl DeviceSettings {
    /// Switch role. Entering the PV inverter role starts at position 0,
    /// leaving it drops the position.
    pub fn set_role(&mut self, role: MeterRole) {
        self.role = role;
        self.position = if role.has_position() {
            Some(self.position.unwrap_or(0))
        } else {
            None
        };
    }

    pub fn set_position(&mut self, position: u8) -> Result<(), MeterError> {
        if !self.role.has_position() {
            return Err(MeterError::Settings(format!(
                "role {} has no position",
                self.role
            )));
        }
        if position > MAX_POSITION {
            return Err(MeterError::Settings(format!(
                "position {position} outside [0, {MAX_POSITION}]"
            )));
        }
        self.position = Some(position);
        Ok(())
    }

    pub fn set_custom_name(&mut self, name: Option<String>) {
        self.custom_name = name.filter(|n| !n.trim().is_empty());
    }

    /// Reject combinations a hand-edited file could contain.
    pub fn validate(&self) -> Result<(), MeterError> {
        match (self.role.has_position(), self.position) {
            (false, Some(_)) => Err(MeterError::Settings(format!(
                "role {} has no position",
                self.role
            ))),
            (true, Some(p)) if p > MAX_POSITION => Err(MeterError::Settings(format!(
                "position {p} outside [0, {MAX_POSITION}]"
            ))),
            _ => Ok(()),
        }
    }
}

/// Settings of every known device, optionally backed by a JSON file.
#[derive(Debug, Default)]
pub struct SettingsStore {
    path: Option<PathBuf>,
    devices: BTreeMap<String, DeviceSettings>,
}

impl SettingsStore {
    /// Store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`. A missing file yields an empty store bound to `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MeterError> {
        let path = path.as_ref();
        let devices: BTreeMap<String, DeviceSettings> = if path.exists() {
            serde_json::from_str(&fs::read_to_string(path)?)?
        } else {
            BTreeMap::new()
        };
        for (ident, settings) in &devices {
            settings
                .validate()
                .map_err(|e| MeterError::Settings(format!("{ident}: {e}")))?;
        }
        debug!("Loaded settings for {} devices from {}", devices.len(), path.display());
        Ok(SettingsStore {
            path: Some(path.to_path_buf()),
            devices,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Settings for `ident`, defaults if never stored.
    pub fn get(&self, ident: &str) -> DeviceSettings {
        self.devices.get(ident).cloned().unwrap_or_default()
    }

    pub fn contains(&self, ident: &str) -> bool {
        self.devices.contains_key(ident)
    }

    pub fn idents(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    /// Apply `change` to a copy of the settings; commit and persist only if it succeeds.
    pub fn update<F>(&mut self, ident: &str, change: F) -> Result<DeviceSettings, MeterError>
    where
        F: FnOnce(&mut DeviceSettings) -> Result<(), MeterError>,
    {
        let mut settings = self.get(ident);
        change(&mut settings)?;
        settings.validate()?;
        self.devices.insert(ident.to_string(), settings.clone());
        self.save()?;
        Ok(settings)
    }

    pub fn save(&self) -> Result<(), MeterError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.devices)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
