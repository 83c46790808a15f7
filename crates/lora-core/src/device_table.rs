// # Device Table
//
// Per-application index of provisioned devices.
//
// ## Keys
//
// - Device id: unique within the application, primary key
// - Hardware EUI: optional, compared case-insensitively, resolved by a
//   linear scan (devices may be known by id only until an uplink reveals
//   their EUI)
//
// ## Concurrency
//
// The table is shared between the provisioning path and the message path.
// It uses a synchronous parking_lot lock: every operation is a short map
// update and never awaits while holding it.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::model::Device;

#[derive(Debug, Clone)]
struct DeviceEntry {
    eui: Option<String>,
    device: Device,
}

/// Result of [`DeviceTable::add_device`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// New device id
    Inserted,
    /// Same id, identical device object
    Unchanged,
    /// Same id, different device object (replaced)
    Updated,
}

/// In-memory device index for one application
#[derive(Debug, Default)]
pub struct DeviceTable {
    entries: RwLock<HashMap<String, DeviceEntry>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a device
    pub fn add_device(&self, id: &str, eui: Option<&str>, device: Device) -> AddOutcome {
        let mut entries = self.entries.write();
        let eui = eui.filter(|e| !e.is_empty()).map(str::to_string);

        let outcome = match entries.get(id) {
            None => AddOutcome::Inserted,
            Some(existing) if existing.device == device && existing.eui == eui => {
                AddOutcome::Unchanged
            }
            Some(_) => AddOutcome::Updated,
        };

        if outcome != AddOutcome::Unchanged {
            entries.insert(id.to_string(), DeviceEntry { eui, device });
        }
        outcome
    }

    /// Remove a device by id, returning it if present
    pub fn remove_device(&self, id: &str) -> Option<Device> {
        self.entries.write().remove(id).map(|entry| entry.device)
    }

    pub fn get_device(&self, id: &str) -> Option<Device> {
        self.entries.read().get(id).map(|entry| entry.device.clone())
    }

    /// Find a device by hardware EUI, ignoring case
    pub fn get_device_by_eui(&self, eui: &str) -> Option<Device> {
        self.entries
            .read()
            .values()
            .find(|entry| {
                entry
                    .eui
                    .as_deref()
                    .is_some_and(|known| known.eq_ignore_ascii_case(eui))
            })
            .map(|entry| entry.device.clone())
    }

    /// EUI recorded for a device id
    pub fn eui_of(&self, id: &str) -> Option<String> {
        self.entries.read().get(id).and_then(|entry| entry.eui.clone())
    }

    /// Record the EUI of a device known by id only
    ///
    /// Returns `true` if the EUI was learned. An EUI already on record is
    /// never overwritten.
    pub fn record_eui(&self, id: &str, eui: &str) -> bool {
        if eui.is_empty() {
            return false;
        }
        let mut entries = self.entries.write();
        match entries.get_mut(id) {
            Some(entry) if entry.eui.is_none() => {
                entry.eui = Some(eui.to_string());
                true
            }
            _ => false,
        }
    }

    /// Snapshot of `(id, eui, device)` for every entry
    pub fn entries(&self) -> Vec<(String, Option<String>, Device)> {
        self.entries
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.eui.clone(), entry.device.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
