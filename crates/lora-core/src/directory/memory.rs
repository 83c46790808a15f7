// # Memory Device Manager
//
// In-memory implementation of DeviceManager.
//
// ## Purpose
//
// Holds provisioning groups and registered devices for deployments without
// an external device registry, and for tests. Groups can be loaded from a
// static provisioning file:
//
// ```json
// {
//   "groups":  [ { "service": "smartgondor", "subservice": "/gardens", "type": "LoraDevice", ... } ],
//   "devices": [ { "id": "lora_n_003", "service": "smartgondor", ... } ]
// }
// ```
//
// ## Crash Behavior
//
// - Devices auto-registered at runtime are lost on restart
// - They are registered again from their next uplink

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::model::{Device, GroupConfig};
use crate::traits::DeviceManager;

type DeviceKey = (String, String, String);

/// Contents of a static provisioning file
#[derive(Debug, Default, Deserialize)]
pub struct ProvisioningFile {
    #[serde(default)]
    pub groups: Vec<GroupConfig>,

    #[serde(default)]
    pub devices: Vec<Device>,
}

#[derive(Debug, Default)]
struct Directory {
    /// Keyed by application EUI
    groups: HashMap<String, GroupConfig>,
    devices: HashMap<DeviceKey, Device>,
}

/// In-memory device manager
///
/// # Example
///
/// ```rust,no_run
/// use lora_core::directory::MemoryDeviceManager;
/// use lora_core::traits::DeviceManager;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let manager = MemoryDeviceManager::from_file("provisioning.json").await?;
///     let groups = manager.list_configurations().await?;
///     println!("{} groups", groups.len());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryDeviceManager {
    inner: Arc<RwLock<Directory>>,
}

impl MemoryDeviceManager {
    /// Create an empty device manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Load groups and devices from a provisioning file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::config(format!(
                "Failed to read provisioning file {}: {}",
                path.display(),
                e
            ))
        })?;
        let manager = Self::from_json_str(&content).await?;
        tracing::debug!(
            path = %path.display(),
            groups = manager.group_count().await,
            devices = manager.device_count().await,
            "loaded provisioning file"
        );
        Ok(manager)
    }

    /// Load groups and devices from provisioning JSON
    pub async fn from_json_str(json: &str) -> Result<Self> {
        let file: ProvisioningFile = serde_json::from_str(json)?;
        let manager = Self::new();
        for group in file.groups {
            manager.add_group(group).await?;
        }
        for device in file.devices {
            manager.insert_device(device).await;
        }
        Ok(manager)
    }

    /// Add or replace a provisioning group
    ///
    /// The group must carry a `lorawan` block with an `app_eui`.
    pub async fn add_group(&self, group: GroupConfig) -> Result<()> {
        let app_eui = group.lorawan()?.app_eui.filter(|e| !e.is_empty()).ok_or_else(|| {
            Error::config("Missing mandatory configuration attributes for lorawan: app_eui")
        })?;
        self.inner.write().await.groups.insert(app_eui, group);
        Ok(())
    }

    /// Remove the group bound to `app_eui`
    pub async fn remove_group(&self, app_eui: &str) -> Option<GroupConfig> {
        self.inner.write().await.groups.remove(app_eui)
    }

    /// Store a device, replacing any previous registration
    pub async fn insert_device(&self, device: Device) {
        let key = key_of(&device.id, &device.service, &device.subservice);
        self.inner.write().await.devices.insert(key, device);
    }

    pub async fn group_count(&self) -> usize {
        self.inner.read().await.groups.len()
    }

    pub async fn device_count(&self) -> usize {
        self.inner.read().await.devices.len()
    }
}

fn key_of(device_id: &str, service: &str, subservice: &str) -> DeviceKey {
    (
        service.to_string(),
        subservice.to_string(),
        device_id.to_string(),
    )
}

#[async_trait]
impl DeviceManager for MemoryDeviceManager {
    async fn lookup_application_config(&self, app_eui: &str) -> Result<GroupConfig> {
        self.inner
            .read()
            .await
            .groups
            .get(app_eui)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("configuration for application {app_eui}")))
    }

    async fn register_device(&self, device: Device) -> Result<Device> {
        let key = key_of(&device.id, &device.service, &device.subservice);
        let mut guard = self.inner.write().await;
        if guard.devices.contains_key(&key) {
            return Err(Error::duplicate_device(device.id));
        }
        guard.devices.insert(key, device.clone());
        Ok(device)
    }

    async fn unregister_device(&self, device_id: &str, service: &str, subservice: &str)
    -> Result<()> {
        self.inner
            .write()
            .await
            .devices
            .remove(&key_of(device_id, service, subservice))
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("device {device_id}")))
    }

    async fn lookup_device(&self, device_id: &str, service: &str, subservice: &str)
    -> Result<Device> {
        self.inner
            .read()
            .await
            .devices
            .get(&key_of(device_id, service, subservice))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("device {device_id}")))
    }

    async fn list_configurations(&self) -> Result<Vec<GroupConfig>> {
        Ok(self.inner.read().await.groups.values().cloned().collect())
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.inner.read().await.devices.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn provisioning() -> serde_json::Value {
        json!({
            "groups": [{
                "service": "smartgondor",
                "subservice": "/gardens",
                "apikey": "ttn-key",
                "resource": "/iot/d",
                "type": "LoraDevice",
                "attributes": [{"name": "temperature_1", "type": "Number"}],
                "internalAttributes": {
                    "lorawan": {
                        "application_server": {"host": "eu.thethings.network", "provider": "TTN"},
                        "app_eui": "70B3D57ED000985F",
                        "application_id": "ari_ioe_app_demo1"
                    }
                }
            }],
            "devices": [{
                "id": "lora_n_003",
                "service": "smartgondor",
                "subservice": "/gardens",
                "internalAttributes": {"lorawan": {"dev_eui": "3339343752356A14"}}
            }]
        })
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let manager = MemoryDeviceManager::new();
        let device: Device = serde_json::from_value(json!({
            "id": "lora_n_001",
            "service": "smartgondor",
            "subservice": "/gardens"
        }))
        .unwrap();

        manager.register_device(device.clone()).await.unwrap();
        let found = manager
            .lookup_device("lora_n_001", "smartgondor", "/gardens")
            .await
            .unwrap();
        assert_eq!(found, device);

        let err = manager
            .lookup_device("lora_n_001", "smartgondor", "/other")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let manager = MemoryDeviceManager::new();
        let device: Device = serde_json::from_value(json!({"id": "lora_n_001"})).unwrap();

        manager.register_device(device.clone()).await.unwrap();
        let err = manager.register_device(device.clone()).await.unwrap_err();
        assert!(err.is_duplicate_device());

        manager.unregister_device("lora_n_001", "", "").await.unwrap();
        assert!(manager.register_device(device).await.is_ok());
    }

    #[tokio::test]
    async fn test_group_requires_app_eui() {
        let manager = MemoryDeviceManager::new();
        let group: GroupConfig = serde_json::from_value(json!({
            "internalAttributes": {"lorawan": {"application_id": "demo"}}
        }))
        .unwrap();
        assert!(manager.add_group(group).await.is_err());
        assert_eq!(manager.group_count().await, 0);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", provisioning()).unwrap();

        let manager = MemoryDeviceManager::from_file(file.path()).await.unwrap();
        assert_eq!(manager.group_count().await, 1);
        assert_eq!(manager.device_count().await, 1);

        let group = manager
            .lookup_application_config("70B3D57ED000985F")
            .await
            .unwrap();
        assert_eq!(group.entity_type, "LoraDevice");
        assert!(group.tenant().is_group_level());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = MemoryDeviceManager::from_file(dir.path().join("absent.json"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("provisioning file"));
    }
}
