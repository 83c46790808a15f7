// # Device Manager Trait
//
// Interface to the external device-management collaborator that owns
// persistent device and configuration storage.
//
// ## Purpose
//
// The ingestion path only needs three round-trips when an uplink arrives
// from a device it has never seen:
//
// 1. `lookup_application_config`: find the provisioning group of the
//    application the uplink arrived on
// 2. `lookup_device` / `register_device`: resolve or create the device
// 3. `unregister_device`: clear a stale registration before recreating it
//
// The listing operations feed the startup bootstrap.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Device, GroupConfig};

/// Device-management collaborator
#[async_trait]
pub trait DeviceManager: Send + Sync {
    /// Provisioning group bound to an application EUI
    ///
    /// Returns [`crate::Error::NotFound`] if no group references it.
    async fn lookup_application_config(&self, app_eui: &str) -> Result<GroupConfig>;

    /// Register a new device
    ///
    /// Returns [`crate::Error::DuplicateDevice`] if the id is already
    /// registered in the device's service/subservice.
    async fn register_device(&self, device: Device) -> Result<Device>;

    /// Remove a device registration
    async fn unregister_device(&self, device_id: &str, service: &str, subservice: &str)
    -> Result<()>;

    /// Fetch a registered device
    ///
    /// Returns [`crate::Error::NotFound`] if it is not registered.
    async fn lookup_device(&self, device_id: &str, service: &str, subservice: &str)
    -> Result<Device>;

    /// All provisioning groups
    async fn list_configurations(&self) -> Result<Vec<GroupConfig>>;

    /// All registered devices
    async fn list_devices(&self) -> Result<Vec<Device>>;
}
