//! Application registry
//!
//! The registry is the single owner of every live [`Application`], keyed
//! by provider application EUI. The provisioning control path goes
//! through it: configuration groups and devices arrive here, are matched
//! against the applications already running and either join one, replace
//! one or start a new one.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lora_core::{AgentConfig, ApplicationRegistry, LogUpdateSink, MemoryDeviceManager};
//!
//! let registry = ApplicationRegistry::new(
//!     transport,
//!     Arc::new(MemoryDeviceManager::from_file("provisioning.json").await?),
//!     Arc::new(LogUpdateSink::new()),
//!     AgentConfig::default(),
//! );
//!
//! // Start every application the device manager knows about
//! registry.bootstrap().await?;
//! ```
//!
//! ## Tenant rules
//!
//! - At most one application per app EUI.
//! - At most one application per group-level tenant tuple. A group that
//!   is provisioned again replaces the application it created before.
//! - Once an application is bound to an app EUI, a registration for a
//!   different tenant (or a tenant for an application created by a
//!   device) is rejected.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::{Application, ApplicationConfig};
use crate::config::{AgentConfig, LorawanConfig};
use crate::device_table::AddOutcome;
use crate::error::{Error, Result};
use crate::model::{Device, GroupConfig, TenantConfig};
use crate::traits::{DeviceManager, Transport, UpdateSink};

/// Owner of every live application
pub struct ApplicationRegistry {
    applications: RwLock<HashMap<String, Arc<Application>>>,
    transport: Arc<dyn Transport>,
    manager: Arc<dyn DeviceManager>,
    sink: Arc<dyn UpdateSink>,
    config: AgentConfig,
    cancel: CancellationToken,
}

impl ApplicationRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        manager: Arc<dyn DeviceManager>,
        sink: Arc<dyn UpdateSink>,
        config: AgentConfig,
    ) -> Self {
        Self {
            applications: RwLock::new(HashMap::new()),
            transport,
            manager,
            sink,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Find or create the application a `lorawan` block describes
    ///
    /// Validation happens before anything is touched, so a rejected
    /// registration leaves the registry as it was.
    pub async fn register_application(
        &self,
        lorawan: &LorawanConfig,
        tenant: Option<TenantConfig>,
    ) -> Result<Arc<Application>> {
        let config = ApplicationConfig::from_lorawan(lorawan, tenant)?;
        let mut applications = self.applications.write().await;

        if let Some(tenant) = config.tenant.as_ref().filter(|t| t.is_group_level()) {
            let replaced: Vec<String> = applications
                .iter()
                .filter(|(_, app)| app.tenant() == Some(tenant))
                .map(|(app_eui, _)| app_eui.clone())
                .collect();
            for app_eui in replaced {
                if let Some(app) = applications.remove(&app_eui) {
                    info!(
                        app_eui = %app_eui,
                        service = %tenant.service,
                        subservice = %tenant.subservice,
                        "updating existing device group configuration"
                    );
                    app.stop().await;
                }
            }
        }

        if let Some(existing) = applications.get(&config.app_eui) {
            debug!(app_eui = %config.app_eui, "LoRaWAN application exists");
            return match (&config.tenant, existing.tenant()) {
                (None, _) => Ok(Arc::clone(existing)),
                (Some(new), Some(current)) if new == current => Ok(Arc::clone(existing)),
                (Some(_), _) => {
                    error!(
                        app_eui = %config.app_eui,
                        application_id = %config.application_id,
                        "cannot reassign an application to a new tenant"
                    );
                    Err(Error::config(format!(
                        "cannot reassign an application to a new tenant: {}",
                        config.app_eui
                    )))
                }
            };
        }

        let app = Arc::new(self.build(config));
        app.start();
        applications.insert(app.app_eui().to_string(), Arc::clone(&app));
        Ok(app)
    }

    /// Provision a configuration group
    ///
    /// The group's application observes every device through the wildcard
    /// topic, so uplinks from devices nobody provisioned yet reach the
    /// auto-registration path.
    pub async fn register_configuration(&self, group: &GroupConfig) -> Result<Arc<Application>> {
        info!(
            service = %group.service,
            subservice = %group.subservice,
            entity_type = %group.entity_type,
            "configuration provisioning"
        );
        let lorawan = group.lorawan()?;
        let app = self
            .register_application(&lorawan, Some(group.tenant()))
            .await?;
        app.observe_all_devices().await?;
        Ok(app)
    }

    /// Stop and forget the application a group created
    pub async fn remove_configuration(&self, group: &GroupConfig) -> Result<()> {
        let lorawan = group.lorawan()?;
        let Some(app_eui) = lorawan.app_eui else {
            return Err(Error::config(
                "Missing mandatory configuration attributes for lorawan: app_eui",
            ));
        };

        let removed = self.applications.write().await.remove(&app_eui);
        match removed {
            Some(app) => {
                info!(app_eui = %app_eui, "removing configuration");
                app.stop().await;
            }
            None => debug!(app_eui = %app_eui, "no application for removed configuration"),
        }
        Ok(())
    }

    /// Provision one device
    pub async fn register_device(&self, device: &Device) -> Result<Arc<Application>> {
        info!(device_id = %device.id, service = %device.service, "device provisioning");
        let lorawan = device.lorawan()?;
        let app = self.register_application(&lorawan, None).await?;
        app.add_device(&device.id, lorawan.dev_eui.as_deref(), device.clone())
            .await?;
        Ok(app)
    }

    /// Apply a changed device descriptor
    ///
    /// When the device's provider settings differ from its application's,
    /// the application is replaced (stop, then a new one with the same
    /// tenant, devices and wildcard). A device whose descriptor changed is
    /// then removed and added again, and its registration with the device
    /// manager is recreated.
    pub async fn update_device(&self, device: &Device) -> Result<Arc<Application>> {
        info!(device_id = %device.id, "updating device");
        let lorawan = device.lorawan()?;
        let app_eui = lorawan.app_eui.clone().unwrap_or_default();

        let Some(app) = self.application_for_update(&app_eui, &lorawan).await? else {
            debug!(device_id = %device.id, app_eui = %app_eui, "no application yet, provisioning device");
            return self.register_device(device).await;
        };

        if app.get_device(&device.id).as_ref() != Some(device) {
            app.remove_device(&device.id, lorawan.dev_eui.as_deref()).await;
            app.add_device(&device.id, lorawan.dev_eui.as_deref(), device.clone())
                .await?;

            match self
                .manager
                .unregister_device(&device.id, &device.service, &device.subservice)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            self.manager.register_device(device.clone()).await?;
        }
        Ok(app)
    }

    /// Deprovision one device
    pub async fn remove_device(&self, device: &Device) -> Result<()> {
        info!(device_id = %device.id, "removing device");
        let lorawan = device.lorawan()?;
        let app_eui = lorawan.app_eui.unwrap_or_default();

        let app = self.applications.read().await.get(&app_eui).cloned();
        match app {
            Some(app) => {
                app.remove_device(&device.id, lorawan.dev_eui.as_deref()).await;
            }
            None => debug!(device_id = %device.id, app_eui = %app_eui, "no application for removed device"),
        }
        Ok(())
    }

    /// Application bound to a tenant tuple
    pub async fn find_application(
        &self,
        service: &str,
        subservice: &str,
        apikey: Option<&str>,
        resource: Option<&str>,
    ) -> Option<Arc<Application>> {
        self.applications
            .read()
            .await
            .values()
            .find(|app| {
                app.tenant()
                    .is_some_and(|t| t.matches(service, subservice, apikey, resource))
            })
            .cloned()
    }

    pub async fn get(&self, app_eui: &str) -> Option<Arc<Application>> {
        self.applications.read().await.get(app_eui).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<Application>> {
        self.applications.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.applications.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.applications.read().await.is_empty()
    }

    /// Drop applications whose broker binding gave up
    ///
    /// Returns the app EUIs that were removed.
    pub async fn reap_failed(&self) -> Vec<String> {
        let mut applications = self.applications.write().await;
        let failed: Vec<String> = applications
            .iter()
            .filter(|(_, app)| app.is_failed())
            .map(|(app_eui, _)| app_eui.clone())
            .collect();

        for app_eui in &failed {
            if let Some(app) = applications.remove(app_eui) {
                error!(
                    app_eui = %app_eui,
                    application_id = %app.application_id(),
                    "application stopped after exhausting reconnect attempts"
                );
                app.stop().await;
            }
        }
        failed
    }

    /// Stop every application
    pub async fn stop_all(&self) {
        let applications: Vec<Arc<Application>> = self
            .applications
            .write()
            .await
            .drain()
            .map(|(_, app)| app)
            .collect();

        for app in applications {
            info!(app_eui = %app.app_eui(), "stopping application");
            app.stop().await;
        }
        self.cancel.cancel();
    }

    /// Start every group and device the device manager knows about
    ///
    /// Groups go first so devices join the applications their groups
    /// created. Individual failures are logged and skipped.
    pub async fn bootstrap(&self) -> Result<()> {
        let groups = self.manager.list_configurations().await?;
        for group in &groups {
            if let Err(e) = self.register_configuration(group).await {
                warn!(
                    service = %group.service,
                    subservice = %group.subservice,
                    error = %e,
                    "skipping configuration"
                );
            }
        }

        let devices = self.manager.list_devices().await?;
        for device in &devices {
            if let Err(e) = self.register_device(device).await {
                warn!(device_id = %device.id, error = %e, "skipping device");
            }
        }

        info!(
            configurations = groups.len(),
            devices = devices.len(),
            applications = self.len().await,
            "bootstrap complete"
        );
        Ok(())
    }

    fn build(&self, config: ApplicationConfig) -> Application {
        Application::new(
            config,
            Arc::clone(&self.transport),
            Arc::clone(&self.manager),
            Arc::clone(&self.sink),
            &self.config,
            &self.cancel,
        )
    }

    /// Application to apply a device update to, replacing it first when
    /// `lorawan` changed its provider settings
    ///
    /// The lookup, the comparison and the replacement happen under one
    /// write lock, so concurrent updates always replace the application
    /// that is actually registered. `None` when no application exists.
    async fn application_for_update(
        &self,
        app_eui: &str,
        lorawan: &LorawanConfig,
    ) -> Result<Option<Arc<Application>>> {
        let mut applications = self.applications.write().await;
        let Some(current) = applications.get(app_eui).cloned() else {
            return Ok(None);
        };
        if current.config().lorawan.same_application(lorawan) {
            return Ok(Some(current));
        }

        info!(app_eui = %app_eui, "configuration changed");
        let config = ApplicationConfig::from_lorawan(lorawan, current.tenant().cloned())?;

        let observed_all = current
            .binding()
            .is_desired(&current.wildcard_topic())
            .await;
        let devices = current.devices().entries();
        applications.remove(app_eui);
        current.stop().await;

        let app = Arc::new(self.build(config));
        app.start();
        applications.insert(app.app_eui().to_string(), Arc::clone(&app));

        if observed_all {
            app.observe_all_devices().await?;
        }
        for (id, eui, device) in devices {
            match app.add_device(&id, eui.as_deref(), device).await {
                Ok(AddOutcome::Inserted) => {}
                Ok(_) => debug!(device_id = %id, "device already migrated"),
                Err(e) => warn!(device_id = %id, error = %e, "device not migrated"),
            }
        }
        Ok(Some(app))
    }
}
