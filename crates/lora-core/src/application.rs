//! One live provider application
//!
//! An [`Application`] ties together the pieces that serve one
//! provider-level application (identified by its app EUI): the adapter
//! for its provider, its device table, its broker binding and the
//! ingestion pipeline that handles the binding's messages. It also owns
//! the cancellation token and task tracker for everything it spawns.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::adapters::{ProviderAdapter, adapter_for};
use crate::binding::{BrokerBinding, ConnectionState, StopReason};
use crate::config::{AgentConfig, ApplicationServerConfig, LorawanConfig, ProviderKind};
use crate::device_table::{AddOutcome, DeviceTable};
use crate::error::{Error, Result};
use crate::model::{DataModel, Device, TenantConfig};
use crate::pipeline::{IngestionPipeline, PendingUpdate, PipelineIdentity, run_update_emitter};
use crate::traits::{ConnectOptions, DeviceManager, Transport, UpdateSink};

/// Validated settings of one application
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationConfig {
    pub provider: ProviderKind,
    pub server: ApplicationServerConfig,
    pub app_eui: String,
    pub application_id: String,
    pub application_key: Option<String>,
    pub data_model: DataModel,
    /// Set when the application was created for a provisioning group
    pub tenant: Option<TenantConfig>,
    /// The block this config was built from, kept for change detection
    pub lorawan: LorawanConfig,
}

impl ApplicationConfig {
    /// Validate a `lorawan` block and build the application settings
    pub fn from_lorawan(lorawan: &LorawanConfig, tenant: Option<TenantConfig>) -> Result<Self> {
        lorawan.validate()?;

        let server = lorawan
            .application_server
            .clone()
            .ok_or_else(|| Error::config("lorawan.application_server is required"))?;
        let provider = server.provider.parse()?;
        let app_eui = lorawan.app_eui.clone().unwrap_or_default();
        let application_id = lorawan.application_id.clone().unwrap_or_default();

        let mut lorawan = lorawan.clone();
        lorawan.dev_eui = None;

        Ok(Self {
            provider,
            server,
            app_eui,
            application_id,
            application_key: lorawan.application_key.clone(),
            data_model: lorawan.data_model.unwrap_or_default(),
            tenant,
            lorawan,
        })
    }
}

/// A running application
pub struct Application {
    config: ApplicationConfig,
    adapter: &'static dyn ProviderAdapter,
    devices: Arc<DeviceTable>,
    binding: BrokerBinding,
    pipeline: IngestionPipeline,
    sink: Arc<dyn UpdateSink>,
    updates: Mutex<Option<mpsc::Receiver<PendingUpdate>>>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl Application {
    /// Build an application; nothing runs until [`Application::start`]
    pub fn new(
        config: ApplicationConfig,
        transport: Arc<dyn Transport>,
        manager: Arc<dyn DeviceManager>,
        sink: Arc<dyn UpdateSink>,
        agent: &AgentConfig,
        parent: &CancellationToken,
    ) -> Self {
        let adapter = adapter_for(config.provider);
        let devices = Arc::new(DeviceTable::new());
        let tasks = TaskTracker::new();
        let cancel = parent.child_token();
        let (update_tx, update_rx) = mpsc::channel(agent.pipeline.update_channel_capacity);

        let pipeline = IngestionPipeline::new(
            PipelineIdentity {
                application_id: config.application_id.clone(),
                app_eui: config.app_eui.clone(),
                data_model: config.data_model,
            },
            adapter,
            Arc::clone(&devices),
            manager,
            update_tx,
            tasks.clone(),
            cancel.clone(),
            agent.pipeline.provisioning_timeout(),
        );

        let scheme = config
            .server
            .protocol
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| adapter.default_scheme().to_string());
        let options = ConnectOptions {
            host: config.server.host.clone(),
            port: config
                .server
                .port
                .unwrap_or_else(|| adapter.default_port(&scheme)),
            scheme,
            username: config.server.username.clone(),
            password: config.server.password.clone(),
            client_id: format!(
                "{}-{}",
                agent.binding.client_id_prefix,
                config.app_eui.to_lowercase()
            ),
            keep_alive: std::time::Duration::from_secs(agent.binding.keep_alive_secs),
        };

        let binding = BrokerBinding::new(
            config.application_id.clone(),
            options,
            transport,
            Arc::new(pipeline.clone()),
            agent.binding.clone(),
            cancel.child_token(),
        );

        Self {
            config,
            adapter,
            devices,
            binding,
            pipeline,
            sink,
            updates: Mutex::new(Some(update_rx)),
            tasks,
            cancel,
        }
    }

    /// Start the update emitter and the broker binding
    pub fn start(&self) {
        if let Some(updates) = self.updates.lock().take() {
            self.tasks.spawn(run_update_emitter(
                updates,
                Arc::clone(&self.sink),
                self.cancel.clone(),
            ));
        }
        self.binding.start();
        info!(
            application_id = %self.config.application_id,
            app_eui = %self.config.app_eui,
            provider = %self.config.provider,
            host = %self.config.server.host,
            "application started"
        );
    }

    /// Stop the application and wait for its tasks
    ///
    /// Releases the wildcard subscription, then closes the broker session.
    /// Idempotent.
    pub async fn stop(&self) {
        if let Err(e) = self.stop_observing_all_devices().await {
            debug!(application_id = %self.config.application_id, error = %e, "wildcard release failed");
        }
        self.cancel.cancel();
        self.binding.stop().await;
        self.tasks.close();
        self.tasks.wait().await;
        info!(
            application_id = %self.config.application_id,
            app_eui = %self.config.app_eui,
            "application stopped"
        );
    }

    /// Add or update a device and subscribe to its topic
    ///
    /// The device topic is built first, so a device the provider cannot
    /// address (missing EUI) is rejected without touching the table. No
    /// per-device subscription is made while the wildcard is subscribed.
    pub async fn add_device(&self, id: &str, eui: Option<&str>, device: Device) -> Result<AddOutcome> {
        let eui = eui.filter(|e| !e.is_empty());
        let topic = self
            .adapter
            .device_topic(&self.config.application_id, id, eui)?;
        let previous_topic = self
            .devices
            .eui_of(id)
            .and_then(|old| {
                self.adapter
                    .device_topic(&self.config.application_id, id, Some(&old))
                    .ok()
            })
            .filter(|old| *old != topic);

        let outcome = self.devices.add_device(id, eui, device);
        match outcome {
            AddOutcome::Unchanged => {
                info!(device_id = id, "device already provisioned");
                return Ok(outcome);
            }
            AddOutcome::Updated => {
                info!(device_id = id, "updating device object");
                if let Some(old) = previous_topic {
                    self.release_topic(&old).await;
                }
            }
            AddOutcome::Inserted => {
                debug!(device_id = id, dev_eui = ?eui, "device added");
            }
        }

        if self.binding.is_desired(&self.wildcard_topic()).await {
            debug!(device_id = id, "device covered by wildcard subscription");
        } else {
            self.observe_topic(&topic).await;
        }
        Ok(outcome)
    }

    /// Release a device's topic, then forget the device
    pub async fn remove_device(&self, id: &str, eui: Option<&str>) -> Option<Device> {
        let eui = eui
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .or_else(|| self.devices.eui_of(id));

        match self
            .adapter
            .device_topic(&self.config.application_id, id, eui.as_deref())
        {
            Ok(topic) => self.release_topic(&topic).await,
            Err(e) => debug!(device_id = id, error = %e, "no device topic to release"),
        }

        let removed = self.devices.remove_device(id);
        if removed.is_some() {
            info!(application_id = %self.config.application_id, device_id = id, "device removed");
        }
        removed
    }

    /// Subscribe to one device's topic
    pub async fn observe_device(&self, id: &str, eui: Option<&str>) -> Result<()> {
        let topic = self
            .adapter
            .device_topic(&self.config.application_id, id, eui)?;
        self.binding.subscribe(&topic).await
    }

    /// Unsubscribe from one device's topic
    pub async fn stop_observing_device(&self, id: &str, eui: Option<&str>) -> Result<()> {
        let topic = self
            .adapter
            .device_topic(&self.config.application_id, id, eui)?;
        self.binding.unsubscribe(&topic).await
    }

    /// Subscribe to the wildcard topic covering every device
    pub async fn observe_all_devices(&self) -> Result<()> {
        self.binding.subscribe(&self.wildcard_topic()).await
    }

    pub async fn stop_observing_all_devices(&self) -> Result<()> {
        self.binding.unsubscribe(&self.wildcard_topic()).await
    }

    /// True once the binding gave up reconnecting
    pub fn is_failed(&self) -> bool {
        self.binding.state() == ConnectionState::Stopped(StopReason::RetriesExhausted)
    }

    pub fn wildcard_topic(&self) -> String {
        self.adapter.wildcard_topic(&self.config.application_id)
    }

    pub fn config(&self) -> &ApplicationConfig {
        &self.config
    }

    pub fn app_eui(&self) -> &str {
        &self.config.app_eui
    }

    pub fn application_id(&self) -> &str {
        &self.config.application_id
    }

    pub fn tenant(&self) -> Option<&TenantConfig> {
        self.config.tenant.as_ref()
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    pub fn binding(&self) -> &BrokerBinding {
        &self.binding
    }

    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    pub fn get_device(&self, id: &str) -> Option<Device> {
        self.devices.get_device(id)
    }

    pub fn get_device_by_eui(&self, eui: &str) -> Option<Device> {
        self.devices.get_device_by_eui(eui)
    }

    async fn observe_topic(&self, topic: &str) {
        if let Err(e) = self.binding.subscribe(topic).await {
            warn!(application_id = %self.config.application_id, topic, error = %e, "subscribe failed, retried on reconnect");
        }
    }

    async fn release_topic(&self, topic: &str) {
        if let Err(e) = self.binding.unsubscribe(topic).await {
            warn!(application_id = %self.config.application_id, topic, error = %e, "unsubscribe failed");
        }
    }
}
