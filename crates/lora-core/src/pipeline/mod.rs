//! Ingestion pipeline
//!
//! Turns one inbound broker message into at most one attribute update:
//!
//! ```text
//! topic + body ──▶ ProviderAdapter::parse ──▶ DeviceTable lookup
//!                                                 │
//!                       known ◀───────────────────┴──────────▶ unknown
//!                         │                                       │
//!                  codec::decode                      auto-registration task
//!                  codec::to_attributes               (DeviceManager round-trip,
//!                         │                            bounded by a timeout)
//!                         ▼                                       │
//!                  update queue ◀─────────────────────────────────┘
//!                         │
//!                  run_update_emitter ──▶ UpdateSink
//! ```
//!
//! Everything up to the update queue runs inline in the binding's event
//! loop. Only auto-registration and the sink call run out of line.
//! Errors never escape: parse and decode failures are logged and the
//! message is dropped.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::adapters::{ParseContext, ProviderAdapter};
use crate::codec;
use crate::device_table::DeviceTable;
use crate::error::{Error, Result};
use crate::model::{DataModel, DecodedAttribute, Device, UplinkEvent};
use crate::traits::{DeviceManager, MessageHandler, UpdateSink};

/// Decoded attributes waiting for the update sink
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub device: Device,
    pub attributes: Vec<DecodedAttribute>,
    /// When the uplink carrying these attributes arrived
    pub received_at: DateTime<Utc>,
}

/// Application identity the pipeline works for
#[derive(Debug, Clone)]
pub struct PipelineIdentity {
    pub application_id: String,
    pub app_eui: String,
    /// Used for devices without their own data model
    pub data_model: DataModel,
}

struct PipelineShared {
    identity: PipelineIdentity,
    adapter: &'static dyn ProviderAdapter,
    devices: Arc<DeviceTable>,
    manager: Arc<dyn DeviceManager>,
    updates: mpsc::Sender<PendingUpdate>,
    /// Device ids with an auto-registration in flight
    provisioning: Mutex<HashSet<String>>,
    tasks: TaskTracker,
    cancel: CancellationToken,
    provisioning_timeout: Duration,
}

/// Message handler for one application
#[derive(Clone)]
pub struct IngestionPipeline {
    shared: Arc<PipelineShared>,
}

impl IngestionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: PipelineIdentity,
        adapter: &'static dyn ProviderAdapter,
        devices: Arc<DeviceTable>,
        manager: Arc<dyn DeviceManager>,
        updates: mpsc::Sender<PendingUpdate>,
        tasks: TaskTracker,
        cancel: CancellationToken,
        provisioning_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(PipelineShared {
                identity,
                adapter,
                devices,
                manager,
                updates,
                provisioning: Mutex::new(HashSet::new()),
                tasks,
                cancel,
                provisioning_timeout,
            }),
        }
    }

    /// Whether an auto-registration for `device_id` is in flight
    pub fn is_provisioning(&self, device_id: &str) -> bool {
        self.shared.provisioning.lock().contains(device_id)
    }
}

impl MessageHandler for IngestionPipeline {
    fn handle_message(&self, topic: &str, payload: &[u8]) {
        let shared = &self.shared;
        let ctx = ParseContext {
            application_id: &shared.identity.application_id,
            devices: &shared.devices,
            default_data_model: shared.identity.data_model,
        };

        let event = match shared.adapter.parse(topic, payload, &ctx) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    application_id = %shared.identity.application_id,
                    topic,
                    error = %e,
                    "dropping unparseable message"
                );
                return;
            }
        };

        debug!(
            application_id = %shared.identity.application_id,
            device_id = %event.device_id,
            dev_eui = ?event.dev_eui,
            topic,
            "uplink received"
        );

        match shared.devices.get_device(&event.device_id) {
            Some(device) => {
                if let Some(eui) = &event.dev_eui {
                    if shared.devices.record_eui(&device.id, eui) {
                        info!(device_id = %device.id, dev_eui = %eui, "learned device EUI from uplink");
                    }
                }
                shared.emit(&device, &event);
            }
            None => Arc::clone(shared).provision(event),
        }
    }
}

impl PipelineShared {
    /// Decode and queue an update for a resolved device
    fn emit(&self, device: &Device, event: &UplinkEvent) {
        let Some(payload) = &event.payload else {
            debug!(device_id = %device.id, topic = %event.topic, "uplink without payload");
            return;
        };

        let model = event.data_model_hint.unwrap_or_else(|| device.data_model());
        let decoded = match codec::decode(payload, model) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    application_id = %self.identity.application_id,
                    device_id = %device.id,
                    dev_eui = ?event.dev_eui,
                    topic = %event.topic,
                    data_model = model.as_str(),
                    error = %e,
                    "payload decode failed"
                );
                return;
            }
        };

        let attributes = codec::to_attributes(&decoded, device);
        if attributes.is_empty() {
            debug!(device_id = %device.id, "no active attribute matched the payload");
            return;
        }

        let update = PendingUpdate {
            device: device.clone(),
            attributes,
            received_at: event.received_at,
        };
        match self.updates.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    device_id = %device.id,
                    "update queue full, dropping update. Consider increasing update_channel_capacity."
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!(device_id = %device.id, "update queue closed, dropping update");
            }
        }
    }

    /// Resolve an unknown device out of line
    ///
    /// Uplinks for a device whose registration is still in flight are
    /// dropped.
    fn provision(self: Arc<Self>, event: UplinkEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        if !self.provisioning.lock().insert(event.device_id.clone()) {
            debug!(device_id = %event.device_id, "device registration in flight, dropping uplink");
            return;
        }

        info!(
            application_id = %self.identity.application_id,
            app_eui = %self.identity.app_eui,
            device_id = %event.device_id,
            "uplink from unprovisioned device"
        );

        let shared = Arc::clone(&self);
        self.tasks.spawn(async move {
            let outcome = tokio::select! {
                _ = shared.cancel.cancelled() => None,
                result = shared.register_within_timeout(&event) => Some(result),
            };

            match outcome {
                Some(Ok(device)) => {
                    shared
                        .devices
                        .add_device(&device.id, event.dev_eui.as_deref(), device.clone());
                    info!(
                        application_id = %shared.identity.application_id,
                        device_id = %device.id,
                        dev_eui = ?event.dev_eui,
                        "device auto-registered"
                    );
                    shared.emit(&device, &event);
                }
                Some(Err(e)) if e.is_timeout() => {
                    warn!(
                        application_id = %shared.identity.application_id,
                        device_id = %event.device_id,
                        timeout_secs = shared.provisioning_timeout.as_secs(),
                        "device auto-registration timed out"
                    );
                }
                Some(Err(e)) => {
                    error!(
                        application_id = %shared.identity.application_id,
                        app_eui = %shared.identity.app_eui,
                        device_id = %event.device_id,
                        error = %e,
                        "device auto-registration failed"
                    );
                }
                None => {
                    debug!(device_id = %event.device_id, "auto-registration cancelled");
                }
            }

            shared.provisioning.lock().remove(&event.device_id);
        });
    }

    /// [`Self::auto_register`] bounded by the provisioning timeout
    async fn register_within_timeout(&self, event: &UplinkEvent) -> Result<Device> {
        tokio::time::timeout(self.provisioning_timeout, self.auto_register(event))
            .await
            .map_err(|_| {
                Error::timeout(format!(
                    "registration of {} took longer than {:?}",
                    event.device_id, self.provisioning_timeout
                ))
            })?
    }

    /// Register the device with the group bound to this application
    ///
    /// A registration the collaborator already holds is stale (the link to
    /// this application was lost), so it is deleted and recreated once.
    async fn auto_register(&self, event: &UplinkEvent) -> Result<Device> {
        let group = self
            .manager
            .lookup_application_config(&self.identity.app_eui)
            .await?;
        let descriptor = group.new_device(&event.device_id, event.dev_eui.as_deref())?;

        let stale = match self
            .manager
            .lookup_device(&event.device_id, &group.service, &group.subservice)
            .await
        {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };

        if !stale {
            match self.manager.register_device(descriptor.clone()).await {
                Ok(device) => return Ok(device),
                Err(e) if e.is_duplicate_device() => {}
                Err(e) => return Err(e),
            }
        }

        debug!(device_id = %event.device_id, "recreating stale device registration");
        match self
            .manager
            .unregister_device(&event.device_id, &group.service, &group.subservice)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.manager.register_device(descriptor).await
    }
}

/// Drain the update queue into the sink until cancelled or closed
///
/// Updates are published one at a time in queue order. Failures are
/// logged and not retried.
pub async fn run_update_emitter(
    mut updates: mpsc::Receiver<PendingUpdate>,
    sink: Arc<dyn UpdateSink>,
    cancel: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => break,
            update = updates.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };

        match sink
            .publish_attributes(&update.device, &update.attributes)
            .await
        {
            Ok(()) => {
                let latency = Utc::now() - update.received_at;
                debug!(
                    device_id = %update.device.id,
                    attributes = update.attributes.len(),
                    latency_ms = latency.num_milliseconds(),
                    "update published"
                );
            }
            Err(e) => {
                error!(
                    device_id = %update.device.id,
                    error = %e,
                    "couldn't send the updated values to the data platform"
                );
            }
        }
    }
    debug!("update emitter stopped");
}
