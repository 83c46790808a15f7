//! Test doubles and common utilities for contract tests
//!
//! The doubles record what the core asks of its collaborators (broker
//! connects and subscriptions, device-manager round-trips, published
//! updates) and let a test drive broker sessions by hand.

#![allow(dead_code)]

use async_trait::async_trait;
use lora_core::config::{AgentConfig, BindingConfig, PipelineConfig};
use lora_core::directory::MemoryDeviceManager;
use lora_core::error::{Error, Result};
use lora_core::model::{DecodedAttribute, Device, GroupConfig};
use lora_core::traits::{
    ConnectOptions, DeviceManager, Transport, TransportConnection, TransportEvent,
    TransportHandle, UpdateSink,
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const TTN_APP_ID: &str = "ari_ioe_app_demo1";
pub const TTN_APP_EUI: &str = "70B3D57ED000985F";
pub const DEV_EUI: &str = "3339343752356A14";

/// Base64 CayenneLPP payload: temperature_1=27.2, relative_humidity_2=0,
/// barometric_pressure_0=0, digital_in_3=100, digital_out_4=0
pub const CAYENNE_PAYLOAD: &str = "AHMAAAFnARACaAADAGQEAQA=";

/// A transport-level call made through a session handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Subscribe { session: usize, topic: String },
    Unsubscribe { session: usize, topic: String },
    Disconnect { session: usize },
}

/// A Transport whose sessions are driven by the test
///
/// Every `connect` opens a session fed by an unbounded channel. With
/// `auto_accept` the session reports `Connected` immediately.
pub struct ControlledTransport {
    connect_count: Arc<AtomicUsize>,
    /// Upcoming connects to refuse
    refuse_connects: Arc<AtomicUsize>,
    /// Refuse every connect
    refuse_all: Arc<AtomicBool>,
    auto_accept: bool,
    sessions: Arc<Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>>,
    calls: Arc<Mutex<Vec<Call>>>,
    last_options: Arc<Mutex<Option<ConnectOptions>>>,
}

impl ControlledTransport {
    /// Sessions are accepted as soon as they open
    pub fn new() -> Self {
        Self::with_auto_accept(true)
    }

    /// Sessions stay pending until the test emits `Connected`
    pub fn manual() -> Self {
        Self::with_auto_accept(false)
    }

    fn with_auto_accept(auto_accept: bool) -> Self {
        Self {
            connect_count: Arc::new(AtomicUsize::new(0)),
            refuse_connects: Arc::new(AtomicUsize::new(0)),
            refuse_all: Arc::new(AtomicBool::new(false)),
            auto_accept,
            sessions: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            last_options: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a transport that shares counters and sessions with `other`
    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            connect_count: Arc::clone(&other.connect_count),
            refuse_connects: Arc::clone(&other.refuse_connects),
            refuse_all: Arc::clone(&other.refuse_all),
            auto_accept: other.auto_accept,
            sessions: Arc::clone(&other.sessions),
            calls: Arc::clone(&other.calls),
            last_options: Arc::clone(&other.last_options),
        }
    }

    pub fn refuse_next_connects(&self, count: usize) {
        self.refuse_connects.store(count, Ordering::SeqCst);
    }

    pub fn refuse_all_connects(&self, refuse: bool) {
        self.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Number of times connect() was called
    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn last_options(&self) -> Option<ConnectOptions> {
        self.last_options.lock().unwrap().clone()
    }

    /// Every handle call, in order
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Topics subscribed on `session`, in call order
    pub fn subscribed_on(&self, session: usize) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Subscribe { session: s, topic } if s == session => Some(topic),
                _ => None,
            })
            .collect()
    }

    /// Topics unsubscribed on any session
    pub fn unsubscribed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Unsubscribe { topic, .. } => Some(topic),
                _ => None,
            })
            .collect()
    }

    pub fn subscribe_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Subscribe { .. }))
            .count()
    }

    /// Feed an event into the latest session
    pub fn emit(&self, event: TransportEvent) {
        if let Some(session) = self.sessions.lock().unwrap().last() {
            let _ = session.send(event);
        }
    }

    /// Deliver an inbound publish on the latest session
    pub fn deliver(&self, topic: &str, body: &Value) {
        self.emit(TransportEvent::Message {
            topic: topic.to_string(),
            payload: body.to_string().into_bytes(),
        });
    }

    /// Simulate the broker dropping the latest session
    pub fn drop_session(&self) {
        self.emit(TransportEvent::Disconnected("connection reset".to_string()));
    }
}

#[async_trait]
impl Transport for ControlledTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<TransportConnection> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock().unwrap() = Some(options.clone());

        if self.refuse_all.load(Ordering::SeqCst) {
            return Err(Error::transport("connection refused"));
        }
        let refused = self
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::transport("connection refused"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if self.auto_accept {
            let _ = tx.send(TransportEvent::Connected);
        }
        let session = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.push(tx);
            sessions.len() - 1
        };

        Ok(TransportConnection {
            handle: Arc::new(ControlledHandle {
                session,
                calls: Arc::clone(&self.calls),
            }),
            events: Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx)),
        })
    }
}

struct ControlledHandle {
    session: usize,
    calls: Arc<Mutex<Vec<Call>>>,
}

#[async_trait]
impl TransportHandle for ControlledHandle {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Subscribe {
            session: self.session,
            topic: topic.to_string(),
        });
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Unsubscribe {
            session: self.session,
            topic: topic.to_string(),
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.calls.lock().unwrap().push(Call::Disconnect {
            session: self.session,
        });
        Ok(())
    }
}

/// An UpdateSink that records every update
#[derive(Clone, Default)]
pub struct RecordingSink {
    updates: Arc<Mutex<Vec<(String, Vec<DecodedAttribute>)>>>,
    fail: Arc<AtomicBool>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// (device id, attributes) per publish call, in order
    pub fn updates(&self) -> Vec<(String, Vec<DecodedAttribute>)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }
}

#[async_trait]
impl UpdateSink for RecordingSink {
    async fn publish_attributes(&self, device: &Device, attributes: &[DecodedAttribute])
    -> Result<()> {
        self.updates
            .lock()
            .unwrap()
            .push((device.id.clone(), attributes.to_vec()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::sink("context broker unavailable"));
        }
        Ok(())
    }
}

/// A DeviceManager over [`MemoryDeviceManager`] that counts round-trips
///
/// It can be scripted to report one spurious duplicate on register, or to
/// stall every register call.
#[derive(Clone)]
pub struct ScriptedDeviceManager {
    inner: MemoryDeviceManager,
    register_calls: Arc<AtomicUsize>,
    unregister_calls: Arc<AtomicUsize>,
    config_lookups: Arc<AtomicUsize>,
    duplicate_once: Arc<AtomicBool>,
    register_delay: Arc<Mutex<Option<Duration>>>,
}

impl ScriptedDeviceManager {
    pub fn new(inner: MemoryDeviceManager) -> Self {
        Self {
            inner,
            register_calls: Arc::new(AtomicUsize::new(0)),
            unregister_calls: Arc::new(AtomicUsize::new(0)),
            config_lookups: Arc::new(AtomicUsize::new(0)),
            duplicate_once: Arc::new(AtomicBool::new(false)),
            register_delay: Arc::new(Mutex::new(None)),
        }
    }

    pub fn inner(&self) -> &MemoryDeviceManager {
        &self.inner
    }

    pub fn report_duplicate_once(&self) {
        self.duplicate_once.store(true, Ordering::SeqCst);
    }

    pub fn delay_registrations(&self, delay: Duration) {
        *self.register_delay.lock().unwrap() = Some(delay);
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn unregister_calls(&self) -> usize {
        self.unregister_calls.load(Ordering::SeqCst)
    }

    pub fn config_lookups(&self) -> usize {
        self.config_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceManager for ScriptedDeviceManager {
    async fn lookup_application_config(&self, app_eui: &str) -> Result<GroupConfig> {
        self.config_lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.lookup_application_config(app_eui).await
    }

    async fn register_device(&self, device: Device) -> Result<Device> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.register_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.duplicate_once.swap(false, Ordering::SeqCst) {
            return Err(Error::duplicate_device(device.id));
        }
        self.inner.register_device(device).await
    }

    async fn unregister_device(&self, device_id: &str, service: &str, subservice: &str)
    -> Result<()> {
        self.unregister_calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .unregister_device(device_id, service, subservice)
            .await
    }

    async fn lookup_device(&self, device_id: &str, service: &str, subservice: &str)
    -> Result<Device> {
        self.inner.lookup_device(device_id, service, subservice).await
    }

    async fn list_configurations(&self) -> Result<Vec<GroupConfig>> {
        self.inner.list_configurations().await
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        self.inner.list_devices().await
    }
}

/// Agent config with short delays for tests
pub fn fast_config(max_reconnect_attempts: usize) -> AgentConfig {
    AgentConfig {
        binding: BindingConfig {
            max_reconnect_attempts,
            reconnect_delay_ms: 20,
            ..BindingConfig::default()
        },
        pipeline: PipelineConfig {
            provisioning_timeout_secs: 2,
            ..PipelineConfig::default()
        },
    }
}

/// `lorawan` block of the TTN demo application
pub fn ttn_lorawan() -> Value {
    json!({
        "application_server": {
            "host": "eu.thethings.network",
            "port": "1883",
            "username": TTN_APP_ID,
            "password": "pwd1",
            "provider": "TTN"
        },
        "app_eui": TTN_APP_EUI,
        "application_id": TTN_APP_ID,
        "application_key": "9BE6B8EF16415B5F6ED4FBEAFE695C49",
        "data_model": "cayennelpp"
    })
}

/// `lorawan` block of a ChirpStack application
pub fn chirpstack_lorawan() -> Value {
    json!({
        "application_server": {
            "host": "localhost",
            "provider": "chirpstack"
        },
        "app_eui": "0000000000000001",
        "application_id": "1",
        "data_model": "cayennelpp"
    })
}

fn active_attributes() -> Value {
    json!([
        {"name": "temperature_1", "type": "Number"},
        {"name": "relative_humidity_2", "type": "Number"},
        {"name": "barometric_pressure_0", "type": "Number"},
        {"name": "digital_in_3", "type": "Number"},
        {"name": "digital_out_4", "type": "Number"}
    ])
}

/// Device provisioned against `lorawan`, with `dev_eui` set
pub fn device_with(lorawan: Value, id: &str, dev_eui: Option<&str>) -> Device {
    let mut lorawan = lorawan;
    if let Some(eui) = dev_eui {
        lorawan["dev_eui"] = json!(eui);
    }
    serde_json::from_value(json!({
        "id": id,
        "name": format!("{id}:LoraDevice"),
        "type": "LoraDevice",
        "service": "smartgondor",
        "subservice": "/gardens",
        "active": active_attributes(),
        "internalAttributes": {"lorawan": lorawan}
    }))
    .unwrap()
}

pub fn ttn_device(id: &str) -> Device {
    device_with(ttn_lorawan(), id, Some(DEV_EUI))
}

/// Group-level provisioning of the TTN demo application
pub fn ttn_group() -> GroupConfig {
    serde_json::from_value(json!({
        "service": "smartgondor",
        "subservice": "/gardens",
        "apikey": "ttn-key",
        "resource": "/iot/d",
        "type": "LoraDevice",
        "attributes": active_attributes(),
        "internalAttributes": {"lorawan": ttn_lorawan()}
    }))
    .unwrap()
}

pub fn ttn_topic(device_id: &str) -> String {
    format!("{TTN_APP_ID}/devices/{device_id}/up")
}

/// TTN v2 uplink body carrying the CayenneLPP sample
pub fn ttn_uplink(device_id: &str) -> Value {
    json!({
        "app_id": TTN_APP_ID,
        "dev_id": device_id,
        "hardware_serial": DEV_EUI,
        "port": 2,
        "counter": 7,
        "payload_raw": CAYENNE_PAYLOAD
    })
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
