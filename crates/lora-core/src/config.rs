//! Configuration types for the ingestion agent
//!
//! Two families of configuration live here:
//!
//! - [`AgentConfig`]: process-level tuning (reconnect budget, provisioning
//!   timeout, outbound queue size), with serde defaults and `validate()`.
//! - [`LorawanConfig`]: the per-application `lorawan` block carried inside a
//!   provisioning descriptor's `internalAttributes`.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::DataModel;

/// Main agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Broker binding settings
    #[serde(default)]
    pub binding: BindingConfig,

    /// Ingestion pipeline settings
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl AgentConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.binding.validate()?;
        self.pipeline.validate()?;
        Ok(())
    }
}

/// Broker binding settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    /// Consecutive failed connection attempts before the application is stopped
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: usize,

    /// Base reconnect delay; attempt `n` waits `n * reconnect_delay_ms`
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// MQTT keep-alive interval
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Prefix for generated broker client ids
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
}

fn default_max_reconnect_attempts() -> usize {
    10
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_client_id_prefix() -> String {
    "lora-agent".to_string()
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            keep_alive_secs: default_keep_alive_secs(),
            client_id_prefix: default_client_id_prefix(),
        }
    }
}

impl BindingConfig {
    /// Validate the binding settings
    pub fn validate(&self) -> Result<()> {
        if self.max_reconnect_attempts == 0 {
            return Err(Error::config("max_reconnect_attempts must be > 0"));
        }
        if self.keep_alive_secs == 0 {
            return Err(Error::config("keep_alive_secs must be > 0"));
        }
        if self.client_id_prefix.is_empty() {
            return Err(Error::config("client_id_prefix cannot be empty"));
        }
        Ok(())
    }

    /// Delay before reconnect attempt `attempt` (1-based), growing linearly
    pub fn reconnect_delay(&self, attempt: usize) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms.saturating_mul(attempt as u64))
    }
}

/// Ingestion pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound on one auto-registration round-trip
    #[serde(default = "default_provisioning_timeout_secs")]
    pub provisioning_timeout_secs: u64,

    /// Outbound update queue capacity; updates are dropped when it is full
    #[serde(default = "default_update_channel_capacity")]
    pub update_channel_capacity: usize,
}

fn default_provisioning_timeout_secs() -> u64 {
    10
}

fn default_update_channel_capacity() -> usize {
    1000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            provisioning_timeout_secs: default_provisioning_timeout_secs(),
            update_channel_capacity: default_update_channel_capacity(),
        }
    }
}

impl PipelineConfig {
    /// Validate the pipeline settings
    pub fn validate(&self) -> Result<()> {
        if self.provisioning_timeout_secs == 0 {
            return Err(Error::config("provisioning_timeout_secs must be > 0"));
        }
        if self.update_channel_capacity == 0 {
            return Err(Error::config("update_channel_capacity must be > 0"));
        }
        Ok(())
    }

    pub fn provisioning_timeout(&self) -> Duration {
        Duration::from_secs(self.provisioning_timeout_secs)
    }
}

/// Supported LoRaWAN application-server families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    /// The Things Network
    #[serde(rename = "TTN")]
    Ttn,
    /// ChirpStack
    #[serde(rename = "chirpstack")]
    ChirpStack,
    /// Legacy LoRaServer.io
    #[serde(rename = "loraserver.io")]
    LoraServerIo,
}

impl ProviderKind {
    /// All provider kinds, in adapter-table order
    pub const ALL: [ProviderKind; 3] = [Self::Ttn, Self::ChirpStack, Self::LoraServerIo];

    /// Provider string as it appears in provisioning descriptors
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ttn => "TTN",
            Self::ChirpStack => "chirpstack",
            Self::LoraServerIo => "loraserver.io",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                Error::config(format!(
                    "Unsupported provider for application server: {s}. Supported values: TTN, chirpstack and loraserver.io"
                ))
            })
    }
}

/// Connection parameters of a provider's application server
#[derive(Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApplicationServerConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default, deserialize_with = "deserialize_port")]
    pub port: Option<u16>,

    /// Transport scheme (`mqtt`, `mqtts`, ...)
    #[serde(default)]
    pub protocol: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub provider: String,
}

// Redact the broker password from debug output
impl fmt::Debug for ApplicationServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("provider", &self.provider)
            .finish()
    }
}

/// Accepts `1883`, `"1883"` or null.
fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortRepr {
        Number(u16),
        Text(String),
    }

    match Option::<PortRepr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(PortRepr::Number(port)) => Ok(Some(port)),
        Some(PortRepr::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(PortRepr::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid port: {text}"))),
    }
}

/// The `lorawan` block of a provisioning descriptor
#[derive(Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LorawanConfig {
    #[serde(default)]
    pub application_server: Option<ApplicationServerConfig>,

    #[serde(default)]
    pub app_eui: Option<String>,

    #[serde(default)]
    pub application_id: Option<String>,

    #[serde(default)]
    pub application_key: Option<String>,

    #[serde(default)]
    pub data_model: Option<DataModel>,

    #[serde(default)]
    pub dev_eui: Option<String>,
}

impl fmt::Debug for LorawanConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LorawanConfig")
            .field("application_server", &self.application_server)
            .field("app_eui", &self.app_eui)
            .field("application_id", &self.application_id)
            .field(
                "application_key",
                &self.application_key.as_ref().map(|_| "<redacted>"),
            )
            .field("data_model", &self.data_model)
            .field("dev_eui", &self.dev_eui)
            .finish()
    }
}

impl LorawanConfig {
    /// Extract the `lorawan` block from an `internalAttributes` value
    ///
    /// The block is either `{"lorawan": {...}}` or the first element of an
    /// array that carries a `lorawan` key.
    pub fn from_internal_attributes(internal: &serde_json::Value) -> Result<Self> {
        let block = match internal {
            serde_json::Value::Array(items) => items.iter().find_map(|item| item.get("lorawan")),
            other => other.get("lorawan"),
        };

        match block {
            Some(block) => Ok(serde_json::from_value(block.clone())?),
            None => Err(Error::config(
                "lorawan attribute must be specified inside internal_attributes",
            )),
        }
    }

    /// Check the attributes required to create an application
    pub fn validate(&self) -> Result<()> {
        let server = self.application_server.as_ref().ok_or_else(|| {
            Error::config(
                "lorawan.application_server attribute must be specified inside internal_attributes",
            )
        })?;

        if server.host.is_empty() {
            return Err(Error::config("Host for application server is required"));
        }
        if server.provider.is_empty() {
            return Err(Error::config(
                "Provider for application server is required. Supported values: TTN, chirpstack and loraserver.io",
            ));
        }
        if self.app_eui.as_deref().is_none_or(str::is_empty) {
            return Err(Error::config(
                "Missing mandatory configuration attributes for lorawan: app_eui",
            ));
        }
        if self.application_id.as_deref().is_none_or(str::is_empty) {
            return Err(Error::config(
                "Missing mandatory configuration attributes for lorawan: application_id",
            ));
        }

        server.provider.parse::<ProviderKind>()?;
        Ok(())
    }

    /// Provider connection settings compared for "configuration changed"
    ///
    /// `dev_eui` is per-device and ignored.
    pub fn same_application(&self, other: &LorawanConfig) -> bool {
        self.application_server == other.application_server
            && self.app_eui == other.app_eui
            && self.application_id == other.application_id
            && self.application_key == other.application_key
            && self.data_model == other.data_model
    }
}
