//! Provider adapters
//!
//! Each LoRaWAN application-server family publishes uplinks on its own
//! topic grammar and wraps payloads in its own JSON envelope. An adapter
//! knows both directions for one family:
//!
//! - building the exact topic strings to subscribe to (broker ACLs match
//!   them byte-for-byte)
//! - parsing an inbound topic and body into a canonical [`UplinkEvent`]
//!
//! | Provider        | Device topic                                     | Segments |
//! |-----------------|--------------------------------------------------|----------|
//! | TTN             | `{app}/devices/{device_id}/up`                   | 4        |
//! | ChirpStack      | `application/{app}/device/{eui}/event/up`        | 6        |
//! | LoRaServer.io   | `application/{app}/node/{eui}/rx`                | 5        |
//!
//! Adapters are stateless and selected from a fixed table by
//! [`ProviderKind`] with [`adapter_for`].

pub mod chirpstack;
pub mod loraserver;
pub mod ttn;

pub use chirpstack::ChirpStackAdapter;
pub use loraserver::LoraServerAdapter;
pub use ttn::TtnAdapter;

use chrono::Utc;
use serde_json::Value;

use crate::config::ProviderKind;
use crate::device_table::DeviceTable;
use crate::error::{Error, Result};
use crate::model::{DataModel, RawPayload, UplinkEvent};

/// Application state an adapter may consult while parsing
pub struct ParseContext<'a> {
    pub application_id: &'a str,
    pub devices: &'a DeviceTable,
    /// Application-level data model, used for devices not in the table
    pub default_data_model: DataModel,
}

impl ParseContext<'_> {
    fn data_model_of(&self, device: Option<&crate::model::Device>) -> DataModel {
        device
            .and_then(|device| device.lorawan().ok())
            .and_then(|lorawan| lorawan.data_model)
            .unwrap_or(self.default_data_model)
    }
}

/// Payload found in an envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub payload: RawPayload,
    /// Data model implied by where the payload was found
    pub hint: Option<DataModel>,
}

impl Extracted {
    fn encoded(value: &Value) -> Option<Self> {
        value.as_str().filter(|s| !s.is_empty()).map(|s| Self {
            payload: RawPayload::Encoded(s.to_string()),
            hint: None,
        })
    }

    fn structured(value: &Value) -> Option<Self> {
        value.is_object().then(|| Self {
            payload: RawPayload::Structured(value.clone()),
            hint: Some(DataModel::ApplicationServer),
        })
    }
}

/// One envelope layout an adapter recognizes
///
/// Shapes are tried in slice order and the first match wins.
pub struct BodyShape {
    pub name: &'static str,
    /// Receives the JSON body and the data model configured for the device
    pub extract: fn(&Value, DataModel) -> Option<Extracted>,
}

/// Try `shapes` in order
pub fn first_match(
    shapes: &'static [BodyShape],
    body: &Value,
    model: DataModel,
) -> Option<(&'static str, Extracted)> {
    shapes
        .iter()
        .find_map(|shape| (shape.extract)(body, model).map(|found| (shape.name, found)))
}

/// Topic grammar and envelope parsing for one provider family
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Topic carrying uplinks of one device
    ///
    /// Fails if the grammar needs an EUI and none is known.
    fn device_topic(&self, application_id: &str, device_id: &str, eui: Option<&str>)
    -> Result<String>;

    /// Topic carrying uplinks of every device of the application
    fn wildcard_topic(&self, application_id: &str) -> String;

    /// Envelope layouts in priority order
    fn body_shapes(&self) -> &'static [BodyShape];

    /// Parse an inbound message
    ///
    /// Never panics on malformed input; every problem is an [`Error::Parse`].
    fn parse(&self, topic: &str, body: &[u8], ctx: &ParseContext<'_>) -> Result<UplinkEvent>;

    /// Broker port when the configuration leaves it out
    fn default_port(&self, scheme: &str) -> u16 {
        if is_secure_scheme(scheme) { 8883 } else { 1883 }
    }

    /// Transport scheme when the configuration leaves it out
    fn default_scheme(&self) -> &'static str {
        "mqtt"
    }
}

pub fn is_secure_scheme(scheme: &str) -> bool {
    matches!(
        scheme.to_ascii_lowercase().as_str(),
        "mqtts" | "ssl" | "tls" | "wss"
    )
}

static TTN: TtnAdapter = TtnAdapter;
static CHIRPSTACK: ChirpStackAdapter = ChirpStackAdapter;
static LORASERVER: LoraServerAdapter = LoraServerAdapter;

/// Indexed by `ProviderKind as usize`
static ADAPTERS: [&(dyn ProviderAdapter); 3] = [&TTN, &CHIRPSTACK, &LORASERVER];

/// Adapter implementing `kind`
pub fn adapter_for(kind: ProviderKind) -> &'static dyn ProviderAdapter {
    ADAPTERS[kind as usize]
}

/// Split a topic and check its literal segments
///
/// `grammar` lists the expected segments; `None` marks a variable one.
fn match_topic<'t>(
    topic: &'t str,
    grammar: &[Option<&str>],
) -> Result<Vec<&'t str>> {
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() != grammar.len() {
        return Err(Error::parse(
            topic,
            format!(
                "expected {} topic segments, got {}",
                grammar.len(),
                segments.len()
            ),
        ));
    }

    for (index, (segment, expected)) in segments.iter().zip(grammar).enumerate() {
        match expected {
            Some(literal) if segment != literal => {
                return Err(Error::parse(
                    topic,
                    format!("segment {index} is '{segment}', expected '{literal}'"),
                ));
            }
            None if segment.is_empty() => {
                return Err(Error::parse(topic, format!("segment {index} is empty")));
            }
            _ => {}
        }
    }
    Ok(segments)
}

fn check_application(topic: &str, found: &str, expected: &str) -> Result<()> {
    if found != expected {
        return Err(Error::parse(
            topic,
            format!("message for application '{found}', bound to '{expected}'"),
        ));
    }
    Ok(())
}

fn parse_body(topic: &str, body: &[u8]) -> Result<Value> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| Error::parse(topic, format!("body is not JSON: {e}")))?;
    if !value.is_object() {
        return Err(Error::parse(topic, "body is not a JSON object"));
    }
    Ok(value)
}

/// Non-empty string at a JSON pointer
fn str_at<'v>(body: &'v Value, pointer: &str) -> Option<&'v str> {
    body.pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn uplink(
    topic: &str,
    device_id: String,
    dev_eui: Option<String>,
    extracted: Option<Extracted>,
) -> UplinkEvent {
    let (payload, data_model_hint) = match extracted {
        Some(found) => (Some(found.payload), found.hint),
        None => (None, None),
    };
    UplinkEvent {
        device_id,
        dev_eui,
        payload,
        data_model_hint,
        topic: topic.to_string(),
        received_at: Utc::now(),
    }
}
