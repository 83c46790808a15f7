//! Domain types shared across the ingestion path
//!
//! Provisioning descriptors ([`Device`], [`GroupConfig`]) keep every field
//! they were given, including unknown ones, so a descriptor handed back to
//! the device-management collaborator is unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::LorawanConfig;
use crate::error::{Error, Result};

/// Payload decoding strategy configured per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataModel {
    /// Compact tagged-binary records (CayenneLPP)
    #[default]
    #[serde(rename = "cayennelpp")]
    CayenneLpp,
    /// Generic self-describing binary (CBOR)
    #[serde(rename = "cbor")]
    Cbor,
    /// Already decoded by the application server
    #[serde(rename = "application_server")]
    ApplicationServer,
}

impl DataModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CayenneLpp => "cayennelpp",
            Self::Cbor => "cbor",
            Self::ApplicationServer => "application_server",
        }
    }
}

/// One active attribute declared for a device or group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveAttribute {
    pub name: String,

    #[serde(rename = "type")]
    pub attr_type: String,

    /// Decoded field name to match instead of `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

impl ActiveAttribute {
    pub fn new(name: impl Into<String>, attr_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attr_type: attr_type.into(),
            object_id: None,
        }
    }

    pub fn with_object_id(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }
}

/// A provisioned end device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "type", default)]
    pub entity_type: String,

    #[serde(default)]
    pub service: String,

    #[serde(default)]
    pub subservice: String,

    #[serde(default)]
    pub active: Vec<ActiveAttribute>,

    #[serde(rename = "internalAttributes", default)]
    pub internal_attributes: Value,

    /// Descriptor fields this agent does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Device {
    /// Parse the `lorawan` block of this device
    pub fn lorawan(&self) -> Result<LorawanConfig> {
        LorawanConfig::from_internal_attributes(&self.internal_attributes)
    }

    /// Configured data model, defaulting to CayenneLPP
    pub fn data_model(&self) -> DataModel {
        self.lorawan()
            .ok()
            .and_then(|lorawan| lorawan.data_model)
            .unwrap_or_default()
    }

    pub fn dev_eui(&self) -> Option<String> {
        self.lorawan().ok().and_then(|lorawan| lorawan.dev_eui)
    }
}

/// Tenant identity of a provisioning group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TenantConfig {
    pub service: String,
    pub subservice: String,
    pub apikey: Option<String>,
    pub resource: Option<String>,
}

impl TenantConfig {
    /// Group-level tenants carry both an apikey and a resource
    pub fn is_group_level(&self) -> bool {
        self.apikey.is_some() && self.resource.is_some()
    }

    pub fn matches(
        &self,
        service: &str,
        subservice: &str,
        apikey: Option<&str>,
        resource: Option<&str>,
    ) -> bool {
        self.service == service
            && self.subservice == subservice
            && self.apikey.as_deref() == apikey
            && self.resource.as_deref() == resource
    }
}

/// A provisioning group (configuration) that devices are created from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub service: String,

    #[serde(default)]
    pub subservice: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apikey: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    #[serde(rename = "type", default)]
    pub entity_type: String,

    #[serde(default)]
    pub attributes: Vec<ActiveAttribute>,

    #[serde(rename = "internalAttributes", default)]
    pub internal_attributes: Value,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GroupConfig {
    pub fn lorawan(&self) -> Result<LorawanConfig> {
        LorawanConfig::from_internal_attributes(&self.internal_attributes)
    }

    pub fn tenant(&self) -> TenantConfig {
        TenantConfig {
            service: self.service.clone(),
            subservice: self.subservice.clone(),
            apikey: self.apikey.clone(),
            resource: self.resource.clone(),
        }
    }

    /// Build the descriptor for a device first seen on an uplink
    ///
    /// The device inherits the group's attributes and `internalAttributes`,
    /// with `lorawan.dev_eui` set to the observed EUI.
    pub fn new_device(&self, device_id: &str, dev_eui: Option<&str>) -> Result<Device> {
        let mut internal = self.internal_attributes.clone();
        if let Some(eui) = dev_eui {
            let block = match &mut internal {
                Value::Array(items) => items
                    .iter_mut()
                    .find_map(|item| item.get_mut("lorawan")),
                other => other.get_mut("lorawan"),
            };
            match block {
                Some(Value::Object(lorawan)) => {
                    lorawan.insert("dev_eui".to_string(), Value::String(eui.to_string()));
                }
                _ => {
                    return Err(Error::config(format!(
                        "group {}/{} has no lorawan block",
                        self.service, self.subservice
                    )));
                }
            }
        }

        Ok(Device {
            id: device_id.to_string(),
            name: format!("{}:{}", device_id, self.entity_type),
            entity_type: self.entity_type.clone(),
            service: self.service.clone(),
            subservice: self.subservice.clone(),
            active: self.attributes.clone(),
            internal_attributes: internal,
            extra: Map::new(),
        })
    }
}

/// Payload carried by an uplink before decoding
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// Base64 text of the device's binary payload
    Encoded(String),
    /// Fields already decoded by the application server
    Structured(Value),
}

/// Canonical uplink extracted by a provider adapter
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkEvent {
    pub device_id: String,
    pub dev_eui: Option<String>,
    pub payload: Option<RawPayload>,
    /// Data model implied by the envelope, overriding the device's
    pub data_model_hint: Option<DataModel>,
    pub topic: String,
    pub received_at: DateTime<Utc>,
}

/// One named value ready for the update sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedAttribute {
    pub name: String,

    #[serde(rename = "type")]
    pub attr_type: String,

    pub value: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn group() -> GroupConfig {
        serde_json::from_value(json!({
            "service": "smartgondor",
            "subservice": "/gardens",
            "apikey": "",
            "resource": "70B3D57ED000985F",
            "type": "LoraDevice",
            "attributes": [{"name": "temperature_1", "type": "Number"}],
            "internalAttributes": [{
                "lorawan": {
                    "application_server": {"host": "localhost", "provider": "TTN"},
                    "app_eui": "70B3D57ED000985F",
                    "application_id": "demoapp"
                }
            }],
            "lazy": []
        }))
        .unwrap()
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let group = group();
        assert!(group.extra.contains_key("lazy"));
        let value = serde_json::to_value(&group).unwrap();
        assert_eq!(value["lazy"], json!([]));
        assert_eq!(value["type"], json!("LoraDevice"));
    }

    #[test]
    fn test_group_level_tenant() {
        assert!(group().tenant().is_group_level());
        let device_level = TenantConfig {
            service: "s".into(),
            subservice: "/ss".into(),
            ..Default::default()
        };
        assert!(!device_level.is_group_level());
    }

    #[test]
    fn test_new_device_inherits_group() {
        let device = group().new_device("dev1", Some("3339343752356A14")).unwrap();
        assert_eq!(device.name, "dev1:LoraDevice");
        assert_eq!(device.active.len(), 1);
        assert_eq!(device.dev_eui().as_deref(), Some("3339343752356A14"));
        assert_eq!(device.data_model(), DataModel::CayenneLpp);
    }

    #[test]
    fn test_data_model_names() {
        let model: DataModel = serde_json::from_value(json!("application_server")).unwrap();
        assert_eq!(model, DataModel::ApplicationServer);
        assert_eq!(DataModel::Cbor.as_str(), "cbor");
    }
}
