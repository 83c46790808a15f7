//! Translation of decoded fields into device attributes

use serde_json::{Map, Value};
use tracing::debug;

use crate::model::{ActiveAttribute, DecodedAttribute, Device};

/// Attribute type whose values are collapsed to a `"lat,long"` string
pub const GEO_POINT: &str = "geo:point";

/// Map decoded fields onto the device's active attributes
///
/// A field matches an attribute by its `name` or its `object_id` alias and
/// is emitted under the attribute's `name`. Unmatched fields are dropped.
pub fn to_attributes(decoded: &Map<String, Value>, device: &Device) -> Vec<DecodedAttribute> {
    if device.active.is_empty() {
        debug!(device_id = %device.id, "device provisioned without active attributes");
        return Vec::new();
    }

    let mut attributes = Vec::new();
    for (field, value) in decoded {
        for attribute in device.active.iter().filter(|a| matches_field(a, field)) {
            attributes.push(DecodedAttribute {
                name: attribute.name.clone(),
                attr_type: attribute.attr_type.clone(),
                value: convert(attribute, value),
            });
        }
    }
    attributes
}

fn matches_field(attribute: &ActiveAttribute, field: &str) -> bool {
    attribute.name == field || attribute.object_id.as_deref() == Some(field)
}

fn convert(attribute: &ActiveAttribute, value: &Value) -> Value {
    if attribute.attr_type != GEO_POINT {
        return value.clone();
    }

    match (
        value.get("latitude").and_then(Value::as_f64),
        value.get("longitude").and_then(Value::as_f64),
    ) {
        (Some(lat), Some(long)) => Value::String(format!("{lat},{long}")),
        _ => value.clone(),
    }
}
