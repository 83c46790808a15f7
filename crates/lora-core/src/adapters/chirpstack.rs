//! ChirpStack adapter
//!
//! Topic: `application/{application_id}/device/{eui}/event/up`, EUI in
//! lower case. The device is resolved by the EUI in the topic, falling
//! back to the device name in the body.

use serde_json::Value;

use super::{
    BodyShape, Extracted, ParseContext, ProviderAdapter, check_application, first_match,
    match_topic, parse_body, str_at, uplink,
};
use crate::config::ProviderKind;
use crate::error::{Error, Result};
use crate::model::{DataModel, UplinkEvent};

const GRAMMAR: [Option<&str>; 6] = [
    Some("application"),
    None,
    Some("device"),
    None,
    Some("event"),
    Some("up"),
];

static SHAPES: [BodyShape; 2] = [
    BodyShape {
        name: "object",
        extract: decoded_object,
    },
    BodyShape {
        name: "data",
        extract: raw_data,
    },
];

/// `object` is only read for devices whose data model is pre-decoded
fn decoded_object(body: &Value, model: DataModel) -> Option<Extracted> {
    if model != DataModel::ApplicationServer {
        return None;
    }
    body.get("object").and_then(Extracted::structured)
}

fn raw_data(body: &Value, model: DataModel) -> Option<Extracted> {
    if model == DataModel::ApplicationServer {
        return None;
    }
    body.get("data").and_then(Extracted::encoded)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChirpStackAdapter;

impl ProviderAdapter for ChirpStackAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ChirpStack
    }

    fn device_topic(&self, application_id: &str, _device_id: &str, eui: Option<&str>)
    -> Result<String> {
        let eui = eui.filter(|e| !e.is_empty()).ok_or_else(|| {
            Error::config("Missing mandatory configuration attributes for lorawan:dev_eui")
        })?;
        Ok(format!(
            "application/{application_id}/device/{}/event/up",
            eui.to_lowercase()
        ))
    }

    fn wildcard_topic(&self, application_id: &str) -> String {
        format!("application/{application_id}/device/+/event/up")
    }

    fn body_shapes(&self) -> &'static [BodyShape] {
        &SHAPES
    }

    fn parse(&self, topic: &str, body: &[u8], ctx: &ParseContext<'_>) -> Result<UplinkEvent> {
        let segments = match_topic(topic, &GRAMMAR)?;
        check_application(topic, segments[1], ctx.application_id)?;
        let topic_eui = segments[3];

        let body = parse_body(topic, body)?;
        let known = ctx.devices.get_device_by_eui(topic_eui);

        let device_id = match &known {
            Some(device) => device.id.clone(),
            None => str_at(&body, "/deviceName")
                .or_else(|| str_at(&body, "/deviceInfo/deviceName"))
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::parse(topic, format!("no device known for EUI {topic_eui}"))
                })?,
        };

        let dev_eui = str_at(&body, "/devEUI")
            .or_else(|| str_at(&body, "/deviceInfo/devEui"))
            .unwrap_or(topic_eui)
            .to_string();

        let model = ctx.data_model_of(known.as_ref());
        let extracted = first_match(&SHAPES, &body, model).map(|(_, found)| found);

        Ok(uplink(topic, device_id, Some(dev_eui), extracted))
    }
}
