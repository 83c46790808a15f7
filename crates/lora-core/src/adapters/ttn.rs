//! The Things Network adapter
//!
//! Topic: `{application_id}/devices/{device_id}/up`. The device id comes
//! from the topic; EUI and payload from the body.

use serde_json::Value;

use super::{
    BodyShape, Extracted, ParseContext, ProviderAdapter, check_application, first_match,
    match_topic, parse_body, str_at, uplink,
};
use crate::config::ProviderKind;
use crate::error::Result;
use crate::model::{DataModel, UplinkEvent};

const GRAMMAR: [Option<&str>; 4] = [None, Some("devices"), None, Some("up")];

static SHAPES: [BodyShape; 4] = [
    BodyShape {
        name: "pre_decoded",
        extract: pre_decoded,
    },
    BodyShape {
        name: "payload_raw",
        extract: |body, _| body.get("payload_raw").and_then(Extracted::encoded),
    },
    BodyShape {
        name: "payload_fields",
        extract: |body, _| body.get("payload_fields").and_then(Extracted::structured),
    },
    BodyShape {
        name: "uplink_message",
        extract: uplink_message,
    },
];

/// Decoded fields win over the raw payload for pre-decoded devices
fn pre_decoded(body: &Value, model: DataModel) -> Option<Extracted> {
    if model != DataModel::ApplicationServer {
        return None;
    }
    body.get("payload_fields")
        .and_then(Extracted::structured)
        .or_else(|| {
            body.pointer("/uplink_message/decoded_payload")
                .and_then(Extracted::structured)
        })
}

/// Nested v3 envelope: raw `frm_payload`, else `decoded_payload`
fn uplink_message(body: &Value, _: DataModel) -> Option<Extracted> {
    let message = body.get("uplink_message")?;
    message
        .get("frm_payload")
        .and_then(Extracted::encoded)
        .or_else(|| message.get("decoded_payload").and_then(Extracted::structured))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TtnAdapter;

impl ProviderAdapter for TtnAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ttn
    }

    fn device_topic(&self, application_id: &str, device_id: &str, _eui: Option<&str>)
    -> Result<String> {
        Ok(format!("{application_id}/devices/{device_id}/up"))
    }

    fn wildcard_topic(&self, application_id: &str) -> String {
        format!("{application_id}/devices/+/up")
    }

    fn body_shapes(&self) -> &'static [BodyShape] {
        &SHAPES
    }

    fn parse(&self, topic: &str, body: &[u8], ctx: &ParseContext<'_>) -> Result<UplinkEvent> {
        let segments = match_topic(topic, &GRAMMAR)?;
        check_application(topic, segments[0], ctx.application_id)?;
        let device_id = segments[2].to_string();

        let body = parse_body(topic, body)?;
        let dev_eui = str_at(&body, "/hardware_serial")
            .or_else(|| str_at(&body, "/end_device_ids/dev_eui"))
            .map(str::to_string);

        let model = ctx.data_model_of(ctx.devices.get_device(&device_id).as_ref());
        let extracted = first_match(&SHAPES, &body, model).map(|(_, found)| found);

        Ok(uplink(topic, device_id, dev_eui, extracted))
    }
}
