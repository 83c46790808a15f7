//! Payload codecs
//!
//! Stateless decoders selected by [`DataModel`]:
//!
//! - [`cayenne`]: CayenneLPP tagged-binary records
//! - [`cbor`]: self-describing structured binary
//! - pass-through for payloads the application server already decoded
//!
//! Decoding is pure and bounded by the payload size, so it runs inline in
//! the message path. [`to_attributes`] then maps the decoded fields onto a
//! device's active attributes.

pub mod attributes;
pub mod cayenne;
pub mod cbor;

pub use attributes::{GEO_POINT, to_attributes};

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::model::{DataModel, RawPayload};

/// Standard alphabet, padding optional on decode
pub(crate) const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode an uplink payload with the given data model
pub fn decode(payload: &RawPayload, model: DataModel) -> Result<Map<String, Value>, DecodeError> {
    match (payload, model) {
        (RawPayload::Structured(value), _) => pass_through(value),
        (RawPayload::Encoded(text), DataModel::CayenneLpp) => cayenne::decode(&from_base64(text)?),
        (RawPayload::Encoded(text), DataModel::Cbor) => cbor::decode(&from_base64(text)?),
        (RawPayload::Encoded(_), DataModel::ApplicationServer) => Err(DecodeError::NotAMapping(
            "encoded payload for a pre-decoded data model".to_string(),
        )),
    }
}

/// Accept a payload that already is a mapping
pub fn pass_through(value: &Value) -> Result<Map<String, Value>, DecodeError> {
    match value {
        Value::Object(fields) => Ok(fields.clone()),
        other => Err(DecodeError::NotAMapping(other.to_string())),
    }
}

fn from_base64(text: &str) -> Result<Vec<u8>, DecodeError> {
    BASE64
        .decode(text.trim())
        .map_err(|e| DecodeError::Base64(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dispatch_by_model() {
        let payload = RawPayload::Encoded("AWf/1w==".into());
        let fields = decode(&payload, DataModel::CayenneLpp).unwrap();
        assert_eq!(fields["temperature_1"], json!(-4.1));
    }

    #[test]
    fn test_unpadded_base64_accepted() {
        let payload = RawPayload::Encoded("AWf/1w".into());
        assert!(decode(&payload, DataModel::CayenneLpp).is_ok());
    }

    #[test]
    fn test_invalid_base64() {
        let payload = RawPayload::Encoded("not base64!".into());
        assert!(matches!(
            decode(&payload, DataModel::CayenneLpp),
            Err(DecodeError::Base64(_))
        ));
    }

    #[test]
    fn test_cbor_from_base64() {
        let mut buf = Vec::new();
        let value = ciborium::value::Value::Map(vec![(
            ciborium::value::Value::Text("humidity".into()),
            ciborium::value::Value::Integer(40.into()),
        )]);
        ciborium::ser::into_writer(&value, &mut buf).unwrap();

        let payload = RawPayload::Encoded(BASE64.encode(&buf));
        let fields = decode(&payload, DataModel::Cbor).unwrap();
        assert_eq!(fields["humidity"], json!(40));
    }

    #[test]
    fn test_pass_through_requires_mapping() {
        let fields = decode(
            &RawPayload::Structured(json!({"temperature_1": 20.5})),
            DataModel::ApplicationServer,
        )
        .unwrap();
        assert_eq!(fields["temperature_1"], json!(20.5));

        assert!(matches!(
            decode(&RawPayload::Structured(json!([1, 2])), DataModel::ApplicationServer),
            Err(DecodeError::NotAMapping(_))
        ));
    }
}
