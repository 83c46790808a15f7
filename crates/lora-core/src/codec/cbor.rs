// # CBOR decoder
//
// Structured-binary payloads are decoded with ciborium and mirrored into
// serde_json values. The top level must be a map; nested values are taken
// as they are.

use base64::Engine;
use ciborium::value::Value as CborValue;
use serde_json::{Map, Number, Value};

use super::BASE64;
use crate::error::DecodeError;

/// Decode raw CBOR bytes into a field mapping
pub fn decode(bytes: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    let value: CborValue =
        ciborium::de::from_reader(bytes).map_err(|e| DecodeError::Cbor(e.to_string()))?;

    match to_json(value)? {
        Value::Object(fields) => Ok(fields),
        other => Err(DecodeError::NotAMapping(kind_of(&other).to_string())),
    }
}

fn to_json(value: CborValue) -> Result<Value, DecodeError> {
    Ok(match value {
        CborValue::Null => Value::Null,
        CborValue::Bool(b) => Value::Bool(b),
        CborValue::Integer(i) => {
            let wide = i128::from(i);
            if let Ok(n) = i64::try_from(wide) {
                Value::Number(n.into())
            } else if let Ok(n) = u64::try_from(wide) {
                Value::Number(n.into())
            } else {
                return Err(DecodeError::Cbor(format!("integer out of range: {wide}")));
            }
        }
        CborValue::Float(f) => Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| DecodeError::Cbor(format!("non-finite float: {f}")))?,
        CborValue::Text(s) => Value::String(s),
        CborValue::Bytes(bytes) => Value::String(BASE64.encode(bytes)),
        CborValue::Array(items) => Value::Array(
            items
                .into_iter()
                .map(to_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        CborValue::Map(entries) => {
            let mut fields = Map::new();
            for (key, value) in entries {
                fields.insert(map_key(key)?, to_json(value)?);
            }
            Value::Object(fields)
        }
        CborValue::Tag(_, inner) => to_json(*inner)?,
        other => return Err(DecodeError::Cbor(format!("unsupported CBOR item: {other:?}"))),
    })
}

fn map_key(key: CborValue) -> Result<String, DecodeError> {
    match key {
        CborValue::Text(s) => Ok(s),
        CborValue::Integer(i) => Ok(i128::from(i).to_string()),
        other => Err(DecodeError::Cbor(format!("unsupported map key: {other:?}"))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(value: &CborValue) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(value, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_decodes_map() {
        let value = CborValue::Map(vec![
            (CborValue::Text("temperature".into()), CborValue::Float(21.5)),
            (CborValue::Text("count".into()), CborValue::Integer(7.into())),
            (
                CborValue::Text("flags".into()),
                CborValue::Array(vec![CborValue::Bool(true), CborValue::Null]),
            ),
        ]);

        let fields = decode(&encode(&value)).unwrap();
        assert_eq!(fields["temperature"], json!(21.5));
        assert_eq!(fields["count"], json!(7));
        assert_eq!(fields["flags"], json!([true, null]));
    }

    #[test]
    fn test_integer_keys_become_strings() {
        let value = CborValue::Map(vec![(
            CborValue::Integer(1.into()),
            CborValue::Text("one".into()),
        )]);
        let fields = decode(&encode(&value)).unwrap();
        assert_eq!(fields["1"], json!("one"));
    }

    #[test]
    fn test_top_level_must_be_map() {
        let value = CborValue::Array(vec![CborValue::Integer(1.into())]);
        assert_eq!(
            decode(&encode(&value)),
            Err(DecodeError::NotAMapping("array".to_string()))
        );
    }

    #[test]
    fn test_malformed_input() {
        // Map header announcing one entry, then nothing
        assert!(matches!(decode(&[0xa1]), Err(DecodeError::Cbor(_))));
    }
}
