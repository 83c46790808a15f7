//! CayenneLPP tagged-binary decoder
//!
//! A payload is a concatenation of records:
//!
//! ```text
//! +---------+---------+----------------------+
//! | channel | type id | value (type-sized)   |
//! |  1 byte |  1 byte |  1..=9 bytes, BE     |
//! +---------+---------+----------------------+
//! ```
//!
//! Each record becomes one entry named `<type-name>_<channel>`. A repeated
//! name overwrites the earlier value but keeps its first-seen position.
//! Any structural problem fails the whole payload.

use serde_json::{Map, Value, json};

use crate::error::DecodeError;

pub const TYPE_DIGITAL_IN: u8 = 0;
pub const TYPE_DIGITAL_OUT: u8 = 1;
pub const TYPE_ANALOG_IN: u8 = 2;
pub const TYPE_ANALOG_OUT: u8 = 3;
pub const TYPE_LUMINOSITY: u8 = 101;
pub const TYPE_PRESENCE: u8 = 102;
pub const TYPE_TEMPERATURE: u8 = 103;
pub const TYPE_RELATIVE_HUMIDITY: u8 = 104;
pub const TYPE_ACCELEROMETER: u8 = 113;
pub const TYPE_BAROMETRIC_PRESSURE: u8 = 115;
pub const TYPE_GYROMETER: u8 = 134;
pub const TYPE_GPS: u8 = 136;

/// Smallest decodable payload: one record with a 1-byte value
pub const MIN_PAYLOAD_LEN: usize = 3;

/// Record header (channel + type id)
const HEADER_LEN: usize = 2;

/// Name and value width of a supported type
fn describe(type_id: u8) -> Option<(&'static str, usize)> {
    let entry = match type_id {
        TYPE_DIGITAL_IN => ("digital_in", 1),
        TYPE_DIGITAL_OUT => ("digital_out", 1),
        TYPE_ANALOG_IN => ("analog_in", 2),
        TYPE_ANALOG_OUT => ("analog_out", 2),
        TYPE_LUMINOSITY => ("luminosity", 2),
        TYPE_PRESENCE => ("presence", 1),
        TYPE_TEMPERATURE => ("temperature", 2),
        TYPE_RELATIVE_HUMIDITY => ("relative_humidity", 1),
        TYPE_ACCELEROMETER => ("accelerometer", 6),
        TYPE_BAROMETRIC_PRESSURE => ("barometric_pressure", 2),
        TYPE_GYROMETER => ("gyrometer", 6),
        TYPE_GPS => ("gps", 9),
        _ => return None,
    };
    Some(entry)
}

fn read_i16(data: &[u8]) -> i16 {
    i16::from_be_bytes([data[0], data[1]])
}

fn read_u16(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}

fn read_i24(data: &[u8]) -> i32 {
    // Place the 24 bits at the top and shift back down to sign-extend
    (i32::from(data[0]) << 24 | i32::from(data[1]) << 16 | i32::from(data[2]) << 8) >> 8
}

/// Scaled values are divided rather than multiplied so the result is the
/// double closest to the decimal reading (272 / 10 is exactly 27.2).
fn scaled(raw: impl Into<f64>, divisor: f64) -> f64 {
    raw.into() / divisor
}

fn vector(data: &[u8], divisor: f64) -> Value {
    json!({
        "x": scaled(read_i16(&data[0..2]), divisor),
        "y": scaled(read_i16(&data[2..4]), divisor),
        "z": scaled(read_i16(&data[4..6]), divisor),
    })
}

/// Decode one value; `data` is exactly the width reported by [`describe`].
fn decode_value(type_id: u8, data: &[u8]) -> Value {
    match type_id {
        TYPE_DIGITAL_IN | TYPE_DIGITAL_OUT | TYPE_PRESENCE => json!(data[0]),
        TYPE_ANALOG_IN | TYPE_ANALOG_OUT => json!(scaled(read_i16(data), 100.0)),
        TYPE_LUMINOSITY => json!(read_u16(data)),
        TYPE_TEMPERATURE | TYPE_BAROMETRIC_PRESSURE => json!(scaled(read_i16(data), 10.0)),
        TYPE_RELATIVE_HUMIDITY => json!(scaled(data[0], 2.0)),
        TYPE_ACCELEROMETER => vector(data, 1000.0),
        TYPE_GYROMETER => vector(data, 100.0),
        TYPE_GPS => json!({
            "latitude": scaled(read_i24(&data[0..3]), 10000.0),
            "longitude": scaled(read_i24(&data[3..6]), 10000.0),
            "altitude": scaled(read_i24(&data[6..9]), 100.0),
        }),
        // describe() already rejected every other id
        _ => Value::Null,
    }
}

/// Decode raw CayenneLPP bytes into a named field mapping
pub fn decode(bytes: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    if bytes.len() < MIN_PAYLOAD_LEN {
        return Err(DecodeError::TooShort {
            len: bytes.len(),
            min: MIN_PAYLOAD_LEN,
        });
    }

    let mut fields = Map::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let channel = bytes[offset];
        let Some(&type_id) = bytes.get(offset + 1) else {
            return Err(DecodeError::Truncated {
                channel,
                type_id: 0,
                offset,
                needed: 1,
                available: 0,
            });
        };
        let (name, width) =
            describe(type_id).ok_or(DecodeError::UnsupportedType { channel, type_id })?;

        let start = offset + HEADER_LEN;
        let available = bytes.len() - start;
        if available < width {
            return Err(DecodeError::Truncated {
                channel,
                type_id,
                offset,
                needed: width,
                available,
            });
        }

        fields.insert(
            format!("{name}_{channel}"),
            decode_value(type_id, &bytes[start..start + width]),
        );
        offset = start + width;
    }

    Ok(fields)
}
