//! Marshallers: payload to wire body and back.
//!
//! Payloads are serialized with `serde` into a `serde_json::Value` first, and
//! the marshaller decides how that value travels:
//!
//! | marshaller | wire body                 | keeps structure |
//! |------------|---------------------------|-----------------|
//! | `text`     | text (strings, scalars)   | no              |
//! | `bytes`    | raw bytes (`Vec<u8>`)     | no              |
//! | `json`     | JSON text                 | yes             |
//! | `object`   | JSON bytes (default)      | yes             |
//!
//! A `null` payload travels as an empty body for every marshaller.

use crate::error::MomError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// String metadata carried next to the payload, e.g. type hints.
pub type MarshallerContext = BTreeMap<String, String>;

/// Context key holding the Rust type name of the payload.
pub const CTX_TYPE: &str = "type";

/// Body of a message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WireBody {
    #[default]
    Empty,
    Text(String),
    Bytes(Vec<u8>),
}

impl WireBody {
    pub fn is_empty(&self) -> bool {
        matches!(self, WireBody::Empty)
    }

    pub fn len(&self) -> usize {
        match self {
            WireBody::Empty => 0,
            WireBody::Text(text) => text.len(),
            WireBody::Bytes(bytes) => bytes.len(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            WireBody::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Converts payloads to wire bodies and back.
pub trait Marshaller: Send + Sync + fmt::Debug {
    /// Short name, as used in configuration.
    fn name(&self) -> &'static str;

    fn marshal(&self, value: &Value, context: &mut MarshallerContext) -> Result<WireBody, MomError>;

    fn unmarshal(&self, body: &WireBody, context: &MarshallerContext) -> Result<Value, MomError>;

    /// Whether structured values survive a round trip. Failure replies carry
    /// the remote error only through marshallers that do.
    fn preserves_types(&self) -> bool {
        false
    }
}

/// Marshaller for a configured name: `text`, `bytes`, `json` or `object`.
pub fn marshaller_by_name(name: &str) -> Result<Arc<dyn Marshaller>, MomError> {
    match name.trim().to_ascii_lowercase().as_str() {
        "text" => Ok(Arc::new(TextMarshaller)),
        "bytes" => Ok(Arc::new(BytesMarshaller)),
        "json" => Ok(Arc::new(JsonMarshaller)),
        "object" => Ok(Arc::new(ObjectMarshaller)),
        other => Err(MomError::config(format!(
            "unknown marshaller '{other}', expected one of text, bytes, json, object"
        ))),
    }
}

/// Sends strings as text. Numbers and booleans are sent in their text form
/// and read back from it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextMarshaller;

impl Marshaller for TextMarshaller {
    fn name(&self) -> &'static str {
        "text"
    }

    fn marshal(&self, value: &Value, _context: &mut MarshallerContext) -> Result<WireBody, MomError> {
        match value {
            Value::Null => Ok(WireBody::Empty),
            Value::String(text) => Ok(WireBody::Text(text.clone())),
            Value::Bool(_) | Value::Number(_) => Ok(WireBody::Text(value.to_string())),
            other => Err(MomError::marshalling(format!(
                "text marshaller cannot send a {}",
                json_type(other)
            ))),
        }
    }

    fn unmarshal(&self, body: &WireBody, _context: &MarshallerContext) -> Result<Value, MomError> {
        match body {
            WireBody::Empty => Ok(Value::Null),
            WireBody::Text(text) => Ok(Value::String(text.clone())),
            WireBody::Bytes(bytes) => String::from_utf8(bytes.clone())
                .map(Value::String)
                .map_err(MomError::marshalling),
        }
    }
}

/// Sends byte arrays as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesMarshaller;

impl Marshaller for BytesMarshaller {
    fn name(&self) -> &'static str {
        "bytes"
    }

    fn marshal(&self, value: &Value, _context: &mut MarshallerContext) -> Result<WireBody, MomError> {
        match value {
            Value::Null => Ok(WireBody::Empty),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|n| u8::try_from(n).ok())
                        .ok_or_else(|| MomError::marshalling("bytes marshaller expects an array of bytes"))
                })
                .collect::<Result<Vec<u8>, _>>()
                .map(WireBody::Bytes),
            other => Err(MomError::marshalling(format!(
                "bytes marshaller cannot send a {}",
                json_type(other)
            ))),
        }
    }

    fn unmarshal(&self, body: &WireBody, _context: &MarshallerContext) -> Result<Value, MomError> {
        let bytes = match body {
            WireBody::Empty => return Ok(Value::Null),
            WireBody::Text(text) => text.as_bytes(),
            WireBody::Bytes(bytes) => bytes.as_slice(),
        };
        Ok(Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()))
    }
}

/// Sends any serializable value as JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshaller;

impl Marshaller for JsonMarshaller {
    fn name(&self) -> &'static str {
        "json"
    }

    fn marshal(&self, value: &Value, _context: &mut MarshallerContext) -> Result<WireBody, MomError> {
        match value {
            Value::Null => Ok(WireBody::Empty),
            value => Ok(WireBody::Text(serde_json::to_string(value)?)),
        }
    }

    fn unmarshal(&self, body: &WireBody, _context: &MarshallerContext) -> Result<Value, MomError> {
        match body {
            WireBody::Empty => Ok(Value::Null),
            WireBody::Text(text) => Ok(serde_json::from_str(text)?),
            WireBody::Bytes(bytes) => Ok(serde_json::from_slice(bytes)?),
        }
    }

    fn preserves_types(&self) -> bool {
        true
    }
}

/// Default marshaller: any serializable value as JSON bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectMarshaller;

impl Marshaller for ObjectMarshaller {
    fn name(&self) -> &'static str {
        "object"
    }

    fn marshal(&self, value: &Value, _context: &mut MarshallerContext) -> Result<WireBody, MomError> {
        match value {
            Value::Null => Ok(WireBody::Empty),
            value => Ok(WireBody::Bytes(serde_json::to_vec(value)?)),
        }
    }

    fn unmarshal(&self, body: &WireBody, _context: &MarshallerContext) -> Result<Value, MomError> {
        match body {
            WireBody::Empty => Ok(Value::Null),
            WireBody::Text(text) => Ok(serde_json::from_str(text)?),
            WireBody::Bytes(bytes) => Ok(serde_json::from_slice(bytes)?),
        }
    }

    fn preserves_types(&self) -> bool {
        true
    }
}

/// Serialize a typed payload and marshal it.
pub(crate) fn encode<T: Serialize>(
    marshaller: &dyn Marshaller,
    payload: &T,
    context: &mut MarshallerContext,
) -> Result<WireBody, MomError> {
    let value = serde_json::to_value(payload)?;
    if marshaller.preserves_types() {
        context.insert(CTX_TYPE.to_string(), std::any::type_name::<T>().to_string());
    }
    marshaller.marshal(&value, context)
}

/// Unmarshal a wire body into a typed payload.
pub(crate) fn decode<T: DeserializeOwned>(
    marshaller: &dyn Marshaller,
    body: &WireBody,
    context: &MarshallerContext,
) -> Result<T, MomError> {
    let value = marshaller.unmarshal(body, context)?;
    // a number or boolean sent as text arrives as a string
    let scalar = match &value {
        Value::String(text) => serde_json::from_str::<Value>(text)
            .ok()
            .filter(|parsed| parsed.is_number() || parsed.is_boolean()),
        _ => None,
    };
    serde_json::from_value(value)
        .or_else(|e| match scalar {
            Some(scalar) => serde_json::from_value(scalar).map_err(|_| e),
            None => Err(e),
        })
        .map_err(|e| {
            MomError::marshalling(format!(
                "cannot read {} payload as {}: {e}",
                marshaller.name(),
                std::any::type_name::<T>()
            ))
        })
}

fn json_type(value: &Value) -> &'static str {
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
    use serde::Deserialize;

    fn round_trip<T>(marshaller: &dyn Marshaller, payload: &T) -> T
    where
        T: Serialize + DeserializeOwned,
    {
        let mut context = MarshallerContext::new();
        let body = encode(marshaller, payload, &mut context).unwrap();
        decode(marshaller, &body, &context).unwrap()
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
        lines: Vec<String>,
    }

    #[test]
    fn test_text_edge_cases() {
        let text = TextMarshaller;
        assert_eq!(round_trip(&text, &"hello world".to_string()), "hello world");
        assert_eq!(round_trip(&text, &String::new()), "");
        assert_eq!(round_trip(&text, &None::<String>), None);

        let mut context = MarshallerContext::new();
        assert_eq!(encode(&text, &None::<String>, &mut context).unwrap(), WireBody::Empty);
    }

    #[test]
    fn test_text_scalars_read_back() {
        let text = TextMarshaller;
        let mut context = MarshallerContext::new();
        assert_eq!(encode(&text, &5u32, &mut context).unwrap(), WireBody::Text("5".into()));

        assert_eq!(round_trip(&text, &5u32), 5);
        assert_eq!(round_trip(&text, &-12i64), -12);
        assert_eq!(round_trip(&text, &2.5f64), 2.5);
        assert!(round_trip(&text, &true));
        assert_eq!(round_trip(&text, &Some(7u8)), Some(7));
        // digits meant as text stay text
        assert_eq!(round_trip(&text, &"42".to_string()), "42");

        let body = WireBody::Text("five".into());
        assert!(matches!(
            decode::<u32>(&text, &body, &context),
            Err(MomError::Marshalling(_))
        ));
    }

    #[test]
    fn test_text_rejects_structures() {
        let mut context = MarshallerContext::new();
        let order = Order { id: 1, lines: vec![] };
        assert!(matches!(
            encode(&TextMarshaller, &order, &mut context),
            Err(MomError::Marshalling(_))
        ));
    }

    #[test]
    fn test_bytes_edge_cases() {
        let bytes = BytesMarshaller;
        assert_eq!(round_trip(&bytes, &vec![0u8, 1, 255]), vec![0u8, 1, 255]);
        assert_eq!(round_trip(&bytes, &Vec::<u8>::new()), Vec::<u8>::new());

        let mut context = MarshallerContext::new();
        assert_eq!(
            encode(&bytes, &vec![7u8], &mut context).unwrap(),
            WireBody::Bytes(vec![7])
        );
        assert!(encode(&bytes, &vec![300u32], &mut context).is_err());
    }

    #[test]
    fn test_structured_marshallers_keep_types() {
        let order = Order {
            id: 7,
            lines: vec!["a".into(), "b".into()],
        };
        for marshaller in [&JsonMarshaller as &dyn Marshaller, &ObjectMarshaller] {
            assert!(marshaller.preserves_types());
            assert_eq!(round_trip(marshaller, &order), order);
            assert_eq!(round_trip(marshaller, &None::<Order>), None);
        }

        let mut context = MarshallerContext::new();
        encode(&ObjectMarshaller, &order, &mut context).unwrap();
        assert!(context[CTX_TYPE].ends_with("Order"));
    }

    #[test]
    fn test_decode_type_mismatch() {
        let mut context = MarshallerContext::new();
        let body = encode(&JsonMarshaller, &"text".to_string(), &mut context).unwrap();
        let err = decode::<Order>(&JsonMarshaller, &body, &context).unwrap_err();
        assert!(matches!(err, MomError::Marshalling(_)));
    }

    #[test]
    fn test_marshaller_by_name() {
        assert_eq!(marshaller_by_name("TEXT").unwrap().name(), "text");
        assert_eq!(marshaller_by_name("object").unwrap().name(), "object");
        assert!(matches!(marshaller_by_name("java"), Err(MomError::Config(_))));
    }
}
