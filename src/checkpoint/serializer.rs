//! JSON-plus wire format for checkpoint payloads.
//!
//! Channel values are `serde_json::Value`, but checkpoints must round-trip
//! payloads that plain JSON cannot express: absent values, sets, ordered
//! maps with non-string keys, regular expressions, errors, and binary
//! blobs. Those travel as tagged envelopes:
//!
//! ```json
//! {"lc": 2, "type": "bytes", "base64": "3q2+7w=="}
//! {"lc": 2, "type": "set", "values": [1, 2, 3]}
//! {"lc": 2, "type": "constructor", "id": ["pkg", "Thing"], "kwargs": {}}
//! ```
//!
//! The tagged objects are the canonical in-memory representation, so
//! `loads(dumps(v)) == v` holds for every primitive and every tagged
//! extension. An object only counts as tagged when its shape matches
//! exactly; user data that happens to contain an `lc` key passes through
//! untouched.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use miette::Diagnostic;
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Tag discriminator key and version.
pub const TAG_KEY: &str = "lc";
pub const TAG_VERSION: u64 = 2;

/// Known tagged extension types.
pub const TAG_UNDEFINED: &str = "undefined";
pub const TAG_SET: &str = "set";
pub const TAG_MAP: &str = "map";
pub const TAG_REGEXP: &str = "regexp";
pub const TAG_ERROR: &str = "error";
pub const TAG_BYTES: &str = "bytes";
pub const TAG_CONSTRUCTOR: &str = "constructor";

const KNOWN_TAGS: [&str; 7] = [
    TAG_UNDEFINED,
    TAG_SET,
    TAG_MAP,
    TAG_REGEXP,
    TAG_ERROR,
    TAG_BYTES,
    TAG_CONSTRUCTOR,
];

/// Errors from encoding/decoding checkpoint payloads.
#[derive(Debug, Error, Diagnostic)]
pub enum SerializerError {
    #[error("payload is not valid JSON: {0}")]
    #[diagnostic(code(stepgraph::serializer::json))]
    Json(#[from] serde_json::Error),

    #[error("tagged bytes value carries invalid base64: {0}")]
    #[diagnostic(code(stepgraph::serializer::base64))]
    Base64(#[from] base64::DecodeError),

    #[error("unknown payload kind `{kind}`")]
    #[diagnostic(
        code(stepgraph::serializer::kind),
        help("Typed payloads must be `json` or `bytes`.")
    )]
    UnknownKind { kind: String },
}

/// Pluggable (de)serializer for checkpoint payloads.
///
/// The engine stores and transmits opaque byte blobs; this trait decides
/// their encoding. [`JsonPlusSerializer`] is the reference implementation.
pub trait Serializer: Send + Sync {
    /// Encode a value to bytes.
    fn dumps(&self, value: &Value) -> Result<Vec<u8>, SerializerError>;

    /// Decode bytes produced by [`Serializer::dumps`].
    fn loads(&self, data: &[u8]) -> Result<Value, SerializerError>;

    /// Encode with an explicit kind: binary-tagged values are stored raw
    /// under kind `bytes`, everything else as `json`.
    fn dumps_typed(&self, value: &Value) -> Result<(&'static str, Vec<u8>), SerializerError> {
        if let Some(raw) = untag_bytes(value)? {
            return Ok((TAG_BYTES, raw));
        }
        Ok(("json", self.dumps(value)?))
    }

    /// Decode a `(kind, bytes)` pair produced by [`Serializer::dumps_typed`].
    fn loads_typed(&self, kind: &str, data: &[u8]) -> Result<Value, SerializerError> {
        match kind {
            "json" => self.loads(data),
            TAG_BYTES => Ok(tag_bytes(data)),
            other => Err(SerializerError::UnknownKind {
                kind: other.to_string(),
            }),
        }
    }
}

/// JSON with tagged extensions. Stateless; share freely.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPlusSerializer;

impl Serializer for JsonPlusSerializer {
    fn dumps(&self, value: &Value) -> Result<Vec<u8>, SerializerError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads(&self, data: &[u8]) -> Result<Value, SerializerError> {
        Ok(serde_json::from_slice(data)?)
    }
}

fn tag_shell(tag: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(TAG_KEY.to_string(), json!(TAG_VERSION));
    map.insert("type".to_string(), json!(tag));
    map
}

/// Returns the tag of `value` when it is a well-formed tagged envelope.
#[must_use]
pub fn tagged_type(value: &Value) -> Option<&str> {
    let obj = value.as_object()?;
    if obj.get(TAG_KEY)?.as_u64()? != TAG_VERSION {
        return None;
    }
    let tag = obj.get("type")?.as_str()?;
    KNOWN_TAGS.contains(&tag).then_some(tag)
}

/// The `undefined`/absent marker.
#[must_use]
pub fn tag_undefined() -> Value {
    Value::Object(tag_shell(TAG_UNDEFINED))
}

/// Wrap raw bytes in the base64 `bytes` envelope.
#[must_use]
pub fn tag_bytes(data: &[u8]) -> Value {
    let mut map = tag_shell(TAG_BYTES);
    map.insert("base64".to_string(), json!(BASE64.encode(data)));
    Value::Object(map)
}

/// Extract raw bytes from a `bytes` envelope, if `value` is one.
pub fn untag_bytes(value: &Value) -> Result<Option<Vec<u8>>, SerializerError> {
    if tagged_type(value) != Some(TAG_BYTES) {
        return Ok(None);
    }
    let encoded = value
        .get("base64")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Ok(Some(BASE64.decode(encoded)?))
}

/// Wrap a list of distinct values in the `set` envelope.
#[must_use]
pub fn tag_set(values: Vec<Value>) -> Value {
    let mut map = tag_shell(TAG_SET);
    map.insert("values".to_string(), Value::Array(values));
    Value::Object(map)
}

/// Wrap ordered `(key, value)` entries in the `map` envelope.
#[must_use]
pub fn tag_map(entries: Vec<(Value, Value)>) -> Value {
    let mut map = tag_shell(TAG_MAP);
    let entries: Vec<Value> = entries
        .into_iter()
        .map(|(k, v)| Value::Array(vec![k, v]))
        .collect();
    map.insert("entries".to_string(), Value::Array(entries));
    Value::Object(map)
}

/// Wrap a regular expression in the `regexp` envelope.
#[must_use]
pub fn tag_regexp(source: &str, flags: &str) -> Value {
    let mut map = tag_shell(TAG_REGEXP);
    map.insert("source".to_string(), json!(source));
    map.insert("flags".to_string(), json!(flags));
    Value::Object(map)
}

/// Wrap an error in the `error` envelope.
#[must_use]
pub fn tag_error(name: &str, message: &str) -> Value {
    let mut map = tag_shell(TAG_ERROR);
    map.insert("name".to_string(), json!(name));
    map.insert("message".to_string(), json!(message));
    Value::Object(map)
}

/// Wrap a structured constructor reference in the `constructor` envelope.
#[must_use]
pub fn tag_constructor(id: Vec<String>, method: Option<String>, kwargs: Value) -> Value {
    let mut map = tag_shell(TAG_CONSTRUCTOR);
    map.insert("id".to_string(), json!(id));
    if let Some(method) = method {
        map.insert("method".to_string(), json!(method));
    }
    map.insert("kwargs".to_string(), kwargs);
    Value::Object(map)
}
