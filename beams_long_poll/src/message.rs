//! Wire messages.
//!
//! Server pushes travel as a JSON array of `[name, payload]` tuples.
//! Client emissions carry their payload as the `d` form field of a POST body.

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    ser::SerializeTuple,
};
use serde_json::Value;

/// Name of the form field carrying an emission's payload.
pub const PAYLOAD_FIELD: &str = "d";

/// A named message pushed from the server to a client.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Message name.
    pub name: String,

    /// Message payload.
    pub payload: Value,
}

impl OutboundMessage {
    /// Create a new message.
    #[must_use]
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

impl Serialize for OutboundMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.name)?;
        tuple.serialize_element(&self.payload)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for OutboundMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (name, payload) = <(String, Value)>::deserialize(deserializer)?;
        Ok(Self { name, payload })
    }
}

/// Decode an emission payload.
///
/// Anything that is not valid JSON is handed on as the raw string.
#[must_use]
pub fn decode_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

/// Extract the payload from a urlencoded POST body.
///
/// A body without a `d` field yields `null`.
#[must_use]
pub fn payload_from_form(body: &[u8]) -> Value {
    url::form_urlencoded::parse(body)
        .find(|(key, _)| key == PAYLOAD_FIELD)
        .map_or(Value::Null, |(_, raw)| decode_payload(&raw))
}

/// Encode a serialized payload as a urlencoded POST body.
#[must_use]
pub fn payload_to_form(data: &str) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair(PAYLOAD_FIELD, data)
        .finish()
}
