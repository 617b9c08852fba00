//! Request and response envelopes exchanged with the control plane.

use crate::{Error, Result};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Protocol version negotiated per request. Version 0 is assumed when the
/// sender does not say.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(pub u32);

/// An inbound request.
///
/// `payload` keeps the raw message body so actions can decode their own
/// arguments and persistent tasks can store it verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub reply_to: String,
    pub method: String,
    pub payload: Vec<u8>,
    pub protocol_version: ProtocolVersion,
}

#[derive(Deserialize)]
struct RequestEnvelope {
    method: String,
    #[serde(default)]
    reply_to: String,
    #[serde(default)]
    protocol: ProtocolVersion,
}

impl Request {
    pub fn new(method: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            reply_to: String::new(),
            method: method.into(),
            payload: payload.into(),
            protocol_version: ProtocolVersion::default(),
        }
    }

    /// Decode a raw bus message, keeping the bytes as the payload.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let envelope: RequestEnvelope = serde_json::from_slice(raw)
            .map_err(|e| Error::Serialization(format!("Unmarshalling request: {}", e)))?;
        Ok(Self {
            reply_to: envelope.reply_to,
            method: envelope.method,
            payload: raw.to_vec(),
            protocol_version: envelope.protocol,
        })
    }

    /// Positional arguments from the payload, or an empty list.
    pub fn arguments(&self) -> Result<Vec<Value>> {
        arguments_from_payload(&self.payload)
    }
}

/// Extract the `arguments` array from a raw request payload.
pub fn arguments_from_payload(payload: &[u8]) -> Result<Vec<Value>> {
    #[derive(Deserialize)]
    struct Args {
        #[serde(default)]
        arguments: Vec<Value>,
    }

    let args: Args = serde_json::from_slice(payload)
        .map_err(|e| Error::Serialization(format!("Unmarshalling arguments: {}", e)))?;
    Ok(args.arguments)
}

/// Response to a request.
///
/// Serializes to `{"value": ...}` or `{"exception": {"message": ...}}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Value(Value),
    Exception(String),
}

impl Response {
    pub fn value(value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => Response::Value(v),
            Err(e) => Response::Exception(format!("Marshalling response: {}", e)),
        }
    }

    pub fn exception(message: impl Into<String>) -> Self {
        Response::Exception(message.into())
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, Response::Exception(_))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            Response::Value(v) => map.serialize_entry("value", v)?,
            Response::Exception(message) => {
                map.serialize_entry("exception", &serde_json::json!({ "message": message }))?
            }
        }
        map.end()
    }
}
