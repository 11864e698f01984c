//! JSON-RPC 2.0 envelope encoding and decoding.
//!
//! Requests are encoded from [`Request`]. Inbound text is decoded into an
//! [`Inbound`] that is either a response for a specific id or an
//! identifier-less notification. Results stay as [`serde_json::Value`] until
//! the caller asks for a concrete type.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::error::{JsonRpcError, RpcError};

pub const JSONRPC_VERSION: &str = "2.0";

/// Outbound request envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

/// Unsolicited server-pushed event.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: Option<String>,
    pub params: Option<Value>,
}

/// One decoded inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response {
        id: u64,
        outcome: Result<Value, JsonRpcError>,
    },
    Notification(Notification),
}

/// Envelope that could not be decoded.
///
/// `id` is set when the identifier was readable, so the failure can be
/// handed to the one caller waiting on it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("malformed envelope: {reason}")]
pub struct DecodeError {
    pub id: Option<u64>,
    pub reason: String,
}

impl DecodeError {
    fn new(id: Option<u64>, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
        }
    }
}

impl From<DecodeError> for RpcError {
    fn from(err: DecodeError) -> Self {
        RpcError::decode("response", err.reason)
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    method: Option<String>,
    #[serde(default, deserialize_with = "present")]
    params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    error: Option<Value>,
}

/// Keeps an explicit `null` distinguishable from an absent field.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

pub fn encode_request(request: &Request) -> Result<String, RpcError> {
    serde_json::to_string(request)
        .map_err(|e| RpcError::decode(format!("request for {}", request.method), e))
}

pub fn decode(text: &str) -> Result<Inbound, DecodeError> {
    let raw: RawEnvelope =
        serde_json::from_str(text).map_err(|e| DecodeError::new(None, e.to_string()))?;

    let id = match raw.id {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => Some(
            n.as_u64()
                .ok_or_else(|| DecodeError::new(None, format!("invalid id {}", n)))?,
        ),
        Some(other) => return Err(DecodeError::new(None, format!("invalid id {}", other))),
    };

    if let Some(version) = raw.jsonrpc.as_deref() {
        if version != JSONRPC_VERSION {
            return Err(DecodeError::new(
                id,
                format!("unsupported jsonrpc version {:?}", version),
            ));
        }
    }

    // Some servers send `"error": null` next to a result.
    let error = raw.error.filter(|e| !e.is_null());

    let Some(id) = id else {
        // Id-less errors carry nothing to correlate; surface them as events.
        let params = error.or(raw.params);
        return Ok(Inbound::Notification(Notification {
            method: raw.method,
            params,
        }));
    };

    let outcome = match (error, raw.result) {
        (Some(error), _) => Err(serde_json::from_value::<JsonRpcError>(error)
            .map_err(|e| DecodeError::new(Some(id), format!("invalid error object: {}", e)))?),
        (None, Some(result)) => Ok(result),
        (None, None) => {
            return Err(DecodeError::new(
                Some(id),
                "response has neither result nor error",
            ))
        }
    };

    Ok(Inbound::Response { id, outcome })
}
