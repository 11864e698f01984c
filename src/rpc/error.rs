//! Error types for the RPC core.
//!
//! Every failure a caller can observe is an [`RpcError`]. The variants map
//! one-to-one onto the failure classes of the protocol: transport loss,
//! malformed envelopes, server-reported errors, caller deadlines, login
//! rejection and use after close.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error object carried by a JSON-RPC error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// JSON-RPC error code
    pub code: i64,
    /// Human-readable message
    pub message: String,
    /// Optional diagnostic payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            Some(data) => write!(
                f,
                "JSON-RPC error {}: {} (data: {})",
                self.code, self.message, data
            ),
            None => write!(f, "JSON-RPC error {}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for JsonRpcError {}

/// RPC-level error types.
///
/// `Transport` and `Closed` are terminal for the connection; every other
/// variant only affects the call that produced it.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// Socket write/read failure. The connection is unusable afterwards.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed envelope or a result that does not fit the expected type.
    #[error("Failed to decode {context}: {reason}")]
    Decode { context: String, reason: String },

    /// The server answered with a JSON-RPC error object.
    #[error(transparent)]
    Protocol(#[from] JsonRpcError),

    /// Caller-imposed deadline expired.
    #[error("{method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// Login was rejected or rate limited past the retry budget.
    #[error("Authentication failed after {attempts} attempt(s): {reason}")]
    Authentication { reason: String, attempts: u32 },

    /// The connection was closed by the caller.
    #[error("Connection is closed")]
    Closed,
}

impl RpcError {
    pub(crate) fn decode(context: impl Into<String>, reason: impl fmt::Display) -> Self {
        RpcError::Decode {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the connection that produced this error can no longer be used.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RpcError::Transport(_) | RpcError::Closed)
    }

    /// True for server errors that signal login rate limiting.
    ///
    /// The daemon reports this through the message text (and sometimes the
    /// data payload) rather than a dedicated code.
    pub fn is_rate_limited(&self) -> bool {
        let RpcError::Protocol(err) = self else {
            return false;
        };
        let mentions = |text: &str| text.to_ascii_lowercase().contains("rate limit");
        mentions(&err.message) || err.data.as_ref().is_some_and(|d| mentions(&d.to_string()))
    }
}
