//! The `call` contract shared by every layer above the correlator.

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::error::RpcError;

/// Trait for issuing JSON-RPC calls.
///
/// This trait abstracts the connection to enable:
/// - Authentication and job orchestration written once over any caller
/// - Mock implementations in tests without a socket
pub trait RpcService: Send + Sync {
    /// Issue one request and wait for its raw result.
    ///
    /// `timeout` of `None` waits for as long as the connection lives.
    fn call_raw(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send;
}

/// Decode a raw result into the caller's type.
pub fn decode_result<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, RpcError> {
    serde_json::from_value(value).map_err(|e| RpcError::decode(format!("result for {}", method), e))
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use tokio::time::Instant;

    use super::*;

    /// One recorded call: method, params and when it was issued.
    pub(crate) type Recorded = (String, Vec<Value>, Instant);

    /// Scripted service that records every call it receives.
    #[derive(Default)]
    pub(crate) struct MockService {
        pub(crate) calls: Mutex<Vec<Recorded>>,
        responses: Mutex<VecDeque<Result<Value, RpcError>>>,
    }

    impl MockService {
        pub(crate) fn with_responses(
            responses: impl IntoIterator<Item = Result<Value, RpcError>>,
        ) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                responses: Mutex::new(responses.into_iter().collect()),
            }
        }

        pub(crate) fn methods(&self) -> Vec<String> {
            let calls = self.calls.lock().unwrap();
            calls.iter().map(|(method, _, _)| method.clone()).collect()
        }
    }

    impl RpcService for MockService {
        async fn call_raw(
            &self,
            method: &str,
            params: Vec<Value>,
            _timeout: Option<Duration>,
        ) -> Result<Value, RpcError> {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_string(), params, Instant::now()));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Value::Null))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_result_typed() {
        let names: Vec<String> = decode_result("pool.query", json!(["tank", "fast"])).unwrap();
        assert_eq!(names, vec!["tank", "fast"]);
    }

    #[test]
    fn test_decode_result_mismatch_is_decode_error() {
        let err = decode_result::<bool>("auth.login", json!({"ok": true})).unwrap_err();
        match err {
            RpcError::Decode { context, .. } => assert_eq!(context, "result for auth.login"),
            other => panic!("Expected Decode, got {:?}", other),
        }
    }
}
