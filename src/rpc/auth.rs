//! Login handshake performed right after the socket opens.

use std::fmt;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::error::RpcError;
use super::service::RpcService;

pub const LOGIN_WITH_API_KEY: &str = "auth.login_with_api_key";
pub const LOGIN_WITH_PASSWORD: &str = "auth.login";

/// Credentials presented to the daemon's login methods.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Credentials {
    ApiKey(String),
    UserPassword { username: String, password: String },
}

impl Credentials {
    pub fn login_method(&self) -> &'static str {
        match self {
            Credentials::ApiKey(_) => LOGIN_WITH_API_KEY,
            Credentials::UserPassword { .. } => LOGIN_WITH_PASSWORD,
        }
    }

    pub fn login_params(&self) -> Vec<Value> {
        match self {
            Credentials::ApiKey(key) => vec![json!(key)],
            Credentials::UserPassword { username, password } => {
                vec![json!(username), json!(password)]
            }
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Credentials::UserPassword { username, .. } => f
                .debug_struct("UserPassword")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Retry budget for rate-limited logins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthPolicy {
    /// Total login calls, including the first one.
    pub max_attempts: u32,
    /// Delay after the first rate-limited attempt; doubles each retry.
    pub initial_backoff: Duration,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(5),
        }
    }
}

/// Log in over `service`, retrying only while the daemon reports rate limiting.
///
/// # Errors
///
/// - `RpcError::Authentication` if the login is rejected, returns anything
///   but `true`, or is still rate limited after `policy.max_attempts` calls
/// - `RpcError::Transport` / `RpcError::Closed` if the connection drops
pub async fn authenticate<S: RpcService>(
    service: &S,
    credentials: &Credentials,
    policy: &AuthPolicy,
    timeout: Option<Duration>,
) -> Result<(), RpcError> {
    let method = credentials.login_method();
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;

    loop {
        let result = service
            .call_raw(method, credentials.login_params(), timeout)
            .await;

        match result {
            Ok(Value::Bool(true)) => {
                debug!(method, attempt, "Authenticated");
                return Ok(());
            }
            Ok(other) => {
                return Err(RpcError::Authentication {
                    reason: format!("login returned {}", other),
                    attempts: attempt,
                })
            }
            Err(e) if e.is_terminal() => return Err(e),
            Err(e) if e.is_rate_limited() && attempt < max_attempts => {
                warn!(
                    attempt,
                    backoff = ?backoff,
                    "Rate limited during authentication, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => {
                return Err(RpcError::Authentication {
                    reason: e.to_string(),
                    attempts: attempt,
                })
            }
        }
    }
}
