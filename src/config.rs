//! Client configuration.
//!
//! Settings come either from code ([`ClientConfig::new`] plus the `with_*`
//! builders) or from the environment:
//!
//! | Variable           | Meaning                                       |
//! |--------------------|-----------------------------------------------|
//! | `TRUENAS_HOST`     | Host or WebSocket URL (`wss://` if no scheme) |
//! | `TRUENAS_API_KEY`  | API key (preferred)                           |
//! | `TRUENAS_USERNAME` | Username, used with `TRUENAS_PASSWORD`        |
//! | `TRUENAS_PASSWORD` | Password                                      |
//! | `TRUENAS_INSECURE` | `true` to skip TLS certificate checks         |

use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::rpc::{AuthPolicy, Credentials};

pub const HOST_ENV: &str = "TRUENAS_HOST";
pub const API_KEY_ENV: &str = "TRUENAS_API_KEY";
pub const USERNAME_ENV: &str = "TRUENAS_USERNAME";
pub const PASSWORD_ENV: &str = "TRUENAS_PASSWORD";
pub const INSECURE_ENV: &str = "TRUENAS_INSECURE";

/// Path of the versioned JSON-RPC endpoint on the daemon.
pub const API_PATH: &str = "/api/current";

/// Default deadline for a plain call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for the wait half of a job call.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "Missing host: set it in the configuration or the {} environment variable",
        HOST_ENV
    )]
    MissingHost,

    #[error(
        "Missing credentials: set {}, or both {} and {}",
        API_KEY_ENV,
        USERNAME_ENV,
        PASSWORD_ENV
    )]
    MissingCredentials,

    #[error("Invalid host {host:?}: {source}")]
    InvalidHost {
        host: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Unsupported scheme {0:?}: expected ws or wss")]
    UnsupportedScheme(String),

    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Everything needed to open and authenticate a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Full WebSocket URL, including [`API_PATH`].
    pub endpoint: Url,
    pub credentials: Credentials,
    /// Skip TLS certificate validation. Test appliances only.
    pub insecure: bool,
    pub call_timeout: Option<Duration>,
    pub job_timeout: Option<Duration>,
    pub auth: AuthPolicy,
}

impl ClientConfig {
    /// # Errors
    ///
    /// Returns `ConfigError` if `host` is empty, unparsable or uses a
    /// scheme other than `ws`/`wss`.
    pub fn new(host: &str, credentials: Credentials) -> Result<Self, ConfigError> {
        Ok(Self {
            endpoint: endpoint_url(host)?,
            credentials,
            insecure: false,
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            job_timeout: Some(DEFAULT_JOB_TIMEOUT),
            auth: AuthPolicy::default(),
        })
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_auth_policy(mut self, policy: AuthPolicy) -> Self {
        self.auth = policy;
        self
    }

    /// Build a configuration from the `TRUENAS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let host = non_empty(HOST_ENV).ok_or(ConfigError::MissingHost)?;
        let credentials = credentials_from(
            non_empty(API_KEY_ENV),
            non_empty(USERNAME_ENV),
            non_empty(PASSWORD_ENV),
        )?;
        let insecure = match non_empty(INSECURE_ENV) {
            Some(value) => parse_bool(INSECURE_ENV, &value)?,
            None => false,
        };

        Ok(Self::new(&host, credentials)?.with_insecure(insecure))
    }

    /// True when `other` would open an identical session.
    pub fn same_session(&self, other: &ClientConfig) -> bool {
        self.endpoint == other.endpoint
            && self.credentials == other.credentials
            && self.insecure == other.insecure
    }
}

/// Pick API key credentials over username/password.
pub fn credentials_from(
    api_key: Option<String>,
    username: Option<String>,
    password: Option<String>,
) -> Result<Credentials, ConfigError> {
    match (api_key, username, password) {
        (Some(key), _, _) => Ok(Credentials::ApiKey(key)),
        (None, Some(username), Some(password)) => {
            Ok(Credentials::UserPassword { username, password })
        }
        _ => Err(ConfigError::MissingCredentials),
    }
}

/// Normalise a host into the daemon's WebSocket endpoint.
///
/// `nas.local` becomes `wss://nas.local/api/current`; an explicit `ws://` or
/// `wss://` scheme is kept and trailing slashes are dropped.
pub fn endpoint_url(host: &str) -> Result<Url, ConfigError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ConfigError::MissingHost);
    }

    let (scheme, rest) = match host.split_once("://") {
        Some((scheme @ ("ws" | "wss"), rest)) => (scheme, rest),
        Some((scheme, _)) => return Err(ConfigError::UnsupportedScheme(scheme.to_string())),
        None => ("wss", host),
    };
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(ConfigError::InvalidHost {
            host: host.to_string(),
            source: url::ParseError::EmptyHost,
        });
    }
    let raw = format!("{}://{}{}", scheme, rest, API_PATH);

    Url::parse(&raw).map_err(|source| ConfigError::InvalidHost {
        host: host.to_string(),
        source,
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_endpoint_defaults_to_wss() {
        let url = endpoint_url("truenas.local").unwrap();
        assert_eq!(url.as_str(), "wss://truenas.local/api/current");
    }

    #[test]
    fn test_endpoint_keeps_scheme_and_port() {
        let url = endpoint_url("ws://10.0.0.5:8080/").unwrap();
        assert_eq!(url.as_str(), "ws://10.0.0.5:8080/api/current");

        let url = endpoint_url("  wss://nas.example.com//  ").unwrap();
        assert_eq!(url.as_str(), "wss://nas.example.com/api/current");
    }

    #[test]
    fn test_endpoint_rejects_other_schemes() {
        assert!(matches!(
            endpoint_url("https://nas.local"),
            Err(ConfigError::UnsupportedScheme(s)) if s == "https"
        ));
        assert!(matches!(endpoint_url("   "), Err(ConfigError::MissingHost)));
        assert!(matches!(
            endpoint_url("wss://"),
            Err(ConfigError::InvalidHost { .. })
        ));
    }

    #[test]
    fn test_new_uses_defaults() {
        let config = ClientConfig::new("nas", Credentials::ApiKey("k".into())).unwrap();
        assert!(!config.insecure);
        assert_eq!(config.call_timeout, Some(DEFAULT_CALL_TIMEOUT));
        assert_eq!(config.job_timeout, Some(DEFAULT_JOB_TIMEOUT));
        assert_eq!(config.auth, AuthPolicy::default());
    }

    #[test]
    fn test_from_lookup_with_api_key() {
        let config = ClientConfig::from_lookup(lookup(&[
            (HOST_ENV, "nas.local"),
            (API_KEY_ENV, "1-abc"),
            (USERNAME_ENV, "root"),
            (PASSWORD_ENV, "pw"),
            (INSECURE_ENV, "TRUE"),
        ]))
        .unwrap();

        assert_eq!(config.endpoint.as_str(), "wss://nas.local/api/current");
        assert_eq!(config.credentials, Credentials::ApiKey("1-abc".into()));
        assert!(config.insecure);
    }

    #[test]
    fn test_from_lookup_with_password() {
        let config = ClientConfig::from_lookup(lookup(&[
            (HOST_ENV, "ws://127.0.0.1:8080"),
            (API_KEY_ENV, ""),
            (USERNAME_ENV, "root"),
            (PASSWORD_ENV, "pw"),
        ]))
        .unwrap();

        assert_eq!(
            config.credentials,
            Credentials::UserPassword {
                username: "root".into(),
                password: "pw".into()
            }
        );
        assert!(!config.insecure);
    }

    #[test]
    fn test_from_lookup_errors() {
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[(API_KEY_ENV, "k")])),
            Err(ConfigError::MissingHost)
        ));
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[(HOST_ENV, "nas"), (USERNAME_ENV, "root")])),
            Err(ConfigError::MissingCredentials)
        ));
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[
                (HOST_ENV, "nas"),
                (API_KEY_ENV, "k"),
                (INSECURE_ENV, "maybe")
            ])),
            Err(ConfigError::InvalidValue { var: INSECURE_ENV, .. })
        ));
    }

    #[test]
    fn test_same_session_ignores_timeouts() {
        let a = ClientConfig::new("nas", Credentials::ApiKey("k".into())).unwrap();
        let b = a.clone().with_call_timeout(None);
        assert!(a.same_session(&b));

        let c = a.clone().with_insecure(true);
        assert!(!a.same_session(&c));

        let d = ClientConfig::new("nas", Credentials::ApiKey("other".into())).unwrap();
        assert!(!a.same_session(&d));
    }
}
