//! TrueNAS RPC Library
//!
//! This library provides the transport core used by the TrueNAS resource
//! layer:
//!
//! - `rpc` - Authenticated JSON-RPC 2.0 client over WebSocket
//! - `config` - Endpoint, credentials and timeout settings
//!
//! # Example
//!
//! ```ignore
//! use truenas_rpc::{Client, ClientConfig, Credentials};
//! use serde_json::json;
//!
//! let config = ClientConfig::new("nas.local", Credentials::ApiKey(key))?;
//! let client = Client::connect(&config).await?;
//! let dataset: serde_json::Value = client
//!     .call("pool.dataset.create", vec![json!({"name": "tank/media"})])
//!     .await?;
//! client.close().await;
//! ```

pub mod config;
pub mod rpc;

pub use config::{ClientConfig, ConfigError};
pub use rpc::{
    AuthPolicy, Client, ClientCache, ConnectionState, Credentials, JsonRpcError, Lifecycle,
    Notification, RpcError, RpcService,
};
