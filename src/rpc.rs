//! JSON-RPC 2.0 client core for the TrueNAS management daemon.
//!
//! This module provides an authenticated, multiplexed connection to the
//! daemon's WebSocket API.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐          WebSocket           ┌─────────────────────┐
//! │  resource layer  │  ◄─────────────────────────► │  middlewared        │
//! │  (Client)        │   JSON-RPC 2.0, one frame    │  /api/current       │
//! └──────────────────┘        per envelope          └─────────────────────┘
//! ```
//!
//! | Module       | Responsibility                                     |
//! |--------------|----------------------------------------------------|
//! | `codec`      | Envelope encode/decode                             |
//! | `framing`    | WebSocket frames to envelope text                  |
//! | `correlator` | Ids, pending table, reader task, notifications     |
//! | `auth`       | Login with rate-limit backoff                      |
//! | `job`        | Submit + `core.job_wait`                           |
//! | `lifecycle`  | Observable connection state machine                |
//! | `client`     | Connection setup and the caller-facing API         |
//! | `cache`      | Shared connection across configuration reloads     |
//!
//! # Protocol
//!
//! ```text
//! -> {"jsonrpc":"2.0","id":1,"method":"auth.login_with_api_key","params":["1-abc"]}
//! <- {"jsonrpc":"2.0","method":"collection_update","params":{...}}   (notification)
//! <- {"jsonrpc":"2.0","id":1,"result":true}
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use truenas_rpc::{Client, ClientConfig};
//!
//! let client = Client::connect(&ClientConfig::from_env()?).await?;
//! let datasets: Vec<serde_json::Value> = client.call("pool.dataset.query", vec![]).await?;
//! ```

mod auth;
mod cache;
mod client;
mod codec;
mod correlator;
mod error;
mod framing;
mod job;
mod lifecycle;
mod service;

pub use auth::{authenticate, AuthPolicy, Credentials, LOGIN_WITH_API_KEY, LOGIN_WITH_PASSWORD};
pub use cache::ClientCache;
pub use client::Client;
pub use codec::{decode, encode_request, DecodeError, Inbound, Notification, Request};
pub use correlator::Correlator;
pub use error::{JsonRpcError, RpcError};
pub use framing::{read_message, write_message};
pub use job::{JobHandle, JobTimeouts, JOB_WAIT};
pub use lifecycle::{ConnectionState, Lifecycle};
pub use service::{decode_result, RpcService};
