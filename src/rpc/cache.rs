//! Shared connection reused across configuration reloads.
//!
//! A provider is typically reconfigured several times per run with the same
//! settings. `ClientCache` hands out the same `Arc<Client>` as long as the
//! session settings are unchanged and the connection is still `Ready`;
//! otherwise it connects anew and replaces the cached entry.
//!
//! A replaced client is not closed here: other holders may still be using
//! it, and it shuts down when the last `Arc` is dropped.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::config::ClientConfig;

use super::client::Client;
use super::lifecycle::ConnectionState;
use super::error::RpcError;

struct Cached {
    config: ClientConfig,
    client: Arc<Client>,
}

#[derive(Default)]
pub struct ClientCache {
    slot: Mutex<Option<Cached>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached client for `config`, connecting if needed.
    pub async fn get_or_connect(&self, config: &ClientConfig) -> Result<Arc<Client>, RpcError> {
        self.get_or_insert_with(config, || Client::connect(config))
            .await
    }

    /// Like [`ClientCache::get_or_connect`] with a caller-supplied connector.
    ///
    /// The cache lock is held while connecting, so concurrent callers with
    /// the same settings share one connection attempt.
    pub async fn get_or_insert_with<F, Fut>(
        &self,
        config: &ClientConfig,
        connect: F,
    ) -> Result<Arc<Client>, RpcError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Client, RpcError>>,
    {
        let mut slot = self.slot.lock().await;

        if let Some(cached) = slot.as_ref() {
            let usable = cached.client.state() == ConnectionState::Ready;
            if usable && cached.config.same_session(config) {
                debug!(endpoint = %config.endpoint, "Reusing cached connection");
                return Ok(Arc::clone(&cached.client));
            }
            debug!(usable, "Replacing cached connection");
        }

        *slot = None;
        let client = Arc::new(connect().await?);
        *slot = Some(Cached {
            config: config.clone(),
            client: Arc::clone(&client),
        });
        Ok(client)
    }

    /// Drop the cached entry and return it, if any.
    pub async fn invalidate(&self) -> Option<Arc<Client>> {
        self.slot.lock().await.take().map(|cached| cached.client)
    }
}
