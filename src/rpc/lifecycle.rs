//! Connection lifecycle shared by the client and its correlator.
//!
//! ```text
//! Disconnected ──► Connecting ──► Authenticating ──► Ready ──► Closed
//!                      │                │                        ▲
//!                      └────────────────┴────── failure ─────────┘
//! ```
//!
//! `Closed` is terminal. Reconnecting means building a new client.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closed,
}

/// Observable lifecycle of one connection.
///
/// Cloning shares the same state; subscribe to follow transitions.
#[derive(Debug, Clone)]
pub struct Lifecycle(Arc<watch::Sender<ConnectionState>>);

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self(Arc::new(tx))
    }

    pub fn get(&self) -> ConnectionState {
        *self.0.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.0.subscribe()
    }

    /// Move to `next`. Returns false if already there or already `Closed`.
    pub(crate) fn advance(&self, next: ConnectionState) -> bool {
        self.0.send_if_modified(|state| {
            if *state == ConnectionState::Closed || *state == next {
                return false;
            }
            *state = next;
            true
        })
    }

    /// Resolves once the state reaches `Closed`.
    pub(crate) async fn closed(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
