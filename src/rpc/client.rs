//! Authenticated connection to the TrueNAS management daemon.
//!
//! `Client` is the only type the resource layer needs: it dials the
//! WebSocket, logs in, and then exposes `call`, `call_job` and `close`.
//! It is `Send + Sync`; share it behind an `Arc` and issue calls from as many
//! tasks as needed.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::{
    connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info};

use crate::config::ClientConfig;

use super::auth::authenticate;
use super::codec::Notification;
use super::correlator::Correlator;
use super::error::RpcError;
use super::job::{self, JobHandle, JobTimeouts};
use super::lifecycle::{ConnectionState, Lifecycle};
use super::service::{decode_result, RpcService};

/// Authenticated JSON-RPC client.
///
/// # Connection Lifecycle
///
/// - `connect()` - Dial the endpoint and log in
/// - `connect_with_retry()` - Same, retrying the dial while the daemon boots
/// - `connect_with_lifecycle()` - Same as `connect()`, reporting each state
///   (`Connecting`, `Authenticating`, `Ready`, `Closed`) to a [`Lifecycle`]
/// - `establish()` - Log in over an already-open WebSocket
/// - `call()` / `call_job()` - Issue requests (concurrently if desired)
/// - `close()` - Tear down; later calls fail with `RpcError::Closed`
///
/// # Example
///
/// ```ignore
/// use truenas_rpc::{Client, ClientConfig, Credentials};
/// use serde_json::json;
///
/// let config = ClientConfig::new("nas.local", Credentials::ApiKey(key))?;
/// let client = Client::connect(&config).await?;
///
/// let info: serde_json::Value = client.call("system.info", vec![]).await?;
/// let pool: serde_json::Value = client
///     .call_job("pool.create", vec![json!({"name": "tank", "topology": topology})])
///     .await?;
/// ```
pub struct Client {
    correlator: Correlator,
    lifecycle: Lifecycle,
    call_timeout: Option<Duration>,
    job_timeout: Option<Duration>,
}

impl Client {
    /// Dial `config.endpoint` and authenticate.
    ///
    /// # Errors
    ///
    /// - `RpcError::Transport` if the socket cannot be opened
    /// - `RpcError::Timeout` if the dial exceeds `config.call_timeout`
    /// - `RpcError::Authentication` if the login is rejected
    pub async fn connect(config: &ClientConfig) -> Result<Self, RpcError> {
        Self::connect_with_lifecycle(config, Lifecycle::new()).await
    }

    /// Like [`Client::connect`], reporting progress through `lifecycle`.
    ///
    /// Any failure leaves `lifecycle` in `Closed`.
    pub async fn connect_with_lifecycle(
        config: &ClientConfig,
        lifecycle: Lifecycle,
    ) -> Result<Self, RpcError> {
        lifecycle.advance(ConnectionState::Connecting);
        match dial(config).await {
            Ok(ws) => Self::handshake(ws, config, lifecycle).await,
            Err(e) => {
                lifecycle.advance(ConnectionState::Closed);
                Err(e)
            }
        }
    }

    /// Connect, retrying failed dials with exponential backoff.
    ///
    /// Useful right after an appliance boots, when the port is not yet open.
    /// Retries with delays of 100ms, 200ms, 400ms, etc. Authentication
    /// failures are returned at once.
    pub async fn connect_with_retry(
        config: &ClientConfig,
        max_attempts: u32,
    ) -> Result<Self, RpcError> {
        let max_attempts = max_attempts.max(1);
        let lifecycle = Lifecycle::new();
        lifecycle.advance(ConnectionState::Connecting);
        let mut attempt = 1;

        loop {
            match dial(config).await {
                Ok(ws) => return Self::handshake(ws, config, lifecycle).await,
                Err(e) if attempt < max_attempts => {
                    let delay = Duration::from_millis(100u64 << (attempt - 1).min(10));
                    debug!(attempt, delay = ?delay, "Connection attempt failed: {}", e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    lifecycle.advance(ConnectionState::Closed);
                    return Err(e);
                }
            }
        }
    }

    /// Authenticate over an already-open WebSocket.
    ///
    /// On failure the socket is closed before the error is returned.
    pub async fn establish<S>(ws: WebSocketStream<S>, config: &ClientConfig) -> Result<Self, RpcError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::handshake(ws, config, Lifecycle::new()).await
    }

    async fn handshake<S>(
        ws: WebSocketStream<S>,
        config: &ClientConfig,
        lifecycle: Lifecycle,
    ) -> Result<Self, RpcError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        lifecycle.advance(ConnectionState::Authenticating);
        let client = Self {
            correlator: Correlator::spawn(ws, lifecycle.clone()),
            lifecycle,
            call_timeout: config.call_timeout,
            job_timeout: config.job_timeout,
        };

        debug!("Logging in");
        let login = authenticate(
            &client.correlator,
            &config.credentials,
            &config.auth,
            config.call_timeout,
        )
        .await;

        if let Err(e) = login {
            client.close().await;
            return Err(e);
        }

        client.lifecycle.advance(ConnectionState::Ready);
        info!(endpoint = %config.endpoint, "Connected and authenticated to TrueNAS");
        Ok(client)
    }

    /// Call `method` with the default deadline and decode its result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        self.call_with_timeout(method, params, self.call_timeout)
            .await
    }

    /// Call `method` with an explicit deadline (`None` waits indefinitely).
    pub async fn call_with_timeout<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<T, RpcError> {
        let value = self.correlator.call(method, params, timeout).await?;
        decode_result(method, value)
    }

    /// Call a job-backed `method` and return the finished job's result.
    pub async fn call_job<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RpcError> {
        self.call_job_with_timeout(method, params, self.job_timeout)
            .await
    }

    /// Like [`Client::call_job`] with an explicit deadline for the wait.
    pub async fn call_job_with_timeout<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
        wait_timeout: Option<Duration>,
    ) -> Result<T, RpcError> {
        let timeouts = JobTimeouts {
            submit: self.call_timeout,
            wait: wait_timeout,
        };
        let value = job::run(&self.correlator, method, params, timeouts).await?;
        decode_result(method, value)
    }

    /// Submit a job-backed `method` without waiting for it.
    pub async fn submit_job(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<JobHandle, RpcError> {
        job::submit(&self.correlator, method, params, self.call_timeout).await
    }

    /// Wait for a job returned by [`Client::submit_job`].
    pub async fn wait_job<T: DeserializeOwned>(&self, handle: &JobHandle) -> Result<T, RpcError> {
        let value = job::wait(&self.correlator, handle, self.job_timeout).await?;
        decode_result(job::JOB_WAIT, value)
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        self.correlator.close().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.get()
    }

    /// Follow state transitions, including the move to `Closed` when the
    /// daemon drops the connection.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.lifecycle.subscribe()
    }

    /// Subscribe to server-pushed notifications.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.correlator.notifications()
    }

    /// Responses dropped because no call was waiting on their id.
    pub fn unexpected_responses(&self) -> u64 {
        self.correlator.unexpected_responses()
    }
}

impl RpcService for Client {
    async fn call_raw(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        self.correlator.call(method, params, timeout).await
    }
}

type DialedStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn dial(config: &ClientConfig) -> Result<DialedStream, RpcError> {
    let url = config.endpoint.as_str();
    debug!(url, "Connecting to TrueNAS WebSocket");

    let connector = if config.insecure {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| RpcError::Transport(format!("failed to build TLS connector: {}", e)))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let connecting = connect_async_tls_with_config(url, None, false, connector);
    let result = match config.call_timeout {
        Some(limit) => tokio::time::timeout(limit, connecting)
            .await
            .map_err(|_| RpcError::Timeout {
                method: "connect".to_string(),
                timeout: limit,
            })?,
        None => connecting.await,
    };

    let (ws, _response) = result.map_err(|e| {
        RpcError::Transport(format!(
            "failed to connect to TrueNAS WebSocket at {}: {}",
            url, e
        ))
    })?;
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::auth::Credentials;
    use crate::rpc::correlator::tests::{ws_pair, MockPeer};
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use serde_json::json;

    fn config() -> ClientConfig {
        ClientConfig::new("ws://mock", Credentials::ApiKey("1-key".to_string()))
            .unwrap()
            .with_call_timeout(Some(Duration::from_secs(5)))
    }

    async fn answer_login(peer: &mut MockPeer, accepted: bool) {
        let login = peer.recv().await;
        assert_eq!(login["method"], "auth.login_with_api_key");
        assert_eq!(login["params"], json!(["1-key"]));
        peer.reply(&login["id"], json!(accepted)).await;
    }

    async fn ready_client() -> (Client, MockPeer) {
        let config = config();
        let (ws, mut peer) = ws_pair().await;
        let (client, ()) = tokio::join!(
            Client::establish(ws, &config),
            answer_login(&mut peer, true)
        );
        (client.expect("establish"), peer)
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct SystemInfo {
        hostname: String,
        cores: u32,
    }

    #[tokio::test]
    async fn test_establish_then_typed_call() {
        let (client, mut peer) = ready_client().await;
        assert_eq!(client.state(), ConnectionState::Ready);

        let server = async {
            let request = peer.recv().await;
            assert_eq!(request["method"], "system.info");
            assert!(request.get("params").is_none());
            peer.reply(&request["id"], json!({"hostname": "nas", "cores": 8}))
                .await;
        };
        let (info, ()) = tokio::join!(client.call::<SystemInfo>("system.info", Vec::new()), server);

        assert_eq!(
            info.unwrap(),
            SystemInfo {
                hostname: "nas".to_string(),
                cores: 8
            }
        );
    }

    #[tokio::test]
    async fn test_rejected_login_closes_socket() {
        let config = config();
        let (ws, mut peer) = ws_pair().await;
        let (client, ()) = tokio::join!(
            Client::establish(ws, &config),
            answer_login(&mut peer, false)
        );

        assert!(matches!(client, Err(RpcError::Authentication { .. })));
        assert!(peer.closed().await);
    }

    #[tokio::test]
    async fn test_call_job_returns_wait_result() {
        let (client, mut peer) = ready_client().await;

        let server = async {
            let submit = peer.recv().await;
            assert_eq!(submit["method"], "pool.create");
            peer.reply(&submit["id"], json!(42)).await;

            let wait = peer.recv().await;
            assert_eq!(wait["method"], "core.job_wait");
            assert_eq!(wait["params"], json!([42]));
            peer.reply(&wait["id"], json!({"id": 1, "name": "tank"})).await;
        };
        let (pool, ()) = tokio::join!(
            client.call_job::<Value>("pool.create", vec![json!({"name": "tank"})]),
            server
        );

        assert_eq!(pool.unwrap(), json!({"id": 1, "name": "tank"}));
    }

    #[tokio::test]
    async fn test_submit_and_wait_separately() {
        let (client, mut peer) = ready_client().await;

        let server = async {
            let submit = peer.recv().await;
            peer.reply(&submit["id"], json!(7)).await;
            let wait = peer.recv().await;
            assert_eq!(wait["params"], json!([7]));
            peer.reply(&wait["id"], json!(null)).await;
        };
        let client_side = async {
            let handle = client.submit_job("service.restart", vec![json!("nfs")]).await?;
            assert_eq!(handle.as_value(), &json!(7));
            client.wait_job::<Option<Value>>(&handle).await
        };
        let (result, ()) = tokio::join!(client_side, server);

        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn test_result_type_mismatch_is_decode_error() {
        let (client, mut peer) = ready_client().await;

        let server = async {
            let request = peer.recv().await;
            peer.reply(&request["id"], json!("not a bool")).await;
        };
        let (result, ()) = tokio::join!(client.call::<bool>("service.started", Vec::new()), server);

        assert!(matches!(result, Err(RpcError::Decode { .. })));
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let (client, mut peer) = ready_client().await;

        client.close().await;
        client.close().await;

        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(
            client.call::<Value>("system.info", Vec::new()).await,
            Err(RpcError::Closed)
        ));
        assert!(peer.closed().await);
    }

    #[tokio::test]
    async fn test_lifecycle_follows_login_and_disconnect() {
        let config = config();
        let (ws, mut peer) = ws_pair().await;
        let lifecycle = Lifecycle::new();
        let observer = lifecycle.clone();
        assert_eq!(observer.get(), ConnectionState::Disconnected);

        let server = async {
            let login = peer.recv().await;
            assert_eq!(observer.get(), ConnectionState::Authenticating);
            peer.reply(&login["id"], json!(true)).await;
        };
        let (client, ()) = tokio::join!(Client::handshake(ws, &config, lifecycle), server);
        let client = client.unwrap();
        assert_eq!(client.state(), ConnectionState::Ready);

        let mut changes = client.state_changes();
        drop(peer);
        let state = *tokio::time::timeout(
            Duration::from_secs(5),
            changes.wait_for(|s| *s == ConnectionState::Closed),
        )
        .await
        .expect("disconnect must close the lifecycle")
        .unwrap();
        assert_eq!(state, ConnectionState::Closed);
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_rejected_login_ends_closed() {
        let config = config();
        let (ws, mut peer) = ws_pair().await;
        let lifecycle = Lifecycle::new();

        let (client, ()) = tokio::join!(
            Client::handshake(ws, &config, lifecycle.clone()),
            answer_login(&mut peer, false)
        );

        assert!(client.is_err());
        assert_eq!(lifecycle.get(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_stalled_dial_reports_connecting_then_closed() {
        // Accepts TCP (backlog) but never answers the WebSocket upgrade.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ClientConfig::new(
            &format!("ws://{}", addr),
            Credentials::ApiKey("k".to_string()),
        )
        .unwrap()
        .with_call_timeout(Some(Duration::from_millis(200)));

        let lifecycle = Lifecycle::new();
        let mut changes = lifecycle.subscribe();
        let observe = async {
            *changes
                .wait_for(|s| *s == ConnectionState::Connecting)
                .await
                .unwrap()
        };
        let (result, seen) = tokio::join!(
            Client::connect_with_lifecycle(&config, lifecycle.clone()),
            observe
        );

        assert_eq!(seen, ConnectionState::Connecting);
        assert!(matches!(result, Err(RpcError::Timeout { .. })));
        assert_eq!(lifecycle.get(), ConnectionState::Closed);
        drop(listener);
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ClientConfig::new(
            &format!("ws://{}", addr),
            Credentials::ApiKey("k".to_string()),
        )
        .unwrap();
        let err = Client::connect_with_retry(&config, 2).await.err().unwrap();
        assert!(matches!(err, RpcError::Transport(_)));
    }
}
