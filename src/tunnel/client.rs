//! Client connector: keeps one tunnel to the gateway alive and serves actions.
//!
//! [`Connector::run`] announces the local action catalog, opens the tunnel the
//! gateway hands back, and then dispatches every inbound [`ActionMessage`] to
//! its own task. Results go back through `POST /api/notify`, never over the
//! tunnel. Any transport failure leads to a reconnect after an exponential
//! backoff until the retry budget runs out.
//!
//! The network side sits behind the [`Transport`] trait so the state machine
//! can be driven without a gateway.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::HeaderValue,
    protocol::{frame::coding::CloseCode, CloseFrame},
    Error as WsError, Message,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::actions::runner::ActionRunner;
use crate::actions::{ActionCatalog, DescribeError};
use crate::config::ClientConfig;
use crate::protocol::{
    ActionMessage, ActionResult, ErrorResponse, NewTokenResponse, SessionNewRequest,
    SessionNewResponse,
};
use crate::status::StatusRecord;

/// Sent on every outbound request and tunnel handshake.
pub const USER_AGENT: &str = concat!("actions-gateway/", env!("CARGO_PKG_VERSION"));

/// Error body reported for a message naming an action we do not have.
const ACTION_NOT_FOUND_BODY: &str = r#"{"error":"action not found"}"#;

/// How long to wait for the gateway to acknowledge our close frame.
const CLOSE_WAIT: Duration = Duration::from_secs(1);

/// The connector's view of the gateway.
pub trait Transport: Send + Sync + 'static {
    /// A connected tunnel socket.
    type Tunnel: Stream<Item = Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Unpin
        + Send
        + 'static;

    /// `POST /api/session/new`.
    fn new_session(
        &self,
        req: &SessionNewRequest,
    ) -> impl Future<Output = Result<SessionNewResponse, ConnectError>> + Send;

    /// Open the tunnel at the URL returned by [`Transport::new_session`].
    fn open_tunnel(&self, url: &str)
        -> impl Future<Output = Result<Self::Tunnel, ConnectError>> + Send;

    /// `POST /api/notify`.
    fn notify_result(
        &self,
        result: &ActionResult,
    ) -> impl Future<Output = Result<(), ConnectError>> + Send;
}

/// [`Transport`] over HTTP(S) and WebSocket.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, ConnectError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ConnectError::Request(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.server.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    /// Non-2xx responses carry `{"error": ...}`; fall back to the raw body.
    async fn check(resp: reqwest::Response) -> Result<String, ConnectError> {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ConnectError::Request(e.to_string()))?;
        if status.is_success() {
            Ok(body)
        } else {
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            Err(ConnectError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }
}

impl Transport for HttpTransport {
    type Tunnel = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn new_session(&self, req: &SessionNewRequest) -> Result<SessionNewResponse, ConnectError> {
        let resp = self
            .http
            .post(format!("{}/api/session/new", self.base_url))
            .bearer_auth(&self.token)
            .json(req)
            .send()
            .await
            .map_err(|e| ConnectError::Request(e.to_string()))?;
        let body = Self::check(resp).await?;
        serde_json::from_str(&body)
            .map_err(|e| ConnectError::Protocol(format!("Invalid session response: {e}")))
    }

    async fn open_tunnel(&self, url: &str) -> Result<Self::Tunnel, ConnectError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ConnectError::Tunnel(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| ConnectError::Protocol(format!("Invalid token: {e}")))?;
        let headers = request.headers_mut();
        headers.insert("Authorization", auth);
        headers.insert("User-Agent", HeaderValue::from_static(USER_AGENT));
        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ConnectError::Tunnel(e.to_string()))?;
        Ok(ws)
    }

    async fn notify_result(&self, result: &ActionResult) -> Result<(), ConnectError> {
        let resp = self
            .http
            .post(format!("{}/api/notify", self.base_url))
            .bearer_auth(&self.token)
            .json(result)
            .send()
            .await
            .map_err(|e| ConnectError::Request(e.to_string()))?;
        Self::check(resp).await.map(|_| ())
    }
}

/// Ask a gateway with token issuance enabled for a fresh client token
/// (`POST /api/new-token`).
pub async fn request_new_token(server: &str) -> Result<String, ConnectError> {
    let http = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| ConnectError::Request(e.to_string()))?;
    let resp = http
        .post(format!("{}/api/new-token", server.trim_end_matches('/')))
        .send()
        .await
        .map_err(|e| ConnectError::Request(e.to_string()))?;
    let body = HttpTransport::check(resp).await?;
    serde_json::from_str::<NewTokenResponse>(&body)
        .map(|r| r.token)
        .map_err(|e| ConnectError::Protocol(format!("Invalid token response: {e}")))
}

/// `min(2^attempt s, max)`.
pub fn backoff_delay(attempt: u32, max: Duration) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(max)
}

/// The client-side state machine.
pub struct Connector<T: Transport> {
    transport: Arc<T>,
    catalog: Arc<ActionCatalog>,
    runner: Arc<ActionRunner>,
    status: Arc<StatusRecord>,
    config: ClientConfig,
    /// Consecutive failures since the last successful tunnel open.
    reconnect_attempts: u32,
}

impl<T: Transport> Connector<T> {
    pub fn new(
        transport: Arc<T>,
        catalog: ActionCatalog,
        runner: ActionRunner,
        status: Arc<StatusRecord>,
        config: ClientConfig,
    ) -> Self {
        Self {
            transport,
            catalog: Arc::new(catalog),
            runner: Arc::new(runner),
            status,
            config,
            reconnect_attempts: 0,
        }
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Run until `shutdown` fires (`Ok`) or the retry budget is spent.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), ConnectorError> {
        self.status.init();
        let spec = self
            .catalog
            .capability_document(&self.runner, &self.config.spec_info, &self.config.server_api_url)
            .await
            .map_err(ConnectorError::Describe)?;
        let req = SessionNewRequest {
            actions: self.catalog.names(),
            spec,
        };
        info!(actions = ?req.actions, server = %self.config.server, "Connector starting");

        loop {
            let err = match self.connect_once(&req, &shutdown).await {
                Ok(()) => break,
                Err(e) => e,
            };

            self.reconnect_attempts += 1;
            if self.reconnect_attempts >= self.config.max_reconnect_attempts {
                error!(attempts = self.reconnect_attempts, "Giving up: {err}");
                self.status
                    .set_given_up(&err.to_string(), self.reconnect_attempts);
                return Err(ConnectorError::GivenUp {
                    attempts: self.reconnect_attempts,
                    last_error: err,
                });
            }

            let delay = backoff_delay(self.reconnect_attempts, self.config.max_backoff());
            warn!(
                "Connection failed: {err}, reconnecting in {}s (attempt {}/{})",
                delay.as_secs(),
                self.reconnect_attempts,
                self.config.max_reconnect_attempts
            );
            self.status
                .set_retrying(&err.to_string(), self.reconnect_attempts);
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.status.set_inactive();
        info!("Connector stopped");
        Ok(())
    }

    /// One pass: session, tunnel, serve. `Ok` means we were asked to stop.
    async fn connect_once(
        &mut self,
        req: &SessionNewRequest,
        shutdown: &CancellationToken,
    ) -> Result<(), ConnectError> {
        self.status.set_connecting(req, self.reconnect_attempts);

        let opened = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            opened = self.open(req) => opened?,
        };
        let (res, tunnel) = opened;

        self.reconnect_attempts = 0;
        self.status.set_active(req, &res);
        info!(url = %res.url, "Tunnel connected");

        self.serve(tunnel, shutdown)
            .instrument(info_span!("tunnel", url = %res.url))
            .await
    }

    async fn open(
        &self,
        req: &SessionNewRequest,
    ) -> Result<(SessionNewResponse, T::Tunnel), ConnectError> {
        let res = self.transport.new_session(req).await?;
        let tunnel = self.transport.open_tunnel(&res.url).await?;
        Ok((res, tunnel))
    }

    /// Read frames and keep the tunnel alive until it fails or we shut down.
    async fn serve(&self, tunnel: T::Tunnel, shutdown: &CancellationToken) -> Result<(), ConnectError> {
        let (mut sink, mut stream) = tunnel.split();
        let period = self.config.keepalive_interval();
        let liveness = self.config.liveness_timeout();
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Closing tunnel");
                    let close = Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    }));
                    if let Err(e) = sink.send(close).await {
                        debug!("Close frame not sent: {e}");
                        return Ok(());
                    }
                    let acked = tokio::time::timeout(CLOSE_WAIT, async {
                        while let Some(Ok(msg)) = stream.next().await {
                            if msg.is_close() {
                                break;
                            }
                        }
                    })
                    .await;
                    if acked.is_err() {
                        debug!("Gateway did not acknowledge close");
                    }
                    return Ok(());
                }
                frame = stream.next() => {
                    let msg = match frame {
                        None => return Err(ConnectError::Disconnected),
                        Some(Err(e)) => return Err(ConnectError::Tunnel(e.to_string())),
                        Some(Ok(msg)) => msg,
                    };
                    last_seen = Instant::now();
                    match msg {
                        Message::Text(text) => self.dispatch(&text),
                        Message::Close(_) => return Err(ConnectError::Disconnected),
                        _ => {}
                    }
                }
                _ = keepalive.tick() => {
                    if last_seen.elapsed() > liveness {
                        return Err(ConnectError::LivenessTimeout);
                    }
                    sink.send(Message::Ping(Vec::new().into()))
                        .await
                        .map_err(|e| ConnectError::Tunnel(e.to_string()))?;
                }
            }
        }
    }

    /// Run the action on its own task; the read loop never waits for it.
    fn dispatch(&self, text: &str) {
        let msg: ActionMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Ignoring malformed action message: {e}");
                return;
            }
        };
        let span = info_span!("action", action = %msg.name, request_id = %msg.id);
        let transport = self.transport.clone();
        let catalog = self.catalog.clone();
        let runner = self.runner.clone();
        tokio::spawn(
            async move {
                let result = execute(&catalog, &runner, msg).await;
                if let Err(e) = transport.notify_result(&result).await {
                    warn!("Failed to notify result: {e}");
                }
            }
            .instrument(span),
        );
    }
}

/// Run the named action and shape its outcome as a result.
async fn execute(catalog: &ActionCatalog, runner: &ActionRunner, msg: ActionMessage) -> ActionResult {
    let Some(action) = catalog.get(&msg.name) else {
        warn!("Action not found");
        return ActionResult::error(msg.id, ACTION_NOT_FOUND_BODY);
    };
    debug!("Running action");
    match runner.run(action, &msg.body).await {
        Ok(output) => ActionResult::success(msg.id, output),
        Err(e) => {
            info!("Action failed: {e}");
            ActionResult::error(msg.id, e.output().unwrap_or_default())
        }
    }
}

/// One failed connection attempt.
#[derive(Debug)]
pub enum ConnectError {
    /// HTTP transport error (connection refused, timeout, DNS failure, ...).
    Request(String),
    /// The gateway answered with a non-2xx status.
    Status { status: u16, message: String },
    /// The gateway's response could not be understood.
    Protocol(String),
    /// Opening, reading or writing the tunnel failed.
    Tunnel(String),
    /// Nothing heard from the gateway within the liveness window.
    LivenessTimeout,
    /// The gateway closed the tunnel.
    Disconnected,
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::Request(e) => write!(f, "HTTP request failed: {e}"),
            ConnectError::Status { status, message } => {
                write!(f, "Gateway error (HTTP {status}): {message}")
            }
            ConnectError::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            ConnectError::Tunnel(e) => write!(f, "Tunnel error: {e}"),
            ConnectError::LivenessTimeout => write!(f, "Tunnel liveness timeout"),
            ConnectError::Disconnected => write!(f, "Server disconnected"),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Why [`Connector::run`] stopped without being asked to.
#[derive(Debug)]
pub enum ConnectorError {
    /// An action could not describe itself, so there is nothing to announce.
    Describe(DescribeError),
    /// `attempts` consecutive attempts failed.
    GivenUp {
        attempts: u32,
        last_error: ConnectError,
    },
}

impl std::fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorError::Describe(e) => write!(f, "{e}"),
            ConnectorError::GivenUp {
                attempts,
                last_error,
            } => write!(f, "Gave up after {attempts} attempts: {last_error}"),
        }
    }
}

impl std::error::Error for ConnectorError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};

    use futures::channel::mpsc as fmpsc;
    use tokio::sync::mpsc;

    use crate::actions::tests::write_script;
    use crate::status::ConnectorState;

    /// In-memory tunnel: the test holds the other ends of both channels.
    struct FakeTunnel {
        inbound: fmpsc::UnboundedReceiver<Result<Message, WsError>>,
        outbound: fmpsc::UnboundedSender<Message>,
    }

    impl Stream for FakeTunnel {
        type Item = Result<Message, WsError>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.inbound.poll_next_unpin(cx)
        }
    }

    impl Sink<Message> for FakeTunnel {
        type Error = WsError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), WsError> {
            self.outbound
                .unbounded_send(item)
                .map_err(|_| WsError::ConnectionClosed)
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            self.outbound.close_channel();
            Poll::Ready(Ok(()))
        }
    }

    /// Gateway side of an opened fake tunnel.
    struct Peer {
        to_client: fmpsc::UnboundedSender<Result<Message, WsError>>,
        from_client: fmpsc::UnboundedReceiver<Message>,
    }

    /// Scripted transport: fails the first `open_failures` tunnel opens.
    struct FakeTransport {
        open_failures: Mutex<u32>,
        session_failures: Mutex<u32>,
        attempts: Mutex<Vec<Instant>>,
        peers: mpsc::UnboundedSender<Peer>,
        results: mpsc::UnboundedSender<ActionResult>,
        requests: Mutex<VecDeque<SessionNewRequest>>,
    }

    struct Harness {
        transport: Arc<FakeTransport>,
        peers: mpsc::UnboundedReceiver<Peer>,
        results: mpsc::UnboundedReceiver<ActionResult>,
    }

    fn harness(open_failures: u32, session_failures: u32) -> Harness {
        let (peers_tx, peers) = mpsc::unbounded_channel();
        let (results_tx, results) = mpsc::unbounded_channel();
        Harness {
            transport: Arc::new(FakeTransport {
                open_failures: Mutex::new(open_failures),
                session_failures: Mutex::new(session_failures),
                attempts: Mutex::new(Vec::new()),
                peers: peers_tx,
                results: results_tx,
                requests: Mutex::new(VecDeque::new()),
            }),
            peers,
            results,
        }
    }

    /// Script prefix: print nothing when asked to describe.
    const QUIET: &str = "[ -n \"$ACTIONS_GATEWAY_ACTIONS_SPEC\" ] && exit 0\n";

    fn take_one(counter: &Mutex<u32>) -> bool {
        let mut n = counter.lock().unwrap();
        if *n > 0 {
            *n -= 1;
            true
        } else {
            false
        }
    }

    impl Transport for FakeTransport {
        type Tunnel = FakeTunnel;

        async fn new_session(&self, req: &SessionNewRequest) -> Result<SessionNewResponse, ConnectError> {
            self.attempts.lock().unwrap().push(Instant::now());
            self.requests.lock().unwrap().push_back(req.clone());
            if take_one(&self.session_failures) {
                return Err(ConnectError::Status {
                    status: 422,
                    message: "Session already exists".into(),
                });
            }
            Ok(SessionNewResponse {
                url: "ws://gateway/api/session/connect/c/s".into(),
            })
        }

        async fn open_tunnel(&self, _url: &str) -> Result<FakeTunnel, ConnectError> {
            if take_one(&self.open_failures) {
                return Err(ConnectError::Tunnel("connection refused".into()));
            }
            let (to_client, inbound) = fmpsc::unbounded();
            let (outbound, from_client) = fmpsc::unbounded();
            let _ = self.peers.send(Peer {
                to_client,
                from_client,
            });
            Ok(FakeTunnel { inbound, outbound })
        }

        async fn notify_result(&self, result: &ActionResult) -> Result<(), ConnectError> {
            let _ = self.results.send(result.clone());
            Ok(())
        }
    }

    fn config(max_attempts: u32, max_backoff: u64) -> ClientConfig {
        let mut config = ClientConfig::new("http://gateway", "token");
        config.max_reconnect_attempts = max_attempts;
        config.max_reconnect_backoff = max_backoff;
        config
    }

    fn connector(
        transport: &Arc<FakeTransport>,
        catalog: ActionCatalog,
        work_dir: &std::path::Path,
        config: ClientConfig,
    ) -> (Connector<FakeTransport>, Arc<StatusRecord>) {
        let status = Arc::new(StatusRecord::new());
        let connector = Connector::new(
            transport.clone(),
            catalog,
            ActionRunner::new(work_dir),
            status.clone(),
            config,
        );
        (connector, status)
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let max = Duration::from_secs(32);
        let delays: Vec<u64> = (1..=7).map(|n| backoff_delay(n, max).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 32, 32]);
        assert_eq!(backoff_delay(200, max), max);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_capped_backoff_and_resets_attempts() {
        let mut h = harness(3, 0);
        let (mut connector, status) = connector(
            &h.transport,
            ActionCatalog::default(),
            std::path::Path::new("."),
            config(10, 5),
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                let result = connector.run(shutdown).await;
                (result, connector.reconnect_attempts())
            }
        });

        let peer = h.peers.recv().await.unwrap();
        let snapshot = status.snapshot();
        assert_eq!(snapshot.state, ConnectorState::Active);
        assert_eq!(snapshot.reconnect_attempts, 0);

        let attempts = h.transport.attempts.lock().unwrap().clone();
        let gaps: Vec<u64> = attempts
            .windows(2)
            .map(|w| (w[1] - w[0]).as_secs())
            .collect();
        assert_eq!(gaps, vec![2, 4, 5]);

        shutdown.cancel();
        drop(peer);
        let (result, attempts) = task.await.unwrap();
        result.unwrap();
        assert_eq!(attempts, 0);
        assert_eq!(status.snapshot().state, ConnectorState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let h = harness(0, u32::MAX);
        let (mut connector, status) = connector(
            &h.transport,
            ActionCatalog::default(),
            std::path::Path::new("."),
            config(3, 32),
        );

        let err = connector.run(CancellationToken::new()).await.unwrap_err();
        match err {
            ConnectorError::GivenUp {
                attempts,
                last_error: ConnectError::Status { status, .. },
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(status, 422);
            }
            other => panic!("unexpected: {other}"),
        }
        assert_eq!(h.transport.attempts.lock().unwrap().len(), 3);
        let snapshot = status.snapshot();
        assert_eq!(snapshot.state, ConnectorState::GivenUp);
        assert_eq!(snapshot.reconnect_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_backoff() {
        let h = harness(0, u32::MAX);
        let (mut connector, status) = connector(
            &h.transport,
            ActionCatalog::default(),
            std::path::Path::new("."),
            config(10, 32),
        );
        let shutdown = CancellationToken::new();
        let started = Instant::now();
        let canceller = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                shutdown.cancel();
            })
        };

        connector.run(shutdown).await.unwrap();
        canceller.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(status.snapshot().state, ConnectorState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_gateway_trips_liveness() {
        let mut h = harness(0, 0);
        let (mut connector, _status) = connector(
            &h.transport,
            ActionCatalog::default(),
            std::path::Path::new("."),
            config(1, 32),
        );
        let started = Instant::now();
        let task = tokio::spawn(async move { connector.run(CancellationToken::new()).await });

        // Keep the peer alive but never answer.
        let _peer = h.peers.recv().await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::GivenUp {
                last_error: ConnectError::LivenessTimeout,
                ..
            }
        ));
        assert!(started.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn server_close_triggers_reconnect() {
        let mut h = harness(0, 0);
        let (mut connector, _status) = connector(
            &h.transport,
            ActionCatalog::default(),
            std::path::Path::new("."),
            config(10, 32),
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { connector.run(shutdown).await }
        });

        let first = h.peers.recv().await.unwrap();
        first
            .to_client
            .unbounded_send(Ok(Message::Close(None)))
            .unwrap();
        let _second = h.peers.recv().await.unwrap();
        assert_eq!(h.transport.attempts.lock().unwrap().len(), 2);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn graceful_shutdown_sends_close_frame() {
        let mut h = harness(0, 0);
        let (mut connector, _status) = connector(
            &h.transport,
            ActionCatalog::default(),
            std::path::Path::new("."),
            config(10, 32),
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { connector.run(shutdown).await }
        });

        let mut peer = h.peers.recv().await.unwrap();
        shutdown.cancel();
        let frame = peer.from_client.next().await.unwrap();
        assert!(frame.is_close());
        peer.to_client
            .unbounded_send(Ok(Message::Close(None)))
            .unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dispatches_actions_and_reports_results() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "echo", "echo \"$(cat)\"");
        write_script(dir.path(), "fail", &format!("{QUIET}echo partial; echo oops >&2; exit 2"));
        let catalog = ActionCatalog::scan(dir.path()).unwrap();

        let mut h = harness(0, 0);
        let (mut connector, _status) =
            connector(&h.transport, catalog, dir.path(), config(10, 32));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { connector.run(shutdown).await }
        });

        let peer = h.peers.recv().await.unwrap();
        let announced = h.transport.requests.lock().unwrap().pop_front().unwrap();
        assert_eq!(announced.actions, vec!["echo", "fail"]);

        let send = |msg: &ActionMessage| {
            let text = serde_json::to_string(msg).unwrap();
            peer.to_client
                .unbounded_send(Ok(Message::Text(text.into())))
                .unwrap();
        };
        let echo = ActionMessage::new("echo", "hello");
        let fail = ActionMessage::new("fail", "");
        let missing = ActionMessage::new("missing", "");
        send(&echo);
        send(&fail);
        send(&missing);

        let mut results = Vec::new();
        for _ in 0..3 {
            results.push(h.results.recv().await.unwrap());
        }
        let find = |id: &str| results.iter().find(|r| r.id == id).unwrap().clone();
        assert_eq!(find(&echo.id), ActionResult::success(&echo.id, "hello\n"));
        assert_eq!(find(&fail.id), ActionResult::error(&fail.id, "partial\n"));
        assert_eq!(
            find(&missing.id),
            ActionResult::error(&missing.id, ACTION_NOT_FOUND_BODY)
        );

        shutdown.cancel();
        drop(peer);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn slow_action_does_not_block_fast_one() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "slow", &format!("{QUIET}sleep 2; echo slow"));
        write_script(dir.path(), "fast", "echo fast");
        let catalog = ActionCatalog::scan(dir.path()).unwrap();

        let mut h = harness(0, 0);
        let (mut connector, _status) =
            connector(&h.transport, catalog, dir.path(), config(10, 32));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { connector.run(shutdown).await }
        });

        let peer = h.peers.recv().await.unwrap();
        for msg in [ActionMessage::new("slow", ""), ActionMessage::new("fast", "")] {
            let text = serde_json::to_string(&msg).unwrap();
            peer.to_client
                .unbounded_send(Ok(Message::Text(text.into())))
                .unwrap();
        }

        let first = h.results.recv().await.unwrap();
        assert_eq!(first.body, "fast\n");
        let second = h.results.recv().await.unwrap();
        assert_eq!(second.body, "slow\n");

        shutdown.cancel();
        drop(peer);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn describe_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "broken", "exit 1");
        let catalog = ActionCatalog::scan(dir.path()).unwrap();

        let h = harness(0, 0);
        let (mut connector, _status) =
            connector(&h.transport, catalog, dir.path(), config(10, 32));
        let err = connector.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Describe(_)));
        assert!(h.transport.attempts.lock().unwrap().is_empty());
    }
}
