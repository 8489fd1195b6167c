//! Gateway HTTP surface: session admission, the tunnel socket, action dispatch.
//!
//! | Method | Path                                           | Description                   |
//! |--------|------------------------------------------------|-------------------------------|
//! | POST   | `/api/session/new`                             | Register a pending session    |
//! | GET    | `/api/session/connect/{client_id}/{session_id}`| Upgrade to the tunnel         |
//! | POST   | `/api/notify`                                  | Deliver an action result      |
//! | POST   | `/actions/{name}`                              | Run an action on the client   |
//! | GET    | `/docs`                                        | Capability document (YAML)    |
//!
//! All five require a bearer token. A run request pushes an [`ActionMessage`]
//! down the caller's tunnel and parks on a waiter until the matching result
//! arrives through `/api/notify`, the action timeout fires, or the caller
//! goes away.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        FromRef, Path, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::router::SessionRouter;
use super::session::{Session, TunnelHandle};
use crate::auth::{require_client, ClientId, TokenSigner};
use crate::config::Config;
use crate::protocol::{
    ActionMessage, ActionResult, ActionStatus, ErrorResponse, SessionNewRequest,
    SessionNewResponse,
};
use crate::routes;

/// Outbound queue depth per tunnel.
const TUNNEL_QUEUE: usize = 64;

/// How long a closing tunnel may take to flush its close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// State shared by all gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub router: SessionRouter,
    pub signer: Arc<TokenSigner>,
    /// `ws(s)://` base for tunnel URLs handed out by `/api/session/new`.
    pub ws_base_url: String,
    pub action_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_wait: Duration,
}

impl GatewayState {
    pub fn new(config: &Config, signer: Arc<TokenSigner>) -> Self {
        Self {
            router: SessionRouter::new(config.session.activation_timeout()),
            signer,
            ws_base_url: config.websocket_url(),
            action_timeout: config.session.action_timeout(),
            ping_interval: config.session.ping_interval(),
            pong_wait: config.session.pong_wait(),
        }
    }
}

impl FromRef<GatewayState> for Arc<TokenSigner> {
    fn from_ref(state: &GatewayState) -> Self {
        state.signer.clone()
    }
}

/// Build the gateway router.
pub fn gateway_router(state: GatewayState, expose_new_token: bool) -> Router {
    let authed = Router::new()
        .route("/api/session/new", post(session_new))
        .route(
            "/api/session/connect/{client_id}/{session_id}",
            get(session_connect),
        )
        .route("/api/notify", post(notify))
        .route("/actions/{name}", post(run_action))
        .route("/docs", get(docs))
        .route_layer(middleware::from_fn_with_state(
            state.signer.clone(),
            require_client,
        ));

    let mut public = Router::new()
        .route("/", get(routes::health::root))
        .route("/up", get(routes::health::up));
    if expose_new_token {
        public = public.route("/api/new-token", post(routes::token::new_token));
    }

    Router::new().merge(authed).merge(public).with_state(state)
}

/// Errors surfaced by gateway handlers.
///
/// Only [`ApiError::Internal`] is a server fault; everything else is an
/// expected outcome and is logged at most at `info`.
#[derive(Debug)]
pub enum ApiError {
    /// Admission refused (422, JSON).
    Unprocessable(String),
    /// The caller has no live tunnel (503).
    NotActive,
    /// Same as [`ApiError::NotActive`], worded for people reading docs (503).
    NotConnected,
    /// The action is not declared by the caller's session (404).
    ActionNotFound,
    /// The action ran and reported failure (500, its output or a generic message).
    ActionFailed(String),
    /// No result within the action timeout (500).
    Timeout,
    /// The tunnel went away while waiting (500).
    TunnelClosed,
    /// Anything else (500, logged with context).
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unprocessable(message) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorResponse { error: message }),
            )
                .into_response(),
            ApiError::NotActive => {
                (StatusCode::SERVICE_UNAVAILABLE, "The session is not active").into_response()
            }
            ApiError::NotConnected => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Your client is not connected to the server",
            )
                .into_response(),
            ApiError::ActionNotFound => {
                (StatusCode::NOT_FOUND, "The action is not found").into_response()
            }
            ApiError::ActionFailed(body) if !body.is_empty() => {
                payload_response(StatusCode::INTERNAL_SERVER_ERROR, body)
            }
            ApiError::ActionFailed(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "The action execution failed").into_response()
            }
            ApiError::Timeout => {
                (StatusCode::INTERNAL_SERVER_ERROR, "The action execution timeout").into_response()
            }
            ApiError::TunnelClosed => {
                (StatusCode::INTERNAL_SERVER_ERROR, "The tunnel is closed").into_response()
            }
            ApiError::Internal(context) => {
                error!("Internal error: {context}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: "Internal Server Error".to_string(),
                    }),
                )
                    .into_response()
            }
        }
    }
}

/// An action payload: JSON if it looks like an object, plain text otherwise.
fn payload_response(status: StatusCode, body: String) -> Response {
    let content_type = if body.starts_with('{') {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    };
    (status, [(header::CONTENT_TYPE, content_type)], body).into_response()
}

/// `POST /api/session/new`: register a session awaiting its tunnel.
async fn session_new(
    State(state): State<GatewayState>,
    Extension(client_id): Extension<ClientId>,
    Json(req): Json<SessionNewRequest>,
) -> Result<Json<SessionNewResponse>, ApiError> {
    let session = state
        .router
        .create_session(&client_id, req)
        .await
        .map_err(|e| ApiError::Unprocessable(e.to_string()))?;
    let url = format!(
        "{}/api/session/connect/{}/{}",
        state.ws_base_url,
        client_id,
        session.id()
    );
    Ok(Json(SessionNewResponse { url }))
}

/// `GET /api/session/connect/{client_id}/{session_id}`: activate the session
/// and run its tunnel until either side goes away.
async fn session_connect(
    State(state): State<GatewayState>,
    Extension(client_id): Extension<ClientId>,
    Path((path_client_id, session_id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    if path_client_id != client_id.0 {
        return Err(ApiError::Unprocessable("Client is invalid".to_string()));
    }

    let (tx, rx) = mpsc::channel(TUNNEL_QUEUE);
    let shutdown = CancellationToken::new();
    let session = state
        .router
        .activate_session(
            &client_id,
            &session_id,
            TunnelHandle::new(tx, shutdown.clone()),
        )
        .await
        .map_err(|e| ApiError::Unprocessable(e.to_string()))?;

    let failed_router = state.router.clone();
    let failed_session = session.clone();
    let response = ws
        .on_failed_upgrade(move |e| {
            warn!(session_id = %failed_session.id(), "Tunnel upgrade failed: {e}");
            tokio::spawn(async move { failed_router.close_session(&failed_session).await });
        })
        .on_upgrade(move |socket| {
            let span = info_span!("tunnel", client_id = %client_id, session_id = %session_id);
            run_tunnel(socket, state, session, rx, shutdown).instrument(span)
        });
    Ok(response)
}

/// Pump one tunnel: queued messages and pings out, liveness in.
///
/// Any frame from the client counts as liveness. The session is closed when
/// the socket ends, goes quiet for `pong_wait`, or the session is closed
/// from elsewhere.
async fn run_tunnel(
    socket: WebSocket,
    state: GatewayState,
    session: Arc<Session>,
    mut rx: mpsc::Receiver<ActionMessage>,
    shutdown: CancellationToken,
) {
    let (mut sink, mut stream) = socket.split();

    let writer_shutdown = shutdown.clone();
    let ping_interval = state.ping_interval;
    let mut send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + ping_interval,
            ping_interval,
        );
        loop {
            tokio::select! {
                () = writer_shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let text = match serde_json::to_string(&msg) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(request_id = %msg.id, "Failed to encode action message: {e}");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        writer_shutdown.cancel();
    });

    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = tokio::time::timeout(state.pong_wait, stream.next()) => frame,
        };
        match frame {
            Err(_) => {
                info!("No traffic for {}s, closing tunnel", state.pong_wait.as_secs());
                break;
            }
            Ok(None | Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(e))) => {
                info!("Tunnel read failed: {e}");
                break;
            }
            Ok(Some(Ok(Message::Pong(_)))) => debug!("Pong received"),
            Ok(Some(Ok(_))) => {}
        }
    }

    shutdown.cancel();
    state.router.close_session(&session).await;
    if tokio::time::timeout(CLOSE_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }
}

/// `POST /api/notify`: hand a result to whoever is waiting for it.
///
/// A result nobody waits for (late, duplicate, unknown, or from a client
/// without a live session) is dropped and still answered with 204.
async fn notify(
    State(state): State<GatewayState>,
    Extension(client_id): Extension<ClientId>,
    Json(result): Json<ActionResult>,
) -> StatusCode {
    let request_id = result.id.clone();
    let Some(session) = state.router.get_active_session(&client_id).await else {
        debug!(client_id = %client_id, request_id = %request_id, "Result dropped: no active session");
        return StatusCode::NO_CONTENT;
    };
    if let Err(e) = session.deliver_result(result) {
        debug!(client_id = %client_id, request_id = %request_id, "Result dropped: {e}");
    }
    StatusCode::NO_CONTENT
}

/// `GET /docs`: the capability document announced by the caller's client.
async fn docs(
    State(state): State<GatewayState>,
    Extension(client_id): Extension<ClientId>,
) -> Result<Response, ApiError> {
    let session = state
        .router
        .get_active_session(&client_id)
        .await
        .ok_or(ApiError::NotConnected)?;
    Ok((
        [(header::CONTENT_TYPE, "application/yaml")],
        session.spec().to_string(),
    )
        .into_response())
}

/// `POST /actions/{name}`: run `name` on the caller's client.
///
/// The payload is forwarded as text; invalid UTF-8 is replaced, not rejected.
async fn run_action(
    State(state): State<GatewayState>,
    Extension(client_id): Extension<ClientId>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let Some(session) = state.router.get_active_session(&client_id).await else {
        warn!(client_id = %client_id, action = %name, "Action requested without an active session");
        return Err(ApiError::NotActive);
    };
    if !session.has_action(&name) {
        return Err(ApiError::ActionNotFound);
    }

    let msg = ActionMessage::new(&name, String::from_utf8_lossy(&body));
    let request_id = msg.id.clone();
    // Freed on every exit from here on, including caller cancellation.
    let mut waiter = session
        .allocate_waiter(&request_id)
        .map_err(|e| ApiError::Internal(format!("allocate waiter {request_id}: {e}")))?;

    // One deadline covers both queueing onto the tunnel and the reply.
    let exchange = async {
        session
            .send_action(msg)
            .await
            .map_err(|e| ApiError::Internal(format!("send {request_id} to tunnel: {e}")))?;
        debug!(client_id = %client_id, action = %name, request_id = %request_id, "Action dispatched");
        waiter.recv().await.map_err(|_| ApiError::TunnelClosed)
    };

    let result = match tokio::time::timeout(state.action_timeout, exchange).await {
        Ok(result) => result?,
        Err(_) => {
            info!(client_id = %client_id, action = %name, request_id = %request_id, "Action timed out");
            return Err(ApiError::Timeout);
        }
    };

    match result.status {
        ActionStatus::Success => Ok(payload_response(StatusCode::OK, result.body)),
        ActionStatus::Error => {
            debug!(action = %name, request_id = %request_id, "Action reported failure");
            Err(ApiError::ActionFailed(result.body))
        }
    }
}
