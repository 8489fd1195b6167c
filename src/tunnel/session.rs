//! Per-client session: lifecycle, declared actions and the waiter table.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::router::RouterError;
use crate::auth::ClientId;
use crate::protocol::{ActionMessage, ActionResult};

/// Write side of a live tunnel.
///
/// Messages queued on `tx` are written to the socket by the connection task;
/// cancelling `shutdown` makes that task send a close frame and exit.
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    tx: mpsc::Sender<ActionMessage>,
    shutdown: CancellationToken,
}

impl TunnelHandle {
    pub fn new(tx: mpsc::Sender<ActionMessage>, shutdown: CancellationToken) -> Self {
        Self { tx, shutdown }
    }

    pub async fn send(&self, msg: ActionMessage) -> Result<(), SessionError> {
        self.tx.send(msg).await.map_err(|_| SessionError::TunnelClosed)
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }
}

/// `Created → Active → Closed`, or `Created → Expired`.
#[derive(Debug)]
enum Lifecycle {
    Created,
    Active(TunnelHandle),
    Closed,
    Expired,
}

/// Gateway-side record of one client's tunnel.
#[derive(Debug)]
pub struct Session {
    id: String,
    client_id: ClientId,
    actions: HashSet<String>,
    spec: String,
    lifecycle: Mutex<Lifecycle>,
    waiters: Mutex<HashMap<String, oneshot::Sender<ActionResult>>>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        client_id: ClientId,
        actions: impl IntoIterator<Item = String>,
        spec: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            client_id,
            actions: actions.into_iter().collect(),
            spec: spec.into(),
            lifecycle: Mutex::new(Lifecycle::Created),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Capability document the client announced, untouched.
    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains(name)
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.lifecycle(), Lifecycle::Active(_))
    }

    /// Attach the tunnel. Only a freshly created session can be activated.
    pub(crate) fn activate(&self, tunnel: TunnelHandle) -> Result<(), RouterError> {
        let mut lifecycle = self.lifecycle();
        match *lifecycle {
            Lifecycle::Created => {
                *lifecycle = Lifecycle::Active(tunnel);
                Ok(())
            }
            Lifecycle::Active(_) => Err(RouterError::AlreadyActive),
            Lifecycle::Closed | Lifecycle::Expired => Err(RouterError::NotFound),
        }
    }

    /// Mark a never-activated session as expired. Returns false if it was
    /// activated (or closed) in the meantime.
    pub(crate) fn expire(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        if matches!(*lifecycle, Lifecycle::Created) {
            *lifecycle = Lifecycle::Expired;
            true
        } else {
            false
        }
    }

    /// Close the tunnel (if any) and release every pending waiter.
    ///
    /// Released waiters observe [`SessionError::TunnelClosed`]. Returns false
    /// if the session was already closed or expired.
    pub(crate) fn close(&self) -> bool {
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Closed);
        let was_open = match previous {
            Lifecycle::Active(tunnel) => {
                tunnel.close();
                true
            }
            Lifecycle::Created => true,
            Lifecycle::Closed | Lifecycle::Expired => false,
        };
        let released = {
            let mut waiters = self.waiters();
            let n = waiters.len();
            waiters.clear();
            n
        };
        if released > 0 {
            debug!(session_id = %self.id, released, "Released pending waiters");
        }
        was_open
    }

    /// Push an action message onto the tunnel.
    pub async fn send_action(&self, msg: ActionMessage) -> Result<(), SessionError> {
        let tunnel = match *self.lifecycle() {
            Lifecycle::Active(ref tunnel) => tunnel.clone(),
            _ => return Err(SessionError::NotActive),
        };
        tunnel.send(msg).await
    }

    /// Register a single-slot waiter for `id`.
    ///
    /// The returned [`Waiter`] frees its slot when dropped, whichever way the
    /// caller leaves (result, timeout, cancellation).
    pub fn allocate_waiter(&self, id: &str) -> Result<Waiter<'_>, SessionError> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters();
        if waiters.contains_key(id) {
            return Err(SessionError::DuplicateWaiter);
        }
        waiters.insert(id.to_string(), tx);
        Ok(Waiter {
            session: self,
            id: id.to_string(),
            rx,
        })
    }

    /// Drop the waiter for `id`. Freeing an unknown or already freed id is a no-op.
    pub fn free_waiter(&self, id: &str) {
        self.waiters().remove(id);
    }

    /// Hand `result` to the waiter registered under its id, at most once.
    pub fn deliver_result(&self, result: ActionResult) -> Result<(), SessionError> {
        let tx = self
            .waiters()
            .remove(&result.id)
            .ok_or(SessionError::WaiterNotFound)?;
        // The receiver may have given up between our remove and this send.
        tx.send(result).map_err(|_| SessionError::WaiterNotFound)
    }

    /// Number of registered waiters.
    pub fn pending_waiters(&self) -> usize {
        self.waiters().len()
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<ActionResult>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receive side of a waiter slot. Frees the slot on drop.
pub struct Waiter<'a> {
    session: &'a Session,
    id: String,
    rx: oneshot::Receiver<ActionResult>,
}

impl Waiter<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the result. Fails with [`SessionError::TunnelClosed`] if the
    /// slot was released without a result.
    pub async fn recv(&mut self) -> Result<ActionResult, SessionError> {
        (&mut self.rx).await.map_err(|_| SessionError::TunnelClosed)
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.session.free_waiter(&self.id);
    }
}

/// Errors from session operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// No waiter is registered under the result's id.
    WaiterNotFound,
    /// A waiter with this id already exists.
    DuplicateWaiter,
    /// The session has no live tunnel.
    NotActive,
    /// The tunnel went away while sending or waiting.
    TunnelClosed,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::WaiterNotFound => write!(f, "Waiter not found"),
            SessionError::DuplicateWaiter => write!(f, "Waiter already exists"),
            SessionError::NotActive => write!(f, "The session is not active"),
            SessionError::TunnelClosed => write!(f, "The tunnel is closed"),
        }
    }
}

impl std::error::Error for SessionError {}
