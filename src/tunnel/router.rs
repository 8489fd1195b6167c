//! Session registry keyed by client identity.
//!
//! Holds at most one [`Session`] per client. Every mutation (create, activate,
//! expire, close) runs under the registry's write lock; lookups share the read
//! lock. Tunnel I/O never happens while the lock is held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::session::{Session, TunnelHandle};
use crate::auth::ClientId;
use crate::protocol::SessionNewRequest;

/// Default window for a created session to be activated.
pub const DEFAULT_ACTIVATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Registry of live sessions. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct SessionRouter {
    sessions: Arc<RwLock<HashMap<ClientId, Arc<Session>>>>,
    activation_timeout: Duration,
}

impl SessionRouter {
    pub fn new(activation_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            activation_timeout,
        }
    }

    /// Admit a new session for `client_id`.
    ///
    /// Fails with [`RouterError::AlreadyExists`] while another session (active
    /// or awaiting activation) is registered for the client. A session that is
    /// not activated within the activation window is dropped.
    pub async fn create_session(
        &self,
        client_id: &ClientId,
        req: SessionNewRequest,
    ) -> Result<Arc<Session>, RouterError> {
        let session = {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(client_id) {
                return Err(RouterError::AlreadyExists);
            }
            let session = Arc::new(Session::new(
                Uuid::now_v7().to_string(),
                client_id.clone(),
                req.actions,
                req.spec,
            ));
            sessions.insert(client_id.clone(), session.clone());
            session
        };
        info!(client_id = %client_id, session_id = %session.id(), "Session created");

        let router = self.clone();
        let pending = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(router.activation_timeout).await;
            router.expire(&pending).await;
        });

        Ok(session)
    }

    /// Remove `session` if it is still registered and was never activated.
    async fn expire(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.write().await;
        let registered = sessions
            .get(session.client_id())
            .is_some_and(|s| Arc::ptr_eq(s, session));
        if registered && session.expire() {
            sessions.remove(session.client_id());
            info!(
                client_id = %session.client_id(),
                session_id = %session.id(),
                "Session expired before activation"
            );
        }
    }

    /// Attach `tunnel` to the client's pending session.
    ///
    /// `session_id` must match the registered session, which protects
    /// against stale or replayed connect URLs.
    pub async fn activate_session(
        &self,
        client_id: &ClientId,
        session_id: &str,
        tunnel: TunnelHandle,
    ) -> Result<Arc<Session>, RouterError> {
        let sessions = self.sessions.write().await;
        let session = sessions.get(client_id).ok_or(RouterError::NotFound)?;
        if session.id() != session_id {
            return Err(RouterError::SessionIdMismatch);
        }
        session.activate(tunnel)?;
        info!(client_id = %client_id, session_id, "Session activated");
        Ok(session.clone())
    }

    /// The client's session, if it exists and has a live tunnel.
    pub async fn get_active_session(&self, client_id: &ClientId) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions.get(client_id).filter(|s| s.is_active()).cloned()
    }

    /// Close `session` and drop it from the registry.
    ///
    /// Only this exact session is removed; a newer session for the same client
    /// is left alone. Closing twice is harmless.
    pub async fn close_session(&self, session: &Arc<Session>) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let registered = sessions
                .get(session.client_id())
                .is_some_and(|s| Arc::ptr_eq(s, session));
            if registered {
                sessions.remove(session.client_id());
            }
            registered
        };
        if session.close() || removed {
            info!(
                client_id = %session.client_id(),
                session_id = %session.id(),
                "Session closed"
            );
        } else {
            debug!(session_id = %session.id(), "Session already closed");
        }
    }

    /// Close every session (gateway shutdown).
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Closed all sessions");
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl Default for SessionRouter {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVATION_TIMEOUT)
    }
}

/// Admission errors. `Display` is the message returned to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterError {
    AlreadyExists,
    NotFound,
    SessionIdMismatch,
    AlreadyActive,
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterError::AlreadyExists => write!(f, "Session already exists"),
            RouterError::NotFound => write!(f, "Session not found"),
            RouterError::SessionIdMismatch => write!(f, "Session id is invalid"),
            RouterError::AlreadyActive => write!(f, "Session already activated"),
        }
    }
}

impl std::error::Error for RouterError {}
