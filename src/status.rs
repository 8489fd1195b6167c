//! Connector status record: a side channel observers can poll.
//!
//! The connector updates a [`StatusRecord`] on every state transition. When a
//! status file is configured each update is also written there as JSON, so a
//! separate `actions-gateway status` process can read it.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::protocol::{SessionNewRequest, SessionNewResponse};

/// Connector lifecycle state as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorState {
    /// Not connected (initial state, between attempts, or after shutdown).
    Inactive,
    /// Requesting a session or opening the tunnel.
    Connecting,
    /// Tunnel open, actions are being served.
    Active,
    /// Retry budget exhausted; the connector stopped for good.
    GivenUp,
}

/// Snapshot of the connector's status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub state: ConnectorState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_new_request: Option<SessionNewRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_new_response: Option<SessionNewResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Consecutive failed attempts since the last successful tunnel open.
    #[serde(default)]
    pub reconnect_attempts: u32,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: ConnectorState::Inactive,
            session_new_request: None,
            session_new_response: None,
            error: None,
            reconnect_attempts: 0,
        }
    }
}

/// Shared, mutable status record. Cheap to update, safe to read concurrently.
pub struct StatusRecord {
    path: Option<PathBuf>,
    status: Mutex<Status>,
}

impl StatusRecord {
    /// In-memory only.
    pub fn new() -> Self {
        Self {
            path: None,
            status: Mutex::new(Status::default()),
        }
    }

    /// Persist every update to `path` as JSON.
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            status: Mutex::new(Status::default()),
        }
    }

    pub fn snapshot(&self) -> Status {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Write the initial (inactive) status.
    pub fn init(&self) {
        self.update(|_| {});
    }

    pub fn set_connecting(&self, req: &SessionNewRequest, attempts: u32) {
        self.update(|s| {
            s.state = ConnectorState::Connecting;
            s.session_new_request = Some(req.clone());
            s.session_new_response = None;
            s.error = None;
            s.reconnect_attempts = attempts;
        });
    }

    pub fn set_active(&self, req: &SessionNewRequest, res: &SessionNewResponse) {
        self.update(|s| {
            s.state = ConnectorState::Active;
            s.session_new_request = Some(req.clone());
            s.session_new_response = Some(res.clone());
            s.error = None;
            s.reconnect_attempts = 0;
        });
    }

    /// Record a failed attempt; the connector is about to back off.
    pub fn set_retrying(&self, error: &str, attempts: u32) {
        self.update(|s| {
            s.state = ConnectorState::Inactive;
            s.session_new_response = None;
            s.error = Some(error.to_string());
            s.reconnect_attempts = attempts;
        });
    }

    /// Clean stop: the last error, if any, is kept for inspection.
    pub fn set_inactive(&self) {
        self.update(|s| {
            s.state = ConnectorState::Inactive;
            s.session_new_request = None;
            s.session_new_response = None;
        });
    }

    pub fn set_given_up(&self, error: &str, attempts: u32) {
        self.update(|s| {
            s.state = ConnectorState::GivenUp;
            s.session_new_request = None;
            s.session_new_response = None;
            s.error = Some(error.to_string());
            s.reconnect_attempts = attempts;
        });
    }

    fn update(&self, f: impl FnOnce(&mut Status)) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut status);
        if let Some(ref path) = self.path {
            if let Err(e) = save(path, &status) {
                warn!(path = %path.display(), "Failed to write status file: {e}");
            }
        }
    }
}

impl Default for StatusRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Write to a sibling temp file, then rename over the target, so readers
/// never see a partial file.
fn save(path: &Path, status: &Status) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(status)?;
    let file_name = path
        .file_name()
        .map_or_else(|| "status".into(), |n| n.to_string_lossy().into_owned());
    let temp_path = path.with_file_name(format!(".{file_name}.tmp{}", std::process::id()));
    std::fs::write(&temp_path, json)?;
    std::fs::rename(&temp_path, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&temp_path);
    })
}

/// Read a persisted status file. A missing file reads as the initial status.
pub fn read_status_file(path: &Path) -> std::io::Result<Status> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(std::io::Error::other),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Status::default()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_inactive_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let record = StatusRecord::with_file(&path);
        record.init();

        let status = read_status_file(&path).unwrap();
        assert_eq!(status.state, ConnectorState::Inactive);
        assert!(status.error.is_none());
    }

    #[test]
    fn transitions_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let record = StatusRecord::with_file(&path);
        let req = SessionNewRequest {
            actions: vec!["echo".into()],
            spec: String::new(),
        };

        record.set_connecting(&req, 2);
        let status = read_status_file(&path).unwrap();
        assert_eq!(status.state, ConnectorState::Connecting);
        assert_eq!(status.reconnect_attempts, 2);
        assert_eq!(status.session_new_request.unwrap().actions, vec!["echo"]);

        let res = SessionNewResponse {
            url: "ws://gw/api/session/connect/a/b".into(),
        };
        record.set_active(&req, &res);
        let status = read_status_file(&path).unwrap();
        assert_eq!(status.state, ConnectorState::Active);
        assert_eq!(status.reconnect_attempts, 0);
        assert_eq!(status.session_new_response.unwrap(), res);
    }

    #[test]
    fn stopping_clears_session_but_keeps_last_error() {
        let record = StatusRecord::new();
        let req = SessionNewRequest::default();
        let res = SessionNewResponse {
            url: "ws://gw/api/session/connect/c/s".to_string(),
        };
        record.set_retrying("connection refused", 1);
        record.set_active(&req, &res);
        record.set_retrying("server disconnected", 1);
        record.set_inactive();

        let status = record.snapshot();
        assert_eq!(status.state, ConnectorState::Inactive);
        assert!(status.session_new_request.is_none());
        assert!(status.session_new_response.is_none());
        assert_eq!(status.error.as_deref(), Some("server disconnected"));
    }

    #[test]
    fn given_up_keeps_error() {
        let record = StatusRecord::new();
        record.set_given_up("connection refused", 10);
        let status = record.snapshot();
        assert_eq!(status.state, ConnectorState::GivenUp);
        assert_eq!(status.error.as_deref(), Some("connection refused"));
        assert_eq!(status.reconnect_attempts, 10);
    }

    #[test]
    fn missing_file_reads_as_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let status = read_status_file(&dir.path().join("nope.json")).unwrap();
        assert_eq!(status.state, ConnectorState::Inactive);
    }
}
