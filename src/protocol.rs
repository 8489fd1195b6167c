//! Wire types shared by the gateway and the client connector.
//!
//! Everything here is JSON-encoded. [`ActionMessage`] travels gateway → client
//! over the tunnel; [`ActionResult`] travels client → gateway as the body of a
//! separate `POST /api/notify` request, never over the tunnel itself.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A request envelope pushed to the client over the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMessage {
    /// Correlation id (UUIDv7, so ids sort by creation time).
    pub id: String,
    /// Declared action name.
    pub name: String,
    /// Opaque request payload, fed to the action's stdin.
    pub body: String,
}

impl ActionMessage {
    /// Build a message with a freshly generated correlation id.
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            name: name.into(),
            body: body.into(),
        }
    }
}

/// Outcome of an action as reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Success,
    Error,
}

/// A reply envelope posted back to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Same id as the [`ActionMessage`] this answers.
    pub id: String,
    pub status: ActionStatus,
    /// Captured stdout of the action (may be empty).
    #[serde(default)]
    pub body: String,
}

impl ActionResult {
    pub fn success(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ActionStatus::Success,
            body: body.into(),
        }
    }

    pub fn error(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ActionStatus::Error,
            body: body.into(),
        }
    }
}

/// Body of `POST /api/session/new`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNewRequest {
    /// Names of the actions the client can run.
    #[serde(default)]
    pub actions: Vec<String>,
    /// Capability document (OpenAPI YAML), passed through untouched.
    #[serde(default)]
    pub spec: String,
}

/// Response of `POST /api/session/new`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNewResponse {
    /// Tunnel URL scoped to this client and session.
    pub url: String,
}

/// Response of `POST /api/new-token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTokenResponse {
    pub token: String,
}

/// Error body returned by JSON endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_status_is_lowercase_on_the_wire() {
        let result = ActionResult::error("abc", "boom");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["body"], "boom");
    }

    #[test]
    fn result_without_body_defaults_to_empty() {
        let result: ActionResult =
            serde_json::from_str(r#"{"id":"abc","status":"success"}"#).unwrap();
        assert_eq!(result.status, ActionStatus::Success);
        assert!(result.body.is_empty());
    }

    #[test]
    fn session_new_request_tolerates_missing_fields() {
        let req: SessionNewRequest = serde_json::from_str("{}").unwrap();
        assert!(req.actions.is_empty());
        assert!(req.spec.is_empty());
    }

    #[test]
    fn message_ids_are_unique() {
        let a = ActionMessage::new("echo", "");
        let b = ActionMessage::new("echo", "");
        assert_ne!(a.id, b.id);
    }
}
