//! Operator control protocol.
//!
//! The operator CLI talks to the running main process over the control
//! socket. One request, one response, connection closed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of supervised entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Nameserver,
    Daemon,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nameserver => write!(f, "nameserver"),
            Self::Daemon => write!(f, "daemon"),
        }
    }
}

/// Operator-visible status of one supervised entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityStatus {
    pub name: String,
    pub kind: EntityKind,
    pub pid: u32,
    pub alive: bool,
    pub started_at: DateTime<Utc>,
}

/// Requests from the operator CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CtlRequest {
    /// Launch one entity by name
    Start { kind: EntityKind, name: String },

    /// Gracefully stop one entity by name
    Stop { name: String },

    /// Reload configuration, restarting the currently running set
    Reload,

    /// List supervised entities
    Status,

    /// Drain everything: daemons first, then nameservers
    ShutdownAll,
}

/// Responses from the main process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CtlResponse {
    Ok,
    Status { entries: Vec<EntityStatus> },
    Error { message: String },
}

impl CtlResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ctl_roundtrip() {
        let req = CtlRequest::Start {
            kind: EntityKind::Daemon,
            name: "optics".to_string(),
        };
        let line = serde_json::to_string(&req).unwrap();
        assert!(line.contains("\"kind\":\"daemon\""));
        let back: CtlRequest = serde_json::from_str(&line).unwrap();
        assert!(matches!(back, CtlRequest::Start { .. }));
    }

    #[test]
    fn test_status_roundtrip() {
        let resp = CtlResponse::Status {
            entries: vec![EntityStatus {
                name: "ns-main".to_string(),
                kind: EntityKind::Nameserver,
                pid: 4242,
                alive: true,
                started_at: Utc::now(),
            }],
        };
        let line = serde_json::to_string(&resp).unwrap();
        let back: CtlResponse = serde_json::from_str(&line).unwrap();
        match back {
            CtlResponse::Status { entries } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].pid, 4242);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_entity_kind_display() {
        assert_eq!(EntityKind::Nameserver.to_string(), "nameserver");
        assert_eq!(EntityKind::Daemon.to_string(), "daemon");
    }
}
