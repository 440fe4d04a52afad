//! Request/response types for the host RPC and nameserver channels.

use serde::{Deserialize, Serialize};

// ============================================================================
// Host RPC channel
// ============================================================================

/// Requests a client can send to a host process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostRequest {
    /// Invoke a method on a registered object
    Call {
        /// Published object name
        object: String,
        /// Method name; `whoami` is answered by the host itself
        method: String,
        /// JSON arguments, passed through to the driver
        #[serde(default)]
        args: serde_json::Value,
    },

    /// Acquire the exclusive lock on an object
    Lock {
        object: String,
        /// Free-form label identifying the operator, for diagnostics
        #[serde(default)]
        user: String,
    },

    /// Release the exclusive lock on an object
    Release { object: String },

    /// Operator force-unlock, bypassing ownership
    ForceRelease { object: String },

    /// Query lock state of an object
    IsLocked { object: String },

    /// Liveness probe
    Ping { seq: u64 },
}

/// Error kinds a host can return, as narrow values rather than strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorKind {
    /// Object is locked by a different connection
    LockConflict,
    /// No object registered under this name
    NoSuchObject,
    /// Object exposes no such method
    NoSuchMethod,
    /// Request was malformed or arguments invalid
    BadRequest,
    /// The driver failed mid-call
    Service,
    /// Release attempted by a connection that does not hold the lock
    NotHolder,
}

/// Responses a host sends back to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostResponse {
    /// Successful call result
    Result { value: serde_json::Value },

    /// Lock request outcome; `acquired` is also true when the object was
    /// already locked (idempotent lock semantics)
    Locked { acquired: bool },

    /// Release outcome
    Released,

    /// Lock state of an object
    LockStatus {
        locked: bool,
        /// Holder's user label when locked
        #[serde(skip_serializing_if = "Option::is_none")]
        holder: Option<String>,
    },

    /// Liveness probe answer
    Pong { seq: u64 },

    /// Any failure, attributable via `kind`
    Error {
        kind: WireErrorKind,
        message: String,
        /// Holder's user label for lock conflicts
        #[serde(skip_serializing_if = "Option::is_none")]
        holder: Option<String>,
    },
}

impl HostResponse {
    pub fn result(value: serde_json::Value) -> Self {
        Self::Result { value }
    }

    pub fn error(kind: WireErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
            holder: None,
        }
    }

    pub fn lock_conflict(holder: impl Into<String>) -> Self {
        let holder = holder.into();
        Self::Error {
            kind: WireErrorKind::LockConflict,
            message: format!("object is locked by {holder}"),
            holder: Some(holder),
        }
    }
}

// ============================================================================
// Nameserver channel
// ============================================================================

/// Requests understood by a nameserver process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NsRequest {
    /// Bind a name to an address. Rebinding an existing name overwrites
    /// it; a relaunched host re-publishes under the same names.
    Register { name: String, address: String },

    /// Remove a binding
    Unregister { name: String },

    /// Resolve a name
    Lookup { name: String },

    /// List all bindings
    List,

    /// Liveness probe
    Ping { seq: u64 },
}

/// Nameserver error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NsErrorKind {
    /// The name is not currently bound (stale registration)
    NotBound,
    /// Request was malformed
    BadRequest,
}

/// Nameserver responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NsResponse {
    /// Register/Unregister succeeded
    Ok,

    /// Lookup result
    Address { address: String },

    /// Full binding table
    Bindings { entries: Vec<(String, String)> },

    /// Liveness probe answer
    Pong { seq: u64 },

    /// Failure, attributable via `kind`
    Error { kind: NsErrorKind, message: String },
}

impl NsResponse {
    pub fn not_bound(name: &str) -> Self {
        Self::Error {
            kind: NsErrorKind::NotBound,
            message: format!("name not bound: {name}"),
        }
    }
}
