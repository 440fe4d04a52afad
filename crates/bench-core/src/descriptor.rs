//! Service descriptors and lifecycle policies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Handler lifecycle policy for a service.
///
/// Governs how many handler instances exist and how long they live:
/// - `Single`: one instance for the lifetime of the host process
/// - `Session`: one instance per client connection
/// - `PerCall`: a fresh instance for every call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Single,
    Session,
    PerCall,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::Session
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Single => "single",
            Self::Session => "session",
            Self::PerCall => "per_call",
        };
        write!(f, "{s}")
    }
}

/// Configuration record describing one remotely callable service.
///
/// Immutable once loaded; read by host bootstrap only. The `lockable`
/// flag opts the service into exclusive-access control: guarded calls on
/// a lockable service are rejected while another connection holds its
/// lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Published name, globally unique across the deployment
    pub name: String,

    /// Implementation name looked up in the service factory
    pub implementation: String,

    /// Constructor parameters, passed through opaquely
    #[serde(default)]
    pub params: serde_json::Value,

    /// Handler lifecycle policy
    #[serde(default)]
    pub lifecycle: Lifecycle,

    /// Whether this service participates in exclusive locking
    #[serde(default)]
    pub lockable: bool,

    /// Target nameservers for this service's binding. When absent the
    /// owning host's nameserver list applies.
    #[serde(default)]
    pub nameservers: Option<Vec<String>>,
}

impl ServiceDescriptor {
    /// Creates a descriptor with default policy (session) and no params.
    ///
    /// Mostly useful in tests; production descriptors come from config.
    pub fn new(name: impl Into<String>, implementation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            implementation: implementation.into(),
            params: serde_json::Value::Null,
            lifecycle: Lifecycle::default(),
            lockable: false,
            nameservers: None,
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_lockable(mut self, lockable: bool) -> Self {
        self.lockable = lockable;
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}
