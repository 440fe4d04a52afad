//! Connection identity.
//!
//! A `ConnId` is the opaque token identifying one client session on a host
//! process. It is the unit of lock ownership and session-instance binding.
//! Identities are minted from a monotonically increasing per-process
//! counter and are never reused within a host's lifetime, so a disconnect
//! notification can never race against a new session wearing the same
//! identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque, comparable identity of one client connection.
///
/// Supplied by the host's accept loop; never crosses a process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(u64);

impl ConnId {
    /// Creates a connection identity from a raw counter value.
    ///
    /// Prefer [`ConnIdSource::next`] outside of tests.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw counter value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Mints unique connection identities for one host process.
#[derive(Debug, Default)]
pub struct ConnIdSource {
    counter: AtomicU64,
}

impl ConnIdSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next identity. Never returns the same value twice.
    pub fn next(&self) -> ConnId {
        ConnId(self.counter.fetch_add(1, Ordering::Relaxed))
    }
}
