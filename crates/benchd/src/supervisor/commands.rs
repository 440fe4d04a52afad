//! Command and error types for the supervisor actor.

use bench_protocol::EntityKind;
use thiserror::Error;
use tokio::sync::oneshot;

/// Role of the current process within a deployment.
///
/// The supervisor owns child processes and must only exist in the main
/// process; a child that constructed its own supervisor would fork the
/// process tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// The supervising daemon
    Main,
    /// A spawned host or nameserver child
    Child,
}

/// Commands processed by the supervisor actor.
///
/// Each command that callers wait on carries a `respond_to` oneshot;
/// `Checkup` is fire-and-forget from the ticker task.
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Launch a configured entity and wait for its ready handshake
    Launch {
        kind: EntityKind,
        name: String,
        respond_to: oneshot::Sender<Result<(), SupervisorError>>,
    },

    /// Gracefully stop a running entity
    Stop {
        name: String,
        respond_to: oneshot::Sender<Result<(), SupervisorError>>,
    },

    /// Report every tracked entity
    Status {
        respond_to: oneshot::Sender<Vec<bench_protocol::EntityStatus>>,
    },

    /// Re-read configuration and relaunch the running set under it
    Reload {
        respond_to: oneshot::Sender<Result<(), SupervisorError>>,
    },

    /// Stop everything, daemons before nameservers
    ShutdownAll {
        respond_to: oneshot::Sender<()>,
    },

    /// Periodic reap-and-relaunch pass
    Checkup,
}

/// Errors from supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] bench_core::ConfigError),

    #[error("{kind} {name} is already running")]
    AlreadyRunning { kind: EntityKind, name: String },

    #[error("no running entity named {name}")]
    NotRunning { name: String },

    /// A daemon cannot come up before the nameservers it publishes to
    #[error("daemon {daemon} requires nameserver {nameserver}, which is not running")]
    NameserverNotRunning { daemon: String, nameserver: String },

    /// A nameserver cannot stop while a running daemon publishes to it
    #[error("nameserver {nameserver} is still used by daemon {daemon}")]
    StillInUse { nameserver: String, daemon: String },

    #[error("failed to spawn {name}: {reason}")]
    Spawn { name: String, reason: String },

    /// The child never acknowledged readiness within the launch window
    #[error("launch of {name} failed: {reason}")]
    LaunchFailed { name: String, reason: String },

    #[error("supervisor channel closed")]
    ChannelClosed,
}
