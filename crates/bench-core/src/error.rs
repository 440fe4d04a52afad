//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// Every variant is fatal at bootstrap: a process that cannot trust its
/// configuration must not come up half-configured.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Two entities (hosts or nameservers) share a name
    #[error("duplicate entity name: {name}")]
    DuplicateEntity { name: String },

    /// Two services share a name (service names are global, they are
    /// published to nameservers)
    #[error("duplicate service name: {name}")]
    DuplicateService { name: String },

    /// A host references a nameserver that is not configured
    #[error("host {host} references unknown nameserver {nameserver}")]
    UnknownNameserver { host: String, nameserver: String },

    /// A requested host or nameserver does not exist in the configuration
    #[error("unknown {kind}: {name}")]
    UnknownEntity { kind: &'static str, name: String },

    /// The supervisor was constructed outside the main process
    #[error("supervisor may only be constructed in the main process")]
    NotMainProcess,
}

/// Errors raised by service construction and invocation.
///
/// Expected conditions get their own variants; broad catch-alls are
/// reserved for genuinely opaque driver failures.
#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    /// No implementation registered under this name
    #[error("unknown implementation: {name}")]
    UnknownImplementation { name: String },

    /// The constructor rejected its parameters or failed to come up
    #[error("failed to construct {implementation}: {reason}")]
    Construct {
        implementation: String,
        reason: String,
    },

    /// The service exposes no such method
    #[error("no such method: {method}")]
    NoSuchMethod { method: String },

    /// Arguments did not match what the method expects
    #[error("bad arguments for {method}: {reason}")]
    BadArgs { method: String, reason: String },

    /// The underlying driver failed mid-call
    #[error("driver error: {0}")]
    Driver(String),
}
