//! Bench Core - Shared domain types for benchd
//!
//! This crate provides the types shared between the daemon crate and the
//! wire protocol: connection identities, service descriptors and lifecycle
//! policies, the driver-facing `Service` trait, and configuration loading.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod conn;
pub mod descriptor;
pub mod error;
pub mod service;

// Re-exports for convenience
pub use config::{split_address, Config, HostConfig, NameserverConfig};
pub use conn::{ConnId, ConnIdSource};
pub use descriptor::{Lifecycle, ServiceDescriptor};
pub use error::{ConfigError, ServiceError};
pub use service::{Service, ServiceFactory};
