//! Host process: serves one configured set of instrument services.
//!
//! Lifecycle: build the dispatcher, bind the host socket, publish every
//! service address to its target nameservers, emit `Ready`, then accept
//! client connections until cancelled. Teardown drains the connection
//! handlers (in-flight calls complete first), unpublishes best-effort,
//! closes the remaining instances, and emits `Done`.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

mod connection;

pub use connection::{ConnectionError, ConnectionHandler};

use crate::dispatch::InstanceDispatcher;
use crate::lock::LockManager;
use crate::nameserver::{bind_unix_socket, NameserverError, NsClient};
use bench_core::{Config, ConnIdSource, ServiceError, ServiceFactory};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors fatal to host bootstrap.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] bench_core::ConfigError),

    /// A descriptor references an unregistered implementation
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    /// Publishing a service address to a nameserver failed
    #[error("failed to publish {service} to nameserver {nameserver}: {error}")]
    Publish {
        service: String,
        nameserver: String,
        error: NameserverError,
    },
}

/// One published binding: (service name, nameserver name, address).
type Binding = (String, String, String);

/// One host process.
pub struct HostProcess {
    name: String,
    config: Config,
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    locks: Arc<LockManager>,
    dispatcher: Arc<InstanceDispatcher>,
    conn_ids: ConnIdSource,
    /// Bindings published at bootstrap, for teardown unpublish
    bindings: Vec<Binding>,
}

impl HostProcess {
    /// Builds a host for the named entry in the configuration.
    ///
    /// Descriptor validation happens here: an unknown implementation
    /// fails bootstrap before any socket is bound.
    pub fn new(
        config: Config,
        name: impl Into<String>,
        factory: ServiceFactory,
        cancel_token: CancellationToken,
    ) -> Result<Self, HostError> {
        let name = name.into();
        let host_cfg = config.host(&name)?;

        let mut bindings = Vec::new();
        for service in &host_cfg.services {
            let address = config.service_address(&name, &service.name);
            for ns in config.targets_for(host_cfg, service) {
                bindings.push((service.name.clone(), ns.clone(), address.clone()));
            }
        }

        let dispatcher = InstanceDispatcher::new(factory, host_cfg.services.clone())?;

        Ok(Self {
            socket_path: config.host_socket(&name),
            name,
            config,
            cancel_token,
            locks: Arc::new(LockManager::new()),
            dispatcher: Arc::new(dispatcher),
            conn_ids: ConnIdSource::new(),
            bindings,
        })
    }

    /// Runs the host until cancelled.
    pub async fn run(&self) -> Result<(), HostError> {
        let listener =
            bind_unix_socket(&self.socket_path).map_err(|e| match e {
                NameserverError::SocketSetup { path, error } => {
                    HostError::SocketSetup { path, error }
                }
                other => HostError::SocketSetup {
                    path: self.socket_path.clone(),
                    error: other.to_string(),
                },
            })?;
        info!(
            host = %self.name,
            socket = %self.socket_path.display(),
            services = self.dispatcher.descriptors().count(),
            "Host listening"
        );

        // Publishing is part of bootstrap: a host whose services cannot
        // be found by clients is not ready. Any failure rolls back what
        // was already registered and aborts.
        if let Err(e) = self.publish_all().await {
            self.unpublish_all().await;
            let _ = std::fs::remove_file(&self.socket_path);
            return Err(e);
        }

        let addresses = self
            .bindings
            .iter()
            .map(|(service, _, address)| (service.clone(), address.clone()))
            .collect();
        crate::child::emit_ready(addresses).await;

        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!(host = %self.name, "Host shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn = self.conn_ids.next();
                            let (reader, writer) = stream.into_split();
                            let handler = ConnectionHandler::new(
                                reader,
                                writer,
                                conn,
                                Arc::clone(&self.locks),
                                Arc::clone(&self.dispatcher),
                                self.cancel_token.clone(),
                            );
                            handlers.spawn(handler.run());
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept host connection");
                        }
                    }
                }

                // Reap handlers of closed connections as we go.
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }

        // Drain: handlers observe the token between requests, so every
        // in-flight call completes and is answered before teardown.
        while handlers.join_next().await.is_some() {}

        self.unpublish_all().await;
        self.dispatcher.shutdown().await;
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove host socket"
                );
            }
        }
        info!(host = %self.name, "Host cleanup complete");
        crate::child::emit_done().await;
        Ok(())
    }

    /// Registers every (service, nameserver) pair. First failure aborts.
    async fn publish_all(&self) -> Result<(), HostError> {
        for (service, ns, address) in &self.bindings {
            let socket = self.config.nameserver_socket(ns);
            let result = async {
                let mut client = NsClient::connect(&socket).await?;
                client.register(service, address).await
            }
            .await;

            match result {
                Ok(()) => {
                    debug!(service = %service, nameserver = %ns, address = %address, "Published");
                }
                Err(error) => {
                    error!(
                        service = %service,
                        nameserver = %ns,
                        error = %error,
                        "Failed to publish service"
                    );
                    return Err(HostError::Publish {
                        service: service.clone(),
                        nameserver: ns.clone(),
                        error,
                    });
                }
            }
        }
        Ok(())
    }

    /// Best-effort unregistration of every published binding.
    ///
    /// A `NotBound` answer means the nameserver restarted since we
    /// published; that is logged and otherwise fine.
    async fn unpublish_all(&self) {
        for (service, ns, _) in &self.bindings {
            let socket = self.config.nameserver_socket(ns);
            let result = async {
                let mut client = NsClient::connect(&socket).await?;
                client.unregister(service).await
            }
            .await;

            match result {
                Ok(()) => debug!(service = %service, nameserver = %ns, "Unpublished"),
                Err(NameserverError::NotBound(_)) => {
                    warn!(service = %service, nameserver = %ns, "Binding already gone");
                }
                Err(e) => {
                    warn!(
                        service = %service,
                        nameserver = %ns,
                        error = %e,
                        "Failed to unpublish service"
                    );
                }
            }
        }
    }
}
