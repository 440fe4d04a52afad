//! Handler instancing under the three lifecycle policies.
//!
//! Given a service descriptor and the calling connection, the dispatcher
//! returns the concrete instance that should handle the current call:
//! - `single`: one instance per descriptor for the host's lifetime,
//!   created lazily on first resolution
//! - `session`: one instance per (descriptor, connection), removed when
//!   the connection closes
//! - `per_call`: a fresh instance for every call, discarded afterwards
//!
//! Session maps are process-local; a restarted host starts with a clean
//! table, like the lock manager.

use bench_core::{ConnId, Lifecycle, Service, ServiceDescriptor, ServiceError, ServiceFactory};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Default)]
struct DispatchState {
    /// Lazily constructed `single` instances, keyed by service name
    singles: HashMap<String, Arc<dyn Service>>,

    /// `session` instances, keyed by (service name, connection)
    sessions: HashMap<(String, ConnId), Arc<dyn Service>>,
}

/// Per-host-process instance dispatcher.
///
/// One mutex guards both tables, so concurrent first-calls on a `single`
/// service under a multi-tasked transport cannot double-construct.
pub struct InstanceDispatcher {
    factory: ServiceFactory,
    descriptors: HashMap<String, ServiceDescriptor>,
    state: Mutex<DispatchState>,
}

impl std::fmt::Debug for InstanceDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceDispatcher").finish_non_exhaustive()
    }
}

impl InstanceDispatcher {
    /// Builds a dispatcher for the given descriptors.
    ///
    /// Every descriptor's implementation must be registered in the
    /// factory; an unknown implementation is a configuration error,
    /// fatal to host bootstrap and never retried.
    pub fn new(
        factory: ServiceFactory,
        descriptors: Vec<ServiceDescriptor>,
    ) -> Result<Self, ServiceError> {
        for descriptor in &descriptors {
            if !factory.contains(&descriptor.implementation) {
                return Err(ServiceError::UnknownImplementation {
                    name: descriptor.implementation.clone(),
                });
            }
        }
        Ok(Self {
            factory,
            descriptors: descriptors
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
            state: Mutex::new(DispatchState::default()),
        })
    }

    /// Looks up a descriptor by published name.
    pub fn descriptor(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.descriptors.get(name)
    }

    /// All descriptors this dispatcher serves.
    pub fn descriptors(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.descriptors.values()
    }

    /// Resolves the handler instance for the current call.
    ///
    /// Construction failures propagate to the caller; for `single` the
    /// failed instance is not cached, so the next call retries.
    pub async fn resolve(
        &self,
        name: &str,
        conn: ConnId,
    ) -> Result<Arc<dyn Service>, ServiceError> {
        let descriptor = self
            .descriptors
            .get(name)
            .ok_or_else(|| ServiceError::UnknownImplementation {
                name: name.to_string(),
            })?;

        match descriptor.lifecycle {
            Lifecycle::PerCall => {
                // Fresh instance per call; no shared state, no caching.
                let instance = self.construct(descriptor)?;
                debug!(service = %name, instance = instance.instance_id(), "Per-call instance");
                Ok(instance)
            }
            Lifecycle::Session => {
                let key = (name.to_string(), conn);
                let mut state = self.state.lock().await;
                if let Some(existing) = state.sessions.get(&key) {
                    return Ok(Arc::clone(existing));
                }
                let instance = self.construct(descriptor)?;
                info!(
                    service = %name,
                    conn = %conn,
                    instance = instance.instance_id(),
                    "Session instance created"
                );
                state.sessions.insert(key, Arc::clone(&instance));
                Ok(instance)
            }
            Lifecycle::Single => {
                // Construction happens under the mutex: two concurrent
                // first-calls must not produce two instances.
                let mut state = self.state.lock().await;
                if let Some(existing) = state.singles.get(name) {
                    return Ok(Arc::clone(existing));
                }
                let instance = self.construct(descriptor)?;
                info!(
                    service = %name,
                    instance = instance.instance_id(),
                    "Single instance created"
                );
                state.singles.insert(name.to_string(), Arc::clone(&instance));
                Ok(instance)
            }
        }
    }

    /// Constructs and connects one instance.
    ///
    /// A `connect()` failure counts as a construction failure: the
    /// instance is closed and dropped, never handed out or cached.
    fn construct(&self, descriptor: &ServiceDescriptor) -> Result<Arc<dyn Service>, ServiceError> {
        let instance = self
            .factory
            .construct(&descriptor.implementation, &descriptor.params)?;
        if let Err(err) = instance.connect() {
            instance.close();
            return Err(err);
        }
        Ok(instance)
    }

    /// Disconnect notification: removes and closes this connection's
    /// session instances. `single` instances are unaffected.
    pub async fn on_disconnect(&self, conn: ConnId) {
        let mut state = self.state.lock().await;
        let stale: Vec<(String, ConnId)> = state
            .sessions
            .keys()
            .filter(|(_, owner)| *owner == conn)
            .cloned()
            .collect();
        for key in stale {
            if let Some(instance) = state.sessions.remove(&key) {
                debug!(
                    service = %key.0,
                    conn = %conn,
                    instance = instance.instance_id(),
                    "Session instance closed on disconnect"
                );
                instance.close();
            }
        }
    }

    /// Host teardown: closes every remaining instance.
    ///
    /// Covers `single` instances and any sessions whose connection is
    /// still open when the host stops; per-call instances are closed at
    /// the end of their one call and never reach this point.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for ((service, conn), instance) in state.sessions.drain() {
            debug!(
                service = %service,
                conn = %conn,
                instance = instance.instance_id(),
                "Session instance closed at shutdown"
            );
            instance.close();
        }
        for (service, instance) in state.singles.drain() {
            debug!(
                service = %service,
                instance = instance.instance_id(),
                "Single instance closed at shutdown"
            );
            instance.close();
        }
    }

    /// Number of live session instances (for tests and status).
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }
}
