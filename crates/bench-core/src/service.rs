//! The driver-facing service abstraction.
//!
//! Instrument drivers are opaque to this layer: a `Service` exposes a
//! `connect`/`close` lifecycle and dynamic method dispatch over JSON
//! values. Implementations are registered by name in a [`ServiceFactory`]
//! and constructed from descriptor parameters.
//!
//! Every constructed instance carries a process-unique `instance_id`,
//! which is what clients observe through the built-in `whoami` method and
//! what the lifecycle-policy tests assert on.

use crate::error::ServiceError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Process-wide instance id counter.
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Mints the next instance id. Called once per constructed instance.
pub fn next_instance_id() -> u64 {
    NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A remotely callable handler object wrapping one instrument driver.
///
/// Implementations must be `Send + Sync`: depending on policy a single
/// instance may be shared across connections and tasks.
pub trait Service: Send + Sync {
    /// Identity of this concrete instance, unique within the process.
    fn instance_id(&self) -> u64;

    /// Brings the underlying driver up. Called once after construction;
    /// a failure here counts as a construction failure.
    fn connect(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Releases the underlying driver. Best-effort, never fails.
    fn close(&self) {}

    /// Invokes a named method with JSON arguments.
    ///
    /// Driver errors are returned, never panicked, so the host can hand
    /// them back to the one caller that triggered them.
    fn call(&self, method: &str, args: &Value) -> Result<Value, ServiceError>;
}

impl std::fmt::Debug for dyn Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("instance_id", &self.instance_id())
            .finish()
    }
}

/// Constructor signature for registered implementations.
pub type Constructor =
    Arc<dyn Fn(&Value) -> Result<Arc<dyn Service>, ServiceError> + Send + Sync>;

/// Registry mapping implementation names to constructors.
///
/// Populated once at startup; resolving an unknown name is a bootstrap
/// configuration error, never retried.
#[derive(Clone, Default)]
pub struct ServiceFactory {
    constructors: HashMap<String, Constructor>,
}

impl ServiceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a factory with the built-in implementations registered.
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        factory.register("echo", |params| {
            Ok(Arc::new(EchoService::new(params.clone())) as Arc<dyn Service>)
        });
        factory.register("sim-instrument", |params| {
            SimInstrument::from_params(params)
                .map(|s| Arc::new(s) as Arc<dyn Service>)
        });
        factory
    }

    /// Registers a constructor under an implementation name.
    pub fn register<F>(&mut self, name: impl Into<String>, construct: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Service>, ServiceError> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(construct));
    }

    /// Constructs a fresh instance of the named implementation.
    pub fn construct(
        &self,
        implementation: &str,
        params: &Value,
    ) -> Result<Arc<dyn Service>, ServiceError> {
        let constructor = self.constructors.get(implementation).ok_or_else(|| {
            ServiceError::UnknownImplementation {
                name: implementation.to_string(),
            }
        })?;
        constructor(params)
    }

    /// Checks whether an implementation name is registered.
    pub fn contains(&self, implementation: &str) -> bool {
        self.constructors.contains_key(implementation)
    }
}

// ============================================================================
// Built-in implementations
// ============================================================================

/// Echo service: returns its arguments. Used by tests and smoke checks.
pub struct EchoService {
    id: u64,
    params: Value,
}

impl EchoService {
    pub fn new(params: Value) -> Self {
        Self {
            id: next_instance_id(),
            params,
        }
    }
}

impl Service for EchoService {
    fn instance_id(&self) -> u64 {
        self.id
    }

    fn call(&self, method: &str, args: &Value) -> Result<Value, ServiceError> {
        match method {
            "echo" => Ok(args.clone()),
            "params" => Ok(self.params.clone()),
            other => Err(ServiceError::NoSuchMethod {
                method: other.to_string(),
            }),
        }
    }
}

/// Simulated instrument with settable/readable named parameters.
///
/// Stands in for real drivers (lasers, cameras, stages) which are out of
/// scope. Parameters given at construction seed the value table.
#[derive(Debug)]
pub struct SimInstrument {
    id: u64,
    values: Mutex<HashMap<String, Value>>,
}

impl SimInstrument {
    pub fn from_params(params: &Value) -> Result<Self, ServiceError> {
        let values = match params {
            Value::Null => HashMap::new(),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            other => {
                return Err(ServiceError::Construct {
                    implementation: "sim-instrument".to_string(),
                    reason: format!("expected object params, got {other}"),
                })
            }
        };
        Ok(Self {
            id: next_instance_id(),
            values: Mutex::new(values),
        })
    }

    fn with_values<T>(&self, f: impl FnOnce(&mut HashMap<String, Value>) -> T) -> T {
        match self.values.lock() {
            Ok(mut guard) => f(&mut guard),
            // A poisoned mutex means a panic elsewhere; recover the data.
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl Service for SimInstrument {
    fn instance_id(&self) -> u64 {
        self.id
    }

    fn call(&self, method: &str, args: &Value) -> Result<Value, ServiceError> {
        match method {
            "get" => {
                let key = args
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ServiceError::BadArgs {
                        method: "get".to_string(),
                        reason: "missing string field: key".to_string(),
                    })?;
                Ok(self
                    .with_values(|v| v.get(key).cloned())
                    .unwrap_or(Value::Null))
            }
            "set" => {
                let key = args
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ServiceError::BadArgs {
                        method: "set".to_string(),
                        reason: "missing string field: key".to_string(),
                    })?;
                let value = args.get("value").cloned().unwrap_or(Value::Null);
                self.with_values(|v| v.insert(key.to_string(), value));
                Ok(Value::Null)
            }
            "keys" => Ok(Value::Array(
                self.with_values(|v| v.keys().cloned().map(Value::String).collect()),
            )),
            other => Err(ServiceError::NoSuchMethod {
                method: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_instance_ids_are_unique() {
        let a = EchoService::new(Value::Null);
        let b = EchoService::new(Value::Null);
        assert_ne!(a.instance_id(), b.instance_id());
    }

    #[test]
    fn test_echo_returns_args() {
        let svc = EchoService::new(Value::Null);
        let args = json!({"hello": "world"});
        assert_eq!(svc.call("echo", &args).unwrap(), args);
    }

    #[test]
    fn test_echo_unknown_method() {
        let svc = EchoService::new(Value::Null);
        let err = svc.call("fire", &Value::Null).unwrap_err();
        assert!(matches!(err, ServiceError::NoSuchMethod { .. }));
    }

    #[test]
    fn test_sim_instrument_get_set() {
        let svc = SimInstrument::from_params(&json!({"wavelength_nm": 780})).unwrap();

        let got = svc.call("get", &json!({"key": "wavelength_nm"})).unwrap();
        assert_eq!(got, json!(780));

        svc.call("set", &json!({"key": "power_mw", "value": 12.5}))
            .unwrap();
        let got = svc.call("get", &json!({"key": "power_mw"})).unwrap();
        assert_eq!(got, json!(12.5));
    }

    #[test]
    fn test_sim_instrument_rejects_non_object_params() {
        let err = SimInstrument::from_params(&json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, ServiceError::Construct { .. }));
    }

    #[test]
    fn test_sim_instrument_bad_args() {
        let svc = SimInstrument::from_params(&Value::Null).unwrap();
        let err = svc.call("get", &json!({})).unwrap_err();
        assert!(matches!(err, ServiceError::BadArgs { .. }));
    }

    #[test]
    fn test_factory_constructs_builtins() {
        let factory = ServiceFactory::with_builtins();
        assert!(factory.contains("echo"));
        assert!(factory.contains("sim-instrument"));

        let svc = factory.construct("echo", &Value::Null).unwrap();
        assert!(svc.instance_id() > 0);
    }

    #[test]
    fn test_factory_unknown_implementation() {
        let factory = ServiceFactory::with_builtins();
        let err = factory.construct("warp-drive", &Value::Null).unwrap_err();
        assert!(matches!(err, ServiceError::UnknownImplementation { .. }));
    }

    #[test]
    fn test_factory_constructor_failure_propagates() {
        let factory = ServiceFactory::with_builtins();
        let err = factory
            .construct("sim-instrument", &json!("not-an-object"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Construct { .. }));
    }

    #[test]
    fn test_custom_registration() {
        let mut factory = ServiceFactory::new();
        factory.register("null", |_| {
            Ok(Arc::new(EchoService::new(Value::Null)) as Arc<dyn Service>)
        });
        assert!(factory.contains("null"));
        assert!(!factory.contains("echo"));
    }
}
