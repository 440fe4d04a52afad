//! Deployment configuration.
//!
//! One TOML file describes the whole deployment: where sockets live, the
//! supervisor polling interval, the nameservers, and the hosts with their
//! service descriptors. Loaded once at startup and validated eagerly;
//! everything here is immutable afterwards (a reload re-reads the file
//! from scratch).

use crate::descriptor::ServiceDescriptor;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default supervisor polling interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/tmp/benchd")
}

/// One nameserver process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameserverConfig {
    pub name: String,
}

/// One host process and the services it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,

    /// Nameservers this host publishes to (unless a service overrides).
    #[serde(default)]
    pub nameservers: Vec<String>,

    #[serde(default, rename = "service")]
    pub services: Vec<ServiceDescriptor>,
}

/// Whole-deployment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory where host and nameserver sockets are created
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// Operator control socket of the main process
    #[serde(default)]
    pub control_socket: Option<PathBuf>,

    /// Supervisor checkup interval; also the base unit for launch and
    /// shutdown acknowledgement windows
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default, rename = "nameserver")]
    pub nameservers: Vec<NameserverConfig>,

    #[serde(default, rename = "host")]
    pub hosts: Vec<HostConfig>,
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&text)
    }

    /// Parses and validates configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-references and uniqueness.
    ///
    /// All failures are fatal at bootstrap: a deployment with a dangling
    /// nameserver reference or ambiguous names must not come up.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut entity_names = HashSet::new();
        for ns in &self.nameservers {
            if !entity_names.insert(ns.name.as_str()) {
                return Err(ConfigError::DuplicateEntity {
                    name: ns.name.clone(),
                });
            }
        }
        for host in &self.hosts {
            if !entity_names.insert(host.name.as_str()) {
                return Err(ConfigError::DuplicateEntity {
                    name: host.name.clone(),
                });
            }
        }

        let ns_names: HashSet<&str> = self.nameservers.iter().map(|n| n.name.as_str()).collect();
        let mut service_names = HashSet::new();
        for host in &self.hosts {
            for ns in &host.nameservers {
                if !ns_names.contains(ns.as_str()) {
                    return Err(ConfigError::UnknownNameserver {
                        host: host.name.clone(),
                        nameserver: ns.clone(),
                    });
                }
            }
            for service in &host.services {
                if !service_names.insert(service.name.as_str()) {
                    return Err(ConfigError::DuplicateService {
                        name: service.name.clone(),
                    });
                }
                if let Some(targets) = &service.nameservers {
                    for ns in targets {
                        if !ns_names.contains(ns.as_str()) {
                            return Err(ConfigError::UnknownNameserver {
                                host: host.name.clone(),
                                nameserver: ns.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Looks up a host by name.
    pub fn host(&self, name: &str) -> Result<&HostConfig, ConfigError> {
        self.hosts
            .iter()
            .find(|h| h.name == name)
            .ok_or(ConfigError::UnknownEntity {
                kind: "host",
                name: name.to_string(),
            })
    }

    /// Looks up a nameserver by name.
    pub fn nameserver(&self, name: &str) -> Result<&NameserverConfig, ConfigError> {
        self.nameservers
            .iter()
            .find(|n| n.name == name)
            .ok_or(ConfigError::UnknownEntity {
                kind: "nameserver",
                name: name.to_string(),
            })
    }

    /// Socket path for a nameserver process.
    pub fn nameserver_socket(&self, name: &str) -> PathBuf {
        self.socket_dir.join(format!("{name}.sock"))
    }

    /// Socket path for a host process.
    pub fn host_socket(&self, name: &str) -> PathBuf {
        self.socket_dir.join(format!("host-{name}.sock"))
    }

    /// Operator control socket path.
    pub fn control_socket(&self) -> PathBuf {
        self.control_socket
            .clone()
            .unwrap_or_else(|| self.socket_dir.join("control.sock"))
    }

    /// Published address of a service on a host: `<socket>#<service>`.
    pub fn service_address(&self, host: &str, service: &str) -> String {
        format!("{}#{service}", self.host_socket(host).display())
    }

    /// Nameserver names a service on the given host publishes to.
    pub fn targets_for<'a>(
        &self,
        host: &'a HostConfig,
        service: &'a ServiceDescriptor,
    ) -> &'a [String] {
        service
            .nameservers
            .as_deref()
            .unwrap_or(&host.nameservers)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }
}

/// Splits a published service address into socket path and object name.
///
/// Returns `None` when the `#` separator is missing.
pub fn split_address(address: &str) -> Option<(PathBuf, &str)> {
    let (path, object) = address.rsplit_once('#')?;
    if path.is_empty() || object.is_empty() {
        return None;
    }
    Some((PathBuf::from(path), object))
}
