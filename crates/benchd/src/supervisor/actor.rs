//! Supervisor actor - owns all child processes and processes commands.
//!
//! The actor is the single owner of process state: every host and
//! nameserver child, its stdio control channel, and the set of entities
//! that should currently be running. Commands arrive via an mpsc channel
//! and are processed sequentially, so there are no launch/stop races.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are logged but don't panic

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bench_core::{Config, HostConfig};
use bench_protocol::{ControlEvent, ControlRequest, EntityKind, EntityStatus};

use super::commands::{SupervisorCommand, SupervisorError};

/// Launch acknowledgement window, in polling intervals.
pub const LAUNCH_ACK_TICKS: u32 = 10;

/// Shutdown acknowledgement window, in polling intervals.
pub const SHUTDOWN_ACK_TICKS: u32 = 6;

/// Buffer for child control events.
const EVENT_BUFFER: usize = 16;

/// One supervised child process and its control channel.
struct ProcessGroup {
    name: String,
    kind: EntityKind,
    child: Child,
    /// Control requests go here, one JSON line each
    stdin: ChildStdin,
    /// Control events forwarded from the child's stdout
    events: mpsc::Receiver<ControlEvent>,
    pid: u32,
    started_at: DateTime<Utc>,
}

impl ProcessGroup {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// The supervisor actor - owns all child process state.
pub struct SupervisorActor {
    receiver: mpsc::Receiver<SupervisorCommand>,

    config: Config,
    /// Config file path, re-read on reload
    config_path: PathBuf,
    /// Executable spawned for child processes (normally the current one)
    program: PathBuf,

    /// Cancelled before a full shutdown so the checkup ticker cannot
    /// relaunch entities that are being drained
    ticker_token: CancellationToken,

    /// Running children, keyed by entity name
    groups: HashMap<String, ProcessGroup>,

    /// Entities that should be running; checkup relaunches anything
    /// here whose process has exited
    desired: HashMap<String, EntityKind>,
}

impl SupervisorActor {
    pub fn new(
        receiver: mpsc::Receiver<SupervisorCommand>,
        config: Config,
        config_path: PathBuf,
        program: PathBuf,
        ticker_token: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            config,
            config_path,
            program,
            ticker_token,
            groups: HashMap::new(),
            desired: HashMap::new(),
        }
    }

    /// Runs the actor event loop until the command channel closes.
    pub async fn run(mut self) {
        info!("Supervisor actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
        }

        info!(tracked = self.groups.len(), "Supervisor actor stopped");
    }

    async fn handle_command(&mut self, cmd: SupervisorCommand) {
        match cmd {
            SupervisorCommand::Launch {
                kind,
                name,
                respond_to,
            } => {
                let result = self.handle_launch(kind, &name).await;
                // Ignore send error - caller may have dropped the receiver
                let _ = respond_to.send(result);
            }
            SupervisorCommand::Stop { name, respond_to } => {
                let result = self.handle_stop(&name).await;
                let _ = respond_to.send(result);
            }
            SupervisorCommand::Status { respond_to } => {
                let _ = respond_to.send(self.handle_status());
            }
            SupervisorCommand::Reload { respond_to } => {
                let result = self.handle_reload().await;
                let _ = respond_to.send(result);
            }
            SupervisorCommand::ShutdownAll { respond_to } => {
                self.handle_shutdown_all().await;
                let _ = respond_to.send(());
            }
            SupervisorCommand::Checkup => {
                self.handle_checkup().await;
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    /// Launches one entity and waits for its ready handshake.
    async fn handle_launch(
        &mut self,
        kind: EntityKind,
        name: &str,
    ) -> Result<(), SupervisorError> {
        // Reap a stale entry first so a crashed entity can be restarted
        // by name without an explicit stop.
        if let Some(group) = self.groups.get_mut(name) {
            if group.is_alive() {
                return Err(SupervisorError::AlreadyRunning {
                    kind: group.kind,
                    name: name.to_string(),
                });
            }
            self.groups.remove(name);
        }

        // Validate against configuration before spawning anything.
        match kind {
            EntityKind::Nameserver => {
                self.config.nameserver(name)?;
            }
            EntityKind::Daemon => {
                let host = self.config.host(name)?.clone();
                for ns in required_nameservers(&host) {
                    let running = self
                        .groups
                        .get_mut(ns)
                        .map(|g| g.is_alive())
                        .unwrap_or(false);
                    if !running {
                        return Err(SupervisorError::NameserverNotRunning {
                            daemon: name.to_string(),
                            nameserver: ns.to_string(),
                        });
                    }
                }
            }
        }

        let mut group = self.spawn_child(kind, name)?;

        // Launch handshake: the child emits `Ready` once its socket is
        // bound and its bindings are published.
        let window = self.config.poll_interval() * LAUNCH_ACK_TICKS;
        match timeout(window, group.events.recv()).await {
            Ok(Some(ControlEvent::Ready { addresses })) => {
                info!(
                    kind = %kind,
                    name = %name,
                    pid = group.pid,
                    published = addresses.len(),
                    "Entity ready"
                );
                for (service, address) in &addresses {
                    debug!(service = %service, address = %address, "Published binding");
                }
            }
            Ok(other) => {
                warn!(kind = %kind, name = %name, event = ?other, "Unexpected launch event");
                kill_group(&mut group).await;
                return Err(SupervisorError::LaunchFailed {
                    name: name.to_string(),
                    reason: "child exited before acknowledging readiness".to_string(),
                });
            }
            Err(_) => {
                warn!(kind = %kind, name = %name, "Launch acknowledgement timed out");
                kill_group(&mut group).await;
                return Err(SupervisorError::LaunchFailed {
                    name: name.to_string(),
                    reason: format!("no ready acknowledgement within {window:?}"),
                });
            }
        }

        self.groups.insert(name.to_string(), group);
        self.desired.insert(name.to_string(), kind);
        Ok(())
    }

    /// Stops one entity after checking nothing still depends on it.
    async fn handle_stop(&mut self, name: &str) -> Result<(), SupervisorError> {
        let kind = self
            .groups
            .get(name)
            .map(|g| g.kind)
            .ok_or_else(|| SupervisorError::NotRunning {
                name: name.to_string(),
            })?;

        // A nameserver cannot go down under a daemon that publishes to
        // it; the daemon's teardown unregistration would dangle.
        if kind == EntityKind::Nameserver {
            for group in self.groups.values() {
                if group.kind != EntityKind::Daemon {
                    continue;
                }
                let depends = self
                    .config
                    .host(&group.name)
                    .map(|h| required_nameservers(h).contains(name))
                    .unwrap_or(false);
                if depends {
                    return Err(SupervisorError::StillInUse {
                        nameserver: name.to_string(),
                        daemon: group.name.clone(),
                    });
                }
            }
        }

        self.desired.remove(name);
        if let Some(group) = self.groups.remove(name) {
            self.stop_group(group).await;
        }
        Ok(())
    }

    fn handle_status(&mut self) -> Vec<EntityStatus> {
        let mut entries: Vec<EntityStatus> = self
            .groups
            .values_mut()
            .map(|group| {
                let alive = group.is_alive();
                EntityStatus {
                    name: group.name.clone(),
                    kind: group.kind,
                    pid: group.pid,
                    alive,
                    started_at: group.started_at,
                }
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Re-reads configuration and restarts the running set under it.
    ///
    /// The new configuration is loaded before anything stops; a broken
    /// file leaves the deployment untouched.
    async fn handle_reload(&mut self) -> Result<(), SupervisorError> {
        let new_config = Config::load(&self.config_path)?;

        let snapshot: Vec<(String, EntityKind)> = self
            .desired
            .iter()
            .map(|(name, kind)| (name.clone(), *kind))
            .collect();

        info!(entities = snapshot.len(), "Reloading configuration");
        self.stop_all().await;
        self.desired.clear();
        self.config = new_config;

        // Nameservers come back first; daemons depend on them.
        for target_kind in [EntityKind::Nameserver, EntityKind::Daemon] {
            for (name, kind) in &snapshot {
                if *kind != target_kind {
                    continue;
                }
                let configured = match kind {
                    EntityKind::Nameserver => self.config.nameserver(name).is_ok(),
                    EntityKind::Daemon => self.config.host(name).is_ok(),
                };
                if !configured {
                    warn!(kind = %kind, name = %name, "Entity dropped from configuration");
                    continue;
                }
                if let Err(e) = self.handle_launch(*kind, name).await {
                    error!(kind = %kind, name = %name, error = %e, "Relaunch after reload failed");
                }
            }
        }
        Ok(())
    }

    /// Drains everything and stops the checkup ticker.
    async fn handle_shutdown_all(&mut self) {
        // Ticker first, or the next checkup would relaunch what we stop.
        self.ticker_token.cancel();
        info!(tracked = self.groups.len(), "Shutting down all entities");
        self.desired.clear();
        self.stop_all().await;
    }

    /// Reaps exited children and relaunches anything still desired.
    async fn handle_checkup(&mut self) {
        let mut dead: Vec<(String, EntityKind)> = Vec::new();
        for (name, group) in self.groups.iter_mut() {
            if !group.is_alive() {
                dead.push((name.clone(), group.kind));
            }
        }

        for (name, _) in &dead {
            if let Some(mut group) = self.groups.remove(name) {
                // try_wait already reaped the exit status; this wait is
                // an idempotent no-op that keeps the child from leaking.
                let _ = group.child.wait().await;
                warn!(kind = %group.kind, name = %name, pid = group.pid, "Child process exited");
            }
        }

        // Nameservers first, so a dead ns/daemon pair comes back in
        // dependency order within a single pass.
        for target_kind in [EntityKind::Nameserver, EntityKind::Daemon] {
            for (name, kind) in &dead {
                if *kind != target_kind || !self.desired.contains_key(name) {
                    continue;
                }
                info!(kind = %kind, name = %name, "Relaunching exited entity");
                if let Err(e) = self.handle_launch(*kind, name).await {
                    // Still desired; the next checkup retries.
                    error!(kind = %kind, name = %name, error = %e, "Relaunch failed");
                }
            }
        }
    }

    // ========================================================================
    // Process plumbing
    // ========================================================================

    /// Spawns one child with piped stdio and a stdout event forwarder.
    fn spawn_child(&self, kind: EntityKind, name: &str) -> Result<ProcessGroup, SupervisorError> {
        let subcommand = match kind {
            EntityKind::Nameserver => "nameserver",
            EntityKind::Daemon => "host",
        };

        let mut child = Command::new(&self.program)
            .arg(subcommand)
            .arg("--name")
            .arg(name)
            .arg("--config")
            .arg(&self.config_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take().ok_or_else(|| SupervisorError::Spawn {
            name: name.to_string(),
            reason: "child stdin not piped".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| SupervisorError::Spawn {
            name: name.to_string(),
            reason: "child stdout not piped".to_string(),
        })?;

        let (event_tx, events) = mpsc::channel(EVENT_BUFFER);
        let child_name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<ControlEvent>(&line) {
                    Ok(event) => {
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(child = %child_name, error = %e, "Unparseable control event");
                    }
                }
            }
            debug!(child = %child_name, "Control event stream closed");
        });

        debug!(kind = %kind, name = %name, pid = pid, "Child spawned");
        Ok(ProcessGroup {
            name: name.to_string(),
            kind,
            child,
            stdin,
            events,
            pid,
            started_at: Utc::now(),
        })
    }

    /// Graceful stop: shutdown request, wait for the done handshake,
    /// kill if the child overstays the acknowledgement window.
    async fn stop_group(&mut self, mut group: ProcessGroup) {
        info!(kind = %group.kind, name = %group.name, pid = group.pid, "Stopping entity");

        match serde_json::to_string(&ControlRequest::Shutdown) {
            Ok(line) => {
                let write = async {
                    group.stdin.write_all(line.as_bytes()).await?;
                    group.stdin.write_all(b"\n").await?;
                    group.stdin.flush().await?;
                    Ok::<(), std::io::Error>(())
                }
                .await;
                if let Err(e) = write {
                    warn!(name = %group.name, error = %e, "Failed to send shutdown request");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize shutdown request"),
        }

        let window = self.config.poll_interval() * SHUTDOWN_ACK_TICKS;
        let acked = timeout(window, async {
            while let Some(event) = group.events.recv().await {
                if matches!(event, ControlEvent::Done) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        if !acked {
            warn!(name = %group.name, "No done acknowledgement, killing");
        }

        match timeout(window, group.child.wait()).await {
            Ok(Ok(status)) => {
                info!(name = %group.name, status = %status, "Entity stopped");
            }
            Ok(Err(e)) => {
                warn!(name = %group.name, error = %e, "Failed to reap child");
            }
            Err(_) => {
                warn!(name = %group.name, "Child did not exit, killing");
                kill_group(&mut group).await;
            }
        }
    }

    /// Stops every running entity, daemons before nameservers.
    async fn stop_all(&mut self) {
        for target_kind in [EntityKind::Daemon, EntityKind::Nameserver] {
            let names: Vec<String> = self
                .groups
                .iter()
                .filter(|(_, g)| g.kind == target_kind)
                .map(|(name, _)| name.clone())
                .collect();
            for name in names {
                if let Some(group) = self.groups.remove(&name) {
                    self.stop_group(group).await;
                }
            }
        }
    }

    /// Number of tracked children (for tests).
    #[cfg(test)]
    pub fn tracked_count(&self) -> usize {
        self.groups.len()
    }
}

async fn kill_group(group: &mut ProcessGroup) {
    if let Err(e) = group.child.start_kill() {
        debug!(name = %group.name, error = %e, "Kill failed (already exited?)");
    }
    let _ = group.child.wait().await;
}

/// Every nameserver a host publishes to, including per-service overrides.
fn required_nameservers(host: &HostConfig) -> HashSet<&str> {
    let mut set: HashSet<&str> = host.nameservers.iter().map(String::as_str).collect();
    for service in &host.services {
        if let Some(overrides) = &service.nameservers {
            set.extend(overrides.iter().map(String::as_str));
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::ConfigError;

    const SAMPLE: &str = r#"
        socket_dir = "/tmp/benchd-test"

        [[nameserver]]
        name = "ns-main"

        [[host]]
        name = "optics"
        nameservers = ["ns-main"]

        [[host.service]]
        name = "laser-1"
        implementation = "echo"
    "#;

    fn create_actor() -> (mpsc::Sender<SupervisorCommand>, SupervisorActor) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let config = Config::from_str(SAMPLE).unwrap();
        let actor = SupervisorActor::new(
            cmd_rx,
            config,
            PathBuf::from("/nonexistent/bench.toml"),
            PathBuf::from("/nonexistent/benchd"),
            CancellationToken::new(),
        );
        (cmd_tx, actor)
    }

    #[tokio::test]
    async fn test_launch_unknown_entity_is_config_error() {
        let (_tx, mut actor) = create_actor();
        let err = actor
            .handle_launch(EntityKind::Nameserver, "ns-ghost")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Config(ConfigError::UnknownEntity { .. })
        ));
    }

    #[tokio::test]
    async fn test_launch_daemon_requires_running_nameserver() {
        let (_tx, mut actor) = create_actor();
        // No nameserver running yet; the daemon must be refused before
        // any process is spawned.
        let err = actor
            .handle_launch(EntityKind::Daemon, "optics")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::NameserverNotRunning { ref nameserver, .. } if nameserver == "ns-main"
        ));
        assert_eq!(actor.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_unknown_entity() {
        let (_tx, mut actor) = create_actor();
        let err = actor.handle_stop("optics").await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning { .. }));
    }

    #[tokio::test]
    async fn test_status_empty() {
        let (_tx, mut actor) = create_actor();
        assert!(actor.handle_status().is_empty());
    }

    #[test]
    fn test_required_nameservers_includes_overrides() {
        let config = Config::from_str(
            r#"
            [[nameserver]]
            name = "ns-a"
            [[nameserver]]
            name = "ns-b"
            [[host]]
            name = "optics"
            nameservers = ["ns-a"]
            [[host.service]]
            name = "laser-1"
            implementation = "echo"
            nameservers = ["ns-b"]
            "#,
        )
        .unwrap();
        let host = config.host("optics").unwrap();
        let required = required_nameservers(host);
        assert!(required.contains("ns-a"));
        assert!(required.contains("ns-b"));
    }
}
