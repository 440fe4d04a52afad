//! benchd - instrument bench daemon
//!
//! The main process supervises nameserver and host children and exposes
//! an operator control socket. The same binary doubles as the child
//! executable via the hidden `host` and `nameserver` subcommands.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! benchd start --config bench.toml
//!
//! # Start the daemon (background/daemonized)
//! benchd start -d --config bench.toml
//!
//! # Operator commands against a running daemon
//! benchd status
//! benchd up daemon optics
//! benchd down optics
//! benchd reload
//! benchd resolve laser-1
//! benchd unlock --address /tmp/benchd/host-optics.sock#laser-1
//!
//! # Stop the daemon
//! benchd stop
//!
//! # Enable debug logging
//! RUST_LOG=benchd=debug benchd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: drain all children (daemons first), then exit

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bench_core::{split_address, Config, ServiceFactory};
use bench_protocol::{CtlRequest, CtlResponse, EntityKind, HostRequest, HostResponse};
use benchd::child::spawn_control_reader;
use benchd::ctl::{ctl_request, run_ctl_server};
use benchd::host::HostProcess;
use benchd::nameserver::{NameserverProcess, NsClient};
use benchd::supervisor::{spawn_supervisor, ProcessRole};

/// benchd - shared instrument access daemon
#[derive(Parser, Debug)]
#[command(name = "benchd", version, about)]
struct Args {
    /// Path to the deployment configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show the status of supervised entities
    Status,
    /// Launch one configured entity
    Up {
        /// Entity kind: nameserver or daemon
        #[arg(value_enum)]
        kind: CliEntityKind,
        /// Entity name from the configuration
        name: String,
    },
    /// Gracefully stop one entity
    Down { name: String },
    /// Reload configuration, restarting the running set
    Reload,
    /// Resolve a published service name to its address
    Resolve { name: String },
    /// Force-release the lock on a service, bypassing ownership
    Unlock {
        /// Published address, as printed by resolve
        #[arg(long)]
        address: String,
    },
    /// Run as a host child process (spawned by the supervisor)
    #[command(hide = true)]
    Host {
        #[arg(long)]
        name: String,
    },
    /// Run as a nameserver child process (spawned by the supervisor)
    #[command(hide = true)]
    Nameserver {
        #[arg(long)]
        name: String,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliEntityKind {
    Nameserver,
    Daemon,
}

impl From<CliEntityKind> for EntityKind {
    fn from(kind: CliEntityKind) -> Self {
        match kind {
            CliEntityKind::Nameserver => EntityKind::Nameserver,
            CliEntityKind::Daemon => EntityKind::Daemon,
        }
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("benchd")
        .join("bench.toml")
}

/// Returns the path to the PID file.
fn pid_file_path() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("benchd")
        .join("benchd.pid")
}

/// Returns the path to the log file.
fn log_file_path() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("benchd")
        .join("benchd.log")
}

/// Reads the PID from the PID file, if it exists.
fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

/// Writes the current PID to the PID file.
fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

/// Checks if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// Checks if the daemon is already running.
fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        // Stale PID file - remove it
        remove_pid_file();
    }
    None
}

/// Sends SIGTERM to the daemon process.
fn signal_stop(pid: u32) -> Result<()> {
    let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if result != 0 {
        bail!("Failed to send SIGTERM to process {}", pid);
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(default_config_path);

    match args.command {
        Command::Start { daemon } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'benchd stop' to stop it first.");
                process::exit(1);
            }

            if daemon {
                // Daemonize before starting the tokio runtime
                daemonize()?;
            }

            write_pid()?;
            let result = run_daemon(config_path);
            remove_pid_file();
            result
        }

        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                signal_stop(pid)?;

                // Wait for the process to exit (up to 10 seconds; the
                // supervisor drains children first)
                for _ in 0..100 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 10 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }

        Command::Status => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                process::exit(1);
            };
            println!("Daemon is running (PID {pid})");
            run_ctl_command(config_path, CtlRequest::Status)
        }

        Command::Up { kind, name } => run_ctl_command(
            config_path,
            CtlRequest::Start {
                kind: kind.into(),
                name,
            },
        ),
        Command::Down { name } => run_ctl_command(config_path, CtlRequest::Stop { name }),
        Command::Reload => run_ctl_command(config_path, CtlRequest::Reload),

        Command::Resolve { name } => run_resolve(config_path, name),
        Command::Unlock { address } => run_unlock(address),

        Command::Host { name } => run_host(config_path, name),
        Command::Nameserver { name } => run_nameserver(config_path, name),
    }
}

/// Daemonizes the current process.
fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = File::create(&log_path).context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

fn init_main_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("benchd=info".parse()?)
                .add_directive("bench_core=info".parse()?)
                .add_directive("bench_protocol=info".parse()?),
        )
        .init();
    Ok(())
}

/// Child logging goes to stderr; stdout is the control event channel
/// to the supervisor and must stay clean.
fn init_child_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("benchd=info".parse()?)
                .add_directive("bench_core=info".parse()?)
                .add_directive("bench_protocol=info".parse()?),
        )
        .init();
    Ok(())
}

/// Runs the main supervising daemon.
#[tokio::main]
async fn run_daemon(config_path: PathBuf) -> Result<()> {
    init_main_logging()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        config = %config_path.display(),
        "benchd starting"
    );

    let config = Config::load(&config_path)?;
    let control_socket = config.control_socket();
    let program = std::env::current_exe().context("Failed to locate own executable")?;

    let supervisor = spawn_supervisor(
        config.clone(),
        config_path,
        program,
        ProcessRole::Main,
    )?;

    // Autostart the configured deployment, nameservers first.
    for ns in &config.nameservers {
        if let Err(e) = supervisor.launch(EntityKind::Nameserver, &ns.name).await {
            error!(nameserver = %ns.name, error = %e, "Autostart failed");
        }
    }
    for host in &config.hosts {
        if let Err(e) = supervisor.launch(EntityKind::Daemon, &host.name).await {
            error!(host = %host.name, error = %e, "Autostart failed");
        }
    }

    let cancel_token = CancellationToken::new();

    // Signal handler: drain everything, then stop the control server.
    let shutdown_token = cancel_token.clone();
    let shutdown_supervisor = supervisor.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        if let Err(e) = shutdown_supervisor.shutdown_all().await {
            warn!(error = %e, "Shutdown drain failed");
        }
        shutdown_token.cancel();
    });

    run_ctl_server(control_socket, supervisor, cancel_token).await?;

    info!("benchd stopped");
    Ok(())
}

/// Runs a host child process.
#[tokio::main]
async fn run_host(config_path: PathBuf, name: String) -> Result<()> {
    init_child_logging()?;

    let config = Config::load(&config_path)?;
    let cancel_token = CancellationToken::new();
    let _reader = spawn_control_reader(cancel_token.clone());

    let host = HostProcess::new(config, name, ServiceFactory::with_builtins(), cancel_token)?;
    host.run().await?;
    Ok(())
}

/// Runs a nameserver child process.
#[tokio::main]
async fn run_nameserver(config_path: PathBuf, name: String) -> Result<()> {
    init_child_logging()?;

    let config = Config::load(&config_path)?;
    let cancel_token = CancellationToken::new();
    let _reader = spawn_control_reader(cancel_token.clone());

    let ns = NameserverProcess::new(&config, name, cancel_token);
    ns.run().await?;
    Ok(())
}

/// Sends one request to the running daemon's control socket.
#[tokio::main]
async fn run_ctl_command(config_path: PathBuf, request: CtlRequest) -> Result<()> {
    let config = Config::load(&config_path)?;
    let response = ctl_request(config.control_socket(), &request)
        .await
        .context("Failed to reach the daemon control socket (is benchd running?)")?;

    match response {
        CtlResponse::Ok => {
            println!("ok");
            Ok(())
        }
        CtlResponse::Status { entries } => {
            if entries.is_empty() {
                println!("No supervised entities.");
                return Ok(());
            }
            for entry in entries {
                println!(
                    "{:<12} {:<20} pid {:<8} {:<6} since {}",
                    entry.kind,
                    entry.name,
                    entry.pid,
                    if entry.alive { "up" } else { "dead" },
                    entry.started_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
            Ok(())
        }
        CtlResponse::Error { message } => {
            eprintln!("error: {message}");
            process::exit(1);
        }
    }
}

/// Resolves a name against every configured nameserver.
#[tokio::main]
async fn run_resolve(config_path: PathBuf, name: String) -> Result<()> {
    let config = Config::load(&config_path)?;
    for ns in &config.nameservers {
        let socket = config.nameserver_socket(&ns.name);
        let result = async {
            let mut client = NsClient::connect(&socket).await?;
            client.lookup(&name).await
        }
        .await;
        match result {
            Ok(address) => {
                println!("{address}");
                return Ok(());
            }
            Err(e) => {
                warn!(nameserver = %ns.name, error = %e, "Lookup failed");
            }
        }
    }
    eprintln!("error: name {name} is not bound on any nameserver");
    process::exit(1);
}

/// Force-releases the lock on a service at a published address.
#[tokio::main]
async fn run_unlock(address: String) -> Result<()> {
    let Some((socket, object)) = split_address(&address) else {
        bail!("Invalid address (expected <socket>#<service>): {}", address);
    };

    let stream = tokio::net::UnixStream::connect(&socket)
        .await
        .with_context(|| format!("Failed to connect to host socket {}", socket.display()))?;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    let (reader, mut writer) = stream.into_split();

    let request = HostRequest::ForceRelease {
        object: object.to_string(),
    };
    let json = serde_json::to_string(&request)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await?;
    match serde_json::from_str::<HostResponse>(&line)? {
        HostResponse::Released => {
            println!("unlocked {object}");
            Ok(())
        }
        HostResponse::Error { message, .. } => {
            eprintln!("error: {message}");
            process::exit(1);
        }
        other => bail!("Unexpected response: {:?}", other),
    }
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }
    Ok(())
}
