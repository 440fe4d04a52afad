//! Process supervisor using the actor pattern.
//!
//! The supervisor is the main-process controller for the whole
//! deployment: it launches nameserver and host children, monitors them
//! on a polling ticker, relaunches what dies, and drains everything on
//! shutdown. It receives commands via a tokio mpsc channel and is the
//! single owner of all child process state.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────────┐     spawn/stdio    ┌──────────┐
//! │  CtlServer   │────▶│  SupervisorActor │───────────────────▶│ children │
//! └──────────────┘     └──────────────────┘                    └──────────┘
//!        │  SupervisorCommand      ▲
//!        │  (mpsc channel)         │ Checkup tick
//!        ▼                         │
//!   launch/stop/reload      checkup ticker task
//! ```

use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use bench_core::{Config, ConfigError};

mod actor;
mod commands;
mod handle;

pub use actor::{SupervisorActor, LAUNCH_ACK_TICKS, SHUTDOWN_ACK_TICKS};
pub use commands::{ProcessRole, SupervisorCommand, SupervisorError};
pub use handle::SupervisorHandle;

/// Command channel buffer size.
const COMMAND_BUFFER: usize = 32;

/// Spawns the supervisor actor and its checkup ticker.
///
/// Refuses to run outside the main process: a child that constructed
/// its own supervisor would fork the process tree.
pub fn spawn_supervisor(
    config: Config,
    config_path: PathBuf,
    program: PathBuf,
    role: ProcessRole,
) -> Result<SupervisorHandle, ConfigError> {
    if role != ProcessRole::Main {
        return Err(ConfigError::NotMainProcess);
    }

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let ticker_token = CancellationToken::new();
    let poll_interval = config.poll_interval();

    let actor = SupervisorActor::new(cmd_rx, config, config_path, program, ticker_token.clone());
    tokio::spawn(actor.run());

    spawn_checkup_task(cmd_tx.clone(), poll_interval, ticker_token);

    Ok(SupervisorHandle::new(cmd_tx))
}

/// Spawns the background task driving periodic checkups.
///
/// The token is cancelled by the actor before a full shutdown so no
/// checkup can relaunch entities that are being drained.
fn spawn_checkup_task(
    sender: mpsc::Sender<SupervisorCommand>,
    poll_interval: std::time::Duration,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = interval(poll_interval);
        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!("Checkup ticker stopping: shutdown in progress");
                    break;
                }

                _ = ticker.tick() => {
                    if sender.send(SupervisorCommand::Checkup).await.is_err() {
                        debug!("Checkup ticker stopping: supervisor channel closed");
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_refuses_child_role() {
        let config = Config::from_str("").unwrap();
        let result = spawn_supervisor(
            config,
            PathBuf::from("/tmp/bench.toml"),
            PathBuf::from("/usr/bin/benchd"),
            ProcessRole::Child,
        );
        assert!(matches!(result, Err(ConfigError::NotMainProcess)));
    }

    #[tokio::test]
    async fn test_spawn_main_role() {
        let config = Config::from_str("").unwrap();
        let handle = spawn_supervisor(
            config,
            PathBuf::from("/tmp/bench.toml"),
            PathBuf::from("/usr/bin/benchd"),
            ProcessRole::Main,
        )
        .unwrap();
        assert!(handle.is_connected());
        assert!(handle.status().await.is_empty());
    }
}
