//! Child-side control channel.
//!
//! Host and nameserver processes are children of the supervisor, which
//! talks to them over piped stdio: `ControlRequest` lines arrive on
//! stdin, `ControlEvent` lines leave on stdout. Cancellation is purely
//! cooperative; the serve loops re-check their token between calls.

use bench_protocol::{ControlEvent, ControlRequest};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Spawns the stdin control reader.
///
/// Cancels `cancel_token` when a shutdown request arrives or stdin
/// closes (a closed stdin means the supervisor is gone; orphaned
/// children shut down rather than linger).
pub fn spawn_control_reader(cancel_token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<ControlRequest>(&line) {
                    Ok(ControlRequest::Shutdown) => {
                        info!("Shutdown request received from supervisor");
                        cancel_token.cancel();
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, line = %line, "Unparseable control line, ignoring");
                    }
                },
                Ok(None) => {
                    info!("Control channel closed, shutting down");
                    cancel_token.cancel();
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Control channel read error, shutting down");
                    cancel_token.cancel();
                    break;
                }
            }
        }
        debug!("Control reader task completed");
    })
}

/// Emits a control event on stdout for the supervisor.
///
/// Serialization of our own enum cannot fail; write errors mean the
/// supervisor is gone and are logged, not propagated.
pub async fn emit_event(event: &ControlEvent) {
    let json = match serde_json::to_string(event) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "Failed to serialize control event");
            return;
        }
    };
    let mut stdout = tokio::io::stdout();
    let result = async {
        stdout.write_all(json.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
        Ok::<(), std::io::Error>(())
    }
    .await;
    if let Err(e) = result {
        warn!(error = %e, "Failed to write control event");
    }
}

/// Emits `Ready` with the published bindings.
pub async fn emit_ready(addresses: Vec<(String, String)>) {
    emit_event(&ControlEvent::Ready { addresses }).await;
}

/// Emits `Done` after graceful teardown.
pub async fn emit_done() {
    emit_event(&ControlEvent::Done).await;
}
