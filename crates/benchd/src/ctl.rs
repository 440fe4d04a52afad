//! Operator control socket of the main process.
//!
//! Accepts connections from the `benchd` CLI, translates each
//! `CtlRequest` into a supervisor call, and answers with a
//! `CtlResponse`. Per-request failures are answered on the wire; only
//! transport errors end a connection.

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use bench_protocol::{CtlRequest, CtlResponse};

use crate::nameserver::{bind_unix_socket, NameserverError};
use crate::supervisor::SupervisorHandle;

/// Errors fatal to the control server.
#[derive(Debug, thiserror::Error)]
pub enum CtlError {
    #[error("failed to setup control socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },
}

/// Runs the control server until cancelled.
///
/// Each connection is served by its own task; the supervisor handle is
/// cheap to clone.
pub async fn run_ctl_server(
    socket_path: PathBuf,
    supervisor: SupervisorHandle,
    cancel_token: CancellationToken,
) -> Result<(), CtlError> {
    let listener = bind_unix_socket(&socket_path).map_err(|e| match e {
        NameserverError::SocketSetup { path, error } => CtlError::SocketSetup { path, error },
        other => CtlError::SocketSetup {
            path: socket_path.clone(),
            error: other.to_string(),
        },
    })?;
    info!(socket = %socket_path.display(), "Control server listening");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("Control server shutting down");
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let supervisor = supervisor.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, supervisor).await {
                                debug!(error = %e, "Control connection closed");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept control connection");
                    }
                }
            }
        }
    }

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    Ok(())
}

async fn serve_connection(
    stream: UnixStream,
    supervisor: SupervisorHandle,
) -> Result<(), std::io::Error> {
    let (reader, writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut writer = BufWriter::new(writer);

    while let Some(line) = lines.next_line().await? {
        let response = match serde_json::from_str::<CtlRequest>(&line) {
            Ok(request) => handle_request(request, &supervisor).await,
            Err(e) => CtlResponse::error(format!("unparseable request: {e}")),
        };

        let json = serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"serialization failed: {e}"}}"#)
        });
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn handle_request(request: CtlRequest, supervisor: &SupervisorHandle) -> CtlResponse {
    match request {
        CtlRequest::Start { kind, name } => match supervisor.launch(kind, &name).await {
            Ok(()) => CtlResponse::Ok,
            Err(e) => CtlResponse::error(e.to_string()),
        },
        CtlRequest::Stop { name } => match supervisor.stop(&name).await {
            Ok(()) => CtlResponse::Ok,
            Err(e) => CtlResponse::error(e.to_string()),
        },
        CtlRequest::Reload => match supervisor.reload().await {
            Ok(()) => CtlResponse::Ok,
            Err(e) => CtlResponse::error(e.to_string()),
        },
        CtlRequest::Status => CtlResponse::Status {
            entries: supervisor.status().await,
        },
        CtlRequest::ShutdownAll => match supervisor.shutdown_all().await {
            Ok(()) => CtlResponse::Ok,
            Err(e) => CtlResponse::error(e.to_string()),
        },
    }
}

/// Sends one request to the control socket and reads one response.
///
/// Used by the operator CLI subcommands.
pub async fn ctl_request(
    socket_path: impl AsRef<std::path::Path>,
    request: &CtlRequest,
) -> Result<CtlResponse, std::io::Error> {
    let stream = UnixStream::connect(socket_path.as_ref()).await?;
    let (reader, writer) = stream.into_split();
    let mut writer = BufWriter::new(writer);

    let json = serde_json::to_string(request)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    let mut line = String::new();
    let bytes = BufReader::new(reader).read_line(&mut line).await?;
    if bytes == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "control socket closed before responding",
        ));
    }
    serde_json::from_str(&line).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
