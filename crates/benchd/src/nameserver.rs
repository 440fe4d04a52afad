//! Nameserver process: name → address resolution for published services.
//!
//! A nameserver is a child process serving `NsRequest` over a Unix
//! socket. Its binding table is plain in-memory state: hosts re-publish
//! on every (re)start, so persistence buys nothing here.
//!
//! `NsClient` in the same module is the connect-request-response helper
//! used by host bootstrap, the operator `resolve` path, and tests.

use bench_core::Config;
use bench_protocol::{NsRequest, NsResponse};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that can occur in nameserver operations.
#[derive(Debug, thiserror::Error)]
pub enum NameserverError {
    #[error("failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    /// The unregistered name was not bound (stale registration)
    #[error("name not bound: {0}")]
    NotBound(String),

    /// Lookup failed
    #[error("unknown name: {0}")]
    UnknownName(String),

    #[error("nameserver returned error: {0}")]
    Remote(String),

    #[error("nameserver closed the connection")]
    Eof,
}

type Bindings = Arc<Mutex<HashMap<String, String>>>;

/// One nameserver process.
pub struct NameserverProcess {
    name: String,
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    bindings: Bindings,
}

impl NameserverProcess {
    pub fn new(config: &Config, name: impl Into<String>, cancel_token: CancellationToken) -> Self {
        let name = name.into();
        Self {
            socket_path: config.nameserver_socket(&name),
            name,
            cancel_token,
            bindings: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs the nameserver until cancelled.
    ///
    /// Emits `Ready` (with an empty address list, a nameserver publishes
    /// nothing itself) once the socket is bound, and `Done` after
    /// teardown.
    pub async fn run(&self) -> Result<(), NameserverError> {
        let listener = bind_unix_socket(&self.socket_path)?;
        info!(
            nameserver = %self.name,
            socket = %self.socket_path.display(),
            "Nameserver listening"
        );

        crate::child::emit_ready(Vec::new()).await;

        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!(nameserver = %self.name, "Nameserver shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let bindings = Arc::clone(&self.bindings);
                            let token = self.cancel_token.clone();
                            handlers.spawn(async move {
                                if let Err(e) = serve_connection(stream, bindings, token).await {
                                    debug!(error = %e, "Nameserver connection closed");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept nameserver connection");
                        }
                    }
                }

                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }

        // In-flight requests are answered before teardown; connections
        // observe the token between requests and close themselves.
        while handlers.join_next().await.is_some() {}

        self.cleanup().await;
        crate::child::emit_done().await;
        Ok(())
    }

    /// Number of current bindings (for tests).
    pub async fn binding_count(&self) -> usize {
        self.bindings.lock().await.len()
    }

    async fn cleanup(&self) {
        self.bindings.lock().await.clear();
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove nameserver socket"
                );
            }
        }
        info!(nameserver = %self.name, "Nameserver cleanup complete");
    }
}

/// Removes a stale socket file and binds a fresh listener.
pub(crate) fn bind_unix_socket(path: &Path) -> Result<UnixListener, NameserverError> {
    if path.exists() {
        std::fs::remove_file(path).map_err(|e| NameserverError::SocketSetup {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
    }
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| NameserverError::SocketSetup {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;
        }
    }
    UnixListener::bind(path).map_err(|e| NameserverError::SocketSetup {
        path: path.to_path_buf(),
        error: e.to_string(),
    })
}

/// Serves one client connection until EOF or nameserver shutdown.
async fn serve_connection(
    stream: UnixStream,
    bindings: Bindings,
    cancel_token: CancellationToken,
) -> Result<(), NameserverError> {
    let (reader, writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut writer = BufWriter::new(writer);

    loop {
        let line = tokio::select! {
            _ = cancel_token.cancelled() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        let response = match serde_json::from_str::<NsRequest>(&line) {
            Ok(request) => handle_request(request, &bindings).await,
            Err(e) => NsResponse::Error {
                kind: bench_protocol::NsErrorKind::BadRequest,
                message: format!("unparseable request: {e}"),
            },
        };

        let json =
            serde_json::to_string(&response).map_err(|e| NameserverError::Parse(e.to_string()))?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn handle_request(request: NsRequest, bindings: &Bindings) -> NsResponse {
    match request {
        NsRequest::Register { name, address } => {
            let mut table = bindings.lock().await;
            // Rebinding overwrites: a relaunched host re-publishes the
            // same names at a new address.
            let previous = table.insert(name.clone(), address.clone());
            match previous {
                Some(old) if old != address => {
                    info!(name = %name, old = %old, new = %address, "Name rebound");
                }
                None => {
                    info!(name = %name, address = %address, "Name registered");
                }
                Some(_) => {
                    debug!(name = %name, "Name re-registered at same address");
                }
            }
            NsResponse::Ok
        }
        NsRequest::Unregister { name } => {
            let mut table = bindings.lock().await;
            if table.remove(&name).is_some() {
                info!(name = %name, "Name unregistered");
                NsResponse::Ok
            } else {
                // Stale registration: logged, non-fatal for the caller.
                warn!(name = %name, "Unregister of unbound name");
                NsResponse::not_bound(&name)
            }
        }
        NsRequest::Lookup { name } => {
            let table = bindings.lock().await;
            match table.get(&name) {
                Some(address) => NsResponse::Address {
                    address: address.clone(),
                },
                None => NsResponse::Error {
                    kind: bench_protocol::NsErrorKind::NotBound,
                    message: format!("unknown name: {name}"),
                },
            }
        }
        NsRequest::List => {
            let table = bindings.lock().await;
            let mut entries: Vec<(String, String)> = table
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            entries.sort();
            NsResponse::Bindings { entries }
        }
        NsRequest::Ping { seq } => NsResponse::Pong { seq },
    }
}

// ============================================================================
// Client
// ============================================================================

/// Small request/response client for one nameserver.
pub struct NsClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: BufWriter<tokio::net::unix::OwnedWriteHalf>,
}

impl NsClient {
    /// Connects to a nameserver socket.
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self, NameserverError> {
        let stream = UnixStream::connect(socket_path.as_ref()).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        })
    }

    async fn request(&mut self, request: &NsRequest) -> Result<NsResponse, NameserverError> {
        let json =
            serde_json::to_string(request).map_err(|e| NameserverError::Parse(e.to_string()))?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let mut line = String::new();
        let bytes = self.reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Err(NameserverError::Eof);
        }
        serde_json::from_str(&line).map_err(|e| NameserverError::Parse(e.to_string()))
    }

    /// Binds `name` to `address`.
    pub async fn register(&mut self, name: &str, address: &str) -> Result<(), NameserverError> {
        match self
            .request(&NsRequest::Register {
                name: name.to_string(),
                address: address.to_string(),
            })
            .await?
        {
            NsResponse::Ok => Ok(()),
            NsResponse::Error { message, .. } => Err(NameserverError::Remote(message)),
            other => Err(NameserverError::Parse(format!(
                "unexpected response: {other:?}"
            ))),
        }
    }

    /// Removes the binding for `name`.
    ///
    /// `Err(NotBound)` is the stale-registration case; callers during
    /// shutdown log it and move on.
    pub async fn unregister(&mut self, name: &str) -> Result<(), NameserverError> {
        match self
            .request(&NsRequest::Unregister {
                name: name.to_string(),
            })
            .await?
        {
            NsResponse::Ok => Ok(()),
            NsResponse::Error {
                kind: bench_protocol::NsErrorKind::NotBound,
                ..
            } => Err(NameserverError::NotBound(name.to_string())),
            NsResponse::Error { message, .. } => Err(NameserverError::Remote(message)),
            other => Err(NameserverError::Parse(format!(
                "unexpected response: {other:?}"
            ))),
        }
    }

    /// Resolves `name` to an address.
    pub async fn lookup(&mut self, name: &str) -> Result<String, NameserverError> {
        match self
            .request(&NsRequest::Lookup {
                name: name.to_string(),
            })
            .await?
        {
            NsResponse::Address { address } => Ok(address),
            NsResponse::Error {
                kind: bench_protocol::NsErrorKind::NotBound,
                ..
            } => Err(NameserverError::UnknownName(name.to_string())),
            NsResponse::Error { message, .. } => Err(NameserverError::Remote(message)),
            other => Err(NameserverError::Parse(format!(
                "unexpected response: {other:?}"
            ))),
        }
    }

    /// Lists all bindings.
    pub async fn list(&mut self) -> Result<Vec<(String, String)>, NameserverError> {
        match self.request(&NsRequest::List).await? {
            NsResponse::Bindings { entries } => Ok(entries),
            NsResponse::Error { message, .. } => Err(NameserverError::Remote(message)),
            other => Err(NameserverError::Parse(format!(
                "unexpected response: {other:?}"
            ))),
        }
    }

    /// Liveness probe.
    pub async fn ping(&mut self, seq: u64) -> Result<(), NameserverError> {
        match self.request(&NsRequest::Ping { seq }).await? {
            NsResponse::Pong { seq: got } if got == seq => Ok(()),
            other => Err(NameserverError::Parse(format!(
                "unexpected response: {other:?}"
            ))),
        }
    }
}
