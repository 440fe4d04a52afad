//! Connection handler for individual host clients.
//!
//! Each client connection gets its own `ConnectionHandler` that parses
//! incoming requests, enforces the lock guard, routes calls through the
//! instance dispatcher, and sends responses. When the connection ends,
//! for any reason, the handler notifies the lock manager and dispatcher
//! so connection-scoped state is swept.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bench_core::{ConnId, Lifecycle, ServiceError};
use bench_protocol::{HostRequest, HostResponse, WireErrorKind};
use serde_json::json;

use crate::dispatch::InstanceDispatcher;
use crate::lock::{LockError, LockManager};

/// Maximum request size (1 MB)
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection handler for a single client.
pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,

    /// Identity of this connection, minted by the accept loop
    conn: ConnId,

    locks: Arc<LockManager>,
    dispatcher: Arc<InstanceDispatcher>,

    /// Host shutdown token; observed between requests only, so an
    /// in-flight call always completes before the handler exits
    cancel_token: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        conn: ConnId,
        locks: Arc<LockManager>,
        dispatcher: Arc<InstanceDispatcher>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            conn,
            locks,
            dispatcher,
            cancel_token,
        }
    }

    /// Runs the handler until the connection closes.
    ///
    /// The disconnect sweep at the end is unconditional: it runs whether
    /// the client said goodbye, timed out, or vanished mid-request.
    pub async fn run(mut self) {
        debug!(conn = %self.conn, "New client connected");

        if let Err(e) = self.process_requests().await {
            debug!(conn = %self.conn, error = %e, "Connection closed");
        }

        self.locks.on_disconnect(self.conn);
        self.dispatcher.on_disconnect(self.conn).await;
        info!(conn = %self.conn, "Client disconnected");
    }

    /// Main request processing loop.
    ///
    /// Per-request failures are answered on the wire and the loop
    /// continues; only transport errors end the connection. Shutdown is
    /// cooperative: cancellation is checked while waiting for the next
    /// request, never during one.
    async fn process_requests(&mut self) -> Result<(), ConnectionError> {
        let shutdown = self.cancel_token.clone();
        loop {
            let read = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(conn = %self.conn, "Host shutting down, closing connection");
                    return Ok(());
                }
                read = timeout(READ_TIMEOUT, self.read_line()) => read,
            };
            let line = match read {
                Ok(Ok(line)) => line,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(conn = %self.conn, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(conn = %self.conn, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            let response = match serde_json::from_str::<HostRequest>(&line) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => {
                    warn!(conn = %self.conn, error = %e, "Unparseable request");
                    HostResponse::error(
                        WireErrorKind::BadRequest,
                        format!("unparseable request: {e}"),
                    )
                }
            };

            self.send_response(&response).await?;
        }
    }

    async fn handle_request(&mut self, request: HostRequest) -> HostResponse {
        match request {
            HostRequest::Call {
                object,
                method,
                args,
            } => self.handle_call(&object, &method, &args).await,

            HostRequest::Lock { object, user } => {
                match self.dispatcher.descriptor(&object) {
                    None => no_such_object(&object),
                    Some(descriptor) if !descriptor.lockable => HostResponse::error(
                        WireErrorKind::BadRequest,
                        format!("object {object} is not lockable"),
                    ),
                    Some(_) => {
                        let acquired = self.locks.lock(&object, self.conn, &user);
                        HostResponse::Locked { acquired }
                    }
                }
            }

            HostRequest::Release { object } => match self.locks.release(&object, self.conn) {
                Ok(()) => HostResponse::Released,
                Err(LockError::NotHolder { .. }) => HostResponse::error(
                    WireErrorKind::NotHolder,
                    format!("object {object} is not locked by this connection"),
                ),
                Err(e) => HostResponse::error(WireErrorKind::BadRequest, e.to_string()),
            },

            HostRequest::ForceRelease { object } => {
                // Idempotent for the operator: unlocking an unlocked
                // object is a success.
                let removed = self.locks.force_release(&object);
                debug!(conn = %self.conn, object = %object, removed = removed, "Force release");
                HostResponse::Released
            }

            HostRequest::IsLocked { object } => {
                let holder = self.locks.holder(&object);
                HostResponse::LockStatus {
                    locked: holder.is_some(),
                    holder: holder.map(|r| {
                        if r.user.is_empty() {
                            r.owner.to_string()
                        } else {
                            r.user
                        }
                    }),
                }
            }

            HostRequest::Ping { seq } => HostResponse::Pong { seq },
        }
    }

    /// The call pipeline: descriptor lookup, lock guard, instance
    /// resolution, invocation.
    ///
    /// The lock guard runs before resolution, so a rejected call never
    /// constructs a session or per-call instance.
    async fn handle_call(
        &mut self,
        object: &str,
        method: &str,
        args: &serde_json::Value,
    ) -> HostResponse {
        let descriptor = match self.dispatcher.descriptor(object) {
            Some(d) => d.clone(),
            None => return no_such_object(object),
        };

        if descriptor.lockable {
            if let Err(LockError::Conflict { holder, .. }) =
                self.locks.authorize(object, self.conn)
            {
                debug!(
                    conn = %self.conn,
                    object = %object,
                    holder = %holder,
                    "Call rejected by lock guard"
                );
                return HostResponse::lock_conflict(holder);
            }
        }

        let instance = match self.dispatcher.resolve(object, self.conn).await {
            Ok(instance) => instance,
            Err(e) => {
                error!(conn = %self.conn, object = %object, error = %e, "Resolution failed");
                return service_error_response(&e);
            }
        };

        // `whoami` is answered by the host itself; it exists so tests
        // and operators can observe instancing behavior.
        let response = if method == "whoami" {
            HostResponse::result(json!({
                "object": object,
                "instance_id": instance.instance_id(),
                "connection": self.conn.as_u64(),
                "lifecycle": descriptor.lifecycle.to_string(),
            }))
        } else {
            match instance.call(method, args) {
                Ok(value) => HostResponse::result(value),
                Err(e) => {
                    // Driver failures go back to the caller; they do not
                    // take the host down.
                    warn!(
                        conn = %self.conn,
                        object = %object,
                        method = %method,
                        error = %e,
                        "Call failed"
                    );
                    service_error_response(&e)
                }
            }
        };

        if descriptor.lifecycle == Lifecycle::PerCall {
            instance.close();
        }

        response
    }

    /// Reads one request line.
    async fn read_line(&mut self) -> Result<String, ConnectionError> {
        let mut line = String::new();
        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(line)
    }

    async fn send_response(&mut self, response: &HostResponse) -> Result<(), ConnectionError> {
        let json = serde_json::to_string(response)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        match timeout(WRITE_TIMEOUT, async {
            self.writer.write_all(json.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
            self.writer.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }
}

fn no_such_object(object: &str) -> HostResponse {
    HostResponse::error(WireErrorKind::NoSuchObject, format!("no such object: {object}"))
}

fn service_error_response(err: &ServiceError) -> HostResponse {
    let kind = match err {
        ServiceError::NoSuchMethod { .. } => WireErrorKind::NoSuchMethod,
        ServiceError::BadArgs { .. } => WireErrorKind::BadRequest,
        ServiceError::UnknownImplementation { .. } => WireErrorKind::NoSuchObject,
        ServiceError::Construct { .. } | ServiceError::Driver(_) => WireErrorKind::Service,
    };
    HostResponse::error(kind, err.to_string())
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}
