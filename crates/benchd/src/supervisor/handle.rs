//! Client interface for interacting with the supervisor actor.
//!
//! `SupervisorHandle` is a cheap-to-clone handle shared by the control
//! socket server and the signal handlers. All methods communicate with
//! the actor via channels; channel errors are mapped to
//! `SupervisorError::ChannelClosed`.

use bench_protocol::{EntityKind, EntityStatus};
use tokio::sync::{mpsc, oneshot};

use super::commands::{SupervisorCommand, SupervisorError};

/// Handle for interacting with the supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    sender: mpsc::Sender<SupervisorCommand>,
}

impl SupervisorHandle {
    pub fn new(sender: mpsc::Sender<SupervisorCommand>) -> Self {
        Self { sender }
    }

    /// Launches a configured entity and waits for its ready handshake.
    pub async fn launch(&self, kind: EntityKind, name: &str) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorCommand::Launch {
                kind,
                name: name.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| SupervisorError::ChannelClosed)?;
        rx.await.map_err(|_| SupervisorError::ChannelClosed)?
    }

    /// Gracefully stops a running entity.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorCommand::Stop {
                name: name.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| SupervisorError::ChannelClosed)?;
        rx.await.map_err(|_| SupervisorError::ChannelClosed)?
    }

    /// Reports every tracked entity.
    ///
    /// Returns an empty list if the actor has shut down.
    pub async fn status(&self) -> Vec<EntityStatus> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SupervisorCommand::Status { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Re-reads configuration and restarts the running set under it.
    pub async fn reload(&self) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorCommand::Reload { respond_to: tx })
            .await
            .map_err(|_| SupervisorError::ChannelClosed)?;
        rx.await.map_err(|_| SupervisorError::ChannelClosed)?
    }

    /// Stops everything, daemons before nameservers. Waits until every
    /// child has been drained.
    pub async fn shutdown_all(&self) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorCommand::ShutdownAll { respond_to: tx })
            .await
            .map_err(|_| SupervisorError::ChannelClosed)?;
        rx.await.map_err(|_| SupervisorError::ChannelClosed)
    }

    /// Whether the actor is still running.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_handle() -> (SupervisorHandle, mpsc::Receiver<SupervisorCommand>) {
        let (tx, rx) = mpsc::channel(16);
        (SupervisorHandle::new(tx), rx)
    }

    #[tokio::test]
    async fn test_launch_sends_command() {
        let (handle, mut rx) = create_test_handle();

        let responder = tokio::spawn(async move {
            if let Some(SupervisorCommand::Launch {
                kind,
                name,
                respond_to,
            }) = rx.recv().await
            {
                assert_eq!(kind, EntityKind::Daemon);
                assert_eq!(name, "optics");
                let _ = respond_to.send(Ok(()));
                return true;
            }
            false
        });

        let result = handle.launch(EntityKind::Daemon, "optics").await;
        assert!(result.is_ok());
        assert!(responder.await.unwrap());
    }

    #[tokio::test]
    async fn test_channel_closed_error() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        let result = handle.stop("optics").await;
        assert!(matches!(result, Err(SupervisorError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_status_empty_on_closed_channel() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        assert!(handle.status().await.is_empty());
    }
}
