//! Supervisor ↔ child control protocol.
//!
//! Each child process (host or nameserver) owns one dedicated message
//! channel to the supervisor: its piped stdin (requests in) and stdout
//! (events out), line-delimited JSON. The `Ready`/`Done` events are the
//! explicit acknowledgement handshake that replaces sleep-based launch
//! and shutdown timing; the supervisor still bounds every wait with a
//! timeout derived from the polling interval.

use serde::{Deserialize, Serialize};

/// Requests the supervisor writes to a child's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Cooperative shutdown sentinel. The child finishes any in-flight
    /// call, tears down registrations, emits `Done`, and exits.
    Shutdown,
}

/// Events a child writes to its stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Bootstrap complete: socket bound and every binding published.
    Ready {
        /// The (name, address) pairs this process published
        #[serde(default)]
        addresses: Vec<(String, String)>,
    },

    /// Graceful teardown complete; the process is about to exit.
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_roundtrip() {
        let line = serde_json::to_string(&ControlRequest::Shutdown).unwrap();
        assert_eq!(line, r#"{"type":"shutdown"}"#);
        let back: ControlRequest = serde_json::from_str(&line).unwrap();
        assert!(matches!(back, ControlRequest::Shutdown));
    }

    #[test]
    fn test_ready_carries_addresses() {
        let event = ControlEvent::Ready {
            addresses: vec![(
                "laser-1".to_string(),
                "/run/benchd/host-optics.sock#laser-1".to_string(),
            )],
        };
        let line = serde_json::to_string(&event).unwrap();
        let back: ControlEvent = serde_json::from_str(&line).unwrap();
        match back {
            ControlEvent::Ready { addresses } => {
                assert_eq!(addresses.len(), 1);
                assert_eq!(addresses[0].0, "laser-1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_done_roundtrip() {
        let line = serde_json::to_string(&ControlEvent::Done).unwrap();
        let back: ControlEvent = serde_json::from_str(&line).unwrap();
        assert!(matches!(back, ControlEvent::Done));
    }
}
