//! Bench Protocol - Wire types for benchd communication
//!
//! Four channels, all line-delimited JSON:
//! - `message` - client ↔ host RPC and client ↔ nameserver requests
//! - `control` - supervisor ↔ child process control over piped stdio
//! - `ctl` - operator CLI ↔ supervisor over the control socket

pub mod control;
pub mod ctl;
pub mod message;

pub use control::{ControlEvent, ControlRequest};
pub use ctl::{CtlRequest, CtlResponse, EntityKind, EntityStatus};
pub use message::{HostRequest, HostResponse, NsErrorKind, NsRequest, NsResponse, WireErrorKind};
