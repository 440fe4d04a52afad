//! benchd - Resource access control and process supervision
//!
//! This crate provides the daemon infrastructure for hosting shared lab
//! instruments as remotely callable objects:
//! - `lock` - exclusive, connection-scoped access control
//! - `dispatch` - handler instancing under the three lifecycle policies
//! - `host` - child process serving one set of registered services
//! - `nameserver` - child process resolving names to addresses
//! - `supervisor` - main-process controller launching, monitoring, and
//!   restarting the children
//! - `ctl` - operator control socket of the main process
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ main process                                                 │
//! │  ┌────────────────┐   commands    ┌───────────────────────┐  │
//! │  │  CtlServer     │──────────────▶│   SupervisorActor     │  │
//! │  │ (control sock) │               │ (ProcessGroup owner)  │  │
//! │  └────────────────┘               └──────────┬────────────┘  │
//! └──────────────────────────────────────────────┼───────────────┘
//!                               stdio control    │ spawn/kill
//!                 ┌──────────────────────────────┼──────────────┐
//!                 ▼                              ▼              │
//!        ┌─────────────────┐            ┌─────────────────┐     │
//!        │ HostProcess     │  register  │ Nameserver      │     │
//!        │ locks+dispatch  │───────────▶│ name → address  │     │
//!        └─────────────────┘            └─────────────────┘     │
//! ```
//!
//! All production code follows the panic-free policy: no `.unwrap()`,
//! `.expect()`, `panic!()`, `unreachable!()`, `todo!()`.

pub mod child;
pub mod ctl;
pub mod dispatch;
pub mod host;
pub mod lock;
pub mod nameserver;
pub mod supervisor;
