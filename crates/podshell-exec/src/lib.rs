//! Terminal sessions bridged onto Kubernetes pod exec
//!
//! Attaches an interactive terminal in a browser (or any websocket client) to
//! a container of a running pod.
//!
//! # Architecture
//!
//! ```text
//! client ws ──► Session ──┬─► RawRelay:    Upgrader ──► backend ws ◄─► relay
//!                         └─► Multiplexed: kube-rs AttachedProcess
//!                                          stdin / stdout / resize pumps
//! ```
//!
//! - [`ExecGate`] checks the target before any connection is opened
//! - [`Session`] speaks the JSON terminal protocol with the client
//! - [`Upgrader`] dials the API server with the kubeconfig's credentials
//! - [`relay`] copies frames both ways and tears both sides down together
//! - [`TerminalExec`] picks the transport and runs the session

#![deny(missing_docs)]

pub mod error;
pub mod exec;
pub mod frame;
pub mod gate;
pub mod message;
pub mod relay;
pub mod session;
pub mod terminate;
pub mod upgrade;

#[cfg(test)]
mod testing;

pub use error::{EligibilityError, Error, Result};
pub use exec::{ExecOptions, ExecTarget, ExecutorKind, TerminalExec, Transport};
pub use frame::{ClientSocket, CloseReason, Frame, FrameConnection, FrameSocket};
pub use gate::{ContainerState, ExecGate, KubePodStatusSource, PodSnapshot, PodStatusSource};
pub use message::TerminalMessage;
pub use relay::{relay, RelayOptions};
pub use session::Session;
pub use terminate::Terminator;
pub use upgrade::{BackendConnection, UpgradeOptions, Upgrader};
