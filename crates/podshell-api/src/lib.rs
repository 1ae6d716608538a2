//! HTTP and websocket surface of podshell
//!
//! Serves `GET /exec` (terminal websocket), `GET /healthz` and, optionally,
//! a static frontend. Sessions themselves are driven by `podshell_exec`.

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;
pub mod telemetry;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use server::{router, run, AppState};
pub use telemetry::init_tracing;
