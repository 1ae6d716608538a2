//! Terminal websocket handler
//!
//! `GET /exec?namespace=&pod=&container=&shell=[&executor=]`
//!
//! The target is validated before the upgrade so that a bad request or an
//! ineligible container is answered with a plain HTTP error rather than a
//! websocket that closes immediately.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, info, warn};

use podshell_exec::{ClientSocket, ExecOptions, ExecTarget, ExecutorKind, Session};

use crate::error::{Error, Result};
use crate::server::AppState;

/// Query parameters of an exec request
#[derive(Debug, Default, Deserialize)]
pub struct ExecQuery {
    /// Namespace of the pod
    pub namespace: Option<String>,
    /// Name of the pod
    pub pod: Option<String>,
    /// Container to exec into
    pub container: Option<String>,
    /// Shell (or other command) to run
    pub shell: Option<String>,
    /// Executor override: `websocket`, `multiplexed` or `spdy`
    pub executor: Option<String>,
}

impl ExecQuery {
    /// Validate the parameters into an exec target and options
    pub fn into_request(
        self,
        default_executor: Option<ExecutorKind>,
    ) -> Result<(ExecTarget, ExecOptions)> {
        let executor = match self.executor.as_deref().filter(|e| !e.is_empty()) {
            Some(executor) => Some(
                executor
                    .parse::<ExecutorKind>()
                    .map_err(|e| Error::BadRequest(e.to_string()))?,
            ),
            None => default_executor,
        };

        let target = ExecTarget {
            namespace: required(self.namespace, "namespace")?,
            pod: required(self.pod, "pod")?,
            container: required(self.container, "container")?,
            command: vec![required(self.shell, "shell")?],
        };
        let opts = ExecOptions {
            executor,
            ..Default::default()
        };
        Ok((target, opts))
    }
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::BadRequest(format!("missing query parameter '{}'", name)))
}

/// Subprotocols the client offered, in its order of preference
fn requested_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Validate the target, then upgrade and run the terminal session
pub async fn exec_handler(
    State(state): State<AppState>,
    Query(query): Query<ExecQuery>,
    headers: HeaderMap,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response> {
    let (target, opts) = query.into_request(state.default_executor)?;

    state
        .gate
        .validate(&target.namespace, &target.pod, &target.container)
        .await?;

    let ws = ws.map_err(|e| Error::BadRequest(format!("websocket upgrade required: {}", e)))?;

    // Accept whatever the client asked for; the first offer wins and is
    // forwarded to the API server on the raw relay path
    let protocols = requested_protocols(&headers);
    let exec = state.exec.clone();

    Ok(ws
        .protocols(protocols)
        .on_failed_upgrade(|e| warn!(error = %e, "terminal websocket upgrade failed"))
        .on_upgrade(move |socket| run_session(socket, exec, target, opts))
        .into_response())
}

async fn run_session(
    socket: WebSocket,
    exec: podshell_exec::TerminalExec,
    target: ExecTarget,
    opts: ExecOptions,
) {
    let subprotocol = socket
        .protocol()
        .and_then(|p| p.to_str().ok())
        .map(str::to_string);
    info!(
        namespace = %target.namespace,
        pod = %target.pod,
        container = %target.container,
        subprotocol = ?subprotocol,
        "terminal websocket established"
    );

    let session = Session::new(ClientSocket::new(socket)).with_subprotocol(subprotocol);
    if let Err(e) = exec.exec(session, &target, &opts).await {
        debug!(error = %e, "terminal session failed");
    }
}
