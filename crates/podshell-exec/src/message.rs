//! Client terminal protocol
//!
//! Every websocket text frame between the browser and the session carries one
//! JSON [`TerminalMessage`]:
//!
//! ```text
//! OP      DIRECTION  FIELD(S) USED  DESCRIPTION
//! ----------------------------------------------------------------
//! stdin   fe->be     data           Keystrokes/paste buffer
//! resize  fe->be     rows, cols     New terminal size
//! ping    fe->be                    Keepalive
//! stdout  be->fe     data           Output from the process
//! ```

use kube::api::TerminalSize;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Operation names
pub mod op {
    /// Client keystrokes
    pub const STDIN: &str = "stdin";
    /// Terminal resize
    pub const RESIZE: &str = "resize";
    /// Keepalive
    pub const PING: &str = "ping";
    /// Process output
    pub const STDOUT: &str = "stdout";
}

/// One frame of the client terminal protocol
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalMessage {
    /// Operation
    pub op: String,
    /// Payload for stdin/stdout
    pub data: String,
    /// Terminal rows for resize
    pub rows: u16,
    /// Terminal columns for resize
    pub cols: u16,
}

/// A recognised inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Bytes for the remote process
    Stdin(Vec<u8>),
    /// New terminal dimensions
    Resize {
        /// Rows
        rows: u16,
        /// Columns
        cols: u16,
    },
    /// Keepalive
    Ping,
}

/// Terminal size as the exec API expects it (width = columns, height = rows)
pub fn terminal_size(rows: u16, cols: u16) -> TerminalSize {
    TerminalSize {
        width: cols,
        height: rows,
    }
}

impl TerminalMessage {
    /// Build an outbound stdout frame
    pub fn stdout(data: impl Into<String>) -> Self {
        Self {
            op: op::STDOUT.to_string(),
            data: data.into(),
            ..Default::default()
        }
    }

    /// Parse a frame payload
    pub fn parse(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| Error::protocol(format!("malformed terminal message: {}", e)))
    }

    /// Classify an inbound message, rejecting unknown ops
    ///
    /// `stdout` is outbound only and is rejected like any other unknown op.
    pub fn into_input(self) -> Result<Input> {
        match self.op.as_str() {
            op::STDIN => Ok(Input::Stdin(self.data.into_bytes())),
            op::RESIZE => Ok(Input::Resize {
                rows: self.rows,
                cols: self.cols,
            }),
            op::PING => Ok(Input::Ping),
            other => Err(Error::protocol(format!(
                "unknown message type '{}'",
                other
            ))),
        }
    }
}
