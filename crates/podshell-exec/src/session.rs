//! Terminal session adapter
//!
//! Wraps the client websocket and exposes what a backend executor needs:
//! a byte-oriented read (stdin), a byte-oriented write (stdout) and a queue
//! of terminal sizes. Internally it speaks the JSON [`TerminalMessage`]
//! protocol.
//!
//! A [`Session`] is split into three halves so each can be owned by its own
//! task:
//!
//! - [`SessionReader`] consumes client frames and publishes resizes
//! - [`SessionWriter`] wraps process output into `stdout` frames
//! - [`SizeQueue`] hands out the latest terminal size

use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use kube::api::TerminalSize;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::frame::{CloseReason, Frame, FrameConnection};
use crate::message::{terminal_size, Input, TerminalMessage};
use crate::terminate::Terminator;

/// Ctrl-D, delivered to the process when the client side of the session fails
pub const END_OF_TRANSMISSION: &[u8] = b"\x04";

/// One interactive exec attachment, owning the client connection
pub struct Session<C> {
    conn: C,
    subprotocol: Option<String>,
    terminator: Terminator,
}

impl<C: FrameConnection> Session<C> {
    /// Create a session around an upgraded client connection
    pub fn new(conn: C) -> Self {
        Self {
            conn,
            subprotocol: None,
            terminator: Terminator::new(),
        }
    }

    /// Record the subprotocol negotiated with the client
    pub fn with_subprotocol(mut self, subprotocol: Option<String>) -> Self {
        self.subprotocol = subprotocol;
        self
    }

    /// Subprotocol negotiated with the client, if any
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Handle to this session's termination signal
    pub fn terminator(&self) -> Terminator {
        self.terminator.clone()
    }

    /// Split into reader, writer and size queue for the multiplexed path
    pub fn split(
        self,
    ) -> (
        SessionReader<SplitStream<C>>,
        SessionWriter<SplitSink<C, Frame>>,
        SizeQueue,
    ) {
        let (sink, stream) = self.conn.split();
        let (sizes_tx, sizes_rx) = watch::channel(None);
        (
            SessionReader {
                stream,
                sizes: sizes_tx,
                terminator: self.terminator.clone(),
            },
            SessionWriter {
                sink,
                pending: Vec::new(),
                terminator: self.terminator.clone(),
            },
            SizeQueue {
                sizes: sizes_rx,
                terminator: self.terminator,
            },
        )
    }

    /// Give up the adapter and return the raw connection for relaying
    pub fn into_parts(self) -> (C, Terminator) {
        (self.conn, self.terminator)
    }
}

/// Reading half of a session
pub struct SessionReader<R> {
    stream: R,
    /// Latest (rows, cols)
    sizes: watch::Sender<Option<(u16, u16)>>,
    terminator: Terminator,
}

impl<R> SessionReader<R>
where
    R: Stream<Item = Result<Frame>> + Unpin,
{
    /// Read the next client frame, appending any stdin bytes to `buf`
    ///
    /// Returns the number of bytes appended. Resize and ping frames append
    /// nothing and return `Ok(0)`. On any failure [`END_OF_TRANSMISSION`] is
    /// appended before the error is returned, and the caller should still
    /// deliver `buf` to the process.
    pub async fn read(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        match self.next_input().await {
            Ok(Some(Input::Stdin(data))) => {
                buf.extend_from_slice(&data);
                Ok(data.len())
            }
            Ok(Some(Input::Resize { rows, cols })) => {
                trace!(rows, cols, "resize container terminal");
                self.sizes.send_replace(Some((rows, cols)));
                Ok(0)
            }
            Ok(Some(Input::Ping)) | Ok(None) => Ok(0),
            Err(e) => {
                buf.extend_from_slice(END_OF_TRANSMISSION);
                if e.is_protocol() {
                    warn!(error = %e, "terminating session on protocol error");
                    self.terminator.terminate();
                }
                Err(e)
            }
        }
    }

    /// `Ok(None)` for frames that carry no terminal input
    async fn next_input(&mut self) -> Result<Option<Input>> {
        if self.terminator.is_terminated() {
            return Err(Error::SessionTerminated);
        }

        let payload = match self.stream.next().await {
            Some(Ok(Frame::Text(text))) => text.into_bytes(),
            Some(Ok(Frame::Binary(data))) => data.to_vec(),
            Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => return Ok(None),
            Some(Ok(Frame::Close(reason))) => {
                debug!(reason = ?reason, "client closed terminal connection");
                return Err(Error::ClientClosed);
            }
            Some(Err(e)) => {
                warn!(error = %e, "read message err");
                return Err(e);
            }
            None => return Err(Error::ClientClosed),
        };

        TerminalMessage::parse(&payload)?.into_input().map(Some)
    }
}

/// Writing half of a session
pub struct SessionWriter<W> {
    sink: W,
    /// Trailing bytes of a UTF-8 sequence split across writes
    pending: Vec<u8>,
    terminator: Terminator,
}

impl<W> SessionWriter<W>
where
    W: Sink<Frame, Error = Error> + Unpin,
{
    /// Send process output to the client as a `stdout` frame
    ///
    /// A send failure is terminal for the session.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.terminator.is_terminated() {
            return Err(Error::SessionTerminated);
        }

        let text = self.take_text(data);
        if text.is_empty() {
            return Ok(data.len());
        }

        let msg = serde_json::to_string(&TerminalMessage::stdout(text))?;
        if let Err(e) = self.sink.send(Frame::Text(msg)).await {
            warn!(error = %e, "write message err");
            return Err(e);
        }
        Ok(data.len())
    }

    /// Send a close frame and shut the client connection
    ///
    /// Closing the connection does not terminate the session.
    pub async fn close(&mut self, reason: CloseReason) -> Result<()> {
        self.sink.send(Frame::close(reason)).await?;
        self.sink.close().await
    }

    /// Decode as much of `pending + data` as possible, carrying an incomplete
    /// trailing sequence over to the next write
    fn take_text(&mut self, data: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(data);

        let mut text = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[len..];
                        }
                        None => {
                            self.pending = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        text
    }
}

/// Source of terminal sizes for the backend executor
pub struct SizeQueue {
    sizes: watch::Receiver<Option<(u16, u16)>>,
    terminator: Terminator,
}

impl SizeQueue {
    /// Wait for a size newer than the last one returned
    ///
    /// Returns `None` once the session is terminated or the reader is gone;
    /// the executor should stop watching for resizes then.
    pub async fn next_size(&mut self) -> Option<TerminalSize> {
        loop {
            tokio::select! {
                biased;
                _ = self.terminator.terminated() => return None,
                changed = self.sizes.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    let latest = *self.sizes.borrow_and_update();
                    if let Some((rows, cols)) = latest {
                        return Some(terminal_size(rows, cols));
                    }
                }
            }
        }
    }
}
