//! In-memory frame connections for tests

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::{Sink, Stream};

use crate::error::{Error, Result};
use crate::frame::Frame;

/// One end of an in-memory duplex frame connection
pub(crate) struct MemorySocket {
    tx: mpsc::UnboundedSender<Result<Frame>>,
    rx: mpsc::UnboundedReceiver<Result<Frame>>,
}

/// Create two connected ends: frames sent on one are received on the other
pub(crate) fn socket_pair() -> (MemorySocket, MemorySocket) {
    let (a_tx, b_rx) = mpsc::unbounded();
    let (b_tx, a_rx) = mpsc::unbounded();
    (
        MemorySocket { tx: a_tx, rx: a_rx },
        MemorySocket { tx: b_tx, rx: b_rx },
    )
}

impl MemorySocket {
    /// Deliver a frame to the other end
    pub(crate) fn push(&self, frame: Frame) {
        let _ = self.tx.unbounded_send(Ok(frame));
    }

    /// Make the other end's next read fail
    pub(crate) fn push_error(&self, err: Error) {
        let _ = self.tx.unbounded_send(Err(err));
    }

    /// Take the next frame the other end sent, if one is already queued
    pub(crate) fn try_recv(&mut self) -> Option<Frame> {
        match self.rx.try_recv() {
            Ok(Ok(frame)) => Some(frame),
            _ => None,
        }
    }
}

impl Stream for MemorySocket {
    type Item = Result<Frame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Sink<Frame> for MemorySocket {
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        if self.tx.is_closed() {
            Poll::Ready(Err(Error::transport("memory", "peer went away")))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<()> {
        self.tx
            .unbounded_send(Ok(item))
            .map_err(|e| Error::transport("memory", e.to_string()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.tx.close_channel();
        Poll::Ready(Ok(()))
    }
}
