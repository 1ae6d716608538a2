//! Bidirectional frame relay
//!
//! Used when the client's terminal talks the API server's channel protocol
//! directly: frames are copied verbatim in both directions until either side
//! ends.
//!
//! ```text
//!            client_to_backend
//!   client  ------------------->  backend
//!           <-------------------
//!            backend_to_client
//!
//!   each direction --(Direction, Result)--> outcomes (cap 2) --> supervisor
//! ```
//!
//! When a reading side ends, the task that read it closes the opposite side
//! and reports. The supervisor fires the terminator on the first report,
//! gives the other direction a grace period to close its own sink, then
//! aborts whatever is left.

use std::fmt;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::frame::{CloseReason, Frame, FrameConnection};
use crate::terminate::Terminator;

/// Time the second direction gets to finish after the first one ended
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Relay settings
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Frame sent to the backend just before it is closed
    pub farewell: Option<Frame>,
    /// Session termination signal, fired when either direction ends
    pub terminator: Terminator,
    /// How long to wait for the second direction after the first ended
    pub close_grace: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            farewell: None,
            terminator: Terminator::new(),
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

/// Which way a copy task moves frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client reads, backend writes
    ClientToBackend,
    /// Backend reads, client writes
    BackendToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToBackend => write!(f, "client_to_backend"),
            Self::BackendToClient => write!(f, "backend_to_client"),
        }
    }
}

type Outcome = (Direction, Result<()>);

/// Copy frames between `client` and `backend` until either ends
///
/// Returns the first error either direction reported, or `Ok` if both ended
/// cleanly or the session was terminated from outside.
pub async fn relay<C, B>(client: C, backend: B, options: RelayOptions) -> Result<()>
where
    C: FrameConnection,
    B: FrameConnection,
{
    let RelayOptions {
        farewell,
        terminator,
        close_grace,
    } = options;

    let (client_sink, client_stream) = client.split();
    let (backend_sink, backend_stream) = backend.split();

    // One slot per direction, so neither report can block
    let (outcome_tx, mut outcome_rx) = mpsc::channel::<Outcome>(2);

    let upstream = tokio::spawn(copy_frames(
        Direction::ClientToBackend,
        client_stream,
        backend_sink,
        farewell,
        terminator.clone(),
        outcome_tx.clone(),
    ));
    let downstream = tokio::spawn(copy_frames(
        Direction::BackendToClient,
        backend_stream,
        client_sink,
        None,
        terminator.clone(),
        outcome_tx,
    ));

    let first = tokio::select! {
        outcome = outcome_rx.recv() => outcome,
        _ = terminator.terminated() => None,
    };
    terminator.terminate();

    let mut result = Ok(());
    let mut pending = 2;
    if let Some(outcome) = first {
        pending -= 1;
        record(outcome, &mut result);
    }

    let drain = async {
        while pending > 0 {
            match outcome_rx.recv().await {
                Some(outcome) => {
                    pending -= 1;
                    record(outcome, &mut result);
                }
                None => break,
            }
        }
    };
    if tokio::time::timeout(close_grace, drain).await.is_err() {
        warn!(grace = ?close_grace, "relay direction did not stop in time, aborting");
    }

    upstream.abort();
    downstream.abort();
    result
}

/// Keep the first error
fn record((direction, outcome): Outcome, result: &mut Result<()>) {
    match outcome {
        Ok(()) => debug!(%direction, "relay direction finished"),
        Err(e) => {
            debug!(%direction, error = %e, "relay direction failed");
            if result.is_ok() {
                *result = Err(e);
            }
        }
    }
}

async fn copy_frames<R, W>(
    direction: Direction,
    mut source: R,
    mut sink: W,
    farewell: Option<Frame>,
    terminator: Terminator,
    outcomes: mpsc::Sender<Outcome>,
) where
    R: Stream<Item = Result<Frame>> + Unpin,
    W: Sink<Frame, Error = Error> + Unpin,
{
    let outcome = pump(direction, &mut source, &mut sink, farewell, &terminator).await;
    if outcomes.try_send((direction, outcome)).is_err() {
        debug!(%direction, "relay supervisor gone, dropping outcome");
    }
}

async fn pump<R, W>(
    direction: Direction,
    source: &mut R,
    sink: &mut W,
    farewell: Option<Frame>,
    terminator: &Terminator,
) -> Result<()>
where
    R: Stream<Item = Result<Frame>> + Unpin,
    W: Sink<Frame, Error = Error> + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = terminator.terminated() => {
                if let Err(e) = finish(direction, sink, farewell, CloseReason::normal("")).await {
                    debug!(%direction, error = %e, "close after termination failed");
                }
                return Ok(());
            }
            next = source.next() => next,
        };

        match next {
            Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => {}
            Some(Ok(Frame::Close(reason))) => {
                debug!(%direction, reason = ?reason, "peer closed");
                return finish(direction, sink, farewell, CloseReason::forwarded(reason.as_ref()))
                    .await;
            }
            Some(Ok(frame)) => sink.send(frame).await?,
            Some(Err(e)) => {
                warn!(%direction, error = %e, "relay read failed");
                if let Err(close_err) = finish(direction, sink, farewell, CloseReason::error(&e)).await
                {
                    warn!(%direction, error = %close_err, "failed to send close frame");
                }
                return Err(e);
            }
            None => {
                debug!(%direction, "peer went away");
                return finish(direction, sink, farewell, CloseReason::normal("")).await;
            }
        }
    }
}

/// Send the farewell (best effort), then the close frame
async fn finish<W>(
    direction: Direction,
    sink: &mut W,
    farewell: Option<Frame>,
    reason: CloseReason,
) -> Result<()>
where
    W: Sink<Frame, Error = Error> + Unpin,
{
    if let Some(frame) = farewell {
        if let Err(e) = sink.send(frame).await {
            warn!(%direction, error = %e, "failed to send exit to backend");
        }
    }
    sink.send(Frame::close(reason)).await?;
    if let Err(e) = sink.close().await {
        debug!(%direction, error = %e, "failed to shut down sink after close frame");
    }
    Ok(())
}
