//! Transport-neutral websocket frames
//!
//! The client side of a session is an axum websocket and the backend side a
//! tokio-tungstenite stream. Both are adapted into `Stream<Item = Result<Frame>>
//! + Sink<Frame>` through [`FrameSocket`], so the session adapter and the relay
//! never see either library's message type.

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use axum::extract::ws as axum_ws;
use bytes::Bytes;
use futures::{Sink, Stream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungsteniteCloseFrame;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

use crate::error::{Error, Result};

/// Websocket close codes
pub mod close_code {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Reserved: no status code was present
    pub const NO_STATUS: u16 = 1005;
    /// Reserved: connection dropped without a close frame
    pub const ABNORMAL: u16 = 1006;
    /// Server hit an unexpected condition
    pub const INTERNAL_ERROR: u16 = 1011;
    /// Reserved: TLS handshake failure
    pub const TLS: u16 = 1015;
}

/// Close frame reasons must fit in a control frame (125 bytes minus the code)
const MAX_CLOSE_REASON: usize = 123;

/// Code and reason carried by a close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close code
    pub code: u16,
    /// Human readable reason
    pub reason: String,
}

impl CloseReason {
    /// Build a close reason, truncating the text to the protocol limit
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > MAX_CLOSE_REASON {
            let mut end = MAX_CLOSE_REASON;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        Self { code, reason }
    }

    /// Normal closure
    pub fn normal(reason: impl Into<String>) -> Self {
        Self::new(close_code::NORMAL, reason)
    }

    /// Closure caused by an error
    pub fn error(err: &Error) -> Self {
        Self::new(close_code::INTERNAL_ERROR, err.to_string())
    }

    /// Derive the close to forward after the peer sent `frame`
    ///
    /// Reserved codes cannot be put on the wire, so they are replaced with a
    /// normal closure.
    pub fn forwarded(frame: Option<&CloseReason>) -> Self {
        match frame {
            Some(frame) if is_sendable(frame.code) => frame.clone(),
            Some(frame) => Self::normal(frame.reason.clone()),
            None => Self::normal(""),
        }
    }
}

fn is_sendable(code: u16) -> bool {
    (1000..5000).contains(&code)
        && !matches!(
            code,
            close_code::NO_STATUS | close_code::ABNORMAL | close_code::TLS
        )
}

/// One websocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text message
    Text(String),
    /// Binary message
    Binary(Bytes),
    /// Ping control frame
    Ping(Bytes),
    /// Pong control frame
    Pong(Bytes),
    /// Close control frame
    Close(Option<CloseReason>),
}

impl Frame {
    /// Build a close frame
    pub fn close(reason: CloseReason) -> Self {
        Self::Close(Some(reason))
    }
}

/// A websocket library message type that maps onto [`Frame`]
pub trait WireMessage: Sized {
    /// Convert into a frame; `None` for messages with no frame equivalent
    fn into_frame(self) -> Option<Frame>;

    /// Convert from a frame
    fn from_frame(frame: Frame) -> Self;
}

impl WireMessage for axum_ws::Message {
    fn into_frame(self) -> Option<Frame> {
        Some(match self {
            Self::Text(text) => Frame::Text(text.as_str().to_owned()),
            Self::Binary(data) => Frame::Binary(data),
            Self::Ping(data) => Frame::Ping(data),
            Self::Pong(data) => Frame::Pong(data),
            Self::Close(frame) => Frame::Close(frame.map(|f| CloseReason {
                code: f.code,
                reason: f.reason.as_str().to_owned(),
            })),
        })
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Self::Text(text.into()),
            Frame::Binary(data) => Self::Binary(data),
            Frame::Ping(data) => Self::Ping(data),
            Frame::Pong(data) => Self::Pong(data),
            Frame::Close(reason) => Self::Close(reason.map(|r| axum_ws::CloseFrame {
                code: r.code,
                reason: r.reason.into(),
            })),
        }
    }
}

impl WireMessage for TungsteniteMessage {
    fn into_frame(self) -> Option<Frame> {
        match self {
            Self::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
            Self::Binary(data) => Some(Frame::Binary(data)),
            Self::Ping(data) => Some(Frame::Ping(data)),
            Self::Pong(data) => Some(Frame::Pong(data)),
            Self::Close(frame) => Some(Frame::Close(frame.map(|f| CloseReason {
                code: u16::from(f.code),
                reason: f.reason.as_str().to_owned(),
            }))),
            // Raw frames only surface when writing, never from a read
            Self::Frame(_) => None,
        }
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Self::Text(text.into()),
            Frame::Binary(data) => Self::Binary(data),
            Frame::Ping(data) => Self::Ping(data),
            Frame::Pong(data) => Self::Pong(data),
            Frame::Close(reason) => Self::Close(reason.map(|r| TungsteniteCloseFrame {
                code: CloseCode::from(r.code),
                reason: r.reason.into(),
            })),
        }
    }
}

/// A websocket connection exposed as a stream and sink of [`Frame`]s
pub struct FrameSocket<S, M> {
    inner: S,
    _message: PhantomData<fn() -> M>,
}

impl<S, M> FrameSocket<S, M> {
    /// Wrap a websocket
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            _message: PhantomData,
        }
    }

    /// Unwrap the websocket
    pub fn into_inner(self) -> S {
        self.inner
    }
}

/// Client-facing websocket accepted through axum
pub type ClientSocket = FrameSocket<axum_ws::WebSocket, axum_ws::Message>;

impl<S, M, E> Stream for FrameSocket<S, M>
where
    S: Stream<Item = std::result::Result<M, E>> + Unpin,
    M: WireMessage,
    E: Into<Error>,
{
    type Item = Result<Frame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(message)) => {
                    if let Some(frame) = message.into_frame() {
                        return Poll::Ready(Some(Ok(frame)));
                    }
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(e.into()))),
                None => return Poll::Ready(None),
            }
        }
    }
}

impl<S, M> Sink<Frame> for FrameSocket<S, M>
where
    S: Sink<M> + Unpin,
    S::Error: Into<Error>,
    M: WireMessage,
{
    type Error = Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.inner).poll_ready(cx).map_err(Into::into)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Frame) -> Result<()> {
        Pin::new(&mut self.inner)
            .start_send(M::from_frame(item))
            .map_err(Into::into)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(Into::into)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(Into::into)
    }
}

/// A duplex frame connection that can be moved into a spawned task
pub trait FrameConnection:
    Stream<Item = Result<Frame>> + Sink<Frame, Error = Error> + Send + Unpin + 'static
{
}

impl<T> FrameConnection for T where
    T: Stream<Item = Result<Frame>> + Sink<Frame, Error = Error> + Send + Unpin + 'static
{
}
