//! Requests, reply sinks, and response streams.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::{Errno, SendError, WireError};

/// JSON-shaped message payload.
pub type Payload = serde_json::Value;

/// The outcome of one response: a payload, or a typed failure.
pub type WireResult = Result<Payload, WireError>;

/// Opaque routing token identifying the link a request arrived on.
///
/// Two requests from the same endpoint over the same connection carry the
/// same token; the peer table matches disconnects against it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RouteId(u64);

impl RouteId {
    /// Build a token from a raw value. Harness surface: real tokens are
    /// allocated by the transport.
    pub fn from_raw(raw: u64) -> RouteId {
        RouteId(raw)
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "route:{}", self.0)
    }
}

static NEXT_MSGID: AtomicU64 = AtomicU64::new(1);

/// A request delivered to a node.
///
/// Requests are reference-counted by the receiver (`Arc<Request>`):
/// handlers that cannot answer immediately pin the request (peer hello
/// requests, barrier FIFOs, originating start requests) and respond later,
/// possibly more than once on a streaming request.
#[derive(Debug)]
pub struct Request {
    /// The request topic, e.g. `derp.hello`.
    pub topic: String,
    /// The JSON payload.
    pub payload: Payload,
    /// The link the request arrived on.
    pub route: RouteId,
    /// Unique id of this message within the process.
    pub msgid: u64,
    sink: ReplySink,
}

impl Request {
    /// Build a request. The transport and test harnesses construct
    /// requests; protocol code only receives them.
    pub fn new(topic: impl Into<String>, payload: Payload, route: RouteId, sink: ReplySink) -> Request {
        Request {
            topic: topic.into(),
            payload,
            route,
            msgid: NEXT_MSGID.fetch_add(1, Ordering::Relaxed),
            sink,
        }
    }

    /// Send one response to the requester.
    ///
    /// On a streaming request this may be called repeatedly; on a
    /// no-response request the payload is discarded.
    pub fn respond(&self, payload: Payload) -> Result<(), SendError> {
        self.sink.send(Ok(payload))
    }

    /// Fail the request with an errno-kinded error.
    pub fn respond_err(&self, errno: Errno, message: impl Into<String>) -> Result<(), SendError> {
        self.sink.send(Err(WireError::new(errno, message)))
    }
}

/// The reply side of a request.
#[derive(Clone, Debug)]
pub struct ReplySink(Option<mpsc::UnboundedSender<WireResult>>);

impl ReplySink {
    /// A sink that discards responses: the no-response send mode.
    pub fn none() -> ReplySink {
        ReplySink(None)
    }

    /// A sink feeding a [`ResponseStream`] held by the requester.
    pub fn stream() -> (ReplySink, ResponseStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ReplySink(Some(tx)), ResponseStream { rx })
    }

    fn send(&self, result: WireResult) -> Result<(), SendError> {
        match &self.0 {
            Some(tx) => tx.send(result).map_err(|_| SendError::Closed),
            None => Ok(()),
        }
    }
}

/// The requester's view of a (possibly streaming) response.
#[derive(Debug)]
pub struct ResponseStream {
    rx: mpsc::UnboundedReceiver<WireResult>,
}

impl ResponseStream {
    /// The next response, or `None` once the responder is gone.
    pub async fn recv(&mut self) -> Option<WireResult> {
        self.rx.recv().await
    }

    /// Await a single reply on a one-shot request.
    ///
    /// A responder that goes away without answering reports `EIO`.
    pub async fn into_reply(mut self) -> WireResult {
        match self.recv().await {
            Some(result) => result,
            None => Err(WireError::new(Errno::Io, "responder went away")),
        }
    }
}

impl Stream for ResponseStream {
    type Item = WireResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
