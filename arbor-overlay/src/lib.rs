//! The overlay transport consumed by the arbor coordination protocol.
//!
//! The coordinator core only assumes a message-passing facility between a
//! node and its parent or direct children: request/response with routable
//! envelopes, streaming responses, a no-response send mode, and
//! JSON-shaped payloads. This crate defines that contract ([`Request`],
//! [`ReplySink`], [`ResponseStream`], [`WireError`]) together with the
//! overlay [`Topology`], and provides [`TreeNet`], an in-process
//! realization over channels used by the integration tests and the demo
//! daemon.

#![deny(missing_docs)]

mod error;
mod message;
mod net;
mod topology;

pub mod topic;

pub use error::{Errno, SendError, WireError};
pub use message::{Payload, ReplySink, Request, ResponseStream, RouteId, WireResult};
pub use net::{Client, Overlay, TreeNet};
pub use topology::Topology;

pub use arbor_rankset::{Rank, RankSet};
