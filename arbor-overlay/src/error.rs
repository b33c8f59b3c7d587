//! Typed errors for the overlay wire surface.

use std::fmt;

use thiserror::Error;

/// Errno-style error kinds carried in failed responses.
///
/// The protocol fails requests with conventional POSIX error numbers so
/// that an originator on any rank sees the same classification its local
/// tooling would produce.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Errno {
    /// Malformed payload: bad JSON or wrong shape.
    Proto,
    /// Unknown id or rank.
    NoEnt,
    /// Duplicate create.
    Exist,
    /// Invalid argument, e.g. a stale barrier sequence.
    Inval,
    /// Resource busy; retry later.
    Again,
    /// Recognized but unimplemented operation.
    NotSup,
    /// Unrecognized operation or message type.
    NoSys,
    /// Transport-level send failure.
    Io,
}

impl Errno {
    /// The conventional error number.
    pub fn code(self) -> i32 {
        match self {
            Errno::Proto => 71,
            Errno::NoEnt => 2,
            Errno::Exist => 17,
            Errno::Inval => 22,
            Errno::Again => 11,
            Errno::NotSup => 95,
            Errno::NoSys => 38,
            Errno::Io => 5,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Errno::Proto => "EPROTO",
            Errno::NoEnt => "ENOENT",
            Errno::Exist => "EEXIST",
            Errno::Inval => "EINVAL",
            Errno::Again => "EAGAIN",
            Errno::NotSup => "ENOTSUP",
            Errno::NoSys => "ENOSYS",
            Errno::Io => "EIO",
        };
        f.write_str(name)
    }
}

/// A failed response, as observed by the requester.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{errno}: {message}")]
pub struct WireError {
    /// The error kind.
    pub errno: Errno,
    /// Human-readable context from the failing node.
    pub message: String,
}

impl WireError {
    /// Build a wire error from a kind and message.
    pub fn new(errno: Errno, message: impl Into<String>) -> WireError {
        WireError {
            errno,
            message: message.into(),
        }
    }
}

/// Failure to hand a message to the transport.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The receiving endpoint is gone.
    #[error("peer endpoint is gone")]
    Closed,
    /// An upstream operation was attempted on the root.
    #[error("no upstream peer")]
    NoUpstream,
}
