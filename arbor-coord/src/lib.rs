//! The arbor coordination protocol core.
//!
//! Every rank of the overlay runs one [`Coordinator`]: a single-threaded
//! cooperative reactor that drives the lifecycle of parallel jobs spanning
//! arbitrary subsets of ranks. Launch requests fan out from the root to
//! exactly the ranks hosting a job, each hosting rank runs a per-rank task
//! through a local [`Executor`](executor::Executor), and startup,
//! completion, and barrier state aggregate back up the tree. Signals and
//! exceptions flow in the opposite direction.
//!
//! The downward path rides the hello protocol: a child attaches to its
//! parent with a streaming `derp.hello` request and receives typed state
//! updates addressed by rank set; updates for a child that has not yet
//! attached are buffered and flushed on connect, so a late joiner
//! resynchronizes before any new traffic flows. The upward path is
//! `derp.notify`, fire-and-forget except for barrier entry, whose reply
//! releases the sender's barrier.

pub mod executor;

mod barrier;
mod coordinator;
mod exec;
mod hello;
mod job;
mod peer;
mod ping;
mod wire;

pub use coordinator::{Config, Coordinator, RunError};
pub use job::{Job, JobTable};
pub use wire::JobId;

pub use arbor_overlay::{topic, Errno, Overlay, Payload, Request, WireError};
pub use arbor_rankset::{Rank, RankSet};
