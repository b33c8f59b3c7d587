//! The per-rank coordinator reactor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use metrics::counter;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

use arbor_overlay::{topic, Errno, Overlay, Payload, Request, SendError, WireError, WireResult};
use arbor_rankset::{Rank, RankSet};

use crate::exec;
use crate::executor::{Executor, TaskEvent};
use crate::hello::{HelloResponder, StateMessage};
use crate::job::JobTable;
use crate::peer::PeerTable;
use crate::ping::{self, ActivePing};
use crate::wire::{Action, HelloReply, JobId, Notify};

/// Coordinator tunables.
#[derive(Clone, Debug)]
pub struct Config {
    /// The job-shell program run for each hosted job.
    pub job_shell: PathBuf,
    /// How long the hello responder coalesces state updates before
    /// flushing them downstream.
    pub flush_interval: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            job_shell: PathBuf::from("arbor-job-shell"),
            flush_interval: Duration::from_millis(20),
        }
    }
}

/// The coordinator stopped abnormally.
#[derive(Debug, Error)]
pub enum RunError {
    /// The streaming hello to the parent ended; without it this node can
    /// no longer receive state updates.
    #[error("upstream hello stream closed")]
    UpstreamLost,
    /// The parent link failed outright.
    #[error("failed to reach upstream: {0}")]
    Upstream(#[from] SendError),
}

/// What woke the reactor.
enum Wake {
    Inbound(Option<Arc<Request>>),
    Hello(Option<WireResult>),
    Release((JobId, u64, WireResult)),
    Task(Option<TaskEvent>),
    Flush,
}

/// One rank's protocol engine.
///
/// Single-threaded cooperative: the reactor dispatches one callback at a
/// time over message arrivals, timer expirations, and task lifecycle
/// events, so handlers observe all coordinator state atomically. Handlers
/// never block; work spanning an RPC is carried by a pinned request or a
/// queued continuation.
pub struct Coordinator<E: Executor> {
    pub(crate) rank: Rank,
    /// The local rank plus every descendant.
    pub(crate) coverage: RankSet,
    pub(crate) overlay: Overlay,
    pub(crate) peers: PeerTable,
    pub(crate) responder: HelloResponder,
    pub(crate) jobs: JobTable,
    pub(crate) ping: Option<ActivePing>,
    pub(crate) executor: E,
    pub(crate) config: Config,
    /// Pending barrier-release continuations: one per outstanding
    /// upstream barrier-enter notify.
    pub(crate) releases: FuturesUnordered<BoxFuture<'static, (JobId, u64, WireResult)>>,
    flush_at: Option<Instant>,
    events: mpsc::UnboundedReceiver<TaskEvent>,
    hello: Option<arbor_overlay::ResponseStream>,
}

impl<E: Executor> Coordinator<E> {
    /// Build the coordinator for `overlay`'s rank.
    ///
    /// `events` is the receiving end of the channel `executor` reports
    /// task lifecycle on.
    pub fn new(
        overlay: Overlay,
        executor: E,
        events: mpsc::UnboundedReceiver<TaskEvent>,
        config: Config,
    ) -> Coordinator<E> {
        let rank = overlay.rank();
        let peers = PeerTable::new(overlay.topology());
        let mut coverage = peers.descendants().clone();
        coverage.insert(rank);
        Coordinator {
            rank,
            coverage,
            overlay,
            peers,
            responder: HelloResponder::new(),
            jobs: JobTable::new(),
            ping: None,
            executor,
            config,
            releases: FuturesUnordered::new(),
            flush_at: None,
            events,
            hello: None,
        }
    }

    /// Drive the protocol until the overlay closes.
    pub async fn run(mut self) -> Result<(), RunError> {
        info!(
            rank = self.rank,
            size = self.overlay.size(),
            coverage = %self.coverage,
            "coordinator starting"
        );
        self.send_hello()?;

        loop {
            let flush_armed = self.flush_at.is_some();
            let deadline = self
                .flush_at
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(60));
            let has_hello = self.hello.is_some();
            let has_releases = !self.releases.is_empty();

            let wake = tokio::select! {
                request = self.overlay.recv() => Wake::Inbound(request),
                reply = hello_next(&mut self.hello), if has_hello => Wake::Hello(reply),
                Some(release) = self.releases.next(), if has_releases => Wake::Release(release),
                event = self.events.recv() => Wake::Task(event),
                _ = time::sleep_until(deadline), if flush_armed => Wake::Flush,
            };

            match wake {
                Wake::Inbound(Some(request)) => self.handle_request(request),
                Wake::Inbound(None) => {
                    debug!(rank = self.rank, "overlay closed, shutting down");
                    return Ok(());
                }
                Wake::Hello(Some(reply)) => self.handle_hello_reply(reply),
                Wake::Hello(None) => {
                    warn!(rank = self.rank, "lost upstream hello stream");
                    return Err(RunError::UpstreamLost);
                }
                Wake::Release((id, seq, result)) => self.handle_barrier_release(id, seq, result),
                Wake::Task(Some(event)) => exec::task_event(&mut self, event),
                Wake::Task(None) => {}
                Wake::Flush => {
                    self.flush_at = None;
                    self.flush_state_updates();
                }
            }
        }
    }

    /// Attach to the parent with a streaming hello. No-op on the root.
    fn send_hello(&mut self) -> Result<(), RunError> {
        if self.rank == 0 {
            return Ok(());
        }
        let stream = self
            .overlay
            .upstream_request(topic::HELLO, json!({ "rank": self.rank }))?;
        debug!(rank = self.rank, "hello sent upstream");
        self.hello = Some(stream);
        Ok(())
    }

    fn handle_request(&mut self, request: Arc<Request>) {
        trace!(
            rank = self.rank,
            topic = %request.topic,
            msgid = request.msgid,
            "request"
        );
        let result = match request.topic.as_str() {
            topic::HELLO => self.hello_server(&request),
            topic::DISCONNECT => {
                self.peers.disconnect(request.route);
                Ok(())
            }
            topic::START => exec::start_request(self, &request),
            topic::KILL => exec::kill_request(self, &request),
            topic::NOTIFY => self.notify_request(&request),
            topic::PING => ping::ping_request(self, &request),
            other => Err(WireError::new(
                Errno::NoSys,
                format!("unknown topic {:?}", other),
            )),
        };
        if let Err(error) = result {
            debug!(topic = %request.topic, %error, "request failed");
            if request.respond_err(error.errno, error.message).is_err() {
                trace!("failed requester is already gone");
            }
        }
    }

    /// Inbound hello from a child.
    ///
    /// Connect the peer, then immediately flush anything buffered for its
    /// subtree: a (re)joining child must learn about every job already
    /// dispatched below it before any new traffic flows.
    fn hello_server(&mut self, request: &Arc<Request>) -> Result<(), WireError> {
        let rank = self.peers.connect(Arc::clone(request))?;
        self.peers.flush(rank);
        Ok(())
    }

    /// One reply on this node's own hello stream: a state update from the
    /// parent.
    fn handle_hello_reply(&mut self, reply: WireResult) {
        counter!("arbor.coordinator.hello_updates").increment(1);
        let payload = match reply {
            Ok(payload) => payload,
            Err(error) => {
                error!(%error, "hello update failed");
                return;
            }
        };
        let update = match HelloReply::parse(&payload) {
            Ok(update) => update,
            Err(error) => {
                error!(%error, "malformed hello update");
                return;
            }
        };
        trace!(kind = %update.kind, idset = %update.idset, "hello update");

        // Forward downstream before acting locally, so grandchildren that
        // connected to this node late still see the update.
        if let Err(error) = self.forward(&update.kind, &update.idset, update.data.clone()) {
            warn!(kind = %update.kind, %error, "hello update forward failed");
        }
        if let Err(error) = self.dispatch_action(&update.kind, &update.idset, &update.data) {
            warn!(kind = %update.kind, %error, "hello update not handled");
        }
    }

    /// Fan a typed message out to the ranks in `idset`.
    ///
    /// Rank 0 additionally handles the message locally, so the root
    /// observes the same event as its descendants; internal ranks have
    /// already handled it on receipt from their own parent.
    pub(crate) fn forward(
        &mut self,
        kind: &str,
        idset: &RankSet,
        data: Payload,
    ) -> Result<(), WireError> {
        counter!("arbor.coordinator.forwards").increment(1);
        let msg = Arc::new(StateMessage::new(kind, idset.clone(), data));
        self.peers.forward(&msg)?;
        if self.rank == 0 {
            self.dispatch_action(&msg.kind, &msg.idset, &msg.data)?;
        }
        Ok(())
    }

    fn dispatch_action(
        &mut self,
        kind: &str,
        idset: &RankSet,
        data: &Payload,
    ) -> Result<(), WireError> {
        match Action::parse(kind, data)? {
            Action::StateUpdate(entries) => exec::state_update(self, entries),
            Action::Kill { id, signal } => exec::kill_action(self, id, signal),
            Action::Ping => ping::ping_action(self, idset),
        }
    }

    fn notify_request(&mut self, request: &Arc<Request>) -> Result<(), WireError> {
        counter!("arbor.coordinator.notifies").increment(1);
        match Notify::parse(&request.payload)? {
            Notify::Start { id, ranks } => exec::started(self, id, &ranks),
            Notify::Finish { id, ranks, status } => exec::finished(self, id, &ranks, status),
            Notify::BarrierEnter { id, ranks, seq } => {
                exec::barrier_enter(self, id, &ranks, seq, request)
            }
            Notify::Release => Err(WireError::new(Errno::NotSup, "release is not implemented")),
            Notify::Exception(exception) => exec::exception(self, exception),
            Notify::PingReply { ranks } => ping::ping_reply(self, &ranks),
        }
    }

    fn handle_barrier_release(&mut self, id: JobId, seq: u64, result: WireResult) {
        match result {
            Ok(_) => exec::barrier_release(self, id, seq),
            Err(error) => {
                error!(job = id, seq, %error, "barrier notify failed");
                exec::raise_exception(self, id, format!("barrier failure: {}", error));
            }
        }
    }

    /// Arm the responder flush timer. Called by the push that first makes
    /// the pending list non-empty, so a batch flushes one interval after
    /// it opens.
    pub(crate) fn arm_flush(&mut self) {
        if self.flush_at.is_none() {
            self.flush_at = Some(Instant::now() + self.config.flush_interval);
        }
    }

    fn flush_state_updates(&mut self) {
        if let Some(msg) = self.responder.pop() {
            debug!(idset = %msg.idset, "flushing state updates to peers");
            if let Err(error) = self.peers.forward(&msg) {
                warn!(%error, "state update forward failed");
            }
        }
    }
}

async fn hello_next(hello: &mut Option<arbor_overlay::ResponseStream>) -> Option<WireResult> {
    match hello {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}
