//! Per-job distributed barrier state.

use std::sync::Arc;

use tracing::warn;

use arbor_overlay::{Errno, Payload, Request, WireError};
use arbor_rankset::{Rank, RankSet};

/// One barrier per job, reused across invocations.
///
/// The sequence counter distinguishes one invocation from the next:
/// entries carrying a stale sequence are rejected rather than silently
/// folded into the wrong invocation.
#[derive(Debug, Default)]
pub(crate) struct Barrier {
    sequence: u64,
    entered: RankSet,
    /// Pinned barrier-enter requests awaiting release, in arrival order.
    requests: Vec<Arc<Request>>,
    /// This invocation's entry was already propagated upstream.
    upstream_notified: bool,
}

impl Barrier {
    pub fn new() -> Barrier {
        Barrier::default()
    }

    /// The current invocation number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The set of ranks that entered the current invocation.
    pub fn entered(&self) -> &RankSet {
        &self.entered
    }

    /// Record a subtree's entry from a downstream peer.
    ///
    /// Fails `EINVAL` when `sequence` is not the current invocation. The
    /// request is pinned for release, at most once per message id.
    pub fn enter(
        &mut self,
        ranks: &RankSet,
        sequence: u64,
        request: Arc<Request>,
    ) -> Result<(), WireError> {
        if sequence != self.sequence {
            return Err(WireError::new(
                Errno::Inval,
                format!(
                    "barrier sequence mismatch: entered {} at sequence {}",
                    sequence, self.sequence
                ),
            ));
        }
        self.entered.union_with(ranks);
        if !self.requests.iter().any(|r| r.msgid == request.msgid) {
            self.requests.push(request);
        }
        Ok(())
    }

    /// Record the local task's entry.
    pub fn enter_local(&mut self, rank: Rank) {
        self.entered.insert(rank);
    }

    /// Whether this invocation's entry was already sent upstream.
    ///
    /// A late duplicate entry re-satisfies the completion predicate; the
    /// flag keeps the upstream notify to one per sequence.
    pub fn upstream_notified(&self) -> bool {
        self.upstream_notified
    }

    /// Mark this invocation's entry as sent upstream.
    pub fn set_upstream_notified(&mut self) {
        self.upstream_notified = true;
    }

    /// Release every pinned request with an empty response.
    pub fn respond_all(&self) {
        for request in &self.requests {
            if let Err(error) = request.respond(Payload::Null) {
                warn!(msgid = request.msgid, %error, "barrier release reply failed");
            }
        }
    }

    /// Start the next invocation: bump the sequence, clear entries and
    /// pinned requests.
    pub fn reset(&mut self) {
        self.sequence += 1;
        self.entered.clear();
        self.requests.clear();
        self.upstream_notified = false;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use arbor_overlay::{topic, ReplySink, ResponseStream, RouteId};

    use super::*;

    fn enter_request(ranks: &str, seq: u64, route: u64) -> (Arc<Request>, ResponseStream) {
        let (sink, stream) = ReplySink::stream();
        let request = Request::new(
            topic::NOTIFY,
            json!({
                "type": "barrier-enter",
                "data": { "id": 1, "ranks": ranks, "seq": seq },
            }),
            RouteId::from_raw(route),
            sink,
        );
        (Arc::new(request), stream)
    }

    #[test]
    fn entries_accumulate_until_reset() {
        arbor_test::init();

        let mut barrier = Barrier::new();
        assert_eq!(barrier.sequence(), 0);

        let (req, _stream) = enter_request("1,3", 0, 10);
        barrier.enter(&"1,3".parse().expect("decodes"), 0, req).expect("enters");
        barrier.enter_local(0);
        assert_eq!(barrier.entered().to_string(), "0-1,3");

        barrier.reset();
        assert_eq!(barrier.sequence(), 1);
        assert!(barrier.entered().is_empty());
    }

    #[test]
    fn stale_sequences_are_rejected() {
        arbor_test::init();

        let mut barrier = Barrier::new();
        barrier.reset();

        let (req, _stream) = enter_request("1", 0, 10);
        let err = barrier
            .enter(&"1".parse().expect("decodes"), 0, req)
            .expect_err("stale");
        assert_eq!(err.errno, Errno::Inval);
        assert!(barrier.entered().is_empty());
    }

    #[tokio::test]
    async fn release_answers_each_pinned_request_once() {
        arbor_test::init();

        let mut barrier = Barrier::new();
        let (req1, mut stream1) = enter_request("1", 0, 10);
        let (req2, mut stream2) = enter_request("2", 0, 11);

        // the same message resent does not pin twice
        barrier.enter(&"1".parse().expect("decodes"), 0, Arc::clone(&req1)).expect("enters");
        barrier.enter(&"1".parse().expect("decodes"), 0, req1).expect("re-enters");
        barrier.enter(&"2".parse().expect("decodes"), 0, req2).expect("enters");
        assert_eq!(barrier.requests.len(), 2);

        barrier.respond_all();
        barrier.reset();

        assert!(stream1.recv().await.expect("released").expect("ok").is_null());
        assert!(stream2.recv().await.expect("released").expect("ok").is_null());
        assert!(barrier.requests.is_empty());
    }
}
