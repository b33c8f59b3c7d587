//! In-process realization of the overlay transport.
//!
//! [`TreeNet`] wires every rank of a [`Topology`] with unbounded channels.
//! Each rank's endpoint is an [`Overlay`]; external requesters attach
//! anywhere with a [`Client`]. Messages to a single endpoint are delivered
//! in send order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::trace;

use crate::error::SendError;
use crate::message::{Payload, ReplySink, Request, ResponseStream, RouteId};
use crate::topic;
use crate::topology::Topology;

use arbor_rankset::Rank;

type Inbox = mpsc::UnboundedSender<Arc<Request>>;

/// A tree of in-process overlay endpoints.
pub struct TreeNet {
    topology: Topology,
    inboxes: HashMap<Rank, Inbox>,
    receivers: HashMap<Rank, mpsc::UnboundedReceiver<Arc<Request>>>,
    next_route: Arc<AtomicU64>,
}

impl TreeNet {
    /// Wire up endpoints for every rank in `topology`.
    pub fn new(topology: Topology) -> TreeNet {
        let mut inboxes = HashMap::new();
        let mut receivers = HashMap::new();
        for rank in topology.ranks().iter() {
            let (tx, rx) = mpsc::unbounded_channel();
            inboxes.insert(rank, tx);
            receivers.insert(rank, rx);
        }
        TreeNet {
            topology,
            inboxes,
            receivers,
            next_route: Arc::new(AtomicU64::new(1)),
        }
    }

    /// The full overlay tree.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Take the endpoint for `rank`.
    ///
    /// # Panics
    ///
    /// Panics if `rank` is not in the topology or its endpoint was already
    /// taken; both are harness bugs.
    pub fn overlay(&mut self, rank: Rank) -> Overlay {
        let inbox = self
            .receivers
            .remove(&rank)
            .unwrap_or_else(|| panic!("overlay endpoint for rank {} unknown or already taken", rank));
        let parent = self
            .topology
            .parent_of(rank)
            .map(|parent| self.inboxes[&parent].clone());
        let subtree = self
            .topology
            .find(rank)
            .cloned()
            .unwrap_or_else(|| panic!("rank {} missing from topology", rank));
        Overlay {
            rank,
            size: self.topology.size(),
            topology: subtree,
            parent,
            inbox,
            route: self.alloc_route(),
        }
    }

    /// An external requester attached to `rank`.
    ///
    /// # Panics
    ///
    /// Panics if `rank` is not in the topology.
    pub fn client(&self, rank: Rank) -> Client {
        Client {
            inbox: self.inboxes[&rank].clone(),
            route: self.alloc_route(),
        }
    }

    fn alloc_route(&self) -> RouteId {
        RouteId::from_raw(self.next_route.fetch_add(1, Ordering::Relaxed))
    }
}

/// One rank's endpoint in the overlay.
pub struct Overlay {
    rank: Rank,
    size: u32,
    topology: Topology,
    parent: Option<Inbox>,
    inbox: mpsc::UnboundedReceiver<Arc<Request>>,
    route: RouteId,
}

impl Overlay {
    /// The local rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// The total number of ranks in the overlay.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// The topology subtree rooted at the local rank.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The next inbound request, from a child, the parent link, or an
    /// external client. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Arc<Request>> {
        self.inbox.recv().await
    }

    /// Issue a request toward the parent and stream its responses.
    pub fn upstream_request(
        &self,
        topic: &str,
        payload: Payload,
    ) -> Result<ResponseStream, SendError> {
        let parent = self.parent.as_ref().ok_or(SendError::NoUpstream)?;
        let (sink, stream) = ReplySink::stream();
        let request = Arc::new(Request::new(topic, payload, self.route, sink));
        trace!(rank = self.rank, topic, msgid = request.msgid, "upstream request");
        parent.send(request).map_err(|_| SendError::Closed)?;
        Ok(stream)
    }

    /// Send a no-response request toward the parent.
    pub fn upstream_send(&self, topic: &str, payload: Payload) -> Result<(), SendError> {
        let parent = self.parent.as_ref().ok_or(SendError::NoUpstream)?;
        let request = Arc::new(Request::new(topic, payload, self.route, ReplySink::none()));
        trace!(rank = self.rank, topic, msgid = request.msgid, "upstream send");
        parent.send(request).map_err(|_| SendError::Closed)
    }
}

impl Drop for Overlay {
    /// Signal the parent that this endpoint is gone.
    fn drop(&mut self) {
        if let Some(parent) = &self.parent {
            let request = Arc::new(Request::new(
                topic::DISCONNECT,
                Payload::Null,
                self.route,
                ReplySink::none(),
            ));
            let _ = parent.send(request);
        }
    }
}

/// An external requester attached to one rank.
#[derive(Clone)]
pub struct Client {
    inbox: Inbox,
    route: RouteId,
}

impl Client {
    /// Issue a request and stream its responses.
    pub fn request(&self, topic: &str, payload: Payload) -> Result<ResponseStream, SendError> {
        let (sink, stream) = ReplySink::stream();
        let request = Arc::new(Request::new(topic, payload, self.route, sink));
        self.inbox.send(request).map_err(|_| SendError::Closed)?;
        Ok(stream)
    }

    /// Send a no-response request.
    pub fn send(&self, topic: &str, payload: Payload) -> Result<(), SendError> {
        let request = Arc::new(Request::new(topic, payload, self.route, ReplySink::none()));
        self.inbox.send(request).map_err(|_| SendError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn request_reply_between_child_and_parent() {
        arbor_test::init();

        let mut net = TreeNet::new(Topology::kary(2, 2));
        let mut parent = net.overlay(0);
        let child = net.overlay(1);

        let mut stream = child
            .upstream_request(topic::HELLO, json!({ "rank": 1 }))
            .expect("child has a parent");

        let request = parent.recv().await.expect("request arrives");
        assert_eq!(request.topic, topic::HELLO);
        assert_eq!(request.payload["rank"], 1);

        request.respond(json!({ "n": 1 })).expect("reply goes out");
        request.respond(json!({ "n": 2 })).expect("streaming reply");

        let first = stream.recv().await.expect("first").expect("ok");
        let second = stream.recv().await.expect("second").expect("ok");
        assert_eq!(first["n"], json!(1));
        assert_eq!(second["n"], json!(2));
    }

    #[tokio::test]
    async fn dropped_child_synthesizes_disconnect() {
        arbor_test::init();

        let mut net = TreeNet::new(Topology::kary(2, 2));
        let mut parent = net.overlay(0);
        let child = net.overlay(1);

        child
            .upstream_send(topic::NOTIFY, json!({ "type": "start" }))
            .expect("send");
        let first = parent.recv().await.expect("notify arrives");
        let route = first.route;

        drop(child);
        let second = parent.recv().await.expect("disconnect arrives");
        assert_eq!(second.topic, topic::DISCONNECT);
        assert_eq!(second.route, route);
    }

    #[tokio::test]
    async fn root_has_no_upstream() {
        arbor_test::init();

        let mut net = TreeNet::new(Topology::solo(0));
        let root = net.overlay(0);
        assert_eq!(
            root.upstream_send(topic::NOTIFY, Payload::Null),
            Err(SendError::NoUpstream)
        );
    }

    #[tokio::test]
    async fn client_errors_surface_in_the_stream() {
        arbor_test::init();

        let mut net = TreeNet::new(Topology::solo(0));
        let mut root = net.overlay(0);
        let client = net.client(0);

        let stream = client
            .request(topic::PING, json!({ "ranks": "0" }))
            .expect("request");
        let request = root.recv().await.expect("arrives");
        request
            .respond_err(crate::Errno::NoEnt, "nope")
            .expect("error reply");

        let err = stream.into_reply().await.expect_err("is an error");
        assert_eq!(err.errno, crate::Errno::NoEnt);
    }
}
