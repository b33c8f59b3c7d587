//! The table of direct-child peers.

use std::collections::VecDeque;
use std::sync::Arc;

use metrics::counter;
use serde_json::json;
use tracing::{debug, trace, warn};

use arbor_overlay::{Errno, Request, RouteId, SendError, Topology, WireError};
use arbor_rankset::{Rank, RankSet};

use crate::hello::StateMessage;
use crate::wire::HelloRequest;

/// One direct child of the local rank.
#[derive(Debug)]
pub(crate) struct Peer {
    /// The child's rank.
    pub rank: Rank,
    /// The set of ranks at or below the child.
    pub subtree: RankSet,
    /// The child's pinned hello request while connected.
    ///
    /// Invariant: the peer is connected iff this holds a request; its
    /// route token identifies the link for disconnect matching and its
    /// reply sink is where every forwarded message goes.
    hello: Option<Arc<Request>>,
    /// Messages buffered while disconnected, in arrival order.
    pending: VecDeque<Arc<StateMessage>>,
}

impl Peer {
    /// Reply to the peer's pinned hello request with one state message,
    /// narrowing the receiver set to the peer's subtree.
    fn respond(&self, msg: &StateMessage) -> Result<(), SendError> {
        let hello = self.hello.as_ref().ok_or(SendError::Closed)?;
        let idset = self.subtree.intersection(&msg.idset);
        hello.respond(json!({
            "type": msg.kind,
            "idset": idset,
            "data": msg.data,
        }))
    }
}

/// The direct children of the local rank.
///
/// Lookup is linear: tree fan-out is small.
#[derive(Debug)]
pub(crate) struct PeerTable {
    peers: Vec<Peer>,
    descendants: RankSet,
}

impl PeerTable {
    /// Precompute each child's subtree from the local topology.
    pub fn new(topology: &Topology) -> PeerTable {
        let mut peers = Vec::with_capacity(topology.children.len());
        let mut descendants = RankSet::new();
        for child in &topology.children {
            let subtree = child.ranks();
            descendants.union_with(&subtree);
            peers.push(Peer {
                rank: child.rank,
                subtree,
                hello: None,
                pending: VecDeque::new(),
            });
        }
        PeerTable { peers, descendants }
    }

    /// The union of every child subtree.
    pub fn descendants(&self) -> &RankSet {
        &self.descendants
    }

    fn get_mut(&mut self, rank: Rank) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|peer| peer.rank == rank)
    }

    /// Attach a child: pin its hello request and mark it connected.
    ///
    /// Fails `EPROTO` on a malformed payload and `ENOENT` when the rank is
    /// not a direct child.
    pub fn connect(&mut self, request: Arc<Request>) -> Result<Rank, WireError> {
        let hello = HelloRequest::parse(&request.payload)?;
        let peer = self.get_mut(hello.rank).ok_or_else(|| {
            WireError::new(
                Errno::NoEnt,
                format!("rank {} is not a direct child", hello.rank),
            )
        })?;
        debug!(
            rank = peer.rank,
            subtree = %peer.subtree,
            "connection from peer"
        );
        peer.hello = Some(request);
        Ok(hello.rank)
    }

    /// Detach whichever peer the route token belongs to.
    pub fn disconnect(&mut self, route: RouteId) {
        for peer in &mut self.peers {
            let matched = peer
                .hello
                .as_ref()
                .map(|hello| hello.route == route)
                .unwrap_or(false);
            if matched {
                debug!(rank = peer.rank, "peer disconnected");
                peer.hello = None;
            }
        }
    }

    /// Fan a state message out to every peer whose subtree it touches.
    ///
    /// Connected peers get an immediate reply narrowed to their subtree;
    /// disconnected peers buffer a shared copy for flush-on-connect. A
    /// send failure on one child does not stop the others; the aggregate
    /// result is failed if any send failed.
    pub fn forward(&mut self, msg: &Arc<StateMessage>) -> Result<(), WireError> {
        let mut failures = 0usize;
        for peer in &mut self.peers {
            if !peer.subtree.intersects(&msg.idset) {
                continue;
            }
            if peer.hello.is_some() {
                match peer.respond(msg) {
                    Ok(()) => counter!("arbor.peer.forwarded").increment(1),
                    Err(error) => {
                        warn!(rank = peer.rank, %error, "forward to peer failed");
                        failures += 1;
                    }
                }
            } else {
                trace!(rank = peer.rank, kind = %msg.kind, "peer not connected, buffering");
                counter!("arbor.peer.buffered").increment(1);
                peer.pending.push_back(Arc::clone(msg));
            }
        }
        if failures > 0 {
            Err(WireError::new(
                Errno::Io,
                format!("forward failed for {} peer(s)", failures),
            ))
        } else {
            Ok(())
        }
    }

    /// Drain a connected peer's buffered messages in arrival order.
    ///
    /// Stops at the first send failure; the failed entry stays queued for
    /// the next connect.
    pub fn flush(&mut self, rank: Rank) {
        let peer = match self.get_mut(rank) {
            Some(peer) if peer.hello.is_some() => peer,
            _ => return,
        };
        while let Some(msg) = peer.pending.front() {
            if let Err(error) = peer.respond(msg) {
                warn!(rank = peer.rank, %error, "flush to peer failed");
                return;
            }
            peer.pending.pop_front();
        }
    }

    #[cfg(test)]
    pub fn pending_count(&self, rank: Rank) -> usize {
        self.peers
            .iter()
            .find(|peer| peer.rank == rank)
            .map(|peer| peer.pending.len())
            .unwrap_or(0)
    }
}
