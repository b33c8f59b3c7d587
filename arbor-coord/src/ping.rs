//! The ping action module: exercise hierarchical message passing.
//!
//! An external `derp.ping` fans a `ping` action down to the addressed
//! ranks. Every addressed rank marks itself; each node aggregates replies
//! for its subtree and sends one `ping-reply` notify upstream, so the
//! originator answers the pinned request exactly when the whole target
//! set has replied.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use arbor_overlay::{topic, Errno, Request, WireError};
use arbor_rankset::RankSet;

use crate::coordinator::Coordinator;
use crate::executor::Executor;
use crate::wire::PingRequest;

/// One outstanding ping on this node.
#[derive(Debug)]
pub(crate) struct ActivePing {
    /// Pinned external request, held only on the originator.
    request: Option<Arc<Request>>,
    /// The ranks this node waits on: the target set narrowed to its
    /// subtree on the way down.
    targets: RankSet,
    /// The ranks heard from so far.
    replied: RankSet,
}

fn send_failed(what: &str, error: impl std::fmt::Display) -> WireError {
    WireError::new(Errno::Io, format!("{}: {}", what, error))
}

/// Handle an external `derp.ping` request.
pub(crate) fn ping_request<E: Executor>(
    co: &mut Coordinator<E>,
    request: &Arc<Request>,
) -> Result<(), WireError> {
    // one outstanding ping per node
    if co.ping.is_some() {
        return Err(WireError::new(Errno::Again, "ping already in progress"));
    }
    let ping = PingRequest::parse(&request.payload)?;

    // Targets other than the local rank must sit inside the subtree.
    let mut others = ping.ranks.clone();
    others.remove(co.rank);
    if !others.is_subset(co.peers.descendants()) {
        return Err(WireError::new(
            Errno::NoEnt,
            format!("ranks {} outside subtree", others.difference(co.peers.descendants())),
        ));
    }

    debug!(targets = %ping.ranks, "starting ping");
    co.ping = Some(ActivePing {
        request: Some(Arc::clone(request)),
        targets: RankSet::new(),
        replied: RankSet::new(),
    });

    // forward() runs the local handler on rank 0; other originators run
    // it by hand since only descendants saw the fan-out
    if let Err(error) = co.forward("ping", &ping.ranks, ping.data) {
        co.ping = None;
        return Err(error);
    }
    if co.rank != 0 {
        if let Err(error) = ping_action(co, &ping.ranks) {
            co.ping = None;
            return Err(error);
        }
    }
    Ok(())
}

/// Handle the downward `ping` action on an addressed node.
pub(crate) fn ping_action<E: Executor>(
    co: &mut Coordinator<E>,
    targets: &RankSet,
) -> Result<(), WireError> {
    debug!(targets = %targets, "ping");
    let request = co.ping.take().and_then(|ping| ping.request);
    let mut replied = RankSet::new();
    if targets.contains(co.rank) {
        replied.insert(co.rank);
    }
    co.ping = Some(ActivePing {
        request,
        targets: targets.clone(),
        replied,
    });
    try_response(co)
}

/// Handle an upward `ping-reply` notify from a child subtree.
pub(crate) fn ping_reply<E: Executor>(
    co: &mut Coordinator<E>,
    ranks: &RankSet,
) -> Result<(), WireError> {
    let ping = co
        .ping
        .as_mut()
        .ok_or_else(|| WireError::new(Errno::NoEnt, "no ping in progress"))?;
    ping.replied.union_with(ranks);
    debug!(from = %ranks, total = %ping.replied, "ping reply");
    try_response(co)
}

/// Complete the ping once every awaited rank has replied: answer the
/// pinned request on the originator, or aggregate one reply upstream.
fn try_response<E: Executor>(co: &mut Coordinator<E>) -> Result<(), WireError> {
    let ping = match co.ping.take() {
        Some(ping) => ping,
        None => return Ok(()),
    };
    if ping.targets.is_empty() || ping.targets != ping.replied {
        co.ping = Some(ping);
        return Ok(());
    }
    let ranks = ping.replied;
    match ping.request {
        Some(request) => {
            debug!(ranks = %ranks, "ping: all replies received");
            request
                .respond(json!({ "ranks": ranks }))
                .map_err(|e| send_failed("ping reply", e))?;
        }
        None => {
            debug!(ranks = %ranks, "ping: subtree complete, notifying upstream");
            co.overlay
                .upstream_send(
                    topic::NOTIFY,
                    json!({ "type": "ping-reply", "data": { "ranks": ranks } }),
                )
                .map_err(|e| send_failed("ping notify", e))?;
        }
    }
    Ok(())
}
