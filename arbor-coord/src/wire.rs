//! Typed views of the JSON payloads on the wire.
//!
//! Responses and notifies carry a `type` string and a `data` object whose
//! shape depends on the type. Each is decoded into a tagged variant before
//! dispatch, so handlers see typed payloads and malformed traffic fails
//! `EPROTO` in one place.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use arbor_overlay::{Errno, Payload, WireError};
use arbor_rankset::{Rank, RankSet};

/// Job identity, assigned by the requester.
pub type JobId = i64;

fn proto_err(err: impl std::fmt::Display) -> WireError {
    WireError::new(Errno::Proto, format!("malformed payload: {}", err))
}

fn decode<T: DeserializeOwned>(payload: &Payload) -> Result<T, WireError> {
    serde_json::from_value(payload.clone()).map_err(proto_err)
}

/// `derp.hello` request payload.
#[derive(Debug, Deserialize)]
pub(crate) struct HelloRequest {
    pub rank: Rank,
}

impl HelloRequest {
    pub fn parse(payload: &Payload) -> Result<HelloRequest, WireError> {
        decode(payload)
    }
}

/// One streamed `derp.hello` response: `{type, idset, data}`.
#[derive(Debug)]
pub(crate) struct HelloReply {
    pub kind: String,
    pub idset: RankSet,
    pub data: Payload,
}

impl HelloReply {
    pub fn parse(payload: &Payload) -> Result<HelloReply, WireError> {
        #[derive(Deserialize)]
        struct Wire {
            #[serde(rename = "type")]
            kind: String,
            idset: RankSet,
            data: Payload,
        }
        let wire: Wire = decode(payload)?;
        Ok(HelloReply {
            kind: wire.kind,
            idset: wire.idset,
            data: wire.data,
        })
    }
}

/// `derp.start` request payload.
#[derive(Debug, Deserialize)]
pub(crate) struct StartRequest {
    pub id: JobId,
    pub userid: u32,
    pub ranks: RankSet,
}

impl StartRequest {
    pub fn parse(payload: &Payload) -> Result<StartRequest, WireError> {
        decode(payload)
    }
}

/// `derp.kill` request payload.
#[derive(Debug, Deserialize)]
pub(crate) struct KillRequest {
    pub id: JobId,
    pub signal: i32,
    pub ranks: RankSet,
}

impl KillRequest {
    pub fn parse(payload: &Payload) -> Result<KillRequest, WireError> {
        decode(payload)
    }
}

/// `derp.ping` request payload.
#[derive(Debug, Deserialize)]
pub(crate) struct PingRequest {
    pub ranks: RankSet,
    #[serde(default)]
    pub data: Payload,
}

impl PingRequest {
    pub fn parse(payload: &Payload) -> Result<PingRequest, WireError> {
        decode(payload)
    }
}

/// One job entry in a `state-update` batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct StateEntry {
    pub id: JobId,
    pub userid: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub ranks: RankSet,
}

/// An exception raised against a job, flowing toward the root.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Exception {
    pub id: JobId,
    pub severity: i32,
    #[serde(rename = "type")]
    pub kind: String,
    pub note: String,
}

/// A typed action: a synchronously-observable fact flowing down the tree.
#[derive(Debug)]
pub(crate) enum Action {
    /// Jobs discovered since the receiver's last update.
    StateUpdate(Vec<StateEntry>),
    /// Deliver `signal` to the local task of `id`, where one exists.
    Kill { id: JobId, signal: i32 },
    /// Mark the local rank and aggregate replies for the subtree.
    Ping,
}

impl Action {
    /// Decode the `data` arm for an action `type`.
    pub fn parse(kind: &str, data: &Payload) -> Result<Action, WireError> {
        match kind {
            "state-update" => {
                #[derive(Deserialize)]
                struct Wire {
                    jobs: Vec<StateEntry>,
                }
                let wire: Wire = decode(data)?;
                Ok(Action::StateUpdate(wire.jobs))
            }
            "kill" => {
                #[derive(Deserialize)]
                struct Wire {
                    id: JobId,
                    signal: i32,
                }
                let wire: Wire = decode(data)?;
                Ok(Action::Kill {
                    id: wire.id,
                    signal: wire.signal,
                })
            }
            "ping" => Ok(Action::Ping),
            other => Err(WireError::new(
                Errno::NoSys,
                format!("no action handler for type {:?}", other),
            )),
        }
    }
}

/// A typed notify: an aggregation event flowing up the tree.
#[derive(Debug)]
pub(crate) enum Notify {
    /// Tasks started on `ranks` of the sender's subtree.
    Start { id: JobId, ranks: RankSet },
    /// Tasks finished on `ranks` with an aggregated exit status.
    Finish {
        id: JobId,
        ranks: RankSet,
        status: i32,
    },
    /// The sender's whole subtree entered barrier `seq`.
    BarrierEnter {
        id: JobId,
        ranks: RankSet,
        seq: u64,
    },
    /// Reserved; answered `ENOTSUP`.
    Release,
    /// An exception raised below the sender.
    Exception(Exception),
    /// Ping replies collected from `ranks`.
    PingReply { ranks: RankSet },
}

impl Notify {
    /// Decode a `derp.notify` payload: `{type, data}`.
    pub fn parse(payload: &Payload) -> Result<Notify, WireError> {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(rename = "type")]
            kind: String,
            data: Payload,
        }
        let env: Envelope = decode(payload)?;
        match env.kind.as_str() {
            "start" => {
                #[derive(Deserialize)]
                struct Wire {
                    id: JobId,
                    ranks: RankSet,
                }
                let wire: Wire = decode(&env.data)?;
                Ok(Notify::Start {
                    id: wire.id,
                    ranks: wire.ranks,
                })
            }
            "finish" => {
                #[derive(Deserialize)]
                struct Wire {
                    id: JobId,
                    ranks: RankSet,
                    status: i32,
                }
                let wire: Wire = decode(&env.data)?;
                Ok(Notify::Finish {
                    id: wire.id,
                    ranks: wire.ranks,
                    status: wire.status,
                })
            }
            "barrier-enter" => {
                #[derive(Deserialize)]
                struct Wire {
                    id: JobId,
                    ranks: RankSet,
                    seq: u64,
                }
                let wire: Wire = decode(&env.data)?;
                Ok(Notify::BarrierEnter {
                    id: wire.id,
                    ranks: wire.ranks,
                    seq: wire.seq,
                })
            }
            "release" => Ok(Notify::Release),
            "exception" => Ok(Notify::Exception(decode(&env.data)?)),
            "ping-reply" => {
                #[derive(Deserialize)]
                struct Wire {
                    ranks: RankSet,
                }
                let wire: Wire = decode(&env.data)?;
                Ok(Notify::PingReply { ranks: wire.ranks })
            }
            other => Err(WireError::new(
                Errno::NoSys,
                format!("no notify handler for type {:?}", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn start_request_decodes_rank_sets() {
        arbor_test::init();

        let req =
            StartRequest::parse(&json!({ "id": 7, "userid": 42, "ranks": "1-2" })).expect("decodes");
        assert_eq!(req.id, 7);
        assert_eq!(req.userid, 42);
        assert_eq!(req.ranks.to_string(), "1-2");
    }

    #[test]
    fn malformed_payloads_fail_eproto() {
        arbor_test::init();

        let err = StartRequest::parse(&json!({ "id": "seven" })).expect_err("rejects");
        assert_eq!(err.errno, Errno::Proto);

        let err = Notify::parse(&json!({ "type": "start", "data": { "id": 1 } }))
            .expect_err("missing ranks");
        assert_eq!(err.errno, Errno::Proto);

        let err = Notify::parse(&json!({ "data": {} })).expect_err("missing type");
        assert_eq!(err.errno, Errno::Proto);
    }

    #[test]
    fn unknown_types_fail_enosys() {
        arbor_test::init();

        let err = Action::parse("launch", &json!({})).expect_err("rejects");
        assert_eq!(err.errno, Errno::NoSys);

        let err = Notify::parse(&json!({ "type": "gossip", "data": {} })).expect_err("rejects");
        assert_eq!(err.errno, Errno::NoSys);
    }

    #[test]
    fn notify_arms_decode() {
        arbor_test::init();

        match Notify::parse(&json!({
            "type": "barrier-enter",
            "data": { "id": 3, "ranks": "1,2", "seq": 0 },
        }))
        .expect("decodes")
        {
            Notify::BarrierEnter { id, ranks, seq } => {
                assert_eq!(id, 3);
                assert_eq!(ranks.to_string(), "1-2");
                assert_eq!(seq, 0);
            }
            other => panic!("wrong arm: {:?}", other),
        }

        match Notify::parse(&json!({
            "type": "exception",
            "data": { "id": 3, "severity": 0, "type": "exec", "note": "barrier failure" },
        }))
        .expect("decodes")
        {
            Notify::Exception(ex) => {
                assert_eq!(ex.id, 3);
                assert_eq!(ex.severity, 0);
                assert_eq!(ex.kind, "exec");
            }
            other => panic!("wrong arm: {:?}", other),
        }
    }
}
