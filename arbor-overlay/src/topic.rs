//! Request topics of the coordination protocol, all under the `derp`
//! module name.

/// Streaming request from a child attaching to its parent: `{rank}`.
/// Responses carry `{type, idset, data}` state updates.
pub const HELLO: &str = "derp.hello";

/// Signaled peer disconnect. Synthesized by the transport when a child
/// endpoint goes away; the payload is empty and the route identifies the
/// lost link.
pub const DISCONNECT: &str = "derp.disconnect";

/// External streaming request starting a job: `{id, userid, ranks}`.
/// Responses: `{id, type: "start"|"finish"|"exception", data}`.
pub const START: &str = "derp.start";

/// External request delivering a signal to a job: `{id, signal, ranks}`.
pub const KILL: &str = "derp.kill";

/// Upward aggregation event: `{type, data}`. Fire-and-forget except for
/// `barrier-enter`, whose eventual reply releases the sender's barrier.
pub const NOTIFY: &str = "derp.notify";

/// External diagnostic request: `{ranks, data}`; response `{ranks}`.
pub const PING: &str = "derp.ping";
