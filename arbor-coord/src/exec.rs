//! The exec action module: distributed job execution.
//!
//! Owns everything that happens to a job after the coordinator routes a
//! message to it: registration and launch on `state-update:add`, start and
//! finish aggregation against the subtree, the distributed barrier, kill
//! delivery, and exception handling at the root.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, trace, warn};

use arbor_overlay::{topic, Errno, Request, WireError};
use arbor_rankset::RankSet;

use crate::coordinator::Coordinator;
use crate::executor::{Executor, OutputStream, TaskEvent, TaskEventKind, TaskSpec};
use crate::job::Job;
use crate::wire::{Exception, JobId, KillRequest, StartRequest, StateEntry};

fn unknown_job(id: JobId) -> WireError {
    WireError::new(Errno::NoEnt, format!("unknown job {}", id))
}

fn send_failed(what: &str, error: impl std::fmt::Display) -> WireError {
    WireError::new(Errno::Io, format!("{}: {}", what, error))
}

/// Handle an external `derp.start` request.
///
/// Registers the job locally, queues a `state-update:add` for the rest of
/// the target set, and pins the request: start, finish, and exception
/// replies stream back on it.
pub(crate) fn start_request<E: Executor>(
    co: &mut Coordinator<E>,
    request: &Arc<Request>,
) -> Result<(), WireError> {
    let start = StartRequest::parse(&request.payload)?;
    if start.ranks.is_empty() {
        return Err(WireError::new(Errno::Proto, "empty target rank set"));
    }
    debug!(job = start.id, targets = %start.ranks, "start request received");

    // Ranks beyond this one learn of the job through the responder's next
    // state-update batch.
    if start.ranks.count() > 1 || start.ranks.first() != Some(co.rank) {
        trace!(job = start.id, "queueing add for peers");
        if co.responder.push("add", start.id, start.userid, &start.ranks) == 1 {
            co.arm_flush();
        }
    }

    add_job(co, start.id, start.userid, start.ranks)?;
    if let Some(job) = co.jobs.get_mut(start.id) {
        job.request = Some(Arc::clone(request));
    }
    Ok(())
}

/// Handle an external `derp.kill` request: fan the signal out to the
/// addressed ranks. Succeeds silently.
pub(crate) fn kill_request<E: Executor>(
    co: &mut Coordinator<E>,
    request: &Arc<Request>,
) -> Result<(), WireError> {
    let kill = KillRequest::parse(&request.payload)?;
    debug!(
        job = kill.id,
        targets = %kill.ranks,
        signal = kill.signal,
        "kill request received"
    );
    co.forward(
        "kill",
        &kill.ranks,
        json!({ "id": kill.id, "signal": kill.signal }),
    )
}

/// Apply a `state-update` batch.
///
/// A duplicate `add` is a no-op for that entry (`EEXIST`) and does not
/// stop the rest of the batch; the first failure is reported after every
/// entry has been applied.
pub(crate) fn state_update<E: Executor>(
    co: &mut Coordinator<E>,
    entries: Vec<StateEntry>,
) -> Result<(), WireError> {
    let mut first_error = None;
    for entry in entries {
        match entry.kind.as_str() {
            "add" => {
                if let Err(error) = add_job(co, entry.id, entry.userid, entry.ranks) {
                    if error.errno == Errno::Exist {
                        continue;
                    }
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
            other => debug!(job = entry.id, kind = other, "ignoring state-update entry"),
        }
    }
    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Register a job and launch its task when this rank hosts it.
fn add_job<E: Executor>(
    co: &mut Coordinator<E>,
    id: JobId,
    userid: u32,
    target: RankSet,
) -> Result<(), WireError> {
    if co.jobs.contains(id) {
        debug!(job = id, "duplicate add request");
        return Err(WireError::new(
            Errno::Exist,
            format!("job {} already exists", id),
        ));
    }
    let subtree = target.intersection(&co.coverage);
    let mut job = Job::new(id, userid, target, subtree);
    if job.target_ranks.contains(co.rank) {
        debug!(job = id, "starting job shell");
        launch(co, &mut job);
    }
    co.jobs.insert(job)
}

fn launch<E: Executor>(co: &mut Coordinator<E>, job: &mut Job) {
    let spec = TaskSpec {
        job: job.id,
        program: co.config.job_shell.clone(),
        args: vec![job.id.to_string()],
        namespace: format!("job-{}", job.id),
        // barriers only exist for multi-rank jobs
        protocol_channel: job.target_ranks.count() > 1,
    };
    job.task = Some(co.executor.spawn(spec));
}

/// Route a task lifecycle event from the local executor.
pub(crate) fn task_event<E: Executor>(co: &mut Coordinator<E>, event: TaskEvent) {
    match event.kind {
        TaskEventKind::Running => task_running(co, event.job),
        TaskEventKind::Exited { status } => task_exited(co, event.job, status),
        TaskEventKind::Failed { errno } => task_failed(co, event.job, errno),
        TaskEventKind::Output { stream, line } => task_output(co, event.job, stream, line),
    }
}

fn task_running<E: Executor>(co: &mut Coordinator<E>, id: JobId) {
    let rank = co.rank;
    let job = match co.jobs.get_mut(id) {
        Some(job) => job,
        None => {
            warn!(job = id, "running event for unknown job");
            return;
        }
    };
    debug!(job = id, "running");
    job.start_ranks.insert(rank);
    if let Err(error) = notify_start(co, id) {
        warn!(job = id, %error, "start notification failed");
    }
}

fn task_exited<E: Executor>(co: &mut Coordinator<E>, id: JobId, status: i32) {
    let rank = co.rank;
    let job = match co.jobs.get_mut(id) {
        Some(job) => job,
        None => {
            warn!(job = id, "exit event for unknown job");
            return;
        }
    };
    if status > job.status {
        job.status = status;
    }
    job.finish_ranks.insert(rank);
    if let Err(error) = notify_finish(co, id) {
        raise_exception(co, id, format!("finish notification failed: {}", error));
    }
}

/// Exit code for a task that could not be spawned or exec'd.
fn failure_status(errno: i32) -> i32 {
    match errno {
        libc::EPERM | libc::EACCES => 126,
        libc::ENOENT => 127,
        libc::EHOSTUNREACH => 68,
        _ => 1,
    }
}

fn task_failed<E: Executor>(co: &mut Coordinator<E>, id: JobId, errno: i32) {
    let status = failure_status(errno);
    warn!(job = id, errno, status, "task launch failed");
    task_exited(co, id, status);
}

fn task_output<E: Executor>(co: &mut Coordinator<E>, id: JobId, stream: OutputStream, line: String) {
    match stream {
        OutputStream::Protocol => {
            if line != "enter" {
                warn!(job = id, %line, "task entered barrier with garbage");
            }
            barrier_enter_local(co, id);
        }
        _ => {
            // TODO: route task output into the job's eventlog
            debug!(job = id, ?stream, %line, "task output");
        }
    }
}

/// Handle an upward `start` notify from a child subtree.
pub(crate) fn started<E: Executor>(
    co: &mut Coordinator<E>,
    id: JobId,
    ranks: &RankSet,
) -> Result<(), WireError> {
    let job = co.jobs.get_mut(id).ok_or_else(|| unknown_job(id))?;
    job.start_ranks.union_with(ranks);
    notify_start(co, id)
}

/// Fire the start transition when the whole subtree has started.
///
/// The transition fires at most once per job: reply to the pinned
/// originating request where one is held, otherwise aggregate upstream.
fn notify_start<E: Executor>(co: &mut Coordinator<E>, id: JobId) -> Result<(), WireError> {
    let job = co.jobs.get_mut(id).ok_or_else(|| unknown_job(id))?;
    trace!(
        job = id,
        started = %job.start_ranks,
        subtree = %job.subtree_ranks,
        "start progress"
    );
    if job.start_ranks != job.subtree_ranks || job.start_notified {
        return Ok(());
    }
    job.start_notified = true;

    if let Some(request) = job.request.clone() {
        debug!(job = id, "subtree started, responding");
        request
            .respond(json!({ "id": id, "type": "start", "data": {} }))
            .map_err(|e| send_failed("start reply", e))?;
    } else {
        let ranks = job.start_ranks.clone();
        debug!(job = id, ranks = %ranks, "subtree started, notifying upstream");
        co.overlay
            .upstream_send(
                topic::NOTIFY,
                json!({ "type": "start", "data": { "id": id, "ranks": ranks } }),
            )
            .map_err(|e| send_failed("start notify", e))?;
    }
    Ok(())
}

/// Handle an upward `finish` notify from a child subtree.
pub(crate) fn finished<E: Executor>(
    co: &mut Coordinator<E>,
    id: JobId,
    ranks: &RankSet,
    status: i32,
) -> Result<(), WireError> {
    debug!(job = id, from = %ranks, status, "finish");
    let job = co.jobs.get_mut(id).ok_or_else(|| unknown_job(id))?;
    job.finish_ranks.union_with(ranks);
    if status > job.status {
        job.status = status;
    }
    notify_finish(co, id)
}

/// Fire the finish transition when the whole subtree has finished.
///
/// The finish reply or notify is the job's last protocol step on this
/// node, so the record is dropped on success.
fn notify_finish<E: Executor>(co: &mut Coordinator<E>, id: JobId) -> Result<(), WireError> {
    let job = co.jobs.get_mut(id).ok_or_else(|| unknown_job(id))?;
    if job.finish_ranks != job.subtree_ranks || job.finish_notified {
        return Ok(());
    }
    job.finish_notified = true;
    let status = job.status;

    if let Some(request) = job.request.clone() {
        debug!(job = id, status, "notify: finish");
        request
            .respond(json!({ "id": id, "type": "finish", "data": { "status": status } }))
            .map_err(|e| send_failed("finish reply", e))?;
    } else {
        let ranks = job.finish_ranks.clone();
        debug!(job = id, ranks = %ranks, status, "notifying upstream: finish");
        co.overlay
            .upstream_send(
                topic::NOTIFY,
                json!({ "type": "finish", "data": { "id": id, "ranks": ranks, "status": status } }),
            )
            .map_err(|e| send_failed("finish notify", e))?;
    }
    co.jobs.remove(id);
    Ok(())
}

/// Handle an upward `barrier-enter` notify from a child subtree.
///
/// The request is pinned until the barrier completes here or above; the
/// eventual empty reply releases the child's subtree.
pub(crate) fn barrier_enter<E: Executor>(
    co: &mut Coordinator<E>,
    id: JobId,
    ranks: &RankSet,
    seq: u64,
    request: &Arc<Request>,
) -> Result<(), WireError> {
    let job = co.jobs.get_mut(id).ok_or_else(|| unknown_job(id))?;
    debug!(job = id, from = %ranks, seq, "entered barrier");
    job.barrier.enter(ranks, seq, Arc::clone(request))?;
    barrier_check(co, id)
}

fn barrier_enter_local<E: Executor>(co: &mut Coordinator<E>, id: JobId) {
    let rank = co.rank;
    let job = match co.jobs.get_mut(id) {
        Some(job) => job,
        None => {
            warn!(job = id, "barrier entry for unknown job");
            return;
        }
    };
    job.barrier.enter_local(rank);
    debug!(
        job = id,
        seq = job.barrier.sequence(),
        "local task entered barrier"
    );
    if let Err(error) = barrier_check(co, id) {
        raise_exception(co, id, format!("barrier failure: {}", error));
    }
}

/// Complete or propagate the barrier once the whole subtree has entered.
///
/// On the job's lowest common ancestor the barrier completes locally;
/// elsewhere one `barrier-enter` notify goes upstream and a continuation
/// completes the barrier when the reply arrives.
fn barrier_check<E: Executor>(co: &mut Coordinator<E>, id: JobId) -> Result<(), WireError> {
    let job = co.jobs.get_mut(id).ok_or_else(|| unknown_job(id))?;
    trace!(
        job = id,
        entered = %job.barrier.entered(),
        subtree = %job.subtree_ranks,
        "barrier check"
    );
    if job.barrier.entered() != &job.subtree_ranks {
        return Ok(());
    }
    if job.target_ranks == job.subtree_ranks {
        debug!(
            job = id,
            seq = job.barrier.sequence(),
            "barrier complete on lowest common ancestor"
        );
        barrier_complete(co, id);
        return Ok(());
    }
    if job.barrier.upstream_notified() {
        return Ok(());
    }
    job.barrier.set_upstream_notified();
    let seq = job.barrier.sequence();
    let ranks = job.barrier.entered().clone();
    debug!(job = id, seq, ranks = %ranks, "barrier: notifying upstream");
    let stream = co
        .overlay
        .upstream_request(
            topic::NOTIFY,
            json!({
                "type": "barrier-enter",
                "data": { "id": id, "ranks": ranks, "seq": seq },
            }),
        )
        .map_err(|e| send_failed("barrier notify", e))?;
    co.releases
        .push(Box::pin(async move { (id, seq, stream.into_reply().await) }));
    Ok(())
}

/// Complete the current barrier invocation after an upstream release.
pub(crate) fn barrier_release<E: Executor>(co: &mut Coordinator<E>, id: JobId, seq: u64) {
    let job = match co.jobs.get_mut(id) {
        Some(job) => job,
        None => {
            warn!(job = id, "barrier release for unknown job");
            return;
        }
    };
    if job.barrier.sequence() != seq {
        warn!(
            job = id,
            seq,
            current = job.barrier.sequence(),
            "stale barrier release"
        );
        return;
    }
    barrier_complete(co, id);
}

/// Release every participant of the current invocation, then start the
/// next one.
///
/// Completion is strictly later than the entered event that triggered it;
/// after the reset, entries carrying the old sequence are rejected instead
/// of aliasing into the next invocation.
fn barrier_complete<E: Executor>(co: &mut Coordinator<E>, id: JobId) {
    let job = match co.jobs.get_mut(id) {
        Some(job) => job,
        None => return,
    };
    debug!(job = id, seq = job.barrier.sequence(), "barrier complete");
    job.barrier.respond_all();
    if let Some(task) = &job.task {
        if let Err(error) = task.write_protocol("exit=0\n") {
            warn!(job = id, %error, "barrier release write failed");
        }
    }
    job.barrier.reset();
}

/// Handle the downward `kill` action: signal the local task, if any.
pub(crate) fn kill_action<E: Executor>(
    co: &mut Coordinator<E>,
    id: JobId,
    signal: i32,
) -> Result<(), WireError> {
    debug!(job = id, signal, "kill");
    let job = co.jobs.get(id).ok_or_else(|| unknown_job(id))?;
    if let Some(task) = &job.task {
        if let Err(error) = task.kill(signal) {
            warn!(job = id, %error, "signal delivery failed");
        }
    }
    Ok(())
}

/// Handle an `exception` notify.
///
/// Exceptions are only accepted at the root; other ranks relay them one
/// hop up, since links are strictly parent/child. The root replies to the
/// originating start request and, at severity 0, tears the job down with
/// a TERM sweep over its subtree.
pub(crate) fn exception<E: Executor>(
    co: &mut Coordinator<E>,
    exception: Exception,
) -> Result<(), WireError> {
    if co.rank != 0 {
        debug!(job = exception.id, "relaying exception upstream");
        return co
            .overlay
            .upstream_send(
                topic::NOTIFY,
                json!({ "type": "exception", "data": exception }),
            )
            .map_err(|e| send_failed("exception relay", e));
    }

    warn!(
        job = exception.id,
        severity = exception.severity,
        kind = %exception.kind,
        note = %exception.note,
        "job exception"
    );
    let (request, subtree) = match co.jobs.get(exception.id) {
        Some(job) => (job.request.clone(), job.subtree_ranks.clone()),
        None => {
            error!(job = exception.id, "exception for unknown job");
            return Err(unknown_job(exception.id));
        }
    };

    if let Some(request) = request {
        let reply = json!({
            "id": exception.id,
            "type": "exception",
            "data": {
                "severity": exception.severity,
                "type": exception.kind,
                "note": exception.note,
            },
        });
        if let Err(error) = request.respond(reply) {
            warn!(job = exception.id, %error, "exception reply failed");
        }
    }

    if exception.severity == 0 {
        co.forward(
            "kill",
            &subtree,
            json!({ "id": exception.id, "signal": libc::SIGTERM }),
        )?;
    }
    Ok(())
}

/// Raise a severity-0 exec exception for `id` toward the root.
///
/// Used when a protocol step fails on behalf of a job; failures are never
/// swallowed into a silent per-node stall.
pub(crate) fn raise_exception<E: Executor>(co: &mut Coordinator<E>, id: JobId, note: String) {
    let ex = Exception {
        id,
        severity: 0,
        kind: "exec".to_string(),
        note,
    };
    if let Err(error) = exception(co, ex) {
        error!(job = id, %error, "failed to raise exception");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_failures_map_to_conventional_codes() {
        arbor_test::init();

        assert_eq!(failure_status(libc::EPERM), 126);
        assert_eq!(failure_status(libc::EACCES), 126);
        assert_eq!(failure_status(libc::ENOENT), 127);
        assert_eq!(failure_status(libc::EHOSTUNREACH), 68);
        assert_eq!(failure_status(libc::ENOMEM), 1);
    }
}
