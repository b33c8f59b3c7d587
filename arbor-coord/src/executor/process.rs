//! The production executor: real child processes.
//!
//! Tasks run as children of the local node with line-buffered stdout and
//! stderr. When a job spans more than one rank, the task also gets the
//! auxiliary protocol channel: one end of a Unix socketpair dup'd onto a
//! fixed descriptor in the child and advertised through the environment.
//! The task writes `enter\n` there to enter the job barrier; the node
//! writes `exit=0\n` to release it.

use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Executor, OutputStream, TaskChannels, TaskEvent, TaskEventKind, TaskHandle, TaskSpec};
use crate::wire::JobId;

/// Environment variable naming the per-job storage namespace.
pub const NAMESPACE_ENV: &str = "ARBOR_JOB_NAMESPACE";

/// Environment variable naming the protocol channel's descriptor.
pub const PROTOCOL_FD_ENV: &str = "ARBOR_EXEC_PROTOCOL_FD";

/// The descriptor the protocol channel is dup'd onto in the child.
const PROTOCOL_FD: i32 = 3;

/// Scratch working directory for tasks.
const TASK_CWD: &str = "/tmp";

/// Spawns job tasks as local child processes.
pub struct ProcessExecutor {
    events: mpsc::UnboundedSender<TaskEvent>,
}

impl ProcessExecutor {
    /// An executor reporting task lifecycle on `events`.
    pub fn new(events: mpsc::UnboundedSender<TaskEvent>) -> ProcessExecutor {
        ProcessExecutor { events }
    }
}

impl Executor for ProcessExecutor {
    fn spawn(&mut self, spec: TaskSpec) -> TaskHandle {
        let (handle, channels) = TaskHandle::channels(spec.protocol_channel);
        let events = self.events.clone();
        tokio::spawn(run_task(spec, channels, events));
        handle
    }
}

fn send(events: &mpsc::UnboundedSender<TaskEvent>, job: JobId, kind: TaskEventKind) {
    let _ = events.send(TaskEvent { job, kind });
}

fn spawn_errno(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

async fn run_task(spec: TaskSpec, channels: TaskChannels, events: mpsc::UnboundedSender<TaskEvent>) {
    let job = spec.job;

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .env(NAMESPACE_ENV, &spec.namespace)
        .current_dir(TASK_CWD)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Wire up the protocol channel before spawning: the child end rides
    // across exec on a fixed descriptor, our end becomes an async stream.
    let mut protocol = None;
    let mut child_end = None;
    if spec.protocol_channel {
        match StdUnixStream::pair() {
            Ok((ours, theirs)) => {
                let theirs_fd = theirs.as_raw_fd();
                cmd.env(PROTOCOL_FD_ENV, PROTOCOL_FD.to_string());
                unsafe {
                    // dup2 clears close-on-exec on the duplicate
                    cmd.pre_exec(move || {
                        if libc::dup2(theirs_fd, PROTOCOL_FD) < 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }
                protocol = Some(ours);
                child_end = Some(theirs);
            }
            Err(err) => {
                warn!(job, %err, "failed to create protocol socketpair");
                send(&events, job, TaskEventKind::Failed { errno: spawn_errno(&err) });
                return;
            }
        }
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(job, program = %spec.program.display(), %err, "spawn failed");
            send(&events, job, TaskEventKind::Failed { errno: spawn_errno(&err) });
            return;
        }
    };
    // the child holds its own copy of the protocol descriptor now
    drop(child_end);

    debug!(job, program = %spec.program.display(), pid = child.id(), "task started");
    send(&events, job, TaskEventKind::Running);

    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(job, OutputStream::Stdout, stdout, events.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(job, OutputStream::Stderr, stderr, events.clone());
    }
    if let Some(stream) = protocol {
        match into_async(stream) {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                spawn_line_reader(job, OutputStream::Protocol, read_half, events.clone());
                if let Some(rx) = channels.protocol {
                    spawn_protocol_writer(job, write_half, rx);
                }
            }
            Err(err) => {
                warn!(job, %err, "failed to register protocol channel");
            }
        }
    }

    drive(job, &mut child, channels.signals, &events).await;
}

fn into_async(stream: StdUnixStream) -> std::io::Result<UnixStream> {
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

/// Wait for the child while applying requested signals.
async fn drive(
    job: JobId,
    child: &mut Child,
    mut signals: mpsc::UnboundedReceiver<i32>,
    events: &mpsc::UnboundedSender<TaskEvent>,
) {
    loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => {
                        let code = exit_code(status);
                        debug!(job, status = code, "task exited");
                        send(events, job, TaskEventKind::Exited { status: code });
                    }
                    Err(err) => {
                        warn!(job, %err, "wait failed");
                        send(events, job, TaskEventKind::Failed { errno: spawn_errno(&err) });
                    }
                }
                return;
            }
            Some(signal) = signals.recv() => {
                match child.id() {
                    Some(pid) => {
                        debug!(job, pid, signal, "delivering signal");
                        unsafe {
                            libc::kill(pid as i32, signal);
                        }
                    }
                    None => warn!(job, signal, "signal for reaped task"),
                }
            }
        }
    }
}

/// Map a wait status into conventional exit-code space.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

fn spawn_line_reader<R>(
    job: JobId,
    stream: OutputStream,
    reader: R,
    events: mpsc::UnboundedSender<TaskEvent>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    send(&events, job, TaskEventKind::Output { stream, line });
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(job, ?stream, %err, "task output read failed");
                    break;
                }
            }
        }
    });
}

fn spawn_protocol_writer(
    job: JobId,
    mut writer: tokio::net::unix::OwnedWriteHalf,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            if let Err(err) = writer.write_all(line.as_bytes()).await {
                warn!(job, %err, "protocol write failed");
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    /// Wait for task exit and `expect_lines` stdout lines.
    ///
    /// Output events come from separate reader tasks, so exit may be
    /// observed before the last line; wait for both.
    async fn collect(
        events: &mut mpsc::UnboundedReceiver<TaskEvent>,
        expect_lines: usize,
    ) -> (Vec<String>, i32) {
        let mut lines = Vec::new();
        let mut status = None;
        while status.is_none() || lines.len() < expect_lines {
            match events.recv().await.expect("events flow").kind {
                TaskEventKind::Running => {}
                TaskEventKind::Output { stream, line } => {
                    if stream == OutputStream::Stdout {
                        lines.push(line);
                    }
                }
                TaskEventKind::Exited { status: code } => status = Some(code),
                TaskEventKind::Failed { errno } => panic!("spawn failed: {}", errno),
            }
        }
        (lines, status.unwrap_or(1))
    }

    fn spec(program: &str, args: &[&str]) -> TaskSpec {
        TaskSpec {
            job: 1,
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            namespace: "job-1".to_string(),
            protocol_channel: false,
        }
    }

    #[tokio::test]
    async fn runs_a_child_and_captures_output() {
        arbor_test::init();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut executor = ProcessExecutor::new(tx);
        executor.spawn(spec("/bin/sh", &["-c", "echo one; echo two"]));

        let (lines, status) = collect(&mut rx, 2).await;
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(status, 0);
    }

    #[tokio::test]
    async fn reports_exit_codes() {
        arbor_test::init();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut executor = ProcessExecutor::new(tx);
        executor.spawn(spec("/bin/sh", &["-c", "exit 3"]));

        let (_, status) = collect(&mut rx, 0).await;
        assert_eq!(status, 3);
    }

    #[tokio::test]
    async fn missing_program_fails_with_enoent() {
        arbor_test::init();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut executor = ProcessExecutor::new(tx);
        executor.spawn(spec("/no/such/job-shell", &[]));

        match rx.recv().await.expect("event").kind {
            TaskEventKind::Failed { errno } => assert_eq!(errno, libc::ENOENT),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn signals_reach_the_child() {
        arbor_test::init();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut executor = ProcessExecutor::new(tx);
        let handle = executor.spawn(spec("/bin/sh", &["-c", "sleep 30"]));

        match rx.recv().await.expect("event").kind {
            TaskEventKind::Running => {}
            other => panic!("unexpected event: {:?}", other),
        }
        handle.kill(libc::SIGTERM).expect("task is alive");

        let (_, status) = collect(&mut rx, 0).await;
        assert_eq!(status, 128 + libc::SIGTERM);
    }
}
