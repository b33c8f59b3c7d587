//! The local-executor seam.
//!
//! The coordinator spawns and controls one task per hosted job through an
//! [`Executor`]. Task lifecycle flows back as [`TaskEvent`]s on a channel
//! the coordinator owns, so every executor — the production
//! [`process::ProcessExecutor`] and the scripted [`mock::MockExecutor`] —
//! looks identical from the reactor's point of view.

use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::wire::JobId;

pub mod mock;
pub mod process;

/// What to run for one job on the local rank.
#[derive(Clone, Debug)]
pub struct TaskSpec {
    /// The job the task belongs to.
    pub job: JobId,
    /// The job-shell program.
    pub program: PathBuf,
    /// Program arguments; the job id is the sole argument.
    pub args: Vec<String>,
    /// The per-job storage namespace, exported in the environment.
    pub namespace: String,
    /// Open the auxiliary line-buffered protocol channel. Set when the
    /// job spans more than one rank and barriers are possible.
    pub protocol_channel: bool,
}

/// A task lifecycle event, delivered on the coordinator's event channel.
#[derive(Debug)]
pub struct TaskEvent {
    /// The job the event belongs to.
    pub job: JobId,
    /// What happened.
    pub kind: TaskEventKind,
}

/// Task lifecycle stages.
#[derive(Debug)]
pub enum TaskEventKind {
    /// The task process is running.
    Running,
    /// The task exited: the exit code, or `128 + signal` for a
    /// signal death.
    Exited {
        /// Exit status in conventional exit-code space.
        status: i32,
    },
    /// The task could not be spawned or exec'd.
    Failed {
        /// The spawn failure errno.
        errno: i32,
    },
    /// One line of task output. Lines arrive without their trailing
    /// newline.
    Output {
        /// Which stream produced the line.
        stream: OutputStream,
        /// The line content.
        line: String,
    },
}

/// The streams a task can produce output on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputStream {
    /// Task stdout.
    Stdout,
    /// Task stderr.
    Stderr,
    /// The auxiliary barrier protocol channel.
    Protocol,
}

/// Control handle for a spawned task.
///
/// Channel-backed so that every executor shares one handle type: the
/// executor keeps the receiving ends and applies signals and protocol
/// writes to its realization of the task.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    signals: mpsc::UnboundedSender<i32>,
    protocol: Option<mpsc::UnboundedSender<String>>,
}

/// The executor-side receiving ends of a [`TaskHandle`].
#[derive(Debug)]
pub struct TaskChannels {
    /// Signals requested for the task.
    pub signals: mpsc::UnboundedReceiver<i32>,
    /// Protocol lines to write to the task, newline included.
    pub protocol: Option<mpsc::UnboundedReceiver<String>>,
}

/// The task this handle controlled is gone.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
#[error("task is gone")]
pub struct TaskGone;

impl TaskHandle {
    /// Create a connected handle/channels pair. `protocol` matches
    /// [`TaskSpec::protocol_channel`].
    pub fn channels(protocol: bool) -> (TaskHandle, TaskChannels) {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (protocol_tx, protocol_rx) = if protocol {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        (
            TaskHandle {
                signals: signals_tx,
                protocol: protocol_tx,
            },
            TaskChannels {
                signals: signals_rx,
                protocol: protocol_rx,
            },
        )
    }

    /// Deliver `signal` to the task.
    pub fn kill(&self, signal: i32) -> Result<(), TaskGone> {
        self.signals.send(signal).map_err(|_| TaskGone)
    }

    /// Write one line on the protocol channel, newline included.
    ///
    /// Fails when the task has no protocol channel or is gone.
    pub fn write_protocol(&self, line: &str) -> Result<(), TaskGone> {
        match &self.protocol {
            Some(tx) => tx.send(line.to_string()).map_err(|_| TaskGone),
            None => Err(TaskGone),
        }
    }
}

/// Spawns and controls tasks on the local rank.
pub trait Executor {
    /// Start a task. Spawn failures are reported asynchronously as
    /// [`TaskEventKind::Failed`] on the event channel, never here.
    fn spawn(&mut self, spec: TaskSpec) -> TaskHandle;
}
