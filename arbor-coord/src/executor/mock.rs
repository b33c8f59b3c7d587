//! A scripted executor for tests.
//!
//! `MockExecutor` records every spawn and hands the test a [`MockTask`]:
//! the test drives the task lifecycle (running, output, exit) by emitting
//! events, and observes what the node does to the task (signals, protocol
//! writes) through the handle's channels.

use tokio::sync::mpsc;

use super::{Executor, OutputStream, TaskChannels, TaskEvent, TaskEventKind, TaskHandle, TaskSpec};

/// Records spawns; the paired [`MockSpawns`] yields one [`MockTask`] per
/// spawn.
pub struct MockExecutor {
    events: mpsc::UnboundedSender<TaskEvent>,
    spawned: mpsc::UnboundedSender<MockTask>,
}

/// The stream of tasks a [`MockExecutor`] has spawned.
pub struct MockSpawns {
    rx: mpsc::UnboundedReceiver<MockTask>,
}

impl MockExecutor {
    /// An executor reporting lifecycle on `events`, plus the spawn stream
    /// for the test to drive.
    pub fn new(events: mpsc::UnboundedSender<TaskEvent>) -> (MockExecutor, MockSpawns) {
        let (spawned, rx) = mpsc::unbounded_channel();
        (MockExecutor { events, spawned }, MockSpawns { rx })
    }
}

impl Executor for MockExecutor {
    fn spawn(&mut self, spec: TaskSpec) -> TaskHandle {
        let (handle, channels) = TaskHandle::channels(spec.protocol_channel);
        let task = MockTask {
            spec,
            events: self.events.clone(),
            channels,
        };
        let _ = self.spawned.send(task);
        handle
    }
}

impl MockSpawns {
    /// The next spawned task, in spawn order.
    pub async fn next(&mut self) -> Option<MockTask> {
        self.rx.recv().await
    }
}

/// One scripted task.
pub struct MockTask {
    /// What the coordinator asked to run.
    pub spec: TaskSpec,
    events: mpsc::UnboundedSender<TaskEvent>,
    channels: TaskChannels,
}

impl MockTask {
    fn emit(&self, kind: TaskEventKind) {
        let _ = self.events.send(TaskEvent {
            job: self.spec.job,
            kind,
        });
    }

    /// Report the task process as running.
    pub fn running(&self) {
        self.emit(TaskEventKind::Running);
    }

    /// Report task exit with `status`.
    pub fn exit(&self, status: i32) {
        self.emit(TaskEventKind::Exited { status });
    }

    /// Report a spawn/exec failure with `errno`.
    pub fn fail(&self, errno: i32) {
        self.emit(TaskEventKind::Failed { errno });
    }

    /// Emit one line of task output, without its trailing newline.
    pub fn output(&self, stream: OutputStream, line: &str) {
        self.emit(TaskEventKind::Output {
            stream,
            line: line.to_string(),
        });
    }

    /// Enter the job barrier, as the real task does by writing `enter\n`
    /// on the protocol channel.
    pub fn enter_barrier(&self) {
        self.output(OutputStream::Protocol, "enter");
    }

    /// The next protocol line the node wrote to the task, newline
    /// included. `None` when the task has no protocol channel or its
    /// handle is gone.
    pub async fn protocol_line(&mut self) -> Option<String> {
        match &mut self.channels.protocol {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// The next signal the node delivered to the task.
    pub async fn signal(&mut self) -> Option<i32> {
        self.channels.signals.recv().await
    }
}
