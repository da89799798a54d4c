//! Output routing: per-task capture of direct writes and subprocess
//! streams.
//!
//! Each running task owns a capture slot in the router. Direct writes go
//! through the [`TaskWriter`] handed out by the task's context; subprocess
//! output reaches the same slot through piped child streams drained by
//! background tasks (see `TaskContext::command`). Every captured line is
//! tagged with the owning task and the group open at write time, and lands
//! in a bounded tail (last K lines, for live display and error reports)
//! plus an unbounded full buffer retained until the scope ends.
//!
//! A writer whose task already retired its slot discards silently; capture
//! ends, it never errors the writing side.

mod buffer;

pub use buffer::OutputLine;

use std::io;
use std::sync::Arc;

use dashmap::DashMap;

use crate::registry::TaskId;
use buffer::TaskBuffer;

/// Default bound of the per-task tail buffer.
pub const DEFAULT_TAIL_LINES: usize = 30;

pub(crate) struct OutputShared {
    buffers: DashMap<TaskId, TaskBuffer>,
    tail_limit: usize,
}

/// The per-execution output router.
pub(crate) struct OutputRouter {
    shared: Arc<OutputShared>,
}

impl OutputRouter {
    pub(crate) fn new(tail_limit: usize) -> Self {
        Self {
            shared: Arc::new(OutputShared {
                buffers: DashMap::new(),
                tail_limit: tail_limit.max(1),
            }),
        }
    }

    pub(crate) fn shared(&self) -> Arc<OutputShared> {
        Arc::clone(&self.shared)
    }

    /// Read-only view handed to observers.
    pub(crate) fn handle(&self) -> OutputHandle {
        OutputHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl OutputShared {
    /// Allocate the capture slot when a task enters `running`.
    pub(crate) fn open(&self, task: TaskId) {
        self.buffers.entry(task).or_default();
    }

    /// Retire the slot when the task settles: promote any unterminated
    /// trailing line. The buffers themselves live until the scope ends.
    pub(crate) fn close(&self, task: TaskId) {
        if let Some(mut buffer) = self.buffers.get_mut(&task) {
            buffer.flush_partial(self.tail_limit);
        }
    }

    pub(crate) fn append(&self, task: TaskId, bytes: &[u8]) {
        if let Some(mut buffer) = self.buffers.get_mut(&task) {
            buffer.append(bytes, self.tail_limit);
        }
    }

    pub(crate) fn push_group(&self, task: TaskId, name: Arc<str>) {
        if let Some(mut buffer) = self.buffers.get_mut(&task) {
            buffer.push_group(name);
        }
    }

    pub(crate) fn pop_group(&self, task: TaskId) {
        if let Some(mut buffer) = self.buffers.get_mut(&task) {
            buffer.pop_group();
        }
    }

    pub(crate) fn tail(&self, task: TaskId) -> Vec<OutputLine> {
        self.buffers
            .get(&task)
            .map(|buffer| buffer.tail())
            .unwrap_or_default()
    }

    pub(crate) fn tail_text(&self, task: TaskId) -> Vec<String> {
        self.tail(task).into_iter().map(|line| line.text).collect()
    }

    pub(crate) fn full(&self, task: TaskId) -> Vec<OutputLine> {
        self.buffers
            .get(&task)
            .map(|buffer| buffer.full())
            .unwrap_or_default()
    }
}

/// Read-only view into the captured buffers, passed to observers in
/// `on_ready` so progress backends can show live output.
#[derive(Clone)]
pub struct OutputHandle {
    shared: Arc<OutputShared>,
}

impl OutputHandle {
    /// Last captured lines of a task (bounded).
    pub fn tail(&self, task: TaskId) -> Vec<OutputLine> {
        self.shared.tail(task)
    }

    /// Full captured output of a task.
    pub fn full_output(&self, task: TaskId) -> Vec<OutputLine> {
        self.shared.full(task)
    }
}

/// `io::Write` adapter routing a task's direct prints into its capture
/// slot. Obtained from `TaskContext::out`.
#[derive(Clone)]
pub struct TaskWriter {
    task: TaskId,
    shared: Arc<OutputShared>,
}

impl TaskWriter {
    pub(crate) fn new(task: TaskId, shared: Arc<OutputShared>) -> Self {
        Self { task, shared }
    }
}

impl io::Write for TaskWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.shared.append(self.task, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
