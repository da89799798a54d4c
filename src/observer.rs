//! Lifecycle observation surface.
//!
//! The scheduler emits events to every registered [`ExecutionObserver`]:
//! execution start/stop, per-task state transitions, and group boundaries.
//! Progress renderers, loggers and test probes all plug in here; the engine
//! ships only [`NullObserver`].
//!
//! Events are ordered per task but interleave across tasks. An observer that
//! panics is logged and ignored; observation never fails an execution.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TaskFailure;
use crate::output::OutputHandle;
use crate::registry::TaskId;

/// Lifecycle state of a task within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    /// Cascade-marked: an upstream dependency failed before this task started.
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Which pass a task event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Run,
    Clean,
}

/// Payload of a task state transition.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    /// Short task name (type name).
    pub task: Arc<str>,
    /// Stable task id within the process.
    pub id: TaskId,
    /// State before the transition.
    pub previous: TaskState,
    /// State after the transition.
    pub current: TaskState,
    /// Run or clean pass.
    pub phase: Phase,
    /// When the transition was recorded.
    pub at: SystemTime,
    /// The failure, for transitions into `Failed`.
    pub failure: Option<Arc<TaskFailure>>,
}

/// Sink for execution lifecycle events.
///
/// All methods default to no-ops so observers implement only what they need.
pub trait ExecutionObserver: Send + Sync {
    /// The execution is assembled: graph built, output router live. `root`
    /// is the root task's name; `output` reads captured output buffers.
    fn on_ready(&self, root: &str, output: &OutputHandle) {
        let _ = (root, output);
    }

    /// Workers are up; the root is about to be seeded.
    fn on_start(&self) {}

    /// The execution settled; no further events will follow.
    fn on_stop(&self) {}

    /// A task transitioned between states.
    fn on_task_updated(&self, event: &TaskEvent) {
        let _ = event;
    }

    /// A task opened a named output group.
    fn on_group_started(&self, task: &str, group: &str, phase: Phase) {
        let _ = (task, group, phase);
    }

    /// A task closed a named output group.
    fn on_group_completed(&self, task: &str, group: &str, phase: Phase) {
        let _ = (task, group, phase);
    }
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ExecutionObserver for NullObserver {}

/// Fan-out over the registered observers of one execution scope.
#[derive(Clone, Default)]
pub(crate) struct Observers {
    list: Arc<Vec<Arc<dyn ExecutionObserver>>>,
}

impl Observers {
    pub(crate) fn new(list: Vec<Arc<dyn ExecutionObserver>>) -> Self {
        Self {
            list: Arc::new(list),
        }
    }

    /// Invoke `emit` on every observer, isolating panics.
    pub(crate) fn each(&self, emit: impl Fn(&dyn ExecutionObserver)) {
        for observer in self.list.iter() {
            if catch_unwind(AssertUnwindSafe(|| emit(observer.as_ref()))).is_err() {
                warn!("observer panicked during notification; continuing");
            }
        }
    }
}
