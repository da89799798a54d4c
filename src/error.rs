//! # Taski Error Module
//!
//! Unified error handling for the execution engine.
//!
//! ## Design
//!
//! Errors are layered the way executions fail:
//!
//! 1. **Graph errors** ([`CycleError`]) surface before any user code runs.
//! 2. **Per-task failures** ([`TaskFailure`]) wrap whatever escaped a task's
//!    `run`/`clean` together with the task identity, phase and the last
//!    captured output lines.
//! 3. **Pull errors** ([`DependencyError`]) are what a lazy pull returns to
//!    the calling task; user code may recover from them or let them
//!    propagate, in which case the caller fails too.
//! 4. **Aggregates** ([`AggregateError`]) collect every task failure of one
//!    execution, de-duplicated per task, and support matching by the
//!    underlying error type so callers can test for a specific cause without
//!    unpacking the container by hand.
//! 5. **Abort** ([`TaskAbort`]) outranks everything: when an abort and
//!    ordinary failures coincide, only the abort reaches the caller.
//!
//! User task code returns `anyhow::Result<()>`; matching walks `anyhow`
//! source chains, so `aggregate.contains::<DbError>()` is true whenever any
//! collected failure has a `DbError` anywhere in its cause chain.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;

use crate::observer::Phase;
use crate::registry::TaskId;
use crate::task::RegisteredTask;

// ============================================================================
// CYCLE ERROR
// ============================================================================

/// A dependency cycle reachable from the root task.
///
/// Raised from the façade during graph construction, before any user code
/// runs, or at runtime when a wait-for cycle forms through dependencies the
/// analyzer could not see. `path` is an ordered walk of task names where the
/// first name appears again at the end, e.g. `["A", "B", "A"]`.
#[derive(Debug, Clone, Error)]
#[error("circular dependency detected: {}", path.join(" -> "))]
pub struct CycleError {
    /// The cycle as an ordered sequence of task names.
    pub path: Vec<String>,
}

// ============================================================================
// TASK FAILURE
// ============================================================================

/// One task's failure: identity, phase, cause and captured output.
#[derive(Debug)]
pub struct TaskFailure {
    /// Short task name (type name, without the module path).
    pub task: Arc<str>,
    /// Stable task id within the process.
    pub id: TaskId,
    /// Whether the task failed while running or while cleaning.
    pub phase: Phase,
    /// The error that escaped the task's user code.
    pub error: anyhow::Error,
    /// The last captured output lines of the task, for error reports.
    pub last_output: Vec<String>,
    /// When the failure was recorded.
    pub at: SystemTime,
}

impl TaskFailure {
    /// True if `E` appears anywhere in this failure's cause chain.
    pub fn is<E>(&self) -> bool
    where
        E: std::error::Error + 'static,
    {
        self.error.chain().any(|e| e.downcast_ref::<E>().is_some())
    }

    /// Downcast the first matching cause in the chain.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.chain().find_map(|e| e.downcast_ref::<E>())
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} failed: {}", self.task, self.error)
    }
}

impl std::error::Error for TaskFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

// ============================================================================
// DEPENDENCY ERROR (what a lazy pull returns)
// ============================================================================

/// Error returned by a lazy pull on another task.
///
/// Delivered to a waiter as if the waiter itself raised it at the pull call
/// site. User code may match on it and recover; propagating it fails the
/// calling task with the dependency's failure in its cause chain.
#[derive(Debug, Clone)]
pub enum DependencyError {
    /// The dependency ran and failed.
    Failed {
        task: Arc<str>,
        cause: Arc<TaskFailure>,
    },
    /// The dependency was cascade-skipped and never ran.
    Skipped { task: Arc<str> },
    /// The dependency never ran in this process, so its values cannot be
    /// read in the current phase (clean-phase pulls only resolve snapshots).
    NotAvailable { task: Arc<str> },
    /// The task has no defined attribute under the requested name.
    UnknownAttribute { task: Arc<str>, attribute: String },
    /// A defined attribute's thunk failed to evaluate.
    DefineFailed {
        task: Arc<str>,
        attribute: String,
        message: String,
    },
    /// The execution was aborted; no value will become available.
    Aborted,
    /// The pull closed a wait-for cycle at runtime.
    Cycle(CycleError),
}

impl fmt::Display for DependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { task, cause } => {
                write!(f, "dependency {} failed: {}", task, cause.error)
            }
            Self::Skipped { task } => write!(f, "dependency {} was skipped", task),
            Self::NotAvailable { task } => {
                write!(f, "dependency {} is not available in this phase", task)
            }
            Self::UnknownAttribute { task, attribute } => {
                write!(f, "task {} defines no attribute '{}'", task, attribute)
            }
            Self::DefineFailed {
                task,
                attribute,
                message,
            } => write!(f, "defined attribute {}.{} failed: {}", task, attribute, message),
            Self::Aborted => write!(f, "execution aborted"),
            Self::Cycle(cycle) => cycle.fmt(f),
        }
    }
}

impl std::error::Error for DependencyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            // Chain through to the dependency's own cause so that matching
            // by the original error type works across propagation hops.
            Self::Failed { cause, .. } => Some(cause.error.as_ref()),
            Self::Cycle(cycle) => Some(cycle),
            _ => None,
        }
    }
}

impl DependencyError {
    /// The task this error is about, if any.
    pub fn task(&self) -> Option<&str> {
        match self {
            Self::Failed { task, .. }
            | Self::Skipped { task }
            | Self::NotAvailable { task }
            | Self::UnknownAttribute { task, .. }
            | Self::DefineFailed { task, .. } => Some(task),
            Self::Aborted | Self::Cycle(_) => None,
        }
    }
}

// ============================================================================
// TASK ABORT
// ============================================================================

/// User-initiated abort signal.
///
/// Returning this from a task (see [`crate::abort`]) stops the execution:
/// no new tasks start, in-flight fibers observe the abort at their next
/// suspension, and the façade raises `Error::Aborted` with no accompanying
/// aggregate even when ordinary failures were also collected.
#[derive(Debug, Clone, Default)]
pub struct TaskAbort {
    /// Optional user-supplied reason.
    pub reason: Option<String>,
}

impl TaskAbort {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }
}

impl fmt::Display for TaskAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "execution aborted: {}", reason),
            None => write!(f, "execution aborted"),
        }
    }
}

impl std::error::Error for TaskAbort {}

// ============================================================================
// AGGREGATE ERROR
// ============================================================================

/// Every task failure collected during one execution.
///
/// Entries are de-duplicated per task (a failing dependency reached through
/// N paths is recorded once) and kept in settle order, so the originating
/// failure precedes the failures it cascaded into.
#[derive(Debug)]
pub struct AggregateError {
    failures: Vec<Arc<TaskFailure>>,
}

impl AggregateError {
    pub(crate) fn new(failures: Vec<Arc<TaskFailure>>) -> Self {
        Self { failures }
    }

    /// All collected failures, in settle order.
    pub fn failures(&self) -> &[Arc<TaskFailure>] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// True if any collected failure has an `E` in its cause chain.
    ///
    /// This is the transparent-match helper: a caller checking for a
    /// specific error kind tests the aggregate the same way it would test
    /// the error itself.
    pub fn contains<E>(&self) -> bool
    where
        E: std::error::Error + 'static,
    {
        self.failures.iter().any(|f| f.is::<E>())
    }

    /// First failure (in settle order) with an `E` in its cause chain.
    ///
    /// Settle order means the originating task's entry is found before the
    /// entries of tasks it cascaded into.
    pub fn find<E>(&self) -> Option<&TaskFailure>
    where
        E: std::error::Error + 'static,
    {
        self.failures.iter().find(|f| f.is::<E>()).map(Arc::as_ref)
    }

    /// Failure recorded for the given task, if it failed.
    pub fn for_task<T: RegisteredTask>(&self) -> Option<&TaskFailure> {
        let id = T::id();
        self.failures.iter().find(|f| f.id == id).map(Arc::as_ref)
    }

    /// True if the given task has an entry.
    pub fn contains_task<T: RegisteredTask>(&self) -> bool {
        self.for_task::<T>().is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskFailure> {
        self.failures.iter().map(Arc::as_ref)
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|f| f.error.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ============================================================================
// FAÇADE ERROR (top level)
// ============================================================================

/// Top-level error raised by the executor façade.
#[derive(Debug, Error)]
pub enum Error {
    /// The dependency graph contains a cycle.
    #[error(transparent)]
    Cycle(#[from] CycleError),

    /// One or more tasks failed; the aggregate holds all of them.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// The execution was aborted. Takes priority over any aggregate.
    #[error(transparent)]
    Aborted(#[from] TaskAbort),

    /// A façade entry point was called from inside a running task.
    #[error("nested executions are not supported: a task of scope '{0}' is already running")]
    NestedExecution(Arc<str>),

    /// The worker pool could not be started.
    #[error("worker pool failed to start: {0}")]
    Pool(#[from] std::io::Error),

    /// The root task completed in an unexpected state (engine invariant).
    #[error("root task {0} settled without result")]
    RootUnavailable(Arc<str>),
}

impl Error {
    /// The aggregate, when this error carries one.
    pub fn as_aggregate(&self) -> Option<&AggregateError> {
        match self {
            Self::Aggregate(aggregate) => Some(aggregate),
            _ => None,
        }
    }

    /// The cycle path, when this error is a cycle.
    pub fn cycle_path(&self) -> Option<&[String]> {
        match self {
            Self::Cycle(cycle) => Some(&cycle.path),
            _ => None,
        }
    }

    /// Transparent match across the aggregate, when present.
    pub fn contains<E>(&self) -> bool
    where
        E: std::error::Error + 'static,
    {
        match self {
            Self::Aggregate(aggregate) => aggregate.contains::<E>(),
            _ => false,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}

/// Build the abort error users return from `run` to stop the execution.
pub fn abort(reason: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(TaskAbort::new(reason))
}
