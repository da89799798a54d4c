//! The scheduler: task state machine, resumption protocol and worker pool.
//!
//! One scheduler drives one pass (run or clean) of one execution scope. It
//! is an actor: fibers, the tokio tasks hosting user `run`/`clean` bodies,
//! communicate with it exclusively over a message channel, and all shared
//! state (the per-task state map, the waiter multimap, the failure list)
//! is owned by the actor loop, never touched during user code execution.
//!
//! ## Resumption protocol
//!
//! A fiber suspends only on a cross-task access, sending
//! [`SchedMsg::Need`] and awaiting the reply:
//!
//! | Dependency state | Scheduler action |
//! |---|---|
//! | completed | resume the caller immediately |
//! | failed / skipped | resume the caller with the error, so it propagates |
//! | pending | start the dependency, park the caller |
//! | running | park the caller |
//!
//! On settle, every parked waiter of the task wakes with the same outcome;
//! transitive dependents that never started are cascade-marked skipped.
//! A `Need` that would close a wait-for cycle (possible only through edges
//! the static analyzer could not see) resumes the caller with a
//! [`CycleError`] instead of deadlocking.
//!
//! ## Worker pool
//!
//! Workers are the threads of a per-execution tokio runtime
//! ([`build_worker_pool`]); fibers are cooperatively multiplexed over them
//! by the runtime's work-stealing queues. No framework lock is ever held
//! across a suspension point: the actor owns its state exclusively and
//! fibers hold none.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::SystemTime;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::context::TaskContext;
use crate::error::{CycleError, DependencyError, TaskAbort, TaskFailure};
use crate::graph::TaskGraph;
use crate::observer::{Observers, Phase, TaskEvent, TaskState};
use crate::output::OutputShared;
use crate::registry::{self, TaskId};
use crate::scope::{ScopeShared, CURRENT_SCOPE};
use crate::task::TaskDescriptor;

/// Default worker count when the caller does not choose one.
pub(crate) const DEFAULT_WORKERS: usize = 4;

/// Build the worker pool of one execution scope: a multi-thread tokio
/// runtime with exactly `workers` OS threads advancing fibers.
pub(crate) fn build_worker_pool(workers: usize) -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers.max(1))
        .thread_name("taski-worker")
        .enable_all()
        .build()
}

/// Messages fibers (and the façade) send to the scheduler actor.
pub(crate) enum SchedMsg {
    /// A fiber needs another task's values.
    Need {
        dep: TaskId,
        descriptor: Option<&'static TaskDescriptor>,
        /// The parked task, `None` for the façade's root seed.
        waiter: Option<TaskId>,
        reply: oneshot::Sender<Result<(), DependencyError>>,
    },
    /// A fiber finished.
    Settled { task: TaskId, outcome: FiberOutcome },
    GroupStarted { task: TaskId, name: Arc<str> },
    GroupCompleted { task: TaskId, name: Arc<str> },
    /// Caller-initiated cancellation (façade timeout).
    Cancel { reason: String },
}

pub(crate) enum FiberOutcome {
    Completed,
    Failed(Arc<TaskFailure>),
    /// The fiber raised the abort signal; the failure records it.
    Aborted(TaskAbort, Arc<TaskFailure>),
}

struct Waiter {
    task: Option<TaskId>,
    reply: oneshot::Sender<Result<(), DependencyError>>,
}

/// Result of the run pass.
pub(crate) struct RunOutcome {
    pub root_completed: bool,
    pub failures: Vec<Arc<TaskFailure>>,
    pub abort: Option<TaskAbort>,
}

/// Result of the clean pass.
pub(crate) struct CleanOutcome {
    pub failures: Vec<Arc<TaskFailure>>,
}

pub(crate) struct Scheduler {
    graph: Arc<TaskGraph>,
    scope: Arc<ScopeShared>,
    observers: Observers,
    output: Arc<OutputShared>,
    phase: Phase,
    tx: mpsc::UnboundedSender<SchedMsg>,
    rx: mpsc::UnboundedReceiver<SchedMsg>,
    states: HashMap<TaskId, TaskState>,
    waiters: HashMap<TaskId, Vec<Waiter>>,
    /// waiter -> dependencies it is currently parked on.
    waiting_on: HashMap<TaskId, HashSet<TaskId>>,
    failures: Vec<Arc<TaskFailure>>,
    failed_by_id: HashMap<TaskId, Arc<TaskFailure>>,
    abort: Option<TaskAbort>,
    /// Fibers spawned and not yet settled.
    live: usize,
}

impl Scheduler {
    pub(crate) fn new(
        graph: Arc<TaskGraph>,
        scope: Arc<ScopeShared>,
        observers: Observers,
        output: Arc<OutputShared>,
        phase: Phase,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            graph,
            scope,
            observers,
            output,
            phase,
            tx,
            rx,
            states: HashMap::new(),
            waiters: HashMap::new(),
            waiting_on: HashMap::new(),
            failures: Vec::new(),
            failed_by_id: HashMap::new(),
            abort: None,
            live: 0,
        }
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<SchedMsg> {
        self.tx.clone()
    }

    fn state(&self, task: TaskId) -> TaskState {
        self.states.get(&task).copied().unwrap_or(TaskState::Pending)
    }

    fn set_state(&mut self, task: TaskId, next: TaskState, failure: Option<Arc<TaskFailure>>) {
        let previous = self.state(task);
        if previous == next {
            return;
        }
        self.states.insert(task, next);
        let event = TaskEvent {
            task: registry::global().short_name(task),
            id: task,
            previous,
            current: next,
            phase: self.phase,
            at: SystemTime::now(),
            failure,
        };
        trace!(task = %event.task, ?previous, ?next, "state transition");
        self.observers.each(|o| o.on_task_updated(&event));
    }

    // ------------------------------------------------------------------
    // Run pass
    // ------------------------------------------------------------------

    /// Seed the root and drive until it settles and every in-flight fiber
    /// drained.
    pub(crate) async fn drive_run(mut self, root: &'static TaskDescriptor) -> RunOutcome {
        let root_id = registry::global().intern_descriptor(root);
        let (seed_tx, _seed_rx) = oneshot::channel();
        self.handle_need(root_id, Some(root), None, seed_tx);

        while !(self.state(root_id).is_terminal() && self.live == 0) {
            let Some(msg) = self.rx.recv().await else {
                break;
            };
            self.handle_run_msg(msg);
        }

        RunOutcome {
            root_completed: self.state(root_id) == TaskState::Completed,
            failures: std::mem::take(&mut self.failures),
            abort: self.abort.take(),
        }
    }

    fn handle_run_msg(&mut self, msg: SchedMsg) {
        match msg {
            SchedMsg::Need {
                dep,
                descriptor,
                waiter,
                reply,
            } => self.handle_need(dep, descriptor, waiter, reply),
            SchedMsg::Settled { task, outcome } => self.handle_settled(task, outcome),
            SchedMsg::GroupStarted { task, name } => {
                let task_name = registry::global().short_name(task);
                let phase = self.phase;
                self.observers
                    .each(|o| o.on_group_started(&task_name, &name, phase));
            }
            SchedMsg::GroupCompleted { task, name } => {
                let task_name = registry::global().short_name(task);
                let phase = self.phase;
                self.observers
                    .each(|o| o.on_group_completed(&task_name, &name, phase));
            }
            SchedMsg::Cancel { reason } => {
                debug!(%reason, "execution cancelled");
                self.scope.abort();
                if self.abort.is_none() {
                    self.abort = Some(TaskAbort::new(reason));
                }
                self.wake_everyone_aborted();
            }
        }
    }

    fn handle_need(
        &mut self,
        dep: TaskId,
        descriptor: Option<&'static TaskDescriptor>,
        waiter: Option<TaskId>,
        reply: oneshot::Sender<Result<(), DependencyError>>,
    ) {
        let registry = registry::global();
        // Once the abort is observed, every fiber resumption delivers it
        // and nothing new starts.
        if self.scope.is_aborted() && waiter.is_some() {
            let _ = reply.send(Err(DependencyError::Aborted));
            return;
        }
        match self.state(dep) {
            TaskState::Completed => {
                let _ = reply.send(Ok(()));
            }
            TaskState::Failed => {
                let _ = reply.send(Err(self.failed_reply(dep)));
            }
            TaskState::Skipped => {
                let _ = reply.send(Err(DependencyError::Skipped {
                    task: registry.short_name(dep),
                }));
            }
            TaskState::Running => {
                if let Some(cycle) = self.wait_cycle(waiter, dep) {
                    let _ = reply.send(Err(DependencyError::Cycle(cycle)));
                    return;
                }
                self.park(dep, waiter, reply);
            }
            TaskState::Pending => {
                if self.scope.is_aborted() {
                    let _ = reply.send(Err(DependencyError::Aborted));
                    return;
                }
                // Completed in an earlier execution of this process: the
                // cached instance satisfies the pull without a fiber.
                if registry.has_run(dep) {
                    self.set_state(dep, TaskState::Completed, None);
                    let _ = reply.send(Ok(()));
                    return;
                }
                let Some(descriptor) = descriptor.or_else(|| registry.descriptor(dep)) else {
                    warn!(
                        task = %registry.short_name(dep),
                        "dependency has no descriptor; it was never registered through a typed pull"
                    );
                    let _ = reply.send(Err(DependencyError::NotAvailable {
                        task: registry.short_name(dep),
                    }));
                    return;
                };
                self.start_run_fiber(dep, descriptor);
                self.park(dep, waiter, reply);
            }
        }
    }

    fn failed_reply(&self, dep: TaskId) -> DependencyError {
        let registry = registry::global();
        match self.failed_by_id.get(&dep) {
            Some(cause) => DependencyError::Failed {
                task: registry.short_name(dep),
                cause: Arc::clone(cause),
            },
            // Abort-marked without an ordinary failure record.
            None => DependencyError::Aborted,
        }
    }

    fn park(
        &mut self,
        dep: TaskId,
        waiter: Option<TaskId>,
        reply: oneshot::Sender<Result<(), DependencyError>>,
    ) {
        if let Some(task) = waiter {
            self.waiting_on.entry(task).or_default().insert(dep);
        }
        self.waiters
            .entry(dep)
            .or_default()
            .push(Waiter { task: waiter, reply });
    }

    /// Would `waiter -> dep` close a cycle through the parked fibers?
    fn wait_cycle(&self, waiter: Option<TaskId>, dep: TaskId) -> Option<CycleError> {
        let waiter = waiter?;
        let registry = registry::global();
        if waiter == dep {
            let name = registry.short_name(waiter).to_string();
            return Some(CycleError {
                path: vec![name.clone(), name],
            });
        }

        fn dfs(
            waiting_on: &HashMap<TaskId, HashSet<TaskId>>,
            current: TaskId,
            target: TaskId,
            visited: &mut HashSet<TaskId>,
            path: &mut Vec<TaskId>,
        ) -> bool {
            let Some(nexts) = waiting_on.get(&current) else {
                return false;
            };
            for &next in nexts {
                if next == target {
                    path.push(next);
                    return true;
                }
                if visited.insert(next) {
                    path.push(next);
                    if dfs(waiting_on, next, target, visited, path) {
                        return true;
                    }
                    path.pop();
                }
            }
            false
        }

        let mut visited = HashSet::new();
        let mut ids = vec![dep];
        if dfs(&self.waiting_on, dep, waiter, &mut visited, &mut ids) {
            let mut path = vec![registry.short_name(waiter).to_string()];
            path.extend(ids.iter().map(|&id| registry.short_name(id).to_string()));
            return Some(CycleError { path });
        }
        None
    }

    fn start_run_fiber(&mut self, task: TaskId, descriptor: &'static TaskDescriptor) {
        self.set_state(task, TaskState::Running, None);
        self.output.open(task);
        self.live += 1;

        let ctx = TaskContext {
            task,
            name: registry::global().short_name(task),
            phase: Phase::Run,
            scope: Arc::clone(&self.scope),
            sched: self.tx.clone(),
            output: Arc::clone(&self.output),
        };
        let tx = self.tx.clone();
        let scope = Arc::clone(&self.scope);
        debug!(task = %ctx.name, "fiber started");

        tokio::spawn(CURRENT_SCOPE.scope(scope, async move {
            let guarded = AssertUnwindSafe((descriptor.execute)(ctx.clone())).catch_unwind();
            let outcome = match guarded.await {
                Ok((sealed, Ok(()))) => {
                    // Seal before settling so every waiter resumed after
                    // the `done` observes the exported values.
                    registry::global().seal(task, sealed);
                    FiberOutcome::Completed
                }
                Ok((sealed, Err(error))) => {
                    // The partial snapshot lets the clean pass release
                    // whatever the task acquired before failing; it is
                    // never readable through pulls.
                    registry::global().stash_partial(task, sealed);
                    fiber_failure(&ctx, task, Phase::Run, error)
                }
                Err(panic) => fiber_failure(&ctx, task, Phase::Run, panic_error(panic)),
            };
            let _ = tx.send(SchedMsg::Settled { task, outcome });
        }));
    }

    fn handle_settled(&mut self, task: TaskId, outcome: FiberOutcome) {
        self.live -= 1;
        self.output.close(task);
        match outcome {
            FiberOutcome::Completed => {
                self.set_state(task, TaskState::Completed, None);
                self.wake(task, Ok(()));
            }
            FiberOutcome::Failed(failure) => {
                self.record_failure(task, Arc::clone(&failure));
                self.set_state(task, TaskState::Failed, Some(Arc::clone(&failure)));
                let registry = registry::global();
                let error = DependencyError::Failed {
                    task: registry.short_name(task),
                    cause: failure,
                };
                self.wake(task, Err(error));
                self.cascade_skip(task);
            }
            FiberOutcome::Aborted(abort, failure) => {
                debug!(task = %registry::global().short_name(task), "abort observed");
                self.scope.abort();
                if self.abort.is_none() {
                    self.abort = Some(abort);
                }
                self.record_failure(task, Arc::clone(&failure));
                self.set_state(task, TaskState::Failed, Some(failure));
                self.wake_everyone_aborted();
            }
        }
    }

    /// One aggregate entry per task, however many paths reach its failure.
    fn record_failure(&mut self, task: TaskId, failure: Arc<TaskFailure>) {
        if self.failed_by_id.contains_key(&task) {
            return;
        }
        self.failed_by_id.insert(task, Arc::clone(&failure));
        self.failures.push(failure);
    }

    fn wake(&mut self, dep: TaskId, result: Result<(), DependencyError>) {
        let Some(waiters) = self.waiters.remove(&dep) else {
            return;
        };
        for waiter in waiters {
            if let Some(task) = waiter.task {
                if let Some(deps) = self.waiting_on.get_mut(&task) {
                    deps.remove(&dep);
                }
            }
            let _ = waiter.reply.send(result.clone());
        }
    }

    /// Abort: resume every parked fiber with the abort error; nothing new
    /// starts afterwards because the scope flag is set.
    fn wake_everyone_aborted(&mut self) {
        let parked: Vec<TaskId> = self.waiters.keys().copied().collect();
        for dep in parked {
            self.wake(dep, Err(DependencyError::Aborted));
        }
    }

    /// Mark every transitive dependent that never started as skipped. A
    /// dependent already satisfied by an earlier execution's cached result
    /// does not need the failed task and is left alone.
    fn cascade_skip(&mut self, failed: TaskId) {
        for dependent in self.graph.transitive_dependents(failed) {
            if self.state(dependent) == TaskState::Pending
                && !registry::global().has_run(dependent)
            {
                self.set_state(dependent, TaskState::Skipped, None);
            }
        }
    }

    // ------------------------------------------------------------------
    // Clean pass
    // ------------------------------------------------------------------

    /// Tear down every task that ran, in reverse dependency order: a task
    /// cleans only after all of its dependents cleaned. Failures are
    /// collected and do not stop the remaining cleans; an abort raised in a
    /// `clean` is an ordinary clean-phase failure.
    pub(crate) async fn drive_clean(mut self) -> CleanOutcome {
        let registry = registry::global();
        // Every task that started a run, completed or failed, gets its
        // teardown; skipped and never-started tasks do not.
        let targets: Vec<TaskId> = self
            .graph
            .reverse_order()
            .into_iter()
            .filter(|&id| {
                registry.has_instance(id)
                    && !registry.is_cleaned(id)
                    && registry.descriptor(id).is_some()
            })
            .collect();
        let target_set: HashSet<TaskId> = targets.iter().copied().collect();

        // Dependents-remaining counters gate each clean start.
        let mut remaining: HashMap<TaskId, usize> = targets
            .iter()
            .map(|&id| {
                let blockers = self
                    .graph
                    .dependents(id)
                    .iter()
                    .filter(|d| target_set.contains(d))
                    .count();
                (id, blockers)
            })
            .collect();

        let total = targets.len();
        let mut settled = 0usize;
        for &task in &targets {
            if remaining[&task] == 0 {
                self.start_clean_fiber(task);
            }
        }

        while settled < total {
            let Some(msg) = self.rx.recv().await else {
                break;
            };
            match msg {
                SchedMsg::Settled { task, outcome } => {
                    settled += 1;
                    self.live -= 1;
                    self.output.close(task);
                    registry.mark_cleaned(task);
                    match outcome {
                        FiberOutcome::Completed => {
                            self.set_state(task, TaskState::Completed, None);
                        }
                        // Abort has no special rank during teardown.
                        FiberOutcome::Failed(failure)
                        | FiberOutcome::Aborted(_, failure) => {
                            self.record_failure(task, Arc::clone(&failure));
                            self.set_state(task, TaskState::Failed, Some(failure));
                        }
                    }
                    let unblocked: Vec<TaskId> = self
                        .graph
                        .dependencies(task)
                        .iter()
                        .filter(|dep| target_set.contains(dep))
                        .copied()
                        .collect();
                    for dep in unblocked {
                        if let Some(count) = remaining.get_mut(&dep) {
                            *count = count.saturating_sub(1);
                            if *count == 0 {
                                self.start_clean_fiber(dep);
                            }
                        }
                    }
                }
                SchedMsg::Need { dep, reply, .. } => {
                    // Clean-phase pulls resolve from sealed snapshots only.
                    if registry.has_run(dep) {
                        let _ = reply.send(Ok(()));
                    } else {
                        let _ = reply.send(Err(DependencyError::NotAvailable {
                            task: registry.short_name(dep),
                        }));
                    }
                }
                SchedMsg::GroupStarted { task, name } => {
                    let task_name = registry.short_name(task);
                    let phase = self.phase;
                    self.observers
                        .each(|o| o.on_group_started(&task_name, &name, phase));
                }
                SchedMsg::GroupCompleted { task, name } => {
                    let task_name = registry.short_name(task);
                    let phase = self.phase;
                    self.observers
                        .each(|o| o.on_group_completed(&task_name, &name, phase));
                }
                SchedMsg::Cancel { .. } => {
                    // Teardown keeps going; resources should still be
                    // released under cancellation.
                }
            }
        }

        CleanOutcome {
            failures: std::mem::take(&mut self.failures),
        }
    }

    fn start_clean_fiber(&mut self, task: TaskId) {
        let registry = registry::global();
        let Some(descriptor) = registry.descriptor(task) else {
            return;
        };
        let Some(instance) = registry.instance(task) else {
            return;
        };
        self.set_state(task, TaskState::Running, None);
        self.output.open(task);
        self.live += 1;

        let ctx = TaskContext {
            task,
            name: registry.short_name(task),
            phase: Phase::Clean,
            scope: Arc::clone(&self.scope),
            sched: self.tx.clone(),
            output: Arc::clone(&self.output),
        };
        let tx = self.tx.clone();
        let scope = Arc::clone(&self.scope);
        debug!(task = %ctx.name, "clean fiber started");

        tokio::spawn(CURRENT_SCOPE.scope(scope, async move {
            let guarded = AssertUnwindSafe((descriptor.clean)(instance, ctx.clone())).catch_unwind();
            let outcome = match guarded.await {
                Ok(Ok(())) => FiberOutcome::Completed,
                Ok(Err(error)) => fiber_failure(&ctx, task, Phase::Clean, error),
                Err(panic) => fiber_failure(&ctx, task, Phase::Clean, panic_error(panic)),
            };
            let _ = tx.send(SchedMsg::Settled { task, outcome });
        }));
    }
}

/// Turn a fiber panic into an ordinary error so the scheduler always
/// receives a settle.
fn panic_error(panic: Box<dyn Any + Send>) -> anyhow::Error {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic payload".to_string());
    anyhow::anyhow!("task panicked: {}", message)
}

/// Shape a fiber's escaped error into a failure record, classifying the
/// abort signal.
fn fiber_failure(
    ctx: &TaskContext,
    task: TaskId,
    phase: Phase,
    error: anyhow::Error,
) -> FiberOutcome {
    let abort = error
        .chain()
        .find_map(|e| e.downcast_ref::<TaskAbort>())
        .cloned();
    let failure = Arc::new(TaskFailure {
        task: Arc::clone(&ctx.name),
        id: task,
        phase,
        error,
        last_output: ctx.output.tail_text(task),
        at: SystemTime::now(),
    });
    match abort {
        Some(abort) => FiberOutcome::Aborted(abort, failure),
        None => FiberOutcome::Failed(failure),
    }
}
