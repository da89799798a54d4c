//! The executor façade: public entry points over graph, pool and
//! scheduler.
//!
//! An [`Executor`] is a reusable configuration (worker count, args,
//! observers, timeout); each `run`/`clean` call creates one execution
//! scope, builds the dependency graph (failing fast on cycles before any
//! user code), spins up a dedicated worker pool, seeds the scheduler and
//! blocks until everything settles.
//!
//! Top-level executions serialize on a process-wide lock (the registry's
//! singleton instances must never see two fibers for one task), and a
//! façade call from inside a running task is rejected instead of nesting.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::{AggregateError, Error};
use crate::graph::TaskGraph;
use crate::observer::{ExecutionObserver, Observers, Phase};
use crate::output::{OutputRouter, DEFAULT_TAIL_LINES};
use crate::registry;
use crate::scheduler::{build_worker_pool, SchedMsg, Scheduler, DEFAULT_WORKERS};
use crate::scope::{self, ExecutionArgs, ScopeShared};
use crate::task::RegisteredTask;

/// One top-level execution at a time; singleton task slots are
/// process-global.
static EXEC_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Builder-style façade over the execution engine.
///
/// ```ignore
/// let build = Executor::new()
///     .workers(8)
///     .arg("profile", "release")
///     .run::<Build>()?;
/// ```
pub struct Executor {
    workers: usize,
    args: ExecutionArgs,
    observers: Vec<Arc<dyn ExecutionObserver>>,
    timeout: Option<Duration>,
    tail_lines: usize,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            args: ExecutionArgs::new(),
            observers: Vec::new(),
            timeout: None,
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    /// Worker thread count of the execution's pool.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Add one execution argument.
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key, value);
        self
    }

    /// Replace the execution arguments wholesale.
    pub fn args(mut self, args: ExecutionArgs) -> Self {
        self.args = args;
        self
    }

    /// Register a lifecycle observer.
    pub fn observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Cancel the execution if it runs longer than `timeout`; surfaces as
    /// an abort.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Bound of the per-task tail buffer kept for display and error
    /// reports.
    pub fn tail_lines(mut self, lines: usize) -> Self {
        self.tail_lines = lines.max(1);
        self
    }

    /// Run the graph rooted at `T` and return its sealed instance.
    #[instrument(skip(self), fields(root = T::descriptor().name))]
    pub fn run<T: RegisteredTask>(&self) -> Result<Arc<T>, Error> {
        self.reject_nested()?;
        let _serial = EXEC_LOCK.lock();

        let descriptor = T::descriptor();
        let graph = Arc::new(TaskGraph::build(descriptor));
        graph.ensure_acyclic()?;

        let scope = Arc::new(ScopeShared::new(self.args.clone(), descriptor.name.into()));
        let router = OutputRouter::new(self.tail_lines);
        let observers = Observers::new(self.observers.clone());
        let runtime = build_worker_pool(self.workers)?;

        let scheduler = Scheduler::new(
            Arc::clone(&graph),
            Arc::clone(&scope),
            observers.clone(),
            router.shared(),
            Phase::Run,
        );
        self.arm_timeout(&runtime, scheduler.sender());

        let handle = router.handle();
        observers.each(|o| o.on_ready(descriptor.name, &handle));
        observers.each(|o| o.on_start());
        debug!(workers = self.workers, "run pass starting");

        let outcome = runtime.block_on(scheduler.drive_run(descriptor));

        observers.each(|o| o.on_stop());
        flush_messages(&scope);
        drop(runtime);

        if let Some(abort) = outcome.abort {
            return Err(Error::Aborted(abort));
        }
        if outcome.root_completed {
            // Failures a recovering task swallowed do not fail the
            // execution; the root's completion is the success criterion.
            let instance = registry::global()
                .instance(T::id())
                .and_then(|any| any.downcast::<T>().ok())
                .ok_or_else(|| Error::RootUnavailable(descriptor.name.into()))?;
            return Ok(instance);
        }
        if outcome.failures.is_empty() {
            return Err(Error::RootUnavailable(descriptor.name.into()));
        }
        Err(Error::Aggregate(AggregateError::new(outcome.failures)))
    }

    /// Tear down every task of `T`'s graph that ran, in reverse dependency
    /// order. Failures inside one `clean` do not stop the others; a second
    /// call is a no-op.
    #[instrument(skip(self), fields(root = T::descriptor().name))]
    pub fn clean<T: RegisteredTask>(&self) -> Result<(), Error> {
        self.reject_nested()?;
        let _serial = EXEC_LOCK.lock();

        let descriptor = T::descriptor();
        let graph = Arc::new(TaskGraph::build(descriptor));
        graph.ensure_acyclic()?;

        let scope = Arc::new(ScopeShared::new(self.args.clone(), descriptor.name.into()));
        let router = OutputRouter::new(self.tail_lines);
        let observers = Observers::new(self.observers.clone());
        let runtime = build_worker_pool(self.workers)?;

        let scheduler = Scheduler::new(
            Arc::clone(&graph),
            Arc::clone(&scope),
            observers.clone(),
            router.shared(),
            Phase::Clean,
        );

        let handle = router.handle();
        observers.each(|o| o.on_ready(descriptor.name, &handle));
        observers.each(|o| o.on_start());
        debug!(workers = self.workers, "clean pass starting");

        let outcome = runtime.block_on(scheduler.drive_clean());

        observers.each(|o| o.on_stop());
        flush_messages(&scope);
        drop(runtime);

        if outcome.failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(AggregateError::new(outcome.failures)))
        }
    }

    /// `run` followed by `clean`. With `clean_on_failure` (the default
    /// behavior of [`crate::run_and_clean`]), teardown still executes when
    /// the run failed and both error sets are merged; an aborted run keeps
    /// abort priority over clean failures.
    pub fn run_and_clean<T: RegisteredTask>(
        &self,
        clean_on_failure: bool,
    ) -> Result<Arc<T>, Error> {
        let run_result = self.run::<T>();

        let run_clean = match &run_result {
            Ok(_) => true,
            Err(Error::Cycle(_)) | Err(Error::NestedExecution(_)) => false,
            Err(_) => clean_on_failure,
        };
        if !run_clean {
            return run_result;
        }

        let clean_result = self.clean::<T>();
        match (run_result, clean_result) {
            (Ok(instance), Ok(())) => Ok(instance),
            (Ok(_), Err(clean_error)) => Err(clean_error),
            // Abort outranks whatever the teardown collected.
            (Err(abort @ Error::Aborted(_)), _) => Err(abort),
            (Err(run_error), Ok(())) => Err(run_error),
            (Err(run_error), Err(clean_error)) => Err(merge_errors(run_error, clean_error)),
        }
    }

    fn reject_nested(&self) -> Result<(), Error> {
        match scope::with_current(|scope| Arc::clone(&scope.env.root_task)) {
            Some(root) => Err(Error::NestedExecution(root)),
            None => Ok(()),
        }
    }

    fn arm_timeout(
        &self,
        runtime: &tokio::runtime::Runtime,
        sched: tokio::sync::mpsc::UnboundedSender<SchedMsg>,
    ) {
        let Some(timeout) = self.timeout else {
            return;
        };
        runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = sched.send(SchedMsg::Cancel {
                reason: format!("execution timed out after {:?}", timeout),
            });
        });
    }
}

/// Merge the run and clean error sets into one aggregate; non-aggregate
/// run errors win outright.
fn merge_errors(run_error: Error, clean_error: Error) -> Error {
    match (run_error, clean_error) {
        (Error::Aggregate(run_agg), Error::Aggregate(clean_agg)) => {
            let mut failures = run_agg.failures().to_vec();
            failures.extend(clean_agg.failures().iter().cloned());
            Error::Aggregate(AggregateError::new(failures))
        }
        (run_error, _) => run_error,
    }
}

/// Queued `message` texts flush to the terminal only after progress
/// observers stopped, so they never interleave with a live renderer.
fn flush_messages(scope: &ScopeShared) {
    for message in scope.drain_messages() {
        println!("{}", message);
    }
}

/// Pretty-printed dependency tree rooted at `T`.
pub fn tree<T: RegisteredTask>() -> String {
    TaskGraph::build(T::descriptor()).render_tree()
}

/// Drop `T`'s cached instance and per-process state; the next execution
/// runs it again.
pub fn reset<T: RegisteredTask>() {
    registry::global().reset(T::id());
}

/// Reset every task's cached state. Mostly useful in tests.
pub fn reset_all() {
    registry::global().reset_all();
}
