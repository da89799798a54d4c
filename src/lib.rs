//! # Taski
//!
//! Task-graph execution engine: typed tasks declare exported values and
//! consume values from other tasks; the engine discovers the dependency
//! graph, runs tasks in parallel honoring it, captures each task's output,
//! reports progress to observers, and supports symmetric teardown in
//! reverse order.
//!
//! ## Overview
//!
//! | Piece | What it does |
//! |---|---|
//! | [`Task`] + [`register_task!`] | Declare a task: `run`, optional `clean`, exported values, defined attributes |
//! | [`TaskContext::pull`] | The lazy pull; reading another task is the dependency edge |
//! | [`Executor`] | Entry points: `run`, `clean`, `run_and_clean`, with workers/args/observers/timeout |
//! | Static analyzer | Scans task sources for cross-task references to build the graph up front |
//! | [`ExecutionObserver`] | Lifecycle events for progress backends |
//! | [`AggregateError`] | Every failure of a run, with transparent matching by cause type |
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use taski::{register_task, Executor, Task, TaskContext};
//!
//! #[derive(Default)]
//! struct Sources { files: Vec<String> }
//! register_task!(Sources, exports = [files]);
//!
//! #[async_trait::async_trait]
//! impl Task for Sources {
//!     async fn run(&mut self, _ctx: &TaskContext) -> anyhow::Result<()> {
//!         self.files = vec!["main.c".into()];
//!         Ok(())
//!     }
//! }
//!
//! #[derive(Default)]
//! struct Build { artifact: String }
//! register_task!(Build, exports = [artifact]);
//!
//! #[async_trait::async_trait]
//! impl Task for Build {
//!     async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()> {
//!         use std::io::Write;
//!         let sources = ctx.pull::<Sources>().await?;   // dependency edge
//!         writeln!(ctx.out(), "{} files", sources.files.len())?;
//!         self.artifact = "out/app".into();
//!         Ok(())
//!     }
//! }
//!
//! let build = Executor::new().workers(4).run::<Build>()?;
//! assert_eq!(build.artifact, "out/app");
//! # Ok::<(), taski::Error>(())
//! ```
//!
//! ## Modules
//!
//! - [`task`] - the [`Task`] trait, descriptors and registration
//! - [`context`] - the per-fiber [`TaskContext`] handle
//! - [`executor`] - the façade and free helpers
//! - [`error`] - the error taxonomy ([`CycleError`], [`AggregateError`], ...)
//! - [`observer`] - lifecycle events
//! - [`output`] - per-task output capture
//! - [`define`] - lazily defined attributes
//! - [`scope`] - execution args and environment
//! - [`settings`] - the `TASKI_*` environment switches

mod analyzer;
pub mod context;
pub mod define;
pub mod error;
pub mod executor;
mod graph;
pub mod observer;
pub mod output;
pub mod registry;
mod scheduler;
pub mod scope;
pub mod settings;
pub mod task;

pub use context::{GroupGuard, TaskContext};
pub use define::{DefineCx, DefineDep, DefineSignal, Defines};
pub use error::{
    abort, AggregateError, CycleError, DependencyError, Error, TaskAbort, TaskFailure,
};
pub use executor::{reset, reset_all, tree, Executor};
pub use observer::{ExecutionObserver, NullObserver, Phase, TaskEvent, TaskState};
pub use output::{OutputHandle, OutputLine, TaskWriter, DEFAULT_TAIL_LINES};
pub use registry::TaskId;
pub use scope::{args, env, message, ExecutionArgs, ExecutionEnv};
pub use settings::{init_logging, ProgressMode, ProgressSettings};
pub use task::{RegisteredTask, Task, TaskDescriptor};

// The registration macro's expansion and user task impls both need these.
pub use async_trait::async_trait;

use std::sync::Arc;

/// Run the graph rooted at `T` with default settings.
pub fn run<T: RegisteredTask>() -> Result<Arc<T>, Error> {
    Executor::new().run::<T>()
}

/// Tear down `T`'s graph with default settings.
pub fn clean<T: RegisteredTask>() -> Result<(), Error> {
    Executor::new().clean::<T>()
}

/// Run then clean; teardown still executes when the run failed.
pub fn run_and_clean<T: RegisteredTask>() -> Result<Arc<T>, Error> {
    Executor::new().run_and_clean::<T>(true)
}
