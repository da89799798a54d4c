//! The per-fiber handle user code receives in `run` and `clean`.
//!
//! Every cross-task access goes through the context: [`TaskContext::pull`]
//! is the lazy pull (the engine's only organic suspension point besides
//! group boundaries and captured subprocess spawns), [`TaskContext::out`]
//! is the captured direct-output path, and [`TaskContext::command`] spawns
//! subprocesses whose stdout/stderr flow into the task's capture slot.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::define;
use crate::error::DependencyError;
use crate::observer::Phase;
use crate::output::{OutputShared, TaskWriter};
use crate::registry::{self, TaskId};
use crate::scheduler::SchedMsg;
use crate::scope::{ExecutionArgs, ExecutionEnv, ScopeShared};
use crate::task::RegisteredTask;

/// Execution context of one running task fiber.
#[derive(Clone)]
pub struct TaskContext {
    pub(crate) task: TaskId,
    pub(crate) name: Arc<str>,
    pub(crate) phase: Phase,
    pub(crate) scope: Arc<ScopeShared>,
    pub(crate) sched: mpsc::UnboundedSender<SchedMsg>,
    pub(crate) output: Arc<OutputShared>,
}

impl TaskContext {
    /// Short name of the task this context belongs to.
    pub fn task_name(&self) -> &str {
        &self.name
    }

    /// Which pass this context is executing in.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Read another task's exported values, running it first if needed.
    ///
    /// This is the dependency edge: the fiber suspends, the scheduler
    /// starts or awaits the dependency, and the sealed instance comes back
    /// once it completed. Errors are recoverable: catching one here keeps
    /// this task alive; propagating it fails this task with the
    /// dependency's failure in the cause chain.
    pub async fn pull<T: RegisteredTask>(&self) -> Result<Arc<T>, DependencyError> {
        let descriptor = T::descriptor();
        let dep = registry::global().intern_descriptor(descriptor);
        trace!(task = %self.name, dep = descriptor.name, "lazy pull");
        self.need(dep, Some(descriptor)).await?;
        let instance = registry::global()
            .instance(dep)
            .ok_or_else(|| DependencyError::NotAvailable {
                task: registry::global().short_name(dep),
            })?;
        instance
            .downcast::<T>()
            .map_err(|_| DependencyError::NotAvailable {
                task: registry::global().short_name(dep),
            })
    }

    /// Read a defined attribute of another task.
    ///
    /// Awaits the owner, then the thunk's discovered dependencies, then
    /// evaluates the thunk once and caches the value in the owner's slot.
    pub async fn pull_defined<T: RegisteredTask>(
        &self,
        attribute: &str,
    ) -> Result<Value, DependencyError> {
        let descriptor = T::descriptor();
        let registry = registry::global();
        let owner = registry.intern_descriptor(descriptor);
        self.need(owner, Some(descriptor)).await?;

        if let Some(cached) = registry.defined_value(owner, attribute) {
            return Ok(cached);
        }

        let thunks = registry.define_thunks(owner, descriptor);
        let (name, thunk) = thunks
            .get_key_value(attribute)
            .ok_or_else(|| DependencyError::UnknownAttribute {
                task: registry.short_name(owner),
                attribute: attribute.to_string(),
            })?;
        let name: &'static str = *name;

        let deps = match registry.define_deps(owner, name) {
            Some(cached) => cached,
            None => {
                let found = define::discover_deps(name, thunk);
                registry.set_define_deps(owner, name, found);
                registry
                    .define_deps(owner, name)
                    .unwrap_or_else(|| Arc::new(Vec::new()))
            }
        };
        for dep in deps.iter() {
            self.need(dep.id, Some(dep.descriptor)).await?;
        }

        let value = define::evaluate(thunk).map_err(|signal| DependencyError::DefineFailed {
            task: registry.short_name(owner),
            attribute: attribute.to_string(),
            message: signal.to_string(),
        })?;
        registry.cache_defined(owner, name, value.clone());
        Ok(value)
    }

    async fn need(
        &self,
        dep: TaskId,
        descriptor: Option<&'static crate::task::TaskDescriptor>,
    ) -> Result<(), DependencyError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sched
            .send(SchedMsg::Need {
                dep,
                descriptor,
                waiter: Some(self.task),
                reply: reply_tx,
            })
            .map_err(|_| DependencyError::Aborted)?;
        reply_rx.await.map_err(|_| DependencyError::Aborted)?
    }

    /// Captured direct-output writer for this task.
    pub fn out(&self) -> TaskWriter {
        TaskWriter::new(self.task, Arc::clone(&self.output))
    }

    /// Open a named output group. Lines written while the guard lives are
    /// tagged with the group; observers see started/completed events.
    /// Groups label output only; they never affect scheduling.
    pub fn group(&self, name: impl Into<Arc<str>>) -> GroupGuard {
        let name = name.into();
        self.output.push_group(self.task, Arc::clone(&name));
        let _ = self.sched.send(SchedMsg::GroupStarted {
            task: self.task,
            name: Arc::clone(&name),
        });
        GroupGuard {
            ctx: self.clone(),
            name,
        }
    }

    /// Spawn a subprocess on the captured I/O path: its stdout and stderr
    /// are drained into this task's output buffers.
    pub async fn command(&self, mut cmd: tokio::process::Command) -> anyhow::Result<ExitStatus> {
        if self.scope.is_aborted() {
            return Err(DependencyError::Aborted.into());
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_drain = self.spawn_drain(stdout);
        let err_drain = self.spawn_drain(stderr);

        let status = child.wait().await?;
        // Streams end when the child's write ends close; read errors are
        // treated as end-of-stream inside the drain.
        if let Some(handle) = out_drain {
            let _ = handle.await;
        }
        if let Some(handle) = err_drain {
            let _ = handle.await;
        }
        Ok(status)
    }

    fn spawn_drain<R>(&self, stream: Option<R>) -> Option<tokio::task::JoinHandle<()>>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let mut stream = stream?;
        let output = Arc::clone(&self.output);
        let task = self.task;
        Some(tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => output.append(task, &buf[..n]),
                }
            }
        }))
    }

    /// Arguments of the current execution.
    pub fn args(&self) -> &ExecutionArgs {
        &self.scope.args
    }

    /// Environment of the current execution.
    pub fn env(&self) -> &ExecutionEnv {
        &self.scope.env
    }

    /// Queue out-of-band user-facing text (see [`crate::message`]).
    pub fn message(&self, text: impl Into<String>) {
        self.scope.push_message(text.into());
    }
}

/// RAII guard of an open output group; closing happens on drop.
pub struct GroupGuard {
    ctx: TaskContext,
    name: Arc<str>,
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.ctx.output.pop_group(self.ctx.task);
        let _ = self.ctx.sched.send(SchedMsg::GroupCompleted {
            task: self.ctx.task,
            name: Arc::clone(&self.name),
        });
    }
}
