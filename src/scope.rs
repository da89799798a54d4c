//! Execution-scoped args, environment and the per-fiber scope slot.
//!
//! One [`ScopeShared`] exists per top-level execution and is installed into
//! a tokio `task_local!` around every fiber, so user code can reach the
//! innermost active scope without threading handles by hand:
//! [`crate::args`], [`crate::env`] and [`crate::message`] resolve through
//! the slot. Independent top-level executions never share a scope.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form arguments supplied by the caller of `run`, readable from any
/// task during the execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionArgs {
    values: HashMap<String, Value>,
}

impl ExecutionArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// String view of an argument, when it is a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(Value::as_bool)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ExecutionArgs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut args = Self::new();
        for (key, value) in iter {
            args.insert(key, value);
        }
        args
    }
}

/// Read-only facts about the current execution.
#[derive(Debug, Clone)]
pub struct ExecutionEnv {
    /// Working directory captured at scope creation.
    pub working_dir: PathBuf,
    /// Timestamp of scope creation.
    pub started_at: SystemTime,
    /// Name of the root task of the current scope.
    pub root_task: Arc<str>,
}

/// Shared state of one execution scope.
pub(crate) struct ScopeShared {
    pub args: ExecutionArgs,
    pub env: ExecutionEnv,
    /// Out-of-band user messages, flushed after progress stops.
    pub messages: Mutex<Vec<String>>,
    /// Abort flag; once set, no new fibers start and pending pulls fail.
    pub aborted: AtomicBool,
}

impl ScopeShared {
    pub(crate) fn new(args: ExecutionArgs, root_task: Arc<str>) -> Self {
        Self {
            args,
            env: ExecutionEnv {
                working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
                started_at: SystemTime::now(),
                root_task,
            },
            messages: Mutex::new(Vec::new()),
            aborted: AtomicBool::new(false),
        }
    }

    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub(crate) fn push_message(&self, text: String) {
        self.messages.lock().push(text);
    }

    pub(crate) fn drain_messages(&self) -> Vec<String> {
        std::mem::take(&mut *self.messages.lock())
    }
}

tokio::task_local! {
    pub(crate) static CURRENT_SCOPE: Arc<ScopeShared>;
}

pub(crate) fn with_current<R>(f: impl FnOnce(&ScopeShared) -> R) -> Option<R> {
    CURRENT_SCOPE.try_with(|scope| f(scope)).ok()
}

/// Arguments of the innermost active scope, when called from a task.
pub fn args() -> Option<ExecutionArgs> {
    with_current(|scope| scope.args.clone())
}

/// Environment of the innermost active scope, when called from a task.
pub fn env() -> Option<ExecutionEnv> {
    with_current(|scope| scope.env.clone())
}

/// Queue out-of-band user-facing text.
///
/// Messages bypass the per-task capture and are flushed to the terminal
/// after progress display stops, so they never interleave with a live
/// renderer. Outside an execution the text prints immediately.
pub fn message(text: impl Into<String>) {
    let text = text.into();
    if with_current(|scope| scope.push_message(text.clone())).is_none() {
        println!("{}", text);
    }
}
