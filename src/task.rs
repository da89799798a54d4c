//! Task trait, type-erased descriptors and the registration macro.
//!
//! A task is a `Default`-constructible type implementing [`Task`] and
//! registered with [`register_task!`]. Registration generates a
//! [`TaskDescriptor`]: the type's name, module path and declaring source
//! file (feeding the static analyzer), its export list, and a small vtable
//! of monomorphized hooks the engine uses to run, stub and clean instances
//! behind `dyn` boundaries.
//!
//! Identity is per type: the registry interns `module_path::TypeName` into
//! a stable [`TaskId`], and at most one instance per type exists per
//! process until [`crate::reset`].

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::TaskContext;
use crate::define::Defines;
use crate::registry::{self, TaskId};

/// A unit of work in the task graph.
///
/// `run` builds the task's exported values by mutating `self`; once it
/// returns `Ok`, the instance is sealed and becomes readable by every other
/// task through [`TaskContext::pull`]. `clean` is the optional symmetric
/// teardown, invoked against the sealed instance during the clean pass in
/// reverse dependency order.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Build this task's values. Pulling another task here is what creates
    /// a dependency edge.
    async fn run(&mut self, ctx: &TaskContext) -> anyhow::Result<()>;

    /// Symmetric teardown. Default: nothing to release.
    async fn clean(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Register lazily computed attributes. Default: none.
    fn defines(defs: &mut Defines)
    where
        Self: Sized,
    {
        let _ = defs;
    }
}

/// Static description of a registered task type.
///
/// Generated by [`register_task!`]; one per type, interned into the global
/// registry on first use. The function pointers are monomorphized at the
/// registration site, which is what lets the engine drive arbitrary task
/// types through a uniform table.
pub struct TaskDescriptor {
    /// Type name, e.g. `Build`.
    pub name: &'static str,
    /// Module path at the registration site, e.g. `my_app::tasks`.
    pub module_path: &'static str,
    /// Source file the type was registered in, as reported by `file!()`.
    pub source_file: &'static str,
    /// Names of the attributes this task publishes.
    pub exports: &'static [&'static str],
    /// Construct a fresh instance and run it. The instance comes back in
    /// both outcomes: sealed for cross-task reads on success, stashed as a
    /// partial snapshot on failure so the clean pass can still release
    /// whatever the task acquired before failing.
    pub execute: fn(
        TaskContext,
    ) -> BoxFuture<'static, (Arc<dyn Any + Send + Sync>, anyhow::Result<()>)>,
    /// Invoke `clean` against a sealed instance.
    pub clean: fn(Arc<dyn Any + Send + Sync>, TaskContext) -> BoxFuture<'static, anyhow::Result<()>>,
    /// Build a default-valued stand-in handed to define thunks during
    /// dependency discovery.
    pub stub: fn() -> Arc<dyn Any + Send + Sync>,
    /// Collect the type's define thunks.
    pub register_defines: fn(&mut Defines),
}

impl TaskDescriptor {
    /// Fully qualified name used for identity interning and by the
    /// analyzer's name resolution.
    pub fn canonical_name(&self) -> String {
        format!("{}::{}", self.module_path, self.name)
    }
}

impl std::fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("name", &self.name)
            .field("module_path", &self.module_path)
            .field("source_file", &self.source_file)
            .field("exports", &self.exports)
            .finish()
    }
}

/// Implemented by [`register_task!`]; links a task type to its descriptor
/// and interned id.
pub trait RegisteredTask: Task + Default + Sized {
    fn descriptor() -> &'static TaskDescriptor;

    /// Stable id of this task type within the process.
    fn id() -> TaskId {
        registry::global().intern_descriptor(Self::descriptor())
    }
}

/// Register a task type with the engine.
///
/// ```ignore
/// #[derive(Default)]
/// struct Build { artifact: String }
/// taski::register_task!(Build, exports = [artifact]);
/// ```
///
/// The type must implement [`Task`] and `Default`. The optional `exports`
/// list names the attributes the task publishes; it feeds error reports and
/// the dependency tree, while cross-task reads stay typed field accesses on
/// the pulled instance.
#[macro_export]
macro_rules! register_task {
    ($ty:ident) => {
        $crate::register_task!($ty, exports = []);
    };
    ($ty:ident, exports = [$($export:ident),* $(,)?]) => {
        impl $crate::RegisteredTask for $ty {
            fn descriptor() -> &'static $crate::TaskDescriptor {
                static DESCRIPTOR: ::std::sync::OnceLock<$crate::TaskDescriptor> =
                    ::std::sync::OnceLock::new();
                DESCRIPTOR.get_or_init(|| $crate::TaskDescriptor {
                    name: ::core::stringify!($ty),
                    module_path: ::core::module_path!(),
                    source_file: ::core::file!(),
                    exports: &[$(::core::stringify!($export)),*],
                    execute: |ctx| {
                        ::std::boxed::Box::pin(async move {
                            let mut instance = <$ty as ::core::default::Default>::default();
                            let result = <$ty as $crate::Task>::run(&mut instance, &ctx).await;
                            let sealed = ::std::sync::Arc::new(instance)
                                as ::std::sync::Arc<
                                    dyn ::core::any::Any + ::core::marker::Send + ::core::marker::Sync,
                                >;
                            (sealed, result)
                        })
                    },
                    clean: |instance, ctx| {
                        ::std::boxed::Box::pin(async move {
                            let concrete: ::std::sync::Arc<$ty> = match instance.downcast() {
                                ::core::result::Result::Ok(concrete) => concrete,
                                ::core::result::Result::Err(_) => {
                                    ::core::unreachable!("task cleaned with a mismatched type")
                                }
                            };
                            <$ty as $crate::Task>::clean(&concrete, &ctx).await
                        })
                    },
                    stub: || {
                        ::std::sync::Arc::new(<$ty as ::core::default::Default>::default())
                    },
                    register_defines: |defs| <$ty as $crate::Task>::defines(defs),
                })
            }
        }
    };
}
