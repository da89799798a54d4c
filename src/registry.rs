//! Process-global task registry.
//!
//! Maps each registered task type to a stable [`TaskId`] (interned by
//! fully qualified name) and a [`TaskSlot`] holding the type's descriptor,
//! its sealed singleton instance once it has run, its clean bookkeeping and
//! its cached define values.
//!
//! The registry outlives executions: a task that completed once does not
//! run again in the same process until [`Registry::reset`]. Execution-scoped
//! state (per-run task states, args, env) never lives here.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;

use crate::define::{DefineDep, DefineThunk, Defines};
use crate::task::TaskDescriptor;

/// Stable identity of a task type within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u32);

impl TaskId {
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Default)]
struct Interner {
    by_name: HashMap<Arc<str>, TaskId>,
    names: Vec<Arc<str>>,
}

impl Interner {
    fn intern(&mut self, name: &str) -> TaskId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let arc: Arc<str> = Arc::from(name);
        let id = TaskId(self.names.len() as u32);
        self.names.push(Arc::clone(&arc));
        self.by_name.insert(arc, id);
        id
    }
}

/// Per-type slot: descriptor binding plus process-lifetime run state.
#[derive(Default)]
pub(crate) struct TaskSlot {
    pub descriptor: Option<&'static TaskDescriptor>,
    /// Sealed instance, present once the task completed a run.
    pub instance: Option<Arc<dyn Any + Send + Sync>>,
    /// Whether the run pass consumed this task in this process.
    pub ran: bool,
    /// Whether the clean pass already tore this task down.
    pub cleaned: bool,
    /// Define thunks, collected once from the descriptor.
    pub define_thunks: Option<Arc<HashMap<&'static str, DefineThunk>>>,
    /// Discovered dependency sets per defined attribute.
    pub define_deps: HashMap<&'static str, Arc<Vec<DefineDep>>>,
    /// Evaluated define values, cached on first read.
    pub defined_values: HashMap<&'static str, Value>,
}

/// The process-global registry. Obtain it through [`global`].
pub struct Registry {
    interner: Mutex<Interner>,
    slots: DashMap<TaskId, TaskSlot>,
}

static REGISTRY: Lazy<Registry> = Lazy::new(|| Registry {
    interner: Mutex::new(Interner::default()),
    slots: DashMap::new(),
});

/// The process-global registry singleton, created lazily.
pub fn global() -> &'static Registry {
    &REGISTRY
}

impl Registry {
    /// Intern a task by fully qualified name, without binding a descriptor.
    ///
    /// The analyzer uses this for names it resolved statically before any
    /// typed pull has produced a descriptor for them.
    pub fn intern(&self, canonical_name: &str) -> TaskId {
        self.interner.lock().intern(canonical_name)
    }

    /// Intern a descriptor and bind it to its slot.
    pub fn intern_descriptor(&self, descriptor: &'static TaskDescriptor) -> TaskId {
        let id = self.intern(&descriptor.canonical_name());
        let mut slot = self.slots.entry(id).or_default();
        if slot.descriptor.is_none() {
            slot.descriptor = Some(descriptor);
        }
        id
    }

    /// Fully qualified name of an interned id.
    pub fn name(&self, id: TaskId) -> Arc<str> {
        let interner = self.interner.lock();
        Arc::clone(&interner.names[id.index()])
    }

    /// Short (type) name of an interned id.
    pub fn short_name(&self, id: TaskId) -> Arc<str> {
        let full = self.name(id);
        match full.rfind("::") {
            Some(pos) => Arc::from(&full[pos + 2..]),
            None => full,
        }
    }

    /// Id for a fully qualified name, if it was interned.
    pub fn lookup(&self, canonical_name: &str) -> Option<TaskId> {
        self.interner.lock().by_name.get(canonical_name).copied()
    }

    /// All interned names, for suffix resolution in the analyzer.
    pub(crate) fn interned_names(&self) -> Vec<Arc<str>> {
        self.interner.lock().names.clone()
    }

    pub(crate) fn descriptor(&self, id: TaskId) -> Option<&'static TaskDescriptor> {
        self.slots.get(&id).and_then(|slot| slot.descriptor)
    }

    /// Sealed instance of a completed task.
    pub(crate) fn instance(&self, id: TaskId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.slots.get(&id).and_then(|slot| slot.instance.clone())
    }

    /// Seal a finished instance and mark the task as run.
    pub(crate) fn seal(&self, id: TaskId, instance: Arc<dyn Any + Send + Sync>) {
        let mut slot = self.slots.entry(id).or_default();
        slot.instance = Some(instance);
        slot.ran = true;
        slot.cleaned = false;
    }

    /// Keep a failed task's partial instance so its `clean` can still
    /// release resources. The task does not count as run; pulls of it keep
    /// failing.
    pub(crate) fn stash_partial(&self, id: TaskId, instance: Arc<dyn Any + Send + Sync>) {
        let mut slot = self.slots.entry(id).or_default();
        slot.instance = Some(instance);
        slot.cleaned = false;
    }

    /// Whether the task completed a run in this process.
    pub(crate) fn has_run(&self, id: TaskId) -> bool {
        self.slots.get(&id).map(|slot| slot.ran).unwrap_or(false)
    }

    /// Whether any instance (sealed or partial) exists for the task.
    pub(crate) fn has_instance(&self, id: TaskId) -> bool {
        self.slots
            .get(&id)
            .map(|slot| slot.instance.is_some())
            .unwrap_or(false)
    }

    pub(crate) fn is_cleaned(&self, id: TaskId) -> bool {
        self.slots.get(&id).map(|slot| slot.cleaned).unwrap_or(false)
    }

    pub(crate) fn mark_cleaned(&self, id: TaskId) {
        if let Some(mut slot) = self.slots.get_mut(&id) {
            slot.cleaned = true;
        }
    }

    /// Define thunks of a task, collecting them from the descriptor on
    /// first access.
    pub(crate) fn define_thunks(
        &self,
        id: TaskId,
        descriptor: &'static TaskDescriptor,
    ) -> Arc<HashMap<&'static str, DefineThunk>> {
        let mut slot = self.slots.entry(id).or_default();
        if slot.descriptor.is_none() {
            slot.descriptor = Some(descriptor);
        }
        if let Some(thunks) = &slot.define_thunks {
            return Arc::clone(thunks);
        }
        let mut defs = Defines::default();
        (descriptor.register_defines)(&mut defs);
        let thunks = Arc::new(defs.into_thunks());
        slot.define_thunks = Some(Arc::clone(&thunks));
        thunks
    }

    pub(crate) fn define_deps(&self, id: TaskId, name: &str) -> Option<Arc<Vec<DefineDep>>> {
        self.slots
            .get(&id)
            .and_then(|slot| slot.define_deps.get(name).cloned())
    }

    pub(crate) fn set_define_deps(&self, id: TaskId, name: &'static str, deps: Vec<DefineDep>) {
        self.slots
            .entry(id)
            .or_default()
            .define_deps
            .insert(name, Arc::new(deps));
    }

    pub(crate) fn defined_value(&self, id: TaskId, name: &str) -> Option<Value> {
        self.slots
            .get(&id)
            .and_then(|slot| slot.defined_values.get(name).cloned())
    }

    pub(crate) fn cache_defined(&self, id: TaskId, name: &'static str, value: Value) {
        self.slots
            .entry(id)
            .or_default()
            .defined_values
            .insert(name, value);
    }

    /// Drop one task's cached instance and per-process state; the next
    /// execution runs it again. The descriptor binding survives.
    pub fn reset(&self, id: TaskId) {
        if let Some(mut slot) = self.slots.get_mut(&id) {
            slot.instance = None;
            slot.ran = false;
            slot.cleaned = false;
            slot.defined_values.clear();
        }
    }

    /// Reset every slot. Mostly useful in tests.
    pub fn reset_all(&self) {
        for mut slot in self.slots.iter_mut() {
            slot.instance = None;
            slot.ran = false;
            slot.cleaned = false;
            slot.defined_values.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let registry = global();
        let a = registry.intern("registry_test::Alpha");
        let b = registry.intern("registry_test::Beta");
        assert_ne!(a, b);
        assert_eq!(registry.intern("registry_test::Alpha"), a);
        assert_eq!(&*registry.name(a), "registry_test::Alpha");
        assert_eq!(&*registry.short_name(a), "Alpha");
    }

    #[test]
    fn reset_clears_run_state_only_for_that_task() {
        let registry = global();
        let a = registry.intern("registry_test::ResetA");
        let b = registry.intern("registry_test::ResetB");
        registry.seal(a, Arc::new(()) as Arc<dyn Any + Send + Sync>);
        registry.seal(b, Arc::new(()) as Arc<dyn Any + Send + Sync>);
        assert!(registry.has_run(a) && registry.has_run(b));

        registry.reset(a);
        assert!(!registry.has_run(a));
        assert!(registry.has_run(b));
    }
}
