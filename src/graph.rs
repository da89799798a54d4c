//! Dependency graph over task types.
//!
//! Built by closing over the analyzer's output for `run` and `clean` plus
//! the define thunks' discovered dependencies, rooted at one task. The
//! graph is advisory for execution order (the scheduler's lazy pulls decide
//! what actually runs) but authoritative for cycle detection, cascade-skip
//! bookkeeping, the clean pass ordering and tree rendering.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::debug;

use crate::analyzer::{Analyzer, MethodKind};
use crate::define;
use crate::error::CycleError;
use crate::registry::{self, TaskId};
use crate::task::TaskDescriptor;

/// The dependency graph of one execution, rooted at the task being run.
pub(crate) struct TaskGraph {
    root: TaskId,
    nodes: Vec<TaskId>,
    /// `A -> [B]`: A's body references B.
    deps: HashMap<TaskId, Vec<TaskId>>,
    /// Transposed edges.
    dependents: HashMap<TaskId, Vec<TaskId>>,
}

impl TaskGraph {
    /// Close over every task reachable from `root` through static analysis
    /// and define discovery.
    pub(crate) fn build(root: &'static TaskDescriptor) -> Self {
        let registry = registry::global();
        let mut analyzer = Analyzer::new();
        analyzer.ensure_descriptor(root);
        let root_id = registry.intern_descriptor(root);

        let mut nodes: Vec<TaskId> = Vec::new();
        let mut deps: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut queue: VecDeque<TaskId> = VecDeque::new();
        let mut visited: HashSet<TaskId> = HashSet::new();

        queue.push_back(root_id);
        visited.insert(root_id);

        while let Some(id) = queue.pop_front() {
            nodes.push(id);
            let canonical = registry.name(id);
            if let Some(descriptor) = registry.descriptor(id) {
                analyzer.ensure_descriptor(descriptor);
            }

            let mut edge_set: Vec<TaskId> = Vec::new();
            let mut seen: HashSet<TaskId> = HashSet::new();
            for kind in [MethodKind::Run, MethodKind::Clean, MethodKind::Defines] {
                for &dep in analyzer.deps(&canonical, kind).iter() {
                    if dep != id && seen.insert(dep) {
                        edge_set.push(dep);
                    }
                }
            }
            // Define thunks contribute dynamically discovered dependencies
            // on top of the static scan.
            if let Some(descriptor) = registry.descriptor(id) {
                let thunks = registry.define_thunks(id, descriptor);
                for (&name, thunk) in thunks.iter() {
                    let discovered = match registry.define_deps(id, name) {
                        Some(cached) => cached,
                        None => {
                            let found = define::discover_deps(name, thunk);
                            registry.set_define_deps(id, name, found);
                            registry
                                .define_deps(id, name)
                                .unwrap_or_else(|| Arc::new(Vec::new()))
                        }
                    };
                    for dep in discovered.iter() {
                        if dep.id != id && seen.insert(dep.id) {
                            edge_set.push(dep.id);
                        }
                    }
                }
            }

            debug!(
                task = %registry.short_name(id),
                deps = edge_set.len(),
                "graph node resolved"
            );
            for &dep in &edge_set {
                dependents.entry(dep).or_default().push(id);
                if visited.insert(dep) {
                    queue.push_back(dep);
                }
            }
            deps.insert(id, edge_set);
        }

        Self {
            root: root_id,
            nodes,
            deps,
            dependents,
        }
    }

    pub(crate) fn dependencies(&self, id: TaskId) -> &[TaskId] {
        static EMPTY: &[TaskId] = &[];
        self.deps.get(&id).map(Vec::as_slice).unwrap_or(EMPTY)
    }

    pub(crate) fn dependents(&self, id: TaskId) -> &[TaskId] {
        static EMPTY: &[TaskId] = &[];
        self.dependents
            .get(&id)
            .map(Vec::as_slice)
            .unwrap_or(EMPTY)
    }

    /// Every task that transitively depends on `id`, excluding `id`.
    pub(crate) fn transitive_dependents(&self, id: TaskId) -> HashSet<TaskId> {
        let mut found: HashSet<TaskId> = HashSet::new();
        let mut queue: VecDeque<TaskId> = self.dependents(id).iter().copied().collect();
        while let Some(current) = queue.pop_front() {
            if found.insert(current) {
                queue.extend(self.dependents(current).iter().copied());
            }
        }
        found
    }

    /// Three-color depth-first cycle check. The error carries the cycle as
    /// an ordered walk of short names with the entry repeated at the end.
    pub(crate) fn ensure_acyclic(&self) -> Result<(), CycleError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn visit(
            graph: &TaskGraph,
            id: TaskId,
            colors: &mut HashMap<TaskId, Color>,
            path: &mut Vec<TaskId>,
        ) -> Option<Vec<TaskId>> {
            colors.insert(id, Color::Gray);
            path.push(id);
            for &dep in graph.dependencies(id) {
                match colors.get(&dep).copied().unwrap_or(Color::White) {
                    Color::Gray => {
                        let start = path.iter().position(|&p| p == dep).unwrap_or(0);
                        let mut cycle: Vec<TaskId> = path[start..].to_vec();
                        cycle.push(dep);
                        return Some(cycle);
                    }
                    Color::White => {
                        if let Some(cycle) = visit(graph, dep, colors, path) {
                            return Some(cycle);
                        }
                    }
                    Color::Black => {}
                }
            }
            path.pop();
            colors.insert(id, Color::Black);
            None
        }

        let mut colors: HashMap<TaskId, Color> = HashMap::new();
        let mut path: Vec<TaskId> = Vec::new();
        for &node in &self.nodes {
            if colors.get(&node).copied().unwrap_or(Color::White) == Color::White {
                if let Some(cycle) = visit(self, node, &mut colors, &mut path) {
                    let registry = registry::global();
                    return Err(CycleError {
                        path: cycle
                            .into_iter()
                            .map(|id| registry.short_name(id).to_string())
                            .collect(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Dependency-first order: every task appears after the tasks it
    /// depends on. A hint for logging and the clean pass; run-phase order
    /// is emergent from the scheduler.
    pub(crate) fn dependency_order(&self) -> Vec<TaskId> {
        fn visit(
            graph: &TaskGraph,
            id: TaskId,
            done: &mut HashSet<TaskId>,
            order: &mut Vec<TaskId>,
        ) {
            if !done.insert(id) {
                return;
            }
            for &dep in graph.dependencies(id) {
                visit(graph, dep, done, order);
            }
            order.push(id);
        }

        let mut order: Vec<TaskId> = Vec::new();
        let mut done: HashSet<TaskId> = HashSet::new();
        for &node in &self.nodes {
            visit(self, node, &mut done, &mut order);
        }
        order
    }

    /// The transposed order, used by the clean pass.
    pub(crate) fn reverse_order(&self) -> Vec<TaskId> {
        let mut order = self.dependency_order();
        order.reverse();
        order
    }

    /// Pretty-printed dependency tree rooted at the graph root. Cycle-safe:
    /// a task already on the current path renders as a marker instead of
    /// recursing.
    pub(crate) fn render_tree(&self) -> String {
        let mut out = String::new();
        let registry = registry::global();
        let _ = writeln!(out, "{}", registry.short_name(self.root));
        let mut on_path: HashSet<TaskId> = HashSet::new();
        on_path.insert(self.root);
        self.render_children(self.root, "", &mut on_path, &mut out);
        out
    }

    fn render_children(
        &self,
        id: TaskId,
        prefix: &str,
        on_path: &mut HashSet<TaskId>,
        out: &mut String,
    ) {
        let registry = registry::global();
        let children = self.dependencies(id);
        for (i, &child) in children.iter().enumerate() {
            let last = i + 1 == children.len();
            let branch = if last { "└── " } else { "├── " };
            let continuation = if last { "    " } else { "│   " };
            if on_path.contains(&child) {
                let _ = writeln!(
                    out,
                    "{}{}{} (cycle)",
                    prefix,
                    branch,
                    registry.short_name(child)
                );
                continue;
            }
            let _ = writeln!(out, "{}{}{}", prefix, branch, registry.short_name(child));
            on_path.insert(child);
            self.render_children(child, &format!("{}{}", prefix, continuation), on_path, out);
            on_path.remove(&child);
        }
    }
}
