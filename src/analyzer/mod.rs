//! Static dependency analysis.
//!
//! Given a registered task type, the analyzer discovers the set of task
//! types its `run`/`clean`/`defines` bodies reference, transitively through
//! same-type helper methods. It parses the declaring source file (captured
//! at registration via `file!()`), indexes the file's module tree, collects
//! every syntactic path reference in the relevant bodies, and resolves each
//! one the way the compiler would: innermost module first, then `use`
//! imports, then each enclosing module, finally the process-wide set of
//! already-interned task names.
//!
//! Results are memoized per `(task, method)` for the process lifetime. When
//! a source cannot be located or parsed the analysis of it yields an empty
//! set with a diagnostic; the runtime's lazy-pull protocol still resolves
//! such dependencies, at the price of a graph the engine could not inspect
//! up front.

mod index;
mod scan;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::registry::{self, TaskId};
use crate::task::TaskDescriptor;
use index::FileIndex;

/// Which body of a task is being analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum MethodKind {
    Run,
    Clean,
    Defines,
}

impl MethodKind {
    fn method_name(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Clean => "clean",
            Self::Defines => "defines",
        }
    }
}

static MEMO: Lazy<DashMap<(String, MethodKind), Arc<Vec<TaskId>>>> = Lazy::new(DashMap::new);

struct IndexedFile {
    index: FileIndex,
    /// Module path of the file's root scope, e.g. `my_app::tasks`.
    base: Vec<String>,
}

/// Where a task declaration lives inside the session's indexes.
#[derive(Clone, Copy)]
struct DeclSite {
    file: usize,
    scope: usize,
}

/// One analysis session: the indexed files reachable from the root task
/// plus the resolved declaration table. Sessions are cheap to rebuild; the
/// expensive per-method scans are memoized globally.
pub(crate) struct Analyzer {
    files: Vec<IndexedFile>,
    indexed_paths: HashSet<PathBuf>,
    decls: HashMap<String, DeclSite>,
}

impl Analyzer {
    pub(crate) fn new() -> Self {
        Self {
            files: Vec::new(),
            indexed_paths: HashSet::new(),
            decls: HashMap::new(),
        }
    }

    /// Make sure the descriptor's declaring file is indexed.
    pub(crate) fn ensure_descriptor(&mut self, descriptor: &'static TaskDescriptor) {
        if self.decls.contains_key(&descriptor.canonical_name()) {
            return;
        }
        let Some(path) = locate_source(descriptor.source_file) else {
            warn!(
                task = descriptor.name,
                file = descriptor.source_file,
                "task source not found; static analysis for it is skipped"
            );
            return;
        };
        if !self.indexed_paths.insert(path.clone()) {
            return;
        }
        let file_index = FileIndex::build(&path);
        let base = anchor_base(&file_index, descriptor);
        let file_slot = self.files.len();
        self.files.push(IndexedFile {
            index: file_index,
            base,
        });
        self.adopt_declarations(file_slot);
    }

    /// Register every task declaration of a newly indexed file in the
    /// declaration table, interning their canonical names.
    fn adopt_declarations(&mut self, file: usize) {
        let indexed = &self.files[file];
        let mut adopted = Vec::new();
        for (scope_idx, scope) in indexed.index.scopes.iter().enumerate() {
            for name in &scope.registered {
                let canonical = join_canonical(&indexed.base, &scope.segments, name);
                adopted.push((canonical, DeclSite { file, scope: scope_idx }));
            }
        }
        for (canonical, site) in adopted {
            registry::global().intern(&canonical);
            self.decls.entry(canonical).or_insert(site);
        }
    }

    /// Task types referenced from `canonical`'s body of the given kind.
    pub(crate) fn deps(&self, canonical: &str, kind: MethodKind) -> Arc<Vec<TaskId>> {
        let key = (canonical.to_string(), kind);
        if let Some(memoized) = MEMO.get(&key) {
            return Arc::clone(&memoized);
        }
        let deps = Arc::new(self.compute_deps(canonical, kind));
        MEMO.insert(key, Arc::clone(&deps));
        deps
    }

    fn compute_deps(&self, canonical: &str, kind: MethodKind) -> Vec<TaskId> {
        let Some(&site) = self.decls.get(canonical) else {
            debug!(task = canonical, "no indexed declaration; empty dependency set");
            return Vec::new();
        };
        let type_name = canonical.rsplit("::").next().unwrap_or(canonical);

        // Entry bodies plus same-type helpers, breadth-first with a visited
        // cap so mutually recursive helpers terminate.
        let mut pending: Vec<String> = vec![kind.method_name().to_string()];
        let mut visited: HashSet<String> = HashSet::new();
        let mut resolved: Vec<TaskId> = Vec::new();
        let mut seen: HashSet<TaskId> = HashSet::new();

        while let Some(method) = pending.pop() {
            if !visited.insert(method.clone()) {
                continue;
            }
            for (scope_idx, block) in self.method_blocks(site.file, type_name, &method) {
                let output = scan::scan_block(block);
                for helper in output.helper_calls {
                    if !visited.contains(&helper) {
                        pending.push(helper);
                    }
                }
                for path in &output.paths {
                    let Some(target) = self.resolve(site.file, scope_idx, path) else {
                        continue;
                    };
                    if target == canonical {
                        continue; // self-reference is not an edge
                    }
                    let id = registry::global().intern(&target);
                    if seen.insert(id) {
                        resolved.push(id);
                    }
                }
            }
        }
        resolved
    }

    /// Every body named `method` in any impl block targeting `type_name`
    /// within the file, paired with the scope it was declared in.
    fn method_blocks<'a>(
        &'a self,
        file: usize,
        type_name: &str,
        method: &str,
    ) -> Vec<(usize, &'a syn::Block)> {
        let mut blocks = Vec::new();
        for (scope_idx, scope) in self.files[file].index.scopes.iter().enumerate() {
            if let Some(methods) = scope.methods.get(type_name) {
                if let Some(block) = methods.get(method) {
                    blocks.push((scope_idx, block));
                }
            }
        }
        blocks
    }

    /// Resolve a syntactic path reference to a known task's canonical name.
    fn resolve(&self, file: usize, scope: usize, path: &[String]) -> Option<String> {
        if path.is_empty() {
            return None;
        }
        let indexed = &self.files[file];

        // Leading path qualifiers.
        match path[0].as_str() {
            "crate" => {
                let crate_name = indexed.base.first()?.clone();
                let mut segments = vec![crate_name];
                segments.extend(path[1..].iter().cloned());
                return self.lookup_absolute(&segments);
            }
            "self" => {
                let segments = indexed.index.scopes[scope].segments.clone();
                return self.lookup_relative(indexed, &segments, &path[1..]);
            }
            "super" => {
                let mut segments = indexed.index.scopes[scope].segments.clone();
                let mut rest = path;
                while rest.first().map(String::as_str) == Some("super") {
                    segments.pop()?;
                    rest = &rest[1..];
                }
                return self.lookup_relative(indexed, &segments, rest);
            }
            _ => {}
        }

        if path.len() == 1 {
            return self.resolve_single(file, scope, &path[0]);
        }

        // Innermost-first: the path may be relative to any enclosing module.
        let mut cursor = Some(scope);
        while let Some(idx) = cursor {
            let segments = indexed.index.scopes[idx].segments.clone();
            if let Some(found) = self.lookup_relative(indexed, &segments, path) {
                return Some(found);
            }
            // The first segment may itself be an imported alias.
            for import in &indexed.index.scopes[idx].uses {
                if !import.glob && import.alias == path[0] {
                    let mut expanded = import.path.clone();
                    expanded.extend(path[1..].iter().cloned());
                    if let Some(found) = self.resolve(file, idx, &expanded) {
                        return Some(found);
                    }
                }
            }
            cursor = indexed.index.scopes[idx].parent;
        }

        // Absolute as written, then a unique suffix match across every
        // known task name.
        self.lookup_absolute(path)
            .or_else(|| self.lookup_suffix(path))
    }

    fn resolve_single(&self, file: usize, scope: usize, name: &str) -> Option<String> {
        let indexed = &self.files[file];
        let mut cursor = Some(scope);
        while let Some(idx) = cursor {
            let module = &indexed.index.scopes[idx];
            if module.registered.iter().any(|n| n == name) {
                return Some(join_canonical(&indexed.base, &module.segments, name));
            }
            for import in &module.uses {
                if import.glob {
                    let mut expanded = import.path.clone();
                    expanded.push(name.to_string());
                    if let Some(found) = self.resolve(file, idx, &expanded) {
                        return Some(found);
                    }
                } else if import.alias == name {
                    if let Some(found) = self.resolve(file, idx, &import.path) {
                        return Some(found);
                    }
                }
            }
            cursor = module.parent;
        }
        self.lookup_suffix(std::slice::from_ref(&name.to_string()))
    }

    fn lookup_relative(
        &self,
        indexed: &IndexedFile,
        module: &[String],
        rest: &[String],
    ) -> Option<String> {
        let mut segments = indexed.base.clone();
        segments.extend(module.iter().cloned());
        segments.extend(rest.iter().cloned());
        self.lookup_absolute(&segments)
    }

    fn lookup_absolute(&self, segments: &[String]) -> Option<String> {
        let canonical = segments.join("::");
        if self.decls.contains_key(&canonical) {
            return Some(canonical);
        }
        registry::global()
            .lookup(&canonical)
            .map(|_| canonical)
    }

    /// Unique suffix match over every known task name, the fallback for
    /// references to tasks declared in files this session has not indexed.
    fn lookup_suffix(&self, path: &[String]) -> Option<String> {
        let suffix = path.join("::");
        let mut matched: Option<String> = None;
        let global_names = registry::global().interned_names();
        let candidates = self
            .decls
            .keys()
            .cloned()
            .chain(global_names.into_iter().map(|n| n.to_string()));
        for candidate in candidates {
            let hit = candidate == suffix
                || candidate.ends_with(&format!("::{}", suffix));
            if hit {
                match &matched {
                    Some(existing) if *existing != candidate => {
                        debug!(
                            reference = %suffix,
                            "ambiguous task reference; leaving it to the runtime"
                        );
                        return None;
                    }
                    _ => matched = Some(candidate),
                }
            }
        }
        matched
    }
}

/// Resolve `file!()` output to an on-disk path: as-is from the current
/// directory, then relative to the manifest directory.
fn locate_source(compile_time_path: &str) -> Option<PathBuf> {
    let direct = Path::new(compile_time_path);
    if direct.is_file() {
        return Some(direct.to_path_buf());
    }
    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        let joined = Path::new(&manifest_dir).join(compile_time_path);
        if joined.is_file() {
            return Some(joined);
        }
    }
    None
}

/// Compute the module path of the file's root scope by stripping the
/// registration site's in-file nesting from the descriptor's
/// `module_path!()`.
fn anchor_base(index: &FileIndex, descriptor: &'static TaskDescriptor) -> Vec<String> {
    let module_path: Vec<String> = descriptor
        .module_path
        .split("::")
        .map(str::to_string)
        .collect();
    if let Some(scope_idx) = index.scope_registering(descriptor.name) {
        let nesting = &index.scopes[scope_idx].segments;
        if module_path.len() >= nesting.len()
            && module_path[module_path.len() - nesting.len()..] == nesting[..]
        {
            return module_path[..module_path.len() - nesting.len()].to_vec();
        }
    }
    module_path
}

fn join_canonical(base: &[String], module: &[String], name: &str) -> String {
    let mut segments: Vec<&str> = base.iter().map(String::as_str).collect();
    segments.extend(module.iter().map(String::as_str));
    segments.push(name);
    segments.join("::")
}
