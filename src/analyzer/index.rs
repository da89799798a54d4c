//! Source indexing for the static analyzer.
//!
//! Parses a task's declaring file (plus every `mod x;` file it references,
//! recursively) into a flat list of module scopes. Each scope records the
//! task registrations, `use` imports and impl-block methods declared in it,
//! which is everything name resolution and reference scanning need.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use syn::{ImplItem, Item, UseTree};
use tracing::{debug, warn};

/// Bound on `mod` file recursion; deeper trees are almost certainly a
/// resolution loop through symlinks.
const MAX_MODULE_DEPTH: usize = 32;

/// One `use` import visible in a scope.
#[derive(Debug, Clone)]
pub(crate) struct UseImport {
    /// Local alias (`Leaf` for `use tasks::Leaf;` or `use x::Y as Leaf;`).
    /// Empty for glob imports.
    pub alias: String,
    /// Imported path segments as written (may start with `crate`/`self`/
    /// `super`).
    pub path: Vec<String>,
    /// Whether this is a `use path::*;` glob.
    pub glob: bool,
}

/// A module scope within the indexed file tree.
#[derive(Debug, Default)]
pub(crate) struct ModuleScope {
    /// Segments relative to the root file's module, e.g. `["tasks"]`.
    pub segments: Vec<String>,
    /// Index of the enclosing scope, `None` for the file root.
    pub parent: Option<usize>,
    /// Task type names passed to `register_task!` in this scope.
    pub registered: Vec<String>,
    /// `use` imports declared in this scope.
    pub uses: Vec<UseImport>,
    /// Methods per type name, merged over every impl block (trait and
    /// inherent) targeting the type in this scope.
    pub methods: HashMap<String, HashMap<String, syn::Block>>,
}

/// Flat index over one root file and its included module files.
#[derive(Debug, Default)]
pub(crate) struct FileIndex {
    pub scopes: Vec<ModuleScope>,
}

impl FileIndex {
    /// Index `root` and the module files it includes. Unreadable or
    /// unparsable files yield a diagnostic and an empty index; the runtime
    /// lazy-pull protocol covers anything the scan cannot see.
    pub(crate) fn build(root: &Path) -> Self {
        let mut index = Self::default();
        index.scopes.push(ModuleScope::default());
        index.ingest_file(root, is_crate_root(root), 0, 0);
        index
    }

    /// Scope of the innermost module containing a registration of `name`.
    pub(crate) fn scope_registering(&self, name: &str) -> Option<usize> {
        self.scopes
            .iter()
            .position(|scope| scope.registered.iter().any(|n| n == name))
    }

    fn ingest_file(&mut self, path: &Path, file_is_root: bool, scope: usize, depth: usize) {
        if depth > MAX_MODULE_DEPTH {
            warn!(file = %path.display(), "module tree too deep; stopping the scan here");
            return;
        }
        let source = match fs::read_to_string(path) {
            Ok(source) => source,
            Err(error) => {
                warn!(
                    file = %path.display(),
                    %error,
                    "task source could not be read; static analysis of it is skipped"
                );
                return;
            }
        };
        let ast = match syn::parse_file(&source) {
            Ok(ast) => ast,
            Err(error) => {
                warn!(
                    file = %path.display(),
                    %error,
                    "task source could not be parsed; static analysis of it is skipped"
                );
                return;
            }
        };
        debug!(file = %path.display(), "indexed task source");
        self.ingest_items(&ast.items, scope, path, file_is_root, depth);
    }

    fn ingest_items(
        &mut self,
        items: &[Item],
        scope: usize,
        file: &Path,
        file_is_root: bool,
        depth: usize,
    ) {
        for item in items {
            match item {
                Item::Macro(mac) => {
                    let is_registration = mac
                        .mac
                        .path
                        .segments
                        .last()
                        .map(|seg| seg.ident == "register_task")
                        .unwrap_or(false);
                    if is_registration {
                        if let Some(name) = first_ident(mac.mac.tokens.clone()) {
                            self.scopes[scope].registered.push(name);
                        }
                    }
                }
                Item::Use(item_use) => {
                    let mut imports = Vec::new();
                    flatten_use(&item_use.tree, &mut Vec::new(), &mut imports);
                    self.scopes[scope].uses.extend(imports);
                }
                Item::Impl(item_impl) => {
                    let Some(type_name) = impl_target_name(&item_impl.self_ty) else {
                        continue;
                    };
                    let methods = self.scopes[scope]
                        .methods
                        .entry(type_name)
                        .or_default();
                    for impl_item in &item_impl.items {
                        if let ImplItem::Fn(method) = impl_item {
                            methods.insert(method.sig.ident.to_string(), method.block.clone());
                        }
                    }
                }
                Item::Mod(item_mod) => {
                    let name = item_mod.ident.to_string();
                    let mut segments = self.scopes[scope].segments.clone();
                    segments.push(name.clone());
                    let child = self.scopes.len();
                    self.scopes.push(ModuleScope {
                        segments,
                        parent: Some(scope),
                        ..ModuleScope::default()
                    });
                    match &item_mod.content {
                        Some((_, items)) => {
                            self.ingest_items(items, child, file, file_is_root, depth);
                        }
                        None => {
                            if let Some(module_file) =
                                resolve_module_file(file, file_is_root, &name)
                            {
                                let child_is_root = module_file
                                    .file_stem()
                                    .map(|stem| stem == "mod")
                                    .unwrap_or(false);
                                self.ingest_file(&module_file, child_is_root, child, depth + 1);
                            } else {
                                debug!(
                                    module = %name,
                                    from = %file.display(),
                                    "module file not found; references into it stay unresolved"
                                );
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

/// Whether a file anchors module resolution at its own directory: crate
/// roots (`lib.rs`, `main.rs`), `mod.rs`, and cargo target roots such as
/// integration test files.
fn is_crate_root(path: &Path) -> bool {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if matches!(stem.as_str(), "lib" | "main" | "mod") {
        return true;
    }
    path.parent()
        .and_then(|dir| dir.file_name())
        .map(|dir| matches!(dir.to_string_lossy().as_ref(), "tests" | "benches" | "examples" | "bin"))
        .unwrap_or(false)
}

/// `mod foo;` resolution: `foo.rs` or `foo/mod.rs`, relative to the
/// declaring file following the compiler's convention (crate-root and
/// `mod.rs` files anchor at their own directory, other files at a
/// directory named after them).
fn resolve_module_file(declaring: &Path, declaring_is_root: bool, name: &str) -> Option<PathBuf> {
    let dir = declaring.parent()?;
    let anchored = if declaring_is_root {
        dir.to_path_buf()
    } else {
        let stem = declaring.file_stem()?.to_string_lossy();
        dir.join(&*stem)
    };
    let direct = anchored.join(format!("{}.rs", name));
    if direct.is_file() {
        return Some(direct);
    }
    let nested = anchored.join(name).join("mod.rs");
    nested.is_file().then_some(nested)
}

fn impl_target_name(self_ty: &syn::Type) -> Option<String> {
    match self_ty {
        syn::Type::Path(type_path) => type_path
            .path
            .segments
            .last()
            .map(|seg| seg.ident.to_string()),
        _ => None,
    }
}

fn first_ident(tokens: proc_macro2::TokenStream) -> Option<String> {
    tokens.into_iter().find_map(|tree| match tree {
        proc_macro2::TokenTree::Ident(ident) => Some(ident.to_string()),
        _ => None,
    })
}

fn flatten_use(tree: &UseTree, prefix: &mut Vec<String>, out: &mut Vec<UseImport>) {
    match tree {
        UseTree::Path(path) => {
            prefix.push(path.ident.to_string());
            flatten_use(&path.tree, prefix, out);
            prefix.pop();
        }
        UseTree::Name(name) => {
            let mut path = prefix.clone();
            path.push(name.ident.to_string());
            out.push(UseImport {
                alias: name.ident.to_string(),
                path,
                glob: false,
            });
        }
        UseTree::Rename(rename) => {
            let mut path = prefix.clone();
            path.push(rename.ident.to_string());
            out.push(UseImport {
                alias: rename.rename.to_string(),
                path,
                glob: false,
            });
        }
        UseTree::Glob(_) => {
            out.push(UseImport {
                alias: String::new(),
                path: prefix.clone(),
                glob: true,
            });
        }
        UseTree::Group(group) => {
            for item in &group.items {
                flatten_use(item, prefix, out);
            }
        }
    }
}
