//! Reference collection from method bodies.
//!
//! The collector is deliberately conservative: every syntactic path in the
//! body counts, whether it sits in a dead branch, a turbofish type argument
//! or a macro invocation. Execution (the lazy pull) decides what is
//! actually used; the scan only has to never miss a reference the runtime
//! might take.

use proc_macro2::{TokenStream, TokenTree};
use syn::visit::{self, Visit};

/// Raw references found in one body.
#[derive(Debug, Default)]
pub(crate) struct ScanOutput {
    /// Path references as segment lists, e.g. `["tasks", "Leaf"]`.
    pub paths: Vec<Vec<String>>,
    /// Names of same-type methods invoked via `self.x()` / `Self::x()`.
    pub helper_calls: Vec<String>,
}

pub(crate) fn scan_block(block: &syn::Block) -> ScanOutput {
    let mut collector = RefCollector::default();
    collector.visit_block(block);
    collector.output
}

#[derive(Default)]
struct RefCollector {
    output: ScanOutput,
}

impl RefCollector {
    fn record_path(&mut self, segments: Vec<String>) {
        if segments.is_empty() {
            return;
        }
        // `Self::helper(...)` is a same-type call, not a cross-task
        // reference.
        if segments.len() == 2 && segments[0] == "Self" {
            self.output.helper_calls.push(segments[1].clone());
            return;
        }
        self.output.paths.push(segments);
    }

    /// Macro bodies are raw token streams; walk them for `A::B`-shaped
    /// ident runs so references inside `join!`, `writeln!` and friends are
    /// still collected.
    fn walk_tokens(&mut self, tokens: TokenStream) {
        let mut current: Vec<String> = Vec::new();
        let mut pending_colons = 0u8;
        for tree in tokens {
            match tree {
                TokenTree::Ident(ident) => {
                    if current.is_empty() || pending_colons == 2 {
                        current.push(ident.to_string());
                    } else {
                        self.record_path(std::mem::take(&mut current));
                        current.push(ident.to_string());
                    }
                    pending_colons = 0;
                }
                TokenTree::Punct(punct) if punct.as_char() == ':' => {
                    pending_colons = (pending_colons + 1).min(2);
                }
                TokenTree::Group(group) => {
                    if !current.is_empty() {
                        self.record_path(std::mem::take(&mut current));
                    }
                    pending_colons = 0;
                    self.walk_tokens(group.stream());
                }
                _ => {
                    if !current.is_empty() {
                        self.record_path(std::mem::take(&mut current));
                    }
                    pending_colons = 0;
                }
            }
        }
        if !current.is_empty() {
            self.record_path(current);
        }
    }
}

impl<'ast> Visit<'ast> for RefCollector {
    fn visit_path(&mut self, node: &'ast syn::Path) {
        let segments: Vec<String> = node
            .segments
            .iter()
            .map(|seg| seg.ident.to_string())
            .collect();
        self.record_path(segments);
        // Continue into generic arguments so turbofish type parameters
        // (`pull::<Leaf>()`) are collected too.
        visit::visit_path(self, node);
    }

    fn visit_expr_method_call(&mut self, node: &'ast syn::ExprMethodCall) {
        if let syn::Expr::Path(receiver) = &*node.receiver {
            if receiver.path.is_ident("self") {
                self.output.helper_calls.push(node.method.to_string());
            }
        }
        visit::visit_expr_method_call(self, node);
    }

    fn visit_macro(&mut self, node: &'ast syn::Macro) {
        self.walk_tokens(node.tokens.clone());
        visit::visit_macro(self, node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(src: &str) -> ScanOutput {
        let block: syn::Block = syn::parse_str(src).expect("test body parses");
        scan_block(&block)
    }

    fn has_path(output: &ScanOutput, segments: &[&str]) -> bool {
        output
            .paths
            .iter()
            .any(|p| p.iter().map(String::as_str).eq(segments.iter().copied()))
    }

    #[test]
    fn collects_turbofish_type_arguments() {
        let output = scan("{ let leaf = ctx.pull::<Leaf>().await?; leaf.x }");
        assert!(has_path(&output, &["Leaf"]));
    }

    #[test]
    fn collects_qualified_paths_and_dead_branches() {
        let output = scan(
            "{ if false { let _ = ctx.pull::<tasks::Hidden>().await; } other::Thing::touch(); }",
        );
        assert!(has_path(&output, &["tasks", "Hidden"]));
        assert!(has_path(&output, &["other", "Thing", "touch"]));
    }

    #[test]
    fn collects_references_inside_macros() {
        let output = scan("{ let (a, b) = tokio::join!(ctx.pull::<A>(), ctx.pull::<B>()); }");
        assert!(has_path(&output, &["A"]));
        assert!(has_path(&output, &["B"]));
    }

    #[test]
    fn records_helper_calls() {
        let output = scan("{ self.prepare(); Self::finish(); }");
        assert_eq!(output.helper_calls, vec!["prepare", "finish"]);
    }
}
