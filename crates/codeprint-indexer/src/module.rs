//! Loads Python modules into a codeprint `Environment`
//!
//! Each top-level function becomes a code unit. Imports become import
//! bindings, classes and module-level values become opaque bindings, and a
//! name bound more than once under control flow becomes ambiguous.

use crate::canonicalize::{import_bindings, named_children, split_decorated, PythonCanonicalizer};
use crate::discover::SourceFile;
use crate::parser_pool::{ParseRequest, ParserPool};
use anyhow::{Context, Result};
use codeprint_core::{BindingKey, Environment, UnitId};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tree_sitter::Node;

/// What loading one module bound.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleSummary {
    pub scope: String,
    pub units: Vec<UnitId>,
    pub imports: usize,
    pub opaque: usize,
    pub ambiguous: Vec<String>,
    /// `(name, reason)` for functions that could not be canonicalized.
    pub failures: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
enum Bound<'t> {
    Function(Node<'t>),
    Class,
    Value,
    Module(String),
    Import(BindingKey),
    Alias(String),
}

struct Event<'t> {
    name: String,
    bound: Bound<'t>,
    conditional: bool,
}

/// Front end that parses Python sources and binds them in an environment.
#[derive(Clone)]
pub struct ModuleLoader {
    pool: ParserPool,
}

impl ModuleLoader {
    pub fn new(pool: ParserPool) -> Self {
        ModuleLoader { pool }
    }

    /// Load `source` as module `scope`.
    pub fn load_module(&self, env: &Environment, scope: &str, source: &str) -> Result<ModuleSummary> {
        let package = scope.rsplit_once('.').map(|(p, _)| p).unwrap_or("");
        self.load(env, scope, package, source, PathBuf::from(format!("{}.py", scope)))
    }

    /// Load a discovered source file.
    pub fn load_file(&self, env: &Environment, file: &SourceFile) -> Result<ModuleSummary> {
        let source = std::fs::read_to_string(&file.path)
            .with_context(|| format!("Failed to read {}", file.path.display()))?;
        self.load(env, &file.module, &file.package(), &source, file.path.clone())
    }

    /// Load every Python module under `root`, parsing in parallel.
    pub fn load_tree(&self, env: &Environment, root: &Path) -> Result<Vec<ModuleSummary>> {
        let files = crate::discover::discover_sources(root)?;
        tracing::info!("Loading {} Python modules from {}", files.len(), root.display());
        files.par_iter().map(|file| self.load_file(env, file)).collect()
    }

    fn load(&self, env: &Environment, scope: &str, package: &str, source: &str, path: PathBuf) -> Result<ModuleSummary> {
        let parsed = self.pool.parse_blocking(ParseRequest {
            content: source.to_string(),
            path,
        })?;
        let root = parsed.tree.root_node();
        let bytes = parsed.content.as_bytes();

        let mut events = Vec::new();
        for statement in named_children(root) {
            collect_events(statement, bytes, package, false, &mut events);
        }

        let mut order: Vec<String> = Vec::new();
        let mut grouped: HashMap<String, Vec<Event>> = HashMap::new();
        for event in events {
            if !grouped.contains_key(&event.name) {
                order.push(event.name.clone());
            }
            grouped.entry(event.name.clone()).or_default().push(event);
        }

        env.declare_scope(scope);
        let mut summary = ModuleSummary {
            scope: scope.to_string(),
            ..Default::default()
        };
        for name in &order {
            let Some(group) = grouped.remove(name) else {
                continue;
            };
            if group.len() > 1 && group.iter().any(|e| e.conditional) {
                tracing::debug!("{}.{} is bound under control flow {} times", scope, name, group.len());
                env.bind_ambiguous(scope, name);
                summary.ambiguous.push(name.clone());
                continue;
            }
            // Unconditional rebinding: the last one wins.
            let Some(event) = group.into_iter().last() else {
                continue;
            };
            self.bind(env, scope, name, event.bound, bytes, &mut summary);
        }

        let current: BTreeSet<&String> = order.iter().collect();
        for stale in env.scope_names(scope) {
            if !current.contains(&stale) {
                tracing::debug!("Unbinding {}.{}, no longer defined", scope, stale);
                env.unbind(scope, &stale);
            }
        }

        tracing::debug!(
            "Loaded {}: {} units, {} imports, {} opaque, {} ambiguous, {} failures",
            scope,
            summary.units.len(),
            summary.imports,
            summary.opaque,
            summary.ambiguous.len(),
            summary.failures.len()
        );
        Ok(summary)
    }

    fn bind(&self, env: &Environment, scope: &str, name: &str, bound: Bound, source: &[u8], summary: &mut ModuleSummary) {
        match bound {
            Bound::Function(node) => match PythonCanonicalizer::new(source).function(node) {
                Ok(form) => summary.units.push(env.define(scope, name, form)),
                Err(e) => {
                    tracing::warn!("Cannot canonicalize {}.{}: {}", scope, name, e);
                    summary.units.push(env.define_unavailable(scope, name, e.to_string()));
                    summary.failures.push((name.to_string(), e.to_string()));
                }
            },
            Bound::Class | Bound::Value => {
                env.bind_opaque(scope, name, format!("{}.{}", scope, name));
                summary.opaque += 1;
            }
            Bound::Module(module) => {
                env.bind_opaque(scope, name, format!("module {}", module));
                summary.opaque += 1;
            }
            Bound::Import(target) => {
                env.bind_import(scope, name, target);
                summary.imports += 1;
            }
            Bound::Alias(target) => {
                env.bind_import(scope, name, BindingKey::new(scope, target));
                summary.imports += 1;
            }
        }
    }
}

/// Record every module-level binding made by `node`.
fn collect_events<'t>(node: Node<'t>, source: &[u8], package: &str, conditional: bool, events: &mut Vec<Event<'t>>) {
    let text = |n: Node| n.utf8_text(source).unwrap_or("").to_string();
    let mut push = |name: String, bound: Bound<'t>| {
        if !name.is_empty() {
            events.push(Event {
                name,
                bound,
                conditional,
            });
        }
    };

    match node.kind() {
        "function_definition" | "class_definition" | "decorated_definition" => {
            let (_, definition) = split_decorated(node);
            let Some(name) = definition.child_by_field_name("name") else {
                return;
            };
            let bound = if definition.kind() == "function_definition" {
                Bound::Function(node)
            } else {
                Bound::Class
            };
            push(text(name), bound);
        }
        "import_statement" => {
            for child in named_children(node) {
                match child.kind() {
                    "dotted_name" => {
                        let module = text(child);
                        let head = module.split('.').next().unwrap_or_default().to_string();
                        push(head.clone(), Bound::Module(head));
                    }
                    "aliased_import" => {
                        let module = child.child_by_field_name("name").map(text).unwrap_or_default();
                        let alias = child.child_by_field_name("alias").map(text).unwrap_or_default();
                        push(alias, Bound::Module(module));
                    }
                    _ => {}
                }
            }
        }
        "import_from_statement" => {
            let module = node
                .child_by_field_name("module_name")
                .map(|m| resolve_module(m, source, package))
                .unwrap_or_default();
            let mut cursor = node.walk();
            let imported: Vec<Node> = node.children_by_field_name("name", &mut cursor).collect();
            let bound_names = import_bindings(node, source);
            for (child, (bound_name, _)) in imported.iter().zip(bound_names) {
                let original = match child.kind() {
                    "aliased_import" => child.child_by_field_name("name").map(text).unwrap_or_default(),
                    _ => text(*child),
                };
                push(bound_name, Bound::Import(BindingKey::new(module.clone(), original)));
            }
            if named_children(node).iter().any(|c| c.kind() == "wildcard_import") {
                tracing::debug!("Skipping wildcard import from {}", module);
            }
        }
        "expression_statement" => {
            for child in named_children(node) {
                collect_assignment(child, source, &mut push);
            }
        }
        "if_statement" | "try_statement" | "for_statement" | "while_statement" | "with_statement" => {
            let nested = conditional || node.kind() != "with_statement";
            if node.kind() == "for_statement" {
                if let Some(left) = node.child_by_field_name("left") {
                    for name in target_names(left, source) {
                        push(name, Bound::Value);
                    }
                }
            }
            collect_compound(node, source, package, nested, events);
        }
        _ => {}
    }
}

fn collect_compound<'t>(node: Node<'t>, source: &[u8], package: &str, conditional: bool, events: &mut Vec<Event<'t>>) {
    for child in named_children(node) {
        match child.kind() {
            "block" => {
                for statement in named_children(child) {
                    collect_events(statement, source, package, conditional, events);
                }
            }
            "elif_clause" | "else_clause" | "except_clause" | "except_group_clause" | "finally_clause" => {
                collect_compound(child, source, package, conditional, events);
            }
            _ => {}
        }
    }
}

fn collect_assignment<'t>(node: Node<'t>, source: &[u8], push: &mut impl FnMut(String, Bound<'t>)) {
    match node.kind() {
        "assignment" => {
            let (Some(left), right) = (node.child_by_field_name("left"), node.child_by_field_name("right")) else {
                return;
            };
            let Some(right) = right else {
                // Bare annotation.
                return;
            };
            let targets = target_names(left, source);
            match (left.kind(), right.kind()) {
                ("identifier", "identifier") => {
                    let target = right.utf8_text(source).unwrap_or("").to_string();
                    for name in targets {
                        push(name, Bound::Alias(target.clone()));
                    }
                }
                _ => {
                    for name in targets {
                        push(name, Bound::Value);
                    }
                }
            }
            if right.kind() == "assignment" {
                collect_assignment(right, source, push);
            }
        }
        "augmented_assignment" => {
            if let Some(left) = node.child_by_field_name("left") {
                for name in target_names(left, source) {
                    push(name, Bound::Value);
                }
            }
        }
        _ => {}
    }
}

fn target_names(node: Node, source: &[u8]) -> Vec<String> {
    match node.kind() {
        "identifier" => vec![node.utf8_text(source).unwrap_or("").to_string()],
        "pattern_list" | "tuple_pattern" | "list_pattern" | "tuple" | "list" | "expression_list"
        | "parenthesized_expression" | "list_splat_pattern" => named_children(node)
            .into_iter()
            .flat_map(|c| target_names(c, source))
            .collect(),
        _ => Vec::new(),
    }
}

/// Absolute module path of an import source, resolving leading dots
/// against `package`.
fn resolve_module(node: Node, source: &[u8], package: &str) -> String {
    let text = node.utf8_text(source).unwrap_or("");
    if node.kind() != "relative_import" {
        return text.to_string();
    }
    let level = text.chars().take_while(|c| *c == '.').count();
    let relative = &text[level..];

    let mut base: Vec<&str> = package.split('.').filter(|p| !p.is_empty()).collect();
    if level > base.len() + 1 {
        tracing::warn!("Relative import {} escapes package {}", text, package);
        return relative.to_string();
    }
    base.truncate(base.len() + 1 - level);
    if !relative.is_empty() {
        base.push(relative);
    }
    base.join(".")
}
