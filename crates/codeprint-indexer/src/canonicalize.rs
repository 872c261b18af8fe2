//! Python CST → canonical form
//!
//! Local names become slots so renaming a parameter or variable leaves the
//! form unchanged. Comments, docstrings, whitespace and positions never reach
//! the form. Syntax without a dedicated op is kept as a generic `Node` over
//! its named children so it still hashes structurally.

use codeprint_core::model::{BinOp, BoolOp, CanonicalForm, CmpOp, Collection, Constant, Op, UnOp};
use std::collections::HashSet;
use thiserror::Error;
use tree_sitter::Node;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanonicalizeError {
    #[error("syntax error at line {line}")]
    Syntax { line: usize },

    #[error("expected a function definition, found {0}")]
    NotAFunction(String),
}

/// Canonicalize a `function_definition`, or a `decorated_definition` wrapping one.
pub fn canonicalize_function(node: Node, source: &[u8]) -> Result<CanonicalForm, CanonicalizeError> {
    PythonCanonicalizer::new(source).function(node)
}

/// Named, non-comment children.
pub(crate) fn named_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).filter(|c| !c.is_extra()).collect()
}

fn all_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children(&mut cursor).filter(|c| !c.is_extra()).collect()
}

fn field_children<'t>(node: Node<'t>, field: &str) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children_by_field_name(field, &mut cursor).collect()
}

/// First `ERROR` or missing node below `node`.
pub(crate) fn first_error(node: Node) -> Option<Node> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    let mut cursor = node.walk();
    let children: Vec<Node> = node.children(&mut cursor).collect();
    children.into_iter().find_map(first_error)
}

/// Split `@dec def f(): ...` into its decorators and the definition.
pub(crate) fn split_decorated(node: Node) -> (Vec<Node>, Node) {
    if node.kind() != "decorated_definition" {
        return (Vec::new(), node);
    }
    let decorators = named_children(node)
        .into_iter()
        .filter(|c| c.kind() == "decorator")
        .filter_map(|d| named_children(d).into_iter().next())
        .collect();
    let definition = node.child_by_field_name("definition").unwrap_or(node);
    (decorators, definition)
}

const STATEMENT_KINDS: &[&str] = &[
    "expression_statement",
    "return_statement",
    "pass_statement",
    "break_statement",
    "continue_statement",
    "raise_statement",
    "assert_statement",
    "delete_statement",
    "global_statement",
    "nonlocal_statement",
    "if_statement",
    "while_statement",
    "for_statement",
    "try_statement",
    "with_statement",
    "function_definition",
    "decorated_definition",
    "class_definition",
    "import_statement",
    "import_from_statement",
    "future_import_statement",
    "block",
];

struct Param<'t> {
    name: Option<String>,
    default: Option<Node<'t>>,
    marker: &'static str,
}

enum Slot {
    Local(u32),
    Free(u32, u32),
    Global,
}

struct Scope {
    form: CanonicalForm,
    locals: Vec<String>,
    globals: HashSet<String>,
}

impl Scope {
    fn new(arity: u32) -> Self {
        Scope {
            form: CanonicalForm::new(arity),
            locals: Vec::new(),
            globals: HashSet::new(),
        }
    }
}

enum Piece<'t> {
    Text(String),
    Interpolation(Node<'t>),
}

struct StringLiteral<'t> {
    bytes: bool,
    formatted: bool,
    pieces: Vec<Piece<'t>>,
}

pub struct PythonCanonicalizer<'s> {
    source: &'s [u8],
    /// Innermost function being emitted.
    current: Scope,
    /// Enclosing functions, outermost first. The bottom entry stands for the
    /// module and never has locals.
    enclosing: Vec<Scope>,
}

impl<'s> PythonCanonicalizer<'s> {
    pub fn new(source: &'s [u8]) -> Self {
        PythonCanonicalizer {
            source,
            current: Scope::new(0),
            enclosing: Vec::new(),
        }
    }

    pub fn function(&mut self, node: Node) -> Result<CanonicalForm, CanonicalizeError> {
        if let Some(error) = first_error(node) {
            return Err(CanonicalizeError::Syntax {
                line: error.start_position().row + 1,
            });
        }
        let (decorators, definition) = split_decorated(node);
        if definition.kind() != "function_definition" {
            return Err(CanonicalizeError::NotAFunction(definition.kind().to_string()));
        }

        let params = self.parameters(definition.child_by_field_name("parameters"));
        self.enter(arity(&params));

        // Defaults and decorators run in module scope: emit them while no
        // local is known yet.
        let defaults: Vec<Node> = params.iter().filter_map(|p| p.default).collect();
        self.push(Op::Node {
            kind: "defaults".into(),
            children: defaults.len() as u32,
        });
        for default in defaults {
            self.expr(default);
        }
        self.push(Op::Node {
            kind: "decorators".into(),
            children: decorators.len() as u32,
        });
        for decorator in decorators {
            self.expr(decorator);
        }

        self.body(definition, &params, definition.child_by_field_name("body"));
        Ok(self.leave())
    }

    // ── Scopes ──────────────────────────────────────────────

    fn enter(&mut self, arity: u32) {
        let outer = std::mem::replace(&mut self.current, Scope::new(arity));
        self.enclosing.push(outer);
    }

    fn leave(&mut self) -> CanonicalForm {
        let outer = self.enclosing.pop().unwrap_or_else(|| Scope::new(0));
        std::mem::replace(&mut self.current, outer).form
    }

    fn form(&mut self) -> &mut CanonicalForm {
        &mut self.current.form
    }

    fn push(&mut self, op: Op) {
        self.form().push(op);
    }

    fn constant(&mut self, value: Constant) {
        let index = self.form().constant(value);
        self.push(Op::LoadConst(index));
    }

    fn text(&self, node: Node) -> &'s str {
        node.utf8_text(self.source).unwrap_or("")
    }

    fn locate(&self, name: &str) -> Slot {
        let scopes = std::iter::once(&self.current).chain(self.enclosing.iter().rev());
        for (depth, scope) in scopes.enumerate() {
            if scope.globals.contains(name) {
                return Slot::Global;
            }
            if let Some(slot) = scope.locals.iter().position(|l| l == name) {
                return if depth == 0 {
                    Slot::Local(slot as u32)
                } else {
                    Slot::Free(depth as u32, slot as u32)
                };
            }
        }
        Slot::Global
    }

    fn load_name(&mut self, name: &str) {
        let op = match self.locate(name) {
            Slot::Local(slot) => Op::LoadLocal(slot),
            Slot::Free(depth, slot) => Op::LoadFree(depth, slot),
            Slot::Global => Op::LoadGlobal(self.form().name(name)),
        };
        self.push(op);
    }

    fn store_name(&mut self, name: &str) {
        let op = match self.locate(name) {
            Slot::Local(slot) => Op::StoreLocal(slot),
            Slot::Free(depth, slot) => Op::StoreFree(depth, slot),
            Slot::Global => Op::StoreGlobal(self.form().name(name)),
        };
        self.push(op);
    }

    /// Emit a function body into the innermost scope, after fixing its locals.
    fn body(&mut self, definition: Node, params: &[Param], body: Option<Node>) {
        let mut declared = HashSet::new();
        let mut globals = HashSet::new();
        let mut assigned = Vec::new();
        if let Some(body) = body {
            collect_locals(body, self.source, &mut assigned, &mut declared, &mut globals);
        }

        let mut locals: Vec<String> = params.iter().filter_map(|p| p.name.clone()).collect();
        for name in assigned {
            if !declared.contains(&name) && !locals.contains(&name) {
                locals.push(name);
            }
        }

        let signature: Vec<&str> = params.iter().map(|p| p.marker).collect();
        let is_async = all_children(definition).iter().any(|c| c.kind() == "async");
        self.current.locals = locals;
        self.current.globals = globals;
        self.push(Op::Node {
            kind: format!("{}({})", if is_async { "async def" } else { "def" }, signature.join(",")),
            children: 0,
        });

        let Some(body) = body else {
            return;
        };
        if body.kind() != "block" {
            // lambda
            self.push(Op::Return);
            self.expr(body);
            return;
        }
        let statements = named_children(body);
        let skip = usize::from(statements.first().is_some_and(|s| self.is_docstring(*s)));
        for statement in &statements[skip..] {
            self.statement(*statement);
        }
    }

    fn is_docstring(&self, statement: Node) -> bool {
        if statement.kind() != "expression_statement" {
            return false;
        }
        match named_children(statement).as_slice() {
            [only] if matches!(only.kind(), "string" | "concatenated_string") => {
                !self.string_literal(*only).formatted
            }
            _ => false,
        }
    }

    fn parameters<'t>(&self, node: Option<Node<'t>>) -> Vec<Param<'t>> {
        let Some(node) = node else {
            return Vec::new();
        };
        let mut params = Vec::new();
        for child in named_children(node) {
            let param = match child.kind() {
                "identifier" => Param {
                    name: Some(self.text(child).to_string()),
                    default: None,
                    marker: "p",
                },
                "default_parameter" | "typed_default_parameter" => Param {
                    name: child.child_by_field_name("name").map(|n| self.text(n).to_string()),
                    default: child.child_by_field_name("value"),
                    marker: "p=",
                },
                "typed_parameter" => {
                    let Some(inner) = named_children(child).into_iter().next() else {
                        continue;
                    };
                    self.splat_param(inner)
                }
                "list_splat_pattern" | "dictionary_splat_pattern" => self.splat_param(child),
                "keyword_separator" => Param {
                    name: None,
                    default: None,
                    marker: "*",
                },
                "positional_separator" => Param {
                    name: None,
                    default: None,
                    marker: "/",
                },
                _ => continue,
            };
            params.push(param);
        }
        params
    }

    fn splat_param<'t>(&self, node: Node<'t>) -> Param<'t> {
        let (inner, marker) = match node.kind() {
            "list_splat_pattern" => (named_children(node).into_iter().next(), "*p"),
            "dictionary_splat_pattern" => (named_children(node).into_iter().next(), "**p"),
            _ => (Some(node), "p"),
        };
        Param {
            name: inner.map(|n| self.text(n).to_string()),
            default: None,
            marker,
        }
    }

    // ── Statements ──────────────────────────────────────────

    fn block(&mut self, node: Option<Node>) {
        let Some(node) = node else {
            return;
        };
        if node.kind() == "block" {
            for statement in named_children(node) {
                self.statement(statement);
            }
        } else {
            self.statement(node);
        }
    }

    fn any(&mut self, node: Node) {
        if STATEMENT_KINDS.contains(&node.kind()) {
            self.statement(node);
        } else {
            self.expr(node);
        }
    }

    fn statement(&mut self, node: Node) {
        match node.kind() {
            "block" => self.block(Some(node)),
            "expression_statement" => match named_children(node).as_slice() {
                [single] if matches!(single.kind(), "assignment" | "augmented_assignment") => {
                    self.statement(*single)
                }
                [single] => {
                    self.push(Op::Discard);
                    self.expr(*single);
                }
                many => {
                    self.push(Op::Discard);
                    self.sequence(Collection::Tuple, many);
                }
            },
            "assignment" => {
                let (Some(left), Some(right)) =
                    (node.child_by_field_name("left"), node.child_by_field_name("right"))
                else {
                    // Bare annotation binds nothing.
                    return;
                };
                self.store_target(left);
                if right.kind() == "assignment" {
                    self.statement(right);
                } else {
                    self.expr(right);
                }
            }
            "augmented_assignment" => {
                let (Some(left), Some(op), Some(right)) = (
                    node.child_by_field_name("left"),
                    node.child_by_field_name("operator"),
                    node.child_by_field_name("right"),
                ) else {
                    return self.fallback(node);
                };
                let Some(op) = BinOp::from_symbol(op.kind()) else {
                    return self.fallback(node);
                };
                self.push(Op::Node {
                    kind: "inplace".into(),
                    children: 0,
                });
                self.store_target(left);
                self.push(Op::Binary(op));
                self.expr(left);
                self.expr(right);
            }
            "return_statement" => match named_children(node).into_iter().next() {
                Some(value) => {
                    self.push(Op::Return);
                    self.expr(value);
                }
                None => self.push(Op::ReturnNone),
            },
            "pass_statement" => self.push(Op::Pass),
            "break_statement" => self.push(Op::Break),
            "continue_statement" => self.push(Op::Continue),
            "raise_statement" => {
                let cause = node.child_by_field_name("cause");
                let mut args: Vec<Node> = named_children(node)
                    .into_iter()
                    .filter(|c| Some(*c) != cause)
                    .collect();
                args.extend(cause);
                self.push(Op::Raise {
                    args: args.len() as u32,
                });
                for arg in args {
                    self.expr(arg);
                }
            }
            "assert_statement" => {
                let parts = named_children(node);
                self.push(Op::Assert);
                if let Some(test) = parts.first() {
                    self.expr(*test);
                }
                match parts.get(1) {
                    Some(message) => self.expr(*message),
                    None => self.constant(Constant::None),
                }
            }
            "delete_statement" => {
                let mut targets = Vec::new();
                for child in named_children(node) {
                    if child.kind() == "expression_list" {
                        targets.extend(named_children(child));
                    } else {
                        targets.push(child);
                    }
                }
                self.push(Op::Delete(targets.len() as u32));
                for target in targets {
                    self.store_target(target);
                }
            }
            // Resolution already reflects these declarations.
            "global_statement" | "nonlocal_statement" | "future_import_statement" => {}
            "if_statement" => {
                self.push(Op::If);
                if let Some(condition) = node.child_by_field_name("condition") {
                    self.expr(condition);
                }
                self.block(node.child_by_field_name("consequence"));
                let mut open = 1;
                for alternative in field_children(node, "alternative") {
                    self.push(Op::Else);
                    if alternative.kind() == "elif_clause" {
                        self.push(Op::If);
                        open += 1;
                        if let Some(condition) = alternative.child_by_field_name("condition") {
                            self.expr(condition);
                        }
                        self.block(alternative.child_by_field_name("consequence"));
                    } else {
                        self.block(alternative.child_by_field_name("body"));
                    }
                }
                for _ in 0..open {
                    self.push(Op::End);
                }
            }
            "while_statement" => {
                self.push(Op::While);
                if let Some(condition) = node.child_by_field_name("condition") {
                    self.expr(condition);
                }
                self.block(node.child_by_field_name("body"));
                self.else_clause(node.child_by_field_name("alternative"));
                self.push(Op::End);
            }
            "for_statement" => {
                self.push(Op::For);
                if all_children(node).iter().any(|c| c.kind() == "async") {
                    self.push(Op::Await);
                }
                if let Some(left) = node.child_by_field_name("left") {
                    self.store_target(left);
                }
                if let Some(right) = node.child_by_field_name("right") {
                    self.expr(right);
                }
                self.block(node.child_by_field_name("body"));
                self.else_clause(node.child_by_field_name("alternative"));
                self.push(Op::End);
            }
            "try_statement" => {
                self.push(Op::Try);
                self.block(node.child_by_field_name("body"));
                for clause in named_children(node) {
                    match clause.kind() {
                        "except_clause" | "except_group_clause" => self.except_clause(clause),
                        "else_clause" => {
                            self.push(Op::Else);
                            self.block(clause.child_by_field_name("body"));
                        }
                        "finally_clause" => {
                            self.push(Op::Finally);
                            for body in named_children(clause) {
                                self.block(Some(body));
                            }
                        }
                        _ => {}
                    }
                }
                self.push(Op::End);
            }
            "with_statement" => {
                let items: Vec<Node> = named_children(node)
                    .into_iter()
                    .filter(|c| c.kind() == "with_clause")
                    .flat_map(named_children)
                    .filter(|c| c.kind() == "with_item")
                    .collect();
                self.push(Op::With {
                    items: items.len() as u32,
                });
                for item in items {
                    self.with_item(item);
                }
                self.block(node.child_by_field_name("body"));
                self.push(Op::End);
            }
            "function_definition" | "decorated_definition" => self.nested_function(node),
            "class_definition" => {
                if let Some(name) = node.child_by_field_name("name") {
                    let name = self.text(name);
                    self.store_name(name);
                }
                let superclasses = node
                    .child_by_field_name("superclasses")
                    .map(named_children)
                    .unwrap_or_default();
                let body = node
                    .child_by_field_name("body")
                    .map(named_children)
                    .unwrap_or_default();
                self.push(Op::Node {
                    kind: "class".into(),
                    children: (superclasses.len() + body.len()) as u32,
                });
                for base in superclasses {
                    self.expr(base);
                }
                for statement in body {
                    self.statement(statement);
                }
            }
            "import_statement" | "import_from_statement" => {
                // The bound name is a local slot; only the imported path is hashed.
                for (name, origin) in import_bindings(node, self.source) {
                    self.store_name(&name);
                    self.push(Op::Node {
                        kind: format!("import:{}", origin),
                        children: 0,
                    });
                }
            }
            _ => self.fallback(node),
        }
    }

    fn else_clause(&mut self, clause: Option<Node>) {
        if let Some(clause) = clause {
            self.push(Op::Else);
            self.block(clause.child_by_field_name("body"));
        }
    }

    fn except_clause(&mut self, clause: Node) {
        let children = named_children(clause);
        let (parts, body): (Vec<Node>, Vec<Node>) = children.into_iter().partition(|c| c.kind() != "block");
        let (value, alias) = match parts.as_slice() {
            [] => (None, None),
            [value] if value.kind() == "as_pattern" => (
                named_children(*value).into_iter().next(),
                value.child_by_field_name("alias"),
            ),
            [value] => (Some(*value), None),
            [value, alias, ..] => (Some(*value), Some(*alias)),
        };

        self.push(Op::Except {
            typed: value.is_some(),
            bound: alias.is_some(),
        });
        if let Some(value) = value {
            self.expr(value);
        }
        if let Some(alias) = alias {
            self.store_alias(alias);
        }
        for block in body {
            self.block(Some(block));
        }
    }

    fn with_item(&mut self, item: Node) {
        let Some(value) = item.child_by_field_name("value") else {
            return self.fallback(item);
        };
        if value.kind() == "as_pattern" {
            self.push(Op::Node {
                kind: "with_item".into(),
                children: 2,
            });
            if let Some(manager) = named_children(value).into_iter().next() {
                self.expr(manager);
            }
            match value.child_by_field_name("alias") {
                Some(alias) => self.store_alias(alias),
                None => self.constant(Constant::None),
            }
        } else {
            self.push(Op::Node {
                kind: "with_item".into(),
                children: 1,
            });
            self.expr(value);
        }
    }

    /// Store into an `as` target, unwrapping `as_pattern_target`.
    fn store_alias(&mut self, alias: Node) {
        if alias.kind() == "as_pattern_target" {
            match named_children(alias).into_iter().next() {
                Some(target) => self.store_target(target),
                None => self.fallback(alias),
            }
        } else {
            self.store_target(alias);
        }
    }

    fn store_target(&mut self, node: Node) {
        match node.kind() {
            "identifier" => {
                let name = self.text(node);
                self.store_name(name);
            }
            "attribute" => {
                let attribute = node
                    .child_by_field_name("attribute")
                    .map(|a| self.text(a).to_string())
                    .unwrap_or_default();
                self.push(Op::StoreAttr(attribute));
                if let Some(object) = node.child_by_field_name("object") {
                    self.expr(object);
                }
            }
            "subscript" => {
                self.push(Op::StoreSubscript);
                if let Some(value) = node.child_by_field_name("value") {
                    self.expr(value);
                }
                self.index(node);
            }
            "pattern_list" | "tuple_pattern" | "list_pattern" | "tuple" | "list" | "expression_list" => {
                let targets = named_children(node);
                self.push(Op::Unpack(targets.len() as u32));
                for target in targets {
                    self.store_target(target);
                }
            }
            "parenthesized_expression" => match named_children(node).into_iter().next() {
                Some(inner) => self.store_target(inner),
                None => self.fallback(node),
            },
            "list_splat_pattern" | "list_splat" => {
                self.push(Op::Splat { double: false });
                match named_children(node).into_iter().next() {
                    Some(inner) => self.store_target(inner),
                    None => self.fallback(node),
                }
            }
            _ => self.fallback(node),
        }
    }

    fn nested_function(&mut self, node: Node) {
        let (decorators, definition) = split_decorated(node);
        if definition.kind() != "function_definition" {
            // Decorated nested class.
            self.push(Op::Node {
                kind: "decorated".into(),
                children: decorators.len() as u32 + 1,
            });
            for decorator in decorators {
                self.expr(decorator);
            }
            return self.statement(definition);
        }

        if let Some(name) = definition.child_by_field_name("name") {
            let name = self.text(name);
            self.store_name(name);
        }
        let params = self.parameters(definition.child_by_field_name("parameters"));
        self.make_function(definition, &params, definition.child_by_field_name("body"), &decorators);
    }

    /// Build the nested code object, then emit `MakeFunction` and its
    /// defaults and decorators into the enclosing form.
    fn make_function(&mut self, definition: Node, params: &[Param], body: Option<Node>, decorators: &[Node]) {
        self.enter(arity(params));
        self.body(definition, params, body);
        let nested = self.leave();

        let code = self.form().constant(Constant::Code(Box::new(nested)));
        let defaults: Vec<Node> = params.iter().filter_map(|p| p.default).collect();
        self.push(Op::MakeFunction {
            code,
            defaults: defaults.len() as u32,
            decorators: decorators.len() as u32,
        });
        for default in defaults {
            self.expr(default);
        }
        for decorator in decorators {
            self.expr(*decorator);
        }
    }

    // ── Expressions ─────────────────────────────────────────

    fn expr(&mut self, node: Node) {
        match node.kind() {
            "identifier" => {
                let name = self.text(node);
                self.load_name(name);
            }
            "integer" => match int_constant(self.text(node)) {
                Some(constant) => self.constant(constant),
                None => self.fallback(node),
            },
            "float" => match float_constant(self.text(node)) {
                Some(constant) => self.constant(constant),
                None => self.fallback(node),
            },
            "true" => self.constant(Constant::Bool(true)),
            "false" => self.constant(Constant::Bool(false)),
            "none" => self.constant(Constant::None),
            "ellipsis" => self.constant(Constant::Ellipsis),
            "string" => {
                let literal = self.string_literal(node);
                self.emit_string(literal);
            }
            "concatenated_string" => {
                let mut combined = StringLiteral {
                    bytes: false,
                    formatted: false,
                    pieces: Vec::new(),
                };
                for part in named_children(node) {
                    let literal = self.string_literal(part);
                    combined.bytes |= literal.bytes;
                    combined.formatted |= literal.formatted;
                    combined.pieces.extend(literal.pieces);
                }
                self.emit_string(combined);
            }
            "parenthesized_expression" => match named_children(node).into_iter().next() {
                Some(inner) => self.expr(inner),
                None => self.fallback(node),
            },
            "call" => self.call(node),
            "attribute" => {
                let attribute = node
                    .child_by_field_name("attribute")
                    .map(|a| self.text(a).to_string())
                    .unwrap_or_default();
                self.push(Op::Attr(attribute));
                if let Some(object) = node.child_by_field_name("object") {
                    self.expr(object);
                }
            }
            "subscript" => {
                self.push(Op::Subscript);
                if let Some(value) = node.child_by_field_name("value") {
                    self.expr(value);
                }
                self.index(node);
            }
            "slice" => {
                // Bounds sit between `:` tokens; absent ones are None.
                let mut bounds: Vec<Option<Node>> = vec![None];
                for child in all_children(node) {
                    if child.is_named() {
                        if let Some(last) = bounds.last_mut() {
                            *last = Some(child);
                        }
                    } else if child.kind() == ":" {
                        bounds.push(None);
                    }
                }
                self.push(Op::Slice {
                    parts: bounds.len() as u32,
                });
                for bound in bounds {
                    match bound {
                        Some(bound) => self.expr(bound),
                        None => self.constant(Constant::None),
                    }
                }
            }
            "binary_operator" => {
                let op = node
                    .child_by_field_name("operator")
                    .and_then(|o| BinOp::from_symbol(o.kind()));
                let (Some(op), Some(left), Some(right)) =
                    (op, node.child_by_field_name("left"), node.child_by_field_name("right"))
                else {
                    return self.fallback(node);
                };
                self.push(Op::Binary(op));
                self.expr(left);
                self.expr(right);
            }
            "unary_operator" => {
                let op = match node.child_by_field_name("operator").map(|o| o.kind()) {
                    Some("-") => UnOp::Neg,
                    Some("+") => UnOp::Pos,
                    Some("~") => UnOp::Invert,
                    _ => return self.fallback(node),
                };
                self.push(Op::Unary(op));
                if let Some(argument) = node.child_by_field_name("argument") {
                    self.expr(argument);
                }
            }
            "not_operator" => {
                self.push(Op::Unary(UnOp::Not));
                if let Some(argument) = node.child_by_field_name("argument") {
                    self.expr(argument);
                }
            }
            "boolean_operator" => {
                let op = match node.child_by_field_name("operator").map(|o| o.kind()) {
                    Some("and") => BoolOp::And,
                    Some("or") => BoolOp::Or,
                    _ => return self.fallback(node),
                };
                let mut operands = Vec::new();
                flatten_bool(node, op, &mut operands);
                self.push(Op::Bool {
                    op,
                    operands: operands.len() as u32,
                });
                for operand in operands {
                    self.expr(operand);
                }
            }
            "comparison_operator" => self.comparison(node),
            "conditional_expression" => match named_children(node).as_slice() {
                [then, condition, otherwise] => {
                    self.push(Op::Conditional);
                    self.expr(*condition);
                    self.expr(*then);
                    self.expr(*otherwise);
                }
                _ => self.fallback(node),
            },
            "list" => self.sequence(Collection::List, &named_children(node)),
            "tuple" | "expression_list" | "pattern_list" => {
                self.sequence(Collection::Tuple, &named_children(node))
            }
            "set" => self.sequence(Collection::Set, &named_children(node)),
            "dictionary" => {
                let entries = named_children(node);
                let len = entries
                    .iter()
                    .map(|e| if e.kind() == "pair" { 2 } else { 1 })
                    .sum();
                self.push(Op::Build {
                    kind: Collection::Dict,
                    len,
                });
                for entry in entries {
                    self.dict_entry(entry);
                }
            }
            "list_comprehension" => self.comprehension(Collection::List, node),
            "set_comprehension" => self.comprehension(Collection::Set, node),
            "dictionary_comprehension" => self.comprehension(Collection::Dict, node),
            "generator_expression" => self.comprehension(Collection::Generator, node),
            "lambda" => {
                let params = self.parameters(node.child_by_field_name("parameters"));
                self.make_function(node, &params, node.child_by_field_name("body"), &[]);
            }
            "await" => {
                self.push(Op::Await);
                match named_children(node).into_iter().next() {
                    Some(value) => self.expr(value),
                    None => self.constant(Constant::None),
                }
            }
            "yield" => {
                let from = all_children(node).iter().any(|c| c.kind() == "from");
                self.push(Op::Yield { from });
                match named_children(node).into_iter().next() {
                    Some(value) => self.expr(value),
                    None => self.constant(Constant::None),
                }
            }
            "list_splat" | "dictionary_splat" => {
                self.push(Op::Splat {
                    double: node.kind() == "dictionary_splat",
                });
                match named_children(node).into_iter().next() {
                    Some(value) => self.expr(value),
                    None => self.constant(Constant::None),
                }
            }
            "keyword_argument" => self.keyword(node),
            "named_expression" => {
                let (Some(name), Some(value)) =
                    (node.child_by_field_name("name"), node.child_by_field_name("value"))
                else {
                    return self.fallback(node);
                };
                self.push(Op::Node {
                    kind: "named_expression".into(),
                    children: 2,
                });
                self.store_target(name);
                self.expr(value);
            }
            _ => self.fallback(node),
        }
    }

    /// Generic structural op over the named children; leaves keep their text.
    fn fallback(&mut self, node: Node) {
        let children = named_children(node);
        if children.is_empty() {
            let kind = format!("{}:{}", node.kind(), self.text(node));
            self.push(Op::Node { kind, children: 0 });
            return;
        }
        self.push(Op::Node {
            kind: node.kind().to_string(),
            children: children.len() as u32,
        });
        for child in children {
            self.any(child);
        }
    }

    fn sequence(&mut self, kind: Collection, elements: &[Node]) {
        self.push(Op::Build {
            kind,
            len: elements.len() as u32,
        });
        for element in elements {
            self.expr(*element);
        }
    }

    fn dict_entry(&mut self, entry: Node) {
        if entry.kind() == "pair" {
            match (entry.child_by_field_name("key"), entry.child_by_field_name("value")) {
                (Some(key), Some(value)) => {
                    self.expr(key);
                    self.expr(value);
                }
                _ => self.fallback(entry),
            }
        } else {
            self.expr(entry);
        }
    }

    fn index(&mut self, subscript: Node) {
        let indices = field_children(subscript, "subscript");
        match indices.as_slice() {
            [single] => self.expr(*single),
            many => self.sequence(Collection::Tuple, many),
        }
    }

    fn call(&mut self, node: Node) {
        let arguments = node.child_by_field_name("arguments");
        let (positional, keywords): (Vec<Node>, Vec<Node>) = match arguments {
            Some(args) if args.kind() == "generator_expression" => (vec![args], Vec::new()),
            Some(args) => named_children(args)
                .into_iter()
                .partition(|a| !matches!(a.kind(), "keyword_argument" | "dictionary_splat")),
            None => (Vec::new(), Vec::new()),
        };

        self.push(Op::Call {
            args: positional.len() as u32,
            keywords: keywords.len() as u32,
        });
        match node.child_by_field_name("function") {
            Some(function) => self.expr(function),
            None => self.constant(Constant::None),
        }
        for arg in positional {
            self.expr(arg);
        }
        for keyword in keywords {
            self.expr(keyword);
        }
    }

    fn keyword(&mut self, node: Node) {
        let name = node
            .child_by_field_name("name")
            .map(|n| self.text(n).to_string())
            .unwrap_or_default();
        self.push(Op::Keyword(name));
        match node.child_by_field_name("value") {
            Some(value) => self.expr(value),
            None => self.constant(Constant::None),
        }
    }

    fn comparison(&mut self, node: Node) {
        let mut operands = Vec::new();
        let mut tokens = Vec::new();
        for child in all_children(node) {
            if child.is_named() {
                operands.push(child);
            } else {
                tokens.push(child.kind());
            }
        }

        let mut ops = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let symbol = match (tokens[i], tokens.get(i + 1)) {
                ("is", Some(&"not")) | ("not", Some(&"in")) => {
                    i += 1;
                    if tokens[i - 1] == "is" { "is not" } else { "not in" }
                }
                (token, _) => token,
            };
            match CmpOp::from_symbol(symbol) {
                Some(op) => ops.push(op),
                None => return self.fallback(node),
            }
            i += 1;
        }

        self.push(Op::Compare(ops));
        for operand in operands {
            self.expr(operand);
        }
    }

    fn comprehension(&mut self, kind: Collection, node: Node) {
        let body = node.child_by_field_name("body");
        let clauses: Vec<Node> = named_children(node)
            .into_iter()
            .filter(|c| matches!(c.kind(), "for_in_clause" | "if_clause"))
            .collect();

        self.push(Op::Comprehension {
            kind,
            clauses: clauses.len() as u32,
        });
        match body {
            Some(body) => self.dict_entry(body),
            None => self.constant(Constant::None),
        }
        for clause in clauses {
            if clause.kind() == "for_in_clause" {
                self.push(Op::ForClause);
                if let Some(left) = clause.child_by_field_name("left") {
                    self.store_target(left);
                }
                let right = field_children(clause, "right");
                match right.as_slice() {
                    [single] => self.expr(*single),
                    many => self.sequence(Collection::Tuple, many),
                }
            } else {
                self.push(Op::IfClause);
                match named_children(clause).into_iter().next() {
                    Some(condition) => self.expr(condition),
                    None => self.constant(Constant::Bool(true)),
                }
            }
        }
    }

    // ── Strings ─────────────────────────────────────────────

    fn string_literal<'t>(&self, node: Node<'t>) -> StringLiteral<'t> {
        let text = self.text(node);
        let prefix_len = text.find(['\'', '"']).unwrap_or(0);
        let prefix = text[..prefix_len].to_ascii_lowercase();
        let quote = &text[prefix_len..];
        let quote_len = if quote.starts_with("\"\"\"") || quote.starts_with("'''") {
            3
        } else {
            1
        };

        let raw = prefix.contains('r');
        let formatted = prefix.contains('f');
        let start = node.start_byte() + prefix_len + quote_len;
        let end = node.end_byte().saturating_sub(quote_len).max(start);

        let mut pieces = Vec::new();
        let mut cursor = start;
        let decode = |from: usize, to: usize| {
            let slice = std::str::from_utf8(&self.source[from..to]).unwrap_or("");
            let text = if formatted {
                slice.replace("{{", "{").replace("}}", "}")
            } else {
                slice.to_string()
            };
            if raw { text } else { unescape(&text) }
        };
        if formatted {
            for child in named_children(node) {
                if child.kind() == "interpolation" {
                    if child.start_byte() > cursor {
                        pieces.push(Piece::Text(decode(cursor, child.start_byte())));
                    }
                    pieces.push(Piece::Interpolation(child));
                    cursor = child.end_byte();
                }
            }
        }
        if end > cursor || pieces.is_empty() {
            pieces.push(Piece::Text(decode(cursor, end.max(cursor))));
        }

        StringLiteral {
            bytes: prefix.contains('b'),
            formatted,
            pieces,
        }
    }

    fn emit_string(&mut self, literal: StringLiteral) {
        // Adjacent text merges so `"a" "b"` equals `"ab"`.
        let mut pieces: Vec<Piece> = Vec::new();
        for piece in literal.pieces {
            if let (Piece::Text(next), Some(Piece::Text(last))) = (&piece, pieces.last_mut()) {
                last.push_str(next);
                continue;
            }
            pieces.push(piece);
        }

        if !literal.formatted {
            let text = match pieces.into_iter().next() {
                Some(Piece::Text(text)) => text,
                _ => String::new(),
            };
            if literal.bytes {
                self.constant(Constant::Bytes(latin1_bytes(&text)));
            } else {
                self.constant(Constant::Str(text));
            }
            return;
        }

        self.push(Op::Format {
            parts: pieces.len() as u32,
        });
        for piece in pieces {
            match piece {
                Piece::Text(text) => self.constant(Constant::Str(text)),
                Piece::Interpolation(node) => self.interpolation(node),
            }
        }
    }

    fn interpolation(&mut self, node: Node) {
        let mut kind = String::from("interpolation");
        for child in named_children(node) {
            match child.kind() {
                "type_conversion" => kind.push_str(self.text(child)),
                "format_specifier" => {
                    kind.push(':');
                    kind.push_str(self.text(child).trim_start_matches(':'));
                }
                _ => {}
            }
        }
        self.push(Op::Node { kind, children: 1 });
        match node
            .child_by_field_name("expression")
            .or_else(|| named_children(node).into_iter().next())
        {
            Some(expression) => self.expr(expression),
            None => self.constant(Constant::None),
        }
    }
}

fn arity(params: &[Param]) -> u32 {
    params.iter().filter(|p| p.name.is_some()).count() as u32
}

fn flatten_bool<'t>(node: Node<'t>, op: BoolOp, out: &mut Vec<Node<'t>>) {
    let same = node.kind() == "boolean_operator"
        && matches!(
            (op, node.child_by_field_name("operator").map(|o| o.kind())),
            (BoolOp::And, Some("and")) | (BoolOp::Or, Some("or"))
        );
    if !same {
        out.push(node);
        return;
    }
    for side in ["left", "right"] {
        if let Some(child) = node.child_by_field_name(side) {
            flatten_bool(child, op, out);
        }
    }
}

/// `(bound name, imported path)` for every name an import statement binds.
///
/// The path is `module` for `import module [as alias]` and `module:name` for
/// `from module import name [as alias]`; it never contains the alias.
pub(crate) fn import_bindings(node: Node, source: &[u8]) -> Vec<(String, String)> {
    let text = |n: Node| n.utf8_text(source).unwrap_or("").to_string();
    let from = node.kind() == "import_from_statement";
    let module = node
        .child_by_field_name("module_name")
        .map(text)
        .unwrap_or_default();
    let origin = |imported: &str| {
        if from {
            format!("{}:{}", module, imported)
        } else {
            imported.to_string()
        }
    };

    let imported = if from {
        field_children(node, "name")
    } else {
        named_children(node)
    };
    let mut bindings = Vec::new();
    for child in imported {
        match child.kind() {
            "aliased_import" => {
                let name = child.child_by_field_name("name").map(text).unwrap_or_default();
                if let Some(alias) = child.child_by_field_name("alias") {
                    bindings.push((text(alias), origin(&name)));
                }
            }
            "dotted_name" if !from => {
                let full = text(child);
                let head = full.split('.').next().unwrap_or_default().to_string();
                bindings.push((head, origin(&full)));
            }
            "dotted_name" => {
                let full = text(child);
                let last = full.rsplit('.').next().unwrap_or_default().to_string();
                bindings.push((last, origin(&full)));
            }
            _ => {}
        }
    }
    bindings
}

/// Pre-pass over a function body: every name it binds, in binding order.
///
/// Does not descend into nested functions, lambdas or classes, whose own
/// bindings are not locals of this function.
fn collect_locals(
    node: Node,
    source: &[u8],
    assigned: &mut Vec<String>,
    declared: &mut HashSet<String>,
    globals: &mut HashSet<String>,
) {
    let text = |n: Node| n.utf8_text(source).unwrap_or("").to_string();
    match node.kind() {
        "function_definition" | "class_definition" => {
            if let Some(name) = node.child_by_field_name("name") {
                assigned.push(text(name));
            }
            return;
        }
        "decorated_definition" => {
            if let Some(name) = node
                .child_by_field_name("definition")
                .and_then(|d| d.child_by_field_name("name"))
            {
                assigned.push(text(name));
            }
            return;
        }
        "lambda" => return,
        "global_statement" | "nonlocal_statement" => {
            for name in named_children(node) {
                declared.insert(text(name));
                if node.kind() == "global_statement" {
                    globals.insert(text(name));
                }
            }
            return;
        }
        "import_statement" | "import_from_statement" => {
            assigned.extend(import_bindings(node, source).into_iter().map(|(name, _)| name));
            return;
        }
        "assignment" | "augmented_assignment" | "for_statement" | "for_in_clause" => {
            if let Some(left) = node.child_by_field_name("left") {
                collect_targets(left, source, assigned);
            }
        }
        "named_expression" => {
            if let Some(name) = node.child_by_field_name("name") {
                assigned.push(text(name));
            }
        }
        "as_pattern" => {
            if let Some(alias) = node.child_by_field_name("alias") {
                collect_targets(alias, source, assigned);
            }
        }
        "case_pattern" => {
            collect_captures(node, source, assigned);
            return;
        }
        "except_clause" | "except_group_clause" => {
            let parts: Vec<Node> = named_children(node)
                .into_iter()
                .filter(|c| c.kind() != "block")
                .collect();
            if let [_, alias, ..] = parts.as_slice() {
                collect_targets(*alias, source, assigned);
            }
        }
        _ => {}
    }
    for child in named_children(node) {
        collect_locals(child, source, assigned, declared, globals);
    }
}

/// Capture names bound by a `case` pattern. Dotted value patterns, class
/// names and keyword names do not bind.
fn collect_captures(node: Node, source: &[u8], assigned: &mut Vec<String>) {
    let children = named_children(node);
    match node.kind() {
        "identifier" => assigned.push(node.utf8_text(source).unwrap_or("").to_string()),
        "dotted_name" => {
            if let [single] = children.as_slice() {
                collect_captures(*single, source, assigned);
            }
        }
        "class_pattern" | "keyword_pattern" => {
            for child in children.into_iter().skip(1) {
                collect_captures(child, source, assigned);
            }
        }
        "as_pattern" => {
            let alias = node.child_by_field_name("alias");
            for child in children {
                if Some(child) == alias {
                    collect_targets(child, source, assigned);
                } else {
                    collect_captures(child, source, assigned);
                }
            }
        }
        _ => {
            for child in children {
                collect_captures(child, source, assigned);
            }
        }
    }
}

fn collect_targets(node: Node, source: &[u8], assigned: &mut Vec<String>) {
    match node.kind() {
        "identifier" => assigned.push(node.utf8_text(source).unwrap_or("").to_string()),
        "pattern_list" | "tuple_pattern" | "list_pattern" | "tuple" | "list" | "expression_list"
        | "parenthesized_expression" | "list_splat_pattern" | "list_splat" | "as_pattern_target" => {
            for child in named_children(node) {
                collect_targets(child, source, assigned);
            }
        }
        _ => {}
    }
}

fn int_constant(text: &str) -> Option<Constant> {
    let clean: String = text
        .chars()
        .filter(|c| *c != '_')
        .collect::<String>()
        .to_ascii_lowercase();
    if let Some(imaginary) = clean.strip_suffix('j') {
        return imaginary.parse::<f64>().ok().map(|v| Constant::Imaginary(v.to_bits()));
    }
    let clean = clean.trim_end_matches('l');
    let (digits, radix, prefix) = if let Some(rest) = clean.strip_prefix("0x") {
        (rest, 16, "0x")
    } else if let Some(rest) = clean.strip_prefix("0o") {
        (rest, 8, "0o")
    } else if let Some(rest) = clean.strip_prefix("0b") {
        (rest, 2, "0b")
    } else {
        (clean, 10, "")
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    match i128::from_str_radix(digits, radix) {
        Ok(value) => Some(Constant::Int(value)),
        Err(_) => {
            let trimmed = digits.trim_start_matches('0');
            Some(Constant::BigInt(format!("{}{}", prefix, trimmed)))
        }
    }
}

fn float_constant(text: &str) -> Option<Constant> {
    let clean: String = text
        .chars()
        .filter(|c| *c != '_')
        .collect::<String>()
        .to_ascii_lowercase();
    if let Some(imaginary) = clean.strip_suffix('j') {
        return imaginary.parse::<f64>().ok().map(|v| Constant::Imaginary(v.to_bits()));
    }
    clean.parse::<f64>().ok().map(|v| Constant::Float(v.to_bits()))
}

/// Decode Python backslash escapes. Unknown escapes are kept verbatim.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(next) = chars.next() else {
            out.push('\\');
            break;
        };
        match next {
            '\n' => {}
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'a' => out.push('\u{07}'),
            'b' => out.push('\u{08}'),
            'f' => out.push('\u{0C}'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\u{0B}'),
            '0'..='7' => {
                let mut value = next.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|d| d.to_digit(8)) {
                        Some(digit) => {
                            value = value * 8 + digit;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.extend(char::from_u32(value));
            }
            'x' | 'u' | 'U' => {
                let width = match next {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let digits: String = (0..width).filter_map(|_| chars.next_if(|d| d.is_ascii_hexdigit())).collect();
                match u32::from_str_radix(&digits, 16).ok().and_then(char::from_u32) {
                    Some(decoded) if digits.len() == width => out.push(decoded),
                    _ => {
                        out.push('\\');
                        out.push(next);
                        out.push_str(&digits);
                    }
                }
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    out
}

fn latin1_bytes(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len());
    for c in text.chars() {
        match u8::try_from(u32::from(c)) {
            Ok(byte) => bytes.push(byte),
            Err(_) => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    bytes
}
