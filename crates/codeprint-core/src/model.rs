//! Core data structures for code units and their canonical forms

use serde::{Deserialize, Serialize};

/// Session-local identity of a code unit.
///
/// Allocated by the environment when a definition is encountered and never
/// reused within one session. Not stable across process restarts; use
/// [`CodeUnit::label`] where a restart-independent name is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct UnitId(pub u64);

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// A `(scope, name)` pair naming one binding slot in the environment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BindingKey {
    pub scope: String,
    pub name: String,
}

impl BindingKey {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        BindingKey {
            scope: scope.into(),
            name: name.into(),
        }
    }

    /// Key standing for whether `scope` itself is loaded. Its name is empty,
    /// which no binding can have.
    pub fn scope(scope: impl Into<String>) -> Self {
        Self::new(scope, "")
    }
}

impl std::fmt::Display for BindingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.scope, self.name)
    }
}

/// An immutable, named unit of behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeUnit {
    pub id: UnitId,
    /// Lexical scope the unit was defined in (a module name for Python).
    pub scope: String,
    pub name: String,
    pub body: UnitBody,
}

impl CodeUnit {
    /// Stable identity label, `scope.name`.
    pub fn label(&self) -> String {
        format!("{}.{}", self.scope, self.name)
    }

    pub fn key(&self) -> BindingKey {
        BindingKey::new(self.scope.clone(), self.name.clone())
    }

    pub fn form(&self) -> Option<&CanonicalForm> {
        match &self.body {
            UnitBody::Canonical(form) => Some(form),
            UnitBody::Unavailable { .. } => None,
        }
    }
}

/// What the compilation collaborator produced for a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnitBody {
    Canonical(CanonicalForm),
    /// The implementation could not be reduced to canonical form.
    Unavailable { reason: String },
}

/// Normalized structural representation of a unit's implementation.
///
/// `ops` is a prefix-ordered instruction stream: every operator precedes its
/// operands, so the operand immediately following [`Op::Call`] is the callee.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanonicalForm {
    /// Declared parameter count.
    pub arity: u32,
    pub ops: Vec<Op>,
    pub constants: Vec<Constant>,
    /// Names loaded from an enclosing or global scope, indexed by [`Op::LoadGlobal`].
    pub names: Vec<String>,
}

impl CanonicalForm {
    pub fn new(arity: u32) -> Self {
        CanonicalForm {
            arity,
            ..Default::default()
        }
    }

    /// Intern a constant, returning its index. Equal constants share a slot.
    pub fn constant(&mut self, value: Constant) -> u32 {
        if let Some(pos) = self.constants.iter().position(|c| *c == value) {
            return pos as u32;
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    /// Intern a global name, returning its index.
    pub fn name(&mut self, name: &str) -> u32 {
        if let Some(pos) = self.names.iter().position(|n| n == name) {
            return pos as u32;
        }
        self.names.push(name.to_string());
        (self.names.len() - 1) as u32
    }

    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }
}

/// Abstract operation in a canonical form.
///
/// Operand counts are implied by each variant so the prefix stream can be
/// walked without brackets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    // ── Values ──────────────────────────────────────────────
    /// Local slot; parameters occupy `0..arity`.
    LoadLocal(u32),
    /// Variable captured from an enclosing function: `(depth, slot)`.
    LoadFree(u32, u32),
    LoadGlobal(u32),
    LoadConst(u32),

    // ── Stores (followed by the value expression) ───────────
    StoreLocal(u32),
    StoreFree(u32, u32),
    StoreGlobal(u32),
    /// Store into an attribute: followed by object, then value.
    StoreAttr(String),
    /// Store into a subscript: followed by object, index, value.
    StoreSubscript,
    /// Destructuring store: followed by `n` targets, then the value.
    Unpack(u32),
    Delete(u32),

    // ── Expressions ─────────────────────────────────────────
    /// Followed by callee, `args` positional args, then `keywords` keyword args.
    Call { args: u32, keywords: u32 },
    /// Keyword argument name; followed by its value.
    Keyword(String),
    /// `*expr` / `**expr` in a call or display; followed by the expression.
    Splat { double: bool },
    /// Followed by the object.
    Attr(String),
    /// Followed by object and index.
    Subscript,
    /// Followed by `parts` optional bounds; absent bounds are `LoadConst` of `None`.
    Slice { parts: u32 },
    Binary(BinOp),
    Unary(UnOp),
    /// Short-circuit chain over `n` operands.
    Bool { op: BoolOp, operands: u32 },
    /// Chained comparison: followed by `ops.len() + 1` operands.
    Compare(Vec<CmpOp>),
    /// Followed by condition, then-value, else-value.
    Conditional,
    /// Collection display with `n` elements (dict entries count as 2).
    Build { kind: Collection, len: u32 },
    /// Comprehension producing `kind`: followed by element(s), then `clauses` clauses.
    Comprehension { kind: Collection, clauses: u32 },
    /// `for` clause: followed by target, iterable. `If` clause: followed by condition.
    ForClause,
    IfClause,
    /// f-string made of `parts` pieces.
    Format { parts: u32 },
    /// Nested function or lambda; operand is the `Constant::Code` index, followed by
    /// `defaults` default-value expressions and `decorators` decorator expressions.
    MakeFunction { code: u32, defaults: u32, decorators: u32 },
    Await,
    Yield { from: bool },

    // ── Statements ──────────────────────────────────────────
    /// Expression evaluated for effect; followed by the expression.
    Discard,
    Return,
    ReturnNone,
    Pass,
    Break,
    Continue,
    /// Followed by `args` operands (exception, cause).
    Raise { args: u32 },
    /// Followed by test and message (or `None`).
    Assert,
    /// Opens a block; every block ends with `End`.
    If,
    Else,
    While,
    /// Followed by target, iterable, then the body block.
    For,
    Try,
    /// Handler with optional type and optional binding.
    Except { typed: bool, bound: bool },
    Finally,
    /// `with` with `items` context managers, each followed by optional binding.
    With { items: u32 },
    End,

    /// Structural fallback for syntax without a dedicated op; followed by
    /// `children` operands.
    Node { kind: String, children: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    MatMul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitAnd,
    BitOr,
    BitXor,
}

impl BinOp {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol.trim_end_matches('=') {
            "+" => BinOp::Add,
            "-" => BinOp::Sub,
            "*" => BinOp::Mul,
            "@" => BinOp::MatMul,
            "/" => BinOp::Div,
            "//" => BinOp::FloorDiv,
            "%" => BinOp::Mod,
            "**" => BinOp::Pow,
            "<<" => BinOp::LShift,
            ">>" => BinOp::RShift,
            "&" => BinOp::BitAnd,
            "|" => BinOp::BitOr,
            "^" => BinOp::BitXor,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Pos,
    Invert,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}

impl CmpOp {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "==" => CmpOp::Eq,
            "!=" | "<>" => CmpOp::NotEq,
            "<" => CmpOp::Lt,
            "<=" => CmpOp::LtE,
            ">" => CmpOp::Gt,
            ">=" => CmpOp::GtE,
            "is" => CmpOp::Is,
            "is not" => CmpOp::IsNot,
            "in" => CmpOp::In,
            "not in" => CmpOp::NotIn,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collection {
    List,
    Tuple,
    Set,
    Dict,
    Generator,
}

/// Literal constant referenced by [`Op::LoadConst`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i128),
    /// Integers outside `i128`, as normalized decimal or radix-prefixed text.
    BigInt(String),
    /// IEEE 754 bit pattern.
    Float(u64),
    /// Imaginary literal bit pattern.
    Imaginary(u64),
    Str(String),
    Bytes(Vec<u8>),
    Ellipsis,
    /// Nested function body.
    Code(Box<CanonicalForm>),
}

/// Outcome of resolving a symbolic name in a unit's environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    Unit(UnitId),
    /// Bound outside the fingerprinting domain (builtin, foreign module, class, ...).
    Opaque(String),
    Unresolved(UnresolvedReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UnresolvedReason {
    /// The name has no binding in scope.
    Unbound,
    /// The name binds differently depending on control flow.
    Ambiguous,
    /// An import chain loops back on itself.
    ImportCycle,
}

impl UnresolvedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnresolvedReason::Unbound => "unbound",
            UnresolvedReason::Ambiguous => "ambiguous",
            UnresolvedReason::ImportCycle => "import-cycle",
        }
    }
}

/// A reference from one unit to whatever a name resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceEdge {
    pub source: UnitId,
    pub name: String,
    pub target: Resolution,
}
