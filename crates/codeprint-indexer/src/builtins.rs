//! Python builtin names, treated as opaque primitives

use codeprint_core::Environment;

/// Names from Python's `builtins` module that code calls without importing.
pub const PYTHON_BUILTINS: &[&str] = &[
    "abs", "aiter", "all", "anext", "any", "ascii", "bin", "bool", "breakpoint", "bytearray",
    "bytes", "callable", "chr", "classmethod", "compile", "complex", "delattr", "dict", "dir",
    "divmod", "enumerate", "eval", "exec", "filter", "float", "format", "frozenset", "getattr",
    "globals", "hasattr", "hash", "help", "hex", "id", "input", "int", "isinstance", "issubclass",
    "iter", "len", "list", "locals", "map", "max", "memoryview", "min", "next", "object", "oct",
    "open", "ord", "pow", "print", "property", "range", "repr", "reversed", "round", "set",
    "setattr", "slice", "sorted", "staticmethod", "str", "sum", "super", "tuple", "type", "vars",
    "zip", "__import__",
    // Exceptions commonly raised by constructing them.
    "BaseException", "Exception", "ArithmeticError", "AssertionError", "AttributeError",
    "EOFError", "FileNotFoundError", "ImportError", "IndexError", "KeyError", "KeyboardInterrupt",
    "LookupError", "MemoryError", "NameError", "NotImplementedError", "OSError", "OverflowError",
    "PermissionError", "RecursionError", "RuntimeError", "StopIteration", "StopAsyncIteration",
    "SyntaxError", "SystemExit", "TimeoutError", "TypeError", "UnicodeDecodeError",
    "UnicodeEncodeError", "ValueError", "ZeroDivisionError",
];

/// Builtin set for one environment: the fixed names plus configured extras.
#[derive(Debug, Clone, Default)]
pub struct PythonBuiltins {
    extra: Vec<String>,
}

impl PythonBuiltins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PythonBuiltins {
            extra: extra.into_iter().map(Into::into).collect(),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        PYTHON_BUILTINS.iter().copied().chain(self.extra.iter().map(String::as_str))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().any(|n| n == name)
    }

    pub fn install(&self, env: &Environment) {
        env.add_builtins(self.names());
    }

    /// A fresh environment with these builtins installed.
    pub fn environment(&self) -> Environment {
        let env = Environment::new();
        self.install(&env);
        env
    }
}
