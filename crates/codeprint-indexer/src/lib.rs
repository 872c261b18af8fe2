//! Python front end: parsing, canonicalization and module loading

pub mod builtins;
pub mod canonicalize;
pub mod discover;
pub mod module;
pub mod parser_pool;


pub use builtins::{PythonBuiltins, PYTHON_BUILTINS};
pub use canonicalize::{canonicalize_function, CanonicalizeError, PythonCanonicalizer};
pub use discover::{discover_sources, module_name, SourceFile};
pub use module::{ModuleLoader, ModuleSummary};
pub use parser_pool::{create_parser_pool, ParseRequest, ParseResult, ParserPool};
