//! Codeprint Core: canonical forms, symbol environment and the SCC fingerprint engine

pub mod model;
pub mod hash;
pub mod extract;
pub mod symbols;
pub mod graph;
pub mod cache;
pub mod engine;
pub mod config;
pub mod error;

#[cfg(test)]
pub mod tests;

#[cfg(test)]
pub mod test_utils;

pub use model::{
    BinOp, BindingKey, BoolOp, CanonicalForm, CmpOp, CodeUnit, Collection, Constant, Op, ReferenceEdge,
    Resolution, UnOp, UnitBody, UnitId, UnresolvedReason,
};
pub use hash::{Fingerprint, FingerprintHasher, FORMAT_VERSION};
pub use extract::{extract_references, NoPrimitives, PrimitiveOracle, ReferenceMode};
pub use symbols::{Binding, Environment, Resolver, UnitSource};
pub use graph::{DependencyGraph, GraphEdge, GraphUnit};
pub use cache::{CacheStats, CachedFingerprint, Claim, ComputeGuard, FingerprintCache};
pub use engine::{DependencyReport, DependencyTarget, Engine, FingerprintReport};
pub use config::{config_path, EngineConfig, CONFIG_FILE};
pub use error::{Error, Result};
