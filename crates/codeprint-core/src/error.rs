//! Error types for the fingerprint engine

use crate::model::UnitId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The unit identity is not known to the environment.
    #[error("unknown code unit {0}")]
    UnknownUnit(UnitId),

    /// A unit could not be canonicalized. Only raised in strict mode; otherwise
    /// the unit hashes as an opaque leaf and the failure is reported.
    #[error("cannot canonicalize {unit}: {reason}")]
    Canonicalization { unit: String, reason: String },

    /// A binding changed between discovery and hashing.
    #[error("stale dependency graph: `{name}` referenced from {unit} was rebound during fingerprinting")]
    StaleGraph { unit: String, name: String },

    /// SCC ordering produced an unfinalized dependency. Always a bug.
    #[error("internal cycle detection failure: {0}")]
    CycleDetectionInternal(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
