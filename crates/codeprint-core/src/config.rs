//! Engine configuration, loaded from `codeprint.toml`

use crate::error::{Error, Result};
use crate::extract::ReferenceMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file looked up in the repository root.
pub const CONFIG_FILE: &str = "codeprint.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fail instead of hashing units that cannot be canonicalized as opaque leaves.
    pub strict: bool,
    /// Follow globals passed as values, not only those in calling position.
    pub follow_value_references: bool,
    /// Hash independent SCCs of one condensation layer in parallel.
    pub parallel: bool,
    /// Additional names treated as opaque primitives.
    pub extra_builtins: Vec<String>,
}

impl EngineConfig {
    pub fn reference_mode(&self) -> ReferenceMode {
        if self.follow_value_references {
            ReferenceMode::AllGlobals
        } else {
            ReferenceMode::Calls
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from an explicit path.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Load `codeprint.toml` from `root` if present, defaults otherwise.
    pub fn discover(root: &Path) -> Result<Self> {
        let path = config_path(root);
        if !path.exists() {
            tracing::debug!("No {} in {}, using defaults", CONFIG_FILE, root.display());
            return Ok(Self::default());
        }
        tracing::debug!("Loading config: {}", path.display());
        Self::load(&path)
    }

    /// Apply `CODEPRINT_STRICT` / `CODEPRINT_PARALLEL` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = env_flag("CODEPRINT_STRICT") {
            self.strict = value;
        }
        if let Some(value) = env_flag("CODEPRINT_PARALLEL") {
            self.parallel = value;
        }
    }
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

fn env_flag(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            tracing::warn!("Ignoring {}={:?}: expected a boolean", key, other);
            None
        }
    }
}
