//! Python source discovery, respecting `.gitignore`

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A Python file and the module name it defines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Dotted module name, e.g. `pkg.sub.mod`.
    pub module: String,
    /// Whether the file is a package `__init__.py`.
    pub is_package: bool,
}

impl SourceFile {
    /// Package that relative imports in this file resolve against.
    pub fn package(&self) -> String {
        if self.is_package {
            return self.module.clone();
        }
        match self.module.rsplit_once('.') {
            Some((package, _)) => package.to_string(),
            None => String::new(),
        }
    }
}

/// Dotted module name of `path` relative to `root`.
pub fn module_name(root: &Path, path: &Path) -> Option<(String, bool)> {
    let relative = path.strip_prefix(root).ok()?;
    let stem = relative.with_extension("");
    let mut parts: Vec<String> = stem
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let is_package = parts.last().is_some_and(|p| p == "__init__");
    if is_package {
        parts.pop();
    }
    if parts.is_empty() || parts.iter().any(|p| p.is_empty() || p.contains('.')) {
        return None;
    }
    Some((parts.join("."), is_package))
}

/// Every `.py` file under `root`, sorted by module name.
pub fn discover_sources(root: &Path) -> Result<Vec<SourceFile>> {
    let mut files = Vec::new();
    for entry in ignore::WalkBuilder::new(root).build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_some_and(|t| t.is_file()) || path.extension().and_then(|e| e.to_str()) != Some("py") {
            continue;
        }
        match module_name(root, path) {
            Some((module, is_package)) => files.push(SourceFile {
                path: path.to_path_buf(),
                module,
                is_package,
            }),
            None => tracing::debug!("No module name for {}", path.display()),
        }
    }
    files.sort_by(|a, b| a.module.cmp(&b.module));
    tracing::debug!("Discovered {} Python sources under {}", files.len(), root.display());
    Ok(files)
}
