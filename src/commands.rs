//! CLI command implementations

use anyhow::{bail, Context};
use codeprint_core::{DependencyTarget, Engine, EngineConfig, Environment, Fingerprint, UnitId, UnitSource};
use codeprint_indexer::{create_parser_pool, ModuleLoader, PythonBuiltins};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;

/// A loaded repository and the engine that fingerprints it.
pub struct Session {
    env: Environment,
    engine: Engine,
}

impl Session {
    pub fn load(root: &Path, config: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::discover(root)?,
        };
        config.apply_env_overrides();
        tracing::debug!("Engine config: {:?}", config);

        let env = PythonBuiltins::with_extra(config.extra_builtins.iter().cloned()).environment();
        let loader = ModuleLoader::new(create_parser_pool());
        let summaries = loader
            .load_tree(&env, root)
            .with_context(|| format!("Failed to load {}", root.display()))?;

        let units: usize = summaries.iter().map(|s| s.units.len()).sum();
        let failures: usize = summaries.iter().map(|s| s.failures.len()).sum();
        tracing::info!("Loaded {} modules, {} functions", summaries.len(), units);
        if failures > 0 {
            tracing::warn!("{} functions could not be canonicalized", failures);
        }

        Ok(Session {
            env,
            engine: Engine::new(config),
        })
    }

    /// `module.function`, or a bare function name that matches exactly one unit.
    fn resolve_target(&self, target: &str) -> anyhow::Result<UnitId> {
        if let Some((scope, name)) = target.rsplit_once('.') {
            if let Some(id) = self.env.lookup(scope, name) {
                return Ok(id);
            }
        }
        let matches = self.env.find_by_name(target);
        match matches.as_slice() {
            [only] => Ok(only.id),
            [] => bail!("No function named {}", target),
            many => {
                let labels: Vec<String> = many.iter().map(|u| u.label()).collect();
                bail!("{} is ambiguous: {}", target, labels.join(", "))
            }
        }
    }

    fn label(&self, unit: UnitId) -> String {
        self.env
            .unit(unit)
            .map(|u| u.label())
            .unwrap_or_else(|| unit.to_string())
    }
}

pub fn hash(session: &Session, targets: &[String]) -> anyhow::Result<()> {
    for target in targets {
        let unit = session.resolve_target(target)?;
        let fingerprint = session.engine.fingerprint(&session.env, unit)?;
        println!("{}  {}", fingerprint, session.label(unit));
    }
    Ok(())
}

pub fn explain(session: &Session, target: &str, depth: usize) -> anyhow::Result<()> {
    let unit = session.resolve_target(target)?;
    let mut expanded = HashSet::new();
    explain_unit(session, unit, depth, 0, &mut expanded)
}

/// Print one report, then expand unit dependencies while `depth` allows.
fn explain_unit(
    session: &Session,
    unit: UnitId,
    depth: usize,
    indent: usize,
    expanded: &mut HashSet<UnitId>,
) -> anyhow::Result<()> {
    let report = session.engine.fingerprint_verbose(&session.env, unit)?;
    let pad = "    ".repeat(indent);
    println!("{}{}  {}", pad, report.fingerprint, report.label);
    if !report.cycle.is_empty() {
        println!("{}  cycle: {}", pad, report.cycle.join(", "));
    }
    if indent == 0 {
        for (label, reason) in &report.failures {
            println!("{}  unavailable: {} ({})", pad, label, reason);
        }
    }
    if !expanded.insert(unit) {
        return Ok(());
    }

    for dependency in &report.dependencies {
        let short = dependency.fingerprint.short();
        match &dependency.target {
            DependencyTarget::Unit { id, label } => {
                println!("{}  {} -> {}  {}", pad, dependency.name, label, short);
                if depth > 1 && !report.cycle.contains(label) {
                    explain_unit(session, *id, depth - 1, indent + 1, expanded)?;
                }
            }
            DependencyTarget::Opaque { label } => {
                println!("{}  {} -> opaque {}  {}", pad, dependency.name, label, short);
            }
            DependencyTarget::Unresolved { reason } => {
                println!("{}  {} -> unresolved ({})  {}", pad, dependency.name, reason, short);
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct UnitEntry {
    label: String,
    fingerprint: String,
}

pub fn units(session: &Session, json: bool) -> anyhow::Result<()> {
    let ids: Vec<UnitId> = session.env.current_units().iter().map(|u| u.id).collect();
    let fingerprints: Vec<(UnitId, Fingerprint)> = session.engine.fingerprint_all(&session.env, &ids)?;

    let entries: Vec<UnitEntry> = fingerprints
        .into_iter()
        .map(|(unit, fingerprint)| UnitEntry {
            label: session.label(unit),
            fingerprint: fingerprint.to_string(),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in &entries {
            println!("{}  {}", entry.fingerprint, entry.label);
        }
    }
    let stats = session.engine.cache().stats();
    tracing::debug!("Cache: {:?}", stats);
    Ok(())
}
