//! Fingerprint engine: SCC-based hashing over the dependency graph
//!
//! Plain memoized recursion cannot fingerprint a cycle: the recursive call
//! reaches a unit whose own entry does not exist yet. Instead the reachable
//! graph is split into strongly connected components, which are hashed
//! dependencies-first. A cyclic component gets one combined fingerprint built
//! from all of its members, shared by every member.

use crate::cache::{Claim, FingerprintCache};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::graph::{DependencyGraph, GraphUnit};
use crate::hash::{Fingerprint, FingerprintHasher};
use crate::model::{CodeUnit, UnitBody, UnitId};
use crate::symbols::{Resolver, UnitSource};
use petgraph::stable_graph::NodeIndex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Computes fingerprints against an environment, memoizing in a warm cache.
pub struct Engine {
    config: EngineConfig,
    cache: Arc<FingerprintCache>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_cache(config, Arc::new(FingerprintCache::new()))
    }

    /// Share a warm cache between engines. The cache must only ever be used
    /// with one environment.
    pub fn with_cache(config: EngineConfig, cache: Arc<FingerprintCache>) -> Self {
        Engine { config, cache }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<FingerprintCache> {
        &self.cache
    }

    /// Fingerprint of `unit` under the environment's current bindings.
    pub fn fingerprint<E>(&self, env: &E, unit: UnitId) -> Result<Fingerprint>
    where
        E: UnitSource + Resolver,
    {
        loop {
            self.cache.sync(env);
            if let Some(fingerprint) = self.cache.fingerprint(unit) {
                return Ok(fingerprint);
            }
            match self.cache.claim(unit) {
                Claim::Compute(_guard) => {
                    let computation = self.compute(env, unit, true)?;
                    return computation.fingerprint_of(computation.graph.root());
                }
                Claim::Waited => continue,
            }
        }
    }

    /// Fingerprints of several units, sharing the warm cache.
    pub fn fingerprint_all<E>(&self, env: &E, units: &[UnitId]) -> Result<Vec<(UnitId, Fingerprint)>>
    where
        E: UnitSource + Resolver,
    {
        units
            .iter()
            .map(|&unit| Ok((unit, self.fingerprint(env, unit)?)))
            .collect()
    }

    /// Fingerprint plus its direct dependencies, for diagnostics.
    ///
    /// Dependencies carry their [`UnitId`], so deeper levels are available by
    /// calling this again on a dependency.
    pub fn fingerprint_verbose<E>(&self, env: &E, unit: UnitId) -> Result<FingerprintReport>
    where
        E: UnitSource + Resolver,
    {
        self.cache.sync(env);
        // Cold discovery: a cached dependency would hide a cycle through the root.
        let computation = self.compute(env, unit, false)?;
        let graph = &computation.graph;
        let root = graph.root();
        let root_unit = graph
            .node(root)
            .unit()
            .ok_or_else(|| Error::CycleDetectionInternal("root is not a unit".into()))?;

        let mut dependencies = Vec::new();
        for (name, target) in graph.edges_from(root) {
            let target_node = graph.node(target);
            dependencies.push(DependencyReport {
                name: name.to_string(),
                target: match target_node {
                    GraphUnit::Unit { unit, .. } => DependencyTarget::Unit {
                        id: unit.id,
                        label: unit.label(),
                    },
                    GraphUnit::Opaque(label) => DependencyTarget::Opaque {
                        label: label.clone(),
                    },
                    GraphUnit::Unresolved(reason) => DependencyTarget::Unresolved {
                        reason: reason.as_str().to_string(),
                    },
                },
                fingerprint: computation.fingerprint_of(target)?,
            });
        }
        dependencies.sort_by(|a, b| a.name.cmp(&b.name));

        let cycle = match computation.cycle_of.get(&root) {
            Some(members) => members.clone(),
            None => Vec::new(),
        };

        Ok(FingerprintReport {
            unit,
            label: root_unit.label(),
            fingerprint: computation.fingerprint_of(root)?,
            cycle,
            dependencies,
            failures: computation.failures.clone(),
        })
    }

    fn compute<E>(&self, env: &E, root: UnitId, warm: bool) -> Result<Computation>
    where
        E: UnitSource + Resolver,
    {
        let cache = warm.then_some(self.cache.as_ref());
        let graph = DependencyGraph::build(root, env, self.config.reference_mode(), cache)?;

        let failures = collect_failures(&graph);
        for (label, reason) in &failures {
            if self.config.strict {
                return Err(Error::Canonicalization {
                    unit: label.clone(),
                    reason: reason.clone(),
                });
            }
            tracing::warn!("Hashing {} as an opaque leaf: {}", label, reason);
        }

        let sccs = graph.sccs();
        tracing::debug!("{} SCCs over {} nodes", sccs.len(), graph.node_count());

        let mut computation = Computation {
            fingerprints: HashMap::with_capacity(graph.node_count()),
            cycle_of: HashMap::new(),
            failures,
            graph,
        };
        if self.config.parallel {
            computation.hash_layered(&sccs)?;
        } else {
            computation.hash_sequential(&sccs)?;
        }

        check_stale(env, &computation.graph)?;
        self.publish(env, &computation);
        Ok(computation)
    }

    fn publish<E>(&self, env: &E, computation: &Computation)
    where
        E: UnitSource + Resolver,
    {
        let graph = &computation.graph;
        let results: Vec<(UnitId, Fingerprint)> = graph
            .nodes()
            .filter_map(|idx| match graph.node(idx) {
                GraphUnit::Unit { unit, cached: None } => {
                    computation.fingerprints.get(&idx).map(|fp| (unit.id, *fp))
                }
                _ => None,
            })
            .collect();
        // Dependencies reuse the root's key set: a superset of what each needs,
        // so eviction may be early but never late.
        let keys = Arc::new(graph.keys().clone());
        self.cache.publish(env, &results, keys, graph.generation());
    }
}

/// Per-request computation state: the graph plus finalized fingerprints.
struct Computation {
    graph: DependencyGraph,
    fingerprints: HashMap<NodeIndex, Fingerprint>,
    /// Sorted member labels of cyclic components, per member node.
    cycle_of: HashMap<NodeIndex, Vec<String>>,
    failures: Vec<(String, String)>,
}

impl Computation {
    fn fingerprint_of(&self, idx: NodeIndex) -> Result<Fingerprint> {
        self.fingerprints.get(&idx).copied().ok_or_else(|| {
            Error::CycleDetectionInternal(format!(
                "{} was never finalized",
                self.graph.node(idx).label()
            ))
        })
    }

    /// Tarjan emits components in reverse topological order, so every
    /// dependency is final before its dependents are reached.
    fn hash_sequential(&mut self, sccs: &[Vec<NodeIndex>]) -> Result<()> {
        for members in sccs {
            let fingerprint = hash_scc(&self.graph, members, &self.fingerprints)?;
            self.finalize(members, fingerprint);
        }
        Ok(())
    }

    /// Hash every component of one condensation layer concurrently. Layers
    /// are separated by a barrier, so readers only ever see finalized entries.
    fn hash_layered(&mut self, sccs: &[Vec<NodeIndex>]) -> Result<()> {
        let mut component_of = HashMap::new();
        for (i, members) in sccs.iter().enumerate() {
            for &node in members {
                component_of.insert(node, i);
            }
        }

        let mut level = vec![0usize; sccs.len()];
        for (i, members) in sccs.iter().enumerate() {
            for &node in members {
                for (_, target) in self.graph.edges_from(node) {
                    let dep = component_of[&target];
                    if dep != i {
                        level[i] = level[i].max(level[dep] + 1);
                    }
                }
            }
        }

        let depth = level.iter().copied().max().map_or(0, |m| m + 1);
        let mut layers: Vec<Vec<usize>> = vec![Vec::new(); depth];
        for (i, &l) in level.iter().enumerate() {
            layers[l].push(i);
        }

        for layer in layers {
            let graph = &self.graph;
            let done = &self.fingerprints;
            let results: Vec<(usize, Fingerprint)> = layer
                .par_iter()
                .map(|&i| Ok((i, hash_scc(graph, &sccs[i], done)?)))
                .collect::<Result<_>>()?;
            for (i, fingerprint) in results {
                self.finalize(&sccs[i], fingerprint);
            }
        }
        Ok(())
    }

    fn finalize(&mut self, members: &[NodeIndex], fingerprint: Fingerprint) {
        let cyclic = is_cyclic(&self.graph, members);
        if cyclic {
            let mut labels: Vec<String> = members.iter().map(|&m| self.graph.node(m).label()).collect();
            labels.sort();
            for &m in members {
                self.cycle_of.insert(m, labels.clone());
            }
            tracing::trace!("cycle {:?} -> {}", labels, fingerprint.short());
        }
        for &m in members {
            self.fingerprints.insert(m, fingerprint);
        }
    }
}

fn is_cyclic(graph: &DependencyGraph, members: &[NodeIndex]) -> bool {
    members.len() > 1 || graph.has_self_loop(members[0])
}

/// Fingerprint one strongly connected component.
fn hash_scc(
    graph: &DependencyGraph,
    members: &[NodeIndex],
    done: &HashMap<NodeIndex, Fingerprint>,
) -> Result<Fingerprint> {
    let Some(&first) = members.first() else {
        return Err(Error::CycleDetectionInternal("empty component".into()));
    };

    // A finalized member from an earlier request covers the whole component:
    // members are always computed and published together.
    for &m in members {
        if let GraphUnit::Unit { cached: Some(fp), .. } = graph.node(m) {
            return Ok(*fp);
        }
    }

    if !is_cyclic(graph, members) {
        return match graph.node(first) {
            GraphUnit::Opaque(_) => Ok(Fingerprint::opaque()),
            GraphUnit::Unresolved(reason) => Ok(Fingerprint::unresolved(*reason)),
            GraphUnit::Unit { unit, .. } => hash_single(graph, first, unit, done),
        };
    }

    let inside: HashSet<NodeIndex> = members.iter().copied().collect();
    let mut entries = Vec::with_capacity(members.len());
    let mut external = BTreeSet::new();
    for &m in members {
        let unit = graph.node(m).unit().ok_or_else(|| {
            Error::CycleDetectionInternal(format!("leaf {} inside a cycle", graph.node(m).label()))
        })?;
        // Ties between equal labels (a superseded unit next to its successor)
        // are broken by body digest so member order never matters.
        entries.push((unit.label(), body_digest(unit), Arc::clone(unit)));
        for (name, target) in graph.edges_from(m) {
            if !inside.contains(&target) {
                external.insert((name.to_string(), finalized(graph, done, target)?));
            }
        }
    }
    entries.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

    let mut hasher = FingerprintHasher::cycle();
    hasher.update_len(entries.len());
    for (label, _, unit) in &entries {
        hasher.update_str(label);
        hasher.update_body(unit.form());
    }
    update_dependencies(&mut hasher, external.iter());
    Ok(hasher.finalize())
}

fn hash_single(
    graph: &DependencyGraph,
    idx: NodeIndex,
    unit: &CodeUnit,
    done: &HashMap<NodeIndex, Fingerprint>,
) -> Result<Fingerprint> {
    let mut deps = Vec::new();
    for (name, target) in graph.edges_from(idx) {
        deps.push((name.to_string(), finalized(graph, done, target)?));
    }
    deps.sort();

    let mut hasher = FingerprintHasher::unit();
    hasher.update_body(unit.form());
    update_dependencies(&mut hasher, deps.iter());
    Ok(hasher.finalize())
}

fn update_dependencies<'a, I>(hasher: &mut FingerprintHasher, deps: I)
where
    I: ExactSizeIterator<Item = &'a (String, Fingerprint)>,
{
    hasher.update_len(deps.len());
    for (name, fingerprint) in deps {
        hasher.update_str(name);
        hasher.update_fingerprint(fingerprint);
    }
}

fn finalized(
    graph: &DependencyGraph,
    done: &HashMap<NodeIndex, Fingerprint>,
    idx: NodeIndex,
) -> Result<Fingerprint> {
    match done.get(&idx) {
        Some(fp) => Ok(*fp),
        None => {
            debug_assert!(false, "dependency {} hashed out of order", graph.node(idx).label());
            Err(Error::CycleDetectionInternal(format!(
                "dependency {} is not finalized",
                graph.node(idx).label()
            )))
        }
    }
}

fn body_digest(unit: &CodeUnit) -> Fingerprint {
    let mut hasher = FingerprintHasher::unit();
    hasher.update_body(unit.form());
    hasher.finalize()
}

fn collect_failures(graph: &DependencyGraph) -> Vec<(String, String)> {
    let mut failures: Vec<(String, String)> = graph
        .nodes()
        .filter_map(|idx| {
            let unit = graph.node(idx).unit()?;
            match &unit.body {
                UnitBody::Unavailable { reason } => Some((unit.label(), reason.clone())),
                UnitBody::Canonical(_) => None,
            }
        })
        .collect();
    failures.sort();
    failures
}

/// Re-resolve every recorded edge if any binding moved since discovery.
fn check_stale<E>(env: &E, graph: &DependencyGraph) -> Result<()>
where
    E: UnitSource + Resolver,
{
    if env.generation() == graph.generation() {
        return Ok(());
    }
    for edge in graph.reference_edges() {
        if env.resolve(edge.source, &edge.name) != edge.target {
            let unit = env
                .unit(edge.source)
                .map(|u| u.label())
                .unwrap_or_else(|| edge.source.to_string());
            tracing::warn!("Stale graph: {} -> {} was rebound", unit, edge.name);
            return Err(Error::StaleGraph {
                unit,
                name: edge.name,
            });
        }
    }
    Ok(())
}

/// Diagnostic view of one fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintReport {
    pub unit: UnitId,
    pub label: String,
    pub fingerprint: Fingerprint,
    /// Labels of every member of the unit's cycle, empty when acyclic.
    pub cycle: Vec<String>,
    /// Direct dependencies, sorted by name.
    pub dependencies: Vec<DependencyReport>,
    /// `(label, reason)` for every reachable unit hashed as an unavailable leaf.
    pub failures: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyReport {
    pub name: String,
    pub target: DependencyTarget,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DependencyTarget {
    Unit { id: UnitId, label: String },
    Opaque { label: String },
    Unresolved { reason: String },
}
