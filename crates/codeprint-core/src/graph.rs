//! Dependency graph over code units, using petgraph::StableDiGraph

use crate::cache::{DiscoveredEdges, FingerprintCache};
use crate::error::{Error, Result};
use crate::extract::{extract_references, ReferenceMode};
use crate::hash::Fingerprint;
use crate::model::*;
use crate::symbols::{Resolver, UnitSource};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// A node of the dependency graph.
#[derive(Debug, Clone)]
pub enum GraphUnit {
    Unit {
        unit: Arc<CodeUnit>,
        /// Fingerprint already finalized by an earlier request; such nodes are
        /// not expanded.
        cached: Option<Fingerprint>,
    },
    /// Leaf for references bound outside the fingerprinting domain.
    Opaque(String),
    /// Leaf for references that could not be bound.
    Unresolved(UnresolvedReason),
}

impl GraphUnit {
    pub fn unit(&self) -> Option<&Arc<CodeUnit>> {
        match self {
            GraphUnit::Unit { unit, .. } => Some(unit),
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            GraphUnit::Unit { unit, .. } => unit.label(),
            GraphUnit::Opaque(label) => format!("<opaque {}>", label),
            GraphUnit::Unresolved(reason) => format!("<unresolved: {}>", reason.as_str()),
        }
    }

    /// The resolution a reference edge pointing here represents.
    pub fn as_resolution(&self) -> Resolution {
        match self {
            GraphUnit::Unit { unit, .. } => Resolution::Unit(unit.id),
            GraphUnit::Opaque(label) => Resolution::Opaque(label.clone()),
            GraphUnit::Unresolved(reason) => Resolution::Unresolved(*reason),
        }
    }
}

/// Edge weight: the symbolic name used to reach the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum NodeKey {
    Unit(UnitId),
    Opaque(String),
    Unresolved(UnresolvedReason),
}

/// Directed graph of units reachable from one root.
pub struct DependencyGraph {
    inner: StableDiGraph<GraphUnit, GraphEdge>,
    index: HashMap<NodeKey, NodeIndex>,
    root: NodeIndex,
    generation: u64,
    keys: BTreeSet<BindingKey>,
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("node_count", &self.inner.node_count())
            .field("edge_count", &self.inner.edge_count())
            .field("generation", &self.generation)
            .finish()
    }
}

impl DependencyGraph {
    /// Discover every unit reachable from `root`.
    ///
    /// Each identity is expanded at most once. With a warm `cache`, edge lists
    /// are shared across requests and units with a finalized fingerprint become
    /// leaves; the bindings behind that fingerprint are folded into this graph's
    /// key set so invalidation still reaches the root.
    pub fn build<E>(
        root: UnitId,
        env: &E,
        mode: ReferenceMode,
        cache: Option<&FingerprintCache>,
    ) -> Result<Self>
    where
        E: UnitSource + Resolver,
    {
        let generation = env.generation();
        let root_unit = env.unit(root).ok_or(Error::UnknownUnit(root))?;

        let mut graph = DependencyGraph {
            inner: StableDiGraph::new(),
            index: HashMap::new(),
            root: NodeIndex::new(0),
            generation,
            keys: BTreeSet::new(),
        };
        graph.root = graph.add_unit(root_unit, None);

        let mut visited = HashSet::from([root]);
        let mut worklist = vec![root];

        while let Some(id) = worklist.pop() {
            let unit = env.unit(id).ok_or(Error::UnknownUnit(id))?;
            let source = graph.index[&NodeKey::Unit(id)];
            graph.keys.insert(unit.key());

            let discovered = match cache {
                Some(cache) => cache.edges_or_discover(env, id, || discover(&unit, env, mode)),
                None => Arc::new(discover(&unit, env, mode)),
            };
            graph.keys.extend(discovered.keys.iter().cloned());

            for edge in &discovered.edges {
                let target = match &edge.target {
                    Resolution::Unit(target_id) => {
                        if let Some(&existing) = graph.index.get(&NodeKey::Unit(*target_id)) {
                            existing
                        } else {
                            let target_unit = env.unit(*target_id).ok_or(Error::UnknownUnit(*target_id))?;
                            let cached = match cache.and_then(|c| c.entry(*target_id)) {
                                Some(entry) => {
                                    graph.keys.extend(entry.keys.iter().cloned());
                                    Some(entry.fingerprint)
                                }
                                None => None,
                            };
                            let node = graph.add_unit(target_unit, cached);
                            if cached.is_none() && visited.insert(*target_id) {
                                worklist.push(*target_id);
                            }
                            node
                        }
                    }
                    Resolution::Opaque(label) => {
                        graph.leaf(NodeKey::Opaque(label.clone()), GraphUnit::Opaque(label.clone()))
                    }
                    Resolution::Unresolved(reason) => {
                        graph.leaf(NodeKey::Unresolved(*reason), GraphUnit::Unresolved(*reason))
                    }
                };
                graph.inner.add_edge(source, target, GraphEdge { name: edge.name.clone() });
            }
        }

        tracing::debug!(
            "Discovered {} nodes, {} edges from {}",
            graph.inner.node_count(),
            graph.inner.edge_count(),
            graph.inner[graph.root].label()
        );
        Ok(graph)
    }

    fn add_unit(&mut self, unit: Arc<CodeUnit>, cached: Option<Fingerprint>) -> NodeIndex {
        let key = NodeKey::Unit(unit.id);
        let idx = self.inner.add_node(GraphUnit::Unit { unit, cached });
        self.index.insert(key, idx);
        idx
    }

    /// Shared leaf node: one per opaque label, one per unresolved reason.
    fn leaf(&mut self, key: NodeKey, node: GraphUnit) -> NodeIndex {
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let idx = self.inner.add_node(node);
        self.index.insert(key, idx);
        idx
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    /// Environment generation observed when discovery started.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Every binding key consulted while building this graph.
    pub fn keys(&self) -> &BTreeSet<BindingKey> {
        &self.keys
    }

    pub fn node(&self, idx: NodeIndex) -> &GraphUnit {
        &self.inner[idx]
    }

    pub fn node_of(&self, unit: UnitId) -> Option<NodeIndex> {
        self.index.get(&NodeKey::Unit(unit)).copied()
    }

    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.inner.node_indices()
    }

    /// Outgoing `(name, target)` pairs of a node.
    pub fn edges_from(&self, idx: NodeIndex) -> impl Iterator<Item = (&str, NodeIndex)> + '_ {
        self.inner
            .edges_directed(idx, Direction::Outgoing)
            .map(move |e| (self.inner[e.id()].name.as_str(), e.target()))
    }

    pub fn has_self_loop(&self, idx: NodeIndex) -> bool {
        self.inner.contains_edge(idx, idx)
    }

    /// Strongly connected components, dependencies before dependents.
    pub fn sccs(&self) -> Vec<Vec<NodeIndex>> {
        petgraph::algo::tarjan_scc(&self.inner)
    }

    /// Every recorded reference edge whose source is an expanded unit.
    pub fn reference_edges(&self) -> Vec<ReferenceEdge> {
        self.inner
            .edge_indices()
            .filter_map(|e| {
                let (from, to) = self.inner.edge_endpoints(e)?;
                let source = self.inner[from].unit()?;
                Some(ReferenceEdge {
                    source: source.id,
                    name: self.inner[e].name.clone(),
                    target: self.inner[to].as_resolution(),
                })
            })
            .collect()
    }
}

/// Extract and resolve the references of one unit.
fn discover<E>(unit: &CodeUnit, env: &E, mode: ReferenceMode) -> DiscoveredEdges
where
    E: UnitSource + Resolver,
{
    let valid_at = env.generation();
    let mut keys = vec![unit.key()];
    let mut edges = Vec::new();

    if let Some(form) = unit.form() {
        // Every global name matters, including primitives: shadowing a builtin
        // later must invalidate this unit.
        collect_name_keys(form, &unit.scope, &mut keys);

        let oracle = |name: &str| env.is_primitive(unit.id, name);
        for name in extract_references(form, &oracle, mode) {
            let target = env.resolve_traced(unit.id, &name, &mut keys);
            edges.push(ReferenceEdge {
                source: unit.id,
                name,
                target,
            });
        }
    }

    DiscoveredEdges {
        edges,
        keys,
        valid_at,
    }
}

fn collect_name_keys(form: &CanonicalForm, scope: &str, keys: &mut Vec<BindingKey>) {
    keys.extend(form.names.iter().map(|n| BindingKey::new(scope, n.clone())));
    for constant in &form.constants {
        if let Constant::Code(nested) = constant {
            collect_name_keys(nested, scope, keys);
        }
    }
}
