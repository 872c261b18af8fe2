//! Warm fingerprint cache shared across requests
//!
//! Entries are keyed by unit identity and remember every binding key that was
//! consulted to produce them. [`FingerprintCache::sync`] evicts entries whose
//! keys were rebound since the last sync, which covers both redefinition of the
//! unit itself and redefinition of anything it transitively reaches.
//!
//! A root being computed is marked in flight; other requests for the same root
//! wait for it instead of computing it again.

use crate::hash::Fingerprint;
use crate::model::{BindingKey, ReferenceEdge, UnitId};
use crate::symbols::Resolver;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// A finalized fingerprint plus the bindings it depends on.
#[derive(Debug, Clone)]
pub struct CachedFingerprint {
    pub fingerprint: Fingerprint,
    pub keys: Arc<BTreeSet<BindingKey>>,
}

/// Resolved references of one unit.
#[derive(Debug, Clone)]
pub struct DiscoveredEdges {
    pub edges: Vec<ReferenceEdge>,
    pub keys: Vec<BindingKey>,
    /// Environment generation observed before resolving.
    pub valid_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub fingerprints: usize,
    pub edges: usize,
    pub synced_generation: u64,
    /// Root computations started through [`FingerprintCache::claim`].
    pub computations: u64,
}

#[derive(Default)]
struct InFlight {
    done: Mutex<bool>,
    finished: Condvar,
}

/// Outcome of [`FingerprintCache::claim`].
pub enum Claim<'a> {
    /// The caller computes the root; other claimants wait until the guard drops.
    Compute(ComputeGuard<'a>),
    /// Another request computed the root meanwhile. Look in the cache again.
    Waited,
}

/// Held while one request computes a root.
pub struct ComputeGuard<'a> {
    cache: &'a FingerprintCache,
    unit: UnitId,
    flight: Arc<InFlight>,
}

impl Drop for ComputeGuard<'_> {
    fn drop(&mut self) {
        self.cache.in_flight.remove(&self.unit);
        let mut done = self.flight.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        self.flight.finished.notify_all();
    }
}

#[derive(Default)]
pub struct FingerprintCache {
    fingerprints: DashMap<UnitId, CachedFingerprint>,
    edges: DashMap<UnitId, Arc<DiscoveredEdges>>,
    in_flight: DashMap<UnitId, Arc<InFlight>>,
    synced: AtomicU64,
    computations: AtomicU64,
}

impl FingerprintCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evict everything invalidated by bindings changed since the last sync.
    pub fn sync(&self, resolver: &dyn Resolver) {
        let current = resolver.generation();
        let last = self.synced.load(Ordering::Acquire);
        if current == last {
            return;
        }
        if current < last {
            // Generations only grow within one environment.
            tracing::warn!("Environment generation went backwards ({} < {}), clearing cache", current, last);
            self.clear();
            self.synced.store(current, Ordering::Release);
            return;
        }

        let changed: HashSet<BindingKey> = resolver.changed_since(last).into_iter().collect();
        if !changed.is_empty() {
            let before = self.fingerprints.len();
            self.fingerprints
                .retain(|_, entry| !entry.keys.iter().any(|k| changed.contains(k)));
            self.edges
                .retain(|_, entry| !entry.keys.iter().any(|k| changed.contains(k)));
            tracing::debug!(
                "Cache sync {}..{}: {} rebound keys, evicted {} fingerprints",
                last,
                current,
                changed.len(),
                before - self.fingerprints.len()
            );
        }
        self.synced.fetch_max(current, Ordering::AcqRel);
    }

    pub fn fingerprint(&self, unit: UnitId) -> Option<Fingerprint> {
        self.fingerprints.get(&unit).map(|e| e.fingerprint)
    }

    pub fn entry(&self, unit: UnitId) -> Option<CachedFingerprint> {
        self.fingerprints.get(&unit).map(|e| e.value().clone())
    }

    /// Publish finalized fingerprints computed against generation `valid_at`.
    ///
    /// First writer wins. Entries are withdrawn again if any of `keys` was
    /// rebound after `valid_at`, so a result raced by a redefinition never
    /// outlives the next lookup.
    pub fn publish(
        &self,
        resolver: &dyn Resolver,
        results: &[(UnitId, Fingerprint)],
        keys: Arc<BTreeSet<BindingKey>>,
        valid_at: u64,
    ) {
        for (unit, fingerprint) in results {
            self.fingerprints
                .entry(*unit)
                .or_insert_with(|| CachedFingerprint {
                    fingerprint: *fingerprint,
                    keys: Arc::clone(&keys),
                });
        }

        if resolver.generation() != valid_at {
            let changed = resolver.changed_since(valid_at);
            if changed.iter().any(|k| keys.contains(k)) {
                tracing::debug!("Withdrawing {} fingerprints raced by a rebind", results.len());
                for (unit, _) in results {
                    self.fingerprints.remove(unit);
                }
            }
        }
    }

    /// Claim the computation of root `unit`, or wait for the request that
    /// already holds it.
    ///
    /// A waiter is released whether the holder succeeded or failed; it then
    /// finds the published fingerprint, or claims the root itself.
    pub fn claim(&self, unit: UnitId) -> Claim<'_> {
        let flight = match self.in_flight.entry(unit) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                // Published between the caller's lookup and this claim.
                if self.fingerprints.contains_key(&unit) {
                    return Claim::Waited;
                }
                let flight = Arc::new(InFlight::default());
                entry.insert(Arc::clone(&flight));
                self.computations.fetch_add(1, Ordering::Relaxed);
                return Claim::Compute(ComputeGuard {
                    cache: self,
                    unit,
                    flight,
                });
            }
        };

        tracing::trace!("Waiting for in-flight computation of {}", unit);
        let mut done = flight.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = flight.finished.wait(done).unwrap_or_else(|e| e.into_inner());
        }
        Claim::Waited
    }

    /// Edges of `unit`, discovering them at most once.
    ///
    /// Concurrent callers for the same identity block on the map entry while
    /// the first one runs `discover`, then share its result.
    pub fn edges_or_discover<F>(&self, resolver: &dyn Resolver, unit: UnitId, discover: F) -> Arc<DiscoveredEdges>
    where
        F: FnOnce() -> DiscoveredEdges,
    {
        let edges = Arc::clone(
            self.edges
                .entry(unit)
                .or_insert_with(|| Arc::new(discover()))
                .value(),
        );

        if resolver.generation() != edges.valid_at {
            let changed = resolver.changed_since(edges.valid_at);
            if changed.iter().any(|k| edges.keys.contains(k)) {
                self.edges.remove(&unit);
            }
        }
        edges
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            fingerprints: self.fingerprints.len(),
            edges: self.edges.len(),
            synced_generation: self.synced.load(Ordering::Acquire),
            computations: self.computations.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        self.fingerprints.clear();
        self.edges.clear();
    }
}
