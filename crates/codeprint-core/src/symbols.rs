//! Versioned symbol environment: the name-resolution collaborator
//!
//! Each binding change bumps a generation counter and records the generation
//! at which the `(scope, name)` key last changed, so callers can tell exactly
//! which bindings moved since they last looked.

use crate::model::{BindingKey, CanonicalForm, CodeUnit, Resolution, UnitBody, UnitId, UnresolvedReason};
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Supplies canonical forms for unit identities.
pub trait UnitSource: Send + Sync {
    fn unit(&self, id: UnitId) -> Option<Arc<CodeUnit>>;
}

/// Resolves names in a unit's lexical environment.
pub trait Resolver: Send + Sync {
    /// Resolve `name` as seen from `unit`, appending every binding key
    /// consulted along the way to `trace`.
    fn resolve_traced(&self, unit: UnitId, name: &str, trace: &mut Vec<BindingKey>) -> Resolution;

    fn resolve(&self, unit: UnitId, name: &str) -> Resolution {
        let mut trace = Vec::new();
        self.resolve_traced(unit, name, &mut trace)
    }

    /// Whether `name` denotes an opaque primitive from `unit`'s scope.
    fn is_primitive(&self, unit: UnitId, name: &str) -> bool;

    /// Current binding generation.
    fn generation(&self) -> u64;

    /// Keys whose binding changed after `generation`.
    fn changed_since(&self, generation: u64) -> Vec<BindingKey>;
}

/// What a name is bound to within one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Unit(UnitId),
    Opaque(String),
    /// Alias of a binding in another scope (`from m import f`).
    Import(BindingKey),
    /// Bound differently depending on control flow.
    Ambiguous,
}

/// Thread-safe environment of scopes, bindings and code units.
pub struct Environment {
    units: DashMap<UnitId, Arc<CodeUnit>>,
    bindings: DashMap<BindingKey, Binding>,
    /// Generation at which each key was last rebound.
    changed_at: DashMap<BindingKey, u64>,
    /// Scopes that have been loaded; imports into other scopes are opaque.
    scopes: DashSet<String>,
    builtins: DashSet<String>,
    next_id: AtomicU64,
    generation: AtomicU64,
    /// Serializes writers so `generation` is only published after `changed_at`.
    write_lock: Mutex<()>,
}

impl Environment {
    pub fn new() -> Self {
        Environment {
            units: DashMap::new(),
            bindings: DashMap::new(),
            changed_at: DashMap::new(),
            scopes: DashSet::new(),
            builtins: DashSet::new(),
            next_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_builtins<I, S>(builtins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let env = Self::new();
        env.add_builtins(builtins);
        env
    }

    pub fn add_builtins<I, S>(&self, builtins: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in builtins {
            self.builtins.insert(name.into());
        }
    }

    /// Mark a scope as loaded without binding anything in it.
    pub fn declare_scope(&self, scope: &str) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.insert_scope(scope);
    }

    /// Caller holds `write_lock`. Loading a scope changes how imports from
    /// it resolve, so a newly seen scope is published like a rebinding.
    fn insert_scope(&self, scope: &str) {
        if self.scopes.insert(scope.to_string()) {
            self.publish_change(BindingKey::scope(scope));
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// Define (or redefine) `scope.name` with a canonical body.
    ///
    /// Always allocates a fresh identity; a previous unit under the same name
    /// is superseded, not mutated.
    pub fn define(&self, scope: &str, name: &str, form: CanonicalForm) -> UnitId {
        self.insert_unit(scope, name, UnitBody::Canonical(form))
    }

    /// Define a unit whose implementation could not be canonicalized.
    pub fn define_unavailable(&self, scope: &str, name: &str, reason: impl Into<String>) -> UnitId {
        self.insert_unit(
            scope,
            name,
            UnitBody::Unavailable {
                reason: reason.into(),
            },
        )
    }

    fn insert_unit(&self, scope: &str, name: &str, body: UnitBody) -> UnitId {
        let id = UnitId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let unit = CodeUnit {
            id,
            scope: scope.to_string(),
            name: name.to_string(),
            body,
        };
        self.units.insert(id, Arc::new(unit));
        self.rebind(BindingKey::new(scope, name), Binding::Unit(id));
        tracing::debug!("Defined {}.{} as {}", scope, name, id);
        id
    }

    pub fn bind_opaque(&self, scope: &str, name: &str, label: impl Into<String>) {
        self.rebind(BindingKey::new(scope, name), Binding::Opaque(label.into()));
    }

    pub fn bind_import(&self, scope: &str, name: &str, target: BindingKey) {
        self.rebind(BindingKey::new(scope, name), Binding::Import(target));
    }

    pub fn bind_ambiguous(&self, scope: &str, name: &str) {
        self.rebind(BindingKey::new(scope, name), Binding::Ambiguous);
    }

    /// Remove a binding. Units it pointed to stay addressable by identity.
    pub fn unbind(&self, scope: &str, name: &str) {
        let key = BindingKey::new(scope, name);
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.bindings.remove(&key).is_some() {
            self.publish_change(key);
        }
    }

    fn rebind(&self, key: BindingKey, binding: Binding) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.insert_scope(&key.scope);
        self.bindings.insert(key.clone(), binding);
        self.publish_change(key);
    }

    /// Caller holds `write_lock`.
    fn publish_change(&self, key: BindingKey) {
        let generation = self.generation.load(Ordering::Acquire) + 1;
        self.changed_at.insert(key, generation);
        self.generation.store(generation, Ordering::Release);
    }

    pub fn binding(&self, scope: &str, name: &str) -> Option<Binding> {
        self.bindings
            .get(&BindingKey::new(scope, name))
            .map(|r| r.value().clone())
    }

    /// Every name bound in `scope`, sorted.
    pub fn scope_names(&self, scope: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .bindings
            .iter()
            .filter(|entry| entry.key().scope == scope)
            .map(|entry| entry.key().name.clone())
            .collect();
        names.sort();
        names
    }

    /// The unit currently bound to `scope.name`, if any.
    pub fn lookup(&self, scope: &str, name: &str) -> Option<UnitId> {
        match self.binding(scope, name)? {
            Binding::Unit(id) => Some(id),
            _ => None,
        }
    }

    /// All units currently bound to a name, sorted by label.
    pub fn current_units(&self) -> Vec<Arc<CodeUnit>> {
        let mut units: Vec<_> = self
            .bindings
            .iter()
            .filter_map(|entry| match entry.value() {
                Binding::Unit(id) => self.units.get(id).map(|u| Arc::clone(u.value())),
                _ => None,
            })
            .collect();
        units.sort_by_key(|u| u.label());
        units
    }

    /// Units named `name` in any scope.
    pub fn find_by_name(&self, name: &str) -> Vec<Arc<CodeUnit>> {
        self.current_units()
            .into_iter()
            .filter(|u| u.name == name)
            .collect()
    }

    fn resolve_key(&self, start: BindingKey, trace: &mut Vec<BindingKey>) -> Resolution {
        let mut seen = HashSet::new();
        let home = start.scope.clone();
        let mut current = start;

        loop {
            trace.push(current.clone());
            if !seen.insert(current.clone()) {
                return Resolution::Unresolved(UnresolvedReason::ImportCycle);
            }

            let binding = self.bindings.get(&current).map(|r| r.value().clone());
            match binding {
                Some(Binding::Unit(id)) => return Resolution::Unit(id),
                Some(Binding::Opaque(label)) => return Resolution::Opaque(label),
                Some(Binding::Ambiguous) => {
                    return Resolution::Unresolved(UnresolvedReason::Ambiguous)
                }
                Some(Binding::Import(target)) => {
                    trace.push(BindingKey::scope(target.scope.clone()));
                    if !self.scopes.contains(&target.scope) {
                        let label = target.to_string();
                        trace.push(target);
                        return Resolution::Opaque(label);
                    }
                    current = target;
                }
                None => {
                    // Builtins are only visible from the referencing scope itself.
                    if current.scope == home && self.builtins.contains(&current.name) {
                        return Resolution::Opaque(format!("builtins.{}", current.name));
                    }
                    return Resolution::Unresolved(UnresolvedReason::Unbound);
                }
            }
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitSource for Environment {
    fn unit(&self, id: UnitId) -> Option<Arc<CodeUnit>> {
        self.units.get(&id).map(|r| Arc::clone(r.value()))
    }
}

impl Resolver for Environment {
    fn resolve_traced(&self, unit: UnitId, name: &str, trace: &mut Vec<BindingKey>) -> Resolution {
        let Some(scope) = self.units.get(&unit).map(|u| u.scope.clone()) else {
            return Resolution::Unresolved(UnresolvedReason::Unbound);
        };
        self.resolve_key(BindingKey::new(scope, name), trace)
    }

    fn is_primitive(&self, unit: UnitId, name: &str) -> bool {
        let Some(scope) = self.units.get(&unit).map(|u| u.scope.clone()) else {
            return false;
        };
        // A module-level definition shadows the builtin.
        !self.bindings.contains_key(&BindingKey::new(scope, name)) && self.builtins.contains(name)
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn changed_since(&self, generation: u64) -> Vec<BindingKey> {
        self.changed_at
            .iter()
            .filter(|entry| *entry.value() > generation)
            .map(|entry| entry.key().clone())
            .collect()
    }
}
