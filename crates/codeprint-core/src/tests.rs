//! Unit tests for codeprint-core

use crate::test_utils::*;
use crate::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn engine() -> Engine {
    Engine::new(EngineConfig::default())
}

// ── Environment ─────────────────────────────────────────────

#[test]
fn test_redefinition_allocates_new_identity() {
    let env = environment();
    let first = env.define("m", "helper", leaf(10));
    let second = env.define("m", "helper", leaf(12));

    assert_ne!(first, second);
    assert_eq!(env.lookup("m", "helper"), Some(second));
    // The superseded unit stays addressable.
    assert_eq!(env.unit(first).unwrap().form(), Some(&leaf(10)));
}

#[test]
fn test_generation_tracks_changed_keys() {
    let env = environment();
    assert_eq!(env.generation(), 0);

    env.define("m", "a", leaf(1));
    let after_a = env.generation();
    env.define("m", "b", leaf(2));

    assert!(env.generation() > after_a);
    assert_eq!(env.changed_since(after_a), vec![BindingKey::new("m", "b")]);
    assert_eq!(env.changed_since(env.generation()), vec![]);
}

#[test]
fn test_unbind_removes_binding() {
    let env = environment();
    let foo = env.define("m", "foo", calls(&["helper"], 0));
    env.define("m", "helper", leaf(1));
    env.unbind("m", "helper");

    assert_eq!(env.lookup("m", "helper"), None);
    assert_eq!(
        env.resolve(foo, "helper"),
        Resolution::Unresolved(UnresolvedReason::Unbound)
    );
}

#[test]
fn test_resolve_follows_import_chain() {
    let env = environment();
    let f = env.define("b", "f", leaf(1));
    env.bind_import("a", "f", BindingKey::new("b", "f"));
    env.bind_import("c", "g", BindingKey::new("a", "f"));
    let user = env.define("c", "user", calls(&["g"], 0));

    let mut trace = Vec::new();
    assert_eq!(env.resolve_traced(user, "g", &mut trace), Resolution::Unit(f));
    assert_eq!(
        trace,
        vec![
            BindingKey::new("c", "g"),
            BindingKey::scope("a"),
            BindingKey::new("a", "f"),
            BindingKey::scope("b"),
            BindingKey::new("b", "f"),
        ]
    );
}

#[test]
fn test_import_cycle_is_unresolved() {
    let env = environment();
    env.bind_import("a", "g", BindingKey::new("b", "g"));
    env.bind_import("b", "g", BindingKey::new("a", "g"));
    let user = env.define("a", "user", calls(&["g"], 0));

    assert_eq!(
        env.resolve(user, "g"),
        Resolution::Unresolved(UnresolvedReason::ImportCycle)
    );
}

#[test]
fn test_import_from_unloaded_scope_is_opaque() {
    let env = environment();
    env.bind_import("m", "array", BindingKey::new("numpy", "array"));
    let foo = env.define("m", "foo", calls(&["array"], 0));

    let mut trace = Vec::new();
    assert_eq!(
        env.resolve_traced(foo, "array", &mut trace),
        Resolution::Opaque("numpy.array".into())
    );
    assert!(trace.contains(&BindingKey::new("numpy", "array")));
}

#[test]
fn test_builtins_only_visible_from_own_scope() {
    let env = environment();
    let foo = env.define("a", "foo", calls(&["len", "size"], 0));
    env.declare_scope("b");
    env.bind_import("a", "size", BindingKey::new("b", "len"));

    assert_eq!(env.resolve(foo, "len"), Resolution::Opaque("builtins.len".into()));
    assert_eq!(
        env.resolve(foo, "size"),
        Resolution::Unresolved(UnresolvedReason::Unbound)
    );
}

#[test]
fn test_module_definition_shadows_primitive() {
    let env = environment();
    let foo = env.define("m", "foo", calls(&["len"], 0));
    assert!(env.is_primitive(foo, "len"));

    env.define("m", "len", leaf(3));
    assert!(!env.is_primitive(foo, "len"));
    assert!(!env.is_primitive(foo, "helper"));
}

#[test]
fn test_current_units_sorted_by_label() {
    let env = environment();
    env.define("b", "z", leaf(1));
    env.define("a", "y", leaf(2));
    env.define("a", "x", leaf(3));
    env.define("a", "x", leaf(4));
    env.bind_opaque("a", "Klass", "a.Klass");

    let labels: Vec<String> = env.current_units().iter().map(|u| u.label()).collect();
    assert_eq!(labels, vec!["a.x", "a.y", "b.z"]);
    assert_eq!(env.find_by_name("x").len(), 1);
}

// ── Graph ───────────────────────────────────────────────────

#[test]
fn test_graph_records_leaves() {
    let env = environment();
    env.bind_import("m", "array", BindingKey::new("numpy", "array"));
    env.define("m", "helper", leaf(1));
    let foo = env.define("m", "foo", calls(&["helper", "array", "missing", "len"], 0));

    let graph = DependencyGraph::build(foo, &env, ReferenceMode::Calls, None).unwrap();

    // foo, helper, opaque numpy.array, unresolved; len is a primitive.
    assert_eq!(graph.node_count(), 4);
    assert_eq!(graph.edge_count(), 3);
    let mut names: Vec<&str> = graph.edges_from(graph.root()).map(|(n, _)| n).collect();
    names.sort();
    assert_eq!(names, vec!["array", "helper", "missing"]);
}

#[test]
fn test_graph_shares_unresolved_leaf() {
    let env = environment();
    let foo = env.define("m", "foo", calls(&["missing_a", "missing_b"], 0));

    let graph = DependencyGraph::build(foo, &env, ReferenceMode::Calls, None).unwrap();
    assert_eq!(graph.node_count(), 2);
    assert_eq!(graph.edge_count(), 2);
}

#[test]
fn test_graph_sccs_dependencies_first() {
    let env = environment();
    let c = env.define("m", "c", leaf(1));
    env.define("m", "b", calls(&["c"], 0));
    let a = env.define("m", "a", calls(&["b"], 0));

    let graph = DependencyGraph::build(a, &env, ReferenceMode::Calls, None).unwrap();
    let order: Vec<_> = graph.sccs().into_iter().flatten().collect();
    let pos = |id| order.iter().position(|&n| Some(n) == graph.node_of(id)).unwrap();
    assert!(pos(c) < pos(a));
}

#[test]
fn test_graph_self_loop() {
    let env = environment();
    let fact = env.define("m", "fact", calls(&["fact"], 1));

    let graph = DependencyGraph::build(fact, &env, ReferenceMode::Calls, None).unwrap();
    assert_eq!(graph.node_count(), 1);
    assert!(graph.has_self_loop(graph.root()));
}

#[test]
fn test_graph_unknown_root() {
    let env = environment();
    let err = DependencyGraph::build(UnitId(42), &env, ReferenceMode::Calls, None).unwrap_err();
    assert!(matches!(err, Error::UnknownUnit(UnitId(42))));
}

// ── Fingerprints ────────────────────────────────────────────

#[test]
fn test_fingerprint_is_deterministic() {
    let env = environment();
    env.define("m", "helper", leaf(10));
    let foo = env.define("m", "foo", calls(&["helper"], 2));

    let first = engine().fingerprint(&env, foo).unwrap();
    let second = engine().fingerprint(&env, foo).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_fingerprint_stable_across_environments() {
    let env_a = environment();
    env_a.define("m", "helper", leaf(10));
    let foo_a = env_a.define("m", "foo", calls(&["helper"], 2));

    // Different definition order, so different identities.
    let env_b = environment();
    env_b.define("m", "unrelated", leaf(0));
    let foo_b = env_b.define("m", "foo", calls(&["helper"], 2));
    env_b.define("m", "helper", leaf(10));

    assert_ne!(foo_a, foo_b);
    assert_eq!(
        engine().fingerprint(&env_a, foo_a).unwrap(),
        engine().fingerprint(&env_b, foo_b).unwrap()
    );
}

#[test]
fn test_dependency_redefinition_changes_fingerprint() {
    let env = environment();
    let engine = engine();
    env.define("m", "helper", leaf(10));
    let foo = env.define("m", "foo", calls(&["helper"], 2));
    let d1 = engine.fingerprint(&env, foo).unwrap();

    env.define("m", "helper", leaf(12));
    let d2 = engine.fingerprint(&env, foo).unwrap();
    assert_ne!(d1, d2);

    env.define("m", "helper", leaf(10));
    assert_eq!(engine.fingerprint(&env, foo).unwrap(), d1);
}

#[test]
fn test_transitive_redefinition_invalidates_cache() {
    let env = environment();
    let engine = engine();
    env.define("m", "c", leaf(1));
    env.define("m", "b", calls(&["c"], 0));
    let a = env.define("m", "a", calls(&["b"], 0));
    let before = engine.fingerprint(&env, a).unwrap();

    env.define("m", "c", leaf(2));
    let after = engine.fingerprint(&env, a).unwrap();
    assert_ne!(before, after);
    assert_eq!(after, self::engine().fingerprint(&env, a).unwrap());
}

#[test]
fn test_identical_bodies_in_different_scopes() {
    let env = environment();
    let x = env.define("one", "f", leaf(7));
    let y = env.define("two", "g", leaf(7));
    assert_eq!(
        engine().fingerprint(&env, x).unwrap(),
        engine().fingerprint(&env, y).unwrap()
    );
}

#[test]
fn test_body_change_changes_fingerprint() {
    let env = environment();
    let x = env.define("m", "f", leaf(7));
    let y = env.define("m", "g", leaf(8));
    assert_ne!(
        engine().fingerprint(&env, x).unwrap(),
        engine().fingerprint(&env, y).unwrap()
    );
}

#[test]
fn test_unresolved_and_ambiguous_are_distinct() {
    let unbound_env = environment();
    let foo_unbound = unbound_env.define("m", "foo", calls(&["x"], 0));

    let ambiguous_env = environment();
    ambiguous_env.bind_ambiguous("m", "x");
    let foo_ambiguous = ambiguous_env.define("m", "foo", calls(&["x"], 0));

    let opaque_env = environment();
    opaque_env.bind_opaque("m", "x", "m.x");
    let foo_opaque = opaque_env.define("m", "foo", calls(&["x"], 0));

    let a = engine().fingerprint(&unbound_env, foo_unbound).unwrap();
    let b = engine().fingerprint(&ambiguous_env, foo_ambiguous).unwrap();
    let c = engine().fingerprint(&opaque_env, foo_opaque).unwrap();
    assert_ne!(a, b);
    assert_ne!(a, c);
    assert_ne!(b, c);
}

#[test]
fn test_unresolved_reference_still_counts() {
    let env = environment();
    let with_missing = env.define("m", "f", calls(&["missing"], 0));
    let without = env.define("m", "g", leaf(0));
    assert_ne!(
        engine().fingerprint(&env, with_missing).unwrap(),
        engine().fingerprint(&env, without).unwrap()
    );
}

#[test]
fn test_binding_missing_name_invalidates() {
    let env = environment();
    let engine = engine();
    let foo = env.define("m", "foo", calls(&["later"], 0));
    let before = engine.fingerprint(&env, foo).unwrap();

    env.define("m", "later", leaf(1));
    assert_ne!(engine.fingerprint(&env, foo).unwrap(), before);
}

#[test]
fn test_loading_imported_scope_invalidates() {
    let env = environment();
    let engine = engine();
    env.bind_import("m", "array", BindingKey::new("numpy", "array"));
    let foo = env.define("m", "foo", calls(&["array"], 0));
    let opaque = engine.fingerprint(&env, foo).unwrap();

    env.define("numpy", "array", leaf(5));
    assert_ne!(engine.fingerprint(&env, foo).unwrap(), opaque);
}

#[test]
fn test_loading_scope_without_imported_name_invalidates() {
    let env = environment();
    let engine = engine();
    env.bind_import("m", "g", BindingKey::new("b", "g"));
    let foo = env.define("m", "foo", calls(&["g"], 0));
    let opaque = engine.fingerprint(&env, foo).unwrap();

    // `b` gets loaded but never binds `g`: the import is now unbound.
    env.declare_scope("b");
    env.define("b", "h", leaf(1));
    assert_eq!(
        env.resolve(foo, "g"),
        Resolution::Unresolved(UnresolvedReason::Unbound)
    );

    let warm = engine.fingerprint(&env, foo).unwrap();
    assert_ne!(warm, opaque);
    assert_eq!(warm, self::engine().fingerprint(&env, foo).unwrap());
}

#[test]
fn test_declaring_scope_publishes_once() {
    let env = environment();
    env.declare_scope("b");
    let after = env.generation();
    assert_eq!(env.changed_since(0), vec![BindingKey::scope("b")]);

    env.declare_scope("b");
    env.define("b", "h", leaf(1));
    assert_eq!(env.changed_since(after), vec![BindingKey::new("b", "h")]);
}

#[test]
fn test_shadowing_primitive_changes_fingerprint() {
    let env = environment();
    let engine = engine();
    let foo = env.define("m", "foo", calls(&["len"], 0));
    let before = engine.fingerprint(&env, foo).unwrap();

    env.define("m", "len", leaf(3));
    assert_ne!(engine.fingerprint(&env, foo).unwrap(), before);
}

#[test]
fn test_value_references_follow_config() {
    let env = environment();
    env.define("m", "helper", leaf(1));
    let foo = env.define("m", "foo", passes(&["helper"]));

    let calls_only = engine();
    let values = Engine::new(EngineConfig {
        follow_value_references: true,
        ..Default::default()
    });
    let calls_before = calls_only.fingerprint(&env, foo).unwrap();
    let values_before = values.fingerprint(&env, foo).unwrap();

    env.define("m", "helper", leaf(2));
    assert_eq!(calls_only.fingerprint(&env, foo).unwrap(), calls_before);
    assert_ne!(values.fingerprint(&env, foo).unwrap(), values_before);
}

// ── Cycles ──────────────────────────────────────────────────

#[test]
fn test_mutual_recursion_shares_fingerprint() {
    let env = environment();
    let (even, odd) = define_even_odd(&env, "m");

    let fp_even = engine().fingerprint(&env, even).unwrap();
    let fp_odd = engine().fingerprint(&env, odd).unwrap();
    assert_eq!(fp_even, fp_odd);
}

#[test]
fn test_cycle_independent_of_entry_point() {
    let env_a = environment();
    let (even_a, _) = define_even_odd(&env_a, "m");

    let env_b = environment();
    let odd_b = env_b.define("m", "odd", calls(&["even"], 2));
    env_b.define("m", "even", calls(&["odd"], 1));

    // Entered from different members with different identity order.
    assert_eq!(
        engine().fingerprint(&env_a, even_a).unwrap(),
        engine().fingerprint(&env_b, odd_b).unwrap()
    );
}

#[test]
fn test_cycle_member_change_changes_all() {
    let env = environment();
    let engine = engine();
    let (even, odd) = define_even_odd(&env, "m");
    let caller = env.define("m", "main", calls(&["even"], 0));

    let before_even = engine.fingerprint(&env, even).unwrap();
    let before_caller = engine.fingerprint(&env, caller).unwrap();

    env.define("m", "odd", calls(&["even"], 3));
    assert_ne!(engine.fingerprint(&env, even).unwrap(), before_even);
    assert_ne!(engine.fingerprint(&env, caller).unwrap(), before_caller);
    // The superseded odd keeps its old identity and is no longer in the cycle.
    assert_ne!(env.lookup("m", "odd"), Some(odd));
}

#[test]
fn test_cycle_external_dependency_counts() {
    let env = environment();
    let engine = engine();
    env.define("m", "helper", leaf(1));
    let even = env.define("m", "even", calls(&["odd", "helper"], 1));
    env.define("m", "odd", calls(&["even"], 2));
    let before = engine.fingerprint(&env, even).unwrap();

    env.define("m", "helper", leaf(2));
    assert_ne!(engine.fingerprint(&env, even).unwrap(), before);
}

#[test]
fn test_self_recursion_terminates() {
    let env = environment();
    let fact = env.define("m", "fact", calls(&["fact"], 1));
    let plain = env.define("m", "plain", calls(&[], 1));

    let recursive = engine().fingerprint(&env, fact).unwrap();
    assert_ne!(recursive, engine().fingerprint(&env, plain).unwrap());

    let report = engine().fingerprint_verbose(&env, fact).unwrap();
    assert_eq!(report.cycle, vec!["m.fact"]);
}

#[test]
fn test_cached_members_match_cold_computation() {
    let env = environment();
    let (even, _) = define_even_odd(&env, "m");
    env.define("m", "helper", leaf(4));
    let main = env.define("m", "main", calls(&["even", "helper"], 0));

    let warm = engine();
    warm.fingerprint(&env, even).unwrap();
    let warm_main = warm.fingerprint(&env, main).unwrap();

    assert_eq!(warm_main, engine().fingerprint(&env, main).unwrap());
}

#[test]
fn test_verbose_on_cached_cycle_member() {
    let env = environment();
    let (even, odd) = define_even_odd(&env, "m");

    let engine = engine();
    let shared = engine.fingerprint(&env, odd).unwrap();
    let report = engine.fingerprint_verbose(&env, even).unwrap();
    assert_eq!(report.fingerprint, shared);
    assert_eq!(report.cycle, vec!["m.even", "m.odd"]);
}

// ── Failures ────────────────────────────────────────────────

#[test]
fn test_unavailable_body_is_opaque_leaf() {
    let env = environment();
    env.define_unavailable("m", "broken", "syntax error at line 3");
    let foo = env.define("m", "foo", calls(&["broken"], 0));

    let report = engine().fingerprint_verbose(&env, foo).unwrap();
    assert_eq!(
        report.failures,
        vec![("m.broken".to_string(), "syntax error at line 3".to_string())]
    );

    let working = environment();
    working.define("m", "broken", leaf(0));
    let foo_working = working.define("m", "foo", calls(&["broken"], 0));
    assert_ne!(report.fingerprint, engine().fingerprint(&working, foo_working).unwrap());
}

#[test]
fn test_strict_mode_rejects_unavailable() {
    let env = environment();
    env.define_unavailable("m", "broken", "unsupported syntax");
    let foo = env.define("m", "foo", calls(&["broken"], 0));

    let strict = Engine::new(EngineConfig {
        strict: true,
        ..Default::default()
    });
    let err = strict.fingerprint(&env, foo).unwrap_err();
    assert!(matches!(err, Error::Canonicalization { ref unit, .. } if unit == "m.broken"));
}

#[test]
fn test_unknown_unit() {
    let env = environment();
    assert!(matches!(
        engine().fingerprint(&env, UnitId(7)),
        Err(Error::UnknownUnit(UnitId(7)))
    ));
}

/// Rebinds `helper` the first time it is resolved, mid-discovery.
struct RebindDuringDiscovery<'a> {
    env: &'a Environment,
    armed: AtomicBool,
}

impl UnitSource for RebindDuringDiscovery<'_> {
    fn unit(&self, id: UnitId) -> Option<Arc<CodeUnit>> {
        self.env.unit(id)
    }
}

impl Resolver for RebindDuringDiscovery<'_> {
    fn resolve_traced(&self, unit: UnitId, name: &str, trace: &mut Vec<BindingKey>) -> Resolution {
        let resolution = self.env.resolve_traced(unit, name, trace);
        if name == "helper" && self.armed.swap(false, Ordering::SeqCst) {
            self.env.define("m", "helper", leaf(99));
        }
        resolution
    }

    fn is_primitive(&self, unit: UnitId, name: &str) -> bool {
        self.env.is_primitive(unit, name)
    }

    fn generation(&self) -> u64 {
        self.env.generation()
    }

    fn changed_since(&self, generation: u64) -> Vec<BindingKey> {
        self.env.changed_since(generation)
    }
}

#[test]
fn test_stale_graph_detected() {
    let env = environment();
    env.define("m", "helper", leaf(1));
    let foo = env.define("m", "foo", calls(&["helper"], 0));
    let racing = RebindDuringDiscovery {
        env: &env,
        armed: AtomicBool::new(true),
    };

    let engine = engine();
    let err = engine.fingerprint(&racing, foo).unwrap_err();
    assert!(matches!(err, Error::StaleGraph { ref name, .. } if name == "helper"));
    assert_eq!(engine.cache().stats().fingerprints, 0);

    // A retry sees the new binding.
    let retried = engine.fingerprint(&racing, foo).unwrap();
    assert_eq!(retried, self::engine().fingerprint(&env, foo).unwrap());
}

/// Stalls the first resolution so concurrent requests overlap.
struct SlowFirstResolve<'a> {
    env: &'a Environment,
    armed: AtomicBool,
}

impl UnitSource for SlowFirstResolve<'_> {
    fn unit(&self, id: UnitId) -> Option<Arc<CodeUnit>> {
        self.env.unit(id)
    }
}

impl Resolver for SlowFirstResolve<'_> {
    fn resolve_traced(&self, unit: UnitId, name: &str, trace: &mut Vec<BindingKey>) -> Resolution {
        if self.armed.swap(false, Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(50));
        }
        self.env.resolve_traced(unit, name, trace)
    }

    fn is_primitive(&self, unit: UnitId, name: &str) -> bool {
        self.env.is_primitive(unit, name)
    }

    fn generation(&self) -> u64 {
        self.env.generation()
    }

    fn changed_since(&self, generation: u64) -> Vec<BindingKey> {
        self.env.changed_since(generation)
    }
}

#[test]
fn test_concurrent_requests_compute_root_once() {
    let env = environment();
    define_even_odd(&env, "m");
    let root = env.define("m", "root", calls(&["even", "odd"], 0));
    let slow = SlowFirstResolve {
        env: &env,
        armed: AtomicBool::new(true),
    };
    let engine = engine();

    let results: Vec<Fingerprint> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| engine.fingerprint(&slow, root).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(results.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(engine.cache().stats().computations, 1);
    assert_eq!(results[0], self::engine().fingerprint(&env, root).unwrap());
}

#[test]
fn test_failed_computation_releases_claim() {
    let env = environment();
    env.define("m", "helper", leaf(1));
    let foo = env.define("m", "foo", calls(&["helper"], 0));
    let racing = RebindDuringDiscovery {
        env: &env,
        armed: AtomicBool::new(true),
    };

    let engine = engine();
    assert!(engine.fingerprint(&racing, foo).is_err());
    assert!(matches!(engine.cache().claim(foo), Claim::Compute(_)));
    assert_eq!(engine.cache().stats().computations, 2);
}

// ── Engine surface ──────────────────────────────────────────

#[test]
fn test_fingerprint_verbose_lists_dependencies() {
    let env = environment();
    let helper = env.define("m", "helper", leaf(10));
    env.bind_import("m", "array", BindingKey::new("numpy", "array"));
    let foo = env.define("m", "foo", calls(&["missing", "helper", "array"], 2));

    let engine = engine();
    let report = engine.fingerprint_verbose(&env, foo).unwrap();
    assert_eq!(report.label, "m.foo");
    assert_eq!(report.fingerprint, engine.fingerprint(&env, foo).unwrap());
    assert!(report.cycle.is_empty());

    let names: Vec<&str> = report.dependencies.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["array", "helper", "missing"]);
    assert_eq!(
        report.dependencies[0].target,
        DependencyTarget::Opaque {
            label: "numpy.array".into()
        }
    );
    assert_eq!(report.dependencies[0].fingerprint, Fingerprint::opaque());
    assert_eq!(
        report.dependencies[1].target,
        DependencyTarget::Unit {
            id: helper,
            label: "m.helper".into()
        }
    );
    assert_eq!(
        report.dependencies[1].fingerprint,
        engine.fingerprint(&env, helper).unwrap()
    );
    assert_eq!(
        report.dependencies[2].fingerprint,
        Fingerprint::unresolved(UnresolvedReason::Unbound)
    );

    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"kind\":\"opaque\""));
}

#[test]
fn test_fingerprint_all() {
    let env = environment();
    let a = env.define("m", "a", leaf(1));
    let b = env.define("m", "b", calls(&["a"], 2));

    let engine = engine();
    let all = engine.fingerprint_all(&env, &[b, a]).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0], (b, engine.fingerprint(&env, b).unwrap()));
    assert_eq!(all[1], (a, engine.fingerprint(&env, a).unwrap()));
}

#[test]
fn test_cache_stats_and_eviction() {
    let env = environment();
    env.define("m", "helper", leaf(1));
    env.define("m", "other", leaf(2));
    let foo = env.define("m", "foo", calls(&["helper"], 0));
    let other = env.lookup("m", "other").unwrap();

    let engine = engine();
    engine.fingerprint(&env, foo).unwrap();
    engine.fingerprint(&env, other).unwrap();
    assert_eq!(engine.cache().stats().fingerprints, 3);

    env.define("m", "helper", leaf(5));
    engine.cache().sync(&env);
    // foo and the old helper are evicted; other is untouched.
    assert_eq!(engine.cache().fingerprint(foo), None);
    assert!(engine.cache().fingerprint(other).is_some());
}

#[test]
fn test_parallel_matches_sequential() {
    let env = environment();
    for i in 0..8 {
        env.define("m", &format!("leaf{}", i), leaf(i));
    }
    let names: Vec<String> = (0..8).map(|i| format!("leaf{}", i)).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    env.define("m", "mid_a", calls(&refs[..4], 0));
    env.define("m", "mid_b", calls(&refs[4..], 0));
    define_even_odd(&env, "m");
    let root = env.define("m", "root", calls(&["mid_a", "mid_b", "even"], 0));

    let parallel = Engine::new(EngineConfig {
        parallel: true,
        ..Default::default()
    });
    assert_eq!(
        parallel.fingerprint(&env, root).unwrap(),
        engine().fingerprint(&env, root).unwrap()
    );
}

#[test]
fn test_shared_cache_across_threads() {
    let env = Arc::new(environment());
    define_even_odd(&env, "m");
    let root = env.define("m", "root", calls(&["even", "odd"], 0));
    let engine = Arc::new(engine());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let env = Arc::clone(&env);
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.fingerprint(env.as_ref(), root).unwrap())
        })
        .collect();
    let results: Vec<Fingerprint> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(results.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(results[0], self::engine().fingerprint(env.as_ref(), root).unwrap());
}
