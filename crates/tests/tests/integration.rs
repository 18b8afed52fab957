//! End-to-end kernel tests.
//!
//! These tests wire small graphs through the public API and verify the
//! scheduling discipline: priority order, barrier de-duplication, scope
//! isolation, and reentrancy.

use std::cell::Cell;
use std::rc::Rc;

use ripple_kernel::{
    BeforeCmd, LaunchConfig, MovSource, MovTarget, Node, NodeMeta, Page, Priority, RefId, Scope,
    ScopeValues, SerializePolicy, StateRef, Step, StepFn, launch, launch_config, launch_deferred,
    read_ref, set_inspector,
};
use ripple_tests::{Recorder, compute_node};
use serde_json::json;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn identity_step() -> Step {
    Step::compute(StepFn::safe(|args| args.value.clone()))
}

/// A value launched into a two-node chain arrives transformed by both.
#[test]
fn test_straight_line_propagation() {
    init_tracing();
    let recorder = Recorder::new();
    let double = Node::builder()
        .step(Step::compute(StepFn::safe(|args| {
            json!(args.value.as_i64().unwrap_or(0) * 2)
        })))
        .next(&recorder.node())
        .build()
        .unwrap();
    let increment = Node::builder()
        .step(Step::compute(StepFn::safe(|args| {
            json!(args.value.as_i64().unwrap_or(0) + 1)
        })))
        .next(&double)
        .build()
        .unwrap();

    launch(&increment, json!(3));
    assert_eq!(recorder.values(), vec![json!(8)]);
}

/// A falsy filter result stops the node; successors are never scheduled.
#[test]
fn test_filter_skips_successors() {
    let recorder = Recorder::new();
    let gate = Node::builder()
        .step(Step::filter(StepFn::safe(|args| {
            json!(args.value.as_i64().unwrap_or(0) > 0)
        })))
        .step(Step::compute(StepFn::safe(|args| {
            json!(args.value.as_i64().unwrap_or(0) + 1)
        })))
        .next(&recorder.node())
        .build()
        .unwrap();

    launch(&gate, json!(-1));
    assert!(recorder.is_empty());

    launch(&gate, json!(1));
    assert_eq!(recorder.values(), vec![json!(2)]);
}

/// Two arrivals at a barrier-ordered step collapse into one execution,
/// which observes the last value written to the shared store.
#[test]
fn test_barrier_collapses_concurrent_arrivals() {
    init_tracing();
    let sink = StateRef::new("barrier.sink", json!(0)).shared();
    let recorder = Recorder::new();

    let join = Node::builder()
        .step(Step::mov(MovSource::store(&sink), MovTarget::Stack).barrier(Priority::Barrier, 7))
        .next(&recorder.node())
        .build()
        .unwrap();
    let a = Node::builder()
        .step(Step::mov(MovSource::Stack, MovTarget::Store(sink.clone())))
        .next(&join)
        .build()
        .unwrap();
    let b = Node::builder()
        .step(Step::mov(MovSource::Stack, MovTarget::Store(sink.clone())))
        .next(&join)
        .build()
        .unwrap();

    launch_config(LaunchConfig::batch(vec![
        (a.clone(), json!(1)),
        (b, json!(2)),
    ]));

    // Exactly one execution, seeing the last write.
    assert_eq!(recorder.values(), vec![json!(2)]);

    // The barrier re-arms for the next launch.
    launch(&a, json!(5));
    assert_eq!(recorder.values(), vec![json!(2), json!(5)]);
}

/// Sampler-ordered steps fire in compile-assigned id order, not arrival
/// order.
#[test]
fn test_sampler_fires_in_id_order() {
    let recorder = Recorder::new();
    let x = Node::builder()
        .step(identity_step().barrier(Priority::Sampler, 10))
        .next(&recorder.node())
        .build()
        .unwrap();
    let y = Node::builder()
        .step(identity_step().barrier(Priority::Sampler, 3))
        .next(&recorder.node())
        .build()
        .unwrap();

    launch_config(LaunchConfig::batch(vec![(x, json!("x")), (y, json!("y"))]));
    assert_eq!(recorder.values(), vec![json!("y"), json!("x")]);
}

/// An effect-ordered step yields to all pending pure and child work.
#[test]
fn test_effect_priority_yields_to_pure_work() {
    let recorder = Recorder::new();
    let effectful = Node::builder()
        .step(identity_step().at(Priority::Effect))
        .next(&recorder.node())
        .build()
        .unwrap();
    let plain = Node::builder()
        .step(identity_step())
        .next(&recorder.node())
        .build()
        .unwrap();

    launch_config(LaunchConfig::batch(vec![
        (effectful, json!("effect")),
        (plain, json!("pure")),
    ]));
    assert_eq!(recorder.values(), vec![json!("pure"), json!("effect")]);
}

/// A scope-local read derives its value from the scope's universe; the
/// same read outside any scope sees the ref's own value.
#[test]
fn test_scope_isolates_derived_state() {
    let upstream = StateRef::new("iso.upstream", json!(0)).shared();
    let derived = StateRef::new("iso.derived", json!(0))
        .with_before(vec![BeforeCmd::Map {
            from: Some(upstream.clone()),
            map: None,
        }])
        .shared();

    let mut values = ScopeValues::default();
    values.id_map.insert(RefId::from("iso.upstream"), json!(5));
    let scope = Scope::with_values(values, false);

    let recorder = Recorder::new();
    let read = Node::builder()
        .step(Step::mov(MovSource::store(&derived), MovTarget::Stack))
        .next(&recorder.node())
        .build()
        .unwrap();

    launch_config(LaunchConfig::new(&read, json!(null)).with_scope(&scope));
    assert_eq!(recorder.values(), vec![json!(5)]);

    recorder.clear();
    launch(&read, json!(null));
    assert_eq!(recorder.values(), vec![json!(0)]);
}

/// Scope cells exist only after a launch touches them under the scope.
#[test]
fn test_scope_cells_materialize_lazily() {
    let upstream = StateRef::new("lazy.upstream", json!(1)).shared();
    let derived = StateRef::new("lazy.derived", json!(0))
        .with_before(vec![BeforeCmd::Map {
            from: Some(upstream),
            map: None,
        }])
        .shared();
    let scope = Scope::new();

    let unrelated = compute_node(|value| value.clone());
    launch_config(LaunchConfig::new(&unrelated, json!(1)).with_scope(&scope));
    assert!(scope.reg.borrow().is_empty());

    let read = Node::builder()
        .step(Step::mov(MovSource::store(&derived), MovTarget::Stack))
        .build()
        .unwrap();
    launch_config(LaunchConfig::new(&read, json!(null)).with_scope(&scope));
    assert!(scope.reg.borrow().contains_key(&RefId::from("lazy.derived")));
    assert!(scope.reg.borrow().contains_key(&RefId::from("lazy.upstream")));
}

/// A soft store read materializes the cell without running its
/// derivation commands; the upstream ref is never touched.
#[test]
fn test_soft_store_read_skips_derivation() {
    let upstream = StateRef::new("soft.upstream", json!(9)).shared();
    let derived = StateRef::new("soft.derived", json!(0))
        .with_before(vec![BeforeCmd::Map {
            from: Some(upstream),
            map: None,
        }])
        .shared();
    let scope = Scope::new();

    let recorder = Recorder::new();
    let soft = Node::builder()
        .step(Step::mov(MovSource::store_soft(&derived), MovTarget::Stack))
        .next(&recorder.node())
        .build()
        .unwrap();

    launch_config(LaunchConfig::new(&soft, json!(null)).with_scope(&scope));
    assert_eq!(recorder.values(), vec![json!(0)]);
    assert!(scope.reg.borrow().contains_key(&RefId::from("soft.derived")));
    assert!(!scope.reg.borrow().contains_key(&RefId::from("soft.upstream")));
}

/// Reads resolve through the page chain; writes land in the owning page
/// without touching the global cell.
#[test]
fn test_page_overlay_shadows_global_state() {
    let global = StateRef::new("page.cell", json!(1)).shared();
    let parent = Page::new("root", None);
    parent.install(StateRef::new("page.cell", json!(10)).shared());
    let child = Page::new("root_1", Some(parent.clone()));

    let recorder = Recorder::new();
    let read = Node::builder()
        .step(Step::mov(MovSource::store(&global), MovTarget::Stack))
        .next(&recorder.node())
        .build()
        .unwrap();
    launch_config(LaunchConfig::new(&read, json!(null)).with_page(&child));
    assert_eq!(recorder.values(), vec![json!(10)]);

    let write = Node::builder()
        .step(Step::mov(MovSource::Stack, MovTarget::Store(global.clone())))
        .build()
        .unwrap();
    launch_config(LaunchConfig::new(&write, json!(99)).with_page(&child));

    assert_eq!(read_ref(&global), json!(1));
    let owned = parent.reg.borrow().get(&RefId::from("page.cell")).cloned().unwrap();
    assert_eq!(read_ref(&owned), json!(99));
}

/// A deferred launch from inside a compute body folds into the running
/// drain: successors of the current node run first, then the deferred
/// unit at pure priority.
#[test]
fn test_deferred_launch_runs_after_successors() {
    let recorder = Recorder::new();
    let deferred = Node::builder()
        .step(identity_step())
        .next(&recorder.node())
        .build()
        .unwrap();
    let child = Node::builder()
        .step(identity_step())
        .next(&recorder.node())
        .build()
        .unwrap();
    let trigger = Node::builder()
        .step(Step::effect(StepFn::safe(move |_| {
            launch_deferred(&deferred, json!("deferred"));
            json!("trigger")
        })))
        .next(&child)
        .build()
        .unwrap();

    launch(&trigger, json!(null));
    assert_eq!(recorder.values(), vec![json!("trigger"), json!("deferred")]);
}

/// A deferred launch with no drain active still drains immediately.
#[test]
fn test_deferred_launch_at_root_drains() {
    let recorder = Recorder::new();
    let node = Node::builder()
        .step(identity_step())
        .next(&recorder.node())
        .build()
        .unwrap();

    launch_deferred(&node, json!("root"));
    assert_eq!(recorder.values(), vec![json!("root")]);
}

/// Extra successors installed on a scope fire only under that scope.
#[test]
fn test_additional_links_fire_within_scope() {
    let recorder = Recorder::new();
    let source = compute_node(|value| value.clone());
    let scope = Scope::new();
    scope.add_link(&source, recorder.node());

    launch_config(LaunchConfig::new(&source, json!(7)).with_scope(&scope));
    assert_eq!(recorder.values(), vec![json!(7)]);

    launch(&source, json!(8));
    assert_eq!(recorder.values(), vec![json!(7)]);
}

/// Nodes flagged for the effect counter seed the scope's counter node.
#[test]
fn test_fx_counter_hook_seeded() {
    let counter = Recorder::new();
    let mut scope = Scope::bare(ScopeValues::default(), false);
    scope.fx_count = Some(counter.node());
    let scope = scope.shared();

    let fx = Node::builder()
        .meta(NodeMeta {
            need_fx_counter: true,
            ..NodeMeta::default()
        })
        .step(identity_step())
        .build()
        .unwrap();

    launch_config(LaunchConfig::new(&fx, json!("done")).with_scope(&scope));
    assert_eq!(counter.values(), vec![json!("done")]);

    // Without the flag the counter stays silent.
    let plain = Node::builder().step(identity_step()).build().unwrap();
    launch_config(LaunchConfig::new(&plain, json!("quiet")).with_scope(&scope));
    assert_eq!(counter.len(), 1);
}

/// Store-change hooks follow the same seeding rule as the effect counter.
#[test]
fn test_store_change_hook_seeded() {
    let hook = Recorder::new();
    let mut scope = Scope::bare(ScopeValues::default(), false);
    scope.store_change = Some(hook.node());
    let scope = scope.shared();

    let store_node = Node::builder()
        .meta(NodeMeta {
            store_change: true,
            ..NodeMeta::default()
        })
        .step(identity_step())
        .build()
        .unwrap();

    launch_config(LaunchConfig::new(&store_node, json!(3)).with_scope(&scope));
    assert_eq!(hook.values(), vec![json!(3)]);
}

/// A scope restored from a serialized snapshot parses sid-keyed values
/// through the cell's codec.
#[test]
fn test_serialized_scope_restores_through_codec() {
    let store = StateRef::new("ser.cell", json!(""))
        .with_sid("ser-1")
        .with_serialize(SerializePolicy::Codec {
            read: Some(Rc::new(|raw| {
                json!(raw.as_str().unwrap_or("").to_uppercase())
            })),
        })
        .shared();

    let mut snapshot = serde_json::Map::new();
    snapshot.insert("ser-1".to_string(), json!("restored"));
    let scope = Scope::from_serialized(snapshot);

    let recorder = Recorder::new();
    let read = Node::builder()
        .step(Step::mov(MovSource::store(&store), MovTarget::Stack))
        .next(&recorder.node())
        .build()
        .unwrap();

    launch_config(LaunchConfig::new(&read, json!(null)).with_scope(&scope));
    assert_eq!(recorder.values(), vec![json!("RESTORED")]);
}

/// The inspector fires exactly once per node activation.
#[test]
fn test_inspector_fires_once_per_activation() {
    let count = Rc::new(Cell::new(0));
    let seen = count.clone();
    set_inspector(Some(Rc::new(move |_, _| seen.set(seen.get() + 1))));

    let recorder = Recorder::new();
    let head = Node::builder()
        .step(identity_step())
        .next(&recorder.node())
        .build()
        .unwrap();
    launch(&head, json!(null));

    set_inspector(None);
    // One activation for the head node, one for the recorder sink.
    assert_eq!(count.get(), 2);
}
