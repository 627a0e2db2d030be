mod common;

use common::*;
use heap::{Address, Generation};

fn resource(env: &mut TestEnv, value: usize) -> usize {
    let obj = env.gc.malloc(&mut env.roots, RESOURCE, 0).expect("resource");
    unsafe { obj.store(value) };
    env.roots.push(obj)
}

fn finalizer_runs_for_unreachable_object(env: &mut TestEnv) {
    let idx = resource(env, 42);
    let obj = env.root(idx);
    assert!(!env.gc.can_move(obj), "objects with finalizers are not movable");
    assert!(env.gc.objects_with_finalizers().any(|x| x == obj));

    env.major();
    assert!(take_finalized().is_empty(), "finalizer ran for a reachable object");

    env.roots.clear();
    env.major();
    assert_eq!(take_finalized(), vec![42]);
    assert_eq!(env.gc.stats().finalizers_run, 1);
    assert_eq!(env.gc.objects_with_finalizers().count(), 0);
    assert_eq!(env.gc.pending_finalizers().count(), 0);

    // the finalized object is freed by the next major collection
    env.major();
    assert_eq!(env.gc.total_memory_used(), 0);
    assert!(take_finalized().is_empty(), "finalizer ran twice");
}

#[test]
fn test_finalizer_runs_for_unreachable_object() {
    for_each_arena(finalizer_runs_for_unreachable_object);
}

fn minor_collections_never_finalize(env: &mut TestEnv) {
    resource(env, 1);
    env.roots.clear();
    for i in 0..50 {
        env.node(i);
    }
    env.minor();
    assert!(take_finalized().is_empty());
    assert_eq!(env.gc.objects_with_finalizers().count(), 1);
}

#[test]
fn test_minor_collections_never_finalize() {
    for_each_arena(minor_collections_never_finalize);
}

fn finalized_object_keeps_its_references(env: &mut TestEnv) {
    let idx = resource(env, 5);
    let node = env.node(6);
    let obj = env.root(idx);
    env.set(obj, RESOURCE_PTR, node);
    env.roots.clear();

    env.major();
    assert_eq!(take_finalized(), vec![5]);
    // the referenced node was kept alive for the finalizer, then both go
    env.major();
    assert_eq!(env.gc.total_memory_used(), 0);
}

#[test]
fn test_finalized_object_keeps_its_references() {
    for_each_arena(finalized_object_keeps_its_references);
}

fn finalizers_run_in_reference_order(env: &mut TestEnv) {
    let first = resource(env, 1);
    let second = resource(env, 2);
    let third = resource(env, 3);
    // first -> second -> third
    let (a, b, c) = (env.root(first), env.root(second), env.root(third));
    env.set(a, RESOURCE_PTR, b);
    env.set(b, RESOURCE_PTR, c);
    env.roots.clear();

    env.major();
    assert_eq!(take_finalized(), vec![1]);
    env.major();
    assert_eq!(take_finalized(), vec![2]);
    env.major();
    assert_eq!(take_finalized(), vec![3]);
    env.major();
    assert_eq!(env.gc.total_memory_used(), 0);
}

#[test]
fn test_finalizers_run_in_reference_order() {
    for_each_arena(finalizers_run_in_reference_order);
}

fn finalizer_cycle_runs_one_at_a_time(env: &mut TestEnv) {
    let first = resource(env, 1);
    let second = resource(env, 2);
    let (a, b) = (env.root(first), env.root(second));
    env.set(a, RESOURCE_PTR, b);
    env.set(b, RESOURCE_PTR, a);
    env.roots.clear();

    env.major();
    let mut finalized = take_finalized();
    assert_eq!(finalized.len(), 1, "a cycle finalizes one object per collection");
    env.major();
    finalized.extend(take_finalized());
    finalized.sort_unstable();
    assert_eq!(finalized, vec![1, 2]);

    env.major();
    assert_eq!(env.gc.total_memory_used(), 0);
}

#[test]
fn test_finalizer_cycle_runs_one_at_a_time() {
    for_each_arena(finalizer_cycle_runs_one_at_a_time);
}

fn object_reachable_from_live_finalizer_object_survives(env: &mut TestEnv) {
    let holder = resource(env, 1);
    let inner = resource(env, 2);
    let (h, i) = (env.root(holder), env.root(inner));
    env.set(h, RESOURCE_PTR, i);
    env.roots.truncate(1);

    env.major();
    env.major();
    assert!(take_finalized().is_empty(), "reachable objects were finalized");
    assert_eq!(env.gc.objects_with_finalizers().count(), 2);
}

#[test]
fn test_object_reachable_from_live_finalizer_object_survives() {
    for_each_arena(object_reachable_from_live_finalizer_object_survives);
}

fn finalizer_may_allocate_but_not_collect_fully(env: &mut TestEnv) {
    let obj = env.gc.malloc(&mut env.roots, GREEDY, 0).expect("greedy");
    unsafe { obj.store(77usize) };

    env.gc
        .collect(&mut env.roots, Generation::Major)
        .expect("major collection");

    assert_eq!(take_finalized(), vec![77]);
    let seen = take_majors_seen_by_finalizer();
    assert_eq!(seen.len(), 1);
    let (before, after) = seen[0];
    assert_eq!(before, after, "a major collection ran inside a finalizer");
    assert!(env.gc.stats().minor_collections > 2);

    // the garbage allocated by the finalizer goes away normally
    env.major();
    env.major();
    assert_eq!(env.gc.total_memory_used(), 0);
}

#[test]
fn test_finalizer_may_allocate_but_not_collect_fully() {
    for_each_arena(finalizer_may_allocate_but_not_collect_fully);
}

fn prebuilt_reference_does_not_delay_finalizer(env: &mut TestEnv) {
    let prebuilt = env.gc.prebuilt_object(NODE, 0, None).expect("prebuilt");
    let idx = resource(env, 8);
    let obj = env.root(idx);
    env.set(obj, RESOURCE_PTR, prebuilt);
    env.roots.clear();

    env.major();
    assert_eq!(take_finalized(), vec![8]);
    assert!(env.gc.pending_finalizers().next().is_none());
    assert_eq!(env.get(obj, RESOURCE_PTR), prebuilt);
    assert_ne!(prebuilt, Address::NULL);
}

#[test]
fn test_prebuilt_reference_does_not_delay_finalizer() {
    for_each_arena(prebuilt_reference_does_not_delay_finalizer);
}
