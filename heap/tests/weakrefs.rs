mod common;

use common::*;
use heap::{Address, WORD};

/// Allocates a weakref to `target` and roots it. `target` must be rooted
/// at `target_idx`; the weak pointer is stored before anything else
/// allocates.
fn weakref_to(env: &mut TestEnv, target_idx: usize) -> usize {
    let weak = env.gc.malloc(&mut env.roots, WEAKREF, 0).expect("weakref");
    let target = env.root(target_idx);
    unsafe { weak.add(WEAK_TARGET).store_address(target) };
    env.roots.push(weak)
}

fn deref(env: &TestEnv, weak_idx: usize) -> Address {
    unsafe { env.root(weak_idx).add(WEAK_TARGET).load_address() }
}

fn weakref_follows_promoted_target(env: &mut TestEnv) {
    let target = env.rooted_node(3);
    let weak = weakref_to(env, target);
    assert!(env.gc.is_in_nursery(env.root(weak)));

    env.minor();
    let target_obj = env.root(target);
    assert!(!env.gc.is_in_nursery(target_obj));
    assert_eq!(deref(env, weak), target_obj);

    env.major();
    assert_eq!(deref(env, weak), target_obj);
    assert_eq!(env.value(deref(env, weak)), 3);
}

#[test]
fn test_weakref_follows_promoted_target() {
    for_each_arena(weakref_follows_promoted_target);
}

fn weakref_cleared_when_target_dies_young(env: &mut TestEnv) {
    let target = env.rooted_node(3);
    let weak = weakref_to(env, target);
    env.roots.set(target, Address::NULL);

    env.minor();
    assert!(!env.gc.is_in_nursery(env.root(weak)));
    assert!(deref(env, weak).is_null());
}

#[test]
fn test_weakref_cleared_when_target_dies_young() {
    for_each_arena(weakref_cleared_when_target_dies_young);
}

fn weakref_cleared_when_target_dies_old(env: &mut TestEnv) {
    // a weakref to an element of a rooted array
    let arr = env.array(3);
    let arr_idx = env.roots.push(arr);
    let elem = env.node(5);
    let arr = env.root(arr_idx);
    env.set_item(arr, 0, elem);
    let elem_idx = env.roots.push(elem);
    let weak = weakref_to(env, elem_idx);
    env.roots.set(elem_idx, Address::NULL);

    env.minor();
    let arr = env.root(arr_idx);
    assert_eq!(deref(env, weak), env.item(arr, 0));

    env.major();
    assert_eq!(deref(env, weak), env.item(arr, 0), "target still strongly reachable");

    env.set_item(arr, 0, Address::NULL);
    env.major();
    assert!(deref(env, weak).is_null());

    // the holder stays usable after its target is gone
    env.major();
    assert!(deref(env, weak).is_null());
}

#[test]
fn test_weakref_cleared_when_target_dies_old() {
    for_each_arena(weakref_cleared_when_target_dies_old);
}

fn weakref_does_not_keep_target_alive(env: &mut TestEnv) {
    let target = env.rooted_node(1);
    let weak = weakref_to(env, target);
    env.minor();
    let before = env.gc.total_memory_used();

    env.roots.set(target, Address::NULL);
    env.major();
    assert!(deref(env, weak).is_null());
    assert_eq!(env.gc.total_memory_used(), before - 4 * WORD);
}

#[test]
fn test_weakref_does_not_keep_target_alive() {
    for_each_arena(weakref_does_not_keep_target_alive);
}

fn dead_weakref_holders_are_dropped(env: &mut TestEnv) {
    let target = env.rooted_node(1);
    let weak = weakref_to(env, target);
    env.roots.set(weak, Address::NULL);

    env.minor();
    env.major();
    // only the target is left
    assert_eq!(env.gc.total_memory_used(), 4 * WORD);
    assert_eq!(env.value(env.root(target)), 1);
}

#[test]
fn test_dead_weakref_holders_are_dropped() {
    for_each_arena(dead_weakref_holders_are_dropped);
}

fn weakref_to_prebuilt_object_stays(env: &mut TestEnv) {
    let prebuilt = env.gc.prebuilt_object(NODE, 0, None).expect("prebuilt");
    let target = env.roots.push(prebuilt);
    let weak = weakref_to(env, target);
    env.roots.set(target, Address::NULL);

    env.minor();
    env.major();
    assert_eq!(deref(env, weak), prebuilt);
}

#[test]
fn test_weakref_to_prebuilt_object_stays() {
    for_each_arena(weakref_to_prebuilt_object_stays);
}
