use kvs_keyset::{KeySet, MapKeySet, SingletonKeySet, SliceKeySet};
use proptest::prelude::*;
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
enum Op {
    Add(String),
    Del(String),
    Subtract(Vec<String>, bool),
    Intersect(Vec<String>, bool),
}

fn key() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "d", "e", "f", "g", "h"]).prop_map(str::to_string)
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        key().prop_map(Op::Add),
        key().prop_map(Op::Del),
        (prop::collection::vec(key(), 0..6), any::<bool>()).prop_map(|(k, m)| Op::Subtract(k, m)),
        (prop::collection::vec(key(), 0..6), any::<bool>()).prop_map(|(k, m)| Op::Intersect(k, m)),
    ]
}

fn other_set(keys: &[String], map_based: bool) -> Box<dyn KeySet> {
    if map_based {
        Box::new(MapKeySet::new(keys))
    } else {
        Box::new(SliceKeySet::new(keys))
    }
}

fn apply(set: &mut dyn KeySet, op: &Op) -> bool {
    match op {
        Op::Add(key) => set.add(key),
        Op::Del(key) => set.del(key),
        Op::Subtract(keys, map_based) => set.subtract(other_set(keys, *map_based).as_ref()),
        Op::Intersect(keys, map_based) => set.intersect(other_set(keys, *map_based).as_ref()),
    }
}

fn apply_model(model: &mut BTreeSet<String>, op: &Op) -> bool {
    let before = model.clone();
    match op {
        Op::Add(key) => {
            model.insert(key.clone());
        }
        Op::Del(key) => {
            model.remove(key);
        }
        Op::Subtract(keys, _) => model.retain(|k| !keys.contains(k)),
        Op::Intersect(keys, _) => model.retain(|k| keys.contains(k)),
    }
    before != *model
}

fn contents(set: &dyn KeySet) -> BTreeSet<String> {
    set.iterate().iter().cloned().collect()
}

fn assert_consistent(set: &dyn KeySet, model: &BTreeSet<String>) {
    assert_eq!(contents(set), *model);
    assert_eq!(set.len(), model.len());
    assert_eq!(set.is_empty(), set.iterate().is_empty());
    for k in ["a", "b", "c", "d", "e", "f", "g", "h", "zz"] {
        assert_eq!(set.has(k), set.iterate().iter().any(|i| i == k));
    }
}

proptest! {
    #[test]
    fn prop_has_agrees_with_iterate(ops in prop::collection::vec(op(), 0..40)) {
        let mut slice = SliceKeySet::default();
        let mut map = MapKeySet::default();
        let mut model = BTreeSet::new();
        for op in &ops {
            let changed = apply_model(&mut model, op);
            prop_assert_eq!(apply(&mut slice, op), changed);
            prop_assert_eq!(apply(&mut map, op), changed);
            assert_consistent(&slice, &model);
            assert_consistent(&map, &model);
        }
    }

    #[test]
    fn prop_singleton_has_agrees_with_iterate(ops in prop::collection::vec(op(), 0..40)) {
        let mut singleton = SingletonKeySet::default();
        for op in &ops {
            apply(&mut singleton, op);
            prop_assert!(singleton.len() <= 1);
            for k in ["a", "b", "c", "d", "e", "f", "g", "h"] {
                prop_assert_eq!(singleton.has(k), singleton.iterate().iter().any(|i| i == k));
            }
        }
    }

    #[test]
    fn prop_copy_on_write_independent(
        initial in prop::collection::vec(key(), 0..8),
        ops in prop::collection::vec(op(), 1..20),
        map_based in any::<bool>(),
        mutate_copy in any::<bool>(),
    ) {
        let mut original: Box<dyn KeySet> = other_set(&initial, map_based);
        let mut copy = original.copy_on_write();
        let snapshot = contents(original.as_ref());

        let (mutated, untouched) = if mutate_copy {
            (&mut copy, &original)
        } else {
            (&mut original, &copy)
        };
        let mut model = snapshot.clone();
        for op in &ops {
            apply(mutated.as_mut(), op);
            apply_model(&mut model, op);
        }
        prop_assert_eq!(contents(untouched.as_ref()), snapshot.clone());
        for k in &snapshot {
            prop_assert!(untouched.has(k));
        }
        prop_assert_eq!(contents(mutated.as_ref()), model);
    }

    #[test]
    fn prop_cross_representation_copy(initial in prop::collection::vec(key(), 0..8), extra in key()) {
        let slice = SliceKeySet::new(&initial);
        let mut map = MapKeySet::new(slice.iterate());
        map.add(&extra);
        prop_assert_eq!(contents(&slice), initial.iter().cloned().collect::<BTreeSet<_>>());

        let mut back = SliceKeySet::new(map.iterate());
        back.del(&extra);
        prop_assert!(map.has(&extra));
        prop_assert_eq!(contents(&back), contents(&slice).into_iter().filter(|k| *k != extra).collect::<BTreeSet<_>>());
    }
}

#[test]
fn subtract_across_representations() {
    let mut set = MapKeySet::new(["a", "b", "c"]);
    assert!(set.subtract(&SliceKeySet::new(["a", "c"])));
    assert_eq!(set.iterate(), ["b"]);

    let mut set = SliceKeySet::new(["a", "b", "c"]);
    assert!(set.intersect(&MapKeySet::new(["b"])));
    assert_eq!(set.iterate(), ["b"]);

    let mut set = SingletonKeySet::new("b");
    assert!(!set.subtract(&MapKeySet::new(["a", "c"])));
    assert_eq!(set.iterate(), ["b"]);
}

#[test]
fn empty_sets_are_safe() {
    let sets: Vec<Box<dyn KeySet>> = vec![
        Box::new(SingletonKeySet::default()),
        Box::new(SliceKeySet::default()),
        Box::new(MapKeySet::default()),
    ];
    for mut set in sets {
        assert_eq!(set.len(), 0);
        assert!(set.iterate().is_empty());
        assert!(!set.has("a"));
        assert!(!set.del("a"));
        assert!(!set.subtract(&SliceKeySet::new(["a"])));
        assert!(!set.intersect(&SliceKeySet::default()));
        assert_eq!(set.to_string(), "{}");
        assert!(set.copy_on_write().is_empty());
    }
}

#[test]
fn serializes_to_json_array() {
    assert_eq!(serde_json::to_string(&SingletonKeySet::new("a")).unwrap(), r#"["a"]"#);
    assert_eq!(serde_json::to_string(&SingletonKeySet::default()).unwrap(), "[]");
    assert_eq!(serde_json::to_string(&MapKeySet::new(["x"])).unwrap(), r#"["x"]"#);
}
