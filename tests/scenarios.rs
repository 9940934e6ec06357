use std::collections::HashMap;

use itertools::Itertools;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use arbor::{
    workload::{OpKind, Operation, WorkloadGenerator},
    HtmTree, OlcTree, OrderedIndex, SingleThreadedTree,
};

fn smoke<T: OrderedIndex<i64, i64>>(tree: &T) {
    let pairs = [(10, 100), (20, 200), (30, 300), (40, 400), (50, 500), (60, 600)];
    for (key, value) in pairs {
        tree.insert(key, value);
    }

    for (key, value) in pairs {
        let mut out = 0;
        assert!(tree.lookup(key, &mut out));
        assert_eq!(out, value);
    }
    assert!(tree.check_tree());
}

fn upsert<T: OrderedIndex<i64, i64>>(tree: &T) {
    tree.insert(7, 1);
    tree.insert(7, 2);
    tree.insert(7, 3);

    let mut out = 0;
    assert!(tree.lookup(7, &mut out));
    assert_eq!(out, 3);
    assert!(!tree.lookup(8, &mut out));
}

fn random_thousand<T: OrderedIndex<i64, i64>>(tree: &T, seed: u64) {
    let mut keys = (0..1000_i64).collect_vec();
    keys.shuffle(&mut StdRng::seed_from_u64(seed));

    for &key in keys.iter() {
        tree.insert(key, key * 13);
    }

    assert!(tree.check_tree());
    for key in 0..1000 {
        let mut out = 0;
        assert!(tree.lookup(key, &mut out), "missing key {key}");
        assert_eq!(out, key * 13);
    }
}

#[test]
fn smoke_all_variants() {
    smoke(&SingleThreadedTree::new());
    smoke(&OlcTree::new());
    smoke(&HtmTree::new(true));
    smoke(&HtmTree::new(false));
}

#[test]
fn upsert_all_variants() {
    upsert(&SingleThreadedTree::new());
    upsert(&OlcTree::new());
    upsert(&HtmTree::new(true));
}

#[test]
fn random_thousand_all_variants() {
    random_thousand(&SingleThreadedTree::new(), 0x1001);
    random_thousand(&OlcTree::new(), 0x1001);
    random_thousand(&HtmTree::new(true), 0x1001);
}

#[test]
fn zero_retry_budget_matches_reference() {
    random_thousand(&HtmTree::with_retry_limit(true, 0), 0x2002);
    random_thousand(&HtmTree::with_retry_limit(false, 0), 0x2002);
}

fn apply<T: OrderedIndex<i64, i64>>(tree: &T, ops: &[Operation]) {
    let mut out = 0;
    for op in ops {
        match op.kind {
            OpKind::Insert => tree.insert(op.key, op.value),
            OpKind::Lookup => {
                assert!(tree.lookup(op.key, &mut out));
                assert_eq!(out, op.value);
            }
        }
    }
}

/// The three variants replay the same seeded stream and must end up in
/// identical final states.
#[test]
fn variants_agree_on_a_fixed_seed_stream() {
    let ops = WorkloadGenerator::new(0.5, 0xfeed).generate(50_000, 0);

    let single = SingleThreadedTree::new();
    let olc = OlcTree::new();
    let htm = HtmTree::new(true);
    apply(&single, &ops);
    apply(&olc, &ops);
    apply(&htm, &ops);

    assert!(single.check_tree());
    assert!(olc.check_tree());
    assert!(htm.check_tree());

    let mut expected = HashMap::new();
    for op in &ops {
        if op.kind == OpKind::Insert {
            expected.insert(op.key, op.value);
        }
    }

    for key in 0..50_000_i64 {
        let want = expected.get(&key).copied();
        assert_eq!(single.get(key), want);
        assert_eq!(olc.get(key), want);
        assert_eq!(htm.get(key), want);
    }
}

#[test]
fn clear_all_variants() {
    fn fill_and_clear<T: OrderedIndex<i64, i64>>(tree: &T) {
        for key in 0..5000 {
            tree.insert(key, key);
        }
        tree.clear();
        assert!(tree.check_tree());
        let mut out = 0;
        assert!(!tree.lookup(17, &mut out));
        tree.insert(17, 71);
        assert!(tree.lookup(17, &mut out));
        assert_eq!(out, 71);
    }

    fill_and_clear(&SingleThreadedTree::new());
    fill_and_clear(&OlcTree::new());
    fill_and_clear(&HtmTree::new(true));
}
