use std::{cell::Cell, marker::PhantomData, ptr::NonNull};

use crate::{
    index::OrderedIndex,
    node::{erase, free_subtree, make_root, subtree_height, Inner, Leaf, NodeKind, NodeRef},
};

/// Reference tree: the same top-down walk with eager preemptive splits
/// as the concurrent variants, with every synchronization step removed.
/// It defines the observable semantics the other trees must match on a
/// sequential trace.
///
/// Not `Sync`; a single thread owns all operations.
pub struct SingleThreadedTree<K, V>
where
    K: Ord + Copy,
    V: Copy,
{
    root: Cell<NodeRef>,
    _marker: PhantomData<(K, V)>,
}

unsafe impl<K: Ord + Copy + Send, V: Copy + Send> Send for SingleThreadedTree<K, V> {}

impl<K, V> SingleThreadedTree<K, V>
where
    K: Ord + Copy,
    V: Copy,
{
    pub fn new() -> Self {
        Self {
            root: Cell::new(erase(Leaf::<K, V>::boxed())),
            _marker: PhantomData,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        // Each structural change forces a fresh walk from the root, so
        // a single walk never performs more than one split.
        unsafe { while !self.try_insert(key, value) {} }
    }

    unsafe fn try_insert(&self, key: K, value: V) -> bool {
        let mut node = self.root.get();
        let mut parent: Option<NonNull<Inner<K>>> = None;

        while node.as_ref().kind() == NodeKind::Inner {
            let mut inner = node.cast::<Inner<K>>();

            if inner.as_ref().is_full() {
                let (sep, right) = inner.as_mut().split();
                self.attach(parent, sep, node, erase(right));
                return false;
            }

            parent = Some(inner);
            let pos = inner.as_ref().lower_bound(&key);
            node = inner.as_ref().child_at(pos);
        }

        let mut leaf = node.cast::<Leaf<K, V>>();
        if leaf.as_ref().is_full() {
            let (sep, right) = leaf.as_mut().split();
            self.attach(parent, sep, node, erase(right));
            return false;
        }

        leaf.as_mut().insert(key, value);
        true
    }

    unsafe fn attach(
        &self,
        parent: Option<NonNull<Inner<K>>>,
        sep: K,
        left: NodeRef,
        right: NodeRef,
    ) {
        match parent {
            Some(mut parent) => parent.as_mut().insert(sep, right),
            None => self.root.set(make_root(sep, left, right)),
        }
    }

    pub fn get(&self, key: K) -> Option<V> {
        unsafe {
            let mut node = self.root.get();
            while node.as_ref().kind() == NodeKind::Inner {
                let inner = node.cast::<Inner<K>>();
                let pos = inner.as_ref().lower_bound(&key);
                node = inner.as_ref().child_at(pos);
            }
            node.cast::<Leaf<K, V>>().as_ref().get(&key)
        }
    }

    pub fn lookup(&self, key: K, out: &mut V) -> bool {
        match self.get(key) {
            Some(value) => {
                *out = value;
                true
            }
            None => false,
        }
    }

    pub fn check_tree(&self) -> bool {
        unsafe { subtree_height::<K>(self.root.get()).is_some() }
    }

    pub fn clear(&self) {
        let old = self.root.get();
        self.root.set(erase(Leaf::<K, V>::boxed()));
        unsafe { free_subtree::<K, V>(old) };
    }
}

impl<K, V> Default for SingleThreadedTree<K, V>
where
    K: Ord + Copy,
    V: Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for SingleThreadedTree<K, V>
where
    K: Ord + Copy,
    V: Copy,
{
    fn drop(&mut self) {
        unsafe { free_subtree::<K, V>(self.root.get()) };
    }
}

impl<K, V> OrderedIndex<K, V> for SingleThreadedTree<K, V>
where
    K: Ord + Copy,
    V: Copy,
{
    fn insert(&self, key: K, value: V) {
        SingleThreadedTree::insert(self, key, value);
    }

    fn lookup(&self, key: K, out: &mut V) -> bool {
        SingleThreadedTree::lookup(self, key, out)
    }

    fn check_tree(&self) -> bool {
        SingleThreadedTree::check_tree(self)
    }

    fn clear(&self) {
        SingleThreadedTree::clear(self);
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

    use super::SingleThreadedTree;

    #[test]
    fn smoke() {
        let tree = SingleThreadedTree::new();
        for (key, value) in [(10, 100), (20, 200), (30, 300), (40, 400), (50, 500), (60, 600)] {
            tree.insert(key, value);
        }

        for (key, value) in [(10, 100), (20, 200), (30, 300), (40, 400), (50, 500), (60, 600)] {
            let mut out = 0;
            assert!(tree.lookup(key, &mut out));
            assert_eq!(out, value);
        }
        assert!(tree.check_tree());
    }

    #[test]
    fn upsert_overwrites() {
        let tree = SingleThreadedTree::new();
        tree.insert(7, 1);
        tree.insert(7, 2);
        tree.insert(7, 3);

        assert_eq!(tree.get(7), Some(3));
        assert_eq!(tree.get(8), None);
    }

    #[test]
    fn split_chain_stays_balanced() {
        let mut keys = (0..1000_i64).collect_vec();
        keys.shuffle(&mut StdRng::seed_from_u64(0x5eed));

        let tree = SingleThreadedTree::new();
        for &key in keys.iter() {
            tree.insert(key, key * 7);
        }

        assert!(tree.check_tree());
        for &key in keys.iter() {
            assert_eq!(tree.get(key), Some(key * 7));
        }
    }

    #[test]
    fn deep_tree_from_sequential_inserts() {
        let tree = SingleThreadedTree::new();
        for key in 0..100_000_i64 {
            tree.insert(key, -key);
        }

        assert!(tree.check_tree());
        assert_eq!(tree.get(0), Some(0));
        assert_eq!(tree.get(99_999), Some(-99_999));
        assert_eq!(tree.get(100_000), None);
    }

    #[test]
    fn clear_resets_to_empty() {
        let tree = SingleThreadedTree::new();
        for key in 0..10_000_i64 {
            tree.insert(key, key);
        }
        tree.clear();

        assert!(tree.check_tree());
        assert_eq!(tree.get(5), None);
        tree.insert(5, 55);
        assert_eq!(tree.get(5), Some(55));
    }
}
