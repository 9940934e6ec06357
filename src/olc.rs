use std::{
    marker::PhantomData,
    ptr::NonNull,
    sync::atomic::{AtomicPtr, Ordering::*},
};

use crossbeam::{
    epoch::{self, Guard},
    utils::Backoff,
};

use crate::{
    index::OrderedIndex,
    lock::{OptLockError, OptResult},
    node::{erase, free_subtree, make_root, subtree_height, Header, Inner, Leaf, NodeKind, NodeRef},
};

/// Optimistic lock coupling: readers validate a per-node version across
/// traversal steps and restart on conflict; writers take per-node write
/// locks only for the leaf they mutate or the pair of nodes involved in
/// a split. Readers never block writers and writers never block
/// readers.
pub struct OlcTree<K, V>
where
    K: Ord + Copy,
    V: Copy,
{
    root: AtomicPtr<Header>,
    _marker: PhantomData<(K, V)>,
}

unsafe impl<K: Ord + Copy + Send, V: Copy + Send> Send for OlcTree<K, V> {}
unsafe impl<K: Ord + Copy + Send + Sync, V: Copy + Send + Sync> Sync for OlcTree<K, V> {}

impl<K, V> OlcTree<K, V>
where
    K: Ord + Copy,
    V: Copy,
{
    pub fn new() -> Self {
        Self {
            root: AtomicPtr::new(erase(Leaf::<K, V>::boxed()).as_ptr()),
            _marker: PhantomData,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let guard = epoch::pin();
        let backoff = Backoff::new();
        loop {
            match unsafe { self.try_insert(key, value, &guard) } {
                Ok(()) => return,
                Err(_) => backoff.spin(),
            }
        }
    }

    /// One lock-coupled descent. Any conflict or structural change
    /// surfaces as `Err`; every lock taken in this attempt is released
    /// before it returns.
    unsafe fn try_insert(&self, key: K, value: V, _guard: &Guard) -> OptResult<()> {
        let root_ptr = self.root.load(Acquire);
        let mut node = NonNull::new_unchecked(root_ptr);
        let mut version = node.as_ref().lock.read_or_restart()?;
        if self.root.load(Acquire) != root_ptr {
            // the root was split away between the load and the version
            // observation
            return Err(OptLockError::VersionMismatch);
        }
        let mut parent: Option<(NodeRef, u64)> = None;

        while node.as_ref().kind() == NodeKind::Inner {
            let inner = node.cast::<Inner<K>>();

            if inner.as_ref().is_full() {
                return self.split_and_restart(node, version, parent);
            }

            if let Some((p, pv)) = parent {
                p.as_ref().lock.read_unlock_or_restart(pv)?;
            }
            let pos = inner.as_ref().lower_bound(&key);
            let child = inner.as_ref().child_at(pos);
            // the children array may have been shuffled while we read
            // the pointer; revalidate before trusting it
            node.as_ref().lock.check_or_restart(version)?;
            let child_version = child.as_ref().lock.read_or_restart()?;

            parent = Some((node, version));
            node = child;
            version = child_version;
        }

        let mut leaf = node.cast::<Leaf<K, V>>();
        if leaf.as_ref().is_full() {
            return self.split_and_restart(node, version, parent);
        }

        node.as_ref().lock.upgrade_or_restart(version)?;
        if let Some((p, pv)) = parent {
            if let Err(e) = p.as_ref().lock.read_unlock_or_restart(pv) {
                node.as_ref().lock.write_unlock();
                return Err(e);
            }
        }
        leaf.as_mut().insert(key, value);
        node.as_ref().lock.write_unlock();
        Ok(())
    }

    /// Preemptive split of the full node met on the descent: write-lock
    /// the parent (if any), then the node, perform exactly one
    /// structural change, and force a fresh walk. Thanks to the
    /// preemptive policy the parent always has room for the separator,
    /// so splits never cascade within one descent.
    unsafe fn split_and_restart(
        &self,
        node: NodeRef,
        version: u64,
        parent: Option<(NodeRef, u64)>,
    ) -> OptResult<()> {
        if let Some((p, pv)) = parent {
            p.as_ref().lock.upgrade_or_restart(pv)?;
        }
        if let Err(e) = node.as_ref().lock.upgrade_or_restart(version) {
            if let Some((p, _)) = parent {
                p.as_ref().lock.write_unlock();
            }
            return Err(e);
        }
        if parent.is_none() && self.root.load(Acquire) != node.as_ptr() {
            // someone put a new root above this node already
            node.as_ref().lock.write_unlock();
            return Err(OptLockError::VersionMismatch);
        }

        let (sep, right) = match node.as_ref().kind() {
            NodeKind::Inner => {
                let mut inner = node.cast::<Inner<K>>();
                let (sep, right) = inner.as_mut().split();
                (sep, erase(right))
            }
            NodeKind::Leaf => {
                let mut leaf = node.cast::<Leaf<K, V>>();
                let (sep, right) = leaf.as_mut().split();
                (sep, erase(right))
            }
        };
        match parent {
            Some((p, _)) => {
                let mut parent_inner = p.cast::<Inner<K>>();
                parent_inner.as_mut().insert(sep, right);
            }
            None => {
                self.root.store(make_root(sep, node, right).as_ptr(), Release);
            }
        }
        node.as_ref().lock.write_unlock();
        if let Some((p, _)) = parent {
            p.as_ref().lock.write_unlock();
        }
        Err(OptLockError::VersionMismatch)
    }

    pub fn get(&self, key: K) -> Option<V> {
        let guard = epoch::pin();
        let backoff = Backoff::new();
        loop {
            match unsafe { self.try_get(&key, &guard) } {
                Ok(result) => return result,
                Err(_) => backoff.spin(),
            }
        }
    }

    unsafe fn try_get(&self, key: &K, _guard: &Guard) -> OptResult<Option<V>> {
        let root_ptr = self.root.load(Acquire);
        let mut node = NonNull::new_unchecked(root_ptr);
        let mut version = node.as_ref().lock.read_or_restart()?;
        if self.root.load(Acquire) != root_ptr {
            return Err(OptLockError::VersionMismatch);
        }
        let mut parent: Option<(NodeRef, u64)> = None;

        while node.as_ref().kind() == NodeKind::Inner {
            let inner = node.cast::<Inner<K>>();

            if let Some((p, pv)) = parent {
                p.as_ref().lock.read_unlock_or_restart(pv)?;
            }
            let pos = inner.as_ref().lower_bound(key);
            let child = inner.as_ref().child_at(pos);
            node.as_ref().lock.check_or_restart(version)?;
            let child_version = child.as_ref().lock.read_or_restart()?;

            parent = Some((node, version));
            node = child;
            version = child_version;
        }

        let result = node.cast::<Leaf<K, V>>().as_ref().get(key);
        if let Some((p, pv)) = parent {
            p.as_ref().lock.read_unlock_or_restart(pv)?;
        }
        node.as_ref().lock.read_unlock_or_restart(version)?;
        Ok(result)
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
        unsafe {
            let root = NonNull::new_unchecked(self.root.load(Acquire));
            subtree_height::<K>(root).is_some()
        }
    }

    /// Swap in a fresh empty leaf and retire the whole old tree. The
    /// old root is marked obsolete so optimistic readers restart; the
    /// nodes are freed once no pinned reader can still observe them.
    pub fn clear(&self) {
        let guard = epoch::pin();
        let backoff = Backoff::new();
        loop {
            let root_ptr = self.root.load(Acquire);
            let node = unsafe { NonNull::new_unchecked(root_ptr) };
            if unsafe { node.as_ref() }.lock.write_lock_or_restart().is_err() {
                backoff.spin();
                continue;
            }
            if self.root.load(Acquire) != root_ptr {
                unsafe { node.as_ref() }.lock.write_unlock();
                backoff.spin();
                continue;
            }

            self.root
                .store(erase(Leaf::<K, V>::boxed()).as_ptr(), Release);
            unsafe {
                node.as_ref().lock.write_unlock_obsolete();
                guard.defer_unchecked(move || free_subtree::<K, V>(node));
            }
            return;
        }
    }
}

impl<K, V> Default for OlcTree<K, V>
where
    K: Ord + Copy,
    V: Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for OlcTree<K, V>
where
    K: Ord + Copy,
    V: Copy,
{
    fn drop(&mut self) {
        unsafe {
            let root = NonNull::new_unchecked(*self.root.get_mut());
            free_subtree::<K, V>(root);
        }
    }
}

impl<K, V> OrderedIndex<K, V> for OlcTree<K, V>
where
    K: Ord + Copy,
    V: Copy,
{
    fn insert(&self, key: K, value: V) {
        OlcTree::insert(self, key, value);
    }

    fn lookup(&self, key: K, out: &mut V) -> bool {
        OlcTree::lookup(self, key, out)
    }

    fn check_tree(&self) -> bool {
        OlcTree::check_tree(self)
    }

    fn clear(&self) {
        OlcTree::clear(self);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use itertools::Itertools;
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

    use super::OlcTree;

    #[test]
    fn smoke() {
        let tree = OlcTree::new();
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
        let tree = OlcTree::new();
        tree.insert(7, 1);
        tree.insert(7, 2);
        tree.insert(7, 3);

        assert_eq!(tree.get(7), Some(3));
        assert_eq!(tree.get(8), None);
    }

    #[test]
    fn random_permutation_splits() {
        let mut keys = (0..1000_i64).collect_vec();
        keys.shuffle(&mut StdRng::seed_from_u64(0xa11ce));

        let tree = OlcTree::new();
        for &key in keys.iter() {
            tree.insert(key, key + 1);
        }

        assert!(tree.check_tree());
        for &key in keys.iter() {
            assert_eq!(tree.get(key), Some(key + 1));
        }
    }

    #[test]
    fn disjoint_ranges_across_threads() {
        const THREADS: i64 = 8;
        const PER_THREAD: i64 = 5000;

        let tree = Arc::new(OlcTree::new());

        let handles = (0..THREADS)
            .map(|t| {
                let tree = tree.clone();
                thread::spawn(move || {
                    for key in t * PER_THREAD..(t + 1) * PER_THREAD {
                        tree.insert(key, key * 2);
                    }
                })
            })
            .collect_vec();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(tree.check_tree());
        let handles = (0..THREADS)
            .map(|t| {
                let tree = tree.clone();
                thread::spawn(move || {
                    for key in t * PER_THREAD..(t + 1) * PER_THREAD {
                        assert_eq!(tree.get(key), Some(key * 2));
                    }
                })
            })
            .collect_vec();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn readers_run_against_writers() {
        const THREADS: i64 = 4;
        const PER_THREAD: i64 = 4000;

        let tree = Arc::new(OlcTree::new());

        let handles = (0..THREADS)
            .map(|t| {
                let tree = tree.clone();
                thread::spawn(move || {
                    for key in t * PER_THREAD..(t + 1) * PER_THREAD {
                        tree.insert(key, key);
                        // immediately read back our own write while the
                        // other threads keep splitting nodes under us
                        assert_eq!(tree.get(key), Some(key));
                    }
                })
            })
            .collect_vec();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(tree.check_tree());
    }

    #[test]
    fn clear_resets_to_empty() {
        let tree = OlcTree::new();
        for key in 0..10_000_i64 {
            tree.insert(key, key);
        }
        tree.clear();

        assert!(tree.check_tree());
        assert_eq!(tree.get(42), None);
        tree.insert(42, 1);
        assert_eq!(tree.get(42), Some(1));
    }
}
