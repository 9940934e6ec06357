use std::{
    marker::PhantomData,
    ptr::NonNull,
    sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, Ordering::*},
};

use crossbeam::{
    epoch::{self, Guard},
    utils::Backoff,
};

use crate::{
    index::OrderedIndex,
    lock::{OptLockError, OptResult},
    node::{erase, free_subtree, make_root, subtree_height, Header, Inner, Leaf, NodeKind, NodeRef},
    tsx::{self, abort_bucket, Begin, ABORT_BUCKETS},
};

pub const HTM_RETRY_MAX: u32 = 8;

/// Abort accounting for one operation path.
struct PathStats {
    fallbacks: AtomicI32,
    retries: [AtomicU32; ABORT_BUCKETS],
}

impl PathStats {
    fn new() -> Self {
        Self {
            fallbacks: AtomicI32::new(0),
            retries: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    fn record_abort(&self, status: u32) {
        self.retries[abort_bucket(status)].fetch_add(1, Relaxed);
    }

    fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Relaxed);
    }

    fn retries_snapshot(&self) -> [u32; ABORT_BUCKETS] {
        std::array::from_fn(|i| self.retries[i].load(Relaxed))
    }
}

/// What a committed insert transaction left behind.
enum TxnStep {
    Done,
    /// A split was committed; the walk must start over on the changed
    /// tree.
    Restart,
}

/// Tree whose operations first run as hardware transactions and drop to
/// the lock-coupled protocol once the retry budget is spent. Leaves
/// store entries in arrival order so a transactional insert touches as
/// few cache lines as possible; ordering is restored under the write
/// lock right before a split.
pub struct HtmTree<K, V>
where
    K: Ord + Copy,
    V: Copy,
{
    root: AtomicPtr<Header>,
    /// Whether transactional and latched execution may interleave
    /// within one logical operation. When set, an abort that cannot
    /// succeed on retry skips the rest of the budget.
    weaved: bool,
    retry_limit: u32,
    insert_stats: PathStats,
    lookup_stats: PathStats,
    _marker: PhantomData<(K, V)>,
}

unsafe impl<K: Ord + Copy + Send, V: Copy + Send> Send for HtmTree<K, V> {}
unsafe impl<K: Ord + Copy + Send + Sync, V: Copy + Send + Sync> Sync for HtmTree<K, V> {}

impl<K, V> HtmTree<K, V>
where
    K: Ord + Copy,
    V: Copy,
{
    pub fn new(weaved: bool) -> Self {
        Self::with_retry_limit(weaved, HTM_RETRY_MAX)
    }

    pub fn with_retry_limit(weaved: bool, retry_limit: u32) -> Self {
        Self {
            root: AtomicPtr::new(erase(Leaf::<K, V>::boxed()).as_ptr()),
            weaved,
            retry_limit,
            insert_stats: PathStats::new(),
            lookup_stats: PathStats::new(),
            _marker: PhantomData,
        }
    }

    fn give_up(&self, status: u32, retries: u32) -> bool {
        retries > self.retry_limit || (self.weaved && !tsx::may_succeed_on_retry(status))
    }

    pub fn insert(&self, key: K, value: V) {
        let guard = epoch::pin();
        'walk: loop {
            let mut retries = 0;
            loop {
                match tsx::begin() {
                    Begin::Started => match unsafe { self.insert_txn(key, value) } {
                        TxnStep::Done => return,
                        TxnStep::Restart => continue 'walk,
                    },
                    Begin::Aborted(status) => {
                        self.insert_stats.record_abort(status);
                        retries += 1;
                        if self.give_up(status, retries) {
                            break;
                        }
                    }
                }
            }
            self.insert_stats.record_fallback();
            unsafe { self.insert_latched(key, value, &guard) };
            return;
        }
    }

    /// Body of the insert transaction. No version protocol: the
    /// hardware detects conflicting writers, and any node that a
    /// latched writer holds (or has retired) aborts the transaction
    /// explicitly. Every node this transaction mutates gets its version
    /// bumped so that optimistic readers on the latched path revalidate
    /// once we commit.
    ///
    /// # Safety
    /// Must run inside a transaction started by `tsx::begin`.
    unsafe fn insert_txn(&self, key: K, value: V) -> TxnStep {
        let mut node = NonNull::new_unchecked(self.root.load(Acquire));
        let mut parent: Option<NonNull<Inner<K>>> = None;

        while node.as_ref().kind() == NodeKind::Inner {
            abort_if_unavailable(node);
            let mut inner = node.cast::<Inner<K>>();

            if inner.as_ref().is_full() {
                let (sep, right) = inner.as_mut().split();
                self.attach_txn(parent, sep, node, erase(right));
                tsx::commit();
                return TxnStep::Restart;
            }

            parent = Some(inner);
            let pos = inner.as_ref().lower_bound(&key);
            node = inner.as_ref().child_at(pos);
        }

        abort_if_unavailable(node);
        let mut leaf = node.cast::<Leaf<K, V>>();
        if leaf.as_ref().is_full() {
            let (sep, right) = leaf.as_mut().split();
            self.attach_txn(parent, sep, node, erase(right));
            tsx::commit();
            return TxnStep::Restart;
        }

        leaf.as_mut().upsert_or_append(key, value);
        node.as_ref().lock.bump();
        tsx::commit();
        TxnStep::Done
    }

    /// Publish a split performed inside a transaction.
    ///
    /// # Safety
    /// Must run inside the transaction that performed the split.
    unsafe fn attach_txn(
        &self,
        parent: Option<NonNull<Inner<K>>>,
        sep: K,
        left: NodeRef,
        right: NodeRef,
    ) {
        left.as_ref().lock.bump();
        match parent {
            Some(mut parent) => {
                parent.as_mut().insert(sep, right);
                parent.as_ref().hdr.lock.bump();
            }
            None => {
                self.root.store(make_root(sep, left, right).as_ptr(), Release);
            }
        }
    }

    pub fn get(&self, key: K) -> Option<V> {
        let guard = epoch::pin();
        let mut retries = 0;
        loop {
            match tsx::begin() {
                Begin::Started => return unsafe { self.lookup_txn(&key) },
                Begin::Aborted(status) => {
                    self.lookup_stats.record_abort(status);
                    retries += 1;
                    if self.give_up(status, retries) {
                        break;
                    }
                }
            }
        }
        self.lookup_stats.record_fallback();
        unsafe { self.lookup_latched(&key, &guard) }
    }

    /// # Safety
    /// Must run inside a transaction started by `tsx::begin`.
    unsafe fn lookup_txn(&self, key: &K) -> Option<V> {
        let mut node = NonNull::new_unchecked(self.root.load(Acquire));
        loop {
            abort_if_unavailable(node);
            match node.as_ref().kind() {
                NodeKind::Inner => {
                    let inner = node.cast::<Inner<K>>();
                    let pos = inner.as_ref().lower_bound(key);
                    node = inner.as_ref().child_at(pos);
                }
                NodeKind::Leaf => {
                    // an arrival-order leaf is scanned linearly; sorting
                    // it here would turn a read transaction into a
                    // writing one
                    let result = node.cast::<Leaf<K, V>>().as_ref().get_linear(key);
                    tsx::commit();
                    return result;
                }
            }
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

    /// Latched fallback: the lock-coupled descent, with the leaf step
    /// adapted to arrival-order leaves.
    unsafe fn insert_latched(&self, key: K, value: V, guard: &Guard) {
        let backoff = Backoff::new();
        loop {
            match self.try_insert_latched(key, value, guard) {
                Ok(()) => return,
                Err(_) => backoff.spin(),
            }
        }
    }

    unsafe fn try_insert_latched(&self, key: K, value: V, _guard: &Guard) -> OptResult<()> {
        let root_ptr = self.root.load(Acquire);
        let mut node = NonNull::new_unchecked(root_ptr);
        let mut version = node.as_ref().lock.read_or_restart()?;
        if self.root.load(Acquire) != root_ptr {
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
        leaf.as_mut().upsert_or_append(key, value);
        node.as_ref().lock.write_unlock();
        Ok(())
    }

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
                // split restructures the leaf first; we hold its write
                // lock, which is what restructure requires
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

    unsafe fn lookup_latched(&self, key: &K, guard: &Guard) -> Option<V> {
        let backoff = Backoff::new();
        loop {
            match self.try_lookup_latched(key, guard) {
                Ok(result) => return result,
                Err(_) => backoff.spin(),
            }
        }
    }

    unsafe fn try_lookup_latched(&self, key: &K, _guard: &Guard) -> OptResult<Option<V>> {
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

        let result = node.cast::<Leaf<K, V>>().as_ref().get_linear(key);
        if let Some((p, pv)) = parent {
            p.as_ref().lock.read_unlock_or_restart(pv)?;
        }
        node.as_ref().lock.read_unlock_or_restart(version)?;
        Ok(result)
    }

    pub fn check_tree(&self) -> bool {
        unsafe {
            let root = NonNull::new_unchecked(self.root.load(Acquire));
            subtree_height::<K>(root).is_some()
        }
    }

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

    pub fn insert_fallback_times(&self) -> i32 {
        self.insert_stats.fallbacks.load(Relaxed)
    }

    pub fn lookup_fallback_times(&self) -> i32 {
        self.lookup_stats.fallbacks.load(Relaxed)
    }

    pub fn insert_retries(&self) -> [u32; ABORT_BUCKETS] {
        self.insert_stats.retries_snapshot()
    }

    pub fn lookup_retries(&self) -> [u32; ABORT_BUCKETS] {
        self.lookup_stats.retries_snapshot()
    }
}

/// Abort the running transaction when a node is unsafe to read: a
/// latched writer holds it, or it has been retired by `clear`.
///
/// # Safety
/// Must run inside a transaction started by `tsx::begin`.
unsafe fn abort_if_unavailable(node: NodeRef) {
    match node.as_ref().lock.read_or_restart() {
        Ok(_) => {}
        Err(OptLockError::Obsoleted) => tsx::abort(tsx::CODE_NODE_OBSOLETE),
        Err(_) => tsx::abort(tsx::CODE_NODE_LOCKED),
    }
}

impl<K, V> Drop for HtmTree<K, V>
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

impl<K, V> OrderedIndex<K, V> for HtmTree<K, V>
where
    K: Ord + Copy,
    V: Copy,
{
    fn insert(&self, key: K, value: V) {
        HtmTree::insert(self, key, value);
    }

    fn lookup(&self, key: K, out: &mut V) -> bool {
        HtmTree::lookup(self, key, out)
    }

    fn check_tree(&self) -> bool {
        HtmTree::check_tree(self)
    }

    fn clear(&self) {
        HtmTree::clear(self);
    }

    fn insert_fallback_times(&self) -> i32 {
        HtmTree::insert_fallback_times(self)
    }

    fn lookup_fallback_times(&self) -> i32 {
        HtmTree::lookup_fallback_times(self)
    }

    fn insert_retries(&self) -> [u32; ABORT_BUCKETS] {
        HtmTree::insert_retries(self)
    }

    fn lookup_retries(&self) -> [u32; ABORT_BUCKETS] {
        HtmTree::lookup_retries(self)
    }
}
