use crate::tsx::ABORT_BUCKETS;

/// Uniform surface of the tree variants, so harness code can be written
/// once and instantiated per synchronization strategy.
///
/// The transactional counters default to zero; only the HTM tree has
/// anything to report.
pub trait OrderedIndex<K, V> {
    /// Upsert: a later insert of the same key overwrites the payload.
    fn insert(&self, key: K, value: V);

    /// Point lookup. On a hit the payload is written to `out` and true
    /// is returned; on a miss `out` is left untouched.
    fn lookup(&self, key: K, out: &mut V) -> bool;

    /// All leaves at the same depth. Quiescent state only.
    fn check_tree(&self) -> bool;

    /// Release every node and reinstall an empty root. Callers must
    /// ensure no operation is in flight.
    fn clear(&self);

    fn insert_fallback_times(&self) -> i32 {
        0
    }

    fn lookup_fallback_times(&self) -> i32 {
        0
    }

    fn insert_retries(&self) -> [u32; ABORT_BUCKETS] {
        [0; ABORT_BUCKETS]
    }

    fn lookup_retries(&self) -> [u32; ABORT_BUCKETS] {
        [0; ABORT_BUCKETS]
    }
}
