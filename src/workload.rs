use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Lookup,
}

#[derive(Debug, Clone, Copy)]
pub struct Operation {
    pub kind: OpKind,
    pub key: i64,
    pub value: i64,
}

/// Produces reproducible operation streams for the benchmark driver and
/// the mixed-workload tests. Insert keys are a shuffled permutation of
/// a dense range, so parallel streams built from disjoint ranges never
/// contend on the same key; lookups always target a key the same stream
/// inserted earlier.
pub struct WorkloadGenerator {
    insert_fraction: f64,
    rng: StdRng,
}

impl WorkloadGenerator {
    pub fn new(insert_fraction: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&insert_fraction),
            "insert fraction must be within [0, 1]"
        );
        Self {
            insert_fraction,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// One operation stream over the key range
    /// `[key_start, key_start + num_ops)`. The first operation is
    /// always an insert so that lookups have something to target.
    pub fn generate(&mut self, num_ops: usize, key_start: i64) -> Vec<Operation> {
        let mut operations = Vec::with_capacity(num_ops);
        if num_ops == 0 {
            return operations;
        }

        let mut keys: Vec<i64> = (key_start..key_start + num_ops as i64).collect();
        keys.shuffle(&mut self.rng);
        let values: Vec<i64> = (0..num_ops)
            .map(|_| self.rng.gen_range(key_start..key_start + num_ops as i64 * 100))
            .collect();

        operations.push(Operation {
            kind: OpKind::Insert,
            key: keys[0],
            value: values[0],
        });
        let mut inserted = 1;
        for _ in 1..num_ops {
            if inserted < num_ops && self.rng.gen_bool(self.insert_fraction) {
                operations.push(Operation {
                    kind: OpKind::Insert,
                    key: keys[inserted],
                    value: values[inserted],
                });
                inserted += 1;
            } else {
                let target = self.rng.gen_range(0..inserted);
                operations.push(Operation {
                    kind: OpKind::Lookup,
                    key: keys[target],
                    value: values[target],
                });
            }
        }
        operations
    }

    /// One stream per thread, each over its own key range so that
    /// concurrent inserts never collide on a key. The last thread picks
    /// up the remainder when `num_ops` does not divide evenly.
    pub fn generate_parallel(
        &mut self,
        num_ops: usize,
        num_threads: usize,
    ) -> Vec<Vec<Operation>> {
        assert!(num_threads > 0);
        let per_thread = num_ops / num_threads;
        let mut workloads = Vec::with_capacity(num_threads);
        for thread in 0..num_threads - 1 {
            workloads.push(self.generate(per_thread, (per_thread * thread) as i64));
        }
        workloads.push(self.generate(
            num_ops - per_thread * (num_threads - 1),
            (per_thread * (num_threads - 1)) as i64,
        ));
        workloads
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use itertools::Itertools;

    use super::{OpKind, WorkloadGenerator};

    #[test]
    fn fixed_seed_is_reproducible() {
        let a = WorkloadGenerator::new(0.5, 7).generate(1000, 0);
        let b = WorkloadGenerator::new(0.5, 7).generate(1000, 0);

        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!((x.kind, x.key, x.value), (y.kind, y.key, y.value));
        }
    }

    #[test]
    fn lookups_target_prior_inserts() {
        let ops = WorkloadGenerator::new(0.5, 99).generate(10_000, 500);

        let mut seen = HashMap::new();
        for op in ops {
            match op.kind {
                OpKind::Insert => {
                    seen.insert(op.key, op.value);
                }
                OpKind::Lookup => {
                    assert_eq!(seen.get(&op.key), Some(&op.value));
                }
            }
        }
    }

    #[test]
    fn insert_only_stream_covers_the_range() {
        let ops = WorkloadGenerator::new(1.0, 3).generate(5000, 100);

        assert!(ops.iter().all(|op| op.kind == OpKind::Insert));
        let keys = ops.iter().map(|op| op.key).sorted().collect_vec();
        assert_eq!(keys, (100..5100).collect_vec());
    }

    #[test]
    fn parallel_streams_use_disjoint_ranges() {
        let workloads = WorkloadGenerator::new(0.5, 21).generate_parallel(10_001, 4);

        assert_eq!(workloads.len(), 4);
        assert_eq!(workloads.iter().map(Vec::len).sum::<usize>(), 10_001);
        for (t, ops) in workloads.iter().enumerate() {
            let lo = t as i64 * 2500;
            let hi = if t == 3 { lo + 2501 } else { lo + 2500 };
            assert!(ops.iter().all(|op| (lo..hi).contains(&op.key)));
        }
    }

    #[test]
    fn keys_stay_in_the_partition() {
        let ops = WorkloadGenerator::new(0.25, 11).generate(2000, 8000);
        assert!(ops.iter().all(|op| (8000..10_000).contains(&op.key)));
    }
}
