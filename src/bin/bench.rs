use std::time::Instant;

use anyhow::{ensure, Result};
use clap::Parser;
use tracing::info;

use arbor::{
    workload::{OpKind, Operation, WorkloadGenerator},
    HtmTree, OlcTree, OrderedIndex, SingleThreadedTree,
};

/// Drive the tree variants over one generated workload and report
/// wall-clock throughput per variant.
#[derive(Debug, Parser)]
#[command(name = "arbor-bench")]
struct Args {
    /// Worker thread count for the concurrent variants
    num_threads: usize,

    /// Fraction of operations that are inserts, in [0, 1]
    percent_insert: f64,

    /// Total operations across all threads
    #[arg(short = 'n', long, default_value_t = 1_000_000)]
    operations: usize,

    /// Workload seed
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn run_stream<T>(tree: &T, ops: &[Operation])
where
    T: OrderedIndex<i64, i64>,
{
    let mut out = 0_i64;
    for op in ops {
        match op.kind {
            OpKind::Insert => tree.insert(op.key, op.value),
            OpKind::Lookup => {
                tree.lookup(op.key, &mut out);
            }
        }
    }
}

fn run_parallel<T>(name: &str, tree: &T, workloads: &[Vec<Operation>])
where
    T: OrderedIndex<i64, i64> + Sync,
{
    let total: usize = workloads.iter().map(Vec::len).sum();
    let threads = workloads.len();

    let started = Instant::now();
    std::thread::scope(|scope| {
        for ops in workloads {
            scope.spawn(move || run_stream(tree, ops));
        }
    });
    let elapsed = started.elapsed();

    assert!(tree.check_tree(), "{name}: tree lost its balance");
    let rate = total as f64 / elapsed.as_secs_f64();
    info!("{name}: {total} ops across {threads} threads in {elapsed:?} ({rate:.0} ops/s)");
}

fn main() -> Result<()> {
    let args = Args::parse();
    ensure!(args.num_threads > 0, "need at least one worker thread");
    ensure!(
        (0.0..=1.0).contains(&args.percent_insert),
        "percent_insert must be within [0, 1]"
    );

    let operations = args.operations;
    let num_threads = args.num_threads;
    let seed = args.seed;
    info!("generating {operations} operations, insert fraction {}, seed {seed}", args.percent_insert);
    let mut generator = WorkloadGenerator::new(args.percent_insert, seed);
    let workloads = generator.generate_parallel(operations, num_threads);

    {
        let tree = SingleThreadedTree::new();
        let started = Instant::now();
        for ops in &workloads {
            run_stream(&tree, ops);
        }
        let elapsed = started.elapsed();
        assert!(tree.check_tree(), "single-threaded: tree lost its balance");
        let rate = operations as f64 / elapsed.as_secs_f64();
        info!("single-threaded: {operations} ops in {elapsed:?} ({rate:.0} ops/s)");
    }

    let olc = OlcTree::new();
    run_parallel("olc", &olc, &workloads);

    let htm = HtmTree::new(true);
    run_parallel("htm", &htm, &workloads);
    info!(
        "htm fallbacks: {} insert, {} lookup",
        htm.insert_fallback_times(),
        htm.lookup_fallback_times()
    );
    info!("htm insert aborts by cause: {:?}", htm.insert_retries());
    info!("htm lookup aborts by cause: {:?}", htm.lookup_retries());

    Ok(())
}
