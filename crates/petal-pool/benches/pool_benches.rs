//! Criterion benchmarks for petal-pool hot paths.
//!
//! Covers: fluff insertion with conflict checks, state transitions,
//! block candidate selection, and dependent chain growth.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use petal_core::types::{Hash256, Transaction, TxContext, TxKernel};
use petal_pool::{Dependent, DependentLimits, Fluff, State, Stats};

/// Deterministic transaction with one input derived from `i`.
fn make_tx(i: u64) -> Transaction {
    let input = Hash256(*blake3::hash(&i.to_le_bytes()).as_bytes());
    let output = Hash256(*blake3::hash(&((i + 1) << 32).to_le_bytes()).as_bytes());
    Transaction {
        inputs: vec![input],
        outputs: vec![output],
        kernels: vec![TxKernel {
            fee: 100 + (i * 7919) % 10_000,
            min_height: 0,
            max_height: u64::MAX,
            bvm_charge: 0,
            nonce: i,
        }],
        offset: Hash256::ZERO,
    }
}

fn make_batch(n: u64) -> Vec<(Transaction, Stats)> {
    (0..n)
        .map(|i| {
            let tx = make_tx(i);
            let ctx = TxContext::summarize(&tx).expect("valid kernels");
            let stats = Stats::from_context(&tx, &ctx, 0, 64).expect("encodable");
            (tx, stats)
        })
        .collect()
}

fn filled_pool(n: u64) -> Fluff {
    let mut pool = Fluff::new();
    for (tx, stats) in make_batch(n) {
        let key = tx.key();
        pool.add_valid_tx(tx, stats, key, State::Fluffed, 0).expect("unique keys");
    }
    pool
}

fn bench_fluff_insert(c: &mut Criterion) {
    c.bench_function("fluff_insert_1000", |b| {
        b.iter_batched(
            || make_batch(1_000),
            |batch| {
                let mut pool = Fluff::new();
                for (tx, stats) in batch {
                    let key = tx.key();
                    let _ = pool.add_valid_tx(tx, stats, key, State::PreFluffed, 10);
                }
                pool
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_fluff_outdate(c: &mut Criterion) {
    c.bench_function("fluff_outdate_1000", |b| {
        b.iter_batched(
            || {
                let pool = filled_pool(1_000);
                let ids = pool.ids_in_state(State::Fluffed);
                (pool, ids)
            },
            |(mut pool, ids)| {
                for id in ids {
                    let _ = pool.set_state(id, State::Outdated, 5);
                }
                pool
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_fluff_select(c: &mut Criterion) {
    let pool = filled_pool(5_000);
    c.bench_function("fluff_select_64k", |b| {
        b.iter(|| pool.select(black_box(64 * 1024)))
    });
}

fn bench_dependent_chain(c: &mut Criterion) {
    let batch: Vec<Transaction> = (0..32).map(make_tx).collect();
    c.bench_function("dependent_chain_32", |b| {
        b.iter(|| {
            let mut pool = Dependent::new(DependentLimits::default());
            let mut parent = None;
            for tx in batch.iter().cloned() {
                let ctx = TxContext::summarize(&tx).expect("valid kernels");
                let key = tx.key();
                let context = tx.id().expect("encodable");
                parent = pool.add_valid_tx(tx, &ctx, key, context, parent).ok();
            }
            pool.best()
        })
    });
}

criterion_group!(
    benches,
    bench_fluff_insert,
    bench_fluff_outdate,
    bench_fluff_select,
    bench_dependent_chain,
);
criterion_main!(benches);
