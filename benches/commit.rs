//! Commit-path benchmarks.
//!
//! Measures the single-worker cost of the full precommit pipeline (sort,
//! lock, verify, TID generation, apply, log append) for read-write
//! transactions of varying write-set sizes, plus the read-only fast path.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use cinderdb::log::types::OverwriteLog;
use cinderdb::{ArrayStorage, CommitOutcome, IsolationLevel, LogBuffer, TxnContext, TxnManager};

fn bench_readwrite_commit(c: &mut Criterion) {
    let manager = TxnManager::with_epoch_tick(Duration::from_secs(3600));
    manager.start().unwrap();
    let storage = Arc::new(ArrayStorage::new(1, 1024, 16).unwrap());

    let mut group = c.benchmark_group("precommit_readwrite");
    for writes in [1usize, 4, 16].iter() {
        group.throughput(Throughput::Elements(*writes as u64));
        group.bench_with_input(BenchmarkId::new("writes", writes), writes, |b, &writes| {
            let mut ctx = TxnContext::new(0);
            let mut log_buffer = LogBuffer::new(16 * 1024 * 1024).unwrap();
            b.iter(|| {
                if log_buffer.remaining() < 64 * writes {
                    log_buffer.clear();
                }
                manager.begin(&mut ctx, IsolationLevel::Serializable).unwrap();
                for i in 0..writes {
                    let offset = (i * 61) as u64 % storage.array_size();
                    let record = storage.record(offset).unwrap();
                    let observed = record.owner().spin_while_keylocked();
                    let log =
                        OverwriteLog::populate(storage.id(), offset, &[i as u8; 8], 0).unwrap();
                    ctx.add_to_write_set(&storage, record, observed, log);
                }
                let outcome = manager.precommit(&mut ctx, &mut log_buffer).unwrap();
                assert!(matches!(outcome, CommitOutcome::Committed(_)));
                black_box(outcome)
            });
        });
    }
    group.finish();
    manager.shutdown().unwrap();
}

fn bench_readonly_commit(c: &mut Criterion) {
    let manager = TxnManager::with_epoch_tick(Duration::from_secs(3600));
    manager.start().unwrap();
    let storage = Arc::new(ArrayStorage::new(1, 1024, 16).unwrap());

    c.bench_function("precommit_readonly_16_reads", |b| {
        let mut ctx = TxnContext::new(0);
        let mut log_buffer = LogBuffer::new(1024 * 1024).unwrap();
        let mut buf = [0u8; 16];
        b.iter(|| {
            manager.begin(&mut ctx, IsolationLevel::Serializable).unwrap();
            for i in 0..16u64 {
                let record = storage.record(i * 7).unwrap();
                let observed = record.read_stable(&mut buf);
                ctx.add_to_read_set(&storage, record, observed);
            }
            let outcome = manager.precommit(&mut ctx, &mut log_buffer).unwrap();
            black_box(outcome)
        });
    });
    manager.shutdown().unwrap();
}

criterion_group!(benches, bench_readwrite_commit, bench_readonly_commit);
criterion_main!(benches);
