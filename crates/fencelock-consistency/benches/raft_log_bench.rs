// Benchmarks for the Raft log and lock command codec
// Measures append throughput, suffix reads and payload encoding

use std::hint::black_box;

use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use fencelock_consistency::raft::{EntryType, LockCommand, LogEntry, RaftLog};

fn command(i: u64) -> LockCommand {
    LockCommand {
        lock_id: format!("orders/{}", i % 64),
        client_id: format!("client-{}", i),
        region_id: "us-east".to_string(),
        fencing_token: i,
        timeout_ms: 30_000,
        expires_at: 1_700_000_030_000,
    }
}

fn bench_append(c: &mut Criterion) {
    c.bench_function("raft_log_append_1000", |b| {
        b.iter_batched(
            RaftLog::new,
            |log| {
                for i in 1..=1000 {
                    log.append(LogEntry::noop(i, 1)).unwrap();
                }
                black_box(log.last_index())
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_get_from(c: &mut Criterion) {
    let log = RaftLog::new();
    let payload = command(1).encode().unwrap();
    for i in 1..=10_000 {
        log.append(LogEntry::new(i, 1, EntryType::AcquireLock, payload.clone()))
            .unwrap();
    }

    let mut group = c.benchmark_group("raft_log_get_range");
    for batch in [1u64, 64, 300] {
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| black_box(log.get_range(9_000, 9_000 + batch)))
        });
    }
    group.finish();
}

fn bench_command_codec(c: &mut Criterion) {
    let cmd = command(42);
    let bytes = cmd.encode().unwrap();

    c.bench_function("lock_command_encode", |b| {
        b.iter(|| black_box(cmd.encode().unwrap()))
    });
    c.bench_function("lock_command_decode", |b| {
        b.iter(|| black_box(LockCommand::decode(&bytes).unwrap()))
    });
}

criterion_group!(benches, bench_append, bench_get_from, bench_command_codec);
criterion_main!(benches);
