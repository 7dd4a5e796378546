/// Benchmark: Acquire/Release Cycle
///
/// Measures the cost of borrowing and returning a pooled connection, for an
/// uncontended pool and for several tasks sharing a small one. Transports are
/// in-memory duplex streams so only pool overhead is measured.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use netpool::pool::factory_fn;
use netpool::queue::BoundedQueue;
use netpool::{Pool, PoolConfig, ReturnPolicy};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::runtime::Runtime;

fn build_pool(rt: &Runtime, max_capacity: usize, policy: ReturnPolicy) -> Pool<DuplexStream> {
    let factory = factory_fn(|_address, _timeout| async move {
        let (client, server) = tokio::io::duplex(64);
        // Keep the far end open for the lifetime of the bench
        std::mem::forget(server);
        Ok(client)
    });

    rt.block_on(Pool::new(
        "bench:0",
        PoolConfig {
            initial_capacity: max_capacity,
            max_capacity,
            idle_timeout_ms: 600_000,
            return_policy: policy,
            ..Default::default()
        },
        factory,
    ))
    .unwrap()
}

fn bench_uncontended_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("acquire_release");

    for policy in [ReturnPolicy::StackOrder, ReturnPolicy::QueueOrder] {
        let pool = build_pool(&rt, 8, policy);
        group.bench_with_input(
            BenchmarkId::new("uncontended", format!("{:?}", policy)),
            &pool,
            |b, pool| {
                b.to_async(&rt).iter(|| async move {
                    let conn = pool.acquire().await.unwrap();
                    black_box(conn.id());
                    conn.close().unwrap();
                });
            },
        );
    }

    group.finish();
}

fn bench_contended_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let pool = build_pool(&rt, 4, ReturnPolicy::StackOrder);
    let pool = &pool;

    c.bench_function("acquire_release_16_tasks_4_slots", |b| {
        b.to_async(&rt).iter(|| async move {
            let mut tasks = Vec::with_capacity(16);
            for _ in 0..16 {
                let pool = pool.clone();
                tasks.push(tokio::spawn(async move {
                    let conn = pool.acquire().await.unwrap();
                    conn.close().unwrap();
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }
        });
    });
}

fn bench_gate_only(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let queue: BoundedQueue<u64> = BoundedQueue::new(8, 0);
    for i in 0..8 {
        queue.release_at_tail(i).unwrap();
    }

    let queue = &queue;

    c.bench_function("bounded_queue_acquire_release", |b| {
        b.to_async(&rt).iter(|| async move {
            let slot = queue.acquire(Duration::from_secs(1)).await.unwrap();
            if let netpool::queue::Slot::Item(item) = slot {
                queue.release_at_tail(black_box(item)).unwrap();
            }
        });
    });
}

criterion_group!(
    benches,
    bench_uncontended_cycle,
    bench_contended_cycle,
    bench_gate_only
);
criterion_main!(benches);
