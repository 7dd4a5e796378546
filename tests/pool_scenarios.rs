/// Connection Pool Lifecycle Scenarios
///
/// Eager vs lazy creation, reuse order, acquire timeout and idle invalidation,
/// driven through in-memory duplex transports so every dial is counted.
use netpool::pool::{factory_fn, Factory};
use netpool::{Pool, PoolConfig, PoolError, ReturnPolicy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::DuplexStream;

/// Factory handing out duplex streams whose far end echoes everything back
fn echo_factory(dials: Arc<AtomicUsize>) -> Factory<DuplexStream> {
    factory_fn(move |_address, _timeout| {
        let dials = Arc::clone(&dials);
        async move {
            dials.fetch_add(1, Ordering::SeqCst);
            let (client, server) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let (mut reader, mut writer) = tokio::io::split(server);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
            Ok(client)
        }
    })
}

async fn echo_pool(config: PoolConfig) -> (Pool<DuplexStream>, Arc<AtomicUsize>) {
    let dials = Arc::new(AtomicUsize::new(0));
    let pool = Pool::new("echo:7", config, echo_factory(Arc::clone(&dials)))
        .await
        .unwrap();
    (pool, dials)
}

#[tokio::test]
async fn eager_connections_are_handed_out_before_dialing() {
    let (pool, dials) = echo_pool(PoolConfig {
        initial_capacity: 3,
        max_capacity: 5,
        ..Default::default()
    })
    .await;
    assert_eq!(dials.load(Ordering::SeqCst), 3);
    assert_eq!(pool.live_count(), 3);

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(pool.acquire().await.unwrap());
    }
    assert_eq!(
        dials.load(Ordering::SeqCst),
        3,
        "eager connections must be reused without dialing"
    );

    held.push(pool.acquire().await.unwrap());
    assert_eq!(dials.load(Ordering::SeqCst), 4, "fourth acquire dials once");
    assert_eq!(pool.live_count(), 4);
}

#[tokio::test]
async fn lazy_dial_then_stack_order_reuse() {
    let (pool, dials) = echo_pool(PoolConfig {
        max_capacity: 2,
        initial_capacity: 0,
        return_policy: ReturnPolicy::StackOrder,
        ..Default::default()
    })
    .await;
    assert_eq!(dials.load(Ordering::SeqCst), 0);

    let conn = pool.acquire().await.unwrap();
    let first_id = conn.id();
    assert_eq!(dials.load(Ordering::SeqCst), 1);

    pool.release(conn).unwrap();

    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.id(), first_id, "released connection should be reused");
    assert_eq!(dials.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn acquire_times_out_on_saturated_pool() {
    let (pool, _dials) = echo_pool(PoolConfig {
        max_capacity: 1,
        initial_capacity: 1,
        acquire_timeout_ms: 100,
        ..Default::default()
    })
    .await;

    let _held = pool.acquire().await.unwrap();

    let start = Instant::now();
    let result = pool.acquire().await;
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(PoolError::AcquireTimeout(_))));
    assert!(
        elapsed >= Duration::from_millis(90),
        "returned too early: {:?}",
        elapsed
    );
    assert!(
        elapsed < Duration::from_millis(150),
        "should time out quickly, took {:?}",
        elapsed
    );
}

#[tokio::test]
async fn idle_connection_is_replaced_after_sweep() {
    let (pool, dials) = echo_pool(PoolConfig {
        max_capacity: 1,
        idle_timeout_ms: 50,
        ..Default::default()
    })
    .await;

    let conn = pool.acquire().await.unwrap();
    let first_id = conn.id();
    pool.release(conn).unwrap();
    assert_eq!(dials.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;

    // The sweep closed the transport but left the dead handle queued.
    assert_eq!(pool.live_count(), 0);
    assert_eq!(pool.status().idle, 1);

    let conn = pool.acquire().await.unwrap();
    assert_ne!(conn.id(), first_id);
    assert_eq!(dials.load(Ordering::SeqCst), 2, "expired handle must not be reused");
    assert_eq!(pool.status().idle, 0);
}

#[tokio::test]
async fn queue_order_reuses_oldest_first() {
    let (pool, _dials) = echo_pool(PoolConfig {
        max_capacity: 2,
        return_policy: ReturnPolicy::QueueOrder,
        ..Default::default()
    })
    .await;

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let (a_id, b_id) = (a.id(), b.id());

    pool.release(a).unwrap();
    pool.release(b).unwrap();

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    assert_eq!((first.id(), second.id()), (a_id, b_id));
}

#[tokio::test]
async fn stack_order_reuses_newest_first() {
    let (pool, _dials) = echo_pool(PoolConfig {
        max_capacity: 2,
        return_policy: ReturnPolicy::StackOrder,
        ..Default::default()
    })
    .await;

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let (a_id, b_id) = (a.id(), b.id());

    pool.release(a).unwrap();
    pool.release(b).unwrap();

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    assert_eq!((first.id(), second.id()), (b_id, a_id));
}

#[tokio::test]
async fn dropping_a_connection_returns_it() {
    let (pool, dials) = echo_pool(PoolConfig {
        max_capacity: 1,
        ..Default::default()
    })
    .await;

    let id = {
        let conn = pool.acquire().await.unwrap();
        conn.id()
    };
    assert_eq!(pool.status().idle, 1);

    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.id(), id);
    assert_eq!(dials.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn gate_accounting_holds_through_a_borrow_cycle() {
    let (pool, _dials) = echo_pool(PoolConfig {
        initial_capacity: 1,
        max_capacity: 3,
        ..Default::default()
    })
    .await;

    let status = pool.status();
    assert_eq!(status.available, 3, "gate starts full");
    assert_eq!(status.idle, 1);
    assert_eq!(status.virtual_slots(), 2);

    let mut held = Vec::new();
    for expected_borrowed in 1..=3 {
        held.push(pool.acquire().await.unwrap());
        let status = pool.status();
        assert!(status.available >= status.idle);
        assert_eq!(held.len() + status.available, status.max_capacity);
        assert_eq!(status.borrowed(), expected_borrowed);
    }

    while let Some(conn) = held.pop() {
        conn.close().unwrap();
        let status = pool.status();
        assert!(status.available <= status.max_capacity);
        assert_eq!(held.len() + status.available, status.max_capacity);
    }

    let status = pool.status();
    assert_eq!(status.idle, 3);
    assert_eq!(status.live, 3);
}

#[tokio::test]
async fn on_demand_reap_leaves_dead_handles_queued() {
    let (pool, dials) = echo_pool(PoolConfig {
        max_capacity: 2,
        idle_timeout_ms: 60_000,
        ..Default::default()
    })
    .await;

    let conn = pool.acquire().await.unwrap();
    pool.release(conn).unwrap();

    // Zero fields leave the current values alone.
    let shorter_idle = PoolConfig {
        initial_capacity: 0,
        max_capacity: 0,
        idle_timeout_ms: 1,
        acquire_timeout_ms: 0,
        io_timeout_ms: 0,
        dial_timeout_ms: 0,
        return_policy: ReturnPolicy::StackOrder,
    };
    assert!(pool.update_config(&shorter_idle).unwrap());
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(pool.reap_idle(), 1);
    assert_eq!(pool.reap_idle(), 0, "a dead handle is only reaped once");
    assert_eq!(pool.live_count(), 0);
    assert_eq!(pool.status().idle, 1);

    let _conn = pool.acquire().await.unwrap();
    assert_eq!(dials.load(Ordering::SeqCst), 2);
}
