use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge,
};

lazy_static! {
    pub static ref LIVE_CONNECTIONS: IntGauge = register_int_gauge!(
        "netpool_live_connections",
        "Pooled transports currently open (idle and borrowed) across all pools"
    )
    .expect("register netpool_live_connections gauge");
    pub static ref DIALS: IntCounter = register_int_counter!(
        "netpool_dials_total",
        "Connections successfully created by a pool factory"
    )
    .expect("register netpool_dials_total counter");
    pub static ref DIAL_FAILURES: IntCounter = register_int_counter!(
        "netpool_dial_failures_total",
        "Factory calls that failed or timed out"
    )
    .expect("register netpool_dial_failures_total counter");
    pub static ref ACQUIRE_TIMEOUTS: IntCounter = register_int_counter!(
        "netpool_acquire_timeouts_total",
        "Acquire calls that gave up waiting for capacity"
    )
    .expect("register netpool_acquire_timeouts_total counter");
    pub static ref DESTROYED: IntCounterVec = register_int_counter_vec!(
        "netpool_destroyed_total",
        "Transports closed by the pool, by reason",
        &["reason"]
    )
    .expect("register netpool_destroyed_total counter vec");
    pub static ref ACQUIRE_WAIT: Histogram = register_histogram!(HistogramOpts::new(
        "netpool_acquire_wait_seconds",
        "Time spent inside acquire, dialing included"
    )
    .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 3.0, 10.0]))
    .expect("register netpool_acquire_wait_seconds histogram");
}

#[derive(Debug, Clone, Copy)]
pub struct PoolMetrics;

impl PoolMetrics {
    #[inline]
    pub fn connection_opened() {
        DIALS.inc();
        LIVE_CONNECTIONS.inc();
    }

    #[inline]
    pub fn connection_destroyed(reason: &str) {
        DESTROYED.with_label_values(&[reason]).inc();
        LIVE_CONNECTIONS.dec();
    }

    #[inline]
    pub fn dial_failed() {
        DIAL_FAILURES.inc();
    }

    #[inline]
    pub fn acquire_timed_out() {
        ACQUIRE_TIMEOUTS.inc();
    }

    #[inline]
    pub fn observe_acquire(duration_secs: f64) {
        ACQUIRE_WAIT.observe(duration_secs);
    }
}

#[inline]
pub fn init() {
    lazy_static::initialize(&LIVE_CONNECTIONS);
    lazy_static::initialize(&DIALS);
    lazy_static::initialize(&DIAL_FAILURES);
    lazy_static::initialize(&ACQUIRE_TIMEOUTS);
    lazy_static::initialize(&DESTROYED);
    lazy_static::initialize(&ACQUIRE_WAIT);
}
