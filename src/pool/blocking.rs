use super::connection::{IdleConn, PooledConnection};
use super::factory::{tcp_factory, Factory, Transport};
#[cfg(feature = "metrics")]
use super::metrics::{self, PoolMetrics};
use crate::config::{PoolConfig, ReturnPolicy};
use crate::queue::{BoundedQueue, Drained, QueueError, Rejected, Slot};
use crate::utils::error::{PoolError, Result};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(3);

/// State swapped as a unit under the pool lock.
struct State<T> {
    config: PoolConfig,
    queue: Arc<BoundedQueue<IdleConn<T>>>,
    closed: bool,
}

/// Everything a pool and its borrowed connections share.
pub(crate) struct Shared<T: Transport> {
    address: String,
    factory: Factory<T>,
    /// Read-held by acquire/release/sweep, write-held to swap the queue or close
    state: RwLock<State<T>>,
    live: AtomicUsize,
    next_id: AtomicU64,
    sweep_cancel: CancellationToken,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> Shared<T> {
    pub(crate) fn config(&self) -> PoolConfig {
        self.state.read().config.clone()
    }

    fn snapshot(&self) -> Result<(Arc<BoundedQueue<IdleConn<T>>>, PoolConfig)> {
        let state = self.state.read();
        if state.closed {
            return Err(PoolError::PoolClosed);
        }
        Ok((Arc::clone(&state.queue), state.config.clone()))
    }

    async fn acquire(self: &Arc<Self>) -> Result<PooledConnection<T>> {
        let started = Instant::now();
        let mut wait_limit = None;

        loop {
            let (queue, config) = self.snapshot()?;
            // One deadline across retries, fixed by the config seen first.
            let limit = *wait_limit.get_or_insert_with(|| config.acquire_timeout());
            let remaining = limit.saturating_sub(started.elapsed());

            let slot = match queue.acquire(remaining).await {
                Ok(slot) => slot,
                Err(QueueError::Timeout) => {
                    #[cfg(feature = "metrics")]
                    PoolMetrics::acquire_timed_out();
                    debug!(address = %self.address, ?limit, "Timed out waiting for a connection");
                    return Err(PoolError::AcquireTimeout(limit));
                }
                Err(_) => {
                    // Closed by a resize or by shutdown; the snapshot tells which.
                    trace!(address = %self.address, "Connection queue replaced while waiting");
                    continue;
                }
            };

            let reservation = SlotReservation::new(self);

            if let Slot::Item(mut conn) = slot {
                if !conn.is_usable() {
                    self.destroy(&mut conn, "unusable");
                } else if conn.is_expired(config.idle_timeout()) {
                    self.destroy(&mut conn, "idle");
                } else {
                    reservation.disarm();
                    trace!(id = conn.id(), "Reusing pooled connection");
                    return Ok(PooledConnection::new(conn, Arc::clone(self)));
                }
            }

            // Virtual slot or dead connection: replace it with a fresh one.
            // A failed dial drops the reservation, which returns the slot.
            let mut conn = self.dial(&config).await?;
            reservation.disarm();

            // The pool may have been closed while the dial was in flight.
            let state = self.state.read();
            if state.closed {
                drop(state);
                self.destroy(&mut conn, "pool_closed");
                debug!(address = %self.address, "Pool closed during dial, discarding connection");
                return Err(PoolError::PoolClosed);
            }
            return Ok(PooledConnection::new(conn, Arc::clone(self)));
        }
    }

    async fn dial(&self, config: &PoolConfig) -> Result<IdleConn<T>> {
        let dial_timeout = config.dial_timeout();
        let attempt = (self.factory)(self.address.clone(), dial_timeout);

        let transport = match timeout(dial_timeout, attempt).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(source)) => return Err(self.dial_failed(source)),
            Err(_) => {
                return Err(self.dial_failed(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial timed out after {:?}", dial_timeout),
                )))
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let live = self.live.fetch_add(1, Ordering::AcqRel) + 1;
        #[cfg(feature = "metrics")]
        PoolMetrics::connection_opened();
        debug!(address = %self.address, id, live, "Opened pooled connection");

        Ok(IdleConn::new(transport, id))
    }

    fn dial_failed(&self, source: std::io::Error) -> PoolError {
        #[cfg(feature = "metrics")]
        PoolMetrics::dial_failed();
        warn!(address = %self.address, error = %source, "Failed to open pooled connection");
        PoolError::DialFailure {
            address: self.address.clone(),
            source,
        }
    }

    /// Close the transport in place. Safe to call on an already closed one.
    fn destroy(&self, conn: &mut IdleConn<T>, reason: &'static str) {
        if let Some(transport) = conn.take_transport() {
            drop(transport);
            let live = self.live.fetch_sub(1, Ordering::AcqRel) - 1;
            #[cfg(feature = "metrics")]
            PoolMetrics::connection_destroyed(reason);
            debug!(id = conn.id(), reason, live, "Closed pooled connection");
        }
    }

    /// Put back a unit of capacity that has no connection behind it.
    fn return_slot(&self) {
        let state = self.state.read();
        if state.closed {
            return;
        }
        if let Err(e) = state.queue.release_slot() {
            // Expected after a shrink while connections were borrowed.
            debug!(error = %e, "Dropped a returned capacity slot");
        }
    }

    pub(crate) fn release(&self, mut conn: IdleConn<T>) -> Result<()> {
        let state = self.state.read();

        if state.closed {
            self.destroy(&mut conn, "pool_closed");
            return Err(PoolError::PoolClosed);
        }

        if !conn.is_usable() {
            self.destroy(&mut conn, "unusable");
            if let Err(e) = state.queue.release_slot() {
                debug!(error = %e, "Dropped a returned capacity slot");
            }
            return Ok(());
        }

        let id = conn.id();
        let pushed = match state.config.return_policy {
            ReturnPolicy::StackOrder => state.queue.release_at_tail(conn),
            ReturnPolicy::QueueOrder => state.queue.release_at_head(conn),
        };

        match pushed {
            Ok(()) => {
                trace!(id, "Returned connection to pool");
                Ok(())
            }
            Err(Rejected { mut item, reason }) => {
                debug!(id, %reason, "Pool refused returned connection, closing it");
                self.destroy(&mut item, "rejected");
                match reason {
                    QueueError::Closed => Err(PoolError::PoolClosed),
                    _ => Err(PoolError::QueueFull),
                }
            }
        }
    }

    /// Invalidate queued connections idle for longer than the idle timeout.
    ///
    /// They stay queued; `acquire` replaces them when it pops them.
    fn reap_idle(&self) -> usize {
        let state = self.state.read();
        if state.closed {
            return 0;
        }

        let idle_timeout = state.config.idle_timeout();
        let mut reaped = 0;
        state.queue.walk(|conn| {
            if conn.is_usable() && conn.is_expired(idle_timeout) {
                trace!(id = conn.id(), idle = ?conn.idle_for(), "Connection idle too long");
                self.destroy(conn, "idle");
                reaped += 1;
            }
        });

        if reaped > 0 {
            debug!(address = %self.address, reaped, "Idle sweep invalidated connections");
        }
        reaped
    }

    /// Build a replacement queue of `max_capacity` from `old`.
    ///
    /// Capacity checked out of the old queue stays reserved in the new one,
    /// so connections borrowed before the swap can come back. Healthy queued
    /// connections move over while there is room, tail first; the rest are
    /// closed. Waiters on the old gate wake up and retry on the new one.
    fn rebuild_queue(
        &self,
        old: &BoundedQueue<IdleConn<T>>,
        max_capacity: usize,
    ) -> Arc<BoundedQueue<IdleConn<T>>> {
        let Drained { items, checked_out } = old.close();
        let room = max_capacity - checked_out.min(max_capacity);

        let mut healthy = Vec::with_capacity(items.len());
        for mut conn in items {
            if conn.is_usable() {
                healthy.push(conn);
            } else {
                self.destroy(&mut conn, "unusable");
            }
        }

        let surplus = healthy.len().saturating_sub(room);
        let mut healthy = healthy.into_iter();
        for mut conn in healthy.by_ref().take(surplus) {
            self.destroy(&mut conn, "resize");
        }
        let kept: Vec<_> = healthy.collect();

        let queue = Arc::new(BoundedQueue::new(max_capacity, room - kept.len()));
        let migrated = kept.len();
        for conn in kept {
            if let Err(Rejected { mut item, .. }) = queue.release_at_tail(conn) {
                self.destroy(&mut item, "resize");
            }
        }

        info!(
            address = %self.address,
            old_capacity = old.capacity(),
            new_capacity = max_capacity,
            borrowed = checked_out,
            migrated,
            closed = surplus,
            "Connection pool resized"
        );
        queue
    }

    fn shutdown(&self) -> Option<JoinHandle<()>> {
        let mut state = self.state.write();
        if state.closed {
            return self.sweep_handle.lock().take();
        }
        state.closed = true;
        self.sweep_cancel.cancel();

        let Drained { items, checked_out } = state.queue.close();
        drop(state);

        let closed = items.len();
        for mut conn in items {
            self.destroy(&mut conn, "pool_closed");
        }

        info!(address = %self.address, closed, borrowed = checked_out, "Connection pool closed");
        self.sweep_handle.lock().take()
    }
}

/// Capacity taken from the gate that must go back unless a connection is
/// handed out. Covers dial failures and callers dropping `acquire` midway.
struct SlotReservation<'a, T: Transport> {
    shared: &'a Shared<T>,
    armed: bool,
}

impl<'a, T: Transport> SlotReservation<'a, T> {
    fn new(shared: &'a Shared<T>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T: Transport> Drop for SlotReservation<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.return_slot();
        }
    }
}

fn sweep_interval(idle_timeout: Duration) -> Duration {
    (idle_timeout / 2).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
}

fn spawn_sweeper<T: Transport>(shared: &Arc<Shared<T>>) -> JoinHandle<()> {
    let weak: Weak<Shared<T>> = Arc::downgrade(shared);
    let cancel = shared.sweep_cancel.clone();

    tokio::spawn(async move {
        loop {
            let interval = match weak.upgrade() {
                Some(shared) => sweep_interval(shared.config().idle_timeout()),
                None => break,
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match weak.upgrade() {
                Some(shared) => {
                    shared.reap_idle();
                }
                None => break,
            }
        }
        debug!("Idle sweep stopped");
    })
}

/// Snapshot returned by [`Pool::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open transports, idle and borrowed
    pub live: usize,
    /// Connections sitting in the queue, including ones invalidated but not yet popped
    pub idle: usize,
    /// Gate tokens: how many `acquire` calls can proceed without waiting
    pub available: usize,
    pub max_capacity: usize,
    pub closed: bool,
}

impl PoolStatus {
    /// Capacity reserved with no connection created yet
    pub fn virtual_slots(&self) -> usize {
        self.available.saturating_sub(self.idle)
    }

    /// Capacity currently held by borrowers
    pub fn borrowed(&self) -> usize {
        self.max_capacity.saturating_sub(self.available)
    }
}

/// Closes the pool when the last [`Pool`] clone goes away.
struct PoolInner<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Drop for PoolInner<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.shared.shutdown() {
            handle.abort();
        }
    }
}

/// Bounded pool of connections to a single address.
///
/// At most `max_capacity` transports are open at any time. `acquire` hands
/// out an idle connection when one is queued and dials a new one when the
/// pool still has unused capacity; otherwise it waits up to the acquire
/// timeout for a borrower to return one.
///
/// Idle connections are checked by a background sweep and invalidated in
/// place: a dead connection keeps its queue position until `acquire` pops
/// it and dials a replacement. Under [`ReturnPolicy::StackOrder`] a dead
/// connection deep in the queue can stay there for as long as the pool is
/// never drained that far.
pub struct Pool<T: Transport = TcpStream> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Transport> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Pool<TcpStream> {
    /// Create a pool of plain TCP connections to `address`.
    pub async fn connect(address: impl Into<String>, config: PoolConfig) -> Result<Self> {
        Self::new(address, config, tcp_factory()).await
    }
}

impl<T: Transport> Pool<T> {
    /// Create a pool that dials with `factory`.
    ///
    /// Unset config fields take their defaults. `initial_capacity`
    /// connections are dialed before this returns; any failure there fails
    /// construction.
    pub async fn new(
        address: impl Into<String>,
        config: PoolConfig,
        factory: Factory<T>,
    ) -> Result<Self> {
        let config = config.with_defaults();
        config.validate()?;

        #[cfg(feature = "metrics")]
        metrics::init();

        let address = address.into();
        let queue = Arc::new(BoundedQueue::new(
            config.max_capacity,
            config.max_capacity - config.initial_capacity,
        ));

        let shared = Arc::new(Shared {
            address,
            factory,
            state: RwLock::new(State {
                config: config.clone(),
                queue: Arc::clone(&queue),
                closed: false,
            }),
            live: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            sweep_cancel: CancellationToken::new(),
            sweep_handle: Mutex::new(None),
        });

        for _ in 0..config.initial_capacity {
            let conn = match shared.dial(&config).await {
                Ok(conn) => conn,
                Err(e) => {
                    shared.shutdown();
                    return Err(e);
                }
            };
            if let Err(Rejected { mut item, .. }) = queue.release_at_head(conn) {
                shared.destroy(&mut item, "rejected");
            }
        }

        *shared.sweep_handle.lock() = Some(spawn_sweeper(&shared));

        info!(
            address = %shared.address,
            initial = config.initial_capacity,
            max = config.max_capacity,
            policy = ?config.return_policy,
            "Connection pool created"
        );

        Ok(Self {
            inner: Arc::new(PoolInner { shared }),
        })
    }

    fn shared(&self) -> &Arc<Shared<T>> {
        &self.inner.shared
    }

    /// Borrow a connection, waiting up to the acquire timeout for capacity.
    pub async fn acquire(&self) -> Result<PooledConnection<T>> {
        #[cfg(feature = "metrics")]
        let started = Instant::now();

        let result = self.shared().acquire().await;

        #[cfg(feature = "metrics")]
        PoolMetrics::observe_acquire(started.elapsed().as_secs_f64());
        result
    }

    /// Return a borrowed connection.
    ///
    /// A healthy connection is queued according to the return policy; an
    /// unusable one is closed and its capacity freed for a later dial.
    /// Fails with `PoolClosed` after [`close`](Self::close), and with
    /// `QueueFull` if the pool had no room for it; the connection is closed
    /// in both cases.
    pub fn release(&self, mut conn: PooledConnection<T>) -> Result<()> {
        if !conn.belongs_to(self.shared()) {
            warn!("Connection released to a pool that did not issue it");
        }
        conn.return_to_pool()
    }

    /// Apply a new configuration.
    ///
    /// Only non-zero fields that differ from the current values are taken.
    /// Changing `max_capacity` swaps in a queue of the new size. Returns
    /// whether anything changed.
    pub fn update_config(&self, incoming: &PoolConfig) -> Result<bool> {
        let shared = self.shared();
        let mut state = shared.state.write();
        if state.closed {
            return Err(PoolError::PoolClosed);
        }

        let (merged, changed) = state.config.merge(incoming);
        if !changed {
            return Ok(false);
        }

        if merged.max_capacity != state.config.max_capacity {
            let queue = shared.rebuild_queue(&state.queue, merged.max_capacity);
            state.queue = queue;
        }

        debug!(address = %shared.address, config = ?merged, "Pool configuration updated");
        state.config = merged;
        Ok(true)
    }

    pub fn current_config(&self) -> PoolConfig {
        self.shared().config()
    }

    /// Run one idle sweep now. Returns how many connections were invalidated.
    pub fn reap_idle(&self) -> usize {
        self.shared().reap_idle()
    }

    /// Close every queued connection, fail blocked and future `acquire`
    /// calls, and stop the idle sweep. Borrowed connections are closed when
    /// they are returned. Calling it again does nothing.
    pub async fn close(&self) {
        if let Some(handle) = self.shared().shutdown() {
            let _ = handle.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared().state.read().closed
    }

    /// Open transports, idle and borrowed.
    pub fn live_count(&self) -> usize {
        self.shared().live.load(Ordering::Acquire)
    }

    pub fn address(&self) -> &str {
        &self.shared().address
    }

    pub fn status(&self) -> PoolStatus {
        let shared = self.shared();
        let state = shared.state.read();
        PoolStatus {
            live: shared.live.load(Ordering::Acquire),
            idle: state.queue.queued(),
            available: if state.closed {
                0
            } else {
                state.queue.available()
            },
            max_capacity: state.config.max_capacity,
            closed: state.closed,
        }
    }
}

impl<T: Transport> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("address", &self.address())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_interval_is_half_the_idle_timeout_within_bounds() {
        assert_eq!(sweep_interval(Duration::from_millis(100)), Duration::from_millis(50));
        assert_eq!(sweep_interval(Duration::from_millis(1)), MIN_SWEEP_INTERVAL);
        assert_eq!(sweep_interval(Duration::from_secs(60)), MAX_SWEEP_INTERVAL);
    }

    #[test]
    fn status_derives_virtual_and_borrowed_counts() {
        let status = PoolStatus {
            live: 3,
            idle: 1,
            available: 2,
            max_capacity: 4,
            closed: false,
        };
        assert_eq!(status.virtual_slots(), 1);
        assert_eq!(status.borrowed(), 2);
    }

    #[tokio::test]
    async fn sweep_task_stops_when_pool_is_dropped() {
        let factory = crate::pool::factory_fn(|_address, _timeout| async move {
            Ok(tokio::io::duplex(64).0)
        });
        let pool = Pool::new("mem:0", PoolConfig::default(), factory)
            .await
            .unwrap();
        let handle = pool
            .shared()
            .sweep_handle
            .lock()
            .take()
            .expect("sweep task running");

        drop(pool);
        let _ = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweep task exits");
    }
}
