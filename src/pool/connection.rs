use super::blocking::Shared;
use super::factory::Transport;
use crate::utils::error::{PoolError, Result};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::{sleep, timeout, Sleep};

/// A transport as the pool stores it, with usage metadata.
pub(crate) struct IdleConn<T> {
    /// `None` once the transport has been closed
    transport: Option<T>,
    id: u64,
    usable: bool,
    created_at: Instant,
    last_access: Instant,
}

impl<T> IdleConn<T> {
    pub(crate) fn new(transport: T, id: u64) -> Self {
        let now = Instant::now();
        Self {
            transport: Some(transport),
            id,
            usable: true,
            created_at: now,
            last_access: now,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_usable(&self) -> bool {
        self.usable && self.transport.is_some()
    }

    pub(crate) fn is_expired(&self, idle_timeout: Duration) -> bool {
        self.last_access.elapsed() > idle_timeout
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_access.elapsed()
    }

    /// Mark the connection dead and hand out its transport, if still open.
    pub(crate) fn take_transport(&mut self) -> Option<T> {
        self.usable = false;
        self.transport.take()
    }

    fn transport_mut(&mut self) -> io::Result<&mut T> {
        self.transport.as_mut().ok_or_else(not_connected)
    }

    fn record<R>(&mut self, result: &io::Result<R>) {
        match result {
            Ok(_) => self.last_access = Instant::now(),
            Err(_) => self.usable = false,
        }
    }
}

/// A connection borrowed from a [`Pool`](super::Pool).
///
/// Reads and writes go straight to the transport. Any I/O error, a timeout,
/// or end-of-stream marks the connection unusable; successful operations
/// refresh its last-access time. The I/O timeout applies both to the async
/// methods here and to the [`AsyncRead`]/[`AsyncWrite`] impls, where it
/// bounds how long one read or one write may stay pending.
///
/// Dropping the handle has the same effect as [`close`](Self::close): a
/// healthy connection goes back to the pool and an unusable one is closed,
/// freeing its slot for a fresh dial.
pub struct PooledConnection<T: Transport> {
    conn: Option<IdleConn<T>>,
    shared: Arc<Shared<T>>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

#[derive(Clone, Copy)]
enum Direction {
    Read,
    Write,
}

impl<T: Transport> PooledConnection<T> {
    pub(crate) fn new(conn: IdleConn<T>, shared: Arc<Shared<T>>) -> Self {
        Self {
            conn: Some(conn),
            shared,
            read_deadline: None,
            write_deadline: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.conn.as_ref().map_or(0, IdleConn::id)
    }

    pub fn is_usable(&self) -> bool {
        self.conn.as_ref().is_some_and(IdleConn::is_usable)
    }

    /// Force the connection to be closed instead of reused when returned.
    pub fn mark_unusable(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.usable = false;
        }
    }

    pub fn last_access(&self) -> Option<Instant> {
        self.conn.as_ref().map(|conn| conn.last_access)
    }

    pub fn created_at(&self) -> Option<Instant> {
        self.conn.as_ref().map(|conn| conn.created_at)
    }

    /// Borrow the underlying transport without access tracking.
    pub fn get_ref(&self) -> Option<&T> {
        self.conn.as_ref().and_then(|conn| conn.transport.as_ref())
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let io_timeout = self.shared.config().io_timeout();
        let conn = self.conn_mut()?;
        let transport = conn.transport_mut()?;

        let result = with_timeout(io_timeout, transport.read(buf)).await;
        conn.record(&result);
        if matches!(result, Ok(0)) && !buf.is_empty() {
            conn.usable = false;
        }
        result
    }

    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let io_timeout = self.shared.config().io_timeout();
        let conn = self.conn_mut()?;
        let transport = conn.transport_mut()?;

        let result = with_timeout(io_timeout, transport.write(buf)).await;
        conn.record(&result);
        result
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let io_timeout = self.shared.config().io_timeout();
        let conn = self.conn_mut()?;
        let transport = conn.transport_mut()?;

        let result = with_timeout(io_timeout, transport.write_all(buf)).await;
        conn.record(&result);
        result
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        let io_timeout = self.shared.config().io_timeout();
        let conn = self.conn_mut()?;
        let transport = conn.transport_mut()?;

        let result = with_timeout(io_timeout, transport.flush()).await;
        conn.record(&result);
        result
    }

    /// Return the connection to its pool, or close it if it is unusable.
    ///
    /// A pool that has no room for it closes it as well; that is not
    /// reported as an error here. Fails only with `PoolClosed`.
    pub fn close(mut self) -> Result<()> {
        match self.return_to_pool() {
            Err(PoolError::QueueFull) => Ok(()),
            other => other,
        }
    }

    pub(crate) fn return_to_pool(&mut self) -> Result<()> {
        match self.conn.take() {
            Some(conn) => self.shared.release(conn),
            None => Ok(()),
        }
    }

    pub(crate) fn belongs_to(&self, shared: &Arc<Shared<T>>) -> bool {
        Arc::ptr_eq(&self.shared, shared)
    }

    fn conn_mut(&mut self) -> io::Result<&mut IdleConn<T>> {
        self.conn.as_mut().ok_or_else(not_connected)
    }

    /// Poll one transport operation, arming the direction's deadline while
    /// it is pending. Expiry fails the operation and marks the handle dead.
    fn poll_tracked<R>(
        &mut self,
        cx: &mut Context<'_>,
        direction: Direction,
        op: impl FnOnce(Pin<&mut T>, &mut Context<'_>) -> Poll<io::Result<R>>,
    ) -> Poll<io::Result<R>> {
        let io_timeout = self.shared.config().io_timeout();
        let deadline = match direction {
            Direction::Read => &mut self.read_deadline,
            Direction::Write => &mut self.write_deadline,
        };
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Poll::Ready(Err(not_connected())),
        };
        let transport = match conn.transport_mut() {
            Ok(transport) => transport,
            Err(e) => return Poll::Ready(Err(e)),
        };

        if let Poll::Ready(result) = op(Pin::new(transport), cx) {
            *deadline = None;
            conn.record(&result);
            return Poll::Ready(result);
        }

        let timer = deadline.get_or_insert_with(|| Box::pin(sleep(io_timeout)));
        ready!(timer.as_mut().poll(cx));
        *deadline = None;
        conn.usable = false;
        Poll::Ready(Err(timed_out(io_timeout)))
    }
}

impl<T: Transport> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        // Errors only mean the connection was closed instead of pooled.
        let _ = self.return_to_pool();
    }
}

impl<T: Transport> AsyncRead for PooledConnection<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let wanted = buf.remaining();
        let before = buf.filled().len();

        let result = ready!(this.poll_tracked(cx, Direction::Read, |transport, cx| {
            transport.poll_read(cx, buf)
        }));
        if result.is_ok() && wanted > 0 && buf.filled().len() == before {
            this.mark_unusable();
        }
        Poll::Ready(result)
    }
}

impl<T: Transport> AsyncWrite for PooledConnection<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut()
            .poll_tracked(cx, Direction::Write, |transport, cx| {
                transport.poll_write(cx, buf)
            })
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut()
            .poll_tracked(cx, Direction::Write, |transport, cx| transport.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // A half-closed stream can't be handed to the next borrower.
        this.mark_unusable();
        this.poll_tracked(cx, Direction::Write, |transport, cx| {
            transport.poll_shutdown(cx)
        })
    }
}

impl<T: Transport> fmt::Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id())
            .field("usable", &self.is_usable())
            .finish()
    }
}

async fn with_timeout<R>(
    limit: Duration,
    op: impl Future<Output = io::Result<R>>,
) -> io::Result<R> {
    match timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => Err(timed_out(limit)),
    }
}

fn timed_out(limit: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("I/O on pooled connection timed out after {:?}", limit),
    )
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "pooled connection is closed")
}
