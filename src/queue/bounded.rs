use super::deque::Deque;
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::trace;

/// Outcome of a successful [`BoundedQueue::acquire`].
#[derive(Debug, PartialEq, Eq)]
pub enum Slot<T> {
    /// A queued item was popped from the tail.
    Item(T),
    /// A unit of capacity was reserved but nothing was queued behind it.
    /// The caller is expected to create the item itself.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("timed out waiting for a queue slot")]
    Timeout,

    #[error("queue gate is full")]
    Full,

    #[error("queue is closed")]
    Closed,
}

/// A push that the queue refused, carrying the item back to the caller.
pub struct Rejected<T> {
    pub item: T,
    pub reason: QueueError,
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

/// Everything a closed queue leaves behind.
#[derive(Debug)]
pub struct Drained<T> {
    /// Items that were still queued, head first
    pub items: Vec<T>,
    /// Tokens that were checked out when the gate closed
    pub checked_out: usize,
}

#[derive(Debug)]
struct GateCount {
    tokens: usize,
    closed: bool,
}

/// Deque gated by a counting semaphore.
///
/// A gate token stands for one unit of capacity that is available to the
/// next `acquire`, whether or not an item backs it. Tokens are counted under
/// `count` so that `tokens <= capacity` holds at every instant; the
/// semaphore only provides the waiting.
pub struct BoundedQueue<T> {
    gate: Semaphore,
    count: Mutex<GateCount>,
    items: Deque<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue of `capacity` whose gate already holds
    /// `virtual_slots` tokens with no items behind them.
    pub fn new(capacity: usize, virtual_slots: usize) -> Self {
        let virtual_slots = virtual_slots.min(capacity);

        Self {
            gate: Semaphore::new(virtual_slots),
            count: Mutex::new(GateCount {
                tokens: virtual_slots,
                closed: false,
            }),
            items: Deque::new(Some(capacity)),
            capacity,
        }
    }

    /// Wait up to `wait` for a gate token, then pop the tail.
    ///
    /// `Slot::Empty` is a normal outcome: the gate had a token that no item
    /// was backing.
    pub async fn acquire(&self, wait: Duration) -> Result<Slot<T>, QueueError> {
        let permit = match timeout(wait, self.gate.acquire()).await {
            Err(_) => return Err(QueueError::Timeout),
            Ok(Err(_)) => return Err(QueueError::Closed),
            Ok(Ok(permit)) => permit,
        };

        let mut count = self.count.lock();
        if count.closed {
            return Err(QueueError::Closed);
        }
        permit.forget();
        count.tokens -= 1;

        match self.items.pop_back() {
            Some(item) => Ok(Slot::Item(item)),
            None => {
                trace!(tokens = count.tokens, "Gate token had no queued item");
                Ok(Slot::Empty)
            }
        }
    }

    /// Return a token and push `item` to the tail.
    pub fn release_at_tail(&self, item: T) -> Result<(), Rejected<T>> {
        self.release_with(item, |items, item| items.push_back(item))
    }

    /// Return a token and push `item` to the head.
    pub fn release_at_head(&self, item: T) -> Result<(), Rejected<T>> {
        self.release_with(item, |items, item| items.push_front(item))
    }

    /// Return a token without an item, re-creating a virtual slot.
    pub fn release_slot(&self) -> Result<(), QueueError> {
        let mut count = self.count.lock();
        if count.closed {
            return Err(QueueError::Closed);
        }
        if count.tokens >= self.capacity {
            return Err(QueueError::Full);
        }
        count.tokens += 1;
        self.gate.add_permits(1);
        Ok(())
    }

    fn release_with<F>(&self, item: T, push: F) -> Result<(), Rejected<T>>
    where
        F: FnOnce(&Deque<T>, T) -> Result<(), T>,
    {
        let mut count = self.count.lock();
        if count.closed {
            return Err(Rejected {
                item,
                reason: QueueError::Closed,
            });
        }
        if count.tokens >= self.capacity {
            return Err(Rejected {
                item,
                reason: QueueError::Full,
            });
        }
        if let Err(item) = push(&self.items, item) {
            return Err(Rejected {
                item,
                reason: QueueError::Full,
            });
        }
        count.tokens += 1;
        self.gate.add_permits(1);
        Ok(())
    }

    /// Visit queued items head to tail without removing them.
    pub fn walk<F>(&self, visitor: F)
    where
        F: FnMut(&mut T),
    {
        self.items.walk(visitor);
    }

    /// Close the gate and hand back whatever was queued.
    ///
    /// Waiters blocked in `acquire` wake with `QueueError::Closed`, and every
    /// later call fails the same way. Closing twice returns nothing the
    /// second time.
    pub fn close(&self) -> Drained<T> {
        let checked_out = {
            let mut count = self.count.lock();
            if count.closed {
                return Drained {
                    items: Vec::new(),
                    checked_out: 0,
                };
            }
            count.closed = true;
            self.gate.close();
            self.capacity - count.tokens
        };

        Drained {
            items: self.items.drain(),
            checked_out,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.count.lock().closed
    }

    /// Tokens currently in the gate (queued items plus virtual slots)
    pub fn available(&self) -> usize {
        self.count.lock().tokens
    }

    /// Real items currently queued
    pub fn queued(&self) -> usize {
        self.items.len()
    }

    /// Tokens currently held by callers
    pub fn checked_out(&self) -> usize {
        self.capacity - self.available()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.count.lock();
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("tokens", &count.tokens)
            .field("closed", &count.closed)
            .finish()
    }
}
