//! Capacity-gated queue the pool stores idle connections in.

mod bounded;
mod deque;

pub use bounded::{BoundedQueue, Drained, QueueError, Rejected, Slot};
pub use deque::Deque;
