use parking_lot::Mutex;
use std::collections::VecDeque;

/// Double-ended queue with an optional capacity limit.
///
/// Every operation takes the same exclusive lock, so a `walk` always sees a
/// stable snapshot and may mutate elements in place.
#[derive(Debug)]
pub struct Deque<T> {
    items: Mutex<VecDeque<T>>,
    /// `None` means unlimited
    capacity: Option<usize>,
}

impl<T> Deque<T> {
    pub fn new(capacity: Option<usize>) -> Self {
        let items = match capacity {
            Some(cap) => VecDeque::with_capacity(cap),
            None => VecDeque::new(),
        };

        Self {
            items: Mutex::new(items),
            capacity,
        }
    }

    /// Insert at the tail, handing the item back if the deque is full.
    pub fn push_back(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if self.is_full(&items) {
            return Err(item);
        }
        items.push_back(item);
        Ok(())
    }

    /// Insert at the head, handing the item back if the deque is full.
    pub fn push_front(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if self.is_full(&items) {
            return Err(item);
        }
        items.push_front(item);
        Ok(())
    }

    pub fn pop_back(&self) -> Option<T> {
        self.items.lock().pop_back()
    }

    /// Visit every element from head to tail without removing any.
    pub fn walk<F>(&self, mut visitor: F)
    where
        F: FnMut(&mut T),
    {
        let mut items = self.items.lock();
        for item in items.iter_mut() {
            visitor(item);
        }
    }

    /// Remove every element, head first.
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn is_full(&self, items: &VecDeque<T>) -> bool {
        matches!(self.capacity, Some(cap) if items.len() >= cap)
    }
}
