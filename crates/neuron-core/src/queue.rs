//! Bounded double-ended queue
//!
//! A thread-safe deque with a fixed capacity. Pushing onto a full queue evicts
//! the front element, unshifting onto a full queue evicts the back element, so
//! the length never exceeds the capacity. Every element is tagged with a stable
//! [`Handle`] that stays valid until the element leaves the queue, which lets
//! callers delete or mutate an element found by an earlier lookup.

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::DEFAULT_QUEUE_CAPACITY;

/// Stable reference to an element of a [`BoundedQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<(u64, T)>,
    next_id: u64,
    max_len: usize,
}

impl<T> Inner<T> {
    fn position(&self, handle: Handle) -> Option<usize> {
        self.items.iter().position(|(id, _)| *id == handle.0)
    }

    fn issue(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }
}

/// Bounded, thread-safe double-ended queue
#[derive(Debug)]
pub struct BoundedQueue<T> {
    inner: RwLock<Inner<T>>,
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BoundedQueue<T> {
    /// Create a queue with the default capacity (2^30)
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a queue holding at most `max_len` elements (at least one)
    pub fn with_capacity(max_len: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                items: VecDeque::new(),
                next_id: 0,
                max_len: max_len.max(1),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<T>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<T>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append at the back, evicting the front when full
    ///
    /// `None` is ignored and returns `None`.
    pub fn push(&self, item: impl Into<Option<T>>) -> Option<Handle> {
        let item = item.into()?;
        let mut inner = self.write();
        if inner.items.len() >= inner.max_len {
            inner.items.pop_front();
        }
        let id = inner.issue();
        inner.items.push_back((id, item));
        Some(Handle(id))
    }

    /// Prepend at the front, evicting the back when full
    pub fn unshift(&self, item: impl Into<Option<T>>) -> Option<Handle> {
        let item = item.into()?;
        let mut inner = self.write();
        if inner.items.len() >= inner.max_len {
            inner.items.pop_back();
        }
        let id = inner.issue();
        inner.items.push_front((id, item));
        Some(Handle(id))
    }

    /// Remove and return the back element
    pub fn pop(&self) -> Option<T> {
        self.write().items.pop_back().map(|(_, item)| item)
    }

    /// Remove and return the front element
    pub fn shift(&self) -> Option<T> {
        self.write().items.pop_front().map(|(_, item)| item)
    }

    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().items.is_empty()
    }

    /// Handle of the front element
    pub fn front(&self) -> Option<Handle> {
        self.read().items.front().map(|(id, _)| Handle(*id))
    }

    /// Handle of the back element
    pub fn back(&self) -> Option<Handle> {
        self.read().items.back().map(|(id, _)| Handle(*id))
    }

    /// Handles of all elements, front to back
    pub fn handles(&self) -> Vec<Handle> {
        self.read().items.iter().map(|(id, _)| Handle(*id)).collect()
    }

    /// Remove the element behind `handle`, if it is still queued
    pub fn delete(&self, handle: Handle) -> Option<T> {
        let mut inner = self.write();
        let index = inner.position(handle)?;
        inner.items.remove(index).map(|(_, item)| item)
    }

    /// Handle of the first element matching `predicate`
    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<Handle> {
        self.read()
            .items
            .iter()
            .find(|(_, item)| predicate(item))
            .map(|(id, _)| Handle(*id))
    }

    /// Run `f` on the element behind `handle` under the write lock
    pub fn with_mut<R>(&self, handle: Handle, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut inner = self.write();
        let index = inner.position(handle)?;
        inner.items.get_mut(index).map(|(_, item)| f(item))
    }

    /// Drop every element
    pub fn renew(&self) {
        self.write().items.clear();
    }

    pub fn max_len(&self) -> usize {
        self.read().max_len
    }

    /// Change the capacity, trimming from the front if the queue is now over it
    pub fn set_max_len(&self, max_len: usize) {
        let mut inner = self.write();
        inner.max_len = max_len.max(1);
        while inner.items.len() > inner.max_len {
            inner.items.pop_front();
        }
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Copy of the back element
    pub fn peek_back(&self) -> Option<T> {
        self.read().items.back().map(|(_, item)| item.clone())
    }

    /// Copy of the front element
    pub fn peek_front(&self) -> Option<T> {
        self.read().items.front().map(|(_, item)| item.clone())
    }

    /// Copy of the element behind `handle`
    pub fn get(&self, handle: Handle) -> Option<T> {
        let inner = self.read();
        let index = inner.position(handle)?;
        inner.items.get(index).map(|(_, item)| item.clone())
    }

    /// Snapshot of the elements, front to back
    pub fn to_vec(&self) -> Vec<T> {
        self.read().items.iter().map(|(_, item)| item.clone()).collect()
    }
}

impl<T: PartialEq> BoundedQueue<T> {
    /// Handle of the first element equal to `item`
    pub fn contains(&self, item: &T) -> Option<Handle> {
        self.find(|candidate| candidate == item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_evicts_front() {
        let queue = BoundedQueue::with_capacity(2);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.to_vec(), vec![2, 3]);
    }

    #[test]
    fn test_unshift_evicts_back() {
        let queue = BoundedQueue::with_capacity(2);
        queue.push(1);
        queue.push(2);
        queue.unshift(0);
        assert_eq!(queue.to_vec(), vec![0, 1]);
    }

    #[test]
    fn test_none_is_ignored() {
        let queue: BoundedQueue<u32> = BoundedQueue::new();
        assert!(queue.push(None).is_none());
        assert!(queue.unshift(None).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_empty_queue_reads() {
        let queue: BoundedQueue<String> = BoundedQueue::new();
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.shift(), None);
        assert_eq!(queue.peek_front(), None);
        assert_eq!(queue.peek_back(), None);
        assert_eq!(queue.front(), None);
    }

    #[test]
    fn test_peek_does_not_mutate() {
        let queue = BoundedQueue::new();
        queue.push("a");
        queue.push("b");
        assert_eq!(queue.peek_front(), Some("a"));
        assert_eq!(queue.peek_back(), Some("b"));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_contains_and_delete() {
        let queue = BoundedQueue::new();
        queue.push("x".to_string());
        let handle = queue.push("y".to_string()).unwrap();
        queue.push("z".to_string());

        assert_eq!(queue.contains(&"y".to_string()), Some(handle));
        assert_eq!(queue.contains(&"w".to_string()), None);
        assert_eq!(queue.delete(handle), Some("y".to_string()));
        assert_eq!(queue.delete(handle), None);
        assert_eq!(queue.to_vec(), vec!["x".to_string(), "z".to_string()]);
    }

    #[test]
    fn test_handles_survive_other_removals() {
        let queue = BoundedQueue::new();
        queue.push(10);
        let back = queue.push(20).unwrap();
        queue.shift();
        assert_eq!(queue.front(), Some(back));
        let bumped = queue.with_mut(back, |v| {
            *v += 1;
            *v
        });
        assert_eq!(bumped, Some(21));
        assert_eq!(queue.get(back), Some(21));
    }

    #[test]
    fn test_set_max_len_trims_front() {
        let queue = BoundedQueue::new();
        for i in 0..5 {
            queue.push(i);
        }
        queue.set_max_len(3);
        assert_eq!(queue.to_vec(), vec![2, 3, 4]);
        assert_eq!(queue.max_len(), 3);
        queue.renew();
        assert!(queue.is_empty());
    }
}
