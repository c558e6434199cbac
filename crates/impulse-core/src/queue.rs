//! FIFO queue with generated ids.
//!
//! Channels keep two of these: pending listener registrations and pending
//! messages. Every inserted item gets an id that is unique for the lifetime
//! of the queue, so it can be looked up or cancelled before it is drained.

use std::collections::VecDeque;

/// Identifier handed out by a [`Queue`].
pub type QueueId = String;

/// A queued item together with its id.
#[derive(Debug, Clone)]
pub struct Record<T> {
    pub id: QueueId,
    pub data: T,
}

/// Insertion-ordered queue.
#[derive(Debug)]
pub struct Queue<T> {
    prefix: String,
    next_seq: u64,
    items: VecDeque<Record<T>>,
}

impl<T> Queue<T> {
    /// Create a queue whose ids start with `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next_seq: 0,
            items: VecDeque::new(),
        }
    }

    fn next_id(&mut self) -> QueueId {
        let id = format!("{}.{:x}", self.prefix, self.next_seq);
        self.next_seq += 1;
        id
    }

    /// Append an item, returning its id.
    pub fn insert(&mut self, data: T) -> QueueId {
        self.insert_with(|_| data)
    }

    /// Append an item built from its own id.
    pub fn insert_with(&mut self, build: impl FnOnce(&str) -> T) -> QueueId {
        let id = self.next_id();
        let data = build(&id);
        self.items.push_back(Record {
            id: id.clone(),
            data,
        });
        id
    }

    /// Look at a pending item without removing it.
    #[must_use]
    pub fn peek(&self, id: &str) -> Option<&Record<T>> {
        self.items.iter().find(|r| r.id == id)
    }

    /// Remove and return the oldest item.
    pub fn pop_head(&mut self) -> Option<Record<T>> {
        self.items.pop_front()
    }

    /// Remove a pending item.
    ///
    /// Returns `true` if something was removed; cancelling an unknown or
    /// already drained id is a no-op.
    pub fn cancel(&mut self, id: &str) -> bool {
        match self.items.iter().position(|r| r.id == id) {
            Some(index) => self.items.remove(index).is_some(),
            None => false,
        }
    }

    /// Number of pending items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_fifo() {
        let mut queue = Queue::new("q");
        let a = queue.insert("a");
        let b = queue.insert("b");
        assert_ne!(a, b);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop_head().unwrap().data, "a");
        assert_eq!(queue.pop_head().unwrap().data, "b");
        assert!(queue.pop_head().is_none());
    }

    #[test]
    fn test_queue_ids_never_repeat() {
        let mut queue = Queue::new("m");
        let first = queue.insert(1);
        queue.pop_head();
        let second = queue.insert(2);
        assert_ne!(first, second);
        assert!(second.starts_with("m."));
    }

    #[test]
    fn test_queue_peek_and_cancel() {
        let mut queue = Queue::new("q");
        let a = queue.insert("a");
        let b = queue.insert("b");

        assert_eq!(queue.peek(&b).unwrap().data, "b");
        assert!(queue.cancel(&a));
        assert!(!queue.cancel(&a));
        assert!(queue.peek(&a).is_none());
        assert_eq!(queue.pop_head().unwrap().id, b);
    }

    #[test]
    fn test_insert_with_sees_id() {
        let mut queue = Queue::new("m");
        let id = queue.insert_with(|id| format!("payload for {id}"));
        assert_eq!(queue.peek(&id).unwrap().data, format!("payload for {id}"));
    }
}
