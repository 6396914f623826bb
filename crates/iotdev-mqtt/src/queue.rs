//! Bounded FIFO used to hold publishes and subscriptions while offline.

use std::collections::VecDeque;

use serde::Deserialize;

/// Which element is discarded when a full queue receives a new one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropPolicy {
    /// Drop the head; the queue keeps the most recent `max_size` items.
    #[default]
    Oldest,
    /// Drop the current tail before appending.
    Newest,
}

/// FIFO with an optional size limit. A `max_size` of 0 means unbounded.
///
/// Not synchronized; the owner serializes access.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    max_size: usize,
    policy: DropPolicy,
}

impl<T> BoundedQueue<T> {
    pub fn new(max_size: usize, policy: DropPolicy) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
            policy,
        }
    }

    /// Append `item`, returning the element dropped to make room, if any.
    pub fn enqueue(&mut self, item: T) -> Option<T> {
        let dropped = if self.max_size > 0 && self.items.len() >= self.max_size {
            match self.policy {
                DropPolicy::Oldest => self.items.pop_front(),
                DropPolicy::Newest => self.items.pop_back(),
            }
        } else {
            None
        };
        self.items.push_back(item);
        dropped
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove every element, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }
}
