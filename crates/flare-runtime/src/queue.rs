//! Shared message queues
//!
//! The outbound path peeks rather than pops: a message leaves the pending
//! queue only after the server acknowledges it, so a transport failure
//! mid-send never loses the message.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A clonable FIFO queue shared between services and the client facade.
#[derive(Debug)]
pub struct MessageQueue<T> {
    inner: Arc<Mutex<VecDeque<T>>>,
}

impl<T> Clone for MessageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn push(&self, item: T) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).push_back(item);
    }

    /// Remove and return the front item.
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    /// Put items back at the front of the queue, ahead of anything pushed
    /// since they were drained, preserving their relative order.
    pub fn requeue_front(&self, items: Vec<T>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for item in items.into_iter().rev() {
            inner.push_front(item);
        }
    }

    /// Drain every queued item in order.
    pub fn drain(&self) -> Vec<T> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> MessageQueue<T> {
    /// Copy of the front item without removing it.
    pub fn peek(&self) -> Option<T> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .front()
            .cloned()
    }

    /// Copy of the whole queue in order, without removing anything.
    pub fn snapshot(&self) -> Vec<T> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
