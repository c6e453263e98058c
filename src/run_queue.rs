use std::{collections::VecDeque, sync::Arc};
use thiserror::Error;

use crate::catalog::AppDescriptor;

/// `dequeue` on an empty queue. A normal "nothing pending" signal.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("run queue is empty")]
pub struct EmptyQueue;

/// FIFO of pending selections that behaves like an ordered set:
/// an application already waiting is not queued a second time.
#[derive(Debug, Default, Clone)]
pub struct RunQueue {
    items: VecDeque<Arc<AppDescriptor>>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the application was appended, `false` if it was
    /// already queued. Never fails.
    pub fn enqueue(&mut self, app: Arc<AppDescriptor>) -> bool {
        if self.contains(&app.id) {
            return false;
        }
        self.items.push_back(app);
        true
    }

    pub fn dequeue(&mut self) -> Result<Arc<AppDescriptor>, EmptyQueue> {
        self.items.pop_front().ok_or(EmptyQueue)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|queued| queued.id == id)
    }

    /// Independent ordered copy for read-only consumers.
    pub fn snapshot(&self) -> Vec<Arc<AppDescriptor>> {
        self.items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
