//! FIFO admission queue.
//!
//! Holds ids only; task bodies live in the scheduler's registry. Arrival
//! order is preserved, but admission may skip entries whose constraints or
//! resource needs are not satisfiable yet.

use std::collections::VecDeque;

use crate::types::TaskId;

#[derive(Debug, Default)]
pub struct TaskQueue {
    items: VecDeque<TaskId>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the tail. Duplicate ids are ignored.
    pub fn push(&mut self, id: TaskId) {
        if !self.items.contains(&id) {
            self.items.push_back(id);
        }
    }

    /// Remove an id wherever it sits. Returns whether it was present.
    pub fn remove(&mut self, id: TaskId) -> bool {
        match self.items.iter().position(|&queued| queued == id) {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.items.contains(&id)
    }

    /// Queue contents in arrival order.
    pub fn snapshot(&self) -> Vec<TaskId> {
        self.items.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
