//! Fixed-capacity event history

use super::event::Event;

/// Circular store of the most recent events.
///
/// Appending past capacity silently overwrites the oldest slot. The buffer
/// itself is not synchronized; the owning session guards it.
#[derive(Debug)]
pub struct RingBuffer {
    slots: Vec<Option<Event>>,
    /// Next slot to write
    head: usize,
    len: usize,
}

impl RingBuffer {
    /// A capacity of zero is bumped to one so history always holds the last event.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RingBuffer {
            slots: vec![None; capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn append(&mut self, event: Event) {
        let capacity = self.slots.len();
        self.slots[self.head] = Some(event);
        self.head = (self.head + 1) % capacity;
        if self.len < capacity {
            self.len += 1;
        }
    }

    /// Copy of the stored events, oldest first
    pub fn snapshot(&self) -> Vec<Event> {
        let capacity = self.slots.len();
        let start = (self.head + capacity - self.len) % capacity;
        (0..self.len)
            .filter_map(|offset| self.slots[(start + offset) % capacity].clone())
            .collect()
    }
}
