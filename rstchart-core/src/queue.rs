//! Session event queues.

use crate::event::Event;
use std::collections::VecDeque;

/// FIFO of pending events.
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }
}

/// The internal and external queue of one session.
///
/// The internal queue always drains before the external one is touched.
#[derive(Debug, Clone, Default)]
pub struct EventQueues {
    pub internal: EventQueue,
    pub external: EventQueue,
}

impl EventQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.internal.is_empty() && self.external.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut q = EventQueue::new();
        q.push(Event::external("a"));
        q.push(Event::external("b"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().name, "a");
        assert_eq!(q.pop().unwrap().name, "b");
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_queues_are_independent() {
        let mut queues = EventQueues::new();
        queues.external.push(Event::external("ext"));
        assert!(!queues.is_empty());
        assert!(queues.internal.is_empty());
        queues.internal.push(Event::internal("int"));
        queues.external.clear();
        assert_eq!(queues.internal.len(), 1);
    }
}
