//! Holds remote candidates until they can be applied.
//!
//! Candidates travel on their own and routinely overtake the description they
//! belong to. Until the link has set a remote description they are buffered;
//! [`NegotiationQueue::mark_ready`] then hands them back in arrival order and
//! every later candidate passes straight through. Nothing is dropped or
//! reordered, only delayed.

use std::collections::VecDeque;

#[derive(Debug)]
pub struct NegotiationQueue<T> {
    ready: bool,
    pending: VecDeque<T>,
}

impl<T> Default for NegotiationQueue<T> {
    fn default() -> Self {
        Self {
            ready: false,
            pending: VecDeque::new(),
        }
    }
}

impl<T> NegotiationQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `item`, or return it for immediate application once ready.
    #[must_use]
    pub fn enqueue(&mut self, item: T) -> Option<T> {
        if self.ready {
            Some(item)
        } else {
            self.pending.push_back(item);
            None
        }
    }

    /// Switch to pass-through and hand back everything buffered so far, in
    /// arrival order.
    pub fn mark_ready(&mut self) -> impl Iterator<Item = T> + '_ {
        self.ready = true;
        self.pending.drain(..)
    }

    /// Go back to buffering, e.g. while a connectivity restart waits for a
    /// fresh remote description.
    pub fn reset(&mut self) {
        self.ready = false;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_until_ready_then_drains_in_order() {
        let mut queue = NegotiationQueue::new();
        let mut applied = Vec::new();

        for c in ["c1", "c2", "c3"] {
            if let Some(c) = queue.enqueue(c) {
                applied.push(c);
            }
        }
        assert!(applied.is_empty());
        assert_eq!(queue.pending(), 3);

        applied.extend(queue.mark_ready());
        assert_eq!(applied, vec!["c1", "c2", "c3"]);
        assert_eq!(queue.pending(), 0);

        // Already drained; a second mark_ready yields nothing
        assert_eq!(queue.mark_ready().count(), 0);
    }

    #[test]
    fn test_passes_through_once_ready() {
        let mut queue = NegotiationQueue::new();
        queue.mark_ready().for_each(drop);

        assert_eq!(queue.enqueue(7), Some(7));
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_reset_buffers_again() {
        let mut queue = NegotiationQueue::new();
        queue.mark_ready().for_each(drop);
        queue.reset();

        assert_eq!(queue.enqueue("late"), None);
        assert_eq!(queue.mark_ready().collect::<Vec<_>>(), vec!["late"]);
    }

    #[test]
    fn test_mixed_arrival_applies_each_exactly_once() {
        let mut queue = NegotiationQueue::new();
        let mut applied = Vec::new();

        for i in 0..5 {
            if let Some(c) = queue.enqueue(i) {
                applied.push(c);
            }
        }
        applied.extend(queue.mark_ready());
        for i in 5..8 {
            if let Some(c) = queue.enqueue(i) {
                applied.push(c);
            }
        }

        assert_eq!(applied, (0..8).collect::<Vec<_>>());
    }
}
