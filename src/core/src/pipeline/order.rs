//! In-order hand-off from parallel workers to the single packager thread.

use std::collections::BTreeMap;

use parking_lot::{Condvar, Mutex};

struct State<T> {
    next: u64,
    ready: BTreeMap<u64, T>,
    producers: usize,
    poisoned: bool,
}

/// Bounded reordering buffer keyed by layer index.
///
/// Workers insert completed items in whatever order they finish; the
/// consumer pops strictly ascending. A worker holding an item far ahead of
/// the consumer blocks until the gap closes, which is what bounds the
/// resident set of finished-but-unwritten layers. Poisoning wakes every
/// waiter so an aborting run cannot deadlock on a full window.
pub(crate) struct OrderedSink<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
    window: u64,
}

impl<T> OrderedSink<T> {
    pub(crate) fn new(window: usize, producers: usize) -> OrderedSink<T> {
        OrderedSink {
            state: Mutex::new(State {
                next: 0,
                ready: BTreeMap::new(),
                producers,
                poisoned: false,
            }),
            cond: Condvar::new(),
            window: window.max(1) as u64,
        }
    }

    /// Insert item `index`, blocking while it is outside the admission
    /// window. Returns false when the sink was poisoned.
    pub(crate) fn push(&self, index: u64, item: T) -> bool {
        let mut state = self.state.lock();
        while !state.poisoned && index >= state.next + self.window {
            self.cond.wait(&mut state);
        }
        if state.poisoned {
            return false;
        }
        state.ready.insert(index, item);
        self.cond.notify_all();
        true
    }

    /// Pop the next item in sequence, blocking until it arrives. `None`
    /// once every producer is done and the sequence cannot advance, or the
    /// sink was poisoned.
    pub(crate) fn pop_next(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.poisoned {
                return None;
            }
            let next = state.next;
            if let Some(item) = state.ready.remove(&next) {
                state.next += 1;
                self.cond.notify_all();
                return Some(item);
            }
            if state.producers == 0 {
                return None;
            }
            self.cond.wait(&mut state);
        }
    }

    /// A producer finished (normally or not).
    pub(crate) fn producer_done(&self) {
        let mut state = self.state.lock();
        state.producers = state.producers.saturating_sub(1);
        self.cond.notify_all();
    }

    /// Abort: drop pending items and wake every waiter.
    pub(crate) fn poison(&self) {
        let mut state = self.state.lock();
        state.poisoned = true;
        state.ready.clear();
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn reorders_out_of_order_pushes() {
        let sink = OrderedSink::new(8, 1);
        assert!(sink.push(2, "c"));
        assert!(sink.push(0, "a"));
        assert!(sink.push(1, "b"));
        sink.producer_done();
        assert_eq!(sink.pop_next(), Some("a"));
        assert_eq!(sink.pop_next(), Some("b"));
        assert_eq!(sink.pop_next(), Some("c"));
        assert_eq!(sink.pop_next(), None);
    }

    #[test]
    fn window_blocks_far_ahead_producers() {
        let sink = Arc::new(OrderedSink::new(2, 1));
        let s = Arc::clone(&sink);
        let producer = thread::spawn(move || {
            // Index 2 is outside the window until index 0 is consumed.
            assert!(s.push(0, 0u32));
            assert!(s.push(1, 1));
            assert!(s.push(2, 2));
            s.producer_done();
        });
        assert_eq!(sink.pop_next(), Some(0));
        assert_eq!(sink.pop_next(), Some(1));
        assert_eq!(sink.pop_next(), Some(2));
        assert_eq!(sink.pop_next(), None);
        producer.join().unwrap();
    }

    #[test]
    fn poison_unblocks_everyone() {
        let sink = Arc::new(OrderedSink::<u32>::new(1, 1));
        let s = Arc::clone(&sink);
        let producer = thread::spawn(move || {
            assert!(s.push(0, 0));
            // Blocks on the window until the poison lands.
            assert!(!s.push(5, 5));
        });
        // Give the producer a moment to park, then abort.
        thread::sleep(std::time::Duration::from_millis(20));
        sink.poison();
        producer.join().unwrap();
        assert_eq!(sink.pop_next(), None);
    }

    #[test]
    fn finishes_with_a_gap_when_producers_exit() {
        let sink = OrderedSink::new(8, 2);
        assert!(sink.push(1, "later"));
        sink.producer_done();
        sink.producer_done();
        // Index 0 never arrived; the sequence cannot advance.
        assert_eq!(sink.pop_next(), None);
    }
}
