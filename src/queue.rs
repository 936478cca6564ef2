//! The command queue.
//!
//! A blocking FIFO handing work from the connection tasks to the command
//! handler pool. Consumers poll with a timeout so they can observe shutdown
//! even when the queue stays empty; closing the queue wakes every waiter
//! and makes further pushes fail.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;


//------------ PopOutcome ----------------------------------------------------

/// The result of a blocking pop.
#[derive(Debug)]
pub enum PopOutcome<T> {
    /// An item was available.
    Item(T),

    /// The timeout expired with the queue still empty.
    TimedOut,

    /// The queue has been closed and drained.
    Closed,
}


//------------ WorkQueue -----------------------------------------------------

/// A closable multi-producer multi-consumer FIFO.
#[derive(Debug)]
pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    open: bool,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        WorkQueue {
            state: Mutex::new(State {
                items: VecDeque::new(),
                open: true,
            }),
            cond: Condvar::new(),
        }
    }

    /// Appends an item. Fails if the queue has been closed.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock().expect("poisoned lock");
        if !state.open {
            return false
        }
        state.items.push_back(item);
        self.cond.notify_one();
        true
    }

    /// Removes the next item, waiting up to `timeout` for one to appear.
    ///
    /// Items still queued when the queue is closed are handed out before
    /// `Closed` is reported, so nothing already accepted is lost.
    pub fn pop(&self, timeout: Duration) -> PopOutcome<T> {
        let mut state = self.state.lock().expect("poisoned lock");
        loop {
            if let Some(item) = state.items.pop_front() {
                return PopOutcome::Item(item)
            }
            if !state.open {
                return PopOutcome::Closed
            }
            let (next, wait) = self.cond
                .wait_timeout(state, timeout)
                .expect("poisoned lock");
            state = next;
            if wait.timed_out() {
                return match state.items.pop_front() {
                    Some(item) => PopOutcome::Item(item),
                    None if state.open => PopOutcome::TimedOut,
                    None => PopOutcome::Closed,
                }
            }
        }
    }

    /// Closes the queue and wakes all waiting consumers.
    pub fn close(&self) {
        self.state.lock().expect("poisoned lock").open = false;
        self.cond.notify_all();
    }

    /// Removes all pending items, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock().expect("poisoned lock");
        let count = state.items.len();
        state.items.clear();
        count
    }

    /// Returns the number of items currently queued.
    pub fn len(&self) -> usize {
        self.state.lock().expect("poisoned lock").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let queue = WorkQueue::new();
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(queue.push(3));
        for expected in 1..=3 {
            match queue.pop(Duration::from_millis(10)) {
                PopOutcome::Item(item) => assert_eq!(item, expected),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert!(matches!(
            queue.pop(Duration::from_millis(1)), PopOutcome::TimedOut
        ));
    }

    #[test]
    fn close_wakes_and_rejects() {
        let queue = Arc::new(WorkQueue::<u32>::new());
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                loop {
                    match queue.pop(Duration::from_millis(50)) {
                        PopOutcome::Item(_) => {}
                        PopOutcome::TimedOut => {}
                        PopOutcome::Closed => break,
                    }
                }
            })
        };
        queue.push(1);
        queue.close();
        consumer.join().expect("consumer finished");
        assert!(!queue.push(2));
    }

    #[test]
    fn queued_items_survive_close() {
        let queue = WorkQueue::new();
        queue.push(1);
        queue.close();
        assert!(matches!(
            queue.pop(Duration::from_millis(1)), PopOutcome::Item(1)
        ));
        assert!(matches!(
            queue.pop(Duration::from_millis(1)), PopOutcome::Closed
        ));
    }
}
