//! Fast deadline queue for a fixed tick value.
//!
//! Every entry shares the same deadline, so the queue is monotonic by
//! insertion time and the head is always the earliest expiry: insertion is
//! O(1) and [`TimerQueue::process`] only ever inspects the front.
//! Cancellation nulls the callback in place; the slot is reclaimed once
//! `step` walks past it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

/// Idle deadline shared by every entry.
pub const DEADLINE: Duration = Duration::from_secs(5);

const INITIAL_CAPACITY: usize = 100;

type Callback = Box<dyn FnOnce()>;

/// Deadline scheduler for idle connections.
///
/// Driven once per second by the server tick. Callbacks must be small and
/// must not touch the queue; they are invoked inline from [`process`].
///
/// [`process`]: TimerQueue::process
pub struct TimerQueue {
    dq: VecDeque<(Instant, Option<Callback>)>,
    // Index of the queue front since the beginning of time; a handle is
    // `step + position`.
    step: u64,
}

impl TimerQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            dq: VecDeque::with_capacity(INITIAL_CAPACITY),
            step: 0,
        }
    }

    /// Appends an entry stamped now and returns its stable handle.
    pub fn add(&mut self, f: Callback) -> u64 {
        self.dq.push_back((Instant::now(), Some(f)));
        let handle = self.step + self.dq.len() as u64 - 1;
        debug!(handle, "timer add");
        handle
    }

    /// Nulls the callback of a still-queued entry; out-of-window handles
    /// are a no-op.
    pub fn cancel(&mut self, handle: u64) {
        let Some(index) = handle.checked_sub(self.step) else {
            return;
        };
        if let Some(entry) = self.dq.get_mut(index as usize) {
            entry.1 = None;
        }
    }

    /// Walks the queue front: cancelled entries are reclaimed immediately,
    /// expired ones fire, and the walk stops at the first live entry that
    /// is still inside the deadline.
    pub fn process(&mut self) {
        let now = Instant::now();
        while let Some(front) = self.dq.front_mut() {
            if front.1.is_some() {
                if now.duration_since(front.0) < DEADLINE {
                    break;
                }
                debug!(step = self.step, "timer fire");
                if let Some(f) = front.1.take() {
                    // Timer callbacks are simple (flip a flag, wake a
                    // task), so they run inline here.
                    f();
                }
            }
            self.dq.pop_front();
            self.step += 1;
        }
    }

    /// Number of slots still held, cancelled ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dq.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dq.is_empty()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn handles_are_step_plus_position() {
        let mut q = TimerQueue::new();
        assert_eq!(q.add(Box::new(|| {})), 0);
        assert_eq!(q.add(Box::new(|| {})), 1);
        assert_eq!(q.add(Box::new(|| {})), 2);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn cancelled_head_is_reclaimed_on_process() {
        let fired = Rc::new(Cell::new(false));
        let mut q = TimerQueue::new();
        let fired2 = fired.clone();
        let handle = q.add(Box::new(move || fired2.set(true)));
        q.cancel(handle);
        q.process();
        assert!(q.is_empty());
        assert!(!fired.get());
    }

    #[test]
    fn cancel_out_of_window_is_noop() {
        let mut q = TimerQueue::new();
        q.cancel(17);
        let handle = q.add(Box::new(|| {}));
        q.cancel(handle);
        q.process();
        assert!(q.is_empty());
        // The slot was reclaimed, so the old handle no longer refers to
        // anything and cancelling it again must not disturb new entries.
        let next = q.add(Box::new(|| {}));
        q.cancel(handle);
        assert_eq!(next, 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn live_entry_within_deadline_blocks_the_walk() {
        let fired = Rc::new(Cell::new(0u32));
        let mut q = TimerQueue::new();
        let f1 = fired.clone();
        q.add(Box::new(move || f1.set(f1.get() + 1)));
        q.process();
        // Freshly added entries are far from the 5s deadline.
        assert_eq!(q.len(), 1);
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn cancelled_entries_behind_a_live_head_are_kept_until_reached() {
        let mut q = TimerQueue::new();
        q.add(Box::new(|| {}));
        let second = q.add(Box::new(|| {}));
        q.cancel(second);
        q.process();
        // The live head is young, so the cancelled slot behind it is not
        // reclaimed yet.
        assert_eq!(q.len(), 2);
    }
}
