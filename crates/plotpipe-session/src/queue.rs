//! Output queues shared between line readers and the session.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Unbounded FIFO of output lines from one engine stream.
///
/// A line reader pushes, the session drains. `wait_drain` blocks on a
/// condition variable until a line arrives, the reader closes the queue or
/// the timeout runs out.
#[derive(Debug, Default)]
pub struct OutputQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

#[derive(Debug, Default)]
struct QueueState {
    lines: VecDeque<String>,
    /// Producer hit end-of-stream
    closed: bool,
}

impl OutputQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A poisoned lock still holds whole lines, keep going with them
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a line and wake any waiter.
    pub fn push(&self, line: String) {
        let mut state = self.lock();
        state.lines.push_back(line);
        drop(state);
        self.available.notify_all();
    }

    /// Mark the producer as finished.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    /// Whether the producing stream has ended.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of lines currently queued.
    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    /// Whether no lines are queued.
    pub fn is_empty(&self) -> bool {
        self.lock().lines.is_empty()
    }

    /// Copy of the lines in `[start, end)`, clamped to the queue length.
    pub fn snapshot(&self, start: usize, end: usize) -> Vec<String> {
        let state = self.lock();
        let end = end.min(state.lines.len());
        let start = start.min(end);
        state.lines.range(start..end).cloned().collect()
    }

    /// Take every line currently queued.
    pub fn drain(&self) -> Vec<String> {
        self.lock().lines.drain(..).collect()
    }

    /// Take every line from `start` onward, leaving earlier lines queued.
    pub fn drain_from(&self, start: usize) -> Vec<String> {
        let mut state = self.lock();
        let start = start.min(state.lines.len());
        state.lines.drain(start..).collect()
    }

    /// Take every line, waiting up to `timeout` for the first one if empty.
    ///
    /// A zero timeout never blocks. An empty result is not an error.
    pub fn wait_drain(&self, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        while state.lines.is_empty() && !state.closed {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }

        state.lines.drain(..).collect()
    }
}
