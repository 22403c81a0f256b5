// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backpressure and shutdown gating.
//!
//! Two primitives live here:
//!
//! - [`BatchGate`] caps the number of batches preparing or awaiting
//!   responses. Batch formation takes a slot without blocking; callers of
//!   `touch` wait (bounded, with periodic wake-ups) while the gate is full.
//!   This is the only place the subsystem blocks a caller.
//! - [`BusyLock`] lets operations enter while the subsystem is running and
//!   lets shutdown close the door and wait for everyone inside to leave.
//!
//! # Example
//!
//! ```
//! use datagrid_eviction::backpressure::BatchGate;
//!
//! let gate = BatchGate::new(1);
//! assert!(gate.try_acquire());
//! assert!(!gate.try_acquire());
//! gate.release();
//! assert_eq!(gate.in_flight(), 0);
//! ```

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Concurrency ceiling for in-flight batches.
pub struct BatchGate {
    limit: usize,
    in_flight: Mutex<usize>,
    released: Condvar,
}

impl BatchGate {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            in_flight: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock()
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&self) -> bool {
        let mut n = self.in_flight.lock();
        if *n >= self.limit {
            return false;
        }
        *n += 1;
        true
    }

    pub fn release(&self) {
        let mut n = self.in_flight.lock();
        *n = n.saturating_sub(1);
        if *n < self.limit {
            self.released.notify_all();
        }
    }

    /// Block while the gate is full.
    ///
    /// Wakes every `wake` to re-check `stop`; returns how long it waited, or
    /// `None` if it did not wait at all.
    pub fn wait_for_room(&self, wake: Duration, stop: &AtomicBool) -> Option<Duration> {
        let mut n = self.in_flight.lock();
        if *n < self.limit {
            return None;
        }

        let start = Instant::now();
        while *n >= self.limit && !stop.load(Ordering::Acquire) {
            if self.released.wait_for(&mut n, wake).timed_out() {
                debug!(in_flight = *n, limit = self.limit, "Still waiting for eviction batches to finish");
            }
        }
        Some(start.elapsed())
    }

    /// Wake every waiter (used on shutdown).
    pub fn wake_all(&self) {
        let _n = self.in_flight.lock();
        self.released.notify_all();
    }
}

#[derive(Default)]
struct BusyState {
    active: usize,
    blocked: bool,
}

/// Enter/leave gate that shutdown can close.
#[derive(Default)]
pub struct BusyLock {
    state: Mutex<BusyState>,
    drained: Condvar,
}

/// Held while an operation is inside the subsystem.
pub struct BusyGuard<'a> {
    lock: &'a BusyLock,
}

impl BusyLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` once the lock has been blocked.
    pub fn enter(&self) -> Option<BusyGuard<'_>> {
        let mut state = self.state.lock();
        if state.blocked {
            return None;
        }
        state.active += 1;
        Some(BusyGuard { lock: self })
    }

    /// Refuse new entries and wait for active ones to leave.
    ///
    /// Waits at most `timeout` for the drain; returns whether it completed.
    pub fn block(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.blocked = true;
        while state.active > 0 {
            if self.drained.wait_until(&mut state, deadline).timed_out() {
                return state.active == 0;
            }
        }
        true
    }

    pub fn is_blocked(&self) -> bool {
        self.state.lock().blocked
    }

    fn leave(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        if state.active == 0 && state.blocked {
            self.drained.notify_all();
        }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.lock.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_gate_limit() {
        let gate = BatchGate::new(2);
        assert!(gate.try_acquire());
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
        gate.release();
        assert!(gate.try_acquire());
        assert_eq!(gate.in_flight(), 2);
    }

    #[test]
    fn test_wait_returns_immediately_with_room() {
        let gate = BatchGate::new(1);
        let stop = AtomicBool::new(false);
        assert!(gate.wait_for_room(Duration::from_millis(10), &stop).is_none());
    }

    #[test]
    fn test_waiter_released_by_release() {
        let gate = Arc::new(BatchGate::new(1));
        assert!(gate.try_acquire());

        let g = Arc::clone(&gate);
        let waiter = thread::spawn(move || {
            let stop = AtomicBool::new(false);
            g.wait_for_room(Duration::from_millis(5), &stop)
        });

        thread::sleep(Duration::from_millis(30));
        gate.release();
        let waited = waiter.join().unwrap();
        assert!(waited.is_some());
    }

    #[test]
    fn test_waiter_released_by_stop() {
        let gate = BatchGate::new(1);
        assert!(gate.try_acquire());
        let stop = AtomicBool::new(true);
        // Stop already set: one wake-up at most
        assert!(gate.wait_for_room(Duration::from_millis(5), &stop).is_some());
    }

    #[test]
    fn test_busy_lock_blocks_new_entries() {
        let lock = BusyLock::new();
        {
            let _g = lock.enter().unwrap();
        }
        assert!(lock.block(Duration::from_millis(10)));
        assert!(lock.enter().is_none());
        assert!(lock.is_blocked());
    }

    #[test]
    fn test_block_waits_for_active() {
        let lock = Arc::new(BusyLock::new());
        let l = Arc::clone(&lock);
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = thread::spawn(move || {
            let _g = l.enter().unwrap();
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(30));
        });
        rx.recv().unwrap();
        assert!(lock.block(Duration::from_secs(5)));
        worker.join().unwrap();
    }

    #[test]
    fn test_block_times_out() {
        let lock = BusyLock::new();
        let _g = lock.enter().unwrap();
        assert!(!lock.block(Duration::from_millis(10)));
    }
}
