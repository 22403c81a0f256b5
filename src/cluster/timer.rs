// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

/// Handle of a scheduled timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Timeout scheduling used for per-batch deadlines.
pub trait TimerService: Send + Sync {
    fn schedule(&self, after: Duration, callback: TimerCallback) -> TimerHandle;

    /// Deregister a timeout. Returns `false` if it already fired or was unknown.
    fn cancel(&self, handle: TimerHandle) -> bool;
}

/// Timers on a tokio runtime: one sleeping task per timeout.
pub struct TokioTimer {
    runtime: Handle,
    tasks: Arc<DashMap<u64, AbortHandle>>,
    next_id: AtomicU64,
}

impl TokioTimer {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            tasks: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Timer on the runtime the caller is running in.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Timeouts scheduled but not yet fired or cancelled.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }
}

impl TimerService for TokioTimer {
    fn schedule(&self, after: Duration, callback: TimerCallback) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);

        // Hold the slot while spawning so the task cannot finish before its
        // abort handle is registered.
        if let Entry::Vacant(slot) = self.tasks.entry(id) {
            let task = self.runtime.spawn(async move {
                tokio::time::sleep(after).await;
                if tasks.remove(&id).is_some() {
                    callback();
                }
            });
            slot.insert(task.abort_handle());
        }
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        match self.tasks.remove(&handle.0) {
            Some((_, task)) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let timer = TokioTimer::current().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        timer.schedule(Duration::from_secs(5), Box::new(move || f.store(true, Ordering::SeqCst)));
        assert_eq!(timer.pending(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(timer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let timer = TokioTimer::current().unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        let handle = timer.schedule(Duration::from_secs(1), Box::new(move || f.store(true, Ordering::SeqCst)));

        assert!(timer.cancel(handle));
        assert!(!timer.cancel(handle));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
