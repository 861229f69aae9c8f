// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deferred work dispatch.
//!
//! Completion events arrive in interrupt-equivalent context and must not call
//! into clients directly. Instead they schedule a [`Work`] item on a
//! [`WorkQueue`], which the integrator drains from a context of its choosing.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// A unit of deferred work.
pub trait Work: Send + Sync {
    fn run(self: Arc<Self>);
}

/// A single-consumer queue of deferred work items.
#[derive(Default)]
pub struct WorkQueue {
    queue: Mutex<VecDeque<Arc<dyn Work>>>,
}

impl WorkQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `work`. Safe to call from any context.
    pub fn schedule(&self, work: Arc<dyn Work>) {
        self.queue.lock().push_back(work);
    }

    /// Runs queued items, including any scheduled while running, until the
    /// queue is empty. Returns the number of items run.
    pub fn run_pending(&self) -> usize {
        let mut n = 0;
        loop {
            // Don't hold the lock while running so items can reschedule.
            let Some(work) = self.queue.lock().pop_front() else {
                break;
            };
            work.run();
            n += 1;
        }
        n
    }

    /// Runs at most one queued item.
    pub fn run_one(&self) -> bool {
        let work = self.queue.lock().pop_front();
        match work {
            Some(work) => {
                work.run();
                true
            }
            None => false,
        }
    }

    /// Returns true if nothing is queued.
    pub fn is_idle(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// Coalesces repeated scheduling of one work item, tasklet style.
///
/// While the item is queued, further [`Self::schedule`] calls are no-ops. The
/// flag is cleared just before the item runs, so events that arrive during a
/// run queue exactly one more run.
#[derive(Default)]
pub struct ScheduleFlag(AtomicBool);

impl ScheduleFlag {
    /// Queues `work` unless it is already queued. Returns true if queued.
    pub fn schedule(&self, queue: &WorkQueue, work: Arc<dyn Work>) -> bool {
        if self.0.swap(true, Ordering::AcqRel) {
            return false;
        }
        queue.schedule(work);
        true
    }

    /// Marks the item as no longer queued. Call at the start of `run`.
    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Returns true while the item is queued.
    pub fn is_scheduled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::ScheduleFlag;
    use super::Work;
    use super::WorkQueue;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::sync::Weak;

    struct Counter {
        runs: AtomicUsize,
        flag: ScheduleFlag,
        again: AtomicUsize,
        queue: Weak<WorkQueue>,
    }

    impl Work for Counter {
        fn run(self: Arc<Self>) {
            self.flag.clear();
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.again.load(Ordering::SeqCst) > 0 {
                self.again.fetch_sub(1, Ordering::SeqCst);
                if let Some(queue) = self.queue.upgrade() {
                    self.flag.schedule(&queue, self.clone());
                }
            }
        }
    }

    fn counter(queue: &Arc<WorkQueue>, again: usize) -> Arc<Counter> {
        Arc::new(Counter {
            runs: AtomicUsize::new(0),
            flag: ScheduleFlag::default(),
            again: AtomicUsize::new(again),
            queue: Arc::downgrade(queue),
        })
    }

    #[test]
    fn coalesces_while_queued() {
        let queue = Arc::new(WorkQueue::new());
        let work = counter(&queue, 0);
        assert!(work.flag.schedule(&queue, work.clone()));
        assert!(!work.flag.schedule(&queue, work.clone()));
        assert_eq!(queue.run_pending(), 1);
        assert_eq!(work.runs.load(Ordering::SeqCst), 1);
        assert!(queue.is_idle());
    }

    #[test]
    fn rescheduled_items_run_in_same_drain() {
        let queue = Arc::new(WorkQueue::new());
        let work = counter(&queue, 2);
        work.flag.schedule(&queue, work.clone());
        assert_eq!(queue.run_pending(), 3);
        assert!(!work.flag.is_scheduled());
    }

    #[test]
    fn run_one_runs_single_item() {
        let queue = Arc::new(WorkQueue::new());
        let work = counter(&queue, 1);
        work.flag.schedule(&queue, work.clone());
        assert!(queue.run_one());
        assert!(!queue.is_idle());
        assert!(queue.run_one());
        assert!(!queue.run_one());
    }
}
