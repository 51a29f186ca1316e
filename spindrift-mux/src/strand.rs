//! The strand: a serial executor.
//!
//! A strand is a FIFO of deferred functions whose invocations are
//! never concurrent. Functions submitted from one thread run in
//! submission order; functions submitted from different threads
//! interleave in submission-observed order. When a strand is idle a
//! caller may opt into inline execution; otherwise the drain is posted
//! to the owning executor.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// A deferred function.
pub type Job = Box<dyn FnOnce() + Send>;

/// Something that can run deferred functions, typically a multiplexer.
pub trait Executor: Send + Sync {
    /// Append `job` for execution on the executor's thread.
    fn execute(&self, job: Job);
}

struct StrandQueue {
    jobs: VecDeque<Job>,
    draining: bool,
}

/// A serialization domain for deferred functions.
pub struct Strand {
    queue: Mutex<StrandQueue>,
    executor: Weak<dyn Executor>,
}

impl Strand {
    /// Create a strand that drains on the specified `executor`.
    #[must_use]
    pub fn new(executor: Weak<dyn Executor>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(StrandQueue {
                jobs: VecDeque::new(),
                draining: false,
            }),
            executor,
        })
    }

    /// Append a function for serialized execution.
    pub fn execute(self: &Arc<Self>, job: Job) {
        self.execute_with(job, false);
    }

    /// Append a function for serialized execution. With `recurse`, an
    /// idle strand runs the function inline on the calling thread.
    pub fn execute_with(self: &Arc<Self>, job: Job, recurse: bool) {
        {
            let mut queue = self.queue.lock();
            if recurse && !queue.draining && queue.jobs.is_empty() {
                queue.draining = true;
                drop(queue);
                job();
                self.drain();
                return;
            }
            queue.jobs.push_back(job);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }
        self.post_drain();
    }

    /// True if no function is queued or running.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let queue = self.queue.lock();
        queue.jobs.is_empty() && !queue.draining
    }

    fn post_drain(self: &Arc<Self>) {
        let strand = Arc::clone(self);
        match self.executor.upgrade() {
            Some(executor) => executor.execute(Box::new(move || strand.drain())),
            // The executor is gone; degrade to draining on this thread.
            None => strand.drain(),
        }
    }

    fn drain(self: &Arc<Self>) {
        loop {
            let job = {
                let mut queue = self.queue.lock();
                match queue.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            job();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct InlineExecutor;

    impl Executor for InlineExecutor {
        fn execute(&self, job: Job) {
            job();
        }
    }

    fn inline_strand() -> (Arc<dyn Executor>, Arc<Strand>) {
        let executor: Arc<dyn Executor> = Arc::new(InlineExecutor);
        let strand = Strand::new(Arc::downgrade(&executor));
        (executor, strand)
    }

    #[test]
    fn submission_order_is_preserved() {
        let (_executor, strand) = inline_strand();
        let order = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..10 {
            let order = Arc::clone(&order);
            strand.execute(Box::new(move || order.lock().unwrap().push(i)));
        }
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert!(strand.is_idle());
    }

    #[test]
    fn recurse_runs_inline_when_idle() {
        let (_executor, strand) = inline_strand();
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            strand.execute_with(Box::new(move || { ran.fetch_add(1, Ordering::SeqCst); }), true);
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn jobs_submitted_during_drain_run_in_order() {
        let (_executor, strand) = inline_strand();
        let order = Arc::new(StdMutex::new(Vec::new()));

        let inner_order = Arc::clone(&order);
        let inner_strand = Arc::clone(&strand);
        strand.execute(Box::new(move || {
            inner_order.lock().unwrap().push(1);
            let nested_order = Arc::clone(&inner_order);
            inner_strand.execute(Box::new(move || {
                nested_order.lock().unwrap().push(2);
            }));
            inner_order.lock().unwrap().push(10);
        }));

        assert_eq!(*order.lock().unwrap(), vec![1, 10, 2]);
    }

    #[test]
    fn never_concurrent_across_threads() {
        let (_executor, strand) = inline_strand();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let strand = Arc::clone(&strand);
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                let total = Arc::clone(&total);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        let active = Arc::clone(&active);
                        let peak = Arc::clone(&peak);
                        let total = Arc::clone(&total);
                        strand.execute(Box::new(move || {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            active.fetch_sub(1, Ordering::SeqCst);
                            total.fetch_add(1, Ordering::SeqCst);
                        }));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(total.load(Ordering::SeqCst), 1000);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
