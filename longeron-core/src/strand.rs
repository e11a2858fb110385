//! The strand: a sequential dispatcher of functions.
//!
//! Functions enqueued on a strand execute in FIFO order and never
//! concurrently, on whatever executor the strand currently targets. A
//! thread-local pointer identifies the strand presently draining on the
//! calling thread, enabling the direct-call optimization for functions
//! targeted at the strand they are already running on.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chronology::Job;

/// An execution context onto which deferred functions can be submitted.
pub trait Executor: Send + Sync {
    /// Submit `job` for eventual execution.
    fn execute(&self, job: Job);
}

thread_local! {
    static ACTIVE_STRAND: Cell<usize> = const { Cell::new(0) };
}

#[derive(Default)]
struct StrandInner {
    queue: VecDeque<Job>,
    running: bool,
}

/// A FIFO, non-concurrent function dispatcher bound to an executor.
pub struct Strand {
    inner: Mutex<StrandInner>,
    executor: Mutex<Arc<dyn Executor>>,
}

impl Strand {
    /// Create a strand targeting `executor`.
    pub fn new(executor: Arc<dyn Executor>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StrandInner::default()),
            executor: Mutex::new(executor),
        })
    }

    /// The executor this strand currently targets.
    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.executor.lock())
    }

    /// Retarget the strand onto `executor`. Queued functions drain on the
    /// new executor from the next scheduling on.
    pub fn retarget(&self, executor: Arc<dyn Executor>) {
        *self.executor.lock() = executor;
    }

    /// Append `job`; if the strand is idle, schedule a drain on the
    /// targeted executor.
    pub fn execute(self: &Arc<Self>, job: Job) {
        let schedule = {
            let mut inner = self.inner.lock();
            inner.queue.push_back(job);
            if inner.running {
                false
            } else {
                inner.running = true;
                true
            }
        };

        if schedule {
            let strand = Arc::clone(self);
            self.executor().execute(Box::new(move || strand.drain()));
        }
    }

    /// Run `job` inline when the calling thread is already draining this
    /// strand, otherwise enqueue it.
    pub fn execute_or_call(self: &Arc<Self>, job: Job) {
        if self.is_current() {
            job();
        } else {
            self.execute(job);
        }
    }

    /// True if the calling thread is presently draining this strand.
    #[must_use]
    pub fn is_current(self: &Arc<Self>) -> bool {
        ACTIVE_STRAND.with(|active| active.get() == Arc::as_ptr(self) as usize)
    }

    fn drain(self: &Arc<Self>) {
        let identity = Arc::as_ptr(self) as usize;
        let previous = ACTIVE_STRAND.with(|active| active.replace(identity));

        loop {
            let job = {
                let mut inner = self.inner.lock();
                match inner.queue.pop_front() {
                    Some(job) => job,
                    None => {
                        inner.running = false;
                        break;
                    }
                }
            };
            job();
        }

        ACTIVE_STRAND.with(|active| active.set(previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runs submitted jobs immediately on the calling thread.
    struct InlineExecutor;

    impl Executor for InlineExecutor {
        fn execute(&self, job: Job) {
            job();
        }
    }

    /// Collects submitted jobs for manual pumping.
    #[derive(Default)]
    struct ManualExecutor {
        jobs: Mutex<VecDeque<Job>>,
    }

    impl ManualExecutor {
        fn pump(&self) {
            loop {
                let job = self.jobs.lock().pop_front();
                match job {
                    Some(job) => job(),
                    None => break,
                }
            }
        }
    }

    impl Executor for ManualExecutor {
        fn execute(&self, job: Job) {
            self.jobs.lock().push_back(job);
        }
    }

    #[test]
    fn functions_run_in_fifo_order() {
        let executor = Arc::new(ManualExecutor::default());
        let strand = Strand::new(executor.clone());
        let record = Arc::new(Mutex::new(Vec::new()));

        for id in 0..5 {
            let record = Arc::clone(&record);
            strand.execute(Box::new(move || record.lock().push(id)));
        }
        executor.pump();

        assert_eq!(*record.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn reentrant_execute_runs_on_same_drain() {
        let strand = Strand::new(Arc::new(InlineExecutor));
        let count = Arc::new(AtomicUsize::new(0));

        let inner_count = Arc::clone(&count);
        let inner_strand = Arc::clone(&strand);
        strand.execute(Box::new(move || {
            assert!(inner_strand.is_current());
            let chained_count = Arc::clone(&inner_count);
            let chained = Arc::clone(&inner_strand);
            inner_strand.execute(Box::new(move || {
                assert!(chained.is_current());
                chained_count.fetch_add(1, Ordering::SeqCst);
            }));
            inner_count.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn execute_or_call_elides_dispatch_on_current_strand() {
        let executor = Arc::new(ManualExecutor::default());
        let strand = Strand::new(executor.clone());
        let record = Arc::new(Mutex::new(Vec::new()));

        let outer_record = Arc::clone(&record);
        let outer_strand = Arc::clone(&strand);
        strand.execute(Box::new(move || {
            outer_record.lock().push("first");
            let inline_record = Arc::clone(&outer_record);
            outer_strand.execute_or_call(Box::new(move || {
                inline_record.lock().push("inline");
            }));
            outer_record.lock().push("last");
        }));
        executor.pump();

        assert_eq!(*record.lock(), vec!["first", "inline", "last"]);
    }

    #[test]
    fn not_current_off_strand() {
        let strand = Strand::new(Arc::new(InlineExecutor));
        assert!(!strand.is_current());
    }

    #[test]
    fn serialized_across_threads() {
        let executor = Arc::new(ManualExecutor::default());
        let strand = Strand::new(executor.clone());
        let counter = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            let max_seen = Arc::clone(&max_seen);
            strand.execute(Box::new(move || {
                let concurrent = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(concurrent, Ordering::SeqCst);
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        executor.pump();

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
