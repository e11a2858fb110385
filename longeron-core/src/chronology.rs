//! The chronology: a priority queue of timer deadlines plus a FIFO of
//! deferred functions, owned by one worker.
//!
//! Timers are shared handles; a timer is *scheduled* while it has a pending
//! deadline and merely *registered* otherwise. `announce` fires every due
//! timer in non-decreasing deadline order, breaking ties by insertion
//! order, after draining the deferred queue.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A deferred unit of work.
pub type Job = Box<dyn FnOnce() + Send>;

/// The reason a timer callback is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// The deadline arrived.
    Deadline,
    /// The schedule was cancelled before the deadline.
    Cancelled,
    /// The owning chronology closed the timer.
    Closed,
}

/// The function invoked when a timer arrives.
pub type TimerCallback = Arc<dyn Fn(&Arc<Timer>, TimerEvent) + Send + Sync>;

/// Construction options of a timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerOptions {
    /// Fire at most once per schedule even if announcements lag.
    pub one_shot: bool,
}

#[derive(Debug, Default)]
struct TimerState {
    deadline: Option<Instant>,
    period: Option<Duration>,
    generation: u64,
    closed: bool,
}

/// A shared timer keyed by an absolute deadline.
pub struct Timer {
    options: TimerOptions,
    callback: TimerCallback,
    state: Mutex<TimerState>,
    chronology: Weak<Chronology>,
}

impl Timer {
    /// Schedule (or re-key) this timer to fire at `deadline`, and then every
    /// `period` thereafter if one is given. Returns false if the timer or
    /// its chronology is closed.
    pub fn schedule(self: &Arc<Self>, deadline: Instant, period: Option<Duration>) -> bool {
        let Some(chronology) = self.chronology.upgrade() else {
            return false;
        };

        let generation = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.generation += 1;
            state.deadline = Some(deadline);
            state.period = period;
            state.generation
        };

        // The state lock is not held across the heap push; a concurrent
        // re-key or cancellation leaves this entry stale, and stale entries
        // are discarded by generation checks at dispatch.
        let mut inner = chronology.inner.lock();
        inner.sequence += 1;
        let entry = HeapEntry {
            deadline,
            sequence: inner.sequence,
            generation,
            timer: Arc::clone(self),
        };
        inner.heap.push(entry);
        true
    }

    /// Cancel a pending schedule. Returns true if a deadline was pending.
    pub fn cancel(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.generation += 1;
        state.period = None;
        state.deadline.take().is_some()
    }

    /// Deliver `event` to the timer's sink immediately, on the calling
    /// thread.
    pub fn arrive(self: &Arc<Self>, event: TimerEvent) {
        (self.callback)(self, event);
    }

    /// True if a deadline is pending.
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.state.lock().deadline.is_some()
    }

    /// True if the timer has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn close(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.generation += 1;
        state.deadline = None;
        true
    }
}

struct HeapEntry {
    deadline: Instant,
    sequence: u64,
    generation: u64,
    timer: Arc<Timer>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed so the BinaryHeap pops the earliest deadline first, with
    // ties broken by insertion order.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.deadline, other.sequence).cmp(&(self.deadline, self.sequence))
    }
}

#[derive(Default)]
struct ChronologyInner {
    heap: BinaryHeap<HeapEntry>,
    deferred: VecDeque<Job>,
    timers: Vec<Weak<Timer>>,
    sequence: u64,
}

/// The combined deadline queue and deferred-function FIFO of a worker.
#[derive(Default)]
pub struct Chronology {
    inner: Mutex<ChronologyInner>,
}

impl Chronology {
    /// Create an empty chronology.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate a timer registered with this chronology.
    pub fn create_timer(
        self: &Arc<Self>,
        options: TimerOptions,
        callback: TimerCallback,
    ) -> Arc<Timer> {
        let timer = Arc::new(Timer {
            options,
            callback,
            state: Mutex::new(TimerState::default()),
            chronology: Arc::downgrade(self),
        });
        let mut inner = self.inner.lock();
        inner.timers.retain(|weak| weak.strong_count() > 0);
        inner.timers.push(Arc::downgrade(&timer));
        timer
    }

    /// Append `job` to the deferred queue.
    pub fn execute(&self, job: Job) {
        self.inner.lock().deferred.push_back(job);
    }

    /// Drain the deferred queue, then fire every scheduled timer whose
    /// deadline is at or before `now`, in non-decreasing deadline order.
    /// When `single` is set, stop after one deadline dispatch. Returns the
    /// number of functions and timers dispatched.
    pub fn announce(&self, now: Instant, single: bool) -> usize {
        let mut dispatched = 0;

        let deferred: Vec<Job> = {
            let mut inner = self.inner.lock();
            inner.deferred.drain(..).collect()
        };
        for job in deferred {
            job();
            dispatched += 1;
        }

        loop {
            let due = {
                let mut inner = self.inner.lock();
                match inner.heap.peek() {
                    Some(entry) if entry.deadline <= now => inner.heap.pop(),
                    _ => None,
                }
            };
            let Some(entry) = due else {
                break;
            };

            // Validate against re-keying and cancellation since the push.
            let live = {
                let mut state = entry.timer.state.lock();
                if state.closed || state.generation != entry.generation {
                    false
                } else {
                    match (state.period, entry.timer.options.one_shot) {
                        (Some(period), false) => {
                            state.generation += 1;
                            let next = entry.deadline + period;
                            state.deadline = Some(next);
                            let generation = state.generation;
                            drop(state);
                            let mut inner = self.inner.lock();
                            inner.sequence += 1;
                            let sequence = inner.sequence;
                            inner.heap.push(HeapEntry {
                                deadline: next,
                                sequence,
                                generation,
                                timer: Arc::clone(&entry.timer),
                            });
                            true
                        }
                        _ => {
                            state.deadline = None;
                            state.period = None;
                            true
                        }
                    }
                }
            };

            if live {
                entry.timer.arrive(TimerEvent::Deadline);
                dispatched += 1;
                if single {
                    break;
                }
            }
        }

        dispatched
    }

    /// The interval until the earliest pending deadline, floored at zero;
    /// `None` if nothing is scheduled.
    pub fn timeout_interval(&self, now: Instant) -> Option<Duration> {
        let mut inner = self.inner.lock();
        loop {
            let (deadline, stale) = match inner.heap.peek() {
                None => return None,
                Some(entry) => {
                    let state = entry.timer.state.lock();
                    let stale = state.closed
                        || state.generation != entry.generation
                        || state.deadline != Some(entry.deadline);
                    (entry.deadline, stale)
                }
            };
            if stale {
                inner.heap.pop();
                continue;
            }
            return Some(deadline.saturating_duration_since(now));
        }
    }

    /// The interval until the earliest pending deadline in milliseconds,
    /// rounded up; -1 if nothing is scheduled.
    pub fn timeout_in_milliseconds(&self, now: Instant) -> i64 {
        match self.timeout_interval(now) {
            None => -1,
            Some(interval) => {
                i64::try_from(interval.as_nanos().div_ceil(1_000_000)).unwrap_or(i64::MAX)
            }
        }
    }

    /// The number of live registered timers.
    pub fn num_registered(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.timers.retain(|weak| weak.strong_count() > 0);
        inner.timers.len()
    }

    /// The number of timers with a pending deadline.
    pub fn num_scheduled(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .timers
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|timer| timer.is_scheduled())
            .count()
    }

    /// The number of deferred functions awaiting dispatch.
    pub fn num_deferred(&self) -> usize {
        self.inner.lock().deferred.len()
    }

    /// True if any timer is scheduled or any function is deferred.
    pub fn has_any_scheduled_or_deferred(&self) -> bool {
        self.num_deferred() > 0 || self.num_scheduled() > 0
    }

    /// Close every registered timer, delivering a `Closed` event to each.
    pub fn close_all(&self) {
        let timers: Vec<Arc<Timer>> = {
            let mut inner = self.inner.lock();
            inner.heap.clear();
            inner.deferred.clear();
            let timers = inner.timers.iter().filter_map(Weak::upgrade).collect();
            inner.timers.clear();
            timers
        };
        for timer in timers {
            if timer.close() {
                timer.arrive(TimerEvent::Closed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording_callback(record: Arc<Mutex<Vec<usize>>>, id: usize) -> TimerCallback {
        Arc::new(move |_, event| {
            if event == TimerEvent::Deadline {
                record.lock().push(id);
            }
        })
    }

    #[test]
    fn announces_in_deadline_order() {
        let chronology = Chronology::new();
        let record = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();

        let late = chronology.create_timer(
            TimerOptions::default(),
            recording_callback(Arc::clone(&record), 2),
        );
        let early = chronology.create_timer(
            TimerOptions::default(),
            recording_callback(Arc::clone(&record), 1),
        );

        late.schedule(now + Duration::from_millis(20), None);
        early.schedule(now + Duration::from_millis(10), None);

        chronology.announce(now + Duration::from_millis(30), false);
        assert_eq!(*record.lock(), vec![1, 2]);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let chronology = Chronology::new();
        let record = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();
        let deadline = now + Duration::from_millis(5);

        for id in 0..4 {
            let timer = chronology.create_timer(
                TimerOptions::default(),
                recording_callback(Arc::clone(&record), id),
            );
            timer.schedule(deadline, None);
        }

        chronology.announce(deadline, false);
        assert_eq!(*record.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let chronology = Chronology::new();
        let record = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();

        let timer = chronology.create_timer(
            TimerOptions::default(),
            recording_callback(Arc::clone(&record), 1),
        );
        timer.schedule(now + Duration::from_millis(1), None);
        assert!(timer.cancel());

        chronology.announce(now + Duration::from_millis(10), false);
        assert!(record.lock().is_empty());
        assert_eq!(chronology.num_scheduled(), 0);
    }

    #[test]
    fn reschedule_re_keys() {
        let chronology = Chronology::new();
        let record = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();

        let timer = chronology.create_timer(
            TimerOptions::default(),
            recording_callback(Arc::clone(&record), 1),
        );
        timer.schedule(now + Duration::from_millis(1), None);
        timer.schedule(now + Duration::from_millis(50), None);

        chronology.announce(now + Duration::from_millis(10), false);
        assert!(record.lock().is_empty());

        chronology.announce(now + Duration::from_millis(60), false);
        assert_eq!(*record.lock(), vec![1]);
    }

    #[test]
    fn periodic_timer_refires() {
        let chronology = Chronology::new();
        let count = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&count);
        let now = Instant::now();

        let timer = chronology.create_timer(
            TimerOptions::default(),
            Arc::new(move |_, event| {
                if event == TimerEvent::Deadline {
                    observed.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        timer.schedule(now + Duration::from_millis(10), Some(Duration::from_millis(10)));

        chronology.announce(now + Duration::from_millis(35), false);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(timer.is_scheduled());
    }

    #[test]
    fn single_stops_after_one_dispatch() {
        let chronology = Chronology::new();
        let record = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();

        for id in 0..3 {
            let timer = chronology.create_timer(
                TimerOptions::default(),
                recording_callback(Arc::clone(&record), id),
            );
            timer.schedule(now, None);
        }

        chronology.announce(now + Duration::from_millis(1), true);
        assert_eq!(record.lock().len(), 1);
        chronology.announce(now + Duration::from_millis(1), false);
        assert_eq!(record.lock().len(), 3);
    }

    #[test]
    fn deferred_functions_run_before_deadlines() {
        let chronology = Chronology::new();
        let record = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();

        let timer = chronology.create_timer(
            TimerOptions::default(),
            recording_callback(Arc::clone(&record), 2),
        );
        timer.schedule(now, None);

        let deferred_record = Arc::clone(&record);
        chronology.execute(Box::new(move || deferred_record.lock().push(1)));

        assert!(chronology.has_any_scheduled_or_deferred());
        chronology.announce(now + Duration::from_millis(1), false);
        assert_eq!(*record.lock(), vec![1, 2]);
        assert!(!chronology.has_any_scheduled_or_deferred());
    }

    #[test]
    fn timeout_interval_tracks_earliest() {
        let chronology = Chronology::new();
        let now = Instant::now();
        assert_eq!(chronology.timeout_interval(now), None);
        assert_eq!(chronology.timeout_in_milliseconds(now), -1);

        let timer = chronology
            .create_timer(TimerOptions::default(), Arc::new(|_, _| {}));
        timer.schedule(now + Duration::from_millis(250), None);

        let interval = chronology.timeout_interval(now).unwrap();
        assert!(interval <= Duration::from_millis(250));
        assert!(interval >= Duration::from_millis(200));

        timer.cancel();
        assert_eq!(chronology.timeout_interval(now), None);
    }

    #[test]
    fn close_all_delivers_closed() {
        let chronology = Chronology::new();
        let closed = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&closed);
        let now = Instant::now();

        let timer = chronology.create_timer(
            TimerOptions::default(),
            Arc::new(move |_, event| {
                if event == TimerEvent::Closed {
                    observed.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        timer.schedule(now + Duration::from_secs(60), None);

        chronology.close_all();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(timer.is_closed());
        assert!(!timer.schedule(now, None));
    }
}
