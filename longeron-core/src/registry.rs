//! The demultiplexer's socket registry: per-handle interest, event sinks,
//! and the detach protocol for safe teardown under concurrent dispatch.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chronology::Job;
use crate::error::{Error, ErrorKind, Result};

/// How the demultiplexer reports readiness for a registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TriggerMode {
    /// Report readiness while the condition holds.
    #[default]
    Level,
    /// Report readiness once per transition into the condition.
    Edge,
}

/// The set of conditions a registration wants reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterestSet {
    /// Report when the handle is readable.
    pub want_readable: bool,
    /// Report when the handle is writable.
    pub want_writable: bool,
    /// Report handle errors.
    pub want_error: bool,
    /// Report error-queue notifications (zero-copy, timestamps).
    pub want_notifications: bool,
    /// Level or edge reporting.
    pub trigger: TriggerMode,
    /// Disarm an interest after reporting it once.
    pub one_shot: bool,
}

impl InterestSet {
    /// An interest set wanting nothing.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// True if no condition is wanted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.want_readable && !self.want_writable && !self.want_error && !self.want_notifications
    }
}

// Packing of the detach word: the top two bits carry the state and the low
// thirty bits count in-flight event deliveries.
const STATE_MASK: u32 = 0xC000_0000;
const COUNT_MASK: u32 = 0x3FFF_FFFF;
const ATTACHED: u32 = 0;
const DETACHING: u32 = 1 << 30;
const DETACHED: u32 = 1 << 31;

/// How far a detach request has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachProgress {
    /// No work was in flight; the handle is detached now.
    Complete,
    /// Deliveries are still in flight; the detach callback fires when the
    /// last reference drains.
    Pending,
}

/// A packed-atomic state machine that reference-counts in-flight event
/// deliveries for a handle and serializes safe teardown.
///
/// Once `detach` has been requested no new reference can be acquired, and
/// whichever release observes the count reach zero under `Detaching` wins
/// responsibility for the detach callback, exactly once.
#[derive(Debug, Default)]
pub struct DetachContext {
    value: AtomicU32,
}

impl DetachContext {
    /// Create a context in the attached state with no references.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to acquire a reference for an event delivery. Fails once a
    /// detach has been requested.
    pub fn increment_reference(&self) -> bool {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            if current & STATE_MASK != ATTACHED {
                return false;
            }
            let next = ATTACHED | ((current & COUNT_MASK) + 1);
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Release a reference. Returns true iff this release completed a
    /// pending detach, in which case the caller must invoke the detach
    /// callback.
    pub fn decrement_reference(&self) -> bool {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            let state = current & STATE_MASK;
            let count = current & COUNT_MASK;
            debug_assert!(state != DETACHED);
            debug_assert!(count > 0);

            let (next, fires) = if state == DETACHING && count == 1 {
                (DETACHED, true)
            } else {
                (state | (count - 1), false)
            };
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return fires,
                Err(observed) => current = observed,
            }
        }
    }

    /// Request detachment. `Complete` means no deliveries were in flight
    /// and the caller owns the detach callback; `Pending` means the last
    /// release will fire it. Fails with `Invalid` once already detached,
    /// and with `Pending` if a detach is already in progress.
    pub fn detach(&self) -> Result<DetachProgress> {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            let state = current & STATE_MASK;
            let count = current & COUNT_MASK;

            if state == DETACHED {
                return Err(Error::new(ErrorKind::Invalid));
            }
            if state == DETACHING {
                return Err(Error::new(ErrorKind::Pending));
            }

            let (next, progress) = if count == 0 {
                (DETACHED, DetachProgress::Complete)
            } else {
                (DETACHING | count, DetachProgress::Pending)
            };
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(progress),
                Err(observed) => current = observed,
            }
        }
    }

    /// True if the context has reached the terminal detached state.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.value.load(Ordering::Acquire) & STATE_MASK == DETACHED
    }
}

/// The hooks a socket registers to consume reactor events.
pub trait ReactorSocket: Send + Sync {
    /// The handle is ready for a non-blocking read attempt.
    fn process_readable(&self);

    /// The handle is ready for a non-blocking write attempt.
    fn process_writable(&self);

    /// The handle reported an error condition.
    fn process_error(&self, error: Error);

    /// The handle's error queue holds notifications (zero-copy
    /// acknowledgements, transmit timestamps).
    fn process_notifications(&self) {}
}

/// A callback registered for one readiness condition of a handle-only
/// registration.
pub type EventCallback = Arc<dyn Fn(&ReactorEvent) + Send + Sync>;

/// A readiness report delivered to a handle-only registration.
#[derive(Debug, Clone)]
pub struct ReactorEvent {
    /// The registry token the event belongs to.
    pub token: usize,
    /// The handle is readable.
    pub readable: bool,
    /// The handle is writable.
    pub writable: bool,
    /// The folded error, when the backend reported an error condition.
    pub error: Option<Error>,
}

/// The sinks of a registration: either one socket session or individual
/// per-condition callbacks.
#[derive(Default)]
pub(crate) struct EntrySinks {
    pub(crate) socket: Option<Arc<dyn ReactorSocket>>,
    pub(crate) readable: Option<EventCallback>,
    pub(crate) writable: Option<EventCallback>,
    pub(crate) error: Option<EventCallback>,
}

/// Per-handle state owned by a demultiplexer.
pub struct RegistryEntry {
    token: usize,
    #[cfg(unix)]
    handle: std::os::unix::io::RawFd,
    interest: Mutex<InterestSet>,
    sinks: Mutex<EntrySinks>,
    detach: DetachContext,
    detach_callback: Mutex<Option<Job>>,
}

impl RegistryEntry {
    pub(crate) fn new(
        token: usize,
        #[cfg(unix)] handle: std::os::unix::io::RawFd,
        interest: InterestSet,
        sinks: EntrySinks,
    ) -> Self {
        Self {
            token,
            #[cfg(unix)]
            handle,
            interest: Mutex::new(interest),
            sinks: Mutex::new(sinks),
            detach: DetachContext::new(),
            detach_callback: Mutex::new(None),
        }
    }

    /// The registry token of this entry.
    #[must_use]
    pub fn token(&self) -> usize {
        self.token
    }

    /// The OS handle of this entry.
    #[cfg(unix)]
    #[must_use]
    pub fn handle(&self) -> std::os::unix::io::RawFd {
        self.handle
    }

    /// The current interest set.
    #[must_use]
    pub fn interest(&self) -> InterestSet {
        *self.interest.lock()
    }

    /// Replace the interest set, returning the previous one.
    pub fn set_interest(&self, interest: InterestSet) -> InterestSet {
        std::mem::replace(&mut *self.interest.lock(), interest)
    }

    /// Update the interest set in place.
    pub fn update_interest(&self, update: impl FnOnce(&mut InterestSet)) -> InterestSet {
        let mut interest = self.interest.lock();
        update(&mut interest);
        *interest
    }

    /// The detach context guarding this entry.
    #[must_use]
    pub fn detach_context(&self) -> &DetachContext {
        &self.detach
    }

    /// Store the function to invoke when detachment completes.
    pub fn set_detach_callback(&self, callback: Job) {
        *self.detach_callback.lock() = Some(callback);
    }

    /// Take the detach callback, if still present.
    pub(crate) fn take_detach_callback(&self) -> Option<Job> {
        self.detach_callback.lock().take()
    }

    /// The socket session, if this is a socket-scoped registration.
    pub(crate) fn socket(&self) -> Option<Arc<dyn ReactorSocket>> {
        self.sinks.lock().socket.clone()
    }

    /// The callback for the given condition, if this is a handle-only
    /// registration. Callbacks are cloned out under the lock and invoked
    /// outside it.
    pub(crate) fn callback(&self, condition: EntryCondition) -> Option<EventCallback> {
        let sinks = self.sinks.lock();
        match condition {
            EntryCondition::Readable => sinks.readable.clone(),
            EntryCondition::Writable => sinks.writable.clone(),
            EntryCondition::Error => sinks.error.clone(),
        }
    }

    /// Drop all sinks, breaking reference cycles at teardown.
    pub(crate) fn clear_sinks(&self) {
        let mut sinks = self.sinks.lock();
        sinks.socket = None;
        sinks.readable = None;
        sinks.writable = None;
        sinks.error = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryCondition {
    Readable,
    Writable,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn detach_with_no_references_completes_now() {
        let context = DetachContext::new();
        assert_eq!(context.detach().unwrap(), DetachProgress::Complete);
        assert!(context.is_detached());
        assert!(context.detach().is_err());
    }

    #[test]
    fn detach_waits_for_references() {
        let context = DetachContext::new();
        assert!(context.increment_reference());
        assert!(context.increment_reference());

        assert_eq!(context.detach().unwrap(), DetachProgress::Pending);
        assert!(!context.increment_reference());
        assert!(!context.is_detached());

        assert!(!context.decrement_reference());
        assert!(context.decrement_reference());
        assert!(context.is_detached());
    }

    #[test]
    fn detach_while_detaching_reports_pending() {
        let context = DetachContext::new();
        assert!(context.increment_reference());
        assert_eq!(context.detach().unwrap(), DetachProgress::Pending);
        let error = context.detach().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Pending);
    }

    #[test]
    fn detach_callback_fires_exactly_once_under_contention() {
        for _ in 0..50 {
            let context = Arc::new(DetachContext::new());
            let fired = Arc::new(AtomicUsize::new(0));

            for _ in 0..4 {
                assert!(context.increment_reference());
            }

            let mut handles = Vec::new();
            for _ in 0..4 {
                let context = Arc::clone(&context);
                let fired = Arc::clone(&fired);
                handles.push(thread::spawn(move || {
                    if context.decrement_reference() {
                        fired.fetch_add(1, Ordering::SeqCst);
                    }
                }));
            }

            let detacher = {
                let context = Arc::clone(&context);
                let fired = Arc::clone(&fired);
                thread::spawn(move || match context.detach() {
                    Ok(DetachProgress::Complete) => {
                        fired.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(DetachProgress::Pending) | Err(_) => {}
                })
            };

            for handle in handles {
                handle.join().unwrap();
            }
            detacher.join().unwrap();

            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert!(context.is_detached());
        }
    }

    #[test]
    fn interest_set_queries() {
        let mut interest = InterestSet::none();
        assert!(interest.is_empty());
        interest.want_readable = true;
        assert!(!interest.is_empty());
        assert_eq!(interest.trigger, TriggerMode::Level);
    }
}
