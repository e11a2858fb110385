//! Zero-copy and timestamping bookkeeping: correlating kernel error-queue
//! notifications back to user-level send operations.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use crate::error::{Error, ErrorKind};
use crate::event::{SendCallback, SendContext, SendEvent};
use crate::syscall::TimestampType;

const RING_BUFFER_SIZE: usize = 64;

/// A bounded id-keyed store of pre-send clock readings. Pushing past the
/// capacity discards the oldest entry.
#[derive(Debug)]
struct RingBuffer {
    slots: Vec<Option<(u32, SystemTime)>>,
    next_push: usize,
}

impl RingBuffer {
    fn new() -> Self {
        Self {
            slots: vec![None; RING_BUFFER_SIZE],
            next_push: 0,
        }
    }

    fn push(&mut self, id: u32, time: SystemTime) {
        self.slots[self.next_push] = Some((id, time));
        self.next_push = (self.next_push + 1) % self.slots.len();
    }

    fn extract(&mut self, id: u32) -> Option<SystemTime> {
        for slot in &mut self.slots {
            if matches!(slot, Some((stored, _)) if *stored == id) {
                return slot.take().map(|(_, time)| time);
            }
        }
        None
    }

    fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.next_push = 0;
    }
}

/// Correlates transmit timestamps obtained from a socket error queue with
/// the user-level enqueue times of the sends that produced them.
///
/// One ring buffer per timestamp kind; acknowledgement timestamps are only
/// tracked on stream transports, where the peer acknowledges data.
#[derive(Debug)]
pub struct TimestampCorrelator {
    stream: bool,
    sent: RingBuffer,
    scheduled: RingBuffer,
    acknowledged: Option<RingBuffer>,
}

impl TimestampCorrelator {
    /// Create a correlator for a stream or datagram transport.
    #[must_use]
    pub fn new(stream: bool) -> Self {
        Self {
            stream,
            sent: RingBuffer::new(),
            scheduled: RingBuffer::new(),
            acknowledged: stream.then(RingBuffer::new),
        }
    }

    /// Record the clock reading taken just before the send with `id` was
    /// submitted to the kernel.
    pub fn save_timestamp_before_send(&mut self, id: u32, time: SystemTime) {
        self.sent.push(id, time);
        self.scheduled.push(id, time);
        if let Some(acknowledged) = &mut self.acknowledged {
            acknowledged.push(id, time);
        }
    }

    /// Match a kernel notification to its saved enqueue time and return the
    /// latency, or `None` if the id was discarded by ring-buffer overflow
    /// or never saved.
    pub fn timestamp_received(
        &mut self,
        id: u32,
        timestamp_type: TimestampType,
        time: SystemTime,
    ) -> Option<Duration> {
        let buffer = match timestamp_type {
            TimestampType::Sent => &mut self.sent,
            TimestampType::Scheduled => &mut self.scheduled,
            TimestampType::Acknowledged => self.acknowledged.as_mut()?,
        };
        let enqueued = buffer.extract(id)?;
        time.duration_since(enqueued).ok()
    }

    /// True if acknowledgement timestamps are tracked.
    #[must_use]
    pub fn tracks_acknowledgements(&self) -> bool {
        self.stream
    }

    /// Discard all saved timestamps.
    pub fn reset(&mut self) {
        self.sent.reset();
        self.scheduled.reset();
        if let Some(acknowledged) = &mut self.acknowledged {
            acknowledged.reset();
        }
    }
}

/// One send whose completion awaits a kernel zero-copy acknowledgement.
pub struct ZeroCopyEntry {
    id: u32,
    context: SendContext,
    callback: Option<SendCallback>,
}

/// A FIFO correlating kernel zero-copy acknowledgement id ranges to the
/// pending send completions they cover.
///
/// Ids increase monotonically and wrap at 32 bits; outstanding entries are
/// assumed to stay below 2^31 so range membership is unambiguous.
#[derive(Default)]
pub struct ZeroCopyWaitList {
    entries: VecDeque<ZeroCopyEntry>,
    next_id: u32,
}

impl ZeroCopyWaitList {
    /// Create an empty wait list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of sends awaiting acknowledgement.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no sends await acknowledgement.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The id the next added entry will receive.
    #[must_use]
    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    /// Append a deferred completion and return its id.
    pub fn add(&mut self, context: SendContext, callback: Option<SendCallback>) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.push_back(ZeroCopyEntry {
            id,
            context,
            callback,
        });
        id
    }

    /// Complete every entry covered by the acknowledged range `[from, to]`
    /// (inclusive, possibly wrapping), in insertion order. Returns the
    /// callbacks to dispatch.
    pub fn acknowledge(&mut self, from: u32, to: u32) -> Vec<(SendCallback, SendEvent)> {
        let wraps = from > to;
        let acknowledged = if wraps {
            (u32::MAX - from).wrapping_add(to).wrapping_add(1)
        } else {
            to - from
        } as u64
            + 1;

        let mut completions = Vec::new();
        let mut matched: u64 = 0;
        let mut index = 0;
        while matched < acknowledged && index < self.entries.len() {
            let id = self.entries[index].id;
            let covered = if wraps {
                id >= from || id <= to
            } else {
                id >= from && id <= to
            };
            if covered {
                matched += 1;
                let mut entry = self.entries.remove(index).unwrap();
                if let Some(callback) = entry.callback.take() {
                    entry.context.zero_copy = true;
                    completions.push((
                        callback,
                        SendEvent {
                            event_type: crate::event::EventType::Complete,
                            context: entry.context,
                        },
                    ));
                }
            } else {
                index += 1;
            }
        }

        debug_assert_eq!(matched, acknowledged);
        completions
    }

    /// Fail every remaining entry with `Cancelled`, in insertion order.
    /// Returns the callbacks to dispatch.
    pub fn cancel_wait(&mut self) -> Vec<(SendCallback, SendEvent)> {
        let mut completions = Vec::new();
        for mut entry in self.entries.drain(..) {
            if let Some(callback) = entry.callback.take() {
                entry.context.error = Some(Error::new(ErrorKind::Cancelled));
                completions.push((
                    callback,
                    SendEvent {
                        event_type: crate::event::EventType::Error,
                        context: entry.context,
                    },
                ));
            }
        }
        completions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_callback(count: &Arc<AtomicUsize>) -> SendCallback {
        let count = Arc::clone(count);
        Box::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn acknowledges_in_insertion_order() {
        let mut list = ZeroCopyWaitList::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            list.add(SendContext::default(), Some(counting_callback(&count)));
        }

        let completions = list.acknowledge(0, 2);
        assert_eq!(completions.len(), 3);
        assert_eq!(list.len(), 2);

        for (callback, event) in completions {
            assert_eq!(event.event_type, crate::event::EventType::Complete);
            assert!(event.context.zero_copy);
            callback(event);
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn acknowledgement_range_wraps() {
        let mut list = ZeroCopyWaitList::new();
        list.next_id = u32::MAX - 1;

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            list.add(SendContext::default(), Some(counting_callback(&count)));
        }
        // Entries carry ids MAX-1, MAX, 0, 1.
        let completions = list.acknowledge(u32::MAX - 1, 1);
        assert_eq!(completions.len(), 4);
        assert!(list.is_empty());
    }

    #[test]
    fn cancel_fails_remaining_entries() {
        let mut list = ZeroCopyWaitList::new();
        list.add(SendContext::default(), None);
        let count = Arc::new(AtomicUsize::new(0));
        list.add(SendContext::default(), Some(counting_callback(&count)));

        list.acknowledge(0, 0);
        let completions = list.cancel_wait();
        assert_eq!(completions.len(), 1);
        let (callback, event) = completions.into_iter().next().unwrap();
        assert_eq!(
            event.context.error.unwrap().kind(),
            ErrorKind::Cancelled
        );
        callback(event);
        assert!(list.is_empty());
    }

    #[test]
    fn correlator_yields_latency_once_per_type() {
        let mut correlator = TimestampCorrelator::new(true);
        let enqueued = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        correlator.save_timestamp_before_send(7, enqueued);

        let reported = enqueued + Duration::from_micros(250);
        let latency = correlator
            .timestamp_received(7, TimestampType::Sent, reported)
            .unwrap();
        assert_eq!(latency, Duration::from_micros(250));

        // A second notification of the same kind finds nothing.
        assert!(correlator
            .timestamp_received(7, TimestampType::Sent, reported)
            .is_none());
        // Other kinds still match.
        assert!(correlator
            .timestamp_received(7, TimestampType::Acknowledged, reported)
            .is_some());
    }

    #[test]
    fn correlator_discards_overflowed_ids() {
        let mut correlator = TimestampCorrelator::new(false);
        let base = SystemTime::UNIX_EPOCH;
        for id in 0..=(RING_BUFFER_SIZE as u32) {
            correlator.save_timestamp_before_send(id, base);
        }
        // Id 0 was overwritten by the push past capacity.
        assert!(correlator
            .timestamp_received(0, TimestampType::Sent, base)
            .is_none());
        assert!(correlator
            .timestamp_received(1, TimestampType::Sent, base)
            .is_some());
        // Datagram correlators do not track acknowledgements.
        assert!(!correlator.tracks_acknowledgements());
        assert!(correlator
            .timestamp_received(1, TimestampType::Acknowledged, base)
            .is_none());
    }
}
