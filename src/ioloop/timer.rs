//! Timeout heap.
//!
//! Timeouts live in a `BinaryHeap` ordered by deadline, then by insertion
//! sequence. Cancelling a timeout only empties its callback slot; the entry
//! stays in the heap and is discarded when it reaches the top.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

pub(crate) type TimerCallback = Box<dyn FnOnce()>;

/// When a timeout should fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Absolute point on the monotonic clock
    At(Instant),
    /// Relative to the moment the timeout is added
    After(Duration),
}

impl Deadline {
    pub(crate) fn resolve(self, now: Instant) -> Instant {
        match self {
            Deadline::At(instant) => instant,
            Deadline::After(delay) => now + delay,
        }
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Deadline::At(instant)
    }
}

impl From<Duration> for Deadline {
    fn from(delay: Duration) -> Self {
        Deadline::After(delay)
    }
}

/// Wall-clock deadlines are converted to the monotonic clock immediately;
/// a deadline already in the past fires on the next iteration.
impl From<SystemTime> for Deadline {
    fn from(when: SystemTime) -> Self {
        match when.duration_since(SystemTime::now()) {
            Ok(delay) => Deadline::After(delay),
            Err(_) => Deadline::After(Duration::ZERO),
        }
    }
}

struct Slot {
    callback: RefCell<Option<TimerCallback>>,
}

/// Handle to a scheduled timeout
#[derive(Clone)]
pub struct Timeout {
    slot: Rc<Slot>,
    deadline: Instant,
}

impl Timeout {
    /// Drop the callback; safe to call any number of times
    pub fn cancel(&self) {
        let callback = self.slot.callback.borrow_mut().take();
        drop(callback);
    }

    /// True once cancelled or fired
    pub fn is_cancelled(&self) -> bool {
        self.slot.callback.borrow().is_none()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("deadline", &self.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    slot: Rc<Slot>,
}

impl TimerEntry {
    fn is_cancelled(&self) -> bool {
        self.slot.callback.borrow().is_none()
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    /// Reversed so the `BinaryHeap` pops the earliest deadline first;
    /// equal deadlines pop in insertion order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, deadline: Instant, callback: TimerCallback) -> Timeout {
        let slot = Rc::new(Slot {
            callback: RefCell::new(Some(callback)),
        });
        let seq = self.next_seq;
        self.next_seq += 1;

        self.heap.push(TimerEntry {
            deadline,
            seq,
            slot: Rc::clone(&slot),
        });

        Timeout { slot, deadline }
    }

    /// Pop the next live callback whose deadline is at or before `now`
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<TimerCallback> {
        loop {
            let head = self.heap.peek()?;
            if head.is_cancelled() {
                self.heap.pop();
                continue;
            }
            if head.deadline > now {
                return None;
            }

            let entry = self.heap.pop()?;
            let callback = entry.slot.callback.borrow_mut().take();
            if callback.is_some() {
                return callback;
            }
        }
    }

    /// Earliest live deadline, discarding cancelled entries on the way
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(head) = self.heap.peek() {
            if head.is_cancelled() {
                self.heap.pop();
            } else {
                return Some(head.deadline);
            }
        }
        None
    }

    /// Entries still in the heap, cancelled ones included
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn recorder(log: &Rc<RefCell<Vec<u32>>>, id: u32) -> TimerCallback {
        let log = Rc::clone(log);
        Box::new(move || log.borrow_mut().push(id))
    }

    #[test]
    fn test_pops_in_deadline_order() {
        let base = Instant::now();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut heap = TimerHeap::new();

        heap.push(base + Duration::from_millis(30), recorder(&log, 3));
        heap.push(base + Duration::from_millis(10), recorder(&log, 1));
        heap.push(base + Duration::from_millis(20), recorder(&log, 2));

        let now = base + Duration::from_millis(100);
        while let Some(cb) = heap.pop_expired(now) {
            cb();
        }
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_equal_deadlines_pop_in_insertion_order() {
        let at = Instant::now();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut heap = TimerHeap::new();

        for id in 0..16 {
            heap.push(at, recorder(&log, id));
        }
        while let Some(cb) = heap.pop_expired(at) {
            cb();
        }
        assert_eq!(*log.borrow(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_not_yet_due() {
        let base = Instant::now();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut heap = TimerHeap::new();

        heap.push(base + Duration::from_secs(5), recorder(&log, 1));
        assert!(heap.pop_expired(base).is_none());
        assert_eq!(heap.next_deadline(), Some(base + Duration::from_secs(5)));
    }

    #[test]
    fn test_cancelled_entries_are_skipped_lazily() {
        let base = Instant::now();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut heap = TimerHeap::new();

        let first = heap.push(base, recorder(&log, 1));
        heap.push(base + Duration::from_millis(1), recorder(&log, 2));

        first.cancel();
        first.cancel();
        assert!(first.is_cancelled());
        // Still physically present until it reaches the top
        assert_eq!(heap.len(), 2);

        assert_eq!(heap.next_deadline(), Some(base + Duration::from_millis(1)));
        assert_eq!(heap.len(), 1);

        while let Some(cb) = heap.pop_expired(base + Duration::from_secs(1)) {
            cb();
        }
        assert_eq!(*log.borrow(), vec![2]);
    }

    #[test]
    fn test_deadline_conversions() {
        let now = Instant::now();
        assert_eq!(Deadline::from(now).resolve(now), now);
        assert_eq!(
            Deadline::from(Duration::from_secs(2)).resolve(now),
            now + Duration::from_secs(2)
        );

        let past = SystemTime::now() - Duration::from_secs(60);
        assert_eq!(Deadline::from(past), Deadline::After(Duration::ZERO));

        match Deadline::from(SystemTime::now() + Duration::from_secs(60)) {
            Deadline::After(d) => assert!(d > Duration::from_secs(59)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
