//! Event queues and counting events.
//!
//! Both support blocking waits with a deadline through a mutex/condvar
//! pair; the only producer is the event-processing thread, so no
//! cooperative scheduling is involved.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::ni::NiParent;
use crate::pool::{Handle, PoolKind, Pooled};

/// What an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// An inbound put landed on a target-side entry.
    Put,
    /// An inbound get was served from a target-side entry.
    Get,
    /// An initiator-side send left the node.
    Send,
    /// An acknowledgement arrived for an initiator-side operation.
    Ack,
    /// A reply arrived for an initiator-side get.
    Reply,
}

/// One delivered event.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    /// Handle of the resource the event concerns (MD, LE or ME).
    pub resource: Handle,
    pub match_bits: u64,
    pub nbytes: usize,
    /// `None` on success, the failure otherwise.
    pub fail: Option<Error>,
}

struct EqRing {
    entries: VecDeque<Event>,
    capacity: usize,
    /// Set when a push found the ring full; surfaced to the next waiter.
    overflowed: bool,
}

/// Default event ring capacity, overridable per queue.
const DEFAULT_EQ_CAPACITY: usize = 64;

/// A bounded event queue.
pub struct Eq {
    pub(crate) parent: NiParent,
    ring: Mutex<EqRing>,
    avail: Condvar,
}

impl Eq {
    pub(crate) fn new() -> Self {
        Eq {
            parent: NiParent::new(),
            ring: Mutex::new(EqRing {
                entries: VecDeque::new(),
                capacity: DEFAULT_EQ_CAPACITY,
                overflowed: false,
            }),
            avail: Condvar::new(),
        }
    }

    /// Resize the ring. Applies to subsequent pushes only.
    pub fn set_capacity(&self, capacity: usize) {
        self.ring.lock().unwrap().capacity = capacity.max(1);
    }

    /// Append an event. Returns `false` and marks the queue overflowed if
    /// the ring is full; the event is dropped in that case.
    pub fn push(&self, event: Event) -> bool {
        let mut ring = self.ring.lock().unwrap();
        if ring.entries.len() >= ring.capacity {
            ring.overflowed = true;
            log::warn!("eq overflow, dropping {:?} event", event.kind);
            return false;
        }
        ring.entries.push_back(event);
        drop(ring);
        self.avail.notify_one();
        true
    }

    /// Pop the oldest event without blocking.
    pub fn poll(&self) -> Option<Event> {
        self.ring.lock().unwrap().entries.pop_front()
    }

    /// Block until an event is available or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Option<Event> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.lock().unwrap();
        loop {
            if let Some(ev) = ring.entries.pop_front() {
                return Some(ev);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (r, _) = self.avail.wait_timeout(ring, deadline - now).unwrap();
            ring = r;
        }
    }

    /// Whether the ring dropped an event since the last check; clears the
    /// flag.
    pub fn take_overflow(&self) -> bool {
        std::mem::take(&mut self.ring.lock().unwrap().overflowed)
    }

    /// Number of events waiting.
    pub fn len(&self) -> usize {
        self.ring.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Pooled for Eq {
    const KIND: PoolKind = PoolKind::Eq;

    fn on_checkin(&self) {
        {
            let mut ring = self.ring.lock().unwrap();
            ring.entries.clear();
            ring.capacity = DEFAULT_EQ_CAPACITY;
            ring.overflowed = false;
        }
        self.parent.clear();
    }
}

/// A snapshot of a counting event's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CtValue {
    pub success: u64,
    pub failure: u64,
}

/// A counting event: two monotonic counters with threshold waits.
pub struct Ct {
    pub(crate) parent: NiParent,
    value: Mutex<CtValue>,
    bumped: Condvar,
}

impl Ct {
    pub(crate) fn new() -> Self {
        Ct {
            parent: NiParent::new(),
            value: Mutex::new(CtValue::default()),
            bumped: Condvar::new(),
        }
    }

    /// Add to the counters and wake threshold waiters.
    pub fn add(&self, success: u64, failure: u64) {
        let mut value = self.value.lock().unwrap();
        value.success += success;
        value.failure += failure;
        drop(value);
        self.bumped.notify_all();
    }

    pub fn get(&self) -> CtValue {
        *self.value.lock().unwrap()
    }

    /// Block until `success + failure >= threshold` or `timeout` elapses.
    /// Returns the counter snapshot that satisfied the wait, if any.
    pub fn wait(&self, threshold: u64, timeout: Duration) -> Option<CtValue> {
        let deadline = Instant::now() + timeout;
        let mut value = self.value.lock().unwrap();
        loop {
            if value.success + value.failure >= threshold {
                return Some(*value);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (v, _) = self.bumped.wait_timeout(value, deadline - now).unwrap();
            value = v;
        }
    }
}

impl Pooled for Ct {
    const KIND: PoolKind = PoolKind::Ct;

    fn on_checkin(&self) {
        *self.value.lock().unwrap() = CtValue::default();
        self.parent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn event(kind: EventKind) -> Event {
        Event {
            kind,
            resource: Handle::NONE,
            match_bits: 0,
            nbytes: 0,
            fail: None,
        }
    }

    #[test]
    fn wait_returns_pushed_event() {
        let eq = Arc::new(Eq::new());
        let producer = eq.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(event(EventKind::Put));
        });
        let ev = eq.wait(Duration::from_secs(2)).unwrap();
        assert_eq!(ev.kind, EventKind::Put);
        t.join().unwrap();
    }

    #[test]
    fn wait_times_out_when_empty() {
        let eq = Eq::new();
        assert!(eq.wait(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn overflow_drops_and_flags() {
        let eq = Eq::new();
        eq.set_capacity(2);
        assert!(eq.push(event(EventKind::Send)));
        assert!(eq.push(event(EventKind::Send)));
        assert!(!eq.push(event(EventKind::Send)));
        assert!(eq.take_overflow());
        assert!(!eq.take_overflow());
        assert_eq!(eq.len(), 2);
    }

    #[test]
    fn failed_event_carries_error() {
        let eq = Eq::new();
        let mut ev = event(EventKind::Ack);
        ev.fail = Some(Error::ConnectionFailed);
        assert!(eq.push(ev));
        assert_eq!(eq.poll().unwrap().fail, Some(Error::ConnectionFailed));
    }

    #[test]
    fn ct_threshold_wait() {
        let ct = Arc::new(Ct::new());
        let bumper = ct.clone();
        let t = std::thread::spawn(move || {
            for _ in 0..3 {
                std::thread::sleep(Duration::from_millis(10));
                bumper.add(1, 0);
            }
        });
        let value = ct.wait(3, Duration::from_secs(2)).unwrap();
        assert_eq!(value.success + value.failure, 3);
        t.join().unwrap();

        assert!(ct.wait(10, Duration::from_millis(10)).is_none());
    }
}
