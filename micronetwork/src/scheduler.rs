//! Order pending work by simulated time.
//!
//! The scheduler is a min-heap keyed by `(time, sequence)`, where `sequence` is assigned on
//! insertion. Two events scheduled for the same time are therefore always dispatched in the
//! order they were scheduled, which keeps dispatch deterministic.

use crate::{node::Packet, topology::NodeId};
use bytes::Bytes;
use std::{cmp::Ordering, collections::BinaryHeap, time::Duration};

/// Work to perform when an event is dispatched.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// A node sends a packet at the event's time (used to seed initial traffic).
    Send {
        src: NodeId,
        dst: NodeId,
        payload: Bytes,
    },
    /// A packet arrives at its destination.
    Deliver(Packet),
    /// A timer fires on a node.
    Timer { node: NodeId, id: u64 },
    /// A link is partitioned (or healed).
    Partition {
        src: NodeId,
        dst: NodeId,
        partitioned: bool,
    },
}

impl Action {
    /// Node the action is addressed to, if any.
    pub fn target(&self) -> Option<&NodeId> {
        match self {
            Action::Send { src, .. } => Some(src),
            Action::Deliver(packet) => Some(&packet.dst),
            Action::Timer { node, .. } => Some(node),
            Action::Partition { .. } => None,
        }
    }
}

/// An action scheduled at a simulated time.
#[derive(Clone, Debug)]
pub struct Event {
    pub at: Duration,
    pub sequence: u64,
    pub action: Action,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.sequence == other.sequence
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse the ordering for min-heap
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Discrete-event queue and the simulation clock.
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: BinaryHeap<Event>,
    sequence: u64,
    now: Duration,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time of the last dispatched event (zero before any dispatch).
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Schedule an action at an absolute simulated time and return its sequence number.
    ///
    /// # Panics
    ///
    /// Panics if `at` is before the current time.
    pub fn schedule(&mut self, at: Duration, action: Action) -> u64 {
        assert!(
            at >= self.now,
            "cannot schedule event in the past: now={:?}, at={:?}",
            self.now,
            at
        );
        let sequence = self.sequence;
        self.sequence = self
            .sequence
            .checked_add(1)
            .expect("event sequence overflowed");
        self.queue.push(Event {
            at,
            sequence,
            action,
        });
        sequence
    }

    /// Pop the earliest event and advance the clock to its time.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Event> {
        let event = self.queue.pop()?;
        assert!(
            event.at >= self.now,
            "time went backward: now={:?}, event={:?}",
            self.now,
            event.at
        );
        self.now = event.at;
        Some(event)
    }

    /// Time of the earliest pending event.
    pub fn peek(&self) -> Option<Duration> {
        self.queue.peek().map(|event| event.at)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn timer(id: u64) -> Action {
        Action::Timer {
            node: NodeId::from("a"),
            id,
        }
    }

    fn timer_id(event: &Event) -> u64 {
        match event.action {
            Action::Timer { id, .. } => id,
            _ => panic!("unexpected action"),
        }
    }

    #[test_traced]
    fn test_empty() {
        let mut scheduler = Scheduler::new();
        assert_eq!(scheduler.now(), Duration::ZERO);
        assert!(scheduler.next().is_none());
        assert!(scheduler.peek().is_none());
    }

    #[test_traced]
    fn test_min_heap() {
        let mut scheduler = Scheduler::new();
        for (id, ms) in [(0, 10), (1, 5), (2, 15), (3, 5)] {
            scheduler.schedule(Duration::from_millis(ms), timer(id));
        }
        assert_eq!(scheduler.len(), 4);
        assert_eq!(scheduler.peek(), Some(Duration::from_millis(5)));

        let mut order = Vec::new();
        while let Some(event) = scheduler.next() {
            assert_eq!(scheduler.now(), event.at);
            order.push(timer_id(&event));
        }
        assert_eq!(order, vec![1, 3, 0, 2]);
        assert_eq!(scheduler.now(), Duration::from_millis(15));
    }

    #[test_traced]
    fn test_fifo_at_same_time() {
        let mut scheduler = Scheduler::new();
        for id in 0..100 {
            scheduler.schedule(Duration::from_millis(7), timer(id));
        }
        let order: Vec<_> = std::iter::from_fn(|| scheduler.next())
            .map(|event| timer_id(&event))
            .collect();
        assert_eq!(order, (0..100).collect::<Vec<_>>());
    }

    #[test_traced]
    fn test_random_order_is_time_then_insertion() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut scheduler = Scheduler::new();
        let mut expected = Vec::new();
        for id in 0..1_000 {
            let at = Duration::from_millis(rng.gen_range(0..50));
            scheduler.schedule(at, timer(id));
            expected.push((at, id));
        }
        expected.sort();

        let mut dispatched = Vec::new();
        while let Some(event) = scheduler.next() {
            dispatched.push((event.at, timer_id(&event)));
        }
        assert_eq!(dispatched, expected);
    }

    #[test_traced]
    fn test_schedule_at_now_after_dispatch() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(Duration::from_millis(10), timer(0));
        scheduler.next().unwrap();
        scheduler.schedule(Duration::from_millis(10), timer(1));
        let event = scheduler.next().unwrap();
        assert_eq!(timer_id(&event), 1);
        assert_eq!(event.at, Duration::from_millis(10));
    }

    #[test_traced]
    #[should_panic(expected = "cannot schedule event in the past")]
    fn test_schedule_in_past() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(Duration::from_millis(10), timer(0));
        scheduler.next().unwrap();
        scheduler.schedule(Duration::from_millis(9), timer(1));
    }
}
