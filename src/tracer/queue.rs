use std::collections::VecDeque;

use tokio::sync::Notify;

use super::event::NormalizedEvent;

/// Outcome of a push onto the ingest queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Event enqueued without loss.
    Queued,
    /// Queue was full; the oldest queued event was discarded to make room.
    DroppedOldest,
    /// Queue already closed; the event was discarded.
    Closed,
}

/// Bounded single-consumer event queue with drop-oldest overflow.
///
/// The reader side never blocks: on overflow the oldest queued event is
/// evicted so fresh events always land. The consumer awaits on a
/// [`Notify`] and observes a `None` sentinel once the queue is closed and
/// drained.
pub struct EventQueue {
    inner: parking_lot::Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

struct Inner {
    buf: VecDeque<NormalizedEvent>,
    closed: bool,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: parking_lot::Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue an event, evicting the oldest entry when full.
    pub fn push(&self, event: NormalizedEvent) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }

            let outcome = if inner.buf.len() >= self.capacity {
                inner.buf.pop_front();
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            inner.buf.push_back(event);
            outcome
        };

        self.notify.notify_one();
        outcome
    }

    /// Close the queue. Pending events remain receivable; afterwards
    /// `recv` yields `None`.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Receive the next event, awaiting if the queue is empty.
    /// Returns `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<NormalizedEvent> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(event) = inner.buf.pop_front() {
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Receive without waiting; `None` when the queue is empty.
    pub fn try_pop(&self) -> Option<NormalizedEvent> {
        self.inner.lock().buf.pop_front()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
