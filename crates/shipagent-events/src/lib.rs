//! Event Bus (§4.8): in-process publish/subscribe fan-out of job/row
//! lifecycle events. Subscribers are non-blocking consumers with bounded
//! per-subscriber buffers; a slow subscriber drops its oldest *progress*
//! events but a publisher blocks (briefly) rather than drop a *terminal*
//! event — `*.completed` and `*.failed` must always reach every live
//! subscriber. The bus owns no application state; it is a pure fan-out, the
//! way the teacher's own event log is a pure append, generalized here from
//! file persistence to live delivery.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobStatus,
    RowStart,
    RowRated,
    RowShipped,
    RowFailed,
    RowSkipped,
    BatchProgress,
    PreviewReady,
    JobCompleted,
    JobFailed,
}

impl EventKind {
    /// Mirrors the `*.completed` / `*.failed` glob from §4.8: these are
    /// never dropped, even by a slow subscriber.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventKind::JobCompleted | EventKind::JobFailed | EventKind::RowFailed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub job_id: Uuid,
    pub row_number: Option<u32>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, job_id: Uuid, row_number: Option<u32>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            job_id,
            row_number,
            payload,
            timestamp: Utc::now(),
        }
    }
}

struct Mailbox {
    queue: Mutex<VecDeque<Event>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Terminal events block the publisher (briefly) until there is room,
    /// rather than ever being silently dropped. Progress events instead
    /// drop the oldest queued entry to make room.
    fn push(&self, event: Event) {
        let mut queue = self.queue.lock().unwrap();
        if event.kind.is_terminal() {
            while queue.len() >= self.capacity {
                queue = self.not_full.wait(queue).unwrap();
            }
            queue.push_back(event);
        } else {
            if queue.len() >= self.capacity {
                queue.pop_front();
            }
            queue.push_back(event);
        }
        self.not_empty.notify_one();
    }

    fn recv(&self, timeout: Option<Duration>) -> Option<Event> {
        let mut queue = self.queue.lock().unwrap();
        if queue.is_empty() {
            queue = match timeout {
                Some(timeout) => {
                    let (guard, _) = self.not_empty.wait_timeout(queue, timeout).unwrap();
                    guard
                }
                None => self.not_empty.wait(queue).unwrap(),
            };
        }
        let event = queue.pop_front();
        self.not_full.notify_one();
        event
    }
}

/// A live subscription. Dropping it unregisters from the bus so the
/// publisher stops paying to fan out to a dead mailbox.
pub struct Subscriber {
    mailbox: Arc<Mailbox>,
    bus: Arc<EventBusInner>,
    id: u64,
}

impl Subscriber {
    /// Blocks until an event arrives or `timeout` elapses.
    pub fn recv(&self, timeout: Duration) -> Option<Event> {
        self.mailbox.recv(Some(timeout))
    }

    /// Blocks indefinitely for the next event.
    pub fn recv_blocking(&self) -> Event {
        loop {
            if let Some(event) = self.mailbox.recv(Some(Duration::from_secs(60))) {
                return event;
            }
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.bus.mailboxes.lock().unwrap().retain(|(id, _)| *id != self.id);
    }
}

struct EventBusInner {
    mailboxes: Mutex<Vec<(u64, Arc<Mailbox>)>>,
    next_id: Mutex<u64>,
    default_capacity: usize,
}

/// Publisher/registrar handle. Cheaply cloneable; every clone publishes to
/// the same set of subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl EventBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                mailboxes: Mutex::new(Vec::new()),
                next_id: Mutex::new(0),
                default_capacity,
            }),
        }
    }

    /// Registers a new subscriber with the bus's default buffer capacity.
    pub fn subscribe(&self) -> Subscriber {
        self.subscribe_with_capacity(self.inner.default_capacity)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscriber {
        let mailbox = Arc::new(Mailbox::new(capacity.max(1)));
        let mut id_guard = self.inner.next_id.lock().unwrap();
        let id = *id_guard;
        *id_guard += 1;
        drop(id_guard);
        self.inner
            .mailboxes
            .lock()
            .unwrap()
            .push((id, mailbox.clone()));
        Subscriber {
            mailbox,
            bus: self.inner.clone(),
            id,
        }
    }

    /// Fans `event` out to every live subscriber. Per-row events for a
    /// given row are delivered in emission order because each mailbox is a
    /// FIFO and publish holds no cross-subscriber lock while blocking on
    /// one terminal push — a slow subscriber can only delay itself.
    pub fn publish(&self, event: Event) {
        let mailboxes: Vec<Arc<Mailbox>> = self
            .inner
            .mailboxes
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m)| m.clone())
            .collect();
        for mailbox in mailboxes {
            mailbox.push(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.mailboxes.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn sample_event(kind: EventKind) -> Event {
        Event::new(kind, Uuid::new_v4(), Some(1), serde_json::json!({}))
    }

    #[test]
    fn subscriber_receives_published_event() {
        let bus = EventBus::new(16);
        let sub = bus.subscribe();
        bus.publish(sample_event(EventKind::RowStart));
        let received = sub.recv(Duration::from_millis(100));
        assert!(received.is_some());
    }

    #[test]
    fn drops_only_progress_class_events_when_full() {
        let bus = EventBus::new(2);
        let sub = bus.subscribe();
        bus.publish(sample_event(EventKind::RowStart));
        bus.publish(sample_event(EventKind::RowRated));
        bus.publish(sample_event(EventKind::RowShipped)); // should drop RowStart

        let first = sub.recv(Duration::from_millis(100)).unwrap();
        assert_eq!(first.kind, EventKind::RowRated);
        let second = sub.recv(Duration::from_millis(100)).unwrap();
        assert_eq!(second.kind, EventKind::RowShipped);
    }

    #[test]
    fn terminal_events_are_never_silently_dropped() {
        let bus = EventBus::new(1);
        let sub = bus.subscribe();
        bus.publish(sample_event(EventKind::RowStart)); // fills the buffer

        let publisher_bus = bus.clone();
        let handle = thread::spawn(move || {
            publisher_bus.publish(sample_event(EventKind::JobCompleted));
        });

        // Drain the buffer so the blocked terminal publish can proceed.
        thread::sleep(Duration::from_millis(20));
        let drained = sub.recv(Duration::from_millis(200)).unwrap();
        assert_eq!(drained.kind, EventKind::RowStart);
        handle.join().unwrap();

        let terminal = sub.recv(Duration::from_millis(200)).unwrap();
        assert_eq!(terminal.kind, EventKind::JobCompleted);
    }

    #[test]
    fn unsubscribed_dropped_receiver_stops_counting() {
        let bus = EventBus::new(16);
        {
            let _sub = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn row_failed_is_classified_terminal() {
        assert!(EventKind::RowFailed.is_terminal());
        assert!(!EventKind::RowRated.is_terminal());
        assert!(!EventKind::BatchProgress.is_terminal());
    }
}
