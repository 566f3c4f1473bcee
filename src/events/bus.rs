//! # Event fan-out: the bus and its subscriber streams.
//!
//! Slot workers and the pulse orchestrator publish [`Event`]s into a [`Bus`];
//! each subscriber reads its own [`EventStream`].
//!
//! Events are observability, never control flow:
//! - publishing with no subscribers is free and the event is dropped,
//! - a slow subscriber loses the oldest events instead of back-pressuring
//!   a worker,
//! - an [`EventStream`] skips over such gaps with a warning; the `seq`
//!   field on each [`Event`] still totally orders whatever was received.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::event::Event;

/// Publisher side of the conveyor's event feed.
///
/// Cloned into every slot; publication is non-blocking and infallible.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    ///
    /// The capacity comes pre-clamped from
    /// [`Config::bus_capacity_clamped`](crate::Config::bus_capacity_clamped).
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to every live stream; dropped when there is none.
    pub(crate) fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Opens a stream over all events published from now on.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }
}

/// One subscriber's view of the conveyor's event feed.
pub struct EventStream {
    rx: broadcast::Receiver<Event>,
}

impl EventStream {
    /// Receives the next event.
    ///
    /// A subscriber that fell behind skips the lost gap (with a warning)
    /// and continues from the oldest retained event. Returns `None` once
    /// the conveyor and all its slots are gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged; continuing past the gap");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Receives the next event satisfying `pred`, discarding the rest.
    pub async fn recv_matching(&mut self, pred: impl Fn(&Event) -> bool) -> Option<Event> {
        loop {
            match self.recv().await {
                Some(ev) if pred(&ev) => return Some(ev),
                Some(_) => continue,
                None => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::event::EventKind;
    use super::*;

    #[tokio::test]
    async fn streams_receive_published_events() {
        let bus = Bus::new(16);
        let mut stream = bus.subscribe();
        bus.publish(Event::now(EventKind::PulsePrepared).with_pulse(22));

        let ev = stream.recv().await.expect("bus alive");
        assert_eq!(ev.kind, EventKind::PulsePrepared);
        assert_eq!(ev.pulse, Some(22));
    }

    #[tokio::test]
    async fn recv_matching_discards_non_matching_events() {
        let bus = Bus::new(16);
        let mut stream = bus.subscribe();
        bus.publish(Event::now(EventKind::PulsePrepared));
        bus.publish(Event::now(EventKind::PulseActivated));

        let ev = stream
            .recv_matching(|e| e.kind == EventKind::PulseActivated)
            .await
            .expect("bus alive");
        assert_eq!(ev.kind, EventKind::PulseActivated);
    }

    #[tokio::test]
    async fn stream_ends_when_bus_is_dropped() {
        let bus = Bus::new(16);
        let mut stream = bus.subscribe();
        drop(bus);
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn lagged_stream_skips_the_gap() {
        let bus = Bus::new(1);
        let mut stream = bus.subscribe();
        bus.publish(Event::now(EventKind::PulsePrepared).with_pulse(1));
        bus.publish(Event::now(EventKind::PulsePrepared).with_pulse(2));

        // capacity 1: the first event was lost, the stream resumes at the
        // newest retained one
        let ev = stream.recv().await.expect("bus alive");
        assert_eq!(ev.pulse, Some(2));
    }
}
