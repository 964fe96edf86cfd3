//! Channel-backed bus for single-process deployments and tests.

use std::sync::{Mutex, mpsc};

use crate::bus::{EventBus, Subscription};

#[derive(Debug)]
pub enum InMemoryBusError {
    /// The subscriber list lock was poisoned.
    Poisoned,
}

/// One `mpsc` channel per subscriber. Subscribers whose receiver was
/// dropped are pruned on the next publish.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::Sender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        subs.retain(|tx| tx.send(message.clone()).is_ok());

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        // A poisoned lock still yields a subscription; it just never receives.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use cabinet_core::BookingId;

    use super::*;
    use crate::{Event, EventEnvelope};

    #[derive(Debug, Clone, PartialEq)]
    struct Pinged {
        at: DateTime<Utc>,
    }

    impl Event for Pinged {
        fn event_type(&self) -> &'static str {
            "booking.pinged"
        }

        fn version(&self) -> u32 {
            1
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    #[test]
    fn every_subscriber_receives_a_copy() {
        let bus: InMemoryEventBus<EventEnvelope<Pinged>> = InMemoryEventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        let envelope = EventEnvelope::wrap(BookingId::new(7), Pinged { at: Utc::now() });
        bus.publish(envelope.clone()).unwrap();

        assert_eq!(a.drain(), vec![envelope.clone()]);
        assert_eq!(b.drain(), vec![envelope]);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(1).unwrap();
        bus.publish(2).unwrap();

        assert_eq!(kept.drain(), vec![1, 2]);
        assert_eq!(bus.subscribers.lock().unwrap().len(), 1);
    }

    #[test]
    fn envelope_copies_event_metadata() {
        let at = Utc::now();
        let envelope = EventEnvelope::wrap(BookingId::new(3), Pinged { at });
        assert_eq!(envelope.event_type(), "booking.pinged");
        assert_eq!(envelope.version(), 1);
        assert_eq!(envelope.occurred_at(), at);
        assert_eq!(envelope.booking_id(), BookingId::new(3));
    }
}
