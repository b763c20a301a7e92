//! In-process topic router for message, invoice and payment events.
//!
//! Every subscriber owns a bounded buffer of [`SUBSCRIBER_BUFFER`] events.
//! Publishing never waits: a subscriber that falls behind loses its oldest
//! events and is told how many it skipped through a `warn!` log.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::broadcast;

use lnchat_lib::client::{Invoice, Payment};
use lnchat_store::MessageAggregate;

/// Events buffered per subscriber before the oldest are dropped.
pub const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Message,
    Invoice,
    Payment,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Topic::Message => "message",
            Topic::Invoice => "invoice",
            Topic::Payment => "payment",
        })
    }
}

#[derive(Clone, Debug)]
pub enum Event {
    Message(Box<MessageAggregate>),
    Invoice(Box<Invoice>),
    Payment(Box<Payment>),
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::Message(_) => Topic::Message,
            Event::Invoice(_) => Topic::Invoice,
            Event::Payment(_) => Topic::Payment,
        }
    }
}

type Senders = Option<HashMap<Topic, broadcast::Sender<Event>>>;

pub struct Bus {
    senders: Mutex<Senders>,
}

impl Bus {
    pub fn new() -> Self {
        let senders = [Topic::Message, Topic::Invoice, Topic::Payment]
            .into_iter()
            .map(|topic| (topic, broadcast::channel(SUBSCRIBER_BUFFER).0))
            .collect();
        Self {
            senders: Mutex::new(Some(senders)),
        }
    }

    fn senders(&self) -> MutexGuard<'_, Senders> {
        self.senders.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fire-and-forget delivery to the event's topic. Returns the number of
    /// subscribers reached; zero after [`Bus::close`].
    pub fn publish(&self, event: Event) -> usize {
        let senders = self.senders();
        let Some(tx) = senders.as_ref().and_then(|s| s.get(&event.topic())) else {
            return 0;
        };
        tx.send(event).unwrap_or(0)
    }

    /// Subscribe to one topic. On a closed bus the subscription ends at once.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let rx = self
            .senders()
            .as_ref()
            .and_then(|s| s.get(&topic))
            .map(|tx| tx.subscribe());
        Subscription { topic, rx }
    }

    /// Drop every sender. Live subscriptions drain what they buffered and
    /// then end.
    pub fn close(&self) {
        self.senders().take();
    }

    pub fn is_closed(&self) -> bool {
        self.senders().is_none()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's view of a topic. Dropping it unsubscribes.
pub struct Subscription {
    topic: Topic,
    rx: Option<broadcast::Receiver<Event>>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Next event, or `None` once the bus is closed and the buffer drained.
    pub async fn recv(&mut self) -> Option<Event> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(topic = %self.topic, skipped, "slow subscriber dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lnchat_lib::test_utils::{address, invoice, payment};

    #[tokio::test]
    async fn test_each_subscriber_gets_a_copy() {
        let bus = Bus::new();
        let mut a = bus.subscribe(Topic::Invoice);
        let mut b = bus.subscribe(Topic::Invoice);
        let mut other = bus.subscribe(Topic::Payment);

        assert_eq!(bus.publish(Event::Invoice(Box::new(invoice(address(1), 1)))), 2);

        for sub in [&mut a, &mut b] {
            match sub.recv().await {
                Some(Event::Invoice(i)) => assert_eq!(i.settle_index, 1),
                other => panic!("unexpected {:?}", other),
            }
        }
        bus.close();
        assert!(other.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_loses_oldest() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(Topic::Payment);
        let total = SUBSCRIBER_BUFFER as u64 + 10;
        for i in 1..=total {
            bus.publish(Event::Payment(Box::new(payment(address(1), address(2), i))));
        }
        bus.close();

        let mut seen = Vec::new();
        while let Some(Event::Payment(p)) = sub.recv().await {
            seen.push(p.payment_index);
        }
        assert_eq!(seen.len(), SUBSCRIBER_BUFFER);
        assert_eq!(seen.first(), Some(&11));
        assert_eq!(seen.last(), Some(&total));
    }

    #[tokio::test]
    async fn test_closed_bus() {
        let bus = Bus::new();
        bus.close();
        assert!(bus.is_closed());
        assert_eq!(bus.publish(Event::Invoice(Box::new(invoice(address(1), 1)))), 0);
        assert!(bus.subscribe(Topic::Message).recv().await.is_none());
    }
}
