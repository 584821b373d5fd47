//! Topic-keyed publish/subscribe bus.
//!
//! Subscribers hand the bus an unbounded sender; delivery to the subscribers
//! of one topic happens in publish order (sends occur while the table lock is
//! held, so two publishes to the same topic cannot interleave). Subscription
//! transitions are edge-triggered: the 0→1 and 1→0 size changes of a topic's
//! subscriber set — measured atomically with the add/remove — publish
//! [`Message::FirstSubscriber`] / [`Message::LastSubscriber`] on the
//! [`topics::LIFECYCLE`](super::topics::LIFECYCLE) topic, through the bus
//! itself like any other message.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use uuid::Uuid;

use super::{Message, topics};

pub type SubscriberId = Uuid;

struct Subscriber {
    id: SubscriberId,
    sender: UnboundedSender<Message>,
}

/// Process-wide subscription table. Constructed once at startup and shared
/// by reference; all mutation goes through [`subscribe`](Self::subscribe) and
/// [`unsubscribe`](Self::unsubscribe).
#[derive(Default)]
pub struct MessageBus {
    table: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `message` to every current subscriber of `topic`, in order.
    ///
    /// A send to a dropped receiver is ignored; the entry stays in the table
    /// until its owner unsubscribes, so size transitions remain the exclusive
    /// business of subscribe/unsubscribe.
    pub fn publish(&self, topic: &str, message: Message) {
        let table = self.table.lock().expect("bus table lock poisoned");
        if let Some(subscribers) = table.get(topic) {
            for subscriber in subscribers {
                let _ = subscriber.sender.send(message.clone());
            }
        }
    }

    /// Add `sender` to the topic's subscriber set and return the handle id
    /// used to unsubscribe. A 0→1 size transition publishes
    /// `FirstSubscriber(topic)` exactly once.
    pub fn subscribe(&self, topic: &str, sender: UnboundedSender<Message>) -> SubscriberId {
        let id = Uuid::new_v4();
        let first = {
            let mut table = self.table.lock().expect("bus table lock poisoned");
            let subscribers = table.entry(topic.to_string()).or_default();
            subscribers.push(Subscriber { id, sender });
            subscribers.len() == 1
        };

        debug!(topic, %id, first, "subscribed");
        if first {
            self.publish(
                topics::LIFECYCLE,
                Message::FirstSubscriber {
                    topic: topic.to_string(),
                },
            );
        }
        id
    }

    /// Remove a subscriber from the topic. Unsubscribing an absent handle is
    /// a no-op. A 1→0 size transition publishes `LastSubscriber(topic)`
    /// exactly once.
    pub fn unsubscribe(&self, topic: &str, id: SubscriberId) {
        let last = {
            let mut table = self.table.lock().expect("bus table lock poisoned");
            match table.get_mut(topic) {
                Some(subscribers) => {
                    let before = subscribers.len();
                    subscribers.retain(|s| s.id != id);
                    before > 0 && subscribers.is_empty()
                }
                None => false,
            }
        };

        debug!(topic, %id, last, "unsubscribed");
        if last {
            self.publish(
                topics::LIFECYCLE,
                Message::LastSubscriber {
                    topic: topic.to_string(),
                },
            );
        }
    }

    /// Current subscriber count for a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.table
            .lock()
            .expect("bus table lock poisoned")
            .get(topic)
            .map_or(0, Vec::len)
    }
}
