//! The event bus is a central actor that receives events from all parts of
//! the system and fans them out to interested subscribers. The reactor holds
//! one subscription for the lifetime of the process; the bundled execution
//! clients publish the commands they fire as new events.

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::num::Wrapping;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{info, instrument, warn};

/// A single message published on the bus. The tag is a hierarchical,
/// slash-delimited string (e.g. `reactord/job/1234/new`) and the data payload
/// is an arbitrary structured value. Events are immutable once published.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub tag: String,
    pub data: Value,
}

/// A request to publish an event to the bus
pub enum PublishEventRequest {
    Event { event: Event },
}

/// A request to subscribe to events flowing over the bus
pub enum SubscriptionRequest {
    /// Subscribes to every event. Each event is delivered exactly once per
    /// subscriber, in publish order.
    AllEvents { channel: UnboundedSender<Event> },
}

pub fn start_event_bus() -> (
    UnboundedSender<PublishEventRequest>,
    UnboundedSender<SubscriptionRequest>,
) {
    let (publish_sender, publish_receiver) = unbounded_channel();
    let (sub_sender, sub_receiver) = unbounded_channel();
    let actor = Actor::new(publish_receiver, sub_receiver);
    tokio::spawn(actor.run());

    (publish_sender, sub_sender)
}

struct Subscriber {
    id: usize,
    channel: UnboundedSender<Event>,
}

enum FutureResult {
    AllPublishConsumersGone,
    AllSubscriptionRequestConsumersGone,
    NewPublishRequest(PublishEventRequest, UnboundedReceiver<PublishEventRequest>),
    NewSubscriptionRequest(SubscriptionRequest, UnboundedReceiver<SubscriptionRequest>),
    SubscriberGone(usize),
}

struct Actor {
    futures: FuturesUnordered<BoxFuture<'static, FutureResult>>,
    next_subscriber_id: Wrapping<usize>,
    active_subscriber_ids: HashSet<usize>,
    subscribers: Vec<Subscriber>,
    new_subscribers_can_join: bool,
}

impl Actor {
    fn new(
        publish_receiver: UnboundedReceiver<PublishEventRequest>,
        subscribe_receiver: UnboundedReceiver<SubscriptionRequest>,
    ) -> Self {
        let futures = FuturesUnordered::new();
        futures.push(wait_for_publish_request(publish_receiver).boxed());
        futures.push(wait_for_subscription_request(subscribe_receiver).boxed());

        Actor {
            futures,
            next_subscriber_id: Wrapping(0),
            active_subscriber_ids: HashSet::new(),
            subscribers: Vec::new(),
            new_subscribers_can_join: true,
        }
    }

    #[instrument(name = "Event Bus Execution", skip(self))]
    async fn run(mut self) {
        info!("Starting event bus");

        while let Some(result) = self.futures.next().await {
            match result {
                FutureResult::AllPublishConsumersGone => {
                    info!("All publish request consumers are gone. No new events can come in");
                    break;
                }

                FutureResult::AllSubscriptionRequestConsumersGone => {
                    warn!("All subscription request consumers gone. No new subscribers can join");

                    // Existing subscribers may still be interested in events,
                    // so the bus only closes once they are gone too.
                    self.new_subscribers_can_join = false;
                }

                FutureResult::SubscriberGone(id) => {
                    self.active_subscriber_ids.remove(&id);
                    for index in 0..self.subscribers.len() {
                        if self.subscribers[index].id == id {
                            self.subscribers.remove(index);
                            break;
                        }
                    }
                }

                FutureResult::NewPublishRequest(request, receiver) => {
                    self.futures
                        .push(wait_for_publish_request(receiver).boxed());
                    self.handle_publish_request(request);
                }

                FutureResult::NewSubscriptionRequest(request, receiver) => {
                    self.futures
                        .push(wait_for_subscription_request(receiver).boxed());
                    self.handle_subscription_request(request);
                }
            }

            if !self.new_subscribers_can_join && self.subscribers.is_empty() {
                info!("All subscribers are gone and no new subscribers can join. Closing");
                break;
            }
        }

        info!("Closing event bus");
    }

    fn handle_publish_request(&mut self, request: PublishEventRequest) {
        match request {
            PublishEventRequest::Event { event } => {
                for subscriber in &self.subscribers {
                    let _ = subscriber.channel.send(event.clone());
                }
            }
        }
    }

    fn handle_subscription_request(&mut self, request: SubscriptionRequest) {
        let id = self.next_subscriber_id;
        self.active_subscriber_ids.insert(id.0);

        loop {
            self.next_subscriber_id += Wrapping(1);
            if !self
                .active_subscriber_ids
                .contains(&self.next_subscriber_id.0)
            {
                break;
            }
        }

        match request {
            SubscriptionRequest::AllEvents { channel } => {
                self.subscribers.push(Subscriber {
                    id: id.0,
                    channel: channel.clone(),
                });

                self.futures.push(notify_subscriber_gone(id.0, channel).boxed());
            }
        }
    }
}

async fn wait_for_publish_request(
    mut receiver: UnboundedReceiver<PublishEventRequest>,
) -> FutureResult {
    match receiver.recv().await {
        Some(request) => FutureResult::NewPublishRequest(request, receiver),
        None => FutureResult::AllPublishConsumersGone,
    }
}

async fn wait_for_subscription_request(
    mut receiver: UnboundedReceiver<SubscriptionRequest>,
) -> FutureResult {
    match receiver.recv().await {
        Some(request) => FutureResult::NewSubscriptionRequest(request, receiver),
        None => FutureResult::AllSubscriptionRequestConsumersGone,
    }
}

async fn notify_subscriber_gone(id: usize, sender: UnboundedSender<Event>) -> FutureResult {
    sender.closed().await;
    FutureResult::SubscriberGone(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;
    use serde_json::json;

    fn test_event(tag: &str) -> Event {
        Event {
            tag: tag.to_string(),
            data: json!({"id": "abc"}),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let (publisher, subscriber) = start_event_bus();

        let (sender, mut receiver) = unbounded_channel();
        subscriber
            .send(SubscriptionRequest::AllEvents { channel: sender })
            .expect("Failed to send subscription request");

        publisher
            .send(PublishEventRequest::Event {
                event: test_event("first/event"),
            })
            .expect("Failed to publish first event");

        publisher
            .send(PublishEventRequest::Event {
                event: test_event("second/event"),
            })
            .expect("Failed to publish second event");

        let event = test_utils::expect_mpsc_response(&mut receiver).await;
        assert_eq!(event.tag, "first/event", "Unexpected first event tag");

        let event = test_utils::expect_mpsc_response(&mut receiver).await;
        assert_eq!(event.tag, "second/event", "Unexpected second event tag");
    }

    #[tokio::test]
    async fn all_subscribers_receive_each_event() {
        let (publisher, subscriber) = start_event_bus();

        let (sender1, mut receiver1) = unbounded_channel();
        let (sender2, mut receiver2) = unbounded_channel();
        subscriber
            .send(SubscriptionRequest::AllEvents { channel: sender1 })
            .expect("Failed to send first subscription request");

        subscriber
            .send(SubscriptionRequest::AllEvents { channel: sender2 })
            .expect("Failed to send second subscription request");

        publisher
            .send(PublishEventRequest::Event {
                event: test_event("some/event"),
            })
            .expect("Failed to publish event");

        let event = test_utils::expect_mpsc_response(&mut receiver1).await;
        assert_eq!(event.tag, "some/event", "Unexpected tag for subscriber 1");

        let event = test_utils::expect_mpsc_response(&mut receiver2).await;
        assert_eq!(event.tag, "some/event", "Unexpected tag for subscriber 2");
    }

    #[tokio::test]
    async fn closed_subscriber_does_not_stop_delivery_to_others() {
        let (publisher, subscriber) = start_event_bus();

        let (sender1, receiver1) = unbounded_channel();
        let (sender2, mut receiver2) = unbounded_channel();
        subscriber
            .send(SubscriptionRequest::AllEvents { channel: sender1 })
            .expect("Failed to send first subscription request");

        subscriber
            .send(SubscriptionRequest::AllEvents { channel: sender2 })
            .expect("Failed to send second subscription request");

        drop(receiver1);

        publisher
            .send(PublishEventRequest::Event {
                event: test_event("some/event"),
            })
            .expect("Failed to publish event");

        let event = test_utils::expect_mpsc_response(&mut receiver2).await;
        assert_eq!(event.tag, "some/event", "Unexpected tag for live subscriber");
    }
}
