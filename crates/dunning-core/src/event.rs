use std::sync::Arc;

use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::EventBusError;

/// Name of a per-session topic. Session ids are used verbatim.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidTopic(name))
        }
    }

    /// Non-empty, at most 128 characters of `[A-Za-z0-9_-]`.
    pub fn is_valid(name: &str) -> bool {
        !name.is_empty()
            && name.len() <= 128
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status update pushed to streaming subscribers of a session.
///
/// Serialises to one of the three wire shapes:
/// `{"status":"qr","qr":"data:...","is_connected":false}`,
/// `{"is_connected":true,"sessionId":"..."}` or `{"is_connected":false}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
    pub is_connected: bool,
    #[serde(
        rename = "sessionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<String>,
}

impl StatusEvent {
    pub fn pairing(qr: impl Into<String>) -> Self {
        Self {
            status: Some("qr".to_string()),
            qr: Some(qr.into()),
            is_connected: false,
            session_id: None,
        }
    }

    pub fn connected(session_id: impl Into<String>) -> Self {
        Self {
            status: None,
            qr: None,
            is_connected: true,
            session_id: Some(session_id.into()),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            status: None,
            qr: None,
            is_connected: false,
            session_id: None,
        }
    }

    pub fn is_pairing(&self) -> bool {
        self.status.as_deref() == Some("qr")
    }
}

/// Per-session publish/subscribe broker.
///
/// Late subscribers miss everything published before they attached; callers
/// that need the current state read it separately before subscribing.
pub trait EventBus: Send + Sync + 'static {
    /// Deliver `event` to every live subscriber of `topic`, returning how many
    /// received it. Publishing to a topic nobody listens on is not an error.
    fn publish(&self, topic: &str, event: StatusEvent) -> Result<usize, EventBusError>;

    fn subscribe(&self, topic: &str) -> Result<EventSubscription, EventBusError>;

    fn subscriber_count(&self, topic: &str) -> usize;
}

type TopicMap = DashMap<String, broadcast::Sender<StatusEvent>>;

#[derive(Clone)]
pub struct BroadcastEventBus {
    topics: Arc<TopicMap>,
    capacity: usize,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

    pub fn new(channel_capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: channel_capacity.max(1),
        }
    }

    /// Number of topics that currently have at least one subscriber.
    pub fn active_topics(&self) -> usize {
        self.topics.len()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, topic: &str, event: StatusEvent) -> Result<usize, EventBusError> {
        let topic = Topic::new(topic)?;
        let Some(sender) = self.topics.get(topic.as_str()) else {
            debug!(topic = %topic, "No subscribers for topic, dropping event");
            return Ok(0);
        };
        Ok(sender.send(event).unwrap_or(0))
    }

    fn subscribe(&self, topic: &str) -> Result<EventSubscription, EventBusError> {
        let topic = Topic::new(topic)?;
        let capacity = self.capacity;
        let receiver = self
            .topics
            .entry(topic.as_str().to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe();

        Ok(EventSubscription {
            topic,
            receiver: Some(receiver),
            topics: Arc::clone(&self.topics),
        })
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

/// A live subscription to one topic.
///
/// Dropping the subscription releases it; the topic itself is removed once
/// its last subscriber is gone.
pub struct EventSubscription {
    topic: Topic,
    receiver: Option<broadcast::Receiver<StatusEvent>>,
    topics: Arc<TopicMap>,
}

impl EventSubscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub async fn recv(&mut self) -> Result<StatusEvent, EventBusError> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(EventBusError::TopicClosed);
        };
        match receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Closed) => Err(EventBusError::TopicClosed),
            Err(broadcast::error::RecvError::Lagged(count)) => Err(EventBusError::Lagged(count)),
        }
    }

    /// Explicitly release the subscription.
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Turn the subscription into a stream that skips over lag and ends when
    /// the topic closes. The subscription is released when the stream drops.
    pub fn into_stream(self) -> impl Stream<Item = StatusEvent> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            loop {
                match subscription.recv().await {
                    Ok(event) => return Some((event, subscription)),
                    Err(EventBusError::Lagged(missed)) => {
                        warn!(topic = %subscription.topic, missed, "Subscriber lagged");
                    }
                    Err(_) => return None,
                }
            }
        })
    }

    fn release(&mut self) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        drop(receiver);
        let removed = self
            .topics
            .remove_if(self.topic.as_str(), |_, sender| sender.receiver_count() == 0);
        if removed.is_some() {
            debug!(topic = %self.topic, "Last subscriber left, topic removed");
        }
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;

    #[test]
    fn test_topic_validation() {
        assert!(Topic::is_valid("0b7c0d1e-1b2a-4f9e-8a43-3f0c2a1d9e77"));
        assert!(Topic::is_valid("session_1"));

        assert!(!Topic::is_valid(""));
        assert!(!Topic::is_valid("../etc"));
        assert!(!Topic::is_valid("with space"));
        assert!(!Topic::is_valid(&"x".repeat(129)));
    }

    #[test]
    fn test_status_event_wire_shapes() {
        let qr = serde_json::to_value(StatusEvent::pairing("data:image/svg+xml;base64,AA==")).unwrap();
        assert_eq!(
            qr,
            serde_json::json!({
                "status": "qr",
                "qr": "data:image/svg+xml;base64,AA==",
                "is_connected": false
            })
        );

        let connected = serde_json::to_value(StatusEvent::connected("s1")).unwrap();
        assert_eq!(
            connected,
            serde_json::json!({ "is_connected": true, "sessionId": "s1" })
        );

        let disconnected = serde_json::to_value(StatusEvent::disconnected()).unwrap();
        assert_eq!(disconnected, serde_json::json!({ "is_connected": false }));
    }

    #[tokio::test]
    async fn test_publish_reaches_only_matching_topic() {
        let bus = BroadcastEventBus::default();
        let mut first = bus.subscribe("s1").unwrap();
        let mut second = bus.subscribe("s2").unwrap();

        assert_eq!(bus.publish("s1", StatusEvent::connected("s1")).unwrap(), 1);

        let event = first.recv().await.unwrap();
        assert_eq!(event, StatusEvent::connected("s1"));

        let nothing = tokio::time::timeout(Duration::from_millis(20), second.recv()).await;
        assert!(nothing.is_err(), "s2 subscriber must not see s1 events");
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_the_event() {
        let bus = BroadcastEventBus::default();
        let mut a = bus.subscribe("s1").unwrap();
        let mut b = bus.subscribe("s1").unwrap();

        assert_eq!(bus.publish("s1", StatusEvent::disconnected()).unwrap(), 2);
        assert_eq!(a.recv().await.unwrap(), StatusEvent::disconnected());
        assert_eq!(b.recv().await.unwrap(), StatusEvent::disconnected());
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_prior_events() {
        let bus = BroadcastEventBus::default();
        assert_eq!(bus.publish("s1", StatusEvent::connected("s1")).unwrap(), 0);

        let mut late = bus.subscribe("s1").unwrap();
        bus.publish("s1", StatusEvent::disconnected()).unwrap();

        assert_eq!(late.recv().await.unwrap(), StatusEvent::disconnected());
    }

    #[test]
    fn test_unsubscribe_removes_empty_topic() {
        let bus = BroadcastEventBus::default();
        let a = bus.subscribe("s1").unwrap();
        let b = bus.subscribe("s1").unwrap();
        assert_eq!(bus.subscriber_count("s1"), 2);

        a.unsubscribe();
        assert_eq!(bus.subscriber_count("s1"), 1);
        assert_eq!(bus.active_topics(), 1);

        drop(b);
        assert_eq!(bus.subscriber_count("s1"), 0);
        assert_eq!(bus.active_topics(), 0);
    }

    #[test]
    fn test_invalid_topic_is_rejected() {
        let bus = BroadcastEventBus::default();
        assert!(matches!(
            bus.publish("bad topic", StatusEvent::disconnected()),
            Err(EventBusError::InvalidTopic(_))
        ));
        assert!(matches!(
            bus.subscribe(""),
            Err(EventBusError::InvalidTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_skips_lag_and_releases_on_drop() {
        let bus = BroadcastEventBus::new(1);
        let subscription = bus.subscribe("s1").unwrap();

        bus.publish("s1", StatusEvent::pairing("a")).unwrap();
        bus.publish("s1", StatusEvent::connected("s1")).unwrap();

        let mut stream = Box::pin(subscription.into_stream());
        let event = stream.next().await.unwrap();
        assert_eq!(event, StatusEvent::connected("s1"));

        drop(stream);
        assert_eq!(bus.active_topics(), 0);
    }
}
