use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use murmur_schema::BusMessage;
use tokio::sync::{mpsc, RwLock};

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum Topic {
    CommentGenerated,
    FeedbackApplied,
    PickupDetected,
    CapabilityDegraded,
    PersistenceFailed,
}

impl Topic {
    pub fn from_message(msg: &BusMessage) -> Self {
        match msg {
            BusMessage::CommentGenerated { .. } => Topic::CommentGenerated,
            BusMessage::FeedbackApplied { .. } => Topic::FeedbackApplied,
            BusMessage::PickupDetected { .. } => Topic::PickupDetected,
            BusMessage::CapabilityDegraded { .. } => Topic::CapabilityDegraded,
            BusMessage::PersistenceFailed { .. } => Topic::PersistenceFailed,
        }
    }
}

type Subscriber = mpsc::Sender<BusMessage>;
type SubscriberMap = Arc<RwLock<HashMap<Topic, Vec<Subscriber>>>>;

/// Fan-out of notices to the UI/session layer. Slow subscribers lose messages
/// instead of blocking the publisher.
pub struct EventBus {
    subscribers: SubscriberMap,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    pub async fn subscribe(&self, topic: Topic) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut subs = self.subscribers.write().await;
        subs.entry(topic).or_default().push(tx);
        rx
    }

    pub async fn publish(&self, msg: BusMessage) -> Result<()> {
        deliver(&self.subscribers, msg).await
    }

    pub fn publisher(&self) -> BusPublisher {
        BusPublisher {
            subscribers: self.subscribers.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[derive(Clone)]
pub struct BusPublisher {
    subscribers: SubscriberMap,
}

impl BusPublisher {
    pub async fn publish(&self, msg: BusMessage) -> Result<()> {
        deliver(&self.subscribers, msg).await
    }
}

async fn deliver(subscribers: &SubscriberMap, msg: BusMessage) -> Result<()> {
    let topic = Topic::from_message(&msg);
    let mut subs = subscribers.write().await;
    if let Some(list) = subs.get_mut(&topic) {
        list.retain(|tx| !tx.is_closed());
        for tx in list.iter() {
            if tx.try_send(msg.clone()).is_err() {
                tracing::debug!(?topic, "bus subscriber full, dropping message");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use murmur_schema::{
        Capability, Comment, ConversationContext, GenerationSource, InteractionType, RoleType,
        UserInteraction,
    };
    use tokio::time::{timeout, Duration};
    use uuid::Uuid;

    fn comment_generated() -> BusMessage {
        BusMessage::CommentGenerated {
            session_id: "session-1".to_string(),
            comment: Comment::new(
                RoleType::Reaction,
                "おお",
                ConversationContext::new("すごい").snapshot(),
                GenerationSource::Rule,
                Utc::now(),
            ),
        }
    }

    #[tokio::test]
    async fn publish_to_no_subscribers_succeeds() {
        let bus = EventBus::new(8);
        assert!(bus.publish(comment_generated()).await.is_ok());
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe(Topic::CommentGenerated).await;

        bus.publish(comment_generated()).await.unwrap();

        let received = timeout(Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(received, BusMessage::CommentGenerated { .. }));
    }

    #[tokio::test]
    async fn different_topics_no_crosstalk() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe(Topic::CommentGenerated).await;

        bus.publish(BusMessage::PersistenceFailed {
            user_id: "u".into(),
            error: "disk full".into(),
        })
        .await
        .unwrap();

        let received = timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(received.is_err());
    }

    #[tokio::test]
    async fn bus_publisher_clone_works() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe(Topic::CapabilityDegraded).await;
        let publisher = bus.publisher().clone();

        publisher
            .publish(BusMessage::CapabilityDegraded {
                capability: Capability::Model,
                reason: "no gpu".into(),
            })
            .await
            .unwrap();

        let received = timeout(Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            received,
            BusMessage::CapabilityDegraded {
                capability: Capability::Model,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn channel_backpressure_drops_when_full() {
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe(Topic::CommentGenerated).await;

        bus.publish(comment_generated()).await.unwrap();
        bus.publish(comment_generated()).await.unwrap();

        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_ok());
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new(4);
        let rx = bus.subscribe(Topic::CommentGenerated).await;
        drop(rx);

        bus.publish(comment_generated()).await.unwrap();

        let subs = bus.subscribers.read().await;
        assert!(subs.get(&Topic::CommentGenerated).unwrap().is_empty());
    }

    #[test]
    fn topic_from_message_covers_all_variants() {
        let comment_id = Uuid::new_v4();
        let cases = vec![
            (comment_generated(), Topic::CommentGenerated),
            (
                BusMessage::FeedbackApplied {
                    user_id: "u".into(),
                    comment_id,
                    role: RoleType::Support,
                    interaction_type: InteractionType::ThumbsUp,
                    weight: 1.05,
                },
                Topic::FeedbackApplied,
            ),
            (
                BusMessage::PickupDetected {
                    session_id: "s".into(),
                    interaction: UserInteraction {
                        comment_id,
                        interaction_type: InteractionType::Pickup,
                        timestamp: Utc::now(),
                        confidence: 0.8,
                    },
                },
                Topic::PickupDetected,
            ),
            (
                BusMessage::CapabilityDegraded {
                    capability: Capability::Storage,
                    reason: "r".into(),
                },
                Topic::CapabilityDegraded,
            ),
            (
                BusMessage::PersistenceFailed {
                    user_id: "u".into(),
                    error: "e".into(),
                },
                Topic::PersistenceFailed,
            ),
        ];

        for (msg, expected) in cases {
            assert_eq!(Topic::from_message(&msg), expected);
        }
    }
}
