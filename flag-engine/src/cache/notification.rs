//! Cross-instance cache invalidation.
//!
//! After a mutation the writing instance publishes the flag key; every
//! subscribed instance drops its local entry. Delivery is at-most-once and
//! only shortens staleness: local entries expire on their own regardless.
//! Whenever a subscription is lost, the local tier is cleared once the
//! listener is subscribed again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_redis::{Client as RedisClient, CustomRedisError};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cache::flag_cache::FlagCache,
    metrics::{
        consts::{INVALIDATIONS_RECEIVED_COUNTER, INVALIDATION_RESUBSCRIBE_COUNTER},
        utils::{inc, label},
    },
};

const LOCAL_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub flag_key: String,
    /// Instance that performed the mutation.
    pub origin: String,
    pub sent_at: DateTime<Utc>,
}

impl InvalidationMessage {
    pub fn new(flag_key: &str, origin: &str) -> Self {
        Self {
            flag_key: flag_key.to_string(),
            origin: origin.to_string(),
            sent_at: Utc::now(),
        }
    }
}

#[derive(Error, Debug)]
pub enum NotifierError {
    #[error("redis error: {0}")]
    Redis(#[from] CustomRedisError),
    #[error("failed to encode invalidation message: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type InvalidationStream = BoxStream<'static, InvalidationMessage>;

/// Publish/subscribe seam for invalidations. The transport is swappable.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    /// Fire-and-forget; an error only means this one broadcast was lost.
    async fn publish(&self, message: &InvalidationMessage) -> Result<(), NotifierError>;

    /// The stream ends when the transport drops the subscription.
    async fn subscribe(&self) -> Result<InvalidationStream, NotifierError>;
}

/// Invalidations over Redis pub/sub.
pub struct RedisChangeNotifier {
    redis: Arc<dyn RedisClient + Send + Sync>,
    channel: String,
}

impl RedisChangeNotifier {
    pub fn new(redis: Arc<dyn RedisClient + Send + Sync>, channel: impl Into<String>) -> Self {
        Self {
            redis,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl ChangeNotifier for RedisChangeNotifier {
    async fn publish(&self, message: &InvalidationMessage) -> Result<(), NotifierError> {
        let payload = serde_json::to_string(message)?;
        self.redis.publish(self.channel.clone(), payload).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<InvalidationStream, NotifierError> {
        let channel = self.channel.clone();
        let payloads = self.redis.subscribe(channel.clone()).await?;
        let messages = payloads.filter_map(move |payload| {
            let decoded = match serde_json::from_str::<InvalidationMessage>(&payload) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "dropping malformed invalidation message");
                    None
                }
            };
            futures::future::ready(decoded)
        });
        Ok(Box::pin(messages))
    }
}

/// In-process bus, for single-node runs and tests. Clones share the bus.
#[derive(Clone)]
pub struct LocalChangeNotifier {
    sender: broadcast::Sender<InvalidationMessage>,
}

impl Default for LocalChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalChangeNotifier {
    pub fn new() -> Self {
        Self::with_capacity(LOCAL_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

#[async_trait]
impl ChangeNotifier for LocalChangeNotifier {
    async fn publish(&self, message: &InvalidationMessage) -> Result<(), NotifierError> {
        // no subscribers is not an error, the message is simply lost
        self.sender.send(message.clone()).ok();
        Ok(())
    }

    async fn subscribe(&self) -> Result<InvalidationStream, NotifierError> {
        let receiver = self.sender.subscribe();
        let messages = stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(message) => Some((message, receiver)),
                // skipped messages are lost, end the stream so the listener
                // resubscribes and clears the local tier
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "invalidation listener lagged behind the local bus");
                    None
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(Box::pin(messages))
    }
}

/// Applies received invalidations to this instance's local tier and keeps the
/// subscription alive until cancelled.
pub struct InvalidationListener {
    notifier: Arc<dyn ChangeNotifier>,
    cache: Arc<FlagCache>,
    instance_id: String,
    reconnect_backoff: Duration,
}

impl InvalidationListener {
    pub fn new(
        notifier: Arc<dyn ChangeNotifier>,
        cache: Arc<FlagCache>,
        instance_id: &str,
        reconnect_backoff: Duration,
    ) -> Self {
        Self {
            notifier,
            cache,
            instance_id: instance_id.to_string(),
            reconnect_backoff,
        }
    }

    /// Subscribes once, so callers can be sure messages published after this
    /// returns are seen.
    pub async fn subscribe(&self) -> Option<InvalidationStream> {
        match self.notifier.subscribe().await {
            Ok(stream) => {
                info!(instance_id = %self.instance_id, "subscribed to flag invalidations");
                Some(stream)
            }
            Err(e) => {
                warn!(error = %e, "failed to subscribe to flag invalidations");
                None
            }
        }
    }

    /// Consumes `initial` if given, then resubscribes with a back-off whenever
    /// the stream ends or a subscription attempt fails.
    pub async fn run(self, initial: Option<InvalidationStream>, cancel: CancellationToken) {
        let mut current = initial;
        loop {
            if let Some(mut messages) = current.take() {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = messages.next() => match next {
                            Some(message) => self.apply(&message),
                            None => {
                                warn!("invalidation stream ended, resubscribing");
                                break;
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.reconnect_backoff) => {}
            }
            inc(INVALIDATION_RESUBSCRIBE_COUNTER, &[], 1);
            current = self.subscribe().await;
            if current.is_some() {
                info!(
                    instance_id = %self.instance_id,
                    "invalidations may have been missed, clearing local flag cache"
                );
                self.cache.clear_local();
            }
        }
    }

    fn apply(&self, message: &InvalidationMessage) {
        if message.origin == self.instance_id {
            // already applied on the write path
            return;
        }
        debug!(flag_key = %message.flag_key, origin = %message.origin, "invalidating local flag entry");
        inc(
            INVALIDATIONS_RECEIVED_COUNTER,
            &[label("origin", "remote")],
            1,
        );
        self.cache.invalidate_local(&message.flag_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{ActorContext, AuditAction, AuditRecord};
    use crate::cache::FlagCacheSettings;
    use crate::store::{FlagStore, InMemoryFlagStore};
    use crate::test_utils::{boolean_flag, eventually};
    use common_redis::MockRedisClient;

    /// Every subscription ends straight away, as after a dropped connection.
    struct DroppingNotifier;

    #[async_trait]
    impl ChangeNotifier for DroppingNotifier {
        async fn publish(&self, _message: &InvalidationMessage) -> Result<(), NotifierError> {
            Ok(())
        }

        async fn subscribe(&self) -> Result<InvalidationStream, NotifierError> {
            Ok(Box::pin(stream::empty()))
        }
    }

    #[tokio::test]
    async fn test_local_bus_delivers_to_every_subscriber() {
        let notifier = LocalChangeNotifier::new();
        let mut first = notifier.subscribe().await.unwrap();
        let mut second = notifier.clone().subscribe().await.unwrap();

        let message = InvalidationMessage::new("f", "instance-a");
        notifier.publish(&message).await.unwrap();

        assert_eq!(first.next().await.unwrap(), message);
        assert_eq!(second.next().await.unwrap(), message);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let notifier = LocalChangeNotifier::new();
        assert!(notifier
            .publish(&InvalidationMessage::new("f", "a"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_redis_notifier_round_trip() {
        let redis = MockRedisClient::new();
        let notifier = RedisChangeNotifier::new(Arc::new(redis.clone()), "invalidations");
        let mut messages = notifier.subscribe().await.unwrap();

        // garbage on the channel is skipped
        redis
            .publish("invalidations".to_string(), "not json".to_string())
            .await
            .unwrap();
        let message = InvalidationMessage::new("checkout", "instance-a");
        notifier.publish(&message).await.unwrap();

        assert_eq!(messages.next().await.unwrap(), message);
    }

    #[tokio::test]
    async fn test_redis_notifier_surfaces_publish_errors() {
        let redis = MockRedisClient::new();
        redis.set_unavailable(true);
        let notifier = RedisChangeNotifier::new(Arc::new(redis), "invalidations");

        assert!(matches!(
            notifier.publish(&InvalidationMessage::new("f", "a")).await,
            Err(NotifierError::Redis(CustomRedisError::Timeout))
        ));
    }

    #[tokio::test]
    async fn test_lagging_local_subscriber_stream_ends() {
        let notifier = LocalChangeNotifier::with_capacity(1);
        let mut messages = notifier.subscribe().await.unwrap();

        for key in ["a", "b", "c"] {
            notifier
                .publish(&InvalidationMessage::new(key, "instance-a"))
                .await
                .unwrap();
        }

        assert!(messages.next().await.is_none());
    }

    #[tokio::test]
    async fn test_listener_clears_local_tier_after_resubscribing() {
        let store = Arc::new(InMemoryFlagStore::new());
        let audit = AuditRecord::new("f", AuditAction::Created, &ActorContext::new("t"), Utc::now());
        store.insert_flag(&boolean_flag("f", true), &audit).await.unwrap();
        let settings = FlagCacheSettings {
            local_ttl: Duration::from_secs(60),
            local_max_entries: 100,
            shared_ttl_seconds: 60,
            store_timeout: Duration::from_millis(50),
            shared_settle_delay: Duration::from_millis(60),
        };
        let cache = Arc::new(FlagCache::new(store.clone(), None, &settings));
        cache.get_snapshot("f").await.unwrap();

        // a change whose invalidation never arrives
        let mut next = boolean_flag("f", false);
        next.version = 2;
        let audit = AuditRecord::new("f", AuditAction::Updated, &ActorContext::new("t"), Utc::now());
        store.update_flag(&next, 1, &audit).await.unwrap();

        let listener = InvalidationListener::new(
            Arc::new(DroppingNotifier),
            cache.clone(),
            "instance-b",
            Duration::from_millis(10),
        );
        let cancel = CancellationToken::new();
        let initial = listener.subscribe().await;
        let running = tokio::spawn(listener.run(initial, cancel.clone()));

        let cleared = eventually(Duration::from_secs(2), || async {
            let snapshot = cache.get_snapshot("f").await.unwrap().unwrap();
            snapshot.definition.version == 2
        })
        .await;
        cancel.cancel();
        running.await.unwrap();
        assert!(cleared, "the local tier still serves the missed change");
    }
}
