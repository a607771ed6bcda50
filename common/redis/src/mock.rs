use async_trait::async_trait;
use futures::stream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::{Client, CustomRedisError, MessageStream};

const CHANNEL_CAPACITY: usize = 256;

/// In-memory stand-in for Redis.
///
/// Scripted returns (`get_ret`, `set_ret`, ...) win over the shared keyspace,
/// so a test can force a specific error for one key while the rest behaves like
/// a real server. Clones share the keyspace, the pub/sub bus and the call log,
/// which lets several engine instances talk to "the same" Redis in tests.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    get_ret: HashMap<String, Result<String, CustomRedisError>>,
    set_ret: HashMap<String, Result<(), CustomRedisError>>,
    del_ret: HashMap<String, Result<(), CustomRedisError>>,
    publish_ret: Option<Result<(), CustomRedisError>>,
    data: Arc<Mutex<HashMap<String, String>>>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    unavailable: Arc<AtomicBool>,
    calls: Arc<Mutex<Vec<MockRedisCall>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, op: &str, key: &str, value: MockRedisValue) {
        lock(&self.calls).push(MockRedisCall {
            op: op.to_string(),
            key: key.to_string(),
            value,
        });
    }

    fn check_available(&self) -> Result<(), CustomRedisError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(CustomRedisError::Timeout)
        } else {
            Ok(())
        }
    }

    pub fn get_ret(&mut self, key: &str, ret: Result<String, CustomRedisError>) -> Self {
        self.get_ret.insert(key.to_owned(), ret);
        self.clone()
    }

    pub fn set_ret(&mut self, key: &str, ret: Result<(), CustomRedisError>) -> Self {
        self.set_ret.insert(key.to_owned(), ret);
        self.clone()
    }

    pub fn del_ret(&mut self, key: &str, ret: Result<(), CustomRedisError>) -> Self {
        self.del_ret.insert(key.to_owned(), ret);
        self.clone()
    }

    pub fn publish_ret(&mut self, ret: Result<(), CustomRedisError>) -> Self {
        self.publish_ret = Some(ret);
        self.clone()
    }

    /// Make every command fail with a timeout, as if the server went away.
    /// Shared by all clones.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> Vec<MockRedisCall> {
        lock(&self.calls).clone()
    }

    pub fn stored_value(&self, key: &str) -> Option<String> {
        lock(&self.data).get(key).cloned()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        lock(&self.channels)
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[derive(Debug, Clone)]
pub enum MockRedisValue {
    None,
    String(String),
    StringWithTTL(String, u64),
}

#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct MockRedisCall {
    pub op: String,
    pub key: String,
    pub value: MockRedisValue,
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, key: String) -> Result<String, CustomRedisError> {
        self.record("get", &key, MockRedisValue::None);
        self.check_available()?;

        if let Some(result) = self.get_ret.get(&key) {
            return result.clone();
        }
        lock(&self.data)
            .get(&key)
            .cloned()
            .ok_or(CustomRedisError::NotFound)
    }

    async fn set(&self, key: String, value: String) -> Result<(), CustomRedisError> {
        self.record("set", &key, MockRedisValue::String(value.clone()));
        self.check_available()?;

        if let Some(result) = self.set_ret.get(&key) {
            return result.clone();
        }
        lock(&self.data).insert(key, value);
        Ok(())
    }

    async fn setex(&self, key: String, value: String, seconds: u64) -> Result<(), CustomRedisError> {
        self.record(
            "setex",
            &key,
            MockRedisValue::StringWithTTL(value.clone(), seconds),
        );
        self.check_available()?;

        if let Some(result) = self.set_ret.get(&key) {
            return result.clone();
        }
        // TTL is recorded but not enforced
        lock(&self.data).insert(key, value);
        Ok(())
    }

    async fn del(&self, key: String) -> Result<(), CustomRedisError> {
        self.record("del", &key, MockRedisValue::None);
        self.check_available()?;

        if let Some(result) = self.del_ret.get(&key) {
            return result.clone();
        }
        lock(&self.data).remove(&key);
        Ok(())
    }

    async fn publish(&self, channel: String, message: String) -> Result<(), CustomRedisError> {
        self.record("publish", &channel, MockRedisValue::String(message.clone()));
        self.check_available()?;

        if let Some(result) = &self.publish_ret {
            return result.clone();
        }
        // No receivers is fine, same as PUBLISH returning 0
        self.sender(&channel).send(message).ok();
        Ok(())
    }

    async fn subscribe(&self, channel: String) -> Result<MessageStream, CustomRedisError> {
        self.record("subscribe", &channel, MockRedisValue::None);
        self.check_available()?;

        let receiver = self.sender(&channel).subscribe();
        let messages = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(Box::pin(messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_set_then_get_shares_keyspace_across_clones() {
        let client = MockRedisClient::new();
        let other = client.clone();

        client
            .setex("flag".to_string(), "on".to_string(), 60)
            .await
            .unwrap();

        assert_eq!(other.get("flag".to_string()).await.unwrap(), "on");
        other.del("flag".to_string()).await.unwrap();
        assert!(matches!(
            client.get("flag".to_string()).await,
            Err(CustomRedisError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_scripted_return_wins_over_keyspace() {
        let mut client = MockRedisClient::new();
        client.set("flag".to_string(), "on".to_string()).await.unwrap();
        let client = client.get_ret("flag", Err(CustomRedisError::Timeout));

        assert!(matches!(
            client.get("flag".to_string()).await,
            Err(CustomRedisError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_command() {
        let client = MockRedisClient::new();
        client.set_unavailable(true);

        assert!(matches!(
            client.get("flag".to_string()).await,
            Err(CustomRedisError::Timeout)
        ));
        assert!(client
            .publish("chan".to_string(), "msg".to_string())
            .await
            .is_err());

        client.set_unavailable(false);
        assert!(client
            .publish("chan".to_string(), "msg".to_string())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let client = MockRedisClient::new();
        let mut first = client.subscribe("chan".to_string()).await.unwrap();
        let mut second = client.clone().subscribe("chan".to_string()).await.unwrap();

        client
            .publish("chan".to_string(), "hello".to_string())
            .await
            .unwrap();

        assert_eq!(first.next().await.as_deref(), Some("hello"));
        assert_eq!(second.next().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_calls_are_recorded() {
        let client = MockRedisClient::new();
        client.get("missing".to_string()).await.ok();
        client.del("missing".to_string()).await.unwrap();

        let ops: Vec<String> = client.get_calls().into_iter().map(|c| c.op).collect();
        assert_eq!(ops, vec!["get".to_string(), "del".to_string()]);
    }
}
