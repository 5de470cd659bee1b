use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::kv::{KvError, KvResult, KvStore, Subscription};

const CHANNEL_BUFFER: usize = 64;

/// Embedded store for single-instance deployments. Values live in a TTL map;
/// publishes fan out synchronously to local subscribers only.
pub struct MemoryStore {
    values: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        let mut channels = self.channels.lock().expect("memory store channel lock");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_BUFFER).0)
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        let mut values = self.values.lock().expect("memory store value lock");
        match values.get(key) {
            Some(entry) => {
                if let Some(expires_at) = entry.expires_at
                    && expires_at <= Instant::now()
                {
                    values.remove(key);
                    return Ok(None);
                }
                Ok(Some(entry.value.clone()))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> KvResult<()> {
        let entry = Entry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.values
            .lock()
            .expect("memory store value lock")
            .insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.values
            .lock()
            .expect("memory store value lock")
            .remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> KvResult<()> {
        // A send with no subscribers is not an error; the message is simply lost.
        let _ = self.sender(channel).send(payload.to_vec());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> KvResult<Box<dyn Subscription>> {
        Ok(Box::new(MemorySubscription {
            rx: self.sender(channel).subscribe(),
        }))
    }
}

struct MemorySubscription {
    rx: broadcast::Receiver<Vec<u8>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> KvResult<Vec<u8>> {
        match self.rx.recv().await {
            Ok(payload) => Ok(payload),
            Err(broadcast::error::RecvError::Closed) => Err(KvError::Closed),
            Err(broadcast::error::RecvError::Lagged(_)) => Err(KvError::Lagged),
        }
    }
}
