use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;

use crate::kv::{KvError, KvResult, KvStore, Subscription};

/// External bus for multi-instance deployments. KV traffic goes through a
/// shared connection manager; each subscription holds its own pub/sub
/// connection fed into an mpsc channel by a reader task.
pub struct RedisStore {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(dsn: &str) -> KvResult<Self> {
        let client = redis::Client::open(dsn).map_err(backend)?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(backend)?;
        Ok(Self { client, manager })
    }
}

fn backend(err: redis::RedisError) -> KvError {
    KvError::Backend(err.to_string())
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(backend)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> KvResult<()> {
        let mut conn = self.manager.clone();
        match ttl {
            Some(ttl) => conn
                .set_ex(key, value, ttl.as_secs().max(1))
                .await
                .map_err(backend),
            None => conn.set(key, value).await.map_err(backend),
        }
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        let mut conn = self.manager.clone();
        conn.del(key).await.map_err(backend)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> KvResult<()> {
        let mut conn = self.manager.clone();
        conn.publish(channel, payload).await.map_err(backend)
    }

    async fn subscribe(&self, channel: &str) -> KvResult<Box<dyn Subscription>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(backend)?;
        pubsub.subscribe(channel).await.map_err(backend)?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
        tokio::spawn(async move {
            use futures_util::StreamExt;
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });

        Ok(Box::new(RedisSubscription { rx }))
    }
}

struct RedisSubscription {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn recv(&mut self) -> KvResult<Vec<u8>> {
        self.rx.recv().await.ok_or(KvError::Closed)
    }
}
