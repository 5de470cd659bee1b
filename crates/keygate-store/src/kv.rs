use std::time::Duration;

use async_trait::async_trait;

pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("subscription closed")]
    Closed,
    #[error("subscriber lagged behind")]
    Lagged,
    #[error("kv backend error: {0}")]
    Backend(String),
}

/// Uniform surface over the embedded in-process store and an external bus.
///
/// `publish` is fire-and-forget best-effort: delivery is not guaranteed, and
/// consumers must treat any message as "reload from the source of truth".
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> KvResult<()>;
    async fn delete(&self, key: &str) -> KvResult<()>;

    async fn publish(&self, channel: &str, payload: &[u8]) -> KvResult<()>;
    async fn subscribe(&self, channel: &str) -> KvResult<Box<dyn Subscription>>;
}

/// A live feed of one channel. After an error the feed is dead; callers
/// re-subscribe and keep serving the last good value in the meantime.
#[async_trait]
pub trait Subscription: Send {
    async fn recv(&mut self) -> KvResult<Vec<u8>>;
}
