use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self as tokio_time, MissedTickBehavior};

use keygate_store::{KeyFailure, KeyStatus, KeyTouch, KvStore, Storage};

use crate::syncer::CHANNEL_KEYS;

#[derive(Debug, Clone)]
pub enum KeyStateEvent {
    Touch(KeyTouch),
    Failure(KeyFailure),
    StatusChange {
        key_id: i64,
        group_id: i64,
        status: KeyStatus,
        failure_count: i64,
        validated_at: Option<OffsetDateTime>,
    },
}

#[derive(Debug, Clone)]
pub struct KeyStateConfig {
    pub capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for KeyStateConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            batch_size: 200,
            flush_interval: Duration::from_millis(200),
        }
    }
}

/// Asynchronous write-back of pool mutations.
///
/// Pools stay authoritative in memory; this sink batches counter updates to
/// the store and, once a status change lands, publishes the `keys`
/// invalidation so peer instances reload the new partition.
#[derive(Clone)]
pub struct KeyStateSink {
    tx: mpsc::Sender<KeyStateEvent>,
}

pub struct KeyStateWorker {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl KeyStateSink {
    pub fn spawn(
        storage: Arc<dyn Storage>,
        kv: Arc<dyn KvStore>,
        config: KeyStateConfig,
    ) -> (Self, KeyStateWorker) {
        let (tx, rx) = mpsc::channel(config.capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(state_writer(storage, kv, rx, shutdown_rx, config));
        (
            Self { tx },
            KeyStateWorker {
                handle,
                shutdown_tx,
            },
        )
    }

    pub fn touch(&self, key_id: i64, at: OffsetDateTime) {
        self.send(KeyStateEvent::Touch(KeyTouch { key_id, at }));
    }

    pub fn failure(&self, key_id: i64, failure_count: i64) {
        self.send(KeyStateEvent::Failure(KeyFailure {
            key_id,
            failure_count,
        }));
    }

    pub fn status_change(
        &self,
        key_id: i64,
        group_id: i64,
        status: KeyStatus,
        failure_count: i64,
        validated_at: Option<OffsetDateTime>,
    ) {
        self.send(KeyStateEvent::StatusChange {
            key_id,
            group_id,
            status,
            failure_count,
            validated_at,
        });
    }

    fn send(&self, event: KeyStateEvent) {
        if self.tx.try_send(event).is_err() {
            tracing::warn!("key state buffer full, dropping update");
        }
    }
}

impl KeyStateWorker {
    pub async fn shutdown(self, timeout: Duration) {
        let _ = self.shutdown_tx.send(true);
        if tokio_time::timeout(timeout, self.handle).await.is_err() {
            tracing::warn!("key state worker did not drain in time");
        }
    }
}

async fn state_writer(
    storage: Arc<dyn Storage>,
    kv: Arc<dyn KvStore>,
    mut rx: mpsc::Receiver<KeyStateEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    config: KeyStateConfig,
) {
    let mut buffer: Vec<KeyStateEvent> = Vec::with_capacity(config.batch_size);
    let mut ticker = tokio_time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                buffer.push(event);
                if buffer.len() >= config.batch_size {
                    flush(&storage, &kv, &mut buffer).await;
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&storage, &kv, &mut buffer).await;
                }
            }
            _ = shutdown_rx.changed() => {
                while let Ok(event) = rx.try_recv() {
                    buffer.push(event);
                }
                if !buffer.is_empty() {
                    flush(&storage, &kv, &mut buffer).await;
                }
                break;
            }
        }
    }
}

async fn flush(
    storage: &Arc<dyn Storage>,
    kv: &Arc<dyn KvStore>,
    buffer: &mut Vec<KeyStateEvent>,
) {
    let mut batch = Vec::new();
    std::mem::swap(buffer, &mut batch);

    let mut touches: Vec<KeyTouch> = Vec::new();
    // Last write wins per key within a batch.
    let mut failures: HashMap<i64, KeyFailure> = HashMap::new();
    let mut statuses = Vec::new();

    for event in batch {
        match event {
            KeyStateEvent::Touch(touch) => touches.push(touch),
            KeyStateEvent::Failure(failure) => {
                failures.insert(failure.key_id, failure);
            }
            KeyStateEvent::StatusChange {
                key_id,
                group_id,
                status,
                failure_count,
                validated_at,
            } => statuses.push((key_id, group_id, status, failure_count, validated_at)),
        }
    }

    if !touches.is_empty() {
        if let Err(err) = storage.touch_keys(&touches).await {
            tracing::warn!(error = %err, "key touch write failed, dropping batch");
        }
    }

    if !failures.is_empty() {
        let failures: Vec<KeyFailure> = failures.into_values().collect();
        if let Err(err) = storage.record_key_failures(&failures).await {
            tracing::warn!(error = %err, "key failure write failed, dropping batch");
        }
    }

    for (key_id, group_id, status, failure_count, validated_at) in statuses {
        match storage
            .set_key_status(key_id, status, failure_count, validated_at)
            .await
        {
            Ok(()) => {
                // Peers reload the partition only after the row is durable.
                let payload = group_id.to_string();
                if let Err(err) = kv.publish(CHANNEL_KEYS, payload.as_bytes()).await {
                    tracing::warn!(error = %err, "keys invalidation publish failed");
                }
            }
            Err(err) => {
                tracing::warn!(key_id, error = %err, "key status write failed, dropping update");
            }
        }
    }
}
