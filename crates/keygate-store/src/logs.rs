use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self as tokio_time, MissedTickBehavior};

use crate::storage::{RequestLogRecord, StorageResult};

/// Narrow durable surface for request telemetry, so the sink and retention
/// job can run against a test double.
#[async_trait]
pub trait RequestLogStore: Send + Sync {
    async fn insert_request_logs(&self, rows: &[RequestLogRecord]) -> StorageResult<()>;
    async fn delete_request_logs_before(&self, cutoff: OffsetDateTime) -> StorageResult<u64>;
}

#[derive(Debug, Clone)]
pub struct LogSinkConfig {
    pub capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            batch_size: 500,
            flush_interval: Duration::from_secs(60),
        }
    }
}

/// Producer handle. `push` never blocks; overload drops the row and counts it.
#[derive(Clone)]
pub struct RequestLogSink {
    tx: mpsc::Sender<RequestLogRecord>,
    dropped: Arc<AtomicU64>,
}

pub struct LogSinkWorker {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl RequestLogSink {
    pub fn spawn(
        store: Arc<dyn RequestLogStore>,
        config: LogSinkConfig,
    ) -> (Self, LogSinkWorker) {
        let (tx, rx) = mpsc::channel(config.capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(log_writer(store, rx, shutdown_rx, config));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            LogSinkWorker {
                handle,
                shutdown_tx,
            },
        )
    }

    pub fn push(&self, record: RequestLogRecord) {
        if self.tx.try_send(record).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(dropped, "request log buffer full, dropping record");
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl LogSinkWorker {
    /// Final flush, bounded by `timeout`.
    pub async fn shutdown(self, timeout: Duration) {
        let _ = self.shutdown_tx.send(true);
        if tokio_time::timeout(timeout, self.handle).await.is_err() {
            tracing::warn!("request log worker did not drain in time");
        }
    }
}

async fn log_writer(
    store: Arc<dyn RequestLogStore>,
    mut rx: mpsc::Receiver<RequestLogRecord>,
    mut shutdown_rx: watch::Receiver<bool>,
    config: LogSinkConfig,
) {
    let mut buffer: Vec<RequestLogRecord> = Vec::with_capacity(config.batch_size);
    let mut ticker = tokio_time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(record) = rx.recv() => {
                buffer.push(record);
                if buffer.len() >= config.batch_size {
                    flush(&store, &mut buffer).await;
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&store, &mut buffer).await;
                }
            }
            _ = shutdown_rx.changed() => {
                while let Ok(record) = rx.try_recv() {
                    buffer.push(record);
                }
                if !buffer.is_empty() {
                    flush(&store, &mut buffer).await;
                }
                break;
            }
            else => {
                if !buffer.is_empty() {
                    flush(&store, &mut buffer).await;
                }
                break;
            }
        }
    }
}

async fn flush(store: &Arc<dyn RequestLogStore>, buffer: &mut Vec<RequestLogRecord>) {
    let mut batch = Vec::new();
    std::mem::swap(buffer, &mut batch);

    // Producers must never stall on a slow database; a failed batch is lost.
    if let Err(err) = store.insert_request_logs(&batch).await {
        tracing::warn!(rows = batch.len(), error = %err, "request log write failed, dropping batch");
    }
}

/// Deletes rows past their retention window. Disabled while the configured
/// retention is 0 days.
pub struct RetentionJob {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl RetentionJob {
    pub fn spawn(
        store: Arc<dyn RequestLogStore>,
        retention_days: Arc<dyn Fn() -> u32 + Send + Sync>,
        period: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio_time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let days = retention_days();
                        if days == 0 {
                            continue;
                        }
                        let cutoff = OffsetDateTime::now_utc() - Duration::from_secs(u64::from(days) * 86_400);
                        match store.delete_request_logs_before(cutoff).await {
                            Ok(0) => {}
                            Ok(rows) => tracing::info!(rows, "expired request logs removed"),
                            Err(err) => tracing::warn!(error = %err, "request log retention sweep failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        Self {
            handle,
            shutdown_tx,
        }
    }

    pub async fn shutdown(self, timeout: Duration) {
        let _ = self.shutdown_tx.send(true);
        let _ = tokio_time::timeout(timeout, self.handle).await;
    }
}
