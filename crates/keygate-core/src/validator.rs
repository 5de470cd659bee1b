use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use time::OffsetDateTime;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinHandle;

use keygate_channel::{Channel, ChannelRegistry, Group};
use keygate_common::SystemSettings;

use crate::client::{DispatchOptions, UpstreamClient};
use crate::groups::GroupMap;
use crate::pool::{KeyPool, PoolManager};
use crate::syncer::CacheSyncer;

const MIN_INTERVAL_MINUTES: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidatorError {
    #[error("validation already running for this group")]
    TaskInProgress,
    #[error("unknown group")]
    UnknownGroup,
}

/// Progress of one running validation task, observable while it runs.
#[derive(Debug, Default)]
pub struct ValidationProgress {
    processed: AtomicUsize,
    total: AtomicUsize,
}

impl ValidationProgress {
    pub fn snapshot(&self) -> (usize, usize) {
        (
            self.processed.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }
}

/// Probes inactive keys and promotes the ones that answer, on a schedule
/// and on operator demand. On-demand runs are single-flight per group.
pub struct Validator {
    inner: Arc<Inner>,
    scheduler: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

struct Inner {
    groups: Arc<CacheSyncer<GroupMap>>,
    settings: Arc<CacheSyncer<SystemSettings>>,
    pools: Arc<PoolManager>,
    registry: Arc<ChannelRegistry>,
    client: Arc<dyn UpstreamClient>,
    in_flight: Mutex<HashMap<i64, Arc<ValidationProgress>>>,
    /// Caps in-flight probes across every group and both trigger modes.
    probe_permits: Semaphore,
}

impl Validator {
    pub fn new(
        groups: Arc<CacheSyncer<GroupMap>>,
        settings: Arc<CacheSyncer<SystemSettings>>,
        pools: Arc<PoolManager>,
        registry: Arc<ChannelRegistry>,
        client: Arc<dyn UpstreamClient>,
    ) -> Self {
        let probe_permits =
            Semaphore::new(settings.get().key_validation_concurrency.max(1) as usize);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                groups,
                settings,
                pools,
                registry,
                client,
                in_flight: Mutex::new(HashMap::new()),
                probe_permits,
            }),
            scheduler: std::sync::Mutex::new(None),
            shutdown_tx,
        }
    }

    /// Starts the periodic sweep over every group's inactive keys.
    pub fn start_scheduler(&self) {
        let inner = self.inner.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let minutes = inner
                    .settings
                    .get()
                    .key_validation_interval_minutes
                    .max(MIN_INTERVAL_MINUTES);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(minutes * 60)) => {}
                    _ = shutdown_rx.changed() => return,
                }

                let groups = inner.groups.get();
                for group in groups.iter() {
                    match begin(&inner, group.id).await {
                        Ok(progress) => {
                            run_group(&inner, group.clone(), progress).await;
                            finish(&inner, group.id).await;
                        }
                        // An operator-triggered run owns this group right now.
                        Err(ValidatorError::TaskInProgress) => continue,
                        Err(ValidatorError::UnknownGroup) => continue,
                    }
                }
            }
        });
        *self.scheduler.lock().expect("scheduler lock") = Some(handle);
    }

    /// Operator-triggered validation of one group. Returns the progress
    /// handle; a second call while the first runs fails with
    /// [`ValidatorError::TaskInProgress`].
    pub async fn validate_group(
        &self,
        group_id: i64,
    ) -> Result<Arc<ValidationProgress>, ValidatorError> {
        let Some(group) = self.inner.groups.get().get_by_id(group_id) else {
            return Err(ValidatorError::UnknownGroup);
        };
        let progress = begin(&self.inner, group_id).await?;

        let inner = self.inner.clone();
        let task_progress = progress.clone();
        tokio::spawn(async move {
            run_group(&inner, group, task_progress).await;
            finish(&inner, group_id).await;
        });
        Ok(progress)
    }

    pub async fn progress(&self, group_id: i64) -> Option<Arc<ValidationProgress>> {
        self.inner.in_flight.lock().await.get(&group_id).cloned()
    }

    pub async fn shutdown(&self, timeout: Duration) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.scheduler.lock().expect("scheduler lock").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::warn!("validator scheduler did not stop in time");
            }
        }
    }
}

async fn begin(inner: &Arc<Inner>, group_id: i64) -> Result<Arc<ValidationProgress>, ValidatorError> {
    let mut in_flight = inner.in_flight.lock().await;
    if in_flight.contains_key(&group_id) {
        return Err(ValidatorError::TaskInProgress);
    }
    let progress = Arc::new(ValidationProgress::default());
    in_flight.insert(group_id, progress.clone());
    Ok(progress)
}

async fn finish(inner: &Arc<Inner>, group_id: i64) {
    inner.in_flight.lock().await.remove(&group_id);
}

async fn run_group(inner: &Arc<Inner>, group: Arc<Group>, progress: Arc<ValidationProgress>) {
    let Some(pool) = inner.pools.pool(group.id) else {
        return;
    };
    let Some(channel) = inner.registry.get(&group.channel_type) else {
        tracing::warn!(group = %group.name, channel_type = %group.channel_type, "cannot validate unknown channel type");
        return;
    };

    let snapshot = pool.snapshot();
    let inactive = snapshot.inactive.clone();
    progress.total.store(inactive.len(), Ordering::Relaxed);
    if inactive.is_empty() {
        return;
    }

    let settings = inner.settings.get();
    let concurrency = group
        .config
        .key_validation_concurrency
        .unwrap_or(settings.key_validation_concurrency)
        .max(1) as usize;
    let probe_timeout = Duration::from_secs(settings.key_validation_timeout_seconds);
    let opts = DispatchOptions::from_effective(&settings.merged(&group.config));
    let promoted = AtomicUsize::new(0);

    futures_util::stream::iter(inactive.iter().cloned().enumerate())
        .for_each_concurrent(concurrency, |(index, key)| {
            let group = group.clone();
            let pool: Arc<KeyPool> = pool.clone();
            let channel = channel.clone();
            let opts = opts.clone();
            let progress = progress.clone();
            let promoted = &promoted;
            let inner = inner.clone();
            async move {
                // The group-level bound above still applies; this permit
                // enforces the process-wide cap when several groups (sweep
                // plus on-demand runs) validate at once.
                let _permit = match inner.probe_permits.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let upstream = &group.upstreams[index % group.upstreams.len()];
                if probe_key(
                    inner.client.clone(),
                    channel.as_ref(),
                    &opts,
                    probe_timeout,
                    upstream,
                    &key.value,
                )
                .await
                {
                    if pool.promote(key.id, OffsetDateTime::now_utc()) {
                        promoted.fetch_add(1, Ordering::Relaxed);
                    }
                }
                progress.processed.fetch_add(1, Ordering::Relaxed);
            }
        })
        .await;

    let promoted = promoted.load(Ordering::Relaxed);
    if promoted > 0 {
        tracing::info!(group = %group.name, promoted, "validation promoted keys");
    }
}

async fn probe_key(
    client: Arc<dyn UpstreamClient>,
    channel: &dyn Channel,
    opts: &DispatchOptions,
    probe_timeout: Duration,
    upstream: &str,
    key: &str,
) -> bool {
    let request = channel.validation_probe(upstream, key);
    match tokio::time::timeout(probe_timeout, client.send(request, opts)).await {
        Ok(Ok(resp)) => (200..300).contains(&resp.status),
        Ok(Err(_)) | Err(_) => false,
    }
}
