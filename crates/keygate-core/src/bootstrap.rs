use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;

use keygate_channel::ChannelRegistry;
use keygate_common::{AppConfig, SystemSettings};
use keygate_store::{
    KvStore, LogSinkConfig, LogSinkWorker, MemoryStore, RedisStore, RequestLogSink,
    RequestLogStore, RetentionJob, SeaOrmStorage, Storage,
};

use crate::client::{UpstreamClient, WreqClient};
use crate::engine::ProxyEngine;
use crate::groups::GroupMap;
use crate::pool::{KeyStateConfig, KeyStateSink, KeyStateWorker, KeysByGroup, PoolManager};
use crate::syncer::{CHANNEL_GROUPS, CHANNEL_KEYS, CHANNEL_SETTINGS, CacheSyncer, Loader, ReloadHook};
use crate::validator::Validator;

const RETENTION_SWEEP_PERIOD: Duration = Duration::from_secs(3600);

/// Everything the process runs. Construction order follows the dependency
/// chain; `shutdown` walks it in reverse.
pub struct Runtime {
    pub config: AppConfig,
    pub engine: Arc<ProxyEngine>,
    pub validator: Arc<Validator>,
    pub settings: Arc<CacheSyncer<SystemSettings>>,
    pub groups: Arc<CacheSyncer<GroupMap>>,
    pub keys: Arc<CacheSyncer<KeysByGroup>>,
    pub pools: Arc<PoolManager>,
    pub kv: Arc<dyn KvStore>,
    pub storage: Arc<SeaOrmStorage>,
    log_worker: LogSinkWorker,
    retention: RetentionJob,
    state_worker: KeyStateWorker,
}

/// Connects the store, builds every subsystem, and starts the background
/// tasks. Any failure here is fatal; there is no partial-service mode.
pub async fn bootstrap(config: AppConfig) -> anyhow::Result<Runtime> {
    let storage = Arc::new(SeaOrmStorage::connect(&config.dsn).await?);
    storage.sync().await?;

    let kv: Arc<dyn KvStore> = match &config.bus_dsn {
        Some(dsn) => Arc::new(RedisStore::connect(dsn).await?),
        None => Arc::new(MemoryStore::new()),
    };

    let settings_loader: Loader<SystemSettings> = {
        let storage = storage.clone();
        Arc::new(move || {
            let storage = storage.clone();
            async move { Ok(storage.load_settings().await?) }.boxed()
        })
    };
    let settings = CacheSyncer::start(kv.clone(), CHANNEL_SETTINGS, settings_loader, None).await?;

    let storage_dyn: Arc<dyn Storage> = storage.clone();
    let (state_sink, state_worker) =
        KeyStateSink::spawn(storage_dyn, kv.clone(), KeyStateConfig::default());
    let pools = Arc::new(PoolManager::new(state_sink));

    let groups_loader: Loader<GroupMap> = {
        let storage = storage.clone();
        Arc::new(move || {
            let storage = storage.clone();
            async move { Ok(GroupMap::from_records(storage.load_groups().await?)) }.boxed()
        })
    };
    let groups_hook: ReloadHook<GroupMap> = {
        let pools = pools.clone();
        Arc::new(move |groups| pools.apply_groups(groups))
    };
    let groups =
        CacheSyncer::start(kv.clone(), CHANNEL_GROUPS, groups_loader, Some(groups_hook)).await?;

    let keys_loader: Loader<KeysByGroup> = {
        let storage = storage.clone();
        Arc::new(move || {
            let storage = storage.clone();
            async move { Ok(KeysByGroup::from_records(storage.load_keys().await?)) }.boxed()
        })
    };
    let keys_hook: ReloadHook<KeysByGroup> = {
        let pools = pools.clone();
        Arc::new(move |keys| pools.apply_keys(keys))
    };
    let keys = CacheSyncer::start(kv.clone(), CHANNEL_KEYS, keys_loader, Some(keys_hook)).await?;

    let boot_settings = settings.get();
    let log_store: Arc<dyn RequestLogStore> = storage.clone();
    let (logs, log_worker) = RequestLogSink::spawn(
        log_store.clone(),
        LogSinkConfig {
            flush_interval: Duration::from_secs(
                boot_settings.request_log_write_interval_minutes.max(1) * 60,
            ),
            ..LogSinkConfig::default()
        },
    );
    let retention = RetentionJob::spawn(
        log_store,
        {
            let settings = settings.clone();
            Arc::new(move || settings.get().request_log_retention_days)
        },
        RETENTION_SWEEP_PERIOD,
    );

    let registry = Arc::new(ChannelRegistry::builtin());
    let client: Arc<dyn UpstreamClient> = WreqClient::shared();

    let engine = Arc::new(ProxyEngine::new(
        groups.clone(),
        settings.clone(),
        pools.clone(),
        registry.clone(),
        client.clone(),
        logs,
    ));

    let validator = Arc::new(Validator::new(
        groups.clone(),
        settings.clone(),
        pools.clone(),
        registry,
        client,
    ));
    validator.start_scheduler();

    Ok(Runtime {
        config,
        engine,
        validator,
        settings,
        groups,
        keys,
        pools,
        kv,
        storage,
        log_worker,
        retention,
        state_worker,
    })
}

impl Runtime {
    /// Writes one operator knob and tells every instance to reload its
    /// settings snapshot.
    pub async fn update_setting(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> anyhow::Result<()> {
        self.storage.upsert_setting(key, value).await?;
        self.settings.invalidate().await?;
        Ok(())
    }

    /// Drains background work in reverse startup order; every stage gets the
    /// configured grace period.
    pub async fn shutdown(self) {
        let grace = Duration::from_secs(
            self.settings
                .get()
                .graceful_shutdown_timeout_seconds
                .max(1),
        );
        self.validator.shutdown(grace).await;
        self.log_worker.shutdown(grace).await;
        self.retention.shutdown(grace).await;
        self.state_worker.shutdown(grace).await;
        self.keys.shutdown(grace).await;
        self.groups.shutdown(grace).await;
        self.settings.shutdown(grace).await;
    }
}
