#![allow(dead_code)]

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use time::OffsetDateTime;

use keygate_channel::{
    ChannelRegistry, Headers, TransportError, UpstreamBody, UpstreamRequest, UpstreamResponse,
    header_get,
};
use keygate_common::{GroupConfig, SystemSettings};
use keygate_core::pool::{KeyStateConfig, KeyStateSink, KeyStateWorker};
use keygate_core::syncer::{CHANNEL_GROUPS, CHANNEL_KEYS, CHANNEL_SETTINGS};
use keygate_core::{
    CacheSyncer, DispatchOptions, GroupMap, KeysByGroup, PoolManager, ProxyEngine, UpstreamClient,
    Validator,
};
use keygate_store::{
    GroupRecord, KeyFailure, KeyRecord, KeyStatus, KeyTouch, KvStore, LogSinkConfig,
    LogSinkWorker, MemoryStore, RequestLogRecord, RequestLogSink, RequestLogStore, Storage,
    StorageResult,
};

pub fn group_record(id: i64, name: &str, config: GroupConfig) -> GroupRecord {
    GroupRecord {
        id,
        name: name.to_string(),
        display_name: name.to_string(),
        channel_type: "openai".to_string(),
        upstreams: vec!["https://api.openai.com".to_string()],
        config,
    }
}

pub fn key_record(id: i64, group_id: i64, value: &str, status: KeyStatus) -> KeyRecord {
    KeyRecord {
        id,
        group_id,
        value: value.to_string(),
        status,
        request_count: 0,
        failure_count: 0,
        last_used_at: None,
        last_validated_at: None,
    }
}

#[derive(Default)]
pub struct MockStorage {
    pub groups: Mutex<Vec<GroupRecord>>,
    pub keys: Mutex<Vec<KeyRecord>>,
    pub settings: Mutex<SystemSettings>,
    pub status_changes: Mutex<Vec<(i64, KeyStatus)>>,
    pub touches: Mutex<Vec<i64>>,
}

impl MockStorage {
    pub fn new(groups: Vec<GroupRecord>, keys: Vec<KeyRecord>, settings: SystemSettings) -> Self {
        Self {
            groups: Mutex::new(groups),
            keys: Mutex::new(keys),
            settings: Mutex::new(settings),
            status_changes: Mutex::new(Vec::new()),
            touches: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Storage for MockStorage {
    async fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn load_groups(&self) -> StorageResult<Vec<GroupRecord>> {
        Ok(self.groups.lock().unwrap().clone())
    }

    async fn load_keys(&self) -> StorageResult<Vec<KeyRecord>> {
        Ok(self.keys.lock().unwrap().clone())
    }

    async fn load_settings(&self) -> StorageResult<SystemSettings> {
        Ok(self.settings.lock().unwrap().clone())
    }

    async fn upsert_setting(&self, _key: &str, _value: &serde_json::Value) -> StorageResult<()> {
        Ok(())
    }

    async fn touch_keys(&self, touches: &[KeyTouch]) -> StorageResult<()> {
        let mut seen = self.touches.lock().unwrap();
        seen.extend(touches.iter().map(|touch| touch.key_id));
        Ok(())
    }

    async fn record_key_failures(&self, _failures: &[KeyFailure]) -> StorageResult<()> {
        Ok(())
    }

    async fn set_key_status(
        &self,
        key_id: i64,
        status: KeyStatus,
        failure_count: i64,
        _validated_at: Option<OffsetDateTime>,
    ) -> StorageResult<()> {
        self.status_changes.lock().unwrap().push((key_id, status));
        let mut keys = self.keys.lock().unwrap();
        if let Some(key) = keys.iter_mut().find(|key| key.id == key_id) {
            key.status = status;
            key.failure_count = failure_count;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockLogStore {
    pub rows: Mutex<Vec<RequestLogRecord>>,
}

#[async_trait]
impl RequestLogStore for MockLogStore {
    async fn insert_request_logs(&self, rows: &[RequestLogRecord]) -> StorageResult<()> {
        self.rows.lock().unwrap().extend(rows.iter().cloned());
        Ok(())
    }

    async fn delete_request_logs_before(&self, _cutoff: OffsetDateTime) -> StorageResult<u64> {
        Ok(0)
    }
}

pub enum ScriptedBody {
    Bytes(Vec<u8>),
    Stream(Vec<Bytes>),
}

pub struct Scripted {
    pub status: u16,
    pub headers: Headers,
    pub body: ScriptedBody,
    pub delay: Option<Duration>,
}

impl Scripted {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: ScriptedBody::Bytes(body.as_bytes().to_vec()),
            delay: None,
        }
    }

    pub fn sse(chunks: Vec<Bytes>) -> Self {
        Self {
            status: 200,
            headers: vec![(
                "Content-Type".to_string(),
                "text/event-stream".to_string(),
            )],
            body: ScriptedBody::Stream(chunks),
            delay: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SentRequest {
    pub url: String,
    pub authorization: Option<String>,
}

/// Scripted transport: answers from a queue, records what was sent, and
/// tracks how many sends overlap.
#[derive(Default)]
pub struct MockClient {
    pub script: Mutex<VecDeque<Result<Scripted, TransportError>>>,
    pub sent: Mutex<Vec<SentRequest>>,
    in_flight: std::sync::atomic::AtomicUsize,
    max_in_flight: std::sync::atomic::AtomicUsize,
}

impl MockClient {
    pub fn scripted(responses: Vec<Result<Scripted, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(responses.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
            .load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl UpstreamClient for MockClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
        _opts: &'a DispatchOptions,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>>
    {
        self.sent.lock().unwrap().push(SentRequest {
            url: req.url.clone(),
            authorization: header_get(&req.headers, "authorization").map(str::to_string),
        });
        let next = self.script.lock().unwrap().pop_front();
        async move {
            use std::sync::atomic::Ordering;

            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            let result = self.respond(next).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
        .boxed()
    }
}

impl MockClient {
    async fn respond(
        &self,
        next: Option<Result<Scripted, TransportError>>,
    ) -> Result<UpstreamResponse, TransportError> {
        let scripted = match next {
            Some(Ok(scripted)) => scripted,
            Some(Err(err)) => return Err(err),
            None => Scripted::json(200, "{}"),
        };
        if let Some(delay) = scripted.delay {
            tokio::time::sleep(delay).await;
        }
        let body = match scripted.body {
            ScriptedBody::Bytes(bytes) => UpstreamBody::Bytes(Bytes::from(bytes)),
            ScriptedBody::Stream(chunks) => {
                let (tx, rx) = tokio::sync::mpsc::channel(4);
                tokio::spawn(async move {
                    for chunk in chunks {
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                });
                UpstreamBody::Stream(rx)
            }
        };
        Ok(UpstreamResponse {
            status: scripted.status,
            headers: scripted.headers,
            body,
        })
    }
}

pub struct Harness {
    pub kv: Arc<dyn KvStore>,
    pub storage: Arc<MockStorage>,
    pub log_store: Arc<MockLogStore>,
    pub client: Arc<MockClient>,
    pub pools: Arc<PoolManager>,
    pub groups: Arc<CacheSyncer<GroupMap>>,
    pub keys: Arc<CacheSyncer<KeysByGroup>>,
    pub settings: Arc<CacheSyncer<SystemSettings>>,
    pub engine: Arc<ProxyEngine>,
    pub validator: Arc<Validator>,
    _log_worker: LogSinkWorker,
    _state_worker: KeyStateWorker,
}

pub async fn harness(
    groups: Vec<GroupRecord>,
    keys: Vec<KeyRecord>,
    settings: SystemSettings,
    script: Vec<Result<Scripted, TransportError>>,
) -> Harness {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let storage = Arc::new(MockStorage::new(groups, keys, settings));
    let log_store = Arc::new(MockLogStore::default());
    let client = MockClient::scripted(script);

    let storage_dyn: Arc<dyn Storage> = storage.clone();
    let (state_sink, state_worker) = KeyStateSink::spawn(
        storage_dyn,
        kv.clone(),
        KeyStateConfig {
            flush_interval: Duration::from_millis(10),
            ..KeyStateConfig::default()
        },
    );
    let pools = Arc::new(PoolManager::new(state_sink));

    let settings_syncer = {
        let storage = storage.clone();
        CacheSyncer::start(
            kv.clone(),
            CHANNEL_SETTINGS,
            Arc::new(move || {
                let storage = storage.clone();
                async move { Ok(storage.load_settings().await?) }.boxed()
            }),
            None,
        )
        .await
        .unwrap()
    };

    let groups_syncer = {
        let storage = storage.clone();
        let pools = pools.clone();
        CacheSyncer::start(
            kv.clone(),
            CHANNEL_GROUPS,
            Arc::new(move || {
                let storage = storage.clone();
                async move { Ok(GroupMap::from_records(storage.load_groups().await?)) }.boxed()
            }),
            Some(Arc::new(move |groups: &GroupMap| pools.apply_groups(groups))),
        )
        .await
        .unwrap()
    };

    let keys_syncer = {
        let storage = storage.clone();
        let pools = pools.clone();
        CacheSyncer::start(
            kv.clone(),
            CHANNEL_KEYS,
            Arc::new(move || {
                let storage = storage.clone();
                async move { Ok(KeysByGroup::from_records(storage.load_keys().await?)) }.boxed()
            }),
            Some(Arc::new(move |keys: &KeysByGroup| pools.apply_keys(keys))),
        )
        .await
        .unwrap()
    };

    let (logs, log_worker) = RequestLogSink::spawn(
        log_store.clone(),
        LogSinkConfig {
            capacity: 256,
            batch_size: 1,
            flush_interval: Duration::from_millis(10),
        },
    );

    let registry = Arc::new(ChannelRegistry::builtin());
    let engine = Arc::new(ProxyEngine::new(
        groups_syncer.clone(),
        settings_syncer.clone(),
        pools.clone(),
        registry.clone(),
        client.clone(),
        logs,
    ));
    let validator = Arc::new(Validator::new(
        groups_syncer.clone(),
        settings_syncer.clone(),
        pools.clone(),
        registry,
        client.clone(),
    ));

    Harness {
        kv,
        storage,
        log_store,
        client,
        pools,
        groups: groups_syncer,
        keys: keys_syncer,
        settings: settings_syncer,
        engine,
        validator,
        _log_worker: log_worker,
        _state_worker: state_worker,
    }
}
