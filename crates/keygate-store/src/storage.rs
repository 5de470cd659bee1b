use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use keygate_common::{GroupConfig, SystemSettings};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid row: {0}")]
    InvalidRow(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    Inactive,
}

impl KeyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(KeyStatus::Active),
            "inactive" => Some(KeyStatus::Inactive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupRecord {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub channel_type: String,
    pub upstreams: Vec<String>,
    pub config: GroupConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyRecord {
    pub id: i64,
    pub group_id: i64,
    pub value: String,
    pub status: KeyStatus,
    pub request_count: i64,
    pub failure_count: i64,
    pub last_used_at: Option<OffsetDateTime>,
    pub last_validated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct RequestLogRecord {
    pub id: Uuid,
    pub at: OffsetDateTime,
    pub group_id: i64,
    pub group_name: String,
    pub key_value: String,
    pub source_ip: String,
    pub status_code: u16,
    pub request_path: String,
    pub request_body_snippet: String,
    pub upstream_addr: String,
    pub attempt: u32,
    pub duration_ms: i64,
    pub error_message: Option<String>,
}

/// A successful attempt: stamp last_used_at, bump request_count, clear the
/// failure streak.
#[derive(Debug, Clone, Copy)]
pub struct KeyTouch {
    pub key_id: i64,
    pub at: OffsetDateTime,
}

/// The pool's current failure streak for one key, written as an absolute
/// value; the in-memory pool is authoritative between reloads.
#[derive(Debug, Clone, Copy)]
pub struct KeyFailure {
    pub key_id: i64,
    pub failure_count: i64,
}

/// Runtime persistence surface.
///
/// Used for bootstrap loads and asynchronous state write-back only; the hot
/// request path never reads from here. Reads come from in-memory snapshots
/// maintained by the cache syncers.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync, run once at bootstrap.
    async fn sync(&self) -> StorageResult<()>;

    async fn load_groups(&self) -> StorageResult<Vec<GroupRecord>>;
    async fn load_keys(&self) -> StorageResult<Vec<KeyRecord>>;
    async fn load_settings(&self) -> StorageResult<SystemSettings>;
    async fn upsert_setting(&self, key: &str, value: &serde_json::Value) -> StorageResult<()>;

    async fn touch_keys(&self, touches: &[KeyTouch]) -> StorageResult<()>;
    async fn record_key_failures(&self, failures: &[KeyFailure]) -> StorageResult<()>;
    async fn set_key_status(
        &self,
        key_id: i64,
        status: KeyStatus,
        failure_count: i64,
        validated_at: Option<OffsetDateTime>,
    ) -> StorageResult<()>;
}
