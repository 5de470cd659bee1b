pub mod entities;
pub mod kv;
pub mod logs;
pub mod memory;
pub mod redis_store;
pub mod seaorm;
pub mod storage;

pub use kv::{KvError, KvResult, KvStore, Subscription};
pub use logs::{LogSinkConfig, LogSinkWorker, RequestLogSink, RequestLogStore, RetentionJob};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use seaorm::SeaOrmStorage;
pub use storage::{
    GroupRecord, KeyFailure, KeyRecord, KeyStatus, KeyTouch, RequestLogRecord, Storage,
    StorageError, StorageResult,
};
