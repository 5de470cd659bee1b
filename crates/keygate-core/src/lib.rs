pub mod bootstrap;
pub mod client;
pub mod engine;
pub mod groups;
pub mod pool;
pub mod syncer;
pub mod validator;

pub use bootstrap::{Runtime, bootstrap};
pub use client::{DispatchOptions, UpstreamClient, WreqClient};
pub use engine::{EngineResponse, InboundRequest, ProxyEngine};
pub use groups::GroupMap;
pub use pool::{AcquireError, AcquiredKey, KeyPool, KeysByGroup, PoolManager, PoolSnapshot};
pub use syncer::{CacheSyncer, CHANNEL_GROUPS, CHANNEL_KEYS, CHANNEL_SETTINGS};
pub use validator::{ValidationProgress, Validator, ValidatorError};
