pub mod config;
pub mod error;
pub mod mask;
pub mod settings;

pub use config::{AppConfig, AppConfigError, AppConfigPatch, hash_proxy_key, proxy_key_matches};
pub use error::{ApiError, ErrorCode};
pub use mask::{mask_key, redact_snippet};
pub use settings::{EffectiveSettings, GroupConfig, HeaderRewrite, SystemSettings};
