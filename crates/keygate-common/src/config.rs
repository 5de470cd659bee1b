use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum AppConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged process configuration.
///
/// Merge order: CLI > ENV, resolved once at startup. Runtime knobs live in
/// `system_settings` instead and hot-reload through the settings syncer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Database DSN (sqlite file path DSN, mysql, or postgres).
    pub dsn: String,
    /// Optional bus DSN (redis). Empty means the embedded in-process store.
    pub bus_dsn: Option<String>,
    /// Externally visible base URL, advertised only.
    pub app_url: Option<String>,
    /// Stored as a hash (not plaintext). None disables proxy auth.
    pub auth_key_hash: Option<String>,
}

/// Optional layer used while merging [`AppConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub bus_dsn: Option<String>,
    pub app_url: Option<String>,
    pub auth_key_hash: Option<String>,
}

impl AppConfigPatch {
    pub fn overlay(&mut self, other: AppConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.bus_dsn.is_some() {
            self.bus_dsn = other.bus_dsn;
        }
        if other.app_url.is_some() {
            self.app_url = other.app_url;
        }
        if other.auth_key_hash.is_some() {
            self.auth_key_hash = other.auth_key_hash;
        }
    }

    pub fn into_config(self) -> Result<AppConfig, AppConfigError> {
        Ok(AppConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8989),
            dsn: self.dsn.ok_or(AppConfigError::MissingField("dsn"))?,
            bus_dsn: self.bus_dsn.filter(|dsn| !dsn.trim().is_empty()),
            app_url: self.app_url,
            auth_key_hash: self.auth_key_hash,
        })
    }
}

pub fn hash_proxy_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

/// Compares hashes rather than key bytes so the comparison cost does not
/// depend on how much of the presented key matches.
pub fn proxy_key_matches(expected_hash: &str, presented: &str) -> bool {
    hash_proxy_key(presented) == expected_hash
}
