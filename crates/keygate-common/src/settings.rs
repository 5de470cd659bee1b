use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process-wide operator knobs, stored row-per-key in `system_settings`.
///
/// The loader folds whatever rows exist over these defaults, so a fresh
/// database and a partially populated one both produce a usable snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    /// Consecutive failures before a key is demoted. 0 disables demotion.
    pub blacklist_threshold: u32,
    pub max_retries: u32,
    pub request_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub idle_conn_timeout_seconds: u64,
    pub response_header_timeout_seconds: u64,
    pub max_idle_conns: u32,
    pub max_idle_conns_per_host: u32,
    /// Clamped to >= 30 by the validator.
    pub key_validation_interval_minutes: u64,
    pub key_validation_concurrency: u32,
    pub key_validation_timeout_seconds: u64,
    pub request_log_write_interval_minutes: u64,
    /// 0 keeps request logs forever.
    pub request_log_retention_days: u32,
    pub graceful_shutdown_timeout_seconds: u64,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            blacklist_threshold: 3,
            max_retries: 3,
            request_timeout_seconds: 600,
            connect_timeout_seconds: 15,
            idle_conn_timeout_seconds: 120,
            response_header_timeout_seconds: 600,
            max_idle_conns: 100,
            max_idle_conns_per_host: 50,
            key_validation_interval_minutes: 60,
            key_validation_concurrency: 10,
            key_validation_timeout_seconds: 20,
            request_log_write_interval_minutes: 1,
            request_log_retention_days: 7,
            graceful_shutdown_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRewrite {
    pub name: String,
    pub value: String,
}

/// Per-group overrides. Every field falls back to [`SystemSettings`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub blacklist_threshold: Option<u32>,
    pub max_retries: Option<u32>,
    pub request_timeout_seconds: Option<u64>,
    pub connect_timeout_seconds: Option<u64>,
    pub idle_conn_timeout_seconds: Option<u64>,
    pub response_header_timeout_seconds: Option<u64>,
    pub key_validation_interval_minutes: Option<u64>,
    pub key_validation_concurrency: Option<u32>,
    /// Constant JSON fields merged into JSON request bodies (overrides win).
    pub param_overrides: Option<serde_json::Map<String, serde_json::Value>>,
    pub header_rewrites: Option<Vec<HeaderRewrite>>,
}

/// Concrete values for one group after override resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub blacklist_threshold: u32,
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub idle_conn_timeout: Duration,
    pub response_header_timeout: Duration,
    pub max_idle_conns: u32,
    pub max_idle_conns_per_host: u32,
}

impl SystemSettings {
    pub fn merged(&self, overrides: &GroupConfig) -> EffectiveSettings {
        EffectiveSettings {
            blacklist_threshold: overrides
                .blacklist_threshold
                .unwrap_or(self.blacklist_threshold),
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
            request_timeout: Duration::from_secs(
                overrides
                    .request_timeout_seconds
                    .unwrap_or(self.request_timeout_seconds),
            ),
            connect_timeout: Duration::from_secs(
                overrides
                    .connect_timeout_seconds
                    .unwrap_or(self.connect_timeout_seconds),
            ),
            idle_conn_timeout: Duration::from_secs(
                overrides
                    .idle_conn_timeout_seconds
                    .unwrap_or(self.idle_conn_timeout_seconds),
            ),
            response_header_timeout: Duration::from_secs(
                overrides
                    .response_header_timeout_seconds
                    .unwrap_or(self.response_header_timeout_seconds),
            ),
            max_idle_conns: self.max_idle_conns,
            max_idle_conns_per_host: self.max_idle_conns_per_host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_partial_json() {
        let settings: SystemSettings =
            serde_json::from_str(r#"{"max_retries": 1, "blacklist_threshold": 0}"#).unwrap();
        assert_eq!(settings.max_retries, 1);
        assert_eq!(settings.blacklist_threshold, 0);
        assert_eq!(settings.request_timeout_seconds, 600);
    }

    #[test]
    fn group_overrides_win() {
        let settings = SystemSettings::default();
        let overrides = GroupConfig {
            max_retries: Some(1),
            request_timeout_seconds: Some(30),
            ..GroupConfig::default()
        };
        let effective = settings.merged(&overrides);
        assert_eq!(effective.max_retries, 1);
        assert_eq!(effective.request_timeout, Duration::from_secs(30));
        assert_eq!(effective.blacklist_threshold, 3);
    }
}
