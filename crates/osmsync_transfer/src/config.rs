//! Configuration for the transfer layer.

use crate::auth::AuthMethod;
use crate::offline::OnlineResource;
use crate::strategy::{parse_strategy, MaxChangesetSizeExceededPolicy, UploadStrategySpec};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Default API server URL (without protocol version).
pub const DEFAULT_SERVER_URL: &str = "https://api.openstreetmap.org/api";

/// Default companion website URL.
pub const DEFAULT_WEBSITE_URL: &str = "https://www.openstreetmap.org";

/// Preference keys read by [`TransferConfig::from_preferences`].
pub mod keys {
    /// API server URL.
    pub const SERVER_URL: &str = "osm-server.url";
    /// `basic` or `oauth`.
    pub const AUTH_METHOD: &str = "osm-server.auth-method";
    /// `individualobjects`, `chunked` or `singlerequest`.
    pub const UPLOAD_STRATEGY: &str = "osm-server.upload-strategy";
    /// Chunk size for the chunked strategy.
    pub const CHUNK_SIZE: &str = "osm-server.upload-strategy.chunk-size";
    /// Full-changeset policy.
    pub const POLICY: &str = "osm-server.upload-strategy.policy";
    /// Whether to close the changeset after uploading.
    pub const CLOSE_CHANGESET: &str = "osm-server.upload-strategy.close-changeset";
    /// Reconciliation interval in minutes, 0 disables.
    pub const RECONCILIATION_INTERVAL: &str = "changeset.reconciliation.interval-minutes";
    /// Comma separated offline resources.
    pub const OFFLINE_RESOURCES: &str = "offline.resources";
}

/// Read-only key/value preference source.
pub trait PreferenceStore: Send + Sync {
    /// Raw value for a key.
    fn get(&self, key: &str) -> Option<String>;
}

/// In-memory preference store.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryPreferences {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a value, builder style.
    pub fn with(self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Sets a value.
    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.values.write().insert(key.to_string(), value.into());
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }
}

/// Background reconciliation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Period in minutes; 0 disables the task.
    pub interval_minutes: u64,
    /// Delay before the first run.
    pub initial_delay: Duration,
    /// Open changesets younger than this are not queried.
    pub min_age: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 60,
            initial_delay: Duration::from_secs(60),
            min_age: Duration::from_secs(60 * 60),
        }
    }
}

impl ReconciliationConfig {
    /// Sets the interval in minutes.
    pub fn with_interval_minutes(mut self, minutes: u64) -> Self {
        self.interval_minutes = minutes;
        self
    }

    /// Sets the delay before the first run.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the minimum changeset age.
    pub fn with_min_age(mut self, min_age: Duration) -> Self {
        self.min_age = min_age;
        self
    }

    /// Returns true if the task should not run.
    pub fn is_disabled(&self) -> bool {
        self.interval_minutes == 0
    }

    /// Interval as a duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.saturating_mul(60))
    }
}

/// Configuration for the transfer layer.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// API server URL, without the protocol version segment.
    pub server_url: String,
    /// Companion website URL.
    pub website_url: String,
    /// Authentication scheme.
    pub auth_method: AuthMethod,
    /// Request timeout.
    pub timeout: Duration,
    /// How long cancelling waits for an in-flight request.
    pub cancel_grace: Duration,
    /// Upload splitting and policies.
    pub upload: UploadStrategySpec,
    /// Background reconciliation.
    pub reconciliation: ReconciliationConfig,
    /// Resources offline at startup.
    pub offline_resources: Vec<OnlineResource>,
}

impl TransferConfig {
    /// Creates a configuration for a server.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            website_url: DEFAULT_WEBSITE_URL.to_string(),
            auth_method: AuthMethod::default(),
            timeout: Duration::from_secs(30),
            cancel_grace: Duration::from_millis(100),
            upload: UploadStrategySpec::default(),
            reconciliation: ReconciliationConfig::default(),
            offline_resources: Vec::new(),
        }
    }

    /// Sets the website URL.
    pub fn with_website_url(mut self, url: impl Into<String>) -> Self {
        self.website_url = url.into();
        self
    }

    /// Sets the authentication scheme.
    pub fn with_auth_method(mut self, method: AuthMethod) -> Self {
        self.auth_method = method;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the cancel grace period.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Sets the upload configuration.
    pub fn with_upload(mut self, upload: UploadStrategySpec) -> Self {
        self.upload = upload;
        self
    }

    /// Sets the reconciliation configuration.
    pub fn with_reconciliation(mut self, reconciliation: ReconciliationConfig) -> Self {
        self.reconciliation = reconciliation;
        self
    }

    /// Marks a resource offline at startup.
    pub fn with_offline(mut self, resource: OnlineResource) -> Self {
        if !self.offline_resources.contains(&resource) {
            self.offline_resources.push(resource);
        }
        self
    }

    /// Base URL for versioned API calls, ending in `/0.6/`.
    pub fn api_base_url(&self) -> String {
        format!(
            "{}/{}/",
            self.server_url.trim_end_matches('/'),
            osmsync_protocol::PROTOCOL_VERSION
        )
    }

    /// Reads configuration from a preference store.
    ///
    /// Missing keys keep their defaults; malformed values are logged and
    /// ignored.
    pub fn from_preferences(prefs: &dyn PreferenceStore) -> Self {
        let mut config = Self::default();
        if let Some(url) = prefs.get(keys::SERVER_URL).filter(|u| !u.trim().is_empty()) {
            config.server_url = url.trim().to_string();
        }
        if let Some(method) = parsed::<AuthMethod>(prefs, keys::AUTH_METHOD) {
            config.auth_method = method;
        }

        let chunk_size = parsed::<usize>(prefs, keys::CHUNK_SIZE);
        if let Some(name) = prefs.get(keys::UPLOAD_STRATEGY) {
            match parse_strategy(&name, chunk_size) {
                Ok(strategy) => config.upload.strategy = strategy,
                Err(err) => warn!(key = keys::UPLOAD_STRATEGY, error = %err, "ignoring preference"),
            }
        }
        if let Some(policy) = parsed::<MaxChangesetSizeExceededPolicy>(prefs, keys::POLICY) {
            config.upload.policy = policy;
        }
        if let Some(close) = parsed::<bool>(prefs, keys::CLOSE_CHANGESET) {
            config.upload.close_changeset_after_upload = close;
        }
        if let Some(minutes) = parsed::<u64>(prefs, keys::RECONCILIATION_INTERVAL) {
            config.reconciliation.interval_minutes = minutes;
        }
        if let Some(list) = prefs.get(keys::OFFLINE_RESOURCES) {
            for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                match name.parse::<OnlineResource>() {
                    Ok(resource) => config = config.with_offline(resource),
                    Err(err) => {
                        warn!(key = keys::OFFLINE_RESOURCES, error = %err, "ignoring entry")
                    }
                }
            }
        }
        config
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_URL)
    }
}

fn parsed<T>(prefs: &dyn PreferenceStore, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = prefs.get(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, value = %raw, error = %err, "ignoring malformed preference");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::UploadStrategy;

    #[test]
    fn config_builder() {
        let config = TransferConfig::new("https://api.example.org/api/")
            .with_auth_method(AuthMethod::OAuth)
            .with_timeout(Duration::from_secs(5))
            .with_offline(OnlineResource::Website)
            .with_offline(OnlineResource::Website);
        assert_eq!(config.api_base_url(), "https://api.example.org/api/0.6/");
        assert_eq!(config.auth_method, AuthMethod::OAuth);
        assert_eq!(config.cancel_grace, Duration::from_millis(100));
        assert_eq!(config.offline_resources, vec![OnlineResource::Website]);
    }

    #[test]
    fn defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
        assert_eq!(config.reconciliation.interval(), Duration::from_secs(3600));
        assert!(config.upload.close_changeset_after_upload);
        assert!(ReconciliationConfig::default()
            .with_interval_minutes(0)
            .is_disabled());
    }

    #[test]
    fn reads_preferences() {
        let prefs = MemoryPreferences::new()
            .with(keys::SERVER_URL, "https://api.example.org/api")
            .with(keys::AUTH_METHOD, "oauth")
            .with(keys::UPLOAD_STRATEGY, "chunked")
            .with(keys::CHUNK_SIZE, "250")
            .with(keys::POLICY, "automatically_open_new_changesets")
            .with(keys::CLOSE_CHANGESET, "false")
            .with(keys::RECONCILIATION_INTERVAL, "0")
            .with(keys::OFFLINE_RESOURCES, "website, cache_updates");
        let config = TransferConfig::from_preferences(&prefs);
        assert_eq!(config.server_url, "https://api.example.org/api");
        assert_eq!(config.auth_method, AuthMethod::OAuth);
        assert_eq!(config.upload.strategy, UploadStrategy::chunked(250));
        assert_eq!(
            config.upload.policy,
            MaxChangesetSizeExceededPolicy::AutomaticallyOpenNewChangesets
        );
        assert!(!config.upload.close_changeset_after_upload);
        assert!(config.reconciliation.is_disabled());
        assert_eq!(
            config.offline_resources,
            vec![OnlineResource::Website, OnlineResource::CacheUpdates]
        );
    }

    #[test]
    fn malformed_preferences_keep_defaults() {
        let prefs = MemoryPreferences::new()
            .with(keys::AUTH_METHOD, "kerberos")
            .with(keys::UPLOAD_STRATEGY, "parallel")
            .with(keys::RECONCILIATION_INTERVAL, "soon")
            .with(keys::OFFLINE_RESOURCES, "moon");
        let config = TransferConfig::from_preferences(&prefs);
        assert_eq!(config.auth_method, AuthMethod::Basic);
        assert_eq!(config.upload.strategy, UploadStrategy::SingleRequest);
        assert_eq!(config.reconciliation.interval_minutes, 60);
        assert!(config.offline_resources.is_empty());
    }
}
