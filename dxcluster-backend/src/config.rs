use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "dxcluster.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

/// Upstream DX cluster node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_host")]
    pub host: String,

    #[serde(default = "default_cluster_port")]
    pub port: u16,

    /// Callsign sent at the login prompt
    #[serde(default = "default_callsign")]
    pub callsign: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// How long to wait for a login prompt before logging in blind
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,

    /// Quiet period after login that counts as a successful login
    #[serde(default = "default_login_grace_secs")]
    pub login_grace_secs: u64,

    /// Upper bound on writing one line to the node
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// No traffic for this long means the connection is dead
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Sent once after login, e.g. to back-fill recent spots
    #[serde(default = "default_initial_commands")]
    pub initial_commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// A connection that stays up this long resets the backoff
    #[serde(default = "default_stable_after_secs")]
    pub stable_after_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_lookup_url")]
    pub url: String,

    #[serde(default)]
    pub key: String,

    /// Freshness window for successful lookups, 0 keeps them forever
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_negative_ttl_secs")]
    pub negative_ttl_secs: u64,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Also look up the spotter's callsign
    #[serde(default)]
    pub enrich_spotter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_purge_interval_minutes")]
    pub enrichment_purge_interval_minutes: u64,

    #[serde(default = "default_stats_interval_minutes")]
    pub stats_report_interval_minutes: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_cluster_host() -> String {
    "dxc.example.org".to_string()
}

fn default_cluster_port() -> u16 {
    7300
}

fn default_callsign() -> String {
    "N0CALL".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_login_timeout_secs() -> u64 {
    30
}

fn default_login_grace_secs() -> u64 {
    2
}

fn default_write_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    600
}

fn default_initial_commands() -> Vec<String> {
    vec!["sh/dx/100".to_string()]
}

fn default_min_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_stable_after_secs() -> u64 {
    60
}

fn default_max_size() -> usize {
    500
}

fn default_lookup_url() -> String {
    "http://log.your.site/api/lookup".to_string()
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_negative_ttl_secs() -> u64 {
    60
}

fn default_workers() -> usize {
    4
}

fn default_queue_size() -> usize {
    256
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_purge_interval_minutes() -> u64 {
    15
}

fn default_stats_interval_minutes() -> u64 {
    5
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            cluster: ClusterConfig::default(),
            backoff: BackoffConfig::default(),
            cache: CacheConfig::default(),
            enrichment: EnrichmentConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host: default_cluster_host(),
            port: default_cluster_port(),
            callsign: default_callsign(),
            connect_timeout_secs: default_connect_timeout_secs(),
            login_timeout_secs: default_login_timeout_secs(),
            login_grace_secs: default_login_grace_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            initial_commands: default_initial_commands(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            stable_after_secs: default_stable_after_secs(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_lookup_url(),
            key: String::new(),
            ttl_secs: default_ttl_secs(),
            negative_ttl_secs: default_negative_ttl_secs(),
            workers: default_workers(),
            queue_size: default_queue_size(),
            request_timeout_secs: default_request_timeout_secs(),
            enrich_spotter: false,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enrichment_purge_interval_minutes: default_purge_interval_minutes(),
            stats_report_interval_minutes: default_stats_interval_minutes(),
        }
    }
}

impl BackendConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: BackendConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.host.trim().is_empty() {
            return Err(ConfigError::Invalid("cluster.host must not be empty".into()));
        }
        if self.cluster.port == 0 {
            return Err(ConfigError::Invalid("cluster.port must not be 0".into()));
        }
        if self.cluster.callsign.trim().is_empty() {
            return Err(ConfigError::Invalid("cluster.callsign must not be empty".into()));
        }
        if self.cache.max_size == 0 {
            return Err(ConfigError::Invalid("cache.max_size must be greater than 0".into()));
        }
        if self.backoff.min_delay_ms > self.backoff.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff.min_delay_ms ({}) exceeds backoff.max_delay_ms ({})",
                self.backoff.min_delay_ms, self.backoff.max_delay_ms
            )));
        }
        if self.enrichment.enabled {
            if self.enrichment.workers == 0 || self.enrichment.queue_size == 0 {
                return Err(ConfigError::Invalid(
                    "enrichment.workers and enrichment.queue_size must be greater than 0".into(),
                ));
            }
            if self.enrichment.url.trim().is_empty() {
                return Err(ConfigError::Invalid("enrichment.url must not be empty".into()));
            }
        }
        Ok(())
    }
}

impl ClusterConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl EnrichmentConfig {
    /// `None` means successful lookups never go stale
    pub fn ttl(&self) -> Option<Duration> {
        match self.ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

pub static CONFIG: OnceLock<BackendConfig> = OnceLock::new();

/// Load the configuration once for the whole process.
///
/// A missing file is not an error: the defaults are used. Logging is not up
/// yet at this point, so reporting that is left to the caller.
pub fn read_config(path: impl AsRef<Path>) -> Result<&'static BackendConfig, ConfigError> {
    let path = path.as_ref();
    let config = if path.exists() {
        BackendConfig::from_file(path)?
    } else {
        BackendConfig::default()
    };

    Ok(CONFIG.get_or_init(|| config))
}
