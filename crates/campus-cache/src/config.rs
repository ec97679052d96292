use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::cluster::redis::node_url;
use crate::error::{CacheError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Local (L1) tier
    #[serde(default)]
    pub local: LocalTierConfig,
    /// Distributed (L2) tier
    #[serde(default)]
    pub distributed: DistributedConfig,
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(invalid(format!("logging.level must be one of {valid_levels:?}")));
        }

        // Local tier validations
        if self.local.max_keys == 0 {
            return Err(invalid("local.max_keys must be > 0"));
        }
        if self.local.max_value_bytes == 0 {
            return Err(invalid("local.max_value_bytes must be > 0"));
        }
        if self.local.default_ttl_secs == 0 {
            return Err(invalid("local.default_ttl_secs must be > 0"));
        }
        if self.local.sweep_interval_secs == 0 {
            return Err(invalid("local.sweep_interval_secs must be > 0"));
        }
        let ratio = self.local.promotion_occupancy_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(invalid("local.promotion_occupancy_ratio must be in (0, 1]"));
        }

        self.distributed.validate()
    }
}

fn invalid(message: impl Into<String>) -> CacheError {
    CacheError::Configuration(message.into())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Local tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalTierConfig {
    /// Hard cap on the number of entries
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,

    /// Values larger than this stay in the distributed tier only
    #[serde(default = "default_max_value_bytes")]
    pub max_value_bytes: usize,

    #[serde(default = "default_local_ttl_secs")]
    pub default_ttl_secs: u64,

    /// How often expired entries are swept
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Promotions stop (and admission starts evicting) above this fill ratio
    #[serde(default = "default_promotion_occupancy_ratio")]
    pub promotion_occupancy_ratio: f64,

    /// TTL of values copied from the distributed tier
    #[serde(default = "default_promotion_ttl_secs")]
    pub promotion_ttl_secs: u64,
}

fn default_max_keys() -> usize {
    10_000
}

fn default_max_value_bytes() -> usize {
    1024 * 1024
}

fn default_local_ttl_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_promotion_occupancy_ratio() -> f64 {
    0.9
}

fn default_promotion_ttl_secs() -> u64 {
    60
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            max_keys: default_max_keys(),
            max_value_bytes: default_max_value_bytes(),
            default_ttl_secs: default_local_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            promotion_occupancy_ratio: default_promotion_occupancy_ratio(),
            promotion_ttl_secs: default_promotion_ttl_secs(),
        }
    }
}

impl LocalTierConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn promotion_ttl(&self) -> Duration {
        Duration::from_secs(self.promotion_ttl_secs)
    }
}

/// Distributed tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Enable the distributed tier (gracefully degrades without it)
    /// Default: false (local-only for single-instance deployments)
    #[serde(default)]
    pub enabled: bool,

    /// Fail startup instead of falling back to local-only when no cluster
    /// can be reached
    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,

    /// Cluster backing the cache; defaults to the first one
    #[serde(default)]
    pub primary_cluster: Option<String>,

    #[serde(default = "default_distributed_ttl_secs")]
    pub default_ttl_secs: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-operation timeout; slower calls are abandoned and count as a miss
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,

    /// Consecutive failed calls before the cluster starts reconnecting
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Consecutive failures after which a node is taken out of rotation
    #[serde(default = "default_node_failure_threshold")]
    pub node_failure_threshold: u32,

    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Healthy primaries below this raise a topology alert
    #[serde(default = "default_min_primaries")]
    pub min_primaries: usize,

    /// Concurrent writes when a batch cannot be pipelined
    #[serde(default = "default_mset_concurrency")]
    pub mset_concurrency: usize,

    /// Publish invalidations so peer instances drop their local copies
    #[serde(default)]
    pub broadcast_invalidations: bool,

    #[serde(default = "default_invalidation_channel")]
    pub invalidation_channel: String,
}

fn default_distributed_ttl_secs() -> u64 {
    3600 // 1 hour
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_command_timeout_ms() -> u64 {
    2000
}

fn default_max_connect_attempts() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_reconnect_base_delay_ms() -> u64 {
    500
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_node_failure_threshold() -> u32 {
    3
}

fn default_health_check_interval_ms() -> u64 {
    10_000
}

fn default_min_primaries() -> usize {
    3
}

fn default_mset_concurrency() -> usize {
    16
}

fn default_invalidation_channel() -> String {
    "cache:invalidate".to_string()
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            required: false,
            clusters: Vec::new(),
            primary_cluster: None,
            default_ttl_secs: default_distributed_ttl_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            max_connect_attempts: default_max_connect_attempts(),
            max_retries: default_max_retries(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            node_failure_threshold: default_node_failure_threshold(),
            health_check_interval_ms: default_health_check_interval_ms(),
            min_primaries: default_min_primaries(),
            mset_concurrency: default_mset_concurrency(),
            broadcast_invalidations: false,
            invalidation_channel: default_invalidation_channel(),
        }
    }
}

impl DistributedConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// The cluster backing the cache: `primary_cluster`, else the first one.
    pub fn primary(&self) -> Option<&ClusterConfig> {
        match &self.primary_cluster {
            Some(id) => self.clusters.iter().find(|c| &c.id == id),
            None => self.clusters.first(),
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.clusters.is_empty() {
            return Err(invalid(
                "distributed.enabled=true requires at least one distributed.clusters entry",
            ));
        }
        if self.connect_timeout_ms == 0 || self.command_timeout_ms == 0 {
            return Err(invalid("distributed timeouts must be > 0"));
        }
        if self.health_check_interval_ms == 0 {
            return Err(invalid("distributed.health_check_interval_ms must be > 0"));
        }
        if self.default_ttl_secs == 0 {
            return Err(invalid("distributed.default_ttl_secs must be > 0"));
        }
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(invalid(
                "distributed.reconnect_base_delay_ms must be <= reconnect_max_delay_ms",
            ));
        }
        if self.invalidation_channel.trim().is_empty() {
            return Err(invalid("distributed.invalidation_channel must not be empty"));
        }

        let mut ids = HashSet::new();
        for cluster in &self.clusters {
            if cluster.id.trim().is_empty() {
                return Err(invalid("distributed.clusters[].id must not be empty"));
            }
            if !ids.insert(cluster.id.as_str()) {
                return Err(invalid(format!("duplicate cluster id '{}'", cluster.id)));
            }
            if cluster.nodes.is_empty() {
                return Err(invalid(format!("cluster '{}' has no nodes", cluster.id)));
            }
            if cluster.pool_size == 0 {
                return Err(invalid(format!("cluster '{}' pool_size must be > 0", cluster.id)));
            }
            for node in &cluster.nodes {
                node_url(
                    node,
                    cluster.username.as_deref(),
                    cluster.password.as_deref(),
                    cluster.database,
                )
                .map_err(|e| invalid(format!("cluster '{}': {}", cluster.id, e.message)))?;
            }
        }

        if let Some(primary) = &self.primary_cluster {
            if !ids.contains(primary.as_str()) {
                return Err(invalid(format!(
                    "distributed.primary_cluster '{primary}' is not a configured cluster"
                )));
            }
        }
        Ok(())
    }
}

/// One named cluster of cache nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub id: String,

    /// Node addresses, `host:port` or `redis://host:port`
    pub nodes: Vec<String>,

    #[serde(default)]
    pub username: Option<String>,

    /// Prefer CAMPUS_CACHE__DISTRIBUTED__... environment overrides for secrets
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    #[serde(default)]
    pub database: Option<u32>,

    /// Connections per node
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    10
}

pub mod loader {
    use super::CacheConfig;
    use crate::error::{CacheError, Result};
    use config::{Config, Environment, File};
    use std::path::{Path, PathBuf};

    pub const DEFAULT_CONFIG_FILE: &str = "campus-cache.toml";

    pub fn load_config(path: Option<&str>) -> Result<CacheConfig> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if !pathbuf.exists() {
                    return Err(CacheError::Configuration(format!(
                        "config file '{p}' not found"
                    )));
                }
                builder = builder.add_source(File::from(pathbuf));
            }
            None => {
                // Try default root-level file
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., CAMPUS_CACHE__LOCAL__MAX_KEYS=50000
        builder = builder.add_source(
            Environment::with_prefix("CAMPUS_CACHE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| CacheError::Configuration(format!("config build error: {e}")))?;
        let merged: CacheConfig = cfg
            .try_deserialize()
            .map_err(|e| CacheError::Configuration(format!("config deserialize error: {e}")))?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn load_config_with_default_path<P: AsRef<Path>>(path: Option<P>) -> Result<CacheConfig> {
        let p = path
            .as_ref()
            .map(|p| p.as_ref().to_string_lossy().to_string());
        load_config(p.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cluster(id: &str, nodes: &[&str]) -> ClusterConfig {
        ClusterConfig {
            id: id.into(),
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            username: None,
            password: None,
            database: None,
            pool_size: default_pool_size(),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.local.max_keys, 10_000);
        assert_eq!(config.distributed.command_timeout_ms, 2000);
        assert!(!config.distributed.enabled);
    }

    #[test]
    fn test_enabled_without_clusters_is_rejected() {
        let mut config = CacheConfig::default();
        config.distributed.enabled = true;
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_cluster_validation() {
        let mut config = CacheConfig::default();
        config.distributed.enabled = true;
        config.distributed.clusters = vec![cluster("main", &["10.0.0.1:6379"])];
        assert!(config.validate().is_ok());

        config.distributed.clusters.push(cluster("main", &["10.0.0.2:6379"]));
        assert!(config.validate().is_err());

        config.distributed.clusters = vec![cluster("main", &["http://10.0.0.1"])];
        assert!(config.validate().is_err());

        config.distributed.clusters = vec![cluster("main", &["10.0.0.1:6379"])];
        config.distributed.primary_cluster = Some("sessions".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_local_validation() {
        let mut config = CacheConfig::default();
        config.local.promotion_occupancy_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.local.max_keys = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_primary_cluster_selection() {
        let mut distributed = DistributedConfig {
            clusters: vec![cluster("main", &["a:1"]), cluster("sessions", &["b:1"])],
            ..DistributedConfig::default()
        };
        assert_eq!(distributed.primary().map(|c| c.id.as_str()), Some("main"));
        distributed.primary_cluster = Some("sessions".into());
        assert_eq!(distributed.primary().map(|c| c.id.as_str()), Some("sessions"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[local]
max_keys = 2
max_value_bytes = 1024

[distributed]
enabled = true
command_timeout_ms = 750

[[distributed.clusters]]
id = "main"
nodes = ["10.0.0.1:6379", "10.0.0.2:6379"]
"#
        )
        .unwrap();

        let config = loader::load_config(file.path().to_str()).unwrap();
        assert_eq!(config.local.max_keys, 2);
        assert_eq!(config.local.default_ttl_secs, 300);
        assert_eq!(config.distributed.command_timeout_ms, 750);
        assert_eq!(config.distributed.clusters[0].nodes.len(), 2);
        assert_eq!(config.distributed.clusters[0].pool_size, 10);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = loader::load_config(Some("/nonexistent/campus-cache.toml")).unwrap_err();
        assert!(err.is_fatal());
    }
}
