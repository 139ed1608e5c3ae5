//! Configuration loading for the scheduler.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Scheduler configuration loaded from TOML + environment overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// HTTP listen address for node and operator routes
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Sled database path for archive, replica and validation state
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Candidates seeded in the root step
    #[serde(default = "default_root_cache_count")]
    pub root_cache_count: usize,

    /// Extra candidate replicas beyond the root seeds
    #[serde(default)]
    pub candidate_replica_extra: usize,

    /// Nodes above this disk usage (percent) are never selected
    #[serde(default = "default_disk_usage_max")]
    pub disk_usage_max: f64,

    /// How long a dispatched cache task may run without progress
    #[serde(default = "default_cache_timeout_secs")]
    pub cache_timeout_secs: u64,

    /// Timeout for one dispatch RPC
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,

    /// Cap on in-flight dispatch RPCs across all archives
    #[serde(default = "default_max_concurrent_dispatches")]
    pub max_concurrent_dispatches: usize,

    /// Whether periodic validation rounds run
    #[serde(default = "default_validation_enabled")]
    pub validation_enabled: bool,

    #[serde(default = "default_validation_interval_secs")]
    pub validation_interval_secs: u64,

    /// Seconds of block streaming requested per challenge
    #[serde(default = "default_validation_duration_secs")]
    pub validation_duration_secs: u64,

    /// Timeout for one challenge or referee RPC
    #[serde(default = "default_validation_dispatch_timeout_secs")]
    pub validation_dispatch_timeout_secs: u64,

    /// Interval of the timeout and expiry sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// API key for operator routes. Operator routes are refused when unset.
    #[serde(default)]
    pub write_token: Option<String>,

    /// Upper bound on archive records restored at startup
    #[serde(default = "default_max_records_loaded")]
    pub max_records_loaded: usize,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3456))
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/scheduler/state.db")
}

fn default_root_cache_count() -> usize {
    1
}

fn default_disk_usage_max() -> f64 {
    90.0
}

fn default_cache_timeout_secs() -> u64 {
    3600
}

fn default_dispatch_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_dispatches() -> usize {
    64
}

fn default_validation_enabled() -> bool {
    true
}

fn default_validation_interval_secs() -> u64 {
    300
}

fn default_validation_duration_secs() -> u64 {
    10
}

fn default_validation_dispatch_timeout_secs() -> u64 {
    15
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_max_records_loaded() -> usize {
    10_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            db_path: default_db_path(),
            root_cache_count: default_root_cache_count(),
            candidate_replica_extra: 0,
            disk_usage_max: default_disk_usage_max(),
            cache_timeout_secs: default_cache_timeout_secs(),
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
            max_concurrent_dispatches: default_max_concurrent_dispatches(),
            validation_enabled: default_validation_enabled(),
            validation_interval_secs: default_validation_interval_secs(),
            validation_duration_secs: default_validation_duration_secs(),
            validation_dispatch_timeout_secs: default_validation_dispatch_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            write_token: None,
            max_records_loaded: default_max_records_loaded(),
        }
    }
}

impl SchedulerConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn validation_dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_dispatch_timeout_secs)
    }
}

/// Load configuration from TOML file with environment variable overrides.
pub fn load_config(path: Option<&str>) -> anyhow::Result<SchedulerConfig> {
    let config_path = path.map(std::path::Path::new).or_else(|| {
        let default = std::path::Path::new("scheduler.toml");
        default.exists().then_some(default)
    });

    let config = match config_path {
        Some(p) => toml::from_str(&std::fs::read_to_string(p)?)?,
        None => SchedulerConfig::default(),
    };

    Ok(apply_env_overrides(config))
}

/// Read an env var and parse it, returning None if missing or parse fails.
fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn apply_env_overrides(mut config: SchedulerConfig) -> SchedulerConfig {
    if let Some(addr) = env_parse("SCHEDULER_LISTEN_ADDR") {
        config.listen_addr = addr;
    }
    if let Ok(val) = std::env::var("SCHEDULER_DB_PATH") {
        config.db_path = PathBuf::from(val);
    }
    if let Some(v) = env_parse("SCHEDULER_ROOT_CACHE_COUNT") {
        config.root_cache_count = v;
    }
    if let Some(v) = env_parse("SCHEDULER_CANDIDATE_REPLICA_EXTRA") {
        config.candidate_replica_extra = v;
    }
    if let Some(v) = env_parse("SCHEDULER_DISK_USAGE_MAX") {
        config.disk_usage_max = v;
    }
    if let Some(v) = env_parse("SCHEDULER_CACHE_TIMEOUT_SECS") {
        config.cache_timeout_secs = v;
    }
    if let Some(v) = env_parse("SCHEDULER_DISPATCH_TIMEOUT_SECS") {
        config.dispatch_timeout_secs = v;
    }
    if let Some(v) = env_parse("SCHEDULER_MAX_CONCURRENT_DISPATCHES") {
        config.max_concurrent_dispatches = v;
    }
    if let Ok(val) = std::env::var("SCHEDULER_VALIDATION_ENABLED") {
        config.validation_enabled = val == "true" || val == "1";
    }
    if let Some(v) = env_parse("SCHEDULER_VALIDATION_INTERVAL_SECS") {
        config.validation_interval_secs = v;
    }
    if let Some(v) = env_parse("SCHEDULER_VALIDATION_DURATION_SECS") {
        config.validation_duration_secs = v;
    }
    if let Some(v) = env_parse("SCHEDULER_VALIDATION_DISPATCH_TIMEOUT_SECS") {
        config.validation_dispatch_timeout_secs = v;
    }
    if let Some(v) = env_parse("SCHEDULER_SWEEP_INTERVAL_SECS") {
        config.sweep_interval_secs = v;
    }
    if let Ok(val) = std::env::var("SCHEDULER_WRITE_TOKEN") {
        if !val.trim().is_empty() {
            config.write_token = Some(val);
        }
    }
    if let Some(v) = env_parse("SCHEDULER_MAX_RECORDS_LOADED") {
        config.max_records_loaded = v;
    }
    config
}
