pub mod defaults;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::MemtuneError;
use crate::runtime::parse_memory_limit;
use defaults::*;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemtuneConfig {
    /// Memory ceiling such as "512M" or "2G"; "-1" or absent means unlimited
    pub memory_limit: Option<String>,
    pub scheduler: SchedulerConfig,
    pub profiler: ProfilerConfig,
    pub pool: PoolConfig,
    pub connection_pool: ConnectionPoolConfig,
    pub array_pool: ArrayPoolConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub auto_optimize: bool,
    pub enable_monitoring: bool,
    pub adaptive_scheduling: bool,
    pub profile_gc: bool,
    pub min_interval_secs: f64,
    pub memory_threshold: f64,
    pub roots_threshold: u64,
    pub buffer_threshold: u64,
    pub max_gc_time_secs: f64,
    pub history_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    pub enabled: bool,
    pub stack_depth: usize,
    pub threshold_kb: u64,
    pub max_snapshots: usize,
    pub track_allocations: bool,
    pub track_objects: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_pool_size: usize,
    pub max_idle_time_secs: u64,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    pub max_pool_size: usize,
    pub max_idle_time_secs: u64,
    pub ping_interval_secs: u64,
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrayPoolConfig {
    pub buckets: Vec<usize>,
    pub max_per_bucket: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl MemtuneConfig {
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILENAME)
    }

    /// Layer an optional TOML file and `MEMTUNE__SECTION__KEY` environment
    /// variables over the defaults.
    ///
    /// Without an explicit path the default location is used when it exists.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        match config_path {
            Some(path) => {
                builder = builder.add_source(::config::File::from(path).required(true));
            }
            None => {
                let fallback = Self::default_config_path();
                if fallback.exists() {
                    builder = builder.add_source(::config::File::from(fallback).required(false));
                }
            }
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build().with_context(|| match config_path {
            Some(path) => format!("Failed to read config file: {}", path.display()),
            None => "Failed to assemble configuration".to_string(),
        })?;

        let config: Self = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> crate::errors::Result<()> {
        let s = &self.scheduler;
        if s.min_interval_secs < 0.0 {
            return Err(MemtuneError::configuration("scheduler.min_interval_secs must not be negative"));
        }
        if !(s.memory_threshold > 0.0 && s.memory_threshold <= 1.0) {
            return Err(MemtuneError::configuration(
                "scheduler.memory_threshold must be in (0.0, 1.0]",
            ));
        }
        if s.roots_threshold == 0 || s.buffer_threshold == 0 {
            return Err(MemtuneError::configuration(
                "scheduler roots and buffer thresholds must be greater than 0",
            ));
        }
        if s.max_gc_time_secs <= 0.0 {
            return Err(MemtuneError::configuration("scheduler.max_gc_time_secs must be greater than 0"));
        }
        if s.history_size == 0 {
            return Err(MemtuneError::configuration("scheduler.history_size must be greater than 0"));
        }

        if self.profiler.stack_depth == 0 {
            return Err(MemtuneError::configuration("profiler.stack_depth must be greater than 0"));
        }
        if self.profiler.max_snapshots == 0 {
            return Err(MemtuneError::configuration("profiler.max_snapshots must be greater than 0"));
        }

        if self.pool.max_pool_size == 0 || self.connection_pool.max_pool_size == 0 {
            return Err(MemtuneError::configuration("Pool sizes must be greater than 0"));
        }

        if self.array_pool.buckets.is_empty() || self.array_pool.buckets.contains(&0) {
            return Err(MemtuneError::configuration(
                "array_pool.buckets must list at least one non-zero size",
            ));
        }

        self.memory_ceiling()?;
        Ok(())
    }

    /// Parsed memory ceiling in bytes
    pub fn memory_ceiling(&self) -> crate::errors::Result<Option<u64>> {
        match &self.memory_limit {
            Some(limit) => parse_memory_limit(limit),
            None => Ok(None),
        }
    }

    /// Render the effective configuration
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

impl SchedulerConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs_f64(self.min_interval_secs.max(0.0))
    }

    pub fn max_gc_time(&self) -> Duration {
        Duration::from_secs_f64(self.max_gc_time_secs.max(0.0))
    }
}

impl ProfilerConfig {
    pub fn threshold_bytes(&self) -> u64 {
        self.threshold_kb * 1024
    }
}

impl PoolConfig {
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_time_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl ConnectionPoolConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Pool settings for the generic pool underneath
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_pool_size: self.max_pool_size,
            max_idle_time_secs: self.max_idle_time_secs,
            ..PoolConfig::default()
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_optimize: true,
            enable_monitoring: true,
            adaptive_scheduling: true,
            profile_gc: true,
            min_interval_secs: DEFAULT_MIN_INTERVAL_SECS,
            memory_threshold: DEFAULT_MEMORY_RATIO,
            roots_threshold: DEFAULT_ROOTS_THRESHOLD,
            buffer_threshold: DEFAULT_BUFFER_THRESHOLD,
            max_gc_time_secs: DEFAULT_MAX_GC_TIME_SECS,
            history_size: DEFAULT_HISTORY_SIZE,
        }
    }
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stack_depth: DEFAULT_STACK_DEPTH,
            threshold_kb: DEFAULT_ALLOCATION_THRESHOLD_KB,
            max_snapshots: DEFAULT_MAX_SNAPSHOTS,
            track_allocations: true,
            track_objects: true,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            max_idle_time_secs: DEFAULT_MAX_IDLE_TIME_SECS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
        }
    }
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: DEFAULT_CONNECTION_POOL_SIZE,
            max_idle_time_secs: DEFAULT_CONNECTION_IDLE_SECS,
            ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
        }
    }
}

impl Default for ArrayPoolConfig {
    fn default() -> Self {
        Self {
            buckets: DEFAULT_BUCKETS.to_vec(),
            max_per_bucket: DEFAULT_MAX_PER_BUCKET,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}
