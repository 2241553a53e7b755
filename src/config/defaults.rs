/// Default configuration constants for memtune

// Collection scheduler
pub const DEFAULT_MIN_INTERVAL_SECS: f64 = 30.0;
pub const DEFAULT_MEMORY_RATIO: f64 = 0.8;
pub const DEFAULT_ROOTS_THRESHOLD: u64 = 10_000;
pub const DEFAULT_BUFFER_THRESHOLD: u64 = 1_000;
pub const DEFAULT_MAX_GC_TIME_SECS: f64 = 0.5;
pub const DEFAULT_HISTORY_SIZE: usize = 100;

// Threshold adaptation
pub const SLOW_PASS_FACTOR: f64 = 1.2;
pub const INEFFICIENT_ROOTS_FACTOR: f64 = 1.3;
pub const INEFFICIENT_ROOTS_CAP: u64 = 50_000;
pub const INEFFICIENT_INTERVAL_FACTOR: f64 = 1.2;
pub const INEFFICIENT_INTERVAL_CAP_SECS: f64 = 300.0;
/// Per-object pass cost above which a pass counts as inefficient
pub const INEFFICIENT_COST_PER_OBJECT_SECS: f64 = 0.001;
pub const LOW_YIELD_FREED_BYTES: i64 = 1024 * 1024;
pub const LOW_YIELD_MIN_COLLECTED: usize = 100;
pub const LOW_YIELD_ROOTS_FACTOR: f64 = 1.5;
/// Hard ceiling for every multiplicative roots increase
pub const MAX_ROOTS_THRESHOLD: u64 = 1_000_000;
pub const MIN_ROOTS_THRESHOLD: u64 = 1;

pub const ADAPTIVE_WINDOW: usize = 10;
pub const ADAPTIVE_FREQUENT_INTERVAL_SECS: f64 = 60.0;
pub const ADAPTIVE_LOW_YIELD_COLLECTED: f64 = 100.0;
pub const ADAPTIVE_RARE_INTERVAL_SECS: f64 = 300.0;
pub const ADAPTIVE_LONG_PAUSE_SECS: f64 = 0.5;
pub const ADAPTIVE_RAISE_FACTOR: f64 = 1.5;
pub const ADAPTIVE_LOWER_FACTOR: f64 = 0.8;
pub const CRITICAL_MEMORY_RATIO: f64 = 0.9;

// Leak-pattern monitor
pub const LEAK_SAMPLE_INTERVAL_SECS: f64 = 10.0;
pub const LEAK_WINDOW_SECS: f64 = 300.0;
pub const LEAK_MIN_SAMPLES: usize = 10;
/// Growth in bytes per minute treated as a probable leak
pub const LEAK_SLOPE_BYTES_PER_MIN: f64 = 1024.0 * 1024.0;
pub const LEAK_INTERVAL_FACTOR: f64 = 0.8;
pub const LEAK_MIN_INTERVAL_FLOOR_SECS: f64 = 10.0;

pub const REPORT_RECENT_RUNS: usize = 10;

// Memory profiler
pub const DEFAULT_STACK_DEPTH: usize = 5;
pub const DEFAULT_ALLOCATION_THRESHOLD_KB: u64 = 100;
pub const DEFAULT_MAX_SNAPSHOTS: usize = 100;
pub const MEMORY_WATCHDOG_RATIO: f64 = 0.9;
pub const MEMORY_LIMIT_LABEL: &str = "MEMORY_LIMIT_WARNING";
pub const LEAK_GROWTH_BYTES: i64 = 1024 * 1024;
pub const LEAK_CLASS_COUNT_DELTA: i64 = 10;
pub const LEAK_CLASS_BYTES_DELTA: i64 = 100 * 1024;
pub const HIGH_FREQUENCY_RECORDS: usize = 100;
pub const LARGE_CUMULATIVE_BYTES: u64 = 10 * 1024 * 1024;
pub const TOP_ALLOCATIONS: usize = 10;

// Resource pool
pub const DEFAULT_MAX_POOL_SIZE: usize = 100;
pub const DEFAULT_MAX_IDLE_TIME_SECS: u64 = 300;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;

// Connection pool
pub const DEFAULT_CONNECTION_POOL_SIZE: usize = 20;
pub const DEFAULT_CONNECTION_IDLE_SECS: u64 = 600;
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;

// Array and buffer pools
pub const DEFAULT_BUCKETS: &[usize] = &[16, 32, 64, 128, 256, 512, 1024, 2048, 4096];
pub const DEFAULT_MAX_PER_BUCKET: usize = 50;
pub const BUFFER_HANDOFF_FRAGMENTS: usize = 16;
pub const BUFFER_MAX_REUSABLE_BYTES: usize = 1024 * 1024;

// Binary
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const CONFIG_DIR_NAME: &str = "memtune";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const ENV_PREFIX: &str = "MEMTUNE";
