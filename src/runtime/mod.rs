//! Capabilities consumed from the host runtime.
//!
//! The scheduler and the profiler never collect or measure memory themselves.
//! They observe a [`CollectorHandle`] and a [`MemorySource`] supplied by the
//! host and nudge them.

pub mod manual;
pub mod procfs;

pub use manual::{ManualCollector, ManualMemorySource};
pub use procfs::ProcessMemorySource;

use serde::{Deserialize, Serialize};

use crate::errors::{MemtuneError, Result};

/// Collector statistics at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorStatus {
    /// Candidate roots buffered for cycle detection
    pub roots: u64,
    pub buffer_size: u64,
    /// Passes run by the collector since process start
    pub runs: u64,
    /// Objects collected since process start
    pub collected: u64,
    /// The collector's own root threshold
    pub threshold: u64,
}

/// Collection aggressiveness hint forwarded to the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggressiveness {
    High,
    Medium,
    Low,
}

impl Aggressiveness {
    /// Pick a tier from the ratio of used memory to the ceiling
    pub fn for_memory_ratio(ratio: f64) -> Self {
        if ratio > 0.7 {
            Aggressiveness::High
        } else if ratio > 0.5 {
            Aggressiveness::Medium
        } else {
            Aggressiveness::Low
        }
    }

    /// Collection probability as `(probability, divisor)` for runtimes with
    /// probabilistic triggering
    pub fn probability(&self) -> (u32, u32) {
        match self {
            Aggressiveness::High => (100, 100),
            Aggressiveness::Medium => (10, 100),
            Aggressiveness::Low => (1, 1000),
        }
    }
}

/// Handle on the host runtime's cycle collector
pub trait CollectorHandle: Send + Sync {
    fn status(&self) -> CollectorStatus;

    /// Run one collection pass, returning the number of objects collected
    fn collect_cycles(&self) -> Result<usize>;

    fn set_aggressiveness(&self, _tier: Aggressiveness) {}
}

/// Memory usage in bytes, on two measurement bases
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Memory reserved from the system
    pub current: u64,
    pub peak: u64,
    /// Memory actually in use
    pub real: u64,
    pub real_peak: u64,
}

/// OS-level memory information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMemoryInfo {
    pub total: u64,
    pub available: u64,
    pub rss: u64,
    pub peak: u64,
}

/// Current/peak usage and the configured ceiling
pub trait MemorySource: Send + Sync {
    fn usage(&self) -> Result<MemoryUsage>;

    /// `None` means unlimited
    fn ceiling(&self) -> Option<u64>;

    fn system_info(&self) -> Option<SystemMemoryInfo> {
        None
    }

    /// Fraction of the ceiling in use, 0.0 when unlimited or unreadable
    fn memory_ratio(&self) -> f64 {
        match (self.ceiling(), self.usage()) {
            (Some(limit), Ok(usage)) if limit > 0 => usage.current as f64 / limit as f64,
            _ => 0.0,
        }
    }
}

/// Parse a limit such as `512M`, `2g`, `65536` or `-1` (unlimited)
pub fn parse_memory_limit(limit: &str) -> Result<Option<u64>> {
    let limit = limit.trim();
    if limit == "-1" || limit.is_empty() {
        return Ok(None);
    }

    let invalid = || MemtuneError::configuration(format!("Invalid memory limit: '{}'", limit));

    let (digits, multiplier) = match limit.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('g') => (&limit[..limit.len() - 1], 1024 * 1024 * 1024),
        Some('m') => (&limit[..limit.len() - 1], 1024 * 1024),
        Some('k') => (&limit[..limit.len() - 1], 1024),
        _ => (limit, 1),
    };

    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    value.checked_mul(multiplier).map(Some).ok_or_else(invalid)
}
