use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::trend;
use crate::clock::Clock;
use crate::config::defaults::*;
use crate::config::SchedulerConfig;
use crate::errors::{MemtuneError, Result};
use crate::runtime::{Aggressiveness, CollectorHandle, CollectorStatus, MemorySource};

/// Tuning state of one scheduler
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub roots_threshold: u64,
    pub buffer_threshold: u64,
    pub min_interval: Duration,
    pub memory_ratio: f64,
}

impl From<&SchedulerConfig> for Thresholds {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            roots_threshold: config.roots_threshold,
            buffer_threshold: config.buffer_threshold,
            min_interval: config.min_interval(),
            memory_ratio: config.memory_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    ShouldCollect,
    Collecting,
}

/// One completed collection pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRun {
    /// Clock time in seconds when the pass finished
    pub timestamp: f64,
    pub collected: usize,
    pub duration: Duration,
    /// Bytes released by the pass; negative when usage grew meanwhile
    pub memory_freed: i64,
    pub roots_before: u64,
    pub roots_after: u64,
    pub forced: bool,
}

/// Result of a `collect` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionOutcome {
    pub skipped: bool,
    pub collected: usize,
    pub duration: Duration,
    pub memory_freed: i64,
    /// Seconds per collected object, 0.0 when nothing was collected
    pub efficiency: f64,
}

impl CollectionOutcome {
    fn skipped() -> Self {
        Self {
            skipped: true,
            collected: 0,
            duration: Duration::ZERO,
            memory_freed: 0,
            efficiency: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub runs: u64,
    pub collected: u64,
    pub total_time: Duration,
    pub forced: u64,
    pub scheduled: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryFigures {
    pub current: u64,
    pub peak: u64,
    /// `None` when unlimited
    pub ceiling: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerReport {
    pub enabled: bool,
    pub state: SchedulerState,
    pub metrics: SchedulerMetrics,
    pub collector_status: Option<CollectorStatus>,
    pub thresholds: Thresholds,
    /// Objects collected per run
    pub efficiency: f64,
    pub avg_gc_time: Duration,
    pub memory: Option<MemoryFigures>,
    pub recent_history: Vec<CollectionRun>,
    pub aggressiveness: Option<Aggressiveness>,
    /// Last memory growth estimate from the leak monitor, bytes per minute
    pub memory_trend: f64,
}

/// Named threshold presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadType {
    WebRequest,
    BatchProcessing,
    LongRunning,
    MemoryIntensive,
    Default,
}

impl FromStr for WorkloadType {
    type Err = MemtuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "web_request" => Ok(WorkloadType::WebRequest),
            "batch_processing" => Ok(WorkloadType::BatchProcessing),
            "long_running" => Ok(WorkloadType::LongRunning),
            "memory_intensive" => Ok(WorkloadType::MemoryIntensive),
            "default" => Ok(WorkloadType::Default),
            other => Err(MemtuneError::configuration(format!("Unknown workload type: '{}'", other))),
        }
    }
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkloadType::WebRequest => "web_request",
            WorkloadType::BatchProcessing => "batch_processing",
            WorkloadType::LongRunning => "long_running",
            WorkloadType::MemoryIntensive => "memory_intensive",
            WorkloadType::Default => "default",
        };
        f.write_str(name)
    }
}

/// Rolling memory samples used to spot sustained growth
#[derive(Debug, Default)]
struct LeakMonitor {
    samples: VecDeque<(f64, f64)>,
    last_sample: Option<f64>,
    last_trend: f64,
}

/// Decides when to force a collection pass and adapts its own thresholds
/// from observed pass cost and yield.
///
/// The host calls [`CollectionScheduler::tick`] on a timer. Without a
/// collector handle every collection is skipped.
pub struct CollectionScheduler {
    config: SchedulerConfig,
    thresholds: Thresholds,
    state: SchedulerState,
    enabled: bool,
    collector: Option<Arc<dyn CollectorHandle>>,
    memory: Arc<dyn MemorySource>,
    clock: Arc<dyn Clock>,
    last_run: Option<Duration>,
    history: VecDeque<CollectionRun>,
    metrics: SchedulerMetrics,
    aggressiveness: Option<Aggressiveness>,
    leak_monitor: LeakMonitor,
    adapted_at_run: u64,
}

fn scale(value: u64, factor: f64) -> u64 {
    ((value as f64 * factor) as u64).clamp(MIN_ROOTS_THRESHOLD, MAX_ROOTS_THRESHOLD)
}

impl CollectionScheduler {
    pub fn new(
        config: SchedulerConfig,
        memory: Arc<dyn MemorySource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.history_size == 0 {
            return Err(MemtuneError::configuration("history_size must be greater than 0"));
        }
        if config.roots_threshold == 0 || config.buffer_threshold == 0 {
            return Err(MemtuneError::configuration("Collection thresholds must be greater than 0"));
        }

        Ok(Self {
            thresholds: Thresholds::from(&config),
            enabled: config.enabled,
            history: VecDeque::with_capacity(config.history_size),
            config,
            state: SchedulerState::Idle,
            collector: None,
            memory,
            clock,
            last_run: None,
            metrics: SchedulerMetrics::default(),
            aggressiveness: None,
            leak_monitor: LeakMonitor::default(),
            adapted_at_run: 0,
        })
    }

    pub fn with_collector(mut self, collector: Arc<dyn CollectorHandle>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn enable(&mut self) {
        if self.enabled {
            return;
        }
        self.enabled = true;
        if self.config.auto_optimize {
            self.optimize_gc_settings();
        }
        info!("Collection scheduler enabled");
    }

    pub fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        self.enabled = false;
        self.state = SchedulerState::Idle;
        info!("Collection scheduler disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    /// Completed runs, oldest first
    pub fn history(&self) -> impl Iterator<Item = &CollectionRun> {
        self.history.iter()
    }

    /// Evaluate the trigger rule and move between Idle and ShouldCollect
    pub fn should_collect(&mut self) -> bool {
        if self.state == SchedulerState::Collecting {
            return false;
        }

        let tripped = self.thresholds_tripped();
        self.state = if tripped {
            SchedulerState::ShouldCollect
        } else {
            SchedulerState::Idle
        };
        tripped
    }

    fn thresholds_tripped(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(collector) = &self.collector else {
            return false;
        };

        if let Some(last) = self.last_run {
            if self.clock.now().saturating_sub(last) < self.thresholds.min_interval {
                return false;
            }
        }

        let status = collector.status();
        if status.roots >= self.thresholds.roots_threshold {
            return true;
        }
        if self.memory.memory_ratio() >= self.thresholds.memory_ratio {
            return true;
        }
        status.buffer_size >= self.thresholds.buffer_threshold
    }

    /// Run a pass when forced or when the thresholds are tripped
    pub fn collect(&mut self, force: bool) -> CollectionOutcome {
        if self.state == SchedulerState::Collecting {
            return CollectionOutcome::skipped();
        }

        if (!force && !self.should_collect()) || self.collector.is_none() {
            self.metrics.skipped += 1;
            return CollectionOutcome::skipped();
        }

        self.run_collection(force)
    }

    pub fn force_collect(&mut self) -> CollectionOutcome {
        self.collect(true)
    }

    fn run_collection(&mut self, forced: bool) -> CollectionOutcome {
        let Some(collector) = self.collector.clone() else {
            return CollectionOutcome::skipped();
        };

        self.state = SchedulerState::Collecting;

        let start = self.clock.now();
        let memory_before = self.memory.usage().ok().map(|usage| usage.current);
        let roots_before = collector.status().roots;

        let collected = match collector.collect_cycles() {
            Ok(collected) => collected,
            Err(e) => {
                warn!("Collection pass failed, recording an empty run: {}", e);
                0
            }
        };

        let finished = self.clock.now();
        let duration = finished.saturating_sub(start);
        let memory_after = self.memory.usage().ok().map(|usage| usage.current);
        let memory_freed = match (memory_before, memory_after) {
            (Some(before), Some(after)) => before as i64 - after as i64,
            _ => 0,
        };
        let roots_after = collector.status().roots;

        self.metrics.runs += 1;
        self.metrics.collected += collected as u64;
        self.metrics.total_time += duration;
        if forced {
            self.metrics.forced += 1;
        } else {
            self.metrics.scheduled += 1;
        }
        self.last_run = Some(finished);

        self.record_run(CollectionRun {
            timestamp: finished.as_secs_f64(),
            collected,
            duration,
            memory_freed,
            roots_before,
            roots_after,
            forced,
        });

        if self.config.profile_gc {
            self.analyze_gc_performance(duration, collected, memory_freed);
        }

        self.state = SchedulerState::Idle;

        debug!(
            "Collection pass: {} objects in {:?}, {} bytes freed (forced: {})",
            collected, duration, memory_freed, forced
        );

        CollectionOutcome {
            skipped: false,
            collected,
            duration,
            memory_freed,
            efficiency: efficiency(duration, collected),
        }
    }

    fn record_run(&mut self, run: CollectionRun) {
        self.history.push_back(run);
        while self.history.len() > self.config.history_size {
            self.history.pop_front();
        }
    }

    /// Raise thresholds after slow, costly or low-yield passes
    pub fn analyze_gc_performance(&mut self, duration: Duration, collected: usize, memory_freed: i64) {
        let before = self.thresholds;

        if duration > self.config.max_gc_time() {
            self.thresholds.roots_threshold = scale(self.thresholds.roots_threshold, SLOW_PASS_FACTOR)
                .max(self.thresholds.roots_threshold);
            self.thresholds.buffer_threshold = scale(self.thresholds.buffer_threshold, SLOW_PASS_FACTOR)
                .max(self.thresholds.buffer_threshold);
        }

        if efficiency(duration, collected) > INEFFICIENT_COST_PER_OBJECT_SECS {
            self.adjust_for_inefficiency();
        }

        if memory_freed < LOW_YIELD_FREED_BYTES && collected > LOW_YIELD_MIN_COLLECTED {
            self.thresholds.roots_threshold = scale(self.thresholds.roots_threshold, LOW_YIELD_ROOTS_FACTOR)
                .max(self.thresholds.roots_threshold);
        }

        if self.thresholds != before {
            debug!(
                "Thresholds raised after pass: roots {} -> {}, buffer {} -> {}, interval {:?} -> {:?}",
                before.roots_threshold,
                self.thresholds.roots_threshold,
                before.buffer_threshold,
                self.thresholds.buffer_threshold,
                before.min_interval,
                self.thresholds.min_interval
            );
        }
    }

    fn adjust_for_inefficiency(&mut self) {
        let roots = self.thresholds.roots_threshold;
        let raised = ((roots as f64 * INEFFICIENT_ROOTS_FACTOR) as u64).min(INEFFICIENT_ROOTS_CAP);
        self.thresholds.roots_threshold = roots.max(raised);

        let interval = self.thresholds.min_interval;
        let raised = Duration::from_secs_f64(
            (interval.as_secs_f64() * INEFFICIENT_INTERVAL_FACTOR).min(INEFFICIENT_INTERVAL_CAP_SECS),
        );
        self.thresholds.min_interval = interval.max(raised);
    }

    /// Pick an aggressiveness tier from memory pressure and forward it to the
    /// collector, adapting thresholds first when enabled
    pub fn optimize_gc_settings(&mut self) {
        if self.config.adaptive_scheduling {
            self.adaptive_threshold_adjustment();
        }

        let tier = Aggressiveness::for_memory_ratio(self.memory.memory_ratio());
        if self.aggressiveness != Some(tier) {
            debug!("Collector aggressiveness set to {:?}", tier);
        }
        self.aggressiveness = Some(tier);
        if let Some(collector) = &self.collector {
            collector.set_aggressiveness(tier);
        }
    }

    /// Re-tune thresholds from the last runs. Applied once per new run.
    fn adaptive_threshold_adjustment(&mut self) {
        if self.history.len() < ADAPTIVE_WINDOW || self.adapted_at_run == self.metrics.runs {
            return;
        }
        self.adapted_at_run = self.metrics.runs;

        let recent: Vec<&CollectionRun> = self.history.iter().rev().take(ADAPTIVE_WINDOW).rev().collect();
        let count = recent.len() as f64;
        let avg_interval = recent
            .windows(2)
            .map(|pair| pair[1].timestamp - pair[0].timestamp)
            .sum::<f64>()
            / (count - 1.0);
        let avg_collected = recent.iter().map(|run| run.collected as f64).sum::<f64>() / count;
        let avg_duration = recent.iter().map(|run| run.duration.as_secs_f64()).sum::<f64>() / count;

        if avg_interval < ADAPTIVE_FREQUENT_INTERVAL_SECS && avg_collected < ADAPTIVE_LOW_YIELD_COLLECTED {
            self.thresholds.roots_threshold = scale(self.thresholds.roots_threshold, ADAPTIVE_RAISE_FACTOR);
            self.thresholds.buffer_threshold = scale(self.thresholds.buffer_threshold, ADAPTIVE_RAISE_FACTOR);
            debug!("Frequent low-yield passes, roots threshold now {}", self.thresholds.roots_threshold);
        } else if avg_interval > ADAPTIVE_RARE_INTERVAL_SECS && avg_duration > ADAPTIVE_LONG_PAUSE_SECS {
            self.thresholds.roots_threshold = scale(self.thresholds.roots_threshold, ADAPTIVE_LOWER_FACTOR);
            self.thresholds.buffer_threshold = scale(self.thresholds.buffer_threshold, ADAPTIVE_LOWER_FACTOR);
            debug!("Rare long passes, roots threshold now {}", self.thresholds.roots_threshold);
        }

        if self.memory.memory_ratio() > CRITICAL_MEMORY_RATIO {
            self.thresholds.roots_threshold = (self.thresholds.roots_threshold / 2).max(MIN_ROOTS_THRESHOLD);
            warn!(
                "Memory pressure above {:.0}%, roots threshold halved to {}",
                CRITICAL_MEMORY_RATIO * 100.0,
                self.thresholds.roots_threshold
            );
        }
    }

    /// Sample memory usage and bias toward more frequent passes when it keeps
    /// growing. Returns true when a leak pattern was detected.
    pub fn check_memory_patterns(&mut self) -> bool {
        let now = self.clock.now_secs();
        if let Some(last) = self.leak_monitor.last_sample {
            if now - last < LEAK_SAMPLE_INTERVAL_SECS {
                return false;
            }
        }

        let usage = match self.memory.usage() {
            Ok(usage) => usage,
            Err(e) => {
                debug!("Skipping memory sample: {}", e);
                return false;
            }
        };
        self.leak_monitor.last_sample = Some(now);
        self.leak_monitor.samples.push_back((now, usage.current as f64));

        let cutoff = now - LEAK_WINDOW_SECS;
        while self.leak_monitor.samples.front().is_some_and(|&(time, _)| time <= cutoff) {
            self.leak_monitor.samples.pop_front();
        }

        if self.leak_monitor.samples.len() < LEAK_MIN_SAMPLES {
            return false;
        }

        let samples: Vec<(f64, f64)> = self.leak_monitor.samples.iter().copied().collect();
        let growth = trend::slope(&samples);
        self.leak_monitor.last_trend = growth;

        if growth <= LEAK_SLOPE_BYTES_PER_MIN {
            return false;
        }

        self.thresholds.roots_threshold = (self.thresholds.roots_threshold / 2).max(MIN_ROOTS_THRESHOLD);
        let interval = self.thresholds.min_interval;
        let reduced = Duration::from_secs_f64(
            (interval.as_secs_f64() * LEAK_INTERVAL_FACTOR).max(LEAK_MIN_INTERVAL_FLOOR_SECS),
        );
        self.thresholds.min_interval = interval.min(reduced);

        warn!(
            "Memory growing at {:.0} bytes/min, roots threshold {} and min interval {:?}",
            growth, self.thresholds.roots_threshold, self.thresholds.min_interval
        );
        true
    }

    /// Cooperative entry point: sample memory, re-tune, and collect if due
    pub fn tick(&mut self) -> Option<CollectionOutcome> {
        if !self.enabled {
            return None;
        }

        if self.config.enable_monitoring {
            self.check_memory_patterns();
        }
        if self.config.auto_optimize {
            self.optimize_gc_settings();
        }

        if self.should_collect() {
            Some(self.run_collection(false))
        } else {
            None
        }
    }

    /// Apply a named threshold preset
    pub fn optimize_for(&mut self, workload: WorkloadType) {
        match workload {
            WorkloadType::WebRequest => {
                self.thresholds.roots_threshold = 1_000;
                self.thresholds.min_interval = Duration::from_secs(5);
            }
            WorkloadType::BatchProcessing => {
                self.thresholds.roots_threshold = 10_000;
                self.thresholds.min_interval = Duration::from_secs(60);
            }
            WorkloadType::LongRunning => {
                self.config.adaptive_scheduling = true;
                self.thresholds.roots_threshold = 5_000;
            }
            WorkloadType::MemoryIntensive => {
                self.thresholds.roots_threshold = 500;
                self.thresholds.min_interval = Duration::from_secs(10);
                self.thresholds.memory_ratio = 0.6;
            }
            WorkloadType::Default => {
                self.thresholds = Thresholds::from(&self.config);
            }
        }
        info!("Collection thresholds tuned for {} workload", workload);
    }

    pub fn report(&self) -> SchedulerReport {
        let runs = self.metrics.runs;
        let memory = self.memory.usage().ok().map(|usage| MemoryFigures {
            current: usage.current,
            peak: usage.peak,
            ceiling: self.memory.ceiling(),
        });

        SchedulerReport {
            enabled: self.enabled,
            state: self.state,
            metrics: self.metrics.clone(),
            collector_status: self.collector.as_ref().map(|collector| collector.status()),
            thresholds: self.thresholds,
            efficiency: if runs > 0 {
                self.metrics.collected as f64 / runs as f64
            } else {
                0.0
            },
            avg_gc_time: if runs > 0 {
                Duration::from_secs_f64(self.metrics.total_time.as_secs_f64() / runs as f64)
            } else {
                Duration::ZERO
            },
            memory,
            recent_history: self
                .history
                .iter()
                .skip(self.history.len().saturating_sub(REPORT_RECENT_RUNS))
                .cloned()
                .collect(),
            aggressiveness: self.aggressiveness,
            memory_trend: self.leak_monitor.last_trend,
        }
    }
}

/// Seconds per collected object, 0.0 when nothing was collected
fn efficiency(duration: Duration, collected: usize) -> f64 {
    if collected == 0 {
        0.0
    } else {
        duration.as_secs_f64() / collected as f64
    }
}
