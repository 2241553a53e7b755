//! Memory snapshots, allocation attribution and leak heuristics.

pub mod callsite;
pub mod hooks;
pub mod snapshot;

pub use callsite::{CallSite, CallSiteCapture, Frame};
pub use hooks::{HookEvent, HookKind, MemoryLimitEvent};
pub use snapshot::{ClassDelta, ClassStats, CollectorDelta, MemoryDelta, Snapshot, SnapshotDiff};

use chrono::Utc;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::Location;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::defaults::*;
use crate::config::ProfilerConfig;
use crate::errors::{MemtuneError, Result};
use crate::memory::CollectionScheduler;
use crate::runtime::{CollectorHandle, MemorySource};
use hooks::HookRegistry;

/// Free-form context attached to an allocation record
pub type AllocationContext = IndexMap<String, serde_json::Value>;

/// One tracked allocation above the size floor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub alloc_type: String,
    pub size: u64,
    pub timestamp: f64,
    pub call_site: CallSite,
    pub context: AllocationContext,
}

/// Registry entry for an object tracked with `track_object`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub class: String,
    pub size: u64,
    pub created_at: f64,
    pub call_site: CallSite,
}

/// Handle returned by `track_object`, used to untrack the object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryGrowth {
    pub amount: i64,
    /// Bytes per second
    pub rate: f64,
}

/// Allocations sharing one call site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationGroup {
    pub location: String,
    pub fingerprint: String,
    pub alloc_type: String,
    pub count: usize,
    pub total_size: u64,
    pub avg_size: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuspiciousAllocations {
    pub high_frequency: Vec<AllocationGroup>,
    pub large_cumulative: Vec<AllocationGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakReport {
    pub memory_growth: Option<MemoryGrowth>,
    pub objects: IndexMap<String, ClassDelta>,
    pub suspicious_allocations: SuspiciousAllocations,
}

impl LeakReport {
    pub fn is_clean(&self) -> bool {
        self.memory_growth.is_none()
            && self.objects.is_empty()
            && self.suspicious_allocations.high_frequency.is_empty()
            && self.suspicious_allocations.large_cumulative.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilerSummary {
    pub current_memory: u64,
    pub peak_memory: u64,
    pub snapshot_count: usize,
    pub tracked_allocations: usize,
    pub tracked_objects: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilerReport {
    pub summary: ProfilerSummary,
    pub snapshots: Vec<Snapshot>,
    /// Between the first and last snapshot; absent without snapshots
    pub leaks: Option<LeakReport>,
    pub top_allocations: Vec<AllocationRecord>,
    pub object_summary: IndexMap<String, ClassStats>,
}

/// Takes snapshots, attributes large allocations to call sites and flags
/// probable leaks.
///
/// Like the scheduler it is driven cooperatively: the host calls
/// [`MemoryProfiler::check_memory_limit`] and
/// [`MemoryProfiler::observe_memory_delta`] on its own cadence.
pub struct MemoryProfiler {
    config: ProfilerConfig,
    memory: Arc<dyn MemorySource>,
    clock: Arc<dyn Clock>,
    collector: Option<Arc<dyn CollectorHandle>>,
    enabled: bool,
    snapshots: VecDeque<Snapshot>,
    allocations: Vec<AllocationRecord>,
    objects: IndexMap<ObjectToken, TrackedObject>,
    next_token: u64,
    hooks: HookRegistry,
    capture: CallSiteCapture,
    module_path: Regex,
    last_observed: Option<u64>,
}

impl MemoryProfiler {
    pub fn new(config: ProfilerConfig, memory: Arc<dyn MemorySource>, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.max_snapshots == 0 {
            return Err(MemtuneError::configuration("max_snapshots must be greater than 0"));
        }
        if config.stack_depth == 0 {
            return Err(MemtuneError::configuration("stack_depth must be greater than 0"));
        }
        memory.usage().map_err(|e| {
            MemtuneError::configuration(format!("Memory introspection unavailable: {}", e))
        })?;

        let module_path = Regex::new(r"\b[a-z_][a-z0-9_]*::")
            .map_err(|e| MemtuneError::configuration(format!("Type name pattern: {}", e)))?;

        Ok(Self {
            capture: CallSiteCapture::new(config.stack_depth)?,
            enabled: config.enabled,
            snapshots: VecDeque::with_capacity(config.max_snapshots),
            config,
            memory,
            clock,
            collector: None,
            allocations: Vec::new(),
            objects: IndexMap::new(),
            next_token: 0,
            hooks: HookRegistry::default(),
            module_path,
            last_observed: None,
        })
    }

    /// Collector used by the memory watchdog when no scheduler is passed in
    pub fn with_collector(mut self, collector: Arc<dyn CollectorHandle>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter()
    }

    pub fn allocations(&self) -> &[AllocationRecord] {
        &self.allocations
    }

    pub fn tracked_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn register_hook(
        &mut self,
        kind: HookKind,
        threshold: u64,
        callback: impl FnMut(&HookEvent) + 'static,
    ) {
        self.hooks.register(kind, threshold, Box::new(callback));
    }

    fn object_census(&self) -> IndexMap<String, ClassStats> {
        snapshot::census(self.objects.values().map(|object| (object.class.as_str(), object.size)))
    }

    /// Capture and retain a snapshot, evicting the oldest beyond `max_snapshots`
    pub fn snapshot(&mut self, label: &str) -> Snapshot {
        let memory = match self.memory.usage() {
            Ok(usage) => usage,
            Err(e) => {
                warn!("Snapshot '{}' without memory figures: {}", label, e);
                Default::default()
            }
        };

        let snapshot = Snapshot {
            label: label.to_string(),
            timestamp: self.clock.now_secs(),
            captured_at: Utc::now(),
            memory,
            objects: self.object_census(),
            collector: self.collector.as_ref().map(|collector| collector.status()),
            system: self.memory.system_info(),
        };

        self.snapshots.push_back(snapshot.clone());
        while self.snapshots.len() > self.config.max_snapshots {
            self.snapshots.pop_front();
        }
        snapshot
    }

    fn snapshot_at(&self, index: usize) -> Result<&Snapshot> {
        self.snapshots.get(index).ok_or(MemtuneError::InvalidIndex {
            index,
            len: self.snapshots.len(),
        })
    }

    pub fn compare_snapshots(&self, first: usize, second: usize) -> Result<SnapshotDiff> {
        let first = self.snapshot_at(first)?;
        let second = self.snapshot_at(second)?;
        Ok(snapshot::compare(first, second))
    }

    /// Leak heuristics between two retained snapshots; `end` defaults to the
    /// latest
    pub fn find_leaks(&self, start: usize, end: Option<usize>) -> Result<LeakReport> {
        let end = end.unwrap_or_else(|| self.snapshots.len().saturating_sub(1));
        let diff = self.compare_snapshots(start, end)?;

        let growth = diff.memory_diff.real;
        let memory_growth = (growth > LEAK_GROWTH_BYTES).then(|| MemoryGrowth {
            amount: growth,
            rate: if diff.time_diff > 0.0 {
                growth as f64 / diff.time_diff
            } else {
                0.0
            },
        });

        let objects = diff
            .object_diff
            .into_iter()
            .filter(|(_, delta)| delta.count > LEAK_CLASS_COUNT_DELTA && delta.memory > LEAK_CLASS_BYTES_DELTA)
            .collect();

        Ok(LeakReport {
            memory_growth,
            objects,
            suspicious_allocations: self.find_suspicious_allocations(),
        })
    }

    /// Group allocation records by call site and flag hot or heavy sites
    pub fn find_suspicious_allocations(&self) -> SuspiciousAllocations {
        let mut groups: IndexMap<String, (usize, u64, &AllocationRecord)> = IndexMap::new();
        for record in &self.allocations {
            let entry = groups
                .entry(record.call_site.fingerprint())
                .or_insert((0, 0, record));
            entry.0 += 1;
            entry.1 += record.size;
        }

        let mut suspicious = SuspiciousAllocations::default();
        for (fingerprint, (count, total_size, first)) in groups {
            let group = || AllocationGroup {
                location: first.call_site.to_string(),
                fingerprint: fingerprint.clone(),
                alloc_type: first.alloc_type.clone(),
                count,
                total_size,
                avg_size: total_size as f64 / count as f64,
            };
            if count > HIGH_FREQUENCY_RECORDS {
                suspicious.high_frequency.push(group());
            }
            if total_size > LARGE_CUMULATIVE_BYTES {
                suspicious.large_cumulative.push(group());
            }
        }
        suspicious
    }

    /// Record an allocation of `size` bytes attributed to the caller.
    ///
    /// Allocations below `threshold_kb` are ignored. Returns true when recorded.
    #[track_caller]
    pub fn track_allocation(&mut self, alloc_type: &str, size: u64, context: AllocationContext) -> bool {
        if !self.accepts(size) {
            return false;
        }
        let call_site = self.capture.capture(Location::caller());
        self.push_allocation(alloc_type, size, call_site, context);
        true
    }

    /// Like `track_allocation` with an explicit call site
    pub fn record_allocation(
        &mut self,
        alloc_type: &str,
        size: u64,
        call_site: CallSite,
        context: AllocationContext,
    ) -> bool {
        if !self.accepts(size) {
            return false;
        }
        self.push_allocation(alloc_type, size, call_site, context);
        true
    }

    fn accepts(&self, size: u64) -> bool {
        self.enabled && self.config.track_allocations && size >= self.config.threshold_bytes()
    }

    fn push_allocation(&mut self, alloc_type: &str, size: u64, call_site: CallSite, context: AllocationContext) {
        let record = AllocationRecord {
            alloc_type: alloc_type.to_string(),
            size,
            timestamp: self.clock.now_secs(),
            call_site,
            context,
        };
        let fired = self.hooks.fire_allocation(&record);
        debug!(
            "Tracked {} allocation of {} bytes at {} ({} hooks)",
            record.alloc_type, record.size, record.call_site, fired
        );
        self.allocations.push(record);
    }

    /// Register a live object of type `T` for the class census
    #[track_caller]
    pub fn track_object<T: ?Sized>(&mut self, size: u64) -> Option<ObjectToken> {
        let class = self.module_path.replace_all(std::any::type_name::<T>(), "").into_owned();
        self.track_object_at(class, size, Location::caller())
    }

    /// Register a live object under an explicit class name
    #[track_caller]
    pub fn track_object_as(&mut self, class: &str, size: u64) -> Option<ObjectToken> {
        self.track_object_at(class.to_string(), size, Location::caller())
    }

    fn track_object_at(
        &mut self,
        class: String,
        size: u64,
        caller: &'static Location<'static>,
    ) -> Option<ObjectToken> {
        if !self.enabled || !self.config.track_objects {
            return None;
        }

        // Only objects that also become allocation records pay for a stack walk
        let recorded = self.accepts(size);
        let call_site = if recorded {
            self.capture.capture(caller)
        } else {
            CallSite::from_location(caller)
        };
        self.next_token += 1;
        let token = ObjectToken(self.next_token);
        self.objects.insert(
            token,
            TrackedObject {
                class: class.clone(),
                size,
                created_at: self.clock.now_secs(),
                call_site: call_site.clone(),
            },
        );

        if recorded {
            let mut context = AllocationContext::new();
            context.insert("class".to_string(), serde_json::Value::String(class));
            self.push_allocation("object", size, call_site, context);
        }
        Some(token)
    }

    /// Remove an object from the census; false if it was not tracked
    pub fn release_object(&mut self, token: ObjectToken) -> bool {
        self.objects.shift_remove(&token).is_some()
    }

    /// Record growth since the previous observation as a `tick` allocation.
    ///
    /// The first call only sets the baseline. Returns the recorded growth.
    pub fn observe_memory_delta(&mut self) -> Option<u64> {
        if !self.enabled || !self.config.track_allocations {
            return None;
        }
        let current = self.memory.usage().ok()?.current;
        let previous = self.last_observed.replace(current)?;
        let growth = current.checked_sub(previous)?;
        if growth <= self.config.threshold_bytes() {
            return None;
        }

        let mut context = AllocationContext::new();
        context.insert("memory_before".to_string(), previous.into());
        context.insert("memory_after".to_string(), current.into());
        self.push_allocation("tick", growth, CallSite::default(), context);
        Some(growth)
    }

    /// Memory-ceiling watchdog.
    ///
    /// Above 90% of the ceiling: takes a `MEMORY_LIMIT_WARNING` snapshot, forces
    /// a collection through `scheduler` (or the profiler's own collector) and
    /// fires `memory_limit` hooks. Returns true when the watchdog fired.
    pub fn check_memory_limit(&mut self, scheduler: Option<&mut CollectionScheduler>) -> bool {
        let Some(ceiling) = self.memory.ceiling() else {
            return false;
        };
        let Ok(usage) = self.memory.usage() else {
            return false;
        };
        if (usage.current as f64) <= ceiling as f64 * MEMORY_WATCHDOG_RATIO {
            return false;
        }

        warn!(
            "Memory at {} of {} bytes, above {:.0}% of the ceiling",
            usage.current,
            ceiling,
            MEMORY_WATCHDOG_RATIO * 100.0
        );
        self.snapshot(MEMORY_LIMIT_LABEL);

        match scheduler {
            Some(scheduler) => {
                let outcome = scheduler.force_collect();
                debug!("Emergency collection freed {} objects", outcome.collected);
            }
            None => {
                if let Some(collector) = &self.collector {
                    if let Err(e) = collector.collect_cycles() {
                        warn!("Emergency collection failed: {}", e);
                    }
                }
            }
        }

        let after = self.memory.usage().unwrap_or(usage);
        self.hooks.fire_memory_limit(MemoryLimitEvent {
            current: after.current,
            peak: after.peak,
            ceiling,
        });
        true
    }

    pub fn clear_allocations(&mut self) {
        self.allocations.clear();
    }

    /// Largest tracked allocations first
    pub fn top_allocations(&self, limit: usize) -> Vec<AllocationRecord> {
        let mut sorted: Vec<&AllocationRecord> = self.allocations.iter().collect();
        sorted.sort_by(|a, b| b.size.cmp(&a.size));
        sorted.into_iter().take(limit).cloned().collect()
    }

    pub fn generate_report(&self) -> ProfilerReport {
        let usage = self.memory.usage().unwrap_or_default();
        let leaks = if self.snapshots.is_empty() {
            None
        } else {
            self.find_leaks(0, None).ok()
        };

        ProfilerReport {
            summary: ProfilerSummary {
                current_memory: usage.current,
                peak_memory: usage.peak,
                snapshot_count: self.snapshots.len(),
                tracked_allocations: self.allocations.len(),
                tracked_objects: self.objects.len(),
            },
            snapshots: self.snapshots.iter().cloned().collect(),
            leaks,
            top_allocations: self.top_allocations(TOP_ALLOCATIONS),
            object_summary: self.object_census(),
        }
    }

    /// Allocation counts per type, for quick diagnostics
    pub fn allocation_counts(&self) -> HashMap<&str, usize> {
        let mut counts = HashMap::new();
        for record in &self.allocations {
            *counts.entry(record.alloc_type.as_str()).or_insert(0) += 1;
        }
        counts
    }
}
