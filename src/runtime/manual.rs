use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{Aggressiveness, CollectorHandle, CollectorStatus, MemorySource, MemoryUsage, SystemMemoryInfo};
use crate::clock::ManualClock;
use crate::errors::{MemtuneError, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct MemoryState {
    usage: MemoryUsage,
    ceiling: Option<u64>,
    system: Option<SystemMemoryInfo>,
}

/// Memory source whose readings are set by the host.
///
/// Useful for runtimes that account their own heap, and for simulations.
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ManualMemorySource {
    state: Arc<Mutex<MemoryState>>,
}

impl ManualMemorySource {
    pub fn new(ceiling: Option<u64>) -> Self {
        let source = Self::default();
        lock(&source.state).ceiling = ceiling;
        source
    }

    /// Set both measurement bases to `bytes`, raising peaks as needed
    pub fn set_usage(&self, bytes: u64) {
        let mut state = lock(&self.state);
        state.usage.current = bytes;
        state.usage.real = bytes;
        state.usage.peak = state.usage.peak.max(bytes);
        state.usage.real_peak = state.usage.real_peak.max(bytes);
    }

    pub fn allocate(&self, bytes: u64) {
        let current = lock(&self.state).usage.current;
        self.set_usage(current.saturating_add(bytes));
    }

    pub fn free(&self, bytes: u64) {
        let current = lock(&self.state).usage.current;
        self.set_usage(current.saturating_sub(bytes));
    }

    pub fn set_ceiling(&self, ceiling: Option<u64>) {
        lock(&self.state).ceiling = ceiling;
    }

    pub fn set_system_info(&self, info: SystemMemoryInfo) {
        lock(&self.state).system = Some(info);
    }
}

impl MemorySource for ManualMemorySource {
    fn usage(&self) -> Result<MemoryUsage> {
        Ok(lock(&self.state).usage)
    }

    fn ceiling(&self) -> Option<u64> {
        lock(&self.state).ceiling
    }

    fn system_info(&self) -> Option<SystemMemoryInfo> {
        lock(&self.state).system
    }
}

#[derive(Debug, Default)]
struct CollectorState {
    roots: u64,
    buffer_size: u64,
    runs: u64,
    collected: u64,
    threshold: u64,
    garbage_objects: u64,
    garbage_bytes: u64,
    fail_next: bool,
    aggressiveness: Option<Aggressiveness>,
    pass_duration: Option<(ManualClock, Duration)>,
    memory: Option<ManualMemorySource>,
}

/// Collector driven entirely by the host.
///
/// Garbage is queued with [`ManualCollector::add_garbage`] and released by the
/// next pass. A pass can be made to take simulated time on a `ManualClock` and
/// to free bytes from a linked `ManualMemorySource`.
#[derive(Debug, Clone, Default)]
pub struct ManualCollector {
    state: Arc<Mutex<CollectorState>>,
}

impl ManualCollector {
    pub fn new() -> Self {
        let collector = Self::default();
        lock(&collector.state).threshold = 10_000;
        collector
    }

    pub fn set_roots(&self, roots: u64) {
        lock(&self.state).roots = roots;
    }

    pub fn set_buffer_size(&self, buffer_size: u64) {
        lock(&self.state).buffer_size = buffer_size;
    }

    /// Queue unreachable objects for the next pass; also adds them as roots
    pub fn add_garbage(&self, objects: u64, bytes: u64) {
        let mut state = lock(&self.state);
        state.garbage_objects += objects;
        state.garbage_bytes += bytes;
        state.roots += objects;
    }

    /// Every pass advances `clock` by `duration`
    pub fn set_pass_duration(&self, clock: ManualClock, duration: Duration) {
        lock(&self.state).pass_duration = Some((clock, duration));
    }

    /// Collected bytes are freed from `memory`
    pub fn link_memory(&self, memory: ManualMemorySource) {
        lock(&self.state).memory = Some(memory);
    }

    pub fn fail_next_pass(&self) {
        lock(&self.state).fail_next = true;
    }

    pub fn aggressiveness(&self) -> Option<Aggressiveness> {
        lock(&self.state).aggressiveness
    }
}

impl CollectorHandle for ManualCollector {
    fn status(&self) -> CollectorStatus {
        let state = lock(&self.state);
        CollectorStatus {
            roots: state.roots,
            buffer_size: state.buffer_size,
            runs: state.runs,
            collected: state.collected,
            threshold: state.threshold,
        }
    }

    fn collect_cycles(&self) -> Result<usize> {
        let mut state = lock(&self.state);
        if let Some((clock, duration)) = &state.pass_duration {
            clock.advance(*duration);
        }
        state.runs += 1;

        if state.fail_next {
            state.fail_next = false;
            return Err(MemtuneError::advisory("collection pass aborted"));
        }

        let objects = std::mem::take(&mut state.garbage_objects);
        let bytes = std::mem::take(&mut state.garbage_bytes);
        state.collected += objects;
        state.roots = state.roots.saturating_sub(objects);
        if let Some(memory) = &state.memory {
            memory.free(bytes);
        }

        Ok(objects as usize)
    }

    fn set_aggressiveness(&self, tier: Aggressiveness) {
        lock(&self.state).aggressiveness = Some(tier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_releases_garbage_and_memory() {
        let memory = ManualMemorySource::new(Some(1 << 30));
        memory.set_usage(10 << 20);
        let collector = ManualCollector::new();
        collector.link_memory(memory.clone());
        collector.add_garbage(250, 4 << 20);

        assert_eq!(collector.status().roots, 250);
        assert_eq!(collector.collect_cycles().unwrap(), 250);
        assert_eq!(collector.status().roots, 0);
        assert_eq!(collector.status().collected, 250);
        assert_eq!(memory.usage().unwrap().current, 6 << 20);
        assert_eq!(memory.usage().unwrap().peak, 10 << 20);
    }

    #[test]
    fn test_collector_failure_is_advisory() {
        let collector = ManualCollector::new();
        collector.fail_next_pass();
        let err = collector.collect_cycles().unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Advisory);
        assert!(collector.collect_cycles().is_ok());
    }
}
