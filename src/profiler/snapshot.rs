use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::runtime::{CollectorStatus, MemoryUsage, SystemMemoryInfo};

/// Live objects of one class
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassStats {
    pub count: u64,
    pub memory: u64,
    pub avg_size: f64,
}

/// Point-in-time memory sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub label: String,
    /// Clock time in seconds
    pub timestamp: f64,
    pub captured_at: DateTime<Utc>,
    pub memory: MemoryUsage,
    pub objects: IndexMap<String, ClassStats>,
    pub collector: Option<CollectorStatus>,
    pub system: Option<SystemMemoryInfo>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryDelta {
    pub current: i64,
    pub peak: i64,
    pub real: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDelta {
    pub count: i64,
    pub memory: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorDelta {
    pub runs: i64,
    pub collected: i64,
}

/// Difference between two snapshots, later minus earlier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub time_diff: f64,
    pub memory_diff: MemoryDelta,
    /// Only classes whose count or memory changed
    pub object_diff: IndexMap<String, ClassDelta>,
    pub gc_diff: CollectorDelta,
}

fn delta(before: u64, after: u64) -> i64 {
    after as i64 - before as i64
}

/// Aggregate `(class, size)` pairs into a per-class census
pub fn census<'a>(objects: impl IntoIterator<Item = (&'a str, u64)>) -> IndexMap<String, ClassStats> {
    let mut stats: IndexMap<String, ClassStats> = IndexMap::new();
    for (class, size) in objects {
        let entry = stats.entry(class.to_string()).or_default();
        entry.count += 1;
        entry.memory += size;
    }
    for entry in stats.values_mut() {
        entry.avg_size = if entry.count > 0 {
            entry.memory as f64 / entry.count as f64
        } else {
            0.0
        };
    }
    stats
}

pub fn compare(first: &Snapshot, second: &Snapshot) -> SnapshotDiff {
    let mut object_diff = IndexMap::new();
    let classes = first.objects.keys().chain(second.objects.keys().filter(|class| !first.objects.contains_key(*class)));
    for class in classes {
        let before = first.objects.get(class).copied().unwrap_or_default();
        let after = second.objects.get(class).copied().unwrap_or_default();
        if before.count != after.count || before.memory != after.memory {
            object_diff.insert(
                class.clone(),
                ClassDelta {
                    count: delta(before.count, after.count),
                    memory: delta(before.memory, after.memory),
                },
            );
        }
    }

    let runs = |snapshot: &Snapshot| snapshot.collector.map(|status| status.runs).unwrap_or(0);
    let collected = |snapshot: &Snapshot| snapshot.collector.map(|status| status.collected).unwrap_or(0);

    SnapshotDiff {
        time_diff: second.timestamp - first.timestamp,
        memory_diff: MemoryDelta {
            current: delta(first.memory.current, second.memory.current),
            peak: delta(first.memory.peak, second.memory.peak),
            real: delta(first.memory.real, second.memory.real),
        },
        object_diff,
        gc_diff: CollectorDelta {
            runs: delta(runs(first), runs(second)),
            collected: delta(collected(first), collected(second)),
        },
    }
}
