use serde::{Deserialize, Serialize};
use std::fmt;

use super::AllocationRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    /// Fired for tracked allocations at or above the hook's threshold
    Allocation,
    /// Fired when usage approaches the memory ceiling
    MemoryLimit,
}

/// Figures passed to `memory_limit` hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimitEvent {
    pub current: u64,
    pub peak: u64,
    pub ceiling: u64,
}

/// Plain data handed to hook callbacks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum HookEvent {
    Allocation(AllocationRecord),
    MemoryLimit(MemoryLimitEvent),
}

struct Hook {
    kind: HookKind,
    threshold: u64,
    callback: Box<dyn FnMut(&HookEvent)>,
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<Hook>,
}

impl HookRegistry {
    pub fn register(&mut self, kind: HookKind, threshold: u64, callback: Box<dyn FnMut(&HookEvent)>) {
        self.hooks.push(Hook {
            kind,
            threshold,
            callback,
        });
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Returns the number of hooks fired
    pub fn fire_allocation(&mut self, record: &AllocationRecord) -> usize {
        let mut event = None;
        let mut fired = 0;
        for hook in &mut self.hooks {
            if hook.kind == HookKind::Allocation && record.size >= hook.threshold {
                let event = event.get_or_insert_with(|| HookEvent::Allocation(record.clone()));
                (hook.callback)(event);
                fired += 1;
            }
        }
        fired
    }

    pub fn fire_memory_limit(&mut self, limit: MemoryLimitEvent) -> usize {
        let event = HookEvent::MemoryLimit(limit);
        let mut fired = 0;
        for hook in &mut self.hooks {
            if hook.kind == HookKind::MemoryLimit {
                (hook.callback)(&event);
                fired += 1;
            }
        }
        fired
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry").field("hooks", &self.hooks.len()).finish()
    }
}
