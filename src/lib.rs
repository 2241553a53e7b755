pub mod clock;
pub mod config;
pub mod errors;
pub mod graph;
pub mod memory;
pub mod pool;
pub mod profiler;
pub mod runtime;

// Re-export commonly used types
pub use crate::clock::{system_clock, Clock, ManualClock, SystemClock};
pub use crate::config::MemtuneConfig;
pub use crate::errors::{ErrorKind, MemtuneError, Result};
pub use crate::graph::{CycleReport, ObjectId, ReferenceGraph};
pub use crate::memory::{slope, CollectionOutcome, CollectionRun, CollectionScheduler, Thresholds, WorkloadType};
pub use crate::pool::{
    BucketArrayPool, Checkout, ConnectionPool, PoolEntryId, PoolOptions, PoolStats, Poolable, PooledBuffer,
    ResourcePool,
};
pub use crate::profiler::{HookEvent, HookKind, MemoryProfiler, Snapshot};
pub use crate::runtime::{CollectorHandle, MemorySource, ProcessMemorySource};
