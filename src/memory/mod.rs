pub mod scheduler;
pub mod trend;

// Re-export the main collection scheduling components
pub use scheduler::{
    CollectionOutcome,
    CollectionRun,
    CollectionScheduler,
    MemoryFigures,
    SchedulerMetrics,
    SchedulerReport,
    SchedulerState,
    Thresholds,
    WorkloadType,
};
pub use trend::slope;
