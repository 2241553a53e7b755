pub mod references;

// Re-export reference tracking components
pub use references::{CycleReport, ObjectId, ReferenceEdge, ReferenceGraph};
