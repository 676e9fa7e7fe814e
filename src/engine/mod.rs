//! Execution engine: worker pool, coordinator, resume.

pub mod coordinator;
pub mod pool;
pub mod resume;

pub use coordinator::{ExecutionCoordinator, TaskReport};
pub use pool::{StopToken, WorkerPool};
pub use resume::ResumeManager;
