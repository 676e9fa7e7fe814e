//! Task modeling: durable state, status machine, construction.

pub mod descriptor;
pub mod state;

pub use descriptor::TaskDescriptor;
pub use state::{TaskState, TaskStatus, TaskSummary, TaskTarget, TaskType, UnitInfo};
