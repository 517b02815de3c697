//! Core domain models for hive.
//!
//! Tasks, the dependency graph that orders them, and the batch format they
//! are submitted in. Nothing here performs I/O beyond reading a batch file.

pub mod batch;
pub mod dag;
pub mod task;

pub use batch::{SessionOptions, TaskBatch, TaskSpec};
pub use dag::{BatchSummary, FailedTask, TaskGraph};
pub use task::{Task, TaskId, TaskResult, TaskStatus, TaskType};
