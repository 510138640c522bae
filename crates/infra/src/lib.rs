//! Infrastructure layer: task store, work queue, collaborators, and the
//! worker/reaper loops that drive tasks to completion.

pub mod analysis;
pub mod config;
pub mod context;
pub mod documents;
pub mod error;
pub mod queue;
pub mod reaper;
pub mod retry;
pub mod service;
pub mod task_store;
pub mod worker;

mod integration_tests;

pub use context::TaskContext;
pub use error::InfraError;
