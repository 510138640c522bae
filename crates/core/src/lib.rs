//! `docflow-core`: domain building blocks for document-analysis tasks.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! task records and their status machine, queue references, and the
//! document-reference grammar shared by the API and the worker.

pub mod document;
pub mod error;
pub mod id;
pub mod queue;
pub mod task;

pub use document::{DocumentRef, Locator, PENDING_UPLOAD_SENTINEL};
pub use error::{DomainError, DomainResult};
pub use id::{ClaimToken, TaskId};
pub use queue::QueueEntry;
pub use task::{NewTask, Task, TaskOutcome, TaskStatus, error_result};
