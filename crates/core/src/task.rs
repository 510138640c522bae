//! Task record and its status machine.
//!
//! ```text
//!            claim                 finalize
//! pending ──────────► processing ──────────► success | failed
//!    ▲                    │                              │
//!    └──── reclaim ───────┘                              │
//!    └───────────────────── manual retry ────────────────┘
//! ```
//!
//! The transition methods here are the single definition of what each move
//! does to a record. Stores apply them atomically (under a lock, or as one
//! conditional `UPDATE`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::DomainError;
use crate::id::{ClaimToken, TaskId};

/// Task lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Terminal outcome reported by the worker that owns a claim.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Structured analysis result.
    Success(JsonValue),
    /// Human-readable error message.
    Failed(String),
}

impl TaskOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Success(_) => TaskStatus::Success,
            TaskOutcome::Failed(_) => TaskStatus::Failed,
        }
    }

    /// The value stored in `Task::result`.
    pub fn into_result(self) -> JsonValue {
        match self {
            TaskOutcome::Success(value) => value,
            TaskOutcome::Failed(message) => error_result(message),
        }
    }
}

/// Result payload recorded for a failed task.
pub fn error_result(message: impl Into<String>) -> JsonValue {
    serde_json::json!({ "error": message.into() })
}

/// Input for creating a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    /// Inline text, a storage locator, or the pending-upload sentinel.
    pub doc: String,
    pub product: Option<String>,
    pub feature: Option<String>,
}

impl NewTask {
    pub fn new(name: impl Into<String>, doc: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            doc: doc.into(),
            product: None,
            feature: None,
        }
    }

    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }
}

/// A document-analysis task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Display name (not unique).
    pub name: String,
    pub doc: String,
    pub product: Option<String>,
    pub feature: Option<String>,
    pub status: TaskStatus,
    /// Present only once the task reached a terminal status.
    pub result: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    /// Set by claim, kept on terminal statuses, cleared on the way back to pending.
    pub processing_started_at: Option<DateTime<Utc>>,
    /// Number of reaper reclaims. Never decreases.
    pub retry_count: u32,
    #[serde(skip)]
    pub claim_token: Option<ClaimToken>,
}

impl Task {
    /// Create a pending task record.
    pub fn new(id: TaskId, input: NewTask, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: input.name,
            doc: input.doc,
            product: input.product,
            feature: input.feature,
            status: TaskStatus::Pending,
            result: None,
            created_at,
            processing_started_at: None,
            retry_count: 0,
            claim_token: None,
        }
    }

    /// pending → processing. Returns `false` (no change) from any other status.
    pub fn claim(&mut self, now: DateTime<Utc>, token: ClaimToken) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Processing;
        self.processing_started_at = Some(now);
        self.claim_token = Some(token);
        true
    }

    /// processing → success | failed, only for the holder of the current claim.
    pub fn finalize(&mut self, token: ClaimToken, outcome: TaskOutcome) -> bool {
        if self.status != TaskStatus::Processing || self.claim_token != Some(token) {
            return false;
        }
        self.status = outcome.status();
        self.result = Some(outcome.into_result());
        self.claim_token = None;
        true
    }

    /// Whether a processing claim started strictly before `stale_before`.
    pub fn is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Processing
            && self
                .processing_started_at
                .is_some_and(|started| started < stale_before)
    }

    /// processing → pending for an abandoned claim.
    pub fn reclaim(&mut self, stale_before: DateTime<Utc>) -> bool {
        if !self.is_stale(stale_before) {
            return false;
        }
        self.status = TaskStatus::Pending;
        self.processing_started_at = None;
        self.result = None;
        self.claim_token = None;
        self.retry_count += 1;
        true
    }

    /// processing → failed for a claim that exhausted its reclaim budget.
    pub fn abandon(&mut self, stale_before: DateTime<Utc>, message: impl Into<String>) -> bool {
        if !self.is_stale(stale_before) {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.result = Some(error_result(message));
        self.claim_token = None;
        true
    }

    /// pending → failed, undoing a manual retry that never reached the queue.
    pub fn revert_retry(&mut self, message: impl Into<String>) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.result = Some(error_result(message));
        true
    }

    /// failed → pending (operator retry). `retry_count` is left untouched.
    pub fn mark_pending(&mut self) -> Result<(), DomainError> {
        if self.status != TaskStatus::Failed {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: TaskStatus::Pending,
            });
        }
        self.status = TaskStatus::Pending;
        self.result = None;
        self.processing_started_at = None;
        Ok(())
    }
}
