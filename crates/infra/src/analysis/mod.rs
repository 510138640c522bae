//! Document analysis collaborator.
//!
//! The worker only sees the [`Analyzer`] trait. Upstream failures are split
//! into `Transient` (worth retrying) and `Fatal`; [`RetryingAnalyzer`] applies
//! a [`RetryPolicy`] to the former.

pub mod http;

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::retry::{RetryPolicy, Retryable};

pub use http::HttpChatAnalyzer;

/// Input to one analysis call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisRequest {
    pub text: String,
    pub product: Option<String>,
    pub feature: Option<String>,
}

impl AnalysisRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            product: None,
            feature: None,
        }
    }

    pub fn with_context(mut self, product: Option<String>, feature: Option<String>) -> Self {
        self.product = product;
        self.feature = feature;
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("transient upstream error: {0}")]
    Transient(String),

    #[error("upstream error: {0}")]
    Fatal(String),
}

impl Retryable for AnalysisError {
    fn is_retryable(&self) -> bool {
        matches!(self, AnalysisError::Transient(_))
    }
}

pub trait Analyzer: Send + Sync {
    fn analyze(&self, request: &AnalysisRequest) -> Result<JsonValue, AnalysisError>;
}

impl<A> Analyzer for Arc<A>
where
    A: Analyzer + ?Sized,
{
    fn analyze(&self, request: &AnalysisRequest) -> Result<JsonValue, AnalysisError> {
        (**self).analyze(request)
    }
}

/// Adapts a closure into an [`Analyzer`]. Mostly useful for stubs.
pub struct FnAnalyzer<F>(pub F);

impl<F> Analyzer for FnAnalyzer<F>
where
    F: Fn(&AnalysisRequest) -> Result<JsonValue, AnalysisError> + Send + Sync,
{
    fn analyze(&self, request: &AnalysisRequest) -> Result<JsonValue, AnalysisError> {
        (self.0)(request)
    }
}

/// Runs every `analyze` call through a retry policy.
#[derive(Debug, Clone)]
pub struct RetryingAnalyzer<A> {
    inner: A,
    policy: RetryPolicy,
}

impl<A: Analyzer> RetryingAnalyzer<A> {
    pub fn new(inner: A, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl<A: Analyzer> Analyzer for RetryingAnalyzer<A> {
    fn analyze(&self, request: &AnalysisRequest) -> Result<JsonValue, AnalysisError> {
        self.policy.run(|| self.inner.analyze(request))
    }
}
