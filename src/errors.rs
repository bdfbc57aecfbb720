//! The submission-time error taxonomy. Each variant documents its own
//! recovery rule; callers match on kind rather than string contents.

use thiserror::Error;

/// Errors that can prevent a submission from ever producing a
/// [`crate::models::run::PipelineRun`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubmissionError {
    /// Bad descriptor; surfaced to the caller, no run created.
    #[error("invalid pipeline descriptor: {0}")]
    Validation(String),

    /// A task cycle was detected at DAG-build time; no run created.
    #[error("cycle detected involving task '{0}'")]
    CycleDetected(String),

    /// A `depends` reference did not resolve to a declared task; no run
    /// created.
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("pipeline '{0}' not found under pipelines root")]
    PipelineNotFound(String),
}
