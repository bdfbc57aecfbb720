//! Shared data model for pipelines, runs, and task runs.
//!
//! Mirrors the namespace-free hierarchy `pipeline -> run -> task_run` used
//! throughout the scheduler: a [`pipeline::PipelineDefinition`] is read once
//! from disk, a [`run::PipelineRun`] is created per submission, and each of
//! its [`task_run::TaskRun`]s tracks one workload on the cluster.

pub mod pipeline;
pub mod run;
pub mod task_run;

use std::time::{SystemTime, UNIX_EPOCH};

/// Return the current epoch time in milliseconds.
pub fn epoch_milli() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// The literal separator between a run label and a task name when
/// constructing a task run's label. See I2.
pub const LABEL_SEPARATOR: &str = "--";

/// Build a task run's label from its parent run label and task name (I2).
pub fn task_run_label(run_label: &str, task_name: &str) -> String {
    format!("{run_label}{LABEL_SEPARATOR}{task_name}")
}
