//! [`PipelineRun`]: the record created when a pipeline is launched.

use super::epoch_milli;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Terminal/non-terminal status of a pipeline run.
#[derive(Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Submitted,
    Running,
    Done,
    Terminated,
    Failed,
}

/// One running (or completed) instance of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineRun {
    /// Globally unique identifier, of the form `flow-[a-z0-9]+`.
    pub label: String,
    /// Name of the pipeline this run was launched from.
    pub job: String,
    /// Opaque source-control revision the pipeline was launched at, if known.
    pub version: Option<String>,
    /// Label of the run that spawned this one, if any.
    pub parent: Option<String>,
    pub waiting: Vec<String>,
    pub executing: Vec<String>,
    pub executed: Vec<String>,
    pub errored: Vec<String>,
    pub terminated: Vec<String>,
    pub status: Status,
    pub submit_time: u64,
    pub completion_time: Option<u64>,
    pub error_message: Option<String>,
    /// Labels of every child task run, in declaration order.
    pub task_labels: Vec<String>,
    /// The on-disk workspace directory assigned to this run, bound to
    /// `${RUN_PATH}` for every task's template expansion. Purged by
    /// `CLEANUP ... fs`.
    pub run_path: String,
}

impl PipelineRun {
    pub fn new(
        label: String,
        job: &str,
        version: Option<String>,
        parent: Option<String>,
        run_path: String,
    ) -> Self {
        Self {
            label,
            job: job.to_string(),
            version,
            parent,
            waiting: Vec::new(),
            executing: Vec::new(),
            executed: Vec::new(),
            errored: Vec::new(),
            terminated: Vec::new(),
            status: Status::Submitted,
            submit_time: epoch_milli(),
            completion_time: None,
            error_message: None,
            task_labels: Vec::new(),
            run_path,
        }
    }

    /// True once every task label has reached a terminal bucket (I4's
    /// completion condition, checked independent of which terminal status).
    pub fn is_complete(&self) -> bool {
        self.waiting.is_empty() && self.executing.is_empty()
    }

    /// Aggregate terminal status per I4. Only meaningful once
    /// [`Self::is_complete`] holds.
    pub fn aggregate_status(&self) -> Status {
        if !self.terminated.is_empty() && self.errored.is_empty() {
            return Status::Terminated;
        }
        if !self.errored.is_empty() {
            return Status::Failed;
        }
        Status::Done
    }
}

/// Generates a globally unique run label of the form `flow-xxxxxxxxxxxx`.
pub fn new_label() -> String {
    const ALPHABET: [char; 36] = [
        '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h',
        'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
    ];
    format!("flow-{}", nanoid::nanoid!(12, &ALPHABET))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_matches_expected_shape() {
        let label = new_label();
        assert!(label.starts_with("flow-"));
        assert!(label[5..]
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn aggregate_status_done_when_all_executed() {
        let mut run = PipelineRun::new(new_label(), "sst2", None, None, "/data/odin/test".to_string());
        run.task_labels = vec!["t1".into()];
        run.executed = vec!["t1".into()];
        assert!(run.is_complete());
        assert_eq!(run.aggregate_status(), Status::Done);
    }

    #[test]
    fn aggregate_status_failed_when_any_errored() {
        let mut run = PipelineRun::new(new_label(), "sst2", None, None, "/data/odin/test".to_string());
        run.task_labels = vec!["t1".into(), "t2".into()];
        run.errored = vec!["t1".into()];
        run.terminated = vec!["t2".into()];
        assert!(run.is_complete());
        assert_eq!(run.aggregate_status(), Status::Failed);
    }
}
