//! [`TaskRun`]: one task's execution within a [`super::run::PipelineRun`].

use super::epoch_milli;
use super::pipeline::TaskDefinition;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Progress of a task run through the state machine.
#[derive(Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Waiting,
    Building,
    Executing,
    Executed,
    Failed,
    Terminated,
}

impl State {
    /// Terminal states: EXECUTED, FAILED, TERMINATED.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Executed | State::Failed | State::Terminated)
    }
}

/// Why a task run entered its current terminal state. Surfaced up into the
/// owning [`super::run::PipelineRun::error_message`] on failure.
#[derive(Debug, Clone, Display, EnumString, Serialize, Deserialize, PartialEq, Eq)]
pub enum Reason {
    Unknown,
    UnsupportedResourceKind,
    SubmitError,
    ObserveError,
    AbnormalExit,
    Cancelled,
    DependencyFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReason {
    pub reason: Reason,
    pub description: String,
}

/// One task's execution, created WAITING alongside its parent run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRun {
    /// `parent_label` + `--` + `name`.
    pub label: String,
    pub parent: String,
    pub name: String,
    /// The task descriptor, after template expansion.
    pub task: TaskDefinition,
    /// Identifier the cluster uses for the workload; assigned on submit,
    /// equal to `label` by construction.
    pub resource_id: Option<String>,
    pub state: State,
    pub status_reason: Option<StatusReason>,
    pub created: u64,
    pub started: Option<u64>,
    pub ended: Option<u64>,
}

impl TaskRun {
    pub fn new(parent: &str, task: TaskDefinition) -> Self {
        let label = super::task_run_label(parent, &task.name);
        Self {
            label,
            parent: parent.to_string(),
            name: task.name.clone(),
            task,
            resource_id: None,
            state: State::Waiting,
            status_reason: None,
            created: epoch_milli(),
            started: None,
            ended: None,
        }
    }

    /// Bind this task run to a cluster workload. Per I6, `resource_id` is
    /// never reassigned once set to a different value.
    pub fn bind_resource(&mut self) {
        if self.resource_id.is_none() {
            self.resource_id = Some(self.label.clone());
        }
    }

    pub fn finish(&mut self, state: State, reason: Option<StatusReason>) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.status_reason = reason;
        self.ended = Some(epoch_milli());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::pipeline::TaskDefinition;

    #[test]
    fn label_is_parent_plus_separator_plus_name() {
        let task_run = TaskRun::new("flow-abc123", TaskDefinition::new("train", "img"));
        assert_eq!(task_run.label, "flow-abc123--train");
    }

    #[test]
    fn bind_resource_is_idempotent() {
        let mut task_run = TaskRun::new("flow-abc123", TaskDefinition::new("train", "img"));
        task_run.bind_resource();
        let first = task_run.resource_id.clone();
        task_run.bind_resource();
        assert_eq!(task_run.resource_id, first);
        assert_eq!(task_run.resource_id.as_deref(), Some(task_run.label.as_str()));
    }
}
