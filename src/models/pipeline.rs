//! Declarative pipeline descriptors, as parsed from a pipeline's `main.<ext>`
//! descriptor file. These types are immutable once loaded for a given run
//! and are never mutated by the executor.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumString};

/// The resource kind a task is scheduled as. Selects which [`crate::handlers`]
/// handler the executor dispatches to.
#[derive(
    Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    Pod,
    BatchJob,
    TfJob,
    PytorchJob,
    ElasticJob,
    MpiJob,
}

impl Default for ResourceType {
    fn default() -> Self {
        Self::Pod
    }
}

/// Image pull policy, passed through to the cluster workload spec unaltered.
#[derive(Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
#[strum(serialize_all = "PascalCase")]
pub enum PullPolicy {
    Always,
    IfNotPresent,
    Never,
}

/// A single volume mount declared on a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeMount {
    /// Name of the volume claim backing this mount.
    pub claim: String,
    /// The mount's name within the workload spec.
    pub name: String,
    /// Path inside the container the claim is mounted at. May reference
    /// template variables.
    pub path: String,
}

/// One task within a pipeline. Strings in `args`, `image`, `command`, and
/// mount `path` may reference template variables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDefinition {
    /// Unique within the pipeline.
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub config_maps: Vec<String>,
    #[serde(default)]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub node_selector: Option<HashMap<String, String>>,
    #[serde(default)]
    pub pull_policy: Option<PullPolicy>,
    #[serde(default)]
    pub num_gpus: Option<u32>,
    #[serde(default)]
    pub num_workers: Option<u32>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Name of another task in the same pipeline this one depends on.
    #[serde(default)]
    pub depends: Option<String>,
}

impl TaskDefinition {
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            command: Vec::new(),
            args: Vec::new(),
            mounts: Vec::new(),
            secrets: Vec::new(),
            config_maps: Vec::new(),
            resource_type: ResourceType::default(),
            node_selector: None,
            pull_policy: None,
            num_gpus: None,
            num_workers: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            depends: None,
        }
    }
}

/// A named pipeline read from `<root>/<pipeline>/main.<ext>`. Immutable once
/// loaded for a given run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineDefinition {
    pub name: String,
    pub tasks: Vec<TaskDefinition>,
}

impl PipelineDefinition {
    pub fn task(&self, name: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_descriptor() {
        let raw = r#"
name: sst2
tasks:
  - name: train
    image: registry.local/sst2-train:latest
    args: ["--epochs", "3"]
"#;
        let def: PipelineDefinition = serde_yaml::from_str(raw).unwrap();
        assert_eq!(def.name, "sst2");
        assert_eq!(def.tasks.len(), 1);
        assert_eq!(def.tasks[0].resource_type, ResourceType::Pod);
    }

    #[test]
    fn parses_anchors_and_aliases() {
        let raw = r#"
name: train-and-export
common_mounts: &common_mounts
  - claim: data-pvc
    name: data
    path: /data
tasks:
  - name: train
    image: registry.local/train:latest
    mounts: *common_mounts
  - name: export
    image: registry.local/export:latest
    mounts: *common_mounts
    depends: train
"#;
        let def: PipelineDefinition = serde_yaml::from_str(raw).unwrap();
        assert_eq!(def.tasks[0].mounts, def.tasks[1].mounts);
        assert_eq!(def.tasks[1].depends.as_deref(), Some("train"));
    }
}
