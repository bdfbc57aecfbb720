//! Resource Handlers: the per-resource-kind translation between a
//! [`TaskRun`] and the cluster's native workload shape, dispatched through
//! the [`HandlerRegistry`].

mod batch_job;
mod pod;
mod training_job;

pub use batch_job::BatchJobHandler;
pub use pod::PodHandler;
pub use training_job::TrainingJobHandler;

use crate::cluster::{ClusterClient, ClusterError, DeleteMode, Phase, WorkloadStatus};
use crate::models::pipeline::ResourceType;
use crate::models::task_run::TaskRun;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("no handler registered for resource kind {0:?}")]
    UnsupportedResourceKind(ResourceType),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// A handler's view of a workload's progress, already mapped onto the
/// uniform four-state lattice every handler reports regardless of resource
/// kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedState {
    Building,
    Executing,
    Executed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ObservedStatus {
    pub state: ObservedState,
    pub reason: Option<String>,
}

/// The capability set every resource kind must implement. A handler owns
/// translating `TaskRun.task` into a cluster-native manifest and
/// translating cluster-native status back into [`ObservedState`].
#[async_trait]
pub trait Handler: Send + Sync {
    /// Submit the task run's workload to the cluster. Idempotent: calling
    /// submit twice for the same `task_run.label` must not create two
    /// workloads (the cluster rejects the duplicate name, which the
    /// executor treats as "already submitted").
    async fn submit(&self, task_run: &TaskRun) -> Result<(), HandlerError>;

    async fn status(&self, task_run: &TaskRun) -> Result<ObservedStatus, HandlerError>;

    async fn events(&self, task_run: &TaskRun) -> Result<Vec<String>, HandlerError>;

    fn logs(
        &self,
        task_run: &TaskRun,
    ) -> Pin<Box<dyn Stream<Item = Result<Bytes, HandlerError>> + Send>>;

    /// Delete the task run's workload. `mode` chooses whether backing pods
    /// survive (§4.4): `KeepPods` when a caller wants the controller object
    /// gone but its pods left for inspection, `WithPods` otherwise.
    async fn delete(&self, task_run: &TaskRun, mode: DeleteMode) -> Result<(), HandlerError>;
}

/// Dispatches to the registered [`Handler`] for a task's
/// [`ResourceType`]. An unregistered kind is a submission-time failure,
/// not a panic: `Reason::UnsupportedResourceKind`.
pub struct HandlerRegistry {
    handlers: HashMap<ResourceType, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: ResourceType, handler: Arc<dyn Handler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: ResourceType) -> Result<Arc<dyn Handler>, HandlerError> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or(HandlerError::UnsupportedResourceKind(kind))
    }

    /// Build the standard registry: Pod and BatchJob against their
    /// built-in kinds, and the four Kubeflow training-operator CRDs each
    /// wired through the generic [`TrainingJobHandler`].
    pub fn standard(cluster: Arc<dyn ClusterClient>) -> Self {
        let mut registry = Self::new();
        registry.register(ResourceType::Pod, Arc::new(PodHandler::new(cluster.clone())));
        registry.register(
            ResourceType::BatchJob,
            Arc::new(BatchJobHandler::new(cluster.clone())),
        );
        registry.register(
            ResourceType::TfJob,
            Arc::new(TrainingJobHandler::new(cluster.clone(), training_job::TFJOB)),
        );
        registry.register(
            ResourceType::PytorchJob,
            Arc::new(TrainingJobHandler::new(
                cluster.clone(),
                training_job::PYTORCHJOB,
            )),
        );
        registry.register(
            ResourceType::ElasticJob,
            Arc::new(TrainingJobHandler::new(
                cluster.clone(),
                training_job::ELASTICJOB,
            )),
        );
        registry.register(
            ResourceType::MpiJob,
            Arc::new(TrainingJobHandler::new(cluster, training_job::MPIJOB)),
        );
        registry
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `ImagePullBackOff` is retried by kubelet forever; handlers give up and
/// report FAILED once it has persisted past this deadline.
pub(crate) const IMAGE_PULL_BACKOFF_DEADLINE_SECS: u64 = 10 * 60;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Tracks how long a task run has sat in `ImagePullBackOff`, shared by
/// every handler so the deadline rule (§4.4) lives in one place instead of
/// being reimplemented per resource kind.
#[derive(Default)]
pub(crate) struct BackoffTracker {
    since: DashMap<String, u64>,
}

impl BackoffTracker {
    pub(crate) fn clear(&self, label: &str) {
        self.since.remove(label);
    }

    /// Fold a raw [`WorkloadStatus`] into [`ObservedStatus`] per the uniform
    /// status-mapping table in §4.4, tracking `ImagePullBackOff` against the
    /// shared deadline and clearing the tracked entry once the task leaves
    /// that condition.
    pub(crate) fn observe(&self, label: &str, status: WorkloadStatus) -> ObservedStatus {
        let in_backoff = status.reasons.iter().any(|r| r == "ImagePullBackOff");
        if in_backoff {
            let since = *self.since.entry(label.to_string()).or_insert_with(now_secs);
            if now_secs().saturating_sub(since) > IMAGE_PULL_BACKOFF_DEADLINE_SECS {
                return ObservedStatus {
                    state: ObservedState::Failed,
                    reason: Some("ImagePullBackOff deadline exceeded".to_string()),
                };
            }
            return ObservedStatus {
                state: ObservedState::Building,
                reason: Some("ImagePullBackOff".to_string()),
            };
        }
        self.clear(label);

        let state = match status.phase {
            Phase::Pending => ObservedState::Building,
            Phase::Running => ObservedState::Executing,
            Phase::Succeeded => ObservedState::Executed,
            Phase::Failed | Phase::Unknown => ObservedState::Failed,
        };
        ObservedStatus {
            state,
            reason: status.reasons.first().cloned(),
        }
    }
}

/// Render cluster events into the handler's uniform human-readable form.
pub(crate) fn format_events(events: Vec<crate::cluster::ClusterEvent>) -> Vec<String> {
    events
        .into_iter()
        .map(|e| format!("{}: {}", e.reason, e.message))
        .collect()
}

/// A task's declared `num_gpus`, translated into the `nvidia.com/gpu`
/// resource request/limit every handler's container spec carries when set.
/// `None` when the task declared no GPUs, so the key is simply absent from
/// the manifest rather than present with a zero quantity.
pub(crate) fn gpu_resources(num_gpus: Option<u32>) -> Option<serde_json::Value> {
    let count = num_gpus?;
    Some(serde_json::json!({
        "limits": { "nvidia.com/gpu": count },
        "requests": { "nvidia.com/gpu": count },
    }))
}

/// A task's declared `secrets` and `config_maps` (§3), translated into
/// `envFrom` references on the submitted container spec. The core never
/// resolves a secret's value — only the cluster-native name is threaded
/// through, same as `gpu_resources` threads a count rather than a
/// device-plugin allocation.
pub(crate) fn env_from(secrets: &[String], config_maps: &[String]) -> Option<serde_json::Value> {
    if secrets.is_empty() && config_maps.is_empty() {
        return None;
    }
    let mut refs: Vec<serde_json::Value> = Vec::with_capacity(secrets.len() + config_maps.len());
    refs.extend(
        secrets
            .iter()
            .map(|name| serde_json::json!({ "secretRef": { "name": name } })),
    );
    refs.extend(
        config_maps
            .iter()
            .map(|name| serde_json::json!({ "configMapRef": { "name": name } })),
    );
    Some(serde_json::Value::Array(refs))
}
