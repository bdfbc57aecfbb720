//! Generic handler for the four Kubeflow training-operator CRDs
//! (TFJob/PyTorchJob/ElasticJob/MPIJob). They share one replica-group shape
//! (`spec.<ReplicaSpecsKey>.<Role>.replicas/template`) and one status
//! convention (`status.conditions[].type`), so a single parameterized
//! handler covers all four rather than four near-duplicate impls.

use super::{BackoffTracker, HandlerError, ObservedStatus};
use crate::cluster::{ClusterClient, CreateWorkloadRequest, DeleteMode, ResourceKind};
use crate::models::task_run::TaskRun;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;
use std::pin::Pin;
use std::sync::Arc;

/// The bits that differ between training-operator CRDs: API coordinates and
/// the role name their worker replica group is keyed under.
#[derive(Debug, Clone, Copy)]
pub struct TrainingJobKind {
    pub group: &'static str,
    pub version: &'static str,
    pub plural: &'static str,
    pub kind: &'static str,
    /// Replica-spec key for the worker role (e.g. `Worker`, `Launcher`).
    pub worker_role: &'static str,
}

pub const TFJOB: TrainingJobKind = TrainingJobKind {
    group: "kubeflow.org",
    version: "v1",
    plural: "tfjobs",
    kind: "TFJob",
    worker_role: "Worker",
};

pub const PYTORCHJOB: TrainingJobKind = TrainingJobKind {
    group: "kubeflow.org",
    version: "v1",
    plural: "pytorchjobs",
    kind: "PyTorchJob",
    worker_role: "Worker",
};

pub const ELASTICJOB: TrainingJobKind = TrainingJobKind {
    group: "elasticdl.org",
    version: "v1alpha1",
    plural: "elasticjobs",
    kind: "ElasticJob",
    worker_role: "Worker",
};

pub const MPIJOB: TrainingJobKind = TrainingJobKind {
    group: "kubeflow.org",
    version: "v2beta1",
    plural: "mpijobs",
    kind: "MPIJob",
    worker_role: "Launcher",
};

pub struct TrainingJobHandler {
    cluster: Arc<dyn ClusterClient>,
    kind: TrainingJobKind,
    backoff: BackoffTracker,
}

impl TrainingJobHandler {
    pub fn new(cluster: Arc<dyn ClusterClient>, kind: TrainingJobKind) -> Self {
        Self {
            cluster,
            kind,
            backoff: BackoffTracker::default(),
        }
    }

    fn resource_kind(&self) -> ResourceKind {
        ResourceKind {
            group: self.kind.group,
            version: self.kind.version,
            plural: self.kind.plural,
            kind: self.kind.kind,
            core: false,
        }
    }
}

fn manifest_for(task_run: &TaskRun, kind: &TrainingJobKind) -> serde_json::Value {
    let task = &task_run.task;
    let replicas = task.num_workers.unwrap_or(1).max(1);
    json!({
        "apiVersion": format!("{}/{}", kind.group, kind.version),
        "kind": kind.kind,
        "metadata": {
            "name": task_run.label,
            "labels": { "flowd.io/task-run": task_run.label },
        },
        "spec": {
            "replicaSpecs": {
                kind.worker_role: {
                    "replicas": replicas,
                    "restartPolicy": "Never",
                    "template": {
                        "spec": {
                            "nodeSelector": task.node_selector,
                            "containers": [{
                                "name": task.name,
                                "image": task.image,
                                "command": task.command,
                                "args": task.args,
                                "imagePullPolicy": task.pull_policy.map(|p| p.to_string()),
                                "resources": super::gpu_resources(task.num_gpus),
                                "envFrom": super::env_from(&task.secrets, &task.config_maps),
                            }],
                        },
                    },
                },
            },
        },
    })
}

#[async_trait]
impl super::Handler for TrainingJobHandler {
    async fn submit(&self, task_run: &TaskRun) -> Result<(), HandlerError> {
        self.cluster
            .create_workload(CreateWorkloadRequest {
                kind: self.resource_kind(),
                name: task_run.label.clone(),
                manifest: manifest_for(task_run, &self.kind),
            })
            .await?;
        Ok(())
    }

    async fn status(&self, task_run: &TaskRun) -> Result<ObservedStatus, HandlerError> {
        let kind = self.resource_kind();
        let status = self.cluster.get_status(&kind, &task_run.label).await?;
        Ok(self.backoff.observe(&task_run.label, status))
    }

    async fn events(&self, task_run: &TaskRun) -> Result<Vec<String>, HandlerError> {
        let kind = self.resource_kind();
        let events = self.cluster.get_events(&kind, &task_run.label).await?;
        Ok(super::format_events(events))
    }

    fn logs(
        &self,
        task_run: &TaskRun,
    ) -> Pin<Box<dyn Stream<Item = Result<Bytes, HandlerError>> + Send>> {
        let kind = self.resource_kind();
        let stream = self.cluster.get_logs(&kind, &task_run.label);
        Box::pin(stream.map(|item| item.map_err(HandlerError::from)))
    }

    async fn delete(&self, task_run: &TaskRun, mode: DeleteMode) -> Result<(), HandlerError> {
        self.backoff.clear(&task_run.label);
        let kind = self.resource_kind();
        self.cluster
            .delete_workload(&kind, &task_run.label, mode)
            .await?;
        Ok(())
    }
}
