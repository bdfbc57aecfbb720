//! Handler for bare `Pod` workloads: the simplest resource kind, one
//! container, no operator in between.

use super::{BackoffTracker, HandlerError, ObservedStatus};
use crate::cluster::{ClusterClient, CreateWorkloadRequest, DeleteMode, ResourceKind};
use crate::models::task_run::TaskRun;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;
use std::pin::Pin;
use std::sync::Arc;

pub(crate) const POD_KIND: ResourceKind = ResourceKind {
    group: "",
    version: "v1",
    plural: "pods",
    kind: "Pod",
    core: true,
};

pub struct PodHandler {
    cluster: Arc<dyn ClusterClient>,
    backoff: BackoffTracker,
}

impl PodHandler {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            cluster,
            backoff: BackoffTracker::default(),
        }
    }
}

fn manifest_for(task_run: &TaskRun) -> serde_json::Value {
    let task = &task_run.task;
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": task_run.label,
            "labels": { "flowd.io/task-run": task_run.label },
        },
        "spec": {
            "restartPolicy": "Never",
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
    })
}

#[async_trait]
impl super::Handler for PodHandler {
    async fn submit(&self, task_run: &TaskRun) -> Result<(), HandlerError> {
        self.cluster
            .create_workload(CreateWorkloadRequest {
                kind: POD_KIND,
                name: task_run.label.clone(),
                manifest: manifest_for(task_run),
            })
            .await?;
        Ok(())
    }

    async fn status(&self, task_run: &TaskRun) -> Result<ObservedStatus, HandlerError> {
        let status = self.cluster.get_status(&POD_KIND, &task_run.label).await?;
        Ok(self.backoff.observe(&task_run.label, status))
    }

    async fn events(&self, task_run: &TaskRun) -> Result<Vec<String>, HandlerError> {
        let events = self.cluster.get_events(&POD_KIND, &task_run.label).await?;
        Ok(super::format_events(events))
    }

    fn logs(
        &self,
        task_run: &TaskRun,
    ) -> Pin<Box<dyn Stream<Item = Result<Bytes, HandlerError>> + Send>> {
        let stream = self.cluster.get_logs(&POD_KIND, &task_run.label);
        Box::pin(stream.map(|item| item.map_err(HandlerError::from)))
    }

    async fn delete(&self, task_run: &TaskRun, mode: DeleteMode) -> Result<(), HandlerError> {
        self.backoff.clear(&task_run.label);
        self.cluster
            .delete_workload(&POD_KIND, &task_run.label, mode)
            .await?;
        Ok(())
    }
}
