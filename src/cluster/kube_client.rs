//! A `kube`-backed [`super::ClusterClient`]. Built-in kinds (`Pod`, `Job`)
//! go through their typed `k8s-openapi` APIs; training-job CRDs
//! (TFJob/PyTorchJob/ElasticJob/MPIJob) go through [`kube::Api<DynamicObject>`]
//! against the `ApiResource` their [`super::ResourceKind`] describes.

use super::{
    ClusterClient, ClusterError, ClusterEvent, CreateWorkloadRequest, DeleteMode, NodeInfo, Phase,
    ResourceKind, WorkloadStatus,
};
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Event as CoreEvent, Node, Pod};
use kube::api::{ApiResource, DeleteParams, DynamicObject, ListParams, LogParams, PostParams};
use kube::{Api, Client};
use std::collections::HashMap;
use std::pin::Pin;

/// Default namespace workloads are submitted into. A future revision may
/// make this per-pipeline.
const NAMESPACE: &str = "flowd";

#[derive(Debug)]
pub struct KubeClusterClient {
    client: Client,
    namespace: String,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            namespace: NAMESPACE.to_string(),
        }
    }

    pub fn with_namespace(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn dynamic_api(&self, kind: &ResourceKind) -> Api<DynamicObject> {
        let api_resource = ApiResource {
            group: kind.group.to_string(),
            version: kind.version.to_string(),
            api_version: if kind.group.is_empty() {
                kind.version.to_string()
            } else {
                format!("{}/{}", kind.group, kind.version)
            },
            kind: kind.kind.to_string(),
            plural: kind.plural.to_string(),
        };
        Api::namespaced_with(self.client.clone(), &self.namespace, &api_resource)
    }

    fn pod_api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn job_api(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

fn map_kube_error(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound(resp.message),
        kube::Error::Api(resp) if resp.code == 400 || resp.code == 422 => {
            ClusterError::InvalidSpec(resp.message)
        }
        kube::Error::Api(resp) => ClusterError::Unknown(resp.message),
        other => ClusterError::Connection(other.to_string()),
    }
}

fn job_phase(job: &Job) -> (Phase, Option<i32>) {
    let Some(status) = &job.status else {
        return (Phase::Pending, None);
    };
    if status.succeeded.unwrap_or(0) > 0 {
        return (Phase::Succeeded, Some(0));
    }
    if status.failed.unwrap_or(0) > 0 {
        return (Phase::Failed, Some(1));
    }
    if status.active.unwrap_or(0) > 0 {
        return (Phase::Running, None);
    }
    (Phase::Pending, None)
}

fn pod_phase(pod: &Pod) -> (Phase, Option<i32>, Vec<String>) {
    let mut reasons = Vec::new();
    let Some(status) = &pod.status else {
        return (Phase::Pending, None, reasons);
    };
    let phase = match status.phase.as_deref() {
        Some("Running") => Phase::Running,
        Some("Succeeded") => Phase::Succeeded,
        Some("Failed") => Phase::Failed,
        Some("Pending") => Phase::Pending,
        _ => Phase::Unknown,
    };
    let mut exit_code = None;
    for cs in status.container_statuses.iter().flatten() {
        if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) {
            if let Some(reason) = &waiting.reason {
                reasons.push(reason.clone());
            }
        }
        if let Some(terminated) = cs.state.as_ref().and_then(|s| s.terminated.as_ref()) {
            exit_code = Some(terminated.exit_code);
            if let Some(reason) = &terminated.reason {
                reasons.push(reason.clone());
            }
        }
    }
    (phase, exit_code, reasons)
}

/// `DynamicObject` status is schemaless; the training operators (tf/pytorch
/// /elastic/mpi-operator) all converge on a `status.conditions[].type` of
/// `Running`/`Succeeded`/`Failed` per the Kubeflow training-operator common
/// API, so a single extraction covers every CRD kind we submit.
fn dynamic_phase(obj: &DynamicObject) -> (Phase, Vec<String>) {
    let conditions = obj
        .data
        .get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();

    let mut reasons = Vec::new();
    let mut phase = Phase::Pending;
    for cond in &conditions {
        let Some(cond_type) = cond.get("type").and_then(|t| t.as_str()) else {
            continue;
        };
        let is_true = cond.get("status").and_then(|s| s.as_str()) == Some("True");
        if !is_true {
            continue;
        }
        phase = match cond_type {
            "Running" => Phase::Running,
            "Succeeded" => Phase::Succeeded,
            "Failed" => Phase::Failed,
            _ => phase,
        };
        if let Some(reason) = cond.get("reason").and_then(|r| r.as_str()) {
            reasons.push(reason.to_string());
        }
    }
    (phase, reasons)
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn create_workload(&self, req: CreateWorkloadRequest) -> Result<(), ClusterError> {
        let pp = PostParams::default();
        if req.kind.core && req.kind.kind == "Pod" {
            let pod: Pod =
                serde_json::from_value(req.manifest).map_err(|e| ClusterError::InvalidSpec(e.to_string()))?;
            self.pod_api().create(&pp, &pod).await.map_err(map_kube_error)?;
            return Ok(());
        }
        if req.kind.core && req.kind.kind == "Job" {
            let job: Job =
                serde_json::from_value(req.manifest).map_err(|e| ClusterError::InvalidSpec(e.to_string()))?;
            self.job_api().create(&pp, &job).await.map_err(map_kube_error)?;
            return Ok(());
        }
        let object: DynamicObject =
            serde_json::from_value(req.manifest).map_err(|e| ClusterError::InvalidSpec(e.to_string()))?;
        self.dynamic_api(&req.kind)
            .create(&pp, &object)
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }

    async fn get_status(
        &self,
        kind: &ResourceKind,
        name: &str,
    ) -> Result<WorkloadStatus, ClusterError> {
        if kind.core && kind.kind == "Pod" {
            let pod = self.pod_api().get(name).await.map_err(map_kube_error)?;
            let (phase, exit_code, reasons) = pod_phase(&pod);
            return Ok(WorkloadStatus {
                phase,
                reasons,
                exit_code,
            });
        }
        if kind.core && kind.kind == "Job" {
            let job = self.job_api().get(name).await.map_err(map_kube_error)?;
            let (phase, exit_code) = job_phase(&job);
            return Ok(WorkloadStatus {
                phase,
                reasons: Vec::new(),
                exit_code,
            });
        }
        let object = self.dynamic_api(kind).get(name).await.map_err(map_kube_error)?;
        let (phase, reasons) = dynamic_phase(&object);
        Ok(WorkloadStatus {
            phase,
            reasons,
            exit_code: None,
        })
    }

    async fn get_events(
        &self,
        _kind: &ResourceKind,
        name: &str,
    ) -> Result<Vec<ClusterEvent>, ClusterError> {
        let events: Api<CoreEvent> = Api::namespaced(self.client.clone(), &self.namespace);
        let lp = ListParams::default().fields(&format!("involvedObject.name={name}"));
        let list = events.list(&lp).await.map_err(map_kube_error)?;
        Ok(list
            .items
            .into_iter()
            .map(|e| ClusterEvent {
                reason: e.reason.unwrap_or_default(),
                message: e.message.unwrap_or_default(),
                timestamp: e
                    .event_time
                    .and_then(|t| t.0.timestamp_millis().try_into().ok())
                    .unwrap_or(0),
            })
            .collect())
    }

    fn get_logs(
        &self,
        kind: &ResourceKind,
        name: &str,
    ) -> Pin<Box<dyn Stream<Item = Result<bytes::Bytes, ClusterError>> + Send>> {
        let pods = self.pod_api();
        let kind = kind.clone();
        let name = name.to_string();
        let client = self.client.clone();
        let namespace = self.namespace.clone();

        Box::pin(async_stream::try_stream! {
            let pod_name = if kind.core && kind.kind == "Pod" {
                name.clone()
            } else {
                let lp = ListParams::default().labels(&format!("job-name={name}"));
                let list = pods.list(&lp).await.map_err(map_kube_error)?;
                list.items
                    .into_iter()
                    .next()
                    .and_then(|p| p.metadata.name)
                    .ok_or_else(|| ClusterError::NotFound(name.clone()))?
            };
            let pods: Api<Pod> = Api::namespaced(client, &namespace);
            let lp = LogParams {
                follow: true,
                ..Default::default()
            };
            let mut stream = pods
                .log_stream(&pod_name, &lp)
                .await
                .map_err(map_kube_error)?;
            while let Some(chunk) = stream.try_next().await.map_err(map_kube_error)? {
                yield chunk;
            }
        })
    }

    async fn delete_workload(
        &self,
        kind: &ResourceKind,
        name: &str,
        mode: DeleteMode,
    ) -> Result<(), ClusterError> {
        let dp = match mode {
            DeleteMode::WithPods => DeleteParams::foreground(),
            DeleteMode::KeepPods => DeleteParams::background(),
        };
        if kind.core && kind.kind == "Pod" {
            self.pod_api().delete(name, &dp).await.map_err(map_kube_error)?;
            return Ok(());
        }
        if kind.core && kind.kind == "Job" {
            self.job_api().delete(name, &dp).await.map_err(map_kube_error)?;
            return Ok(());
        }
        self.dynamic_api(kind)
            .delete(name, &dp)
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await.map_err(map_kube_error)?;
        Ok(list
            .items
            .into_iter()
            .map(|n| {
                let allocatable = n
                    .status
                    .and_then(|s| s.allocatable)
                    .map(|a| {
                        a.into_iter()
                            .map(|(k, v)| (k, v.0))
                            .collect::<HashMap<_, _>>()
                    })
                    .unwrap_or_default();
                NodeInfo {
                    name: n.metadata.name.unwrap_or_default(),
                    allocatable,
                }
            })
            .collect())
    }
}
