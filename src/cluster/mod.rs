//! Cluster Client: a typed, narrow wrapper over the cluster's
//! control-plane API. This is the only component that speaks the cluster's
//! native protocol — [`crate::handlers`] never bypass it.

mod kube_client;

pub use kube_client::KubeClusterClient;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::pin::Pin;

/// Errors surfaced by the cluster client. Handlers translate these into
/// task-run status transitions, distinguishing submit failures
/// (bounded-retry) from observe failures (unbounded-retry-with-backoff).
#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    #[error("could not reach cluster control plane: {0}")]
    Connection(String),

    #[error("workload '{0}' not found")]
    NotFound(String),

    #[error("call to cluster control plane exceeded its deadline")]
    DeadlineExceeded,

    #[error("cluster rejected workload spec: {0}")]
    InvalidSpec(String),

    #[error("unexpected cluster error: {0}")]
    Unknown(String),
}

/// Identifies a cluster-native resource kind a workload is submitted as.
#[derive(Debug, Clone)]
pub struct ResourceKind {
    /// API group, e.g. `kubeflow.org` for training-operator CRDs, or empty
    /// for core `v1` kinds.
    pub group: &'static str,
    pub version: &'static str,
    /// Lowercase plural, as used in the API path (e.g. `tfjobs`).
    pub plural: &'static str,
    /// The `kind` field stamped on the submitted manifest (e.g. `TFJob`).
    pub kind: &'static str,
    /// Whether this kind is cluster-scoped `core/v1` (Pod, and Job via
    /// `batch/v1`) vs. a namespaced CRD.
    pub core: bool,
}

/// A structured request to create one workload. Handlers own the shape of
/// `manifest` for their resource kind; the cluster client only needs enough
/// structure to route and name the call.
#[derive(Debug, Clone)]
pub struct CreateWorkloadRequest {
    pub kind: ResourceKind,
    /// Unique workload name; equals the owning task run's label.
    pub name: String,
    /// The full resource manifest, as a JSON value ready to submit.
    pub manifest: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct WorkloadStatus {
    pub phase: Phase,
    /// Raw condition/event reasons observed (e.g. `BackOff`, `Failed`),
    /// used by handlers to detect `ImagePullBackOff` past its deadline.
    pub reasons: Vec<String>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct ClusterEvent {
    pub reason: String,
    pub message: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum DeleteMode {
    /// Remove the workload and any pods it owns.
    WithPods,
    /// Remove the workload's controller object but let backing pods survive.
    KeepPods,
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub allocatable: HashMap<String, String>,
}

/// The narrow set of operations Handlers need against the cluster.
/// Every call carries an implicit deadline; callers retry transient
/// failures with backoff, see [`ClusterError::DeadlineExceeded`].
#[async_trait]
pub trait ClusterClient: Debug + Send + Sync {
    async fn create_workload(&self, req: CreateWorkloadRequest) -> Result<(), ClusterError>;

    async fn get_status(
        &self,
        kind: &ResourceKind,
        name: &str,
    ) -> Result<WorkloadStatus, ClusterError>;

    async fn get_events(
        &self,
        kind: &ResourceKind,
        name: &str,
    ) -> Result<Vec<ClusterEvent>, ClusterError>;

    /// Stream of raw log bytes for the workload's pod(s).
    fn get_logs(
        &self,
        kind: &ResourceKind,
        name: &str,
    ) -> Pin<Box<dyn Stream<Item = Result<bytes::Bytes, ClusterError>> + Send>>;

    async fn delete_workload(
        &self,
        kind: &ResourceKind,
        name: &str,
        mode: DeleteMode,
    ) -> Result<(), ClusterError>;

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError>;
}
