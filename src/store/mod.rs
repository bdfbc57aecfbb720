//! Jobs Store: durable lifecycle state for pipeline runs and task runs,
//! backed by SQLite through `sqlx`. One connection pool, WAL mode,
//! `STRICT` tables.

mod sqlite;

pub use sqlite::SqliteJobsStore;

use crate::models::run::PipelineRun;
use crate::models::task_run::TaskRun;
use async_trait::async_trait;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    Exists,

    #[error("could not establish connection to jobs store: {0}")]
    Connection(String),

    #[error("could not parse stored value: {0}")]
    Parse(String),

    #[error("internal storage error: {0}")]
    Internal(String),
}

/// Durable storage for [`PipelineRun`]s and their [`TaskRun`]s. The
/// executor is the only writer; the control surface reads through this
/// trait to answer STATUS/SHOW requests.
#[async_trait]
pub trait JobsStore: Send + Sync {
    async fn create_run(&self, run: &PipelineRun) -> Result<(), StorageError>;
    async fn update_run(&self, run: &PipelineRun) -> Result<(), StorageError>;
    async fn get_run(&self, label: &str) -> Result<PipelineRun, StorageError>;
    /// Runs whose label contains `needle`, most recent first.
    async fn search_runs(&self, needle: &str) -> Result<Vec<PipelineRun>, StorageError>;
    /// Every run not yet in a terminal [`crate::models::run::Status`], used
    /// at startup to recover in-flight pipelines.
    async fn non_terminal_runs(&self) -> Result<Vec<PipelineRun>, StorageError>;
    async fn delete_run(&self, label: &str) -> Result<(), StorageError>;

    async fn create_task_run(&self, task_run: &TaskRun) -> Result<(), StorageError>;
    async fn update_task_run(&self, task_run: &TaskRun) -> Result<(), StorageError>;
    async fn get_task_run(&self, label: &str) -> Result<TaskRun, StorageError>;
    async fn task_runs_for(&self, run_label: &str) -> Result<Vec<TaskRun>, StorageError>;
}
