use super::{JobsStore, StorageError};
use crate::models::run::{PipelineRun, Status};
use crate::models::task_run::TaskRun;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::ops::Deref;
use std::path::Path;

/// Map a `sqlx::Error` onto our error taxonomy, keyed by SQLite result code
/// where one is present. See https://www.sqlite.org/rescode.html.
fn map_sqlx_error(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::RowNotFound => StorageError::NotFound,
        sqlx::Error::Database(database_err) => {
            if let Some(code) = database_err.code() {
                match code.deref() {
                    "1555" | "2067" => StorageError::Exists,
                    _ => StorageError::Internal(format!("[{code}] {database_err}")),
                }
            } else {
                StorageError::Internal(database_err.to_string())
            }
        }
        other => StorageError::Internal(other.to_string()),
    }
}

/// SQLite-backed [`JobsStore`]. One pool, WAL mode, `STRICT` tables —
/// indexed columns carry what the control surface searches/filters on;
/// everything else rides along as a JSON blob.
#[derive(Debug, Clone)]
pub struct SqliteJobsStore {
    pool: SqlitePool,
}

impl SqliteJobsStore {
    pub async fn connect(path: &Path) -> Result<Self, StorageError> {
        if !path.exists() {
            std::fs::File::create(path)
                .map_err(|e| StorageError::Connection(e.to_string()))?;
        }

        let pool = SqlitePool::connect(&format!("file:{}", path.display()))
            .await
            .map_err(map_sqlx_error)?;

        for pragma in [
            "PRAGMA journal_mode = WAL;",
            "PRAGMA busy_timeout = 5000;",
            "PRAGMA foreign_keys = ON;",
            "PRAGMA strict = ON;",
        ] {
            sqlx::query(pragma).execute(&pool).await.map_err(map_sqlx_error)?;
        }

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS runs (
                label TEXT NOT NULL,
                job TEXT NOT NULL,
                version TEXT,
                status TEXT NOT NULL,
                submit_time INTEGER NOT NULL,
                completion_time INTEGER,
                document TEXT NOT NULL,
                PRIMARY KEY (label)
            ) STRICT;"#,
        )
        .execute(&pool)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS task_runs (
                label TEXT NOT NULL,
                parent TEXT NOT NULL,
                state TEXT NOT NULL,
                document TEXT NOT NULL,
                PRIMARY KEY (label),
                FOREIGN KEY (parent) REFERENCES runs (label)
            ) STRICT;"#,
        )
        .execute(&pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(Self { pool })
    }

    fn run_from_row(row: SqliteRow) -> Result<PipelineRun, StorageError> {
        let document: String = row.get("document");
        serde_json::from_str(&document)
            .map_err(|e| StorageError::Parse(format!("run document: {e}")))
    }

    fn task_run_from_row(row: SqliteRow) -> Result<TaskRun, StorageError> {
        let document: String = row.get("document");
        serde_json::from_str(&document)
            .map_err(|e| StorageError::Parse(format!("task_run document: {e}")))
    }
}

#[async_trait]
impl JobsStore for SqliteJobsStore {
    async fn create_run(&self, run: &PipelineRun) -> Result<(), StorageError> {
        let document = serde_json::to_string(run)
            .map_err(|e| StorageError::Internal(format!("serializing run: {e}")))?;

        sqlx::query(
            r#"INSERT INTO runs (label, job, version, status, submit_time, completion_time, document)
               VALUES (?, ?, ?, ?, ?, ?, ?);"#,
        )
        .bind(&run.label)
        .bind(&run.job)
        .bind(&run.version)
        .bind(run.status.to_string())
        .bind(run.submit_time as i64)
        .bind(run.completion_time.map(|t| t as i64))
        .bind(document)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<(), StorageError> {
        let document = serde_json::to_string(run)
            .map_err(|e| StorageError::Internal(format!("serializing run: {e}")))?;

        let result = sqlx::query(
            r#"UPDATE runs SET status = ?, completion_time = ?, document = ? WHERE label = ?;"#,
        )
        .bind(run.status.to_string())
        .bind(run.completion_time.map(|t| t as i64))
        .bind(document)
        .bind(&run.label)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn get_run(&self, label: &str) -> Result<PipelineRun, StorageError> {
        let row = sqlx::query("SELECT document FROM runs WHERE label = ?;")
            .bind(label)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Self::run_from_row(row)
    }

    async fn search_runs(&self, needle: &str) -> Result<Vec<PipelineRun>, StorageError> {
        let pattern = format!("%{needle}%");
        let rows = sqlx::query("SELECT document FROM runs WHERE label LIKE ? ORDER BY submit_time DESC;")
            .bind(pattern)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.into_iter().map(Self::run_from_row).collect()
    }

    async fn non_terminal_runs(&self) -> Result<Vec<PipelineRun>, StorageError> {
        let rows = sqlx::query(
            "SELECT document FROM runs WHERE status NOT IN (?, ?, ?) ORDER BY submit_time ASC;",
        )
        .bind(Status::Done.to_string())
        .bind(Status::Failed.to_string())
        .bind(Status::Terminated.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.into_iter().map(Self::run_from_row).collect()
    }

    async fn delete_run(&self, label: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM task_runs WHERE parent = ?;")
            .bind(label)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let result = sqlx::query("DELETE FROM runs WHERE label = ?;")
            .bind(label)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn create_task_run(&self, task_run: &TaskRun) -> Result<(), StorageError> {
        let document = serde_json::to_string(task_run)
            .map_err(|e| StorageError::Internal(format!("serializing task run: {e}")))?;

        sqlx::query(
            r#"INSERT INTO task_runs (label, parent, state, document) VALUES (?, ?, ?, ?);"#,
        )
        .bind(&task_run.label)
        .bind(&task_run.parent)
        .bind(task_run.state.to_string())
        .bind(document)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn update_task_run(&self, task_run: &TaskRun) -> Result<(), StorageError> {
        let document = serde_json::to_string(task_run)
            .map_err(|e| StorageError::Internal(format!("serializing task run: {e}")))?;

        let result = sqlx::query("UPDATE task_runs SET state = ?, document = ? WHERE label = ?;")
            .bind(task_run.state.to_string())
            .bind(document)
            .bind(&task_run.label)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn get_task_run(&self, label: &str) -> Result<TaskRun, StorageError> {
        let row = sqlx::query("SELECT document FROM task_runs WHERE label = ?;")
            .bind(label)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Self::task_run_from_row(row)
    }

    async fn task_runs_for(&self, run_label: &str) -> Result<Vec<TaskRun>, StorageError> {
        let rows = sqlx::query("SELECT document FROM task_runs WHERE parent = ? ORDER BY rowid ASC;")
            .bind(run_label)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.into_iter().map(Self::task_run_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::pipeline::TaskDefinition;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    async fn harness() -> (SqliteJobsStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SqliteJobsStore::connect(&dir.path().join("jobs.db")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn create_and_fetch_run_round_trips() {
        let (store, _dir) = harness().await;
        let run = PipelineRun::new(crate::models::run::new_label(), "sst2", None, None, "/data/odin/test".to_string());
        store.create_run(&run).await.unwrap();

        let fetched = store.get_run(&run.label).await.unwrap();
        assert_eq!(fetched.label, run.label);
        assert_eq!(fetched.job, "sst2");
    }

    #[tokio::test]
    async fn update_nonexistent_run_is_not_found() {
        let (store, _dir) = harness().await;
        let run = PipelineRun::new(crate::models::run::new_label(), "sst2", None, None, "/data/odin/test".to_string());
        let err = store.update_run(&run).await.unwrap_err();
        assert_eq!(err, StorageError::NotFound);
    }

    #[tokio::test]
    async fn search_runs_matches_label_substring() {
        let (store, _dir) = harness().await;
        let run = PipelineRun::new(crate::models::run::new_label(), "sst2", None, None, "/data/odin/test".to_string());
        store.create_run(&run).await.unwrap();

        let needle = &run.label[5..9];
        let found = store.search_runs(needle).await.unwrap();
        assert!(found.iter().any(|r| r.label == run.label));
    }

    #[tokio::test]
    async fn non_terminal_runs_excludes_terminated() {
        let (store, _dir) = harness().await;
        let mut run = PipelineRun::new(
            crate::models::run::new_label(),
            "sst2",
            None,
            None,
            "/data/odin/test".to_string(),
        );
        store.create_run(&run).await.unwrap();

        let before = store.non_terminal_runs().await.unwrap();
        assert!(before.iter().any(|r| r.label == run.label));

        run.status = Status::Terminated;
        store.update_run(&run).await.unwrap();

        let after = store.non_terminal_runs().await.unwrap();
        assert!(!after.iter().any(|r| r.label == run.label));
    }

    #[tokio::test]
    async fn task_run_create_and_list_for_parent() {
        let (store, _dir) = harness().await;
        let run = PipelineRun::new(crate::models::run::new_label(), "sst2", None, None, "/data/odin/test".to_string());
        store.create_run(&run).await.unwrap();

        let task_run = TaskRun::new(&run.label, TaskDefinition::new("train", "img"));
        store.create_task_run(&task_run).await.unwrap();

        let task_runs = store.task_runs_for(&run.label).await.unwrap();
        assert_eq!(task_runs.len(), 1);
        assert_eq!(task_runs[0].label, task_run.label);
    }
}
