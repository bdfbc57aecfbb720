//! Executor: drives one reconciliation worker per
//! [`PipelineRun`](crate::models::run::PipelineRun), computing the ready
//! set, submitting and observing tasks through the [`HandlerRegistry`], and
//! finalizing the run once nothing remains WAITING or EXECUTING.

use crate::cluster::{ClusterError, DeleteMode};
use crate::dag::Dag;
use crate::errors::SubmissionError;
use crate::handlers::{Handler, HandlerError, HandlerRegistry, ObservedState};
use crate::models::pipeline::PipelineDefinition;
use crate::models::run::{new_label, PipelineRun, Status};
use crate::models::task_run::{Reason, State, StatusReason, TaskRun};
use crate::store::JobsStore;
use crate::template::{self, Scope};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// §7 `SubmitError`: bounded retry before a submission is treated as a
/// permanent handler-side failure.
const SUBMIT_MAX_ATTEMPTS: u32 = 3;
const SUBMIT_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// §5 Timeouts: a `DeadlineExceeded` observation is retried with
/// exponential backoff up to this ceiling, then escalated to FAILED rather
/// than retried forever like other transient `ObserveError`s.
const OBSERVE_DEADLINE_INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const OBSERVE_DEADLINE_MAX_BACKOFF: Duration = Duration::from_secs(30);
const OBSERVE_DEADLINE_CEILING: Duration = Duration::from_secs(5 * 60);

/// Tracks a task run's consecutive `DeadlineExceeded` observations so the
/// backoff-to-ceiling rule survives across reconciliation ticks.
struct DeadlineBackoff {
    first_failure: Instant,
    next_retry: Instant,
    backoff: Duration,
}

/// The path variables a submission binds its tasks' templates against
/// (`${ROOT_PATH}`/`${WORK_PATH}`/`${PIPE_ID}`). `${RUN_PATH}` is not
/// supplied here: it is derived as `data_dir/<run label>` so that it is
/// per-run and unique by construction.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub root_path: String,
    pub work_path: String,
    /// Parent directory under which this run's workspace is created.
    pub data_dir: String,
}

/// Signals a reconciliation worker to stop at its next tick and tear down
/// any in-flight tasks.
#[derive(Debug, Clone, Default)]
struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    fn requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Drives every in-flight PipelineRun. Cheaply cloneable; each clone shares
/// the same store, handler registry, and cancellation table.
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn JobsStore>,
    handlers: Arc<HandlerRegistry>,
    tick_interval: Duration,
    cancellations: Arc<DashMap<String, CancelHandle>>,
}

impl Executor {
    pub fn new(store: Arc<dyn JobsStore>, handlers: Arc<HandlerRegistry>) -> Self {
        Self::with_tick_interval(store, handlers, Duration::from_secs(2))
    }

    pub fn with_tick_interval(
        store: Arc<dyn JobsStore>,
        handlers: Arc<HandlerRegistry>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store,
            handlers,
            tick_interval,
            cancellations: Arc::new(DashMap::new()),
        }
    }

    /// Validate `pipeline`, build its DAG, persist a new PipelineRun with
    /// every task WAITING, and spawn its reconciliation worker. Returns as
    /// soon as the run is durably recorded — reconciliation proceeds in the
    /// background.
    #[instrument(skip(self, pipeline), fields(job = %pipeline.name))]
    pub async fn submit(
        &self,
        pipeline: &PipelineDefinition,
        paths: RunPaths,
    ) -> Result<PipelineRun, SubmissionError> {
        if pipeline.tasks.is_empty() {
            return Err(SubmissionError::Validation(
                "pipeline declares no tasks".to_string(),
            ));
        }

        let dag = Dag::build(&pipeline.tasks)?;
        let label = new_label();

        // ${RUN_PATH} is derived from the label, not supplied by the
        // caller, so that it is per-run and unique by construction.
        let run_path = format!("{}/{}", paths.data_dir.trim_end_matches('/'), label);
        std::fs::create_dir_all(&run_path).map_err(|e| {
            SubmissionError::Validation(format!("could not create run workspace {run_path}: {e}"))
        })?;

        let scope = Scope {
            root_path: &paths.root_path,
            work_path: &paths.work_path,
            run_path: &run_path,
            task_id: "",
            task_name: "",
            pipe_id: &label,
        };

        let mut run = PipelineRun::new(label.clone(), &pipeline.name, None, None, run_path.clone());
        let mut task_runs = Vec::with_capacity(pipeline.tasks.len());

        for task in dag.tasks_in_order() {
            let task_id = crate::models::task_run_label(&label, &task.name);
            let task_scope = Scope {
                task_id: &task_id,
                task_name: &task.name,
                ..scope.clone()
            };
            let expanded = template::expand_task(task, &task_scope);
            let task_run = TaskRun::new(&label, expanded);
            run.task_labels.push(task_run.label.clone());
            run.waiting.push(task_run.label.clone());
            task_runs.push(task_run);
        }

        self.store.create_run(&run).await.map_err(|e| {
            SubmissionError::Validation(format!("could not persist pipeline run: {e}"))
        })?;
        for task_run in &task_runs {
            self.store.create_task_run(task_run).await.map_err(|e| {
                SubmissionError::Validation(format!("could not persist task run: {e}"))
            })?;
        }

        self.spawn_worker(dag, run.clone());
        Ok(run)
    }

    /// Request cancellation of a run; idempotent. The running worker
    /// observes it at its next tick.
    pub fn cancel(&self, run_label: &str) {
        if let Some(handle) = self.cancellations.get(run_label) {
            handle.request();
        }
    }

    /// Enumerate every non-terminal run and resume its reconciliation
    /// worker, as required after a process restart.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, crate::store::StorageError> {
        let runs = self.store.non_terminal_runs().await?;
        let mut resumed = 0;
        for run in runs {
            let mut task_runs = self.store.task_runs_for(&run.label).await?;

            // A task run durably written as BUILDING with no resource_id
            // bound yet crashed mid-submit: the cluster workload was never
            // (or not durably) created, so it is safe and necessary to
            // re-enter the ready set rather than rebind to nothing (§4.6).
            for task_run in task_runs.iter_mut() {
                if task_run.state == State::Building && task_run.resource_id.is_none() {
                    warn!(
                        run = %run.label,
                        task = %task_run.name,
                        "resetting task run interrupted mid-submit back to WAITING"
                    );
                    task_run.state = State::Waiting;
                    if let Err(e) = self.store.update_task_run(task_run).await {
                        error!(
                            run = %run.label,
                            task = %task_run.name,
                            error = %e,
                            "could not persist reset of interrupted task run"
                        );
                    }
                }
            }

            let tasks: Vec<_> = task_runs.iter().map(|t| t.task.clone()).collect();
            let dag = match Dag::build(&tasks) {
                Ok(dag) => dag,
                Err(e) => {
                    error!(run = %run.label, error = %e, "could not rebuild dag on recovery");
                    continue;
                }
            };
            info!(run = %run.label, "resuming pipeline run after restart");
            self.spawn_worker(dag, run);
            resumed += 1;
        }
        Ok(resumed)
    }

    fn spawn_worker(&self, dag: Dag, run: PipelineRun) {
        let cancel = CancelHandle::default();
        self.cancellations.insert(run.label.clone(), cancel.clone());

        let worker = Worker {
            store: self.store.clone(),
            handlers: self.handlers.clone(),
            tick_interval: self.tick_interval,
            cancel,
            dag,
            deadline_backoff: DashMap::new(),
        };
        let cancellations = self.cancellations.clone();
        let run_label = run.label.clone();
        tokio::spawn(async move {
            worker.run(run).await;
            cancellations.remove(&run_label);
        });
    }
}

/// Owns one PipelineRun's reconciliation loop. Submission and observation
/// within a run are serialized by construction: everything below runs on a
/// single task, one tick at a time.
struct Worker {
    store: Arc<dyn JobsStore>,
    handlers: Arc<HandlerRegistry>,
    tick_interval: Duration,
    cancel: CancelHandle,
    dag: Dag,
    /// Per-task-run consecutive `DeadlineExceeded` observation tracking
    /// (§5 Timeouts), keyed by task run label.
    deadline_backoff: DashMap<String, DeadlineBackoff>,
}

impl Worker {
    #[instrument(skip(self, run), fields(run = %run.label))]
    async fn run(&self, mut run: PipelineRun) {
        let mut task_runs = match self.load_task_runs(&run).await {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "could not load task runs; aborting reconciliation");
                return;
            }
        };

        if run.status == Status::Submitted {
            run.status = Status::Running;
            let _ = self.store.update_run(&run).await;
        }

        loop {
            if self.cancel.requested() {
                self.handle_cancellation(&mut run, &mut task_runs).await;
                break;
            }

            self.submit_ready(&mut run, &mut task_runs).await;
            self.observe_executing(&mut run, &mut task_runs).await;
            self.propagate_failures(&mut run, &mut task_runs).await;

            if run.is_complete() {
                self.finalize(&mut run).await;
                break;
            }

            tokio::time::sleep(self.tick_interval).await;
        }
    }

    async fn load_task_runs(
        &self,
        run: &PipelineRun,
    ) -> Result<Vec<TaskRun>, crate::store::StorageError> {
        self.store.task_runs_for(&run.label).await
    }

    fn task_run_mut<'a>(task_runs: &'a mut [TaskRun], name: &str) -> &'a mut TaskRun {
        task_runs
            .iter_mut()
            .find(|t| t.name == name)
            .expect("task run exists for every dag node")
    }

    fn move_label(run: &mut PipelineRun, label: &str, from: TaskBucket, to: TaskBucket) {
        Self::bucket_mut(run, from).retain(|l| l != label);
        Self::bucket_mut(run, to).push(label.to_string());
    }

    fn bucket_mut(run: &mut PipelineRun, bucket: TaskBucket) -> &mut Vec<String> {
        match bucket {
            TaskBucket::Waiting => &mut run.waiting,
            TaskBucket::Executing => &mut run.executing,
            TaskBucket::Executed => &mut run.executed,
            TaskBucket::Errored => &mut run.errored,
            TaskBucket::Terminated => &mut run.terminated,
        }
    }

    /// Compute the ready set (WAITING tasks whose sole dependency, if any,
    /// is EXECUTED) and submit each in declaration order.
    async fn submit_ready(&self, run: &mut PipelineRun, task_runs: &mut [TaskRun]) {
        let ready_names: Vec<String> = self
            .dag
            .tasks_in_order()
            .filter(|task| {
                let state = task_runs
                    .iter()
                    .find(|t| t.name == task.name)
                    .map(|t| t.state)
                    .unwrap_or(State::Waiting);
                if state != State::Waiting {
                    return false;
                }
                match self.dag.dependency_of(&task.name) {
                    None => true,
                    Some(dep) => task_runs
                        .iter()
                        .find(|t| t.name == dep)
                        .map(|t| t.state == State::Executed)
                        .unwrap_or(false),
                }
            })
            .map(|t| t.name.clone())
            .collect();

        for name in ready_names {
            let Ok(handler) = self.handlers.get(
                Self::task_run_mut(task_runs, &name).task.resource_type,
            ) else {
                let task_run = Self::task_run_mut(task_runs, &name);
                task_run.finish(
                    State::Failed,
                    Some(StatusReason {
                        reason: Reason::UnsupportedResourceKind,
                        description: format!(
                            "no handler registered for resource kind {:?}",
                            task_run.task.resource_type
                        ),
                    }),
                );
                let label = task_run.label.clone();
                let _ = self.store.update_task_run(task_run).await;
                Self::move_label(run, &label, TaskBucket::Waiting, TaskBucket::Errored);
                continue;
            };

            let task_run = Self::task_run_mut(task_runs, &name);
            task_run.state = State::Building;
            let _ = self.store.update_task_run(task_run).await;

            match Self::submit_with_retry(&handler, task_run).await {
                Ok(()) => {
                    task_run.bind_resource();
                    task_run.state = State::Executing;
                    task_run.started = Some(crate::models::epoch_milli());
                    let label = task_run.label.clone();
                    let _ = self.store.update_task_run(task_run).await;
                    Self::move_label(run, &label, TaskBucket::Waiting, TaskBucket::Executing);
                }
                Err(e) => {
                    task_run.finish(
                        State::Failed,
                        Some(StatusReason {
                            reason: Reason::SubmitError,
                            description: e.to_string(),
                        }),
                    );
                    let label = task_run.label.clone();
                    let _ = self.store.update_task_run(task_run).await;
                    Self::move_label(run, &label, TaskBucket::Waiting, TaskBucket::Errored);
                    warn!(task = %name, error = %e, "task submission failed after retries exhausted");
                }
            }
        }
        let _ = self.store.update_run(run).await;
    }

    /// Submit once, then retry up to `SUBMIT_MAX_ATTEMPTS` total attempts
    /// with doubling backoff before surfacing the error as permanent
    /// (§7 `SubmitError`). `handler.submit` is required to be idempotent, so
    /// retrying a duplicate name is safe.
    async fn submit_with_retry(
        handler: &Arc<dyn Handler>,
        task_run: &TaskRun,
    ) -> Result<(), HandlerError> {
        let mut attempt = 1;
        let mut delay = SUBMIT_RETRY_BASE_DELAY;
        loop {
            match handler.submit(task_run).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < SUBMIT_MAX_ATTEMPTS => {
                    warn!(
                        task = %task_run.name,
                        attempt,
                        error = %e,
                        "submit failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Observe every EXECUTING task at this tick; terminal observations move
    /// it to EXECUTED or FAILED.
    async fn observe_executing(&self, run: &mut PipelineRun, task_runs: &mut [TaskRun]) {
        let executing: Vec<String> = run.executing.clone();
        for label in executing {
            let Some(task_run) = task_runs.iter_mut().find(|t| t.label == label) else {
                continue;
            };
            let Ok(handler) = self.handlers.get(task_run.task.resource_type) else {
                continue;
            };

            if let Some(backoff) = self.deadline_backoff.get(&label) {
                if Instant::now() < backoff.next_retry {
                    continue;
                }
            }

            let observed = match handler.status(task_run).await {
                Ok(status) => {
                    self.deadline_backoff.remove(&label);
                    status
                }
                Err(HandlerError::Cluster(ClusterError::DeadlineExceeded)) => {
                    if self.escalate_deadline_failure(&label, task_run) {
                        task_run.finish(
                            State::Failed,
                            Some(StatusReason {
                                reason: Reason::ObserveError,
                                description: "observation deadline exceeded past ceiling"
                                    .to_string(),
                            }),
                        );
                        let _ = self.store.update_task_run(task_run).await;
                        Self::move_label(
                            run,
                            &label,
                            TaskBucket::Executing,
                            TaskBucket::Errored,
                        );
                        self.deadline_backoff.remove(&label);
                    } else {
                        warn!(task = %task_run.name, "observation deadline exceeded; backing off");
                    }
                    continue;
                }
                Err(HandlerError::Cluster(e)) => {
                    warn!(task = %task_run.name, error = %e, "transient error observing task; retrying next tick");
                    continue;
                }
                Err(e) => {
                    warn!(task = %task_run.name, error = %e, "error observing task");
                    continue;
                }
            };

            match observed.state {
                ObservedState::Building | ObservedState::Executing => {
                    continue;
                }
                ObservedState::Executed => {
                    task_run.finish(State::Executed, None);
                    let _ = self.store.update_task_run(task_run).await;
                    Self::move_label(run, &label, TaskBucket::Executing, TaskBucket::Executed);
                }
                ObservedState::Failed => {
                    task_run.finish(
                        State::Failed,
                        Some(StatusReason {
                            reason: Reason::AbnormalExit,
                            description: observed.reason.unwrap_or_default(),
                        }),
                    );
                    let _ = self.store.update_task_run(task_run).await;
                    Self::move_label(run, &label, TaskBucket::Executing, TaskBucket::Errored);
                }
            }
        }
        let _ = self.store.update_run(run).await;
    }

    /// A FAILED task marks every transitive dependent TERMINATED, since it
    /// can never become ready.
    async fn propagate_failures(&self, run: &mut PipelineRun, task_runs: &mut [TaskRun]) {
        // `run.errored` holds task run labels; the DAG is keyed by bare task
        // names, so the BFS frontier has to be translated before the first
        // `successors_of` lookup.
        let mut frontier: Vec<String> = run
            .errored
            .iter()
            .filter_map(|label| {
                task_runs
                    .iter()
                    .find(|t| &t.label == label)
                    .map(|t| t.name.clone())
            })
            .collect();
        let mut newly_terminated = Vec::new();

        while let Some(name) = frontier.pop() {
            for succ in self.dag.successors_of(&name) {
                let succ = succ.to_string();
                let Some(task_run) = task_runs.iter_mut().find(|t| t.name == succ) else {
                    continue;
                };
                if task_run.state.is_terminal() {
                    continue;
                }
                task_run.finish(
                    State::Terminated,
                    Some(StatusReason {
                        reason: Reason::DependencyFailed,
                        description: format!("dependency '{name}' failed"),
                    }),
                );
                let _ = self.store.update_task_run(task_run).await;
                Self::move_label(run, &task_run.label.clone(), TaskBucket::Waiting, TaskBucket::Terminated);
                newly_terminated.push(succ.clone());
                frontier.push(succ);
            }
        }

        if !newly_terminated.is_empty() {
            let _ = self.store.update_run(run).await;
        }
    }

    /// Record a `DeadlineExceeded` observation for `label`, advancing its
    /// backoff window, and report whether it has now persisted past
    /// `OBSERVE_DEADLINE_CEILING` and should be escalated to FAILED.
    fn escalate_deadline_failure(&self, label: &str, task_run: &TaskRun) -> bool {
        let now = Instant::now();
        let mut entry = self
            .deadline_backoff
            .entry(label.to_string())
            .or_insert_with(|| DeadlineBackoff {
                first_failure: now,
                next_retry: now,
                backoff: OBSERVE_DEADLINE_INITIAL_BACKOFF,
            });

        if now.duration_since(entry.first_failure) > OBSERVE_DEADLINE_CEILING {
            warn!(
                task = %task_run.name,
                "deadline-exceeded observation persisted past ceiling; escalating to FAILED"
            );
            return true;
        }

        entry.next_retry = now + entry.backoff;
        entry.backoff = (entry.backoff * 2).min(OBSERVE_DEADLINE_MAX_BACKOFF);
        false
    }

    /// Cancellation: delete every EXECUTING task's workload, mark all
    /// non-terminal tasks TERMINATED, finalize. Best-effort — a failed
    /// delete is logged but does not block finalization.
    async fn handle_cancellation(&self, run: &mut PipelineRun, task_runs: &mut [TaskRun]) {
        for label in run.executing.clone() {
            let Some(task_run) = task_runs.iter_mut().find(|t| t.label == label) else {
                continue;
            };
            if let Ok(handler) = self.handlers.get(task_run.task.resource_type) {
                if let Err(e) = handler.delete(task_run, DeleteMode::WithPods).await {
                    warn!(task = %task_run.name, error = %e, "best-effort delete failed during cancellation");
                }
            }
            self.deadline_backoff.remove(&label);
            task_run.finish(
                State::Terminated,
                Some(StatusReason {
                    reason: Reason::Cancelled,
                    description: "cancelled".to_string(),
                }),
            );
            let _ = self.store.update_task_run(task_run).await;
            Self::move_label(run, &label, TaskBucket::Executing, TaskBucket::Terminated);
        }

        for label in run.waiting.clone() {
            let Some(task_run) = task_runs.iter_mut().find(|t| t.label == label) else {
                continue;
            };
            task_run.finish(
                State::Terminated,
                Some(StatusReason {
                    reason: Reason::Cancelled,
                    description: "cancelled".to_string(),
                }),
            );
            let _ = self.store.update_task_run(task_run).await;
            Self::move_label(run, &label, TaskBucket::Waiting, TaskBucket::Terminated);
        }

        self.finalize(run).await;
    }

    async fn finalize(&self, run: &mut PipelineRun) {
        run.status = run.aggregate_status();
        run.completion_time = Some(crate::models::epoch_milli());
        if run.status == Status::Failed {
            run.error_message = Some(format!(
                "{} task(s) failed: {}",
                run.errored.len(),
                run.errored.join(", ")
            ));
        }
        if let Err(e) = self.store.update_run(run).await {
            error!(run = %run.label, error = %e, "failed to persist final run status");
        }
        info!(run = %run.label, status = %run.status, "pipeline run finished");
    }
}

#[derive(Debug, Clone, Copy)]
enum TaskBucket {
    Waiting,
    Executing,
    Executed,
    Errored,
    Terminated,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::DeleteMode;
    use crate::handlers::{Handler, ObservedStatus};
    use crate::models::pipeline::{ResourceType, TaskDefinition};
    use crate::store::StorageError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as AsyncMutex;

    /// A [`Handler`] whose submit/status outcomes are configured per task
    /// name, recording submit call order for declaration-order assertions.
    #[derive(Default)]
    struct FakeHandler {
        fail_submit: HashSet<String>,
        fail_status: HashSet<String>,
        submit_order: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Handler for FakeHandler {
        async fn submit(&self, task_run: &TaskRun) -> Result<(), HandlerError> {
            self.submit_order.lock().unwrap().push(task_run.name.clone());
            if self.fail_submit.contains(&task_run.name) {
                return Err(HandlerError::Cluster(crate::cluster::ClusterError::InvalidSpec(
                    "rejected by fake cluster".to_string(),
                )));
            }
            Ok(())
        }

        async fn status(&self, task_run: &TaskRun) -> Result<ObservedStatus, HandlerError> {
            if self.fail_status.contains(&task_run.name) {
                return Ok(ObservedStatus {
                    state: ObservedState::Failed,
                    reason: Some("fake failure".to_string()),
                });
            }
            Ok(ObservedStatus {
                state: ObservedState::Executed,
                reason: None,
            })
        }

        async fn events(&self, _task_run: &TaskRun) -> Result<Vec<String>, HandlerError> {
            Ok(Vec::new())
        }

        fn logs(
            &self,
            _task_run: &TaskRun,
        ) -> std::pin::Pin<Box<dyn futures::Stream<Item = Result<Bytes, HandlerError>> + Send>>
        {
            Box::pin(stream::empty())
        }

        async fn delete(&self, _task_run: &TaskRun, _mode: DeleteMode) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    /// An in-memory [`JobsStore`] standing in for SQLite in executor tests,
    /// where only the reconciliation logic is under test.
    #[derive(Default)]
    struct InMemoryStore {
        runs: AsyncMutex<HashMap<String, PipelineRun>>,
        task_runs: AsyncMutex<HashMap<String, TaskRun>>,
    }

    #[async_trait]
    impl JobsStore for InMemoryStore {
        async fn create_run(&self, run: &PipelineRun) -> Result<(), StorageError> {
            self.runs.lock().await.insert(run.label.clone(), run.clone());
            Ok(())
        }
        async fn update_run(&self, run: &PipelineRun) -> Result<(), StorageError> {
            let mut runs = self.runs.lock().await;
            if !runs.contains_key(&run.label) {
                return Err(StorageError::NotFound);
            }
            runs.insert(run.label.clone(), run.clone());
            Ok(())
        }
        async fn get_run(&self, label: &str) -> Result<PipelineRun, StorageError> {
            self.runs
                .lock()
                .await
                .get(label)
                .cloned()
                .ok_or(StorageError::NotFound)
        }
        async fn search_runs(&self, needle: &str) -> Result<Vec<PipelineRun>, StorageError> {
            Ok(self
                .runs
                .lock()
                .await
                .values()
                .filter(|r| r.label.contains(needle))
                .cloned()
                .collect())
        }
        async fn non_terminal_runs(&self) -> Result<Vec<PipelineRun>, StorageError> {
            Ok(self
                .runs
                .lock()
                .await
                .values()
                .filter(|r| matches!(r.status, Status::Submitted | Status::Running))
                .cloned()
                .collect())
        }
        async fn delete_run(&self, label: &str) -> Result<(), StorageError> {
            self.runs
                .lock()
                .await
                .remove(label)
                .map(|_| ())
                .ok_or(StorageError::NotFound)
        }
        async fn create_task_run(&self, task_run: &TaskRun) -> Result<(), StorageError> {
            self.task_runs
                .lock()
                .await
                .insert(task_run.label.clone(), task_run.clone());
            Ok(())
        }
        async fn update_task_run(&self, task_run: &TaskRun) -> Result<(), StorageError> {
            let mut task_runs = self.task_runs.lock().await;
            if !task_runs.contains_key(&task_run.label) {
                return Err(StorageError::NotFound);
            }
            task_runs.insert(task_run.label.clone(), task_run.clone());
            Ok(())
        }
        async fn get_task_run(&self, label: &str) -> Result<TaskRun, StorageError> {
            self.task_runs
                .lock()
                .await
                .get(label)
                .cloned()
                .ok_or(StorageError::NotFound)
        }
        async fn task_runs_for(&self, run_label: &str) -> Result<Vec<TaskRun>, StorageError> {
            Ok(self
                .task_runs
                .lock()
                .await
                .values()
                .filter(|t| t.parent == run_label)
                .cloned()
                .collect())
        }
    }

    fn run_with_tasks(tasks: &[TaskDefinition]) -> (PipelineRun, Vec<TaskRun>) {
        let label = new_label();
        let mut run = PipelineRun::new(label.clone(), "test-job", None, None, "/tmp/flowd-test".to_string());
        let mut task_runs = Vec::with_capacity(tasks.len());
        for task in tasks {
            let task_run = TaskRun::new(&label, task.clone());
            run.task_labels.push(task_run.label.clone());
            run.waiting.push(task_run.label.clone());
            task_runs.push(task_run);
        }
        (run, task_runs)
    }

    async fn seed(store: &InMemoryStore, run: &PipelineRun, task_runs: &[TaskRun]) {
        store.create_run(run).await.unwrap();
        for task_run in task_runs {
            store.create_task_run(task_run).await.unwrap();
        }
    }

    fn worker_with(store: Arc<dyn JobsStore>, handlers: HandlerRegistry, dag: Dag) -> Worker {
        Worker {
            store,
            handlers: Arc::new(handlers),
            tick_interval: Duration::from_millis(1),
            cancel: CancelHandle::default(),
            dag,
            deadline_backoff: DashMap::new(),
        }
    }

    /// S3: two independent tasks declared `a`, then `b`; both submissions
    /// happen in the same tick, but `submit(a)` must be invoked first.
    #[tokio::test]
    async fn submits_simultaneously_ready_tasks_in_declaration_order() {
        let tasks = vec![TaskDefinition::new("a", "img"), TaskDefinition::new("b", "img")];
        let dag = Dag::build(&tasks).unwrap();
        let (run, task_runs) = run_with_tasks(&tasks);

        let store = Arc::new(InMemoryStore::default());
        seed(&store, &run, &task_runs).await;
        let store: Arc<dyn JobsStore> = store;

        let handler = Arc::new(FakeHandler::default());
        let mut registry = HandlerRegistry::new();
        registry.register(ResourceType::Pod, handler.clone());

        let worker = worker_with(store.clone(), registry, dag);
        worker.run(run.clone()).await;

        assert_eq!(
            handler.submit_order.lock().unwrap().clone(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(store.get_run(&run.label).await.unwrap().status, Status::Done);
    }

    /// S2: `export` depends on `train`; when `train` fails, `export` must
    /// become TERMINATED without ever reaching BUILDING, and the run
    /// finalizes FAILED.
    #[tokio::test]
    async fn dependency_failure_terminates_downstream_without_submitting_it() {
        let mut export = TaskDefinition::new("export", "img");
        export.depends = Some("train".to_string());
        let tasks = vec![TaskDefinition::new("train", "img"), export];
        let dag = Dag::build(&tasks).unwrap();
        let (run, task_runs) = run_with_tasks(&tasks);

        let store = Arc::new(InMemoryStore::default());
        seed(&store, &run, &task_runs).await;
        let store: Arc<dyn JobsStore> = store;

        let mut handler = FakeHandler::default();
        handler.fail_status.insert("train".to_string());
        let handler = Arc::new(handler);
        let mut registry = HandlerRegistry::new();
        registry.register(ResourceType::Pod, handler.clone());

        let worker = worker_with(store.clone(), registry, dag);
        worker.run(run.clone()).await;

        assert!(!handler.submit_order.lock().unwrap().contains(&"export".to_string()));

        let final_run = store.get_run(&run.label).await.unwrap();
        assert_eq!(final_run.status, Status::Failed);

        let train_run = store
            .get_task_run(&crate::models::task_run_label(&run.label, "train"))
            .await
            .unwrap();
        assert_eq!(train_run.state, State::Failed);

        let export_run = store
            .get_task_run(&crate::models::task_run_label(&run.label, "export"))
            .await
            .unwrap();
        assert_eq!(export_run.state, State::Terminated);
        assert_eq!(
            export_run.status_reason.as_ref().map(|r| &r.reason),
            Some(&Reason::DependencyFailed)
        );
    }

    /// Submission failure (handler rejects the spec) marks the task FAILED
    /// with `Reason::SubmitError` rather than leaving it stuck BUILDING.
    #[tokio::test]
    async fn submit_error_marks_task_failed() {
        let tasks = vec![TaskDefinition::new("train", "img")];
        let dag = Dag::build(&tasks).unwrap();
        let (run, task_runs) = run_with_tasks(&tasks);

        let store = Arc::new(InMemoryStore::default());
        seed(&store, &run, &task_runs).await;
        let store: Arc<dyn JobsStore> = store;

        let mut handler = FakeHandler::default();
        handler.fail_submit.insert("train".to_string());
        let handler = Arc::new(handler);
        let mut registry = HandlerRegistry::new();
        registry.register(ResourceType::Pod, handler.clone());

        let worker = worker_with(store.clone(), registry, dag);
        worker.run(run.clone()).await;

        let train_run = store
            .get_task_run(&crate::models::task_run_label(&run.label, "train"))
            .await
            .unwrap();
        assert_eq!(train_run.state, State::Failed);
        assert_eq!(
            train_run.status_reason.as_ref().map(|r| &r.reason),
            Some(&Reason::SubmitError)
        );
        assert_eq!(store.get_run(&run.label).await.unwrap().status, Status::Failed);
    }

    /// An already-requested cancellation is observed at the worker's very
    /// first tick: no task is ever submitted, and every task ends TERMINATED.
    #[tokio::test]
    async fn cancellation_requested_before_start_skips_submission() {
        let tasks = vec![TaskDefinition::new("train", "img")];
        let dag = Dag::build(&tasks).unwrap();
        let (run, task_runs) = run_with_tasks(&tasks);

        let store = Arc::new(InMemoryStore::default());
        seed(&store, &run, &task_runs).await;
        let store: Arc<dyn JobsStore> = store;

        let handler = Arc::new(FakeHandler::default());
        let mut registry = HandlerRegistry::new();
        registry.register(ResourceType::Pod, handler.clone());

        let cancel = CancelHandle::default();
        cancel.request();
        let worker = Worker {
            store: store.clone(),
            handlers: Arc::new(registry),
            tick_interval: Duration::from_millis(1),
            cancel,
            dag,
            deadline_backoff: DashMap::new(),
        };
        worker.run(run.clone()).await;

        assert!(handler.submit_order.lock().unwrap().is_empty());
        let final_run = store.get_run(&run.label).await.unwrap();
        assert_eq!(final_run.status, Status::Terminated);
        let train_run = store
            .get_task_run(&crate::models::task_run_label(&run.label, "train"))
            .await
            .unwrap();
        assert_eq!(train_run.state, State::Terminated);
    }
}
