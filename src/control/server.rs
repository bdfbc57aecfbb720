//! Connection handling and request dispatch for the Control Surface.
//!
//! Each accepted connection is demultiplexed independently: one
//! `tokio::spawn`ed task per connection, newline-delimited JSON in both
//! directions via `tokio_util::codec::{Framed, LinesCodec}`, a plain JSON
//! object per line rather than a WebSocket upgrade.

use super::protocol::{Request, Response};
use crate::executor::{Executor, RunPaths};
use crate::handlers::HandlerRegistry;
use crate::models::run::Status;
use crate::pipeline_loader::PipelineLoader;
use crate::store::JobsStore;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, info, warn};

/// How long `LOGS` collects chunks from a handler's stream before it
/// returns what it has. The control surface answers synchronously per
/// request; unbounded `follow` reads would never complete for a
/// still-running task, so the read window is capped.
const LOGS_COLLECTION_WINDOW: Duration = Duration::from_secs(3);

/// How long `CLEANUP` waits for cancellation to take effect before
/// performing its `db`/`fs` purge, in units of the executor's tick
/// interval. Best-effort: cleanup proceeds regardless.
const CLEANUP_WAIT_TICKS: u32 = 15;

pub struct ControlServer {
    store: Arc<dyn JobsStore>,
    executor: Executor,
    handlers: Arc<HandlerRegistry>,
    loader: PipelineLoader,
    data_dir: String,
    tick_interval: Duration,
}

impl ControlServer {
    pub fn new(
        store: Arc<dyn JobsStore>,
        executor: Executor,
        handlers: Arc<HandlerRegistry>,
        loader: PipelineLoader,
        data_dir: String,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store,
            executor,
            handlers,
            loader,
            data_dir,
            tick_interval,
        }
    }

    /// Bind and accept connections until the process is killed. Each
    /// connection is handled on its own spawned task; a single slow or
    /// misbehaving client never blocks another.
    pub async fn serve(self: Arc<Self>, bind_address: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(bind_address).await?;
        info!(address = %bind_address, "control surface listening");

        loop {
            let (socket, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                debug!(%peer, "control surface connection accepted");
                if let Err(e) = this.handle_connection(socket).await {
                    warn!(%peer, error = %e, "control surface connection ended with error");
                }
            });
        }
    }

    async fn handle_connection(&self, socket: tokio::net::TcpStream) -> anyhow::Result<()> {
        let mut framed = Framed::new(socket, LinesCodec::new());

        while let Some(line) = framed.next().await {
            let line = line?;
            let response = match serde_json::from_str::<Request>(&line) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => Response::error(format!("malformed request: {e}")),
            };
            let encoded = serde_json::to_string(&response)?;
            framed.send(encoded).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::ok(json!({})),
            Request::Run { pipeline } => self.handle_run(&pipeline).await,
            Request::Status { label } => self.handle_status(&label).await,
            Request::Data { label } => self.handle_data(&label).await,
            Request::Logs { task_label } => self.handle_logs(&task_label).await,
            Request::Events { task_label } => self.handle_events(&task_label).await,
            Request::Cleanup { label, db, fs } => self.handle_cleanup(&label, db, fs).await,
            Request::Show { query } => self.handle_show(&query).await,
        }
    }

    async fn handle_run(&self, pipeline: &str) -> Response {
        let definition = match self.loader.load(pipeline) {
            Ok(def) => def,
            Err(e) => return Response::error(e.to_string()),
        };

        let paths = RunPaths {
            root_path: self.loader.root().display().to_string(),
            work_path: self.loader.pipeline_dir(pipeline).display().to_string(),
            data_dir: self.data_dir.clone(),
        };

        match self.executor.submit(&definition, paths).await {
            Ok(run) => Response::ok(json!({ "label": run.label })),
            Err(e) => Response::error(e.to_string()),
        }
    }

    async fn handle_status(&self, label: &str) -> Response {
        if label.contains(crate::models::LABEL_SEPARATOR) {
            return match self.store.get_task_run(label).await {
                Ok(task_run) => Response::ok(json!({
                    "label": task_run.label,
                    "name": task_run.name,
                    "state": task_run.state,
                    "resource_id": task_run.resource_id,
                })),
                Err(e) => Response::error(e.to_string()),
            };
        }

        match self.store.get_run(label).await {
            Ok(run) => Response::ok(json!({
                "label": run.label,
                "job": run.job,
                "status": run.status,
                "waiting": run.waiting.len(),
                "executing": run.executing.len(),
                "executed": run.executed.len(),
                "errored": run.errored.len(),
                "terminated": run.terminated.len(),
                "error_message": run.error_message,
            })),
            Err(e) => Response::error(e.to_string()),
        }
    }

    async fn handle_data(&self, label: &str) -> Response {
        if label.contains(crate::models::LABEL_SEPARATOR) {
            return match self.store.get_task_run(label).await {
                Ok(task_run) => Response::ok(
                    serde_json::to_value(task_run).unwrap_or_else(|_| json!({})),
                ),
                Err(e) => Response::error(e.to_string()),
            };
        }

        match self.store.get_run(label).await {
            Ok(run) => Response::ok(serde_json::to_value(run).unwrap_or_else(|_| json!({}))),
            Err(e) => Response::error(e.to_string()),
        }
    }

    async fn handle_logs(&self, task_label: &str) -> Response {
        let task_run = match self.store.get_task_run(task_label).await {
            Ok(t) => t,
            Err(e) => return Response::error(e.to_string()),
        };
        let handler = match self.handlers.get(task_run.task.resource_type) {
            Ok(h) => h,
            Err(e) => return Response::error(e.to_string()),
        };

        let mut stream = handler.logs(&task_run);
        let mut collected = Vec::new();
        let mut truncated = false;
        let deadline = tokio::time::sleep(LOGS_COLLECTION_WINDOW);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    truncated = true;
                    break;
                }
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => collected.extend_from_slice(&bytes),
                        Some(Err(e)) => return Response::error(e.to_string()),
                        None => break,
                    }
                }
            }
        }

        Response::ok(json!({
            "logs": String::from_utf8_lossy(&collected),
            "truncated": truncated,
        }))
    }

    async fn handle_events(&self, task_label: &str) -> Response {
        let task_run = match self.store.get_task_run(task_label).await {
            Ok(t) => t,
            Err(e) => return Response::error(e.to_string()),
        };
        let handler = match self.handlers.get(task_run.task.resource_type) {
            Ok(h) => h,
            Err(e) => return Response::error(e.to_string()),
        };

        match handler.events(&task_run).await {
            Ok(events) => Response::ok(json!({ "events": events })),
            Err(e) => Response::error(e.to_string()),
        }
    }

    async fn handle_cleanup(&self, label: &str, db: bool, fs: bool) -> Response {
        let run = match self.store.get_run(label).await {
            Ok(run) => run,
            Err(e) => return Response::error(e.to_string()),
        };

        self.executor.cancel(label);

        let mut run = run;
        for _ in 0..CLEANUP_WAIT_TICKS {
            match self.store.get_run(label).await {
                Ok(latest) if matches!(latest.status, Status::Done | Status::Failed | Status::Terminated) => {
                    run = latest;
                    break;
                }
                Ok(latest) => run = latest,
                Err(_) => break,
            }
            tokio::time::sleep(self.tick_interval).await;
        }

        if fs {
            if let Err(e) = std::fs::remove_dir_all(&run.run_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(run = %label, error = %e, "cleanup: could not remove run workspace");
                }
            }
        }

        if db {
            if let Err(e) = self.store.delete_run(label).await {
                return Response::error(format!("cleanup: could not purge store record: {e}"));
            }
        }

        Response::ok(json!({ "label": label, "status": run.status }))
    }

    async fn handle_show(&self, query: &str) -> Response {
        match self.store.search_runs(query).await {
            Ok(runs) => {
                let summaries: Vec<_> = runs
                    .iter()
                    .map(|r| {
                        json!({
                            "label": r.label,
                            "job": r.job,
                            "status": r.status,
                            "submit_time": r.submit_time,
                        })
                    })
                    .collect();
                Response::ok(json!({ "runs": summaries }))
            }
            Err(e) => {
                error!(query = %query, error = %e, "SHOW query failed");
                Response::error(e.to_string())
            }
        }
    }
}
