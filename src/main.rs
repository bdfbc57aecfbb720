//! Process entrypoint. A single binary with one useful subcommand:
//! `serve`, which loads configuration, wires the Jobs Store, Cluster
//! Client, and Handler Registry, resumes non-terminal pipeline runs, and
//! starts the Control Surface. Exits nonzero on any failure before the
//! listener comes up; never exits on a per-pipeline failure.

mod cluster;
mod config;
mod control;
mod dag;
mod errors;
mod executor;
mod handlers;
mod models;
mod pipeline_loader;
mod store;
mod template;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Configuration;
use control::ControlServer;
use executor::Executor;
use handlers::HandlerRegistry;
use pipeline_loader::PipelineLoader;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use store::SqliteJobsStore;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// flowd: the DAG scheduler core for ML pipelines on a Kubernetes-like
/// cluster.
///
/// flowd loads its settings from compiled-in defaults, then an optional
/// TOML config file, then `FLOWD_`-prefixed environment variables
/// (double-underscore-delimited for nesting, e.g. `FLOWD_SERVER__BIND_ADDRESS`).
/// Later sources override earlier ones.
#[derive(Debug, Parser)]
#[command(name = "flowd")]
#[command(bin_name = "flowd")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the scheduler: resume in-flight pipeline runs and listen on
    /// the Control Surface.
    Serve {
        /// Path to a TOML config file; overrides the default search path.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("flowd: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Serve { config } => serve(config).await,
    }
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let conf = Configuration::load(config_path).context("could not load configuration")?;
    init_logger(&conf.server.log_level, conf.server.pretty_logging)
        .context("could not initialize logger")?;

    if conf.jobs_db.backend != "sqlite" {
        bail!(
            "jobs_db.backend = '{}' is not supported; only 'sqlite' ships in this build",
            conf.jobs_db.backend
        );
    }

    if !std::path::Path::new(&conf.pipelines.root).is_dir() {
        bail!(
            "pipelines.root '{}' is not a readable directory",
            conf.pipelines.root
        );
    }
    std::fs::create_dir_all(&conf.pipelines.data_dir)
        .with_context(|| format!("could not create data_dir '{}'", conf.pipelines.data_dir))?;

    let store: Arc<dyn store::JobsStore> = Arc::new(
        SqliteJobsStore::connect(std::path::Path::new(&conf.jobs_db.storage_path))
            .await
            .context("could not open jobs store")?,
    );

    let kube_client = kube::Client::try_default()
        .await
        .context("could not initialize cluster client")?;
    let cluster: Arc<dyn cluster::ClusterClient> =
        Arc::new(cluster::KubeClusterClient::new(kube_client));

    let handlers = Arc::new(HandlerRegistry::standard(cluster));
    let tick_interval = Duration::from_secs(conf.executor.tick_interval_secs);
    let executor = Executor::with_tick_interval(store.clone(), handlers.clone(), tick_interval);

    let resumed = executor
        .recover()
        .await
        .context("could not recover in-flight pipeline runs")?;
    if resumed > 0 {
        info!(resumed, "resumed in-flight pipeline runs after restart");
    }

    let loader = PipelineLoader::new(conf.pipelines.root.as_str());
    let server = Arc::new(ControlServer::new(
        store,
        executor,
        handlers,
        loader,
        conf.pipelines.data_dir.clone(),
        tick_interval,
    ));

    server.serve(&conf.server.bind_address).await
}

/// Structured logging via `tracing`/`tracing-subscriber`: quiet a handful
/// of noisy dependency targets, then apply the configured level to
/// everything else.
fn init_logger(log_level: &str, pretty: bool) -> Result<()> {
    let level = LevelFilter::from_str(log_level).context("could not parse 'log_level'")?;

    let filter = EnvFilter::from_default_env()
        .add_directive("sqlx=off".parse().expect("invalid directive"))
        .add_directive("h2=off".parse().expect("invalid directive"))
        .add_directive("hyper=off".parse().expect("invalid directive"))
        .add_directive("rustls=off".parse().expect("invalid directive"))
        .add_directive("kube_client=off".parse().expect("invalid directive"))
        .add_directive(level.into());

    if pretty {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
        warn!("pretty logging activated due to config value 'server.pretty_logging'");
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    }

    Ok(())
}
