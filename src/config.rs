//! Startup configuration: a `figment` layered loader (compiled-in defaults,
//! then a TOML file, then environment overrides).

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use std::path::PathBuf;

const DEFAULT_CONFIG: &str = include_str!("default_config.toml");
const ENV_PREFIX: &str = "FLOWD_";

/// Default search path for the config file when `--config` is not given.
fn default_config_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/etc/flowd/flowd.toml"),
        PathBuf::from("flowd.toml"),
    ]
}

/// Loads a [`FlowdConfig`], merging compiled-in defaults, an optional TOML
/// file, and `FLOWD_`-prefixed environment variables (`__`-delimited for
/// nesting, e.g. `FLOWD_JOBS_DB__BACKEND`) in that order of precedence.
pub struct Configuration;

impl Configuration {
    pub fn load(path_override: Option<PathBuf>) -> Result<FlowdConfig, figment::Error> {
        let mut config = Figment::new().merge(Toml::string(DEFAULT_CONFIG));

        if let Some(path) = path_override {
            config = config.merge(Toml::file(path));
        } else {
            for path in default_config_paths() {
                config = config.merge(Toml::file(path));
            }
        }

        config = config.merge(Env::prefixed(ENV_PREFIX).split("__"));
        config.extract()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowdConfig {
    pub server: ServerConfig,
    pub pipelines: PipelinesConfig,
    pub jobs_db: JobsDbConfig,
    /// Credentials for the experiment-metrics collaborator; the core never
    /// reads or writes through this section itself, but accepts and passes
    /// it through since the credential file is shared.
    #[serde(default)]
    pub reporting_db: ExternalDbConfig,
    /// Credentials for the git/artifact-repository collaborator; same
    /// pass-through treatment as `reporting_db`.
    #[serde(default)]
    pub odin_db: ExternalDbConfig,
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the Control Surface's TCP listener. Ex: `0.0.0.0:8080`.
    pub bind_address: String,
    pub log_level: String,
    /// Use human-readable log output instead of JSON.
    #[serde(default)]
    pub pretty_logging: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelinesConfig {
    /// `${ROOT_PATH}`: directory containing one subdirectory per pipeline.
    pub root: String,
    /// Parent directory under which each run gets its own `${RUN_PATH}`
    /// workspace, named after the run's label.
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsDbConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub passwd: Option<String>,
    /// Only `sqlite` is implemented; `postgres`/`mongo` are accepted by the
    /// credential-file schema but rejected as a configuration error at
    /// startup until a second backend ships (see DESIGN.md).
    pub backend: String,
    /// Path to the SQLite database file, used when `backend = "sqlite"`.
    pub storage_path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExternalDbConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub passwd: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Reconciliation tick interval, in seconds.
    pub tick_interval_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses() {
        let parsed: FlowdConfig = Figment::new()
            .merge(Toml::string(DEFAULT_CONFIG))
            .extract()
            .expect("compiled-in default config must parse");
        assert_eq!(parsed.jobs_db.backend, "sqlite");
        assert!(parsed.executor.tick_interval_secs > 0);
    }

    #[test]
    fn env_override_splits_on_double_underscore() {
        std::env::set_var("FLOWD_JOBS_DB__STORAGE_PATH", "/tmp/override.db");
        let parsed = Configuration::load(None).expect("load with env override");
        assert_eq!(parsed.jobs_db.storage_path, "/tmp/override.db");
        std::env::remove_var("FLOWD_JOBS_DB__STORAGE_PATH");
    }
}
