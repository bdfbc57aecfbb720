//! Loads [`PipelineDefinition`]s from the pipelines root:
//! `<root>/<pipeline>/main.<ext>`, with `.yaml`/`.yml` both accepted since
//! anchor/alias descriptors are authored either way.

use crate::errors::SubmissionError;
use crate::models::pipeline::PipelineDefinition;
use std::path::{Path, PathBuf};

const ENTRY_EXTENSIONS: &[&str] = &["yaml", "yml"];

/// Resolves and parses pipeline descriptors under a single root directory.
#[derive(Debug, Clone)]
pub struct PipelineLoader {
    root: PathBuf,
}

impl PipelineLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_path(&self, pipeline: &str) -> Result<PathBuf, SubmissionError> {
        let dir = self.root.join(pipeline);
        for ext in ENTRY_EXTENSIONS {
            let candidate = dir.join(format!("main.{ext}"));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(SubmissionError::PipelineNotFound(pipeline.to_string()))
    }

    /// Load and parse `<root>/<pipeline>/main.<ext>`. Auxiliary files
    /// referenced from within the descriptor (if any) are resolved relative
    /// to the pipeline's own directory, not the process's working directory.
    pub fn load(&self, pipeline: &str) -> Result<PipelineDefinition, SubmissionError> {
        let path = self.entry_path(pipeline)?;
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| SubmissionError::Validation(format!("reading {path:?}: {e}")))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| SubmissionError::Validation(format!("parsing {path:?}: {e}")))
    }

    /// The pipeline's directory, used to resolve on-disk workspace paths
    /// under `${RUN_PATH}` relative to something stable.
    pub fn pipeline_dir(&self, pipeline: &str) -> PathBuf {
        self.root.join(pipeline)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn loads_entry_descriptor_by_pipeline_name() {
        let dir = tempdir().unwrap();
        let pipeline_dir = dir.path().join("sst2");
        fs::create_dir_all(&pipeline_dir).unwrap();
        fs::write(
            pipeline_dir.join("main.yaml"),
            "name: sst2\ntasks:\n  - name: train\n    image: img:latest\n",
        )
        .unwrap();

        let loader = PipelineLoader::new(dir.path());
        let def = loader.load("sst2").unwrap();
        assert_eq!(def.name, "sst2");
    }

    #[test]
    fn missing_pipeline_is_reported_as_not_found() {
        let dir = tempdir().unwrap();
        let loader = PipelineLoader::new(dir.path());
        let err = loader.load("nope").unwrap_err();
        assert_eq!(err, SubmissionError::PipelineNotFound("nope".to_string()));
    }
}
