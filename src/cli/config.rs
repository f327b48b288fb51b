use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::engine::types::DEFAULT_MAX_STEPS;
use crate::pipeline::{PipelineConfig, PublishMode};

pub const DEFAULT_CONFIG_FILE: &str = "commitflow.yaml";
pub const DEFAULT_TRACE_RETENTION: usize = 50;

/// Configuration loaded from `commitflow.yaml`.
/// Every field is optional; flags and env vars take precedence, then built-in defaults apply.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct CommitFlowConfig {
    pub data_dir: Option<String>,
    pub index_path: Option<String>,
    pub scores_path: Option<String>,
    pub pointer_path: Option<String>,
    pub trace_dir: Option<String>,
    pub lock_path: Option<String>,
    pub max_steps: Option<usize>,
    /// Trace records kept per specification after each run.
    pub trace_retention: Option<usize>,
    /// `local` or `publish`.
    pub mode: Option<String>,
    pub publish_url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl CommitFlowConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `commitflow.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: CommitFlowConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }

    /// Merge with command-line/env overrides into concrete settings.
    pub fn resolve(&self, data_dir: Option<PathBuf>, trace_dir: Option<PathBuf>) -> Result<Settings> {
        let data_dir = data_dir
            .or_else(|| self.data_dir.as_ref().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("data"));
        let under = |configured: &Option<String>, file: &str| {
            configured
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join(file))
        };

        let mode = match &self.mode {
            Some(m) => m.parse()?,
            None => PublishMode::Local,
        };

        Ok(Settings {
            index_path: under(&self.index_path, "index.json"),
            scores_path: under(&self.scores_path, "scores.json"),
            pointer_path: under(&self.pointer_path, "last_good.json"),
            lock_path: under(&self.lock_path, ".commitflow.lock"),
            trace_dir: trace_dir.unwrap_or_else(|| under(&self.trace_dir, "traces")),
            max_steps: self.max_steps.unwrap_or(DEFAULT_MAX_STEPS),
            trace_retention: self.trace_retention.unwrap_or(DEFAULT_TRACE_RETENTION),
            mode,
            publish_url: self.publish_url.clone(),
            host: self.host.clone().unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(3000),
            data_dir,
        })
    }
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub index_path: PathBuf,
    pub scores_path: PathBuf,
    pub pointer_path: PathBuf,
    pub trace_dir: PathBuf,
    pub lock_path: PathBuf,
    pub max_steps: usize,
    pub trace_retention: usize,
    pub mode: PublishMode,
    pub publish_url: Option<String>,
    pub host: String,
    pub port: u16,
}

impl Settings {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            data_dir: self.data_dir.clone(),
            index_path: self.index_path.clone(),
            scores_path: self.scores_path.clone(),
            pointer_path: self.pointer_path.clone(),
            mode: self.mode,
        }
    }
}
